//! Server configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line flags. The storage, AOF and expiry layers never read this
//! type; the binary turns it into their plain config structs.

use crate::aof::{AofConfig, FsyncPolicy, DEFAULT_AOF_FILENAME, DEFAULT_QUEUE_SIZE};
use crate::storage::dict::DEFAULT_REHASH_WORKERS;
use crate::storage::lock::DEFAULT_LOCK_SLOTS;
use crate::storage::{ExpiryConfig, StorageConfig};
use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line flags. Every flag left unset keeps the file or default
/// value.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Enable the append-only file
    #[arg(long)]
    pub appendonly: Option<bool>,

    /// Path of the append-only file
    #[arg(long)]
    pub appendfilename: Option<PathBuf>,

    /// When to fsync the append-only file
    #[arg(long, value_enum)]
    pub appendfsync: Option<FsyncPolicy>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[arg(long)]
    pub loglevel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub appendonly: bool,
    pub appendfilename: PathBuf,
    pub appendfsync: FsyncPolicy,
    pub aof_queue_size: usize,
    pub expire_interval_ms: u64,
    pub lock_slots: usize,
    pub rehash_workers: usize,
    pub loglevel: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            appendonly: false,
            appendfilename: PathBuf::from(DEFAULT_AOF_FILENAME),
            appendfsync: FsyncPolicy::EverySec,
            aof_queue_size: DEFAULT_QUEUE_SIZE,
            expire_interval_ms: 5000,
            lock_slots: DEFAULT_LOCK_SLOTS,
            rehash_workers: DEFAULT_REHASH_WORKERS,
            loglevel: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML file. Missing keys take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// File (if `--config` was given) overlaid with explicit flags.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, args: &Args) {
        if let Some(bind) = &args.bind {
            self.bind = bind.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(appendonly) = args.appendonly {
            self.appendonly = appendonly;
        }
        if let Some(path) = &args.appendfilename {
            self.appendfilename = path.clone();
        }
        if let Some(fsync) = args.appendfsync {
            self.appendfsync = fsync;
        }
        if let Some(level) = &args.loglevel {
            self.loglevel = level.clone();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.aof_queue_size == 0 {
            anyhow::bail!("aof_queue_size must be > 0");
        }
        if self.lock_slots == 0 {
            anyhow::bail!("lock_slots must be > 0");
        }
        if self.rehash_workers == 0 {
            anyhow::bail!("rehash_workers must be > 0");
        }
        if self.expire_interval_ms == 0 {
            anyhow::bail!("expire_interval_ms must be > 0");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            rehash_workers: self.rehash_workers,
            lock_slots: self.lock_slots,
            ..StorageConfig::default()
        }
    }

    /// `None` when the append-only file is disabled.
    pub fn aof_config(&self) -> Option<AofConfig> {
        self.appendonly.then(|| AofConfig {
            path: self.appendfilename.clone(),
            fsync: self.appendfsync,
            queue_size: self.aof_queue_size,
        })
    }

    pub fn expiry_config(&self) -> ExpiryConfig {
        ExpiryConfig {
            interval: Duration::from_millis(self.expire_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:6379");
        assert!(config.aof_config().is_none());
        assert_eq!(config.expiry_config().interval, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 7000
            appendonly = true
            appendfsync = "always"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.bind, "127.0.0.1");

        let aof = config.aof_config().unwrap();
        assert_eq!(aof.fsync, FsyncPolicy::Always);
        assert_eq!(aof.path, PathBuf::from(DEFAULT_AOF_FILENAME));
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rivetkv.toml");
        fs::write(&path, "port = 7000\nloglevel = \"debug\"\nappendfsync = \"no\"\n").unwrap();

        let args = Args::parse_from([
            "rivetkv",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7001",
            "--appendfsync",
            "everysec",
        ]);
        let config = ServerConfig::load(&args).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.loglevel, "debug");
        assert_eq!(config.appendfsync, FsyncPolicy::EverySec);
    }

    #[test]
    fn test_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "lock_slots = 0\n").unwrap();
        let args = Args {
            config: Some(path),
            ..Args::default()
        };
        assert!(ServerConfig::load(&args).is_err());

        let missing = Args {
            config: Some(dir.path().join("missing.toml")),
            ..Args::default()
        };
        assert!(ServerConfig::load(&missing).is_err());
    }
}
