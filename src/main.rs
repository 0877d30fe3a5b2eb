//! RivetKV server entry point.
//!
//! Loads configuration, replays the append-only file, starts the expiry
//! sweeper and serves RESP clients until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use rivetkv::aof::AofHandle;
use rivetkv::commands::CommandHandler;
use rivetkv::config::{Args, ServerConfig};
use rivetkv::connection::{handle_connection, ConnectionStats};
use rivetkv::storage::{ExpirySweeper, StorageEngine};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
  ____  _            _   _  ____     __
 |  _ \(_)_   _____| |_| |/ /\ \   / /
 | |_) | \ \ / / _ \ __| ' /  \ \ / /
 |  _ <| |\ V /  __/ |_| . \   \ V /
 |_| \_\_| \_/ \___|\__|_|\_\   \_/

RivetKV v{} - In-Memory Key-Value Store
──────────────────────────────────────────
Listening on {}
AOF: {}

Use Ctrl+C to shutdown gracefully.
"#,
        rivetkv::VERSION,
        config.bind_address(),
        if config.appendonly {
            config.appendfilename.display().to_string()
        } else {
            "disabled".to_string()
        },
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(&args).context("failed to load configuration")?;

    // RUST_LOG takes precedence over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.loglevel))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    print_banner(&config);

    let storage = Arc::new(StorageEngine::with_config(config.storage_config()));
    let handler = CommandHandler::new(Arc::clone(&storage));

    let aof = match config.aof_config() {
        Some(aof_config) => {
            let path = aof_config.path.clone();
            let aof = AofHandle::open(aof_config)
                .with_context(|| format!("failed to open AOF {}", path.display()))?;
            let summary = aof
                .load(&handler)
                .with_context(|| format!("failed to replay AOF {}", path.display()))?;
            if let Some(reason) = &summary.error {
                warn!(reason = %reason, "AOF replay stopped early; serving the recovered prefix");
            }
            storage.attach_aof(Arc::clone(&aof));
            Some(aof)
        }
        None => None,
    };
    info!(keys = storage.len(), "Storage engine ready");

    let sweeper = ExpirySweeper::start(Arc::clone(&storage), config.expiry_config());
    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(addr = %config.bind_address(), "Listening");

    tokio::select! {
        _ = accept_loop(listener, handler.clone(), Arc::clone(&stats)) => {}
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutdown signal received, stopping server...");
        }
    }

    sweeper.stop();
    if let Some(aof) = aof {
        // The writer thread joins synchronously.
        tokio::task::spawn_blocking(move || aof.shutdown())
            .await
            .context("AOF shutdown task failed")?;
    }

    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = handler.processed(),
        "Server shutdown complete"
    );
    Ok(())
}

async fn accept_loop(listener: TcpListener, handler: CommandHandler, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    handler.clone(),
                    Arc::clone(&stats),
                ));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
