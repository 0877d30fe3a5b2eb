//! Append-Only File Durability
//!
//! Every successful mutating command is serialized as a RESP multibulk
//! record and appended to a log. On startup the log is replayed to rebuild
//! the keyspace; on demand it is compacted by an online rewrite.
//!
//! ## Lifecycle
//!
//! ```text
//!   Disabled        (no log configured)
//!   Loading  ──►  Ready  ──►  Rewriting  ──►  Ready  ──► ...
//! ```
//!
//! ## Write path
//!
//! ```text
//!   command handler ──► bounded queue ──► writer thread ──► appendonly.aof
//!   (holds key locks)   (crossbeam)          │
//!                                            └──► rewrite buffer (while rewriting)
//! ```
//!
//! The writer thread is the only code that touches the log file, under the
//! same mutex the rewrite uses to pause it. Write failures are logged and
//! never undo the in-memory mutation that produced the record.
//!
//! ## Record format
//!
//! `*<argc>\r\n` followed by `argc` times `$<len>\r\n<bytes>\r\n`. Relative
//! expirations are always logged as `PEXPIREAT <key> <unix-millis>`.

mod loader;
mod rewrite;
mod writer;

pub use loader::{load, replay, AofReader, LoadSummary, ReadOutcome};
pub use rewrite::RewriteSummary;
pub use writer::AofHandle;

use crate::storage::expiry::unix_millis;
use bytes::Bytes;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;
use thiserror::Error;

/// Default capacity of the queue in front of the writer thread.
pub const DEFAULT_QUEUE_SIZE: usize = 2048;

/// Default log file name.
pub const DEFAULT_AOF_FILENAME: &str = "appendonly.aof";

/// When the writer thread forces appended records to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// After every record
    Always,
    /// At most once per second
    #[default]
    #[value(name = "everysec")]
    EverySec,
    /// Never explicitly; the OS decides
    No,
}

/// Settings for the append-only file.
#[derive(Debug, Clone)]
pub struct AofConfig {
    pub path: PathBuf,
    pub fsync: FsyncPolicy,
    /// Records the writer queue holds before producers block
    pub queue_size: usize,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_AOF_FILENAME),
            fsync: FsyncPolicy::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Observable state of the durability log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AofState {
    Disabled = 0,
    Loading = 1,
    Ready = 2,
    Rewriting = 3,
}

impl AofState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => AofState::Loading,
            2 => AofState::Ready,
            3 => AofState::Rewriting,
            _ => AofState::Disabled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AofState::Disabled => "disabled",
            AofState::Loading => "loading",
            AofState::Ready => "ready",
            AofState::Rewriting => "rewriting",
        }
    }
}

/// Errors from the durability log.
#[derive(Debug, Error)]
pub enum AofError {
    #[error("AOF I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed AOF record at byte {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("Background append only file rewriting already in progress")]
    RewriteInProgress,

    #[error("AOF is not ready (state: {})", .0.as_str())]
    NotReady(AofState),

    #[error("AOF writer has shut down")]
    Closed,
}

/// `PEXPIREAT <key> <unix-millis>`
pub fn make_expire_cmd(key: &Bytes, at: SystemTime) -> Vec<Bytes> {
    vec![
        Bytes::from_static(b"PEXPIREAT"),
        key.clone(),
        Bytes::from(unix_millis(at).to_string()),
    ]
}

/// A command line made of a name followed by arguments.
pub fn make_cmd<'a>(name: &'static str, args: impl IntoIterator<Item = &'a Bytes>) -> Vec<Bytes> {
    let mut cmdline = vec![Bytes::from_static(name.as_bytes())];
    cmdline.extend(args.into_iter().cloned());
    cmdline
}
