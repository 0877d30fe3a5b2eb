//! Command Handler Module
//!
//! The command layer of RivetKV. A parsed request is looked up in a static
//! command table, checked against the command's arity and handed to its
//! handler, which runs against the storage engine and returns a reply.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  lookup ─► arity ─► handler
//! └────────┬────────┘
//!          │  key locks held across read/modify/log
//!          ▼
//! ┌─────────────────┐      ┌─────────────┐
//! │ StorageEngine   │ ───► │ AOF writer  │
//! └─────────────────┘      └─────────────┘
//! ```
//!
//! ## Arity
//!
//! Each command declares an arity counting the command name. A positive
//! arity is exact; a negative arity `-n` means "at least `n`".
//!
//! ## Persistence
//!
//! Mutating handlers append their effect to the AOF while still holding the
//! key locks, so the log order matches the order in which writes were
//! applied. Relative expirations are logged as absolute `PEXPIREAT`
//! deadlines; reads are never logged.

mod args;
mod error;
mod handler;
mod router;

mod hash;
mod keys;
mod list;
mod server;
mod set;
mod string;
mod zset;

pub use args::format_score;
pub use error::{CommandError, CommandResult};
pub use handler::CommandHandler;
pub use router::{command_names, lookup, CommandSpec};

use crate::aof::make_cmd;
use crate::storage::StorageEngine;
use bytes::Bytes;

/// Logs `name args...` to the AOF, if one is attached.
pub(crate) fn propagate(db: &StorageEngine, name: &'static str, args: &[Bytes]) {
    if db.aof().is_some() {
        db.add_aof(&make_cmd(name, args));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::aof::{AofConfig, AofHandle, FsyncPolicy};
    use crate::protocol::RespValue;
    use std::sync::Arc;

    pub(crate) fn handler() -> CommandHandler {
        CommandHandler::new(Arc::new(StorageEngine::new()))
    }

    /// A handler whose engine logs to an AOF under `dir`.
    pub(crate) fn logged_handler(dir: &tempfile::TempDir) -> (CommandHandler, Arc<AofHandle>) {
        let aof = AofHandle::open(AofConfig {
            path: dir.path().join("appendonly.aof"),
            fsync: FsyncPolicy::No,
            queue_size: 64,
        })
        .unwrap();
        aof.mark_ready();
        let engine = Arc::new(StorageEngine::new());
        assert!(engine.attach_aof(Arc::clone(&aof)));
        (CommandHandler::new(engine), aof)
    }

    pub(crate) fn run(h: &CommandHandler, args: &[&str]) -> RespValue {
        let cmdline: Vec<Bytes> = args.iter().map(|s| Bytes::from(s.to_string())).collect();
        h.execute_args(&cmdline)
    }

    #[test]
    fn test_every_command_is_reachable() {
        let h = handler();
        for name in command_names() {
            let reply = run(&h, &[name]);
            if let RespValue::Error(msg) = reply {
                assert!(!msg.starts_with("ERR unknown command"), "{name}: {msg}");
            }
        }
    }
}
