//! Command Dispatch
//!
//! Turns a parsed request into a call on the command table:
//!
//! ```text
//! RespValue::Array ──► Vec<Bytes> ──► lookup(name) ──► arity check
//!                                                        │
//!                          catch_unwind(handler(args)) ◄─┘
//!                                   │
//!                        Ok(reply) / Err(CommandError) ──► RespValue
//! ```
//!
//! A panic inside a handler is logged and answered with
//! `ERR internal error`; the connection and the process keep running.

use super::router::{self, CommandSpec};
use super::CommandError;
use crate::protocol::RespValue;
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Executes commands against a [`StorageEngine`].
///
/// Cheap to clone; clones share the engine and the command counter.
#[derive(Clone)]
pub struct CommandHandler {
    db: Arc<StorageEngine>,
    started: Instant,
    processed: Arc<AtomicU64>,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("processed", &self.processed())
            .finish()
    }
}

impl CommandHandler {
    pub fn new(db: Arc<StorageEngine>) -> Self {
        Self {
            db,
            started: Instant::now(),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.db
    }

    /// Seconds since this handler was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Commands executed so far, including rejected ones.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Executes a request as parsed off the wire.
    pub fn execute(&self, request: RespValue) -> RespValue {
        let items = match request {
            RespValue::Array(items) if !items.is_empty() => items,
            RespValue::Array(_) => return RespValue::error("ERR empty command"),
            _ => return RespValue::error("ERR invalid command format"),
        };

        let mut cmdline = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RespValue::BulkString(arg) => cmdline.push(arg),
                RespValue::SimpleString(arg) => cmdline.push(Bytes::from(arg)),
                RespValue::Integer(n) => cmdline.push(Bytes::from(n.to_string())),
                _ => return RespValue::error("ERR invalid argument type"),
            }
        }
        self.execute_args(&cmdline)
    }

    /// Executes a command line whose first element is the command name.
    pub fn execute_args(&self, cmdline: &[Bytes]) -> RespValue {
        self.processed.fetch_add(1, Ordering::Relaxed);

        let Some(name) = cmdline.first() else {
            return RespValue::error("ERR empty command");
        };
        let Some(spec) = router::lookup(name) else {
            return CommandError::UnknownCommand(String::from_utf8_lossy(name).into_owned()).into();
        };
        if !spec.accepts(cmdline.len()) {
            return CommandError::WrongArity(spec.name.to_string()).into();
        }

        self.invoke(spec, &cmdline[1..])
    }

    fn invoke(&self, spec: &CommandSpec, args: &[Bytes]) -> RespValue {
        match panic::catch_unwind(AssertUnwindSafe(|| (spec.handler)(self, args))) {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => e.into(),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown".to_string());
                error!(command = spec.name, reason = %reason, "Command handler panicked");
                RespValue::error("ERR internal error")
            }
        }
    }
}
