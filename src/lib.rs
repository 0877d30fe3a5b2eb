//! # RivetKV - An In-Memory, Redis-Compatible Key-Value Store
//!
//! RivetKV serves strings, lists, sets, hashes and sorted sets over the
//! RESP protocol. Its keyspace lives in a sharded dictionary that grows by
//! migrating shards in parallel while it keeps serving, and every write can
//! be made durable through an append-only file with online compaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                               RivetKV                                 │
//! │                                                                       │
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────────────────┐     │
//! │  │ TCP Server  │──>│ Connection  │──>│ CommandHandler           │     │
//! │  │ (Listener)  │   │ (RESP I/O)  │   │ table lookup, arity,     │     │
//! │  └─────────────┘   └─────────────┘   │ key locks, AOF append    │     │
//! │                                      └────────────┬─────────────┘     │
//! │                                                   │                   │
//! │                                                   ▼                   │
//! │  ┌──────────────────────────────────────────────────────────────┐     │
//! │  │                       StorageEngine                          │     │
//! │  │  ConcurrentDict<DataEntity>   ConcurrentDict<SystemTime>     │     │
//! │  │  (values)                     (deadlines)                    │     │
//! │  │  KeyLockManager               SortedSet = HashMap + SkipList │     │
//! │  └──────────────────────────────────────────────────────────────┘     │
//! │          ▲                                        │                   │
//! │          │                                        ▼                   │
//! │  ┌───────┴───────────┐              ┌──────────────────────────┐      │
//! │  │ ExpirySweeper     │              │ AOF writer thread        │      │
//! │  │ (Tokio task)      │              │ replay / rewrite         │      │
//! │  └───────────────────┘              └──────────────────────────┘      │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use rivetkv::{CommandHandler, RespValue, StorageEngine};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! let handler = CommandHandler::new(Arc::new(StorageEngine::new()));
//! let cmd = |args: &[&str]| {
//!     let args: Vec<Bytes> = args.iter().map(|a| Bytes::from(a.to_string())).collect();
//!     handler.execute_args(&args)
//! };
//!
//! assert_eq!(cmd(&["ZADD", "board", "10", "alice", "20", "bob"]), RespValue::integer(2));
//! assert_eq!(cmd(&["ZREVRANK", "board", "bob"]), RespValue::integer(0));
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: dictionary, value types, key locks, sorted sets, expiry
//! - [`commands`]: the command table and handlers
//! - [`aof`]: append-only log writer, replay and rewrite
//! - [`protocol`]: RESP parsing and serialization
//! - [`connection`]: per-client network loop
//! - [`config`]: server settings

pub mod aof;
pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod storage;

pub use aof::{AofConfig, AofHandle, FsyncPolicy};
pub use commands::CommandHandler;
pub use config::ServerConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{ParseError, RespParser, RespValue};
pub use storage::{ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port RivetKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// Version of RivetKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
