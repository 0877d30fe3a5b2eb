//! Storage Module
//!
//! The in-memory core of RivetKV: the incrementally rehashed dictionary,
//! the value types stored in it, the key lock table, sorted-set indexes and
//! expiration.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────────────────────────────────────┐
//!            │               StorageEngine                │
//!            │                                            │
//!            │  ConcurrentDict<DataEntity>  (values)      │
//!            │  ConcurrentDict<SystemTime>  (deadlines)   │
//!            │  KeyLockManager              (key locks)   │
//!            └────────────────────────────────────────────┘
//!                   ▲                          ▲
//!                   │                          │
//!     ┌─────────────┴───────────┐  ┌───────────┴────────────┐
//!     │   command handlers      │  │     ExpirySweeper      │
//!     │ (lock, read/mutate, AOF)│  │ (background Tokio task)│
//!     └─────────────────────────┘  └────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use rivetkv::storage::{DataEntity, StorageEngine};
//! use bytes::Bytes;
//! use std::collections::VecDeque;
//! use std::time::{Duration, SystemTime};
//!
//! let engine = StorageEngine::new();
//! let key = Bytes::from("queue");
//!
//! engine
//!     .update_as(&key, true, |list: &mut VecDeque<Bytes>| list.push_back(Bytes::from("job")))
//!     .unwrap();
//! engine.expire(&key, SystemTime::now() + Duration::from_secs(60));
//!
//! assert_eq!(engine.type_of(b"queue"), Some("list"));
//! assert!(engine.ttl(b"queue").unwrap() > 0);
//! ```

pub mod dict;
pub mod engine;
pub mod expiry;
pub mod glob;
pub mod lock;
pub mod skiplist;
pub mod sortedset;
pub mod value;

// Re-export commonly used types
pub use dict::ConcurrentDict;
pub use engine::{StorageConfig, StorageEngine, StorageStats};
pub use expiry::{ExpiryConfig, ExpirySweeper};
pub use lock::{KeyLockGuard, KeyLockManager};
pub use skiplist::{Element, ScoreBorder};
pub use sortedset::SortedSet;
pub use value::{Collection, DataEntity, WrongType};
