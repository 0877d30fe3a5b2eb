//! Storage Engine
//!
//! The database core every command runs against. It owns two
//! [`ConcurrentDict`]s, one for values and one for expiry deadlines, the
//! [`KeyLockManager`] that commands bracket their critical sections with,
//! and the hook that forwards successful mutations to the append-only file.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        StorageEngine                         │
//! │                                                              │
//! │   RwLock<Stores>  (flush barrier: ops read, FLUSH writes)    │
//! │   ┌──────────────────────────┐ ┌──────────────────────────┐  │
//! │   │ data: ConcurrentDict     │ │ ttl: ConcurrentDict      │  │
//! │   │   key -> DataEntity      │ │   key -> SystemTime      │  │
//! │   └──────────────────────────┘ └──────────────────────────┘  │
//! │                                                              │
//! │   KeyLockManager (1024 slots)     AOF handle (after replay)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Liveness
//!
//! A key is live if it is present in `data` and either absent from `ttl`
//! or its deadline lies in the future. Every read path checks liveness
//! first and evicts an expired key from both dictionaries before
//! answering, so no caller ever observes an expired value.
//!
//! ## Flush
//!
//! Every operation holds a shared lock on the store pair for its duration.
//! FLUSHDB takes it exclusively, which waits for in-flight operations to
//! drain, then swaps in fresh dictionaries.

use super::dict::{ConcurrentDict, DictOptions, DEFAULT_REHASH_WORKERS, MAX_CAPACITY};
use super::glob::GlobPattern;
use super::lock::{KeyLockManager, DEFAULT_LOCK_SLOTS};
use super::value::{Collection, DataEntity, WrongType};
use crate::aof::AofHandle;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, trace};

/// Sizing for the engine's dictionaries and lock table.
#[derive(Debug, Clone, Copy)]
pub struct StorageConfig {
    /// Initial shard count of the value dictionary
    pub data_capacity: usize,
    /// Initial shard count of the expiry dictionary
    pub ttl_capacity: usize,
    /// Hard cap on shard count for both dictionaries
    pub max_capacity: usize,
    /// Threads migrating shards during a resize
    pub rehash_workers: usize,
    /// Number of key lock slots
    pub lock_slots: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_capacity: 1024,
            ttl_capacity: 256,
            max_capacity: MAX_CAPACITY,
            rehash_workers: DEFAULT_REHASH_WORKERS,
            lock_slots: DEFAULT_LOCK_SLOTS,
        }
    }
}

/// The value and expiry dictionaries, swapped together on flush.
pub(crate) struct Stores {
    pub(crate) data: ConcurrentDict<DataEntity>,
    pub(crate) ttl: ConcurrentDict<SystemTime>,
}

impl Stores {
    fn new(config: &StorageConfig) -> Self {
        let options = |capacity| DictOptions {
            capacity,
            max_capacity: config.max_capacity,
            rehash_workers: config.rehash_workers,
        };
        Self {
            data: ConcurrentDict::with_options(options(config.data_capacity)),
            ttl: ConcurrentDict::with_options(options(config.ttl_capacity)),
        }
    }
}

/// The main storage engine.
///
/// Wrap it in an `Arc` and share it across every connection task; all
/// operations take `&self`.
///
/// # Example
///
/// ```
/// use rivetkv::storage::{DataEntity, StorageEngine};
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
/// engine.put(Bytes::from("name"), DataEntity::Str(Bytes::from("rivet")));
///
/// assert_eq!(engine.get_string(b"name"), Ok(Some(Bytes::from("rivet"))));
/// assert_eq!(engine.len(), 1);
/// ```
pub struct StorageEngine {
    config: StorageConfig,
    stores: RwLock<Stores>,
    locks: KeyLockManager,
    aof: OnceCell<Arc<AofHandle>>,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    pub(crate) expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("keys", &self.len())
            .field("lock_slots", &self.locks.slots())
            .field("aof", &self.aof.get().is_some())
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates an engine with default sizing.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    pub fn with_config(config: StorageConfig) -> Self {
        Self {
            stores: RwLock::new(Stores::new(&config)),
            locks: KeyLockManager::new(config.lock_slots),
            aof: OnceCell::new(),
            config,
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The key lock table commands bracket their critical sections with.
    pub fn locks(&self) -> &KeyLockManager {
        &self.locks
    }

    /// Shared access to the store pair. Recursive so that a flush waiting
    /// for the barrier never stalls a thread that already holds it.
    pub(crate) fn stores(&self) -> RwLockReadGuard<'_, Stores> {
        self.stores.read_recursive()
    }

    // ========================================================================
    // AOF HOOK
    // ========================================================================

    /// Attaches the durability log. Done once, after replay, so replayed
    /// commands are never appended again.
    pub fn attach_aof(&self, handle: Arc<AofHandle>) -> bool {
        self.aof.set(handle).is_ok()
    }

    pub fn aof(&self) -> Option<&Arc<AofHandle>> {
        self.aof.get()
    }

    /// Queues a mutating command line for the AOF. No-op without a log.
    ///
    /// Callers invoke this while still holding their key locks so that log
    /// order matches mutation order.
    pub fn add_aof(&self, cmdline: &[Bytes]) {
        if let Some(aof) = self.aof.get() {
            aof.append(cmdline);
        }
    }

    // ========================================================================
    // LIVENESS
    // ========================================================================

    /// Evicts `key` if its deadline has passed. Returns false if it did.
    pub(crate) fn check_live(&self, stores: &Stores, key: &[u8]) -> bool {
        match stores.ttl.get(key) {
            Some(deadline) if deadline <= SystemTime::now() => {
                stores.data.remove(key);
                stores.ttl.remove(key);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                trace!(key = %String::from_utf8_lossy(key), "Lazily expired key");
                false
            }
            _ => true,
        }
    }

    // ========================================================================
    // GENERIC ENTITY ACCESS
    // ========================================================================

    /// Clones the entity stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<DataEntity> {
        self.with_entity(key, DataEntity::clone)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        let stores = self.stores();
        self.check_live(&stores, key) && stores.data.contains_key(key)
    }

    /// Type name of the value under `key`.
    pub fn type_of(&self, key: &[u8]) -> Option<&'static str> {
        self.with_entity(key, DataEntity::type_name)
    }

    /// Borrows the live entity under `key` for the duration of `f`.
    pub fn with_entity<R>(&self, key: &[u8], f: impl FnOnce(&DataEntity) -> R) -> Option<R> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        let stores = self.stores();
        if !self.check_live(&stores, key) {
            return None;
        }
        stores.data.with_value(key, f)
    }

    /// Mutably borrows the live entity under `key` for the duration of `f`.
    pub fn with_entity_mut<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(&mut DataEntity) -> R,
    ) -> Option<R> {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let stores = self.stores();
        if !self.check_live(&stores, key) {
            return None;
        }
        stores.data.with_value_mut(key, f)
    }

    /// Stores `entity`, replacing any previous value. Any existing expiry is
    /// kept; callers that overwrite clear it with `persist`.
    ///
    /// Returns 1 if the key was new, 0 if it was updated.
    pub fn put(&self, key: Bytes, entity: DataEntity) -> usize {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let stores = self.stores();
        self.check_live(&stores, &key);
        stores.data.put(key, entity)
    }

    /// Stores `entity` only if no live value exists. Returns 1 on insert.
    pub fn put_if_absent(&self, key: Bytes, entity: DataEntity) -> usize {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let stores = self.stores();
        self.check_live(&stores, &key);
        stores.data.put_if_absent(key, entity)
    }

    /// Replaces the value only if a live one exists. Returns 1 on update.
    pub fn put_if_exists(&self, key: &[u8], entity: DataEntity) -> usize {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let stores = self.stores();
        if !self.check_live(&stores, key) {
            return 0;
        }
        stores.data.put_if_exists(key, entity)
    }

    /// Removes `key` and its expiry. Returns true if a live value was removed.
    pub fn remove(&self, key: &[u8]) -> bool {
        let stores = self.stores();
        self.remove_in(&stores, key)
    }

    fn remove_in(&self, stores: &Stores, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        let live = self.check_live(stores, key);
        let removed = stores.data.remove(key).is_some();
        stores.ttl.remove(key);
        live && removed
    }

    /// Removes every key in `keys`, returning how many existed.
    pub fn removes(&self, keys: &[Bytes]) -> usize {
        let stores = self.stores();
        keys.iter().filter(|key| self.remove_in(&stores, key)).count()
    }

    /// Drops every key. Waits for in-flight operations to finish first.
    pub fn flush(&self) {
        let mut stores = self.stores.write();
        let dropped = stores.data.len();
        *stores = Stores::new(&self.config);
        info!(keys = dropped, "Database flushed");
    }

    /// Number of keys in the value dictionary. Expired keys not yet evicted
    /// are still counted.
    pub fn len(&self) -> usize {
        self.stores().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every live entry with its deadline until `visitor` returns
    /// false. The visitor must not call back into the engine.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Bytes, &DataEntity, Option<SystemTime>) -> bool,
    {
        let stores = self.stores();
        let now = SystemTime::now();
        stores.data.for_each(|key, entity| {
            let deadline = stores.ttl.get(key);
            if matches!(deadline, Some(at) if at <= now) {
                return true;
            }
            visitor(key, entity, deadline)
        });
    }

    /// All live keys matching a glob pattern.
    ///
    /// Scans the whole keyspace.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let pattern = GlobPattern::new(pattern);
        let match_all = pattern.matches_all();
        let mut keys = Vec::new();
        self.for_each(|key, _, _| {
            if match_all || pattern.matches(key) {
                keys.push(key.clone());
            }
            true
        });
        keys
    }

    // ========================================================================
    // TYPED ACCESS
    // ========================================================================

    /// The string under `key`, or `WrongType` if it holds something else.
    pub fn get_string(&self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        match self.with_entity(key, |entity| match entity {
            DataEntity::Str(value) => Ok(value.clone()),
            _ => Err(WrongType),
        }) {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    /// Reads the collection under `key`. `Ok(None)` if the key is missing.
    pub fn read_as<T, R>(&self, key: &[u8], f: impl FnOnce(&T) -> R) -> Result<Option<R>, WrongType>
    where
        T: Collection,
    {
        match self.with_entity(key, |entity| T::view(entity).map(f)) {
            None => Ok(None),
            Some(None) => Err(WrongType),
            Some(Some(result)) => Ok(Some(result)),
        }
    }

    /// Mutates the collection under `key` in place.
    ///
    /// With `create`, a missing key starts out as an empty collection;
    /// otherwise a missing key yields `Ok(None)` without calling `f`. A
    /// collection left empty by `f` is deleted along with its expiry.
    pub fn update_as<T, R>(
        &self,
        key: &Bytes,
        create: bool,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<Option<R>, WrongType>
    where
        T: Collection,
    {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let stores = self.stores();
        self.check_live(&stores, key);

        let result = if create {
            let (result, _) = stores.data.upsert_with(
                key,
                || T::default().wrap(),
                |entity| T::view_mut(entity).map(f),
            );
            Some(result)
        } else {
            stores
                .data
                .with_value_mut(key, |entity| T::view_mut(entity).map(f))
        };

        match result {
            None => Ok(None),
            Some(None) => Err(WrongType),
            Some(Some(value)) => {
                if stores
                    .data
                    .remove_if(key, DataEntity::is_empty_collection)
                    .is_some()
                {
                    stores.ttl.remove(key);
                }
                Ok(Some(value))
            }
        }
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    pub fn stats(&self) -> StorageStats {
        let stores = self.stores();
        StorageStats {
            keys: stores.data.len() as u64,
            volatile_keys: stores.ttl.len() as u64,
            capacity: stores.data.capacity() as u64,
            rehashing: stores.data.is_rehashing(),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Keys carrying an expiry
    pub volatile_keys: u64,
    /// Shard count of the value dictionary
    pub capacity: u64,
    /// Whether the value dictionary is resizing
    pub rehashing: bool,
    /// Total read operations
    pub get_ops: u64,
    /// Total write operations
    pub set_ops: u64,
    /// Total delete operations
    pub del_ops: u64,
    /// Keys evicted because their deadline passed
    pub expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::thread;

    fn s(value: &str) -> DataEntity {
        DataEntity::Str(Bytes::from(value.to_string()))
    }

    #[test]
    fn test_flush_races_writers() {
        let engine = Arc::new(StorageEngine::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for i in 0..2_000 {
                        let key = Bytes::from(format!("k:{}:{}", t, i));
                        engine.put(key.clone(), s("v"));
                        let _ = engine.get(&key);
                    }
                })
            })
            .collect();
        let flusher = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..50 {
                    engine.flush();
                    thread::yield_now();
                }
            })
        };
        for writer in writers {
            writer.join().unwrap();
        }
        flusher.join().unwrap();

        let keys = engine.keys(b"*");
        assert_eq!(engine.len(), keys.len());
        assert!(keys.iter().all(|key| engine.get_string(key) == Ok(Some(Bytes::from("v")))));

        engine.flush();
        assert_eq!(engine.len(), 0);
        assert!(engine.keys(b"*").is_empty());
    }

    #[test]
    fn test_put_and_get() {
        let engine = StorageEngine::new();
        assert_eq!(engine.put(Bytes::from("k"), s("v1")), 1);
        assert_eq!(engine.put(Bytes::from("k"), s("v2")), 0);
        assert_eq!(engine.get_string(b"k"), Ok(Some(Bytes::from("v2"))));
        assert_eq!(engine.get_string(b"missing"), Ok(None));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_put_if_variants() {
        let engine = StorageEngine::new();
        assert_eq!(engine.put_if_exists(b"k", s("x")), 0);
        assert_eq!(engine.put_if_absent(Bytes::from("k"), s("a")), 1);
        assert_eq!(engine.put_if_absent(Bytes::from("k"), s("b")), 0);
        assert_eq!(engine.put_if_exists(b"k", s("c")), 1);
        assert_eq!(engine.get_string(b"k"), Ok(Some(Bytes::from("c"))));
    }

    #[test]
    fn test_remove_and_removes() {
        let engine = StorageEngine::new();
        for key in ["a", "b", "c"] {
            engine.put(Bytes::from(key), s("1"));
        }
        assert!(engine.remove(b"a"));
        assert!(!engine.remove(b"a"));

        let removed = engine.removes(&[Bytes::from("b"), Bytes::from("c"), Bytes::from("zz")]);
        assert_eq!(removed, 2);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_wrong_type() {
        let engine = StorageEngine::new();
        engine.put(Bytes::from("str"), s("v"));

        let pushed = engine.update_as(&Bytes::from("str"), true, |list: &mut VecDeque<Bytes>| {
            list.push_back(Bytes::from("x"));
        });
        assert_eq!(pushed, Err(WrongType));
        // Unchanged.
        assert_eq!(engine.get_string(b"str"), Ok(Some(Bytes::from("v"))));

        let list = Bytes::from("list");
        engine
            .update_as(&list, true, |l: &mut VecDeque<Bytes>| l.push_back(Bytes::from("x")))
            .unwrap();
        assert_eq!(engine.get_string(b"list"), Err(WrongType));
        assert_eq!(engine.type_of(b"list"), Some("list"));
    }

    #[test]
    fn test_update_without_create_skips_missing() {
        let engine = StorageEngine::new();
        let result = engine.update_as(&Bytes::from("nope"), false, |set: &mut HashSet<Bytes>| {
            set.insert(Bytes::from("m"))
        });
        assert_eq!(result, Ok(None));
        assert!(!engine.exists(b"nope"));
    }

    #[test]
    fn test_emptied_collection_is_deleted() {
        let engine = StorageEngine::new();
        let key = Bytes::from("set");
        engine
            .update_as(&key, true, |set: &mut HashSet<Bytes>| set.insert(Bytes::from("m")))
            .unwrap();
        assert!(engine.exists(b"set"));

        engine
            .update_as(&key, false, |set: &mut HashSet<Bytes>| set.remove(&b"m"[..]))
            .unwrap();
        assert!(!engine.exists(b"set"));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_keys_pattern() {
        let engine = StorageEngine::new();
        for key in ["user:1", "user:2", "session:1"] {
            engine.put(Bytes::from(key), s("v"));
        }
        let mut users = engine.keys(b"user:*");
        users.sort();
        assert_eq!(users, vec![Bytes::from("user:1"), Bytes::from("user:2")]);
        assert_eq!(engine.keys(b"*").len(), 3);
    }

    #[test]
    fn test_flush() {
        let engine = StorageEngine::new();
        for i in 0..100 {
            engine.put(Bytes::from(format!("k{}", i)), s("v"));
        }
        engine.flush();
        assert!(engine.is_empty());
        assert!(!engine.exists(b"k1"));
    }

    #[test]
    fn test_concurrent_access() {
        let engine = Arc::new(StorageEngine::with_config(StorageConfig {
            data_capacity: 16,
            ..StorageConfig::default()
        }));
        let mut handles = vec![];

        for t in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for i in 0..1_000 {
                    let key = Bytes::from(format!("key:{}:{}", t, i));
                    engine.put(key.clone(), s("v"));
                    assert!(engine.exists(&key));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 8_000);
    }

    #[test]
    fn test_stats() {
        let engine = StorageEngine::new();
        engine.put(Bytes::from("a"), s("1"));
        engine.get(b"a");
        engine.remove(b"a");

        let stats = engine.stats();
        assert_eq!(stats.keys, 0);
        assert!(stats.set_ops >= 1);
        assert!(stats.get_ops >= 1);
        assert!(stats.del_ops >= 1);
    }
}
