//! Concurrent Sharded Dictionary with Incremental Rehash
//!
//! `ConcurrentDict` is the table every key in RivetKV lives in. It is an
//! array of shards, each one an ordered chain of nodes behind its own
//! `RwLock`. A key's home shard is `fnv32(key) & (shard_count - 1)`, so the
//! shard count is always a power of two.
//!
//! ## Resizing
//!
//! ```text
//!            rehash_index
//!                 │
//!   old    ┌───┬───┬───┬───┐          migrated shards point at their
//!   table  │ ✓ │ ▶ │   │   │ ───────► successor table through the
//!          └───┴───┴───┴───┘          old table's `successor` link
//!            │  ╲
//!   next   ┌───┬───┬───┬───┬───┬───┬───┬───┐
//!   table  │ i │   │   │   │i+n│   │   │   │
//!          └───┴───┴───┴───┴───┴───┴───┴───┘
//! ```
//!
//! When the live count crosses `LOAD_FACTOR * capacity`, exactly one caller
//! wins a compare-and-swap of `rehash_index` from idle (`-1`) to `0`. The
//! winner allocates the next table and hands the migration to background
//! workers, so the triggering `put` returns immediately. Workers claim old
//! shard indices with an atomic increment and split each shard into
//! `next[i]` and `next[i + old_size]` on one extra hash bit, preserving the
//! relative order of nodes.
//!
//! `rehash_index` is the claim cursor. A shard that has been claimed may
//! still be waiting for its worker, so the authoritative routing signal is
//! the `migrated` flag a worker sets on the source shard, under that shard's
//! write lock, in the same critical section that moves the nodes out. An
//! operation that lands on a migrated shard follows the link to the
//! successor table. Every key therefore lives in exactly one unmigrated
//! shard at any instant.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Smallest table the dictionary will allocate.
pub const MIN_CAPACITY: usize = 16;

/// Default hard cap on the number of shards.
pub const MAX_CAPACITY: usize = 1 << 16;

/// Resize once `len >= LOAD_FACTOR * capacity`.
pub const LOAD_FACTOR: f64 = 0.75;

/// Default number of threads migrating shards during a resize.
pub const DEFAULT_REHASH_WORKERS: usize = 4;

const REHASH_IDLE: i64 = -1;

const PRIME32: u32 = 16_777_619;
const OFFSET32: u32 = 2_166_136_261;

/// 32-bit FNV-1 hash of a key.
#[inline]
pub fn fnv32(key: &[u8]) -> u32 {
    let mut hash = OFFSET32;
    for &byte in key {
        hash = hash.wrapping_mul(PRIME32);
        hash ^= byte as u32;
    }
    hash
}

/// Rounds `hint` up to a power of two within `[MIN_CAPACITY, max]`.
pub fn compute_capacity(hint: usize, max: usize) -> usize {
    let max = max.max(MIN_CAPACITY).next_power_of_two();
    if hint <= MIN_CAPACITY {
        return MIN_CAPACITY.min(max);
    }
    hint.checked_next_power_of_two().unwrap_or(max).min(max)
}

/// Sizing and resize options for a dictionary.
#[derive(Debug, Clone, Copy)]
pub struct DictOptions {
    /// Initial shard count (rounded up to a power of two)
    pub capacity: usize,
    /// Shard count the table will never grow beyond
    pub max_capacity: usize,
    /// Threads that migrate shards during a resize
    pub rehash_workers: usize,
}

impl Default for DictOptions {
    fn default() -> Self {
        Self {
            capacity: MIN_CAPACITY,
            max_capacity: MAX_CAPACITY,
            rehash_workers: DEFAULT_REHASH_WORKERS,
        }
    }
}

struct Node<V> {
    key: Bytes,
    hash: u32,
    value: V,
}

struct Shard<V> {
    nodes: Vec<Node<V>>,
    /// Set once the nodes have moved to the successor table.
    migrated: bool,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            migrated: false,
        }
    }

    fn position(&self, key: &[u8], hash: u32) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.hash == hash && node.key.as_ref() == key)
    }

    fn find(&self, key: &[u8], hash: u32) -> Option<&Node<V>> {
        self.position(key, hash).map(|pos| &self.nodes[pos])
    }

    fn find_mut(&mut self, key: &[u8], hash: u32) -> Option<&mut Node<V>> {
        match self.position(key, hash) {
            Some(pos) => Some(&mut self.nodes[pos]),
            None => None,
        }
    }
}

struct Table<V> {
    shards: Box<[RwLock<Shard<V>>]>,
    successor: OnceCell<Arc<Table<V>>>,
}

impl<V> Table<V> {
    fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let shards = (0..size).map(|_| RwLock::new(Shard::new())).collect();
        Self {
            shards,
            successor: OnceCell::new(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn index(&self, hash: u32) -> usize {
        (hash as usize) & (self.len() - 1)
    }
}

struct DictInner<V> {
    table: RwLock<Arc<Table<V>>>,
    /// The table being filled while a resize is in flight.
    next_table: Mutex<Option<Arc<Table<V>>>>,
    capacity: AtomicUsize,
    count: AtomicUsize,
    rehash_index: AtomicI64,
    max_capacity: usize,
    rehash_workers: usize,
}

/// A sharded hash table keyed by binary-safe strings.
///
/// Cloning the handle is cheap and shares the same table.
pub struct ConcurrentDict<V> {
    inner: Arc<DictInner<V>>,
}

impl<V> Clone for ConcurrentDict<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for ConcurrentDict<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentDict")
            .field("len", &self.inner.count.load(Ordering::Relaxed))
            .field("capacity", &self.inner.capacity.load(Ordering::Relaxed))
            .field("rehash_index", &self.inner.rehash_index.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V> Default for ConcurrentDict<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::with_options(DictOptions::default())
    }
}

impl<V> ConcurrentDict<V>
where
    V: Send + Sync + 'static,
{
    /// Creates a dictionary sized for roughly `capacity_hint` shards.
    pub fn new(capacity_hint: usize) -> Self {
        Self::with_options(DictOptions {
            capacity: capacity_hint,
            ..DictOptions::default()
        })
    }

    pub fn with_options(options: DictOptions) -> Self {
        let max_capacity = compute_capacity(options.max_capacity, usize::MAX >> 1);
        let capacity = compute_capacity(options.capacity, max_capacity);
        let inner = DictInner {
            table: RwLock::new(Arc::new(Table::new(capacity))),
            next_table: Mutex::new(None),
            capacity: AtomicUsize::new(capacity),
            count: AtomicUsize::new(0),
            rehash_index: AtomicI64::new(REHASH_IDLE),
            max_capacity,
            rehash_workers: options.rehash_workers.max(1),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Number of live keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current shard count of the authoritative table.
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Acquire)
    }

    /// Returns true while a resize is migrating shards.
    pub fn is_rehashing(&self) -> bool {
        self.inner.rehash_index.load(Ordering::Acquire) != REHASH_IDLE
    }

    /// Blocks until no resize is in flight, or the timeout passes.
    ///
    /// Returns `false` on timeout.
    pub fn wait_for_rehash(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_rehashing() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn current_table(&self) -> Arc<Table<V>> {
        Arc::clone(&self.inner.table.read())
    }

    /// Runs `f` on the unmigrated shard that owns `hash`, under a read lock.
    fn with_shard<R>(&self, hash: u32, f: impl FnOnce(&Shard<V>) -> R) -> R {
        let mut table = self.current_table();
        loop {
            let shard = table.shards[table.index(hash)].read();
            if !shard.migrated {
                return f(&shard);
            }
            let next = match table.successor.get() {
                Some(next) => Arc::clone(next),
                None => return f(&shard),
            };
            drop(shard);
            table = next;
        }
    }

    /// Runs `f` on the unmigrated shard that owns `hash`, under a write lock.
    fn with_shard_mut<R>(&self, hash: u32, f: impl FnOnce(&mut Shard<V>) -> R) -> R {
        let mut table = self.current_table();
        loop {
            let mut shard = table.shards[table.index(hash)].write();
            if !shard.migrated {
                return f(&mut shard);
            }
            let next = match table.successor.get() {
                Some(next) => Arc::clone(next),
                None => return f(&mut shard),
            };
            drop(shard);
            table = next;
        }
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        self.with_value(key, V::clone)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let hash = fnv32(key);
        self.with_shard(hash, |shard| shard.position(key, hash).is_some())
    }

    /// Borrows the value under `key` for the duration of `f`.
    ///
    /// The shard's read lock is held while `f` runs; `f` must not write to
    /// this dictionary.
    pub fn with_value<R>(&self, key: &[u8], f: impl FnOnce(&V) -> R) -> Option<R> {
        let hash = fnv32(key);
        self.with_shard(hash, |shard| shard.find(key, hash).map(|node| f(&node.value)))
    }

    /// Mutably borrows the value under `key` for the duration of `f`.
    ///
    /// The shard's write lock is held while `f` runs; `f` must not touch
    /// this dictionary.
    pub fn with_value_mut<R>(&self, key: &[u8], f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let hash = fnv32(key);
        self.with_shard_mut(hash, |shard| {
            shard.find_mut(key, hash).map(|node| f(&mut node.value))
        })
    }

    /// Inserts or replaces. Returns 1 if the key was new, 0 if updated.
    pub fn put(&self, key: Bytes, value: V) -> usize {
        let hash = fnv32(&key);
        let inserted = self.with_shard_mut(hash, |shard| match shard.find_mut(&key, hash) {
            Some(node) => {
                node.value = value;
                false
            }
            None => {
                shard.nodes.push(Node { key, hash, value });
                true
            }
        });
        self.finish_insert(inserted)
    }

    /// Inserts only if the key is missing. Returns 1 on insert, 0 otherwise.
    pub fn put_if_absent(&self, key: Bytes, value: V) -> usize {
        let hash = fnv32(&key);
        let inserted = self.with_shard_mut(hash, |shard| {
            if shard.position(&key, hash).is_some() {
                return false;
            }
            shard.nodes.push(Node { key, hash, value });
            true
        });
        self.finish_insert(inserted)
    }

    /// Replaces only if the key exists. Returns 1 on update, 0 otherwise.
    pub fn put_if_exists(&self, key: &[u8], value: V) -> usize {
        let hash = fnv32(key);
        self.with_shard_mut(hash, |shard| match shard.find_mut(key, hash) {
            Some(node) => {
                node.value = value;
                1
            }
            None => 0,
        })
    }

    /// Looks up `key`, inserting `init()` first if it is missing, then runs
    /// `f` on the stored value. Returns `f`'s result and whether an insert
    /// happened.
    pub fn upsert_with<R>(
        &self,
        key: &Bytes,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> (R, bool) {
        let hash = fnv32(key);
        let (result, inserted) = self.with_shard_mut(hash, |shard| {
            let (pos, inserted) = match shard.position(key, hash) {
                Some(pos) => (pos, false),
                None => {
                    shard.nodes.push(Node {
                        key: key.clone(),
                        hash,
                        value: init(),
                    });
                    (shard.nodes.len() - 1, true)
                }
            };
            (f(&mut shard.nodes[pos].value), inserted)
        });
        self.finish_insert(inserted);
        (result, inserted)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &[u8]) -> Option<V> {
        let hash = fnv32(key);
        let removed = self.with_shard_mut(hash, |shard| {
            shard
                .position(key, hash)
                .map(|pos| shard.nodes.remove(pos).value)
        });
        if removed.is_some() {
            self.inner.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Removes `key` only if `predicate` accepts its current value.
    pub fn remove_if(&self, key: &[u8], predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let hash = fnv32(key);
        let removed = self.with_shard_mut(hash, |shard| match shard.position(key, hash) {
            Some(pos) if predicate(&shard.nodes[pos].value) => Some(shard.nodes.remove(pos).value),
            _ => None,
        });
        if removed.is_some() {
            self.inner.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Visits every entry, shard by shard, until `visitor` returns false.
    ///
    /// Each shard is read-locked while its entries are visited, so the
    /// visitor must not write to this dictionary. Entries inserted during
    /// the walk may or may not be seen.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Bytes, &V) -> bool,
    {
        let table = self.current_table();
        for index in 0..table.len() {
            if !Self::visit(&table, index, &mut visitor) {
                return;
            }
        }
    }

    fn visit<F>(table: &Arc<Table<V>>, index: usize, visitor: &mut F) -> bool
    where
        F: FnMut(&Bytes, &V) -> bool,
    {
        let shard = table.shards[index].read();
        if shard.migrated {
            let next = match table.successor.get() {
                Some(next) => Arc::clone(next),
                None => return true,
            };
            drop(shard);
            let size = table.len();
            return Self::visit(&next, index, visitor) && Self::visit(&next, index + size, visitor);
        }
        shard
            .nodes
            .iter()
            .all(|node| visitor(&node.key, &node.value))
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.clone());
            true
        });
        keys
    }

    fn finish_insert(&self, inserted: bool) -> usize {
        if !inserted {
            return 0;
        }
        let count = self.inner.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.over_load_factor(count) {
            self.start_rehash();
        }
        1
    }

    fn over_load_factor(&self, count: usize) -> bool {
        self.inner.over_load_factor(count)
    }

    /// Starts a background resize unless one is running or the cap is hit.
    fn start_rehash(&self) {
        if self.capacity() >= self.inner.max_capacity {
            trace!(capacity = self.capacity(), "Dictionary at capacity cap, not resizing");
            return;
        }
        if self
            .inner
            .rehash_index
            .compare_exchange(REHASH_IDLE, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        // The table cannot be swapped while we own the resize, so this
        // snapshot is the one every worker migrates from.
        let old = self.current_table();
        if !self.over_load_factor(self.len()) {
            self.inner.rehash_index.store(REHASH_IDLE, Ordering::Release);
            return;
        }
        let next = match self.inner.ensure_next_table(&old) {
            Some(next) => next,
            None => {
                debug!(capacity = old.len(), "Resize impossible, keeping current capacity");
                self.inner.rehash_index.store(REHASH_IDLE, Ordering::Release);
                return;
            }
        };

        debug!(from = old.len(), to = next.len(), "Dictionary resize started");

        let inner = Arc::clone(&self.inner);
        let (spawn_old, spawn_next) = (Arc::clone(&old), Arc::clone(&next));
        let spawned = thread::Builder::new()
            .name("dict-rehash".into())
            .spawn(move || inner.rehash(spawn_old, spawn_next));
        if let Err(e) = spawned {
            warn!(error = %e, "Could not spawn rehash thread, migrating inline");
            Arc::clone(&self.inner).rehash(old, next);
        }
    }
}

impl<V> DictInner<V>
where
    V: Send + Sync + 'static,
{
    fn ensure_next_table(&self, old: &Arc<Table<V>>) -> Option<Arc<Table<V>>> {
        let mut next_table = self.next_table.lock();
        if let Some(next) = next_table.as_ref() {
            return Some(Arc::clone(next));
        }
        let size = old.len() << 1;
        if size > self.max_capacity || size <= old.len() {
            return None;
        }
        let next = Arc::new(Table::new(size));
        // Must be linked before any shard is flagged as migrated.
        if old.successor.set(Arc::clone(&next)).is_err() {
            return None;
        }
        *next_table = Some(Arc::clone(&next));
        Some(next)
    }

    fn rehash(self: Arc<Self>, mut old: Arc<Table<V>>, mut next: Arc<Table<V>>) {
        loop {
            let started = Instant::now();
            thread::scope(|scope| {
                for worker in 1..self.rehash_workers {
                    let spawned = thread::Builder::new()
                        .name(format!("dict-rehash-{}", worker))
                        .spawn_scoped(scope, || self.transfer(&old, &next));
                    if let Err(e) = spawned {
                        warn!(error = %e, "Could not spawn rehash helper");
                        break;
                    }
                }
                self.transfer(&old, &next);
            });

            *self.table.write() = Arc::clone(&next);
            self.capacity.store(next.len(), Ordering::Release);
            *self.next_table.lock() = None;
            self.rehash_index.store(REHASH_IDLE, Ordering::SeqCst);

            debug!(
                capacity = next.len(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "Dictionary resize finished"
            );

            // Inserts that crossed the threshold while this resize owned
            // `rehash_index` lost their CAS, so check again before leaving.
            if !self.over_load_factor(self.count.load(Ordering::SeqCst)) {
                return;
            }
            if self
                .rehash_index
                .compare_exchange(REHASH_IDLE, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            match self.ensure_next_table(&next) {
                Some(successor) => {
                    debug!(from = next.len(), to = successor.len(), "Dictionary resize continued");
                    old = next;
                    next = successor;
                }
                None => {
                    self.rehash_index.store(REHASH_IDLE, Ordering::Release);
                    return;
                }
            }
        }
    }

    fn over_load_factor(&self, count: usize) -> bool {
        count as f64 >= self.capacity.load(Ordering::Acquire) as f64 * LOAD_FACTOR
    }

    /// Claims old shards one at a time and splits each into the next table.
    fn transfer(&self, old: &Table<V>, next: &Table<V>) {
        let old_size = old.len();
        loop {
            let claimed = self.rehash_index.fetch_add(1, Ordering::AcqRel);
            if claimed < 0 || claimed as usize >= old_size {
                return;
            }
            let index = claimed as usize;

            let mut source = old.shards[index].write();
            let mut low = next.shards[index].write();
            let mut high = next.shards[index + old_size].write();

            for node in source.nodes.drain(..) {
                if (node.hash as usize) & old_size == 0 {
                    low.nodes.push(node);
                } else {
                    high.nodes.push(node);
                }
            }
            source.nodes.shrink_to_fit();
            source.migrated = true;
        }
    }
}
