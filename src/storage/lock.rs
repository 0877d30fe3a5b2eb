//! Per-Key Lock Table
//!
//! Commands that read, mutate and write back a value (or touch several
//! keys) bracket their critical section with locks from the
//! `KeyLockManager`. The manager owns a fixed table of read/write locks;
//! a key maps to `fnv32(key) & (slots - 1)`. Two keys sharing a slot only
//! means extra contention.
//!
//! ## Ordering
//!
//! Multi-key acquisition resolves every key to its slot, deduplicates the
//! slots and takes them in ascending slot order. Two commands with
//! overlapping key sets therefore always meet their shared slots in the
//! same order, so there is no circular wait. A slot is taken once even if
//! several keys land on it, and a slot wanted by any writer is taken
//! exclusively. Guards release in reverse acquisition order when dropped.

use super::dict::fnv32;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::iter;

/// Default number of lock slots.
pub const DEFAULT_LOCK_SLOTS: usize = 1024;

enum SlotGuard<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Locks held for one command's critical section.
///
/// Dropping the guard releases every slot, last acquired first.
#[must_use = "locks are released as soon as the guard is dropped"]
pub struct KeyLockGuard<'a> {
    held: Vec<SlotGuard<'a>>,
}

impl KeyLockGuard<'_> {
    /// Number of distinct slots this guard holds.
    pub fn slot_count(&self) -> usize {
        self.held.len()
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        while let Some(slot) = self.held.pop() {
            drop(slot);
        }
    }
}

fn bytes_of<K: AsRef<[u8]>>(key: &K) -> &[u8] {
    key.as_ref()
}

/// Fixed table of key locks shared by all command handlers.
pub struct KeyLockManager {
    slots: Box<[RwLock<()>]>,
}

impl std::fmt::Debug for KeyLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockManager")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl Default for KeyLockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_SLOTS)
    }
}

impl KeyLockManager {
    /// Creates a table with `slots` locks, rounded up to a power of two.
    pub fn new(slots: usize) -> Self {
        let size = slots.max(1).next_power_of_two();
        Self {
            slots: (0..size).map(|_| RwLock::new(())).collect(),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Slot index guarding `key`.
    #[inline]
    pub fn slot_of(&self, key: &[u8]) -> usize {
        (fnv32(key) as usize) & (self.slots.len() - 1)
    }

    /// Exclusive lock on one key.
    pub fn lock(&self, key: &[u8]) -> KeyLockGuard<'_> {
        self.acquire(iter::once(key), iter::empty())
    }

    /// Shared lock on one key.
    pub fn rlock(&self, key: &[u8]) -> KeyLockGuard<'_> {
        self.acquire(iter::empty(), iter::once(key))
    }

    /// Exclusive locks on every key in `keys`.
    pub fn locks<K: AsRef<[u8]>>(&self, keys: &[K]) -> KeyLockGuard<'_> {
        self.acquire(keys.iter().map(bytes_of), iter::empty())
    }

    /// Shared locks on every key in `keys`.
    pub fn rlocks<K: AsRef<[u8]>>(&self, keys: &[K]) -> KeyLockGuard<'_> {
        self.acquire(iter::empty(), keys.iter().map(bytes_of))
    }

    /// Exclusive locks on `write_keys` and shared locks on `read_keys`.
    ///
    /// A key present in both sets is locked exclusively.
    pub fn rw_locks<W, R>(&self, write_keys: &[W], read_keys: &[R]) -> KeyLockGuard<'_>
    where
        W: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        self.acquire(
            write_keys.iter().map(bytes_of),
            read_keys.iter().map(bytes_of),
        )
    }

    /// Every slot, exclusively. Used by commands that touch the whole
    /// keyspace.
    pub fn lock_all(&self) -> KeyLockGuard<'_> {
        KeyLockGuard {
            held: self.slots.iter().map(|lock| SlotGuard::Exclusive(lock.write())).collect(),
        }
    }

    fn acquire<'k, W, R>(&self, write_keys: W, read_keys: R) -> KeyLockGuard<'_>
    where
        W: IntoIterator<Item = &'k [u8]>,
        R: IntoIterator<Item = &'k [u8]>,
    {
        // slot -> exclusive?
        let mut plan: BTreeMap<usize, bool> = BTreeMap::new();
        for key in write_keys {
            plan.insert(self.slot_of(key), true);
        }
        for key in read_keys {
            plan.entry(self.slot_of(key)).or_insert(false);
        }

        let held = plan
            .into_iter()
            .map(|(slot, exclusive)| {
                let lock = &self.slots[slot];
                if exclusive {
                    SlotGuard::Exclusive(lock.write())
                } else {
                    SlotGuard::Shared(lock.read())
                }
            })
            .collect();

        KeyLockGuard { held }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_slot_count_is_power_of_two() {
        assert_eq!(KeyLockManager::new(1000).slots(), 1024);
        assert_eq!(KeyLockManager::new(0).slots(), 1);
    }

    #[test]
    fn test_duplicate_keys_lock_once() {
        let manager = KeyLockManager::new(16);
        let guard = manager.locks(&["a", "a", "a"]);
        assert_eq!(guard.slot_count(), 1);
    }

    #[test]
    fn test_shared_slots_do_not_self_deadlock() {
        // A single slot forces every key onto the same lock.
        let manager = KeyLockManager::new(1);
        let guard = manager.rw_locks(&["dest"], &["src1", "src2", "dest"]);
        assert_eq!(guard.slot_count(), 1);
    }

    #[test]
    fn test_readers_share() {
        let manager = KeyLockManager::new(16);
        let first = manager.rlock(b"k");
        let second = manager.rlock(b"k");
        assert_eq!(first.slot_count() + second.slot_count(), 2);
    }

    #[test]
    fn test_writer_excludes() {
        let manager = Arc::new(KeyLockManager::new(16));
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = manager.lock(b"k");

        let handle = {
            let manager = Arc::clone(&manager);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let _guard = manager.lock(b"k");
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(guard);
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_opposite_orders_do_not_deadlock() {
        let manager = Arc::new(KeyLockManager::new(64));
        let keys: Vec<String> = (0..16).map(|i| format!("key:{}", i)).collect();
        let (tx, rx) = mpsc::channel();

        for reverse in [false, true] {
            let manager = Arc::clone(&manager);
            let mut keys = keys.clone();
            if reverse {
                keys.reverse();
            }
            let tx = tx.clone();
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let _guard = manager.locks(&keys);
                }
                tx.send(()).unwrap();
            });
        }

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(10))
                .expect("lock ordering deadlocked");
        }
    }

    #[test]
    fn test_lock_all_blocks_single_key() {
        let manager = Arc::new(KeyLockManager::new(8));
        let all = manager.lock_all();
        assert_eq!(all.slot_count(), 8);

        let (tx, rx) = mpsc::channel();
        let handle = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let _guard = manager.rlock(b"any");
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(all);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        handle.join().unwrap();
    }
}
