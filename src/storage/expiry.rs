//! Key Expiration
//!
//! Deadlines live in the engine's second dictionary as absolute
//! `SystemTime`s, so they survive being written to the AOF as
//! `PEXPIREAT <key> <unix-millis>`.
//!
//! Two mechanisms remove dead keys:
//!
//! 1. **Lazy expiry**: every read path checks the deadline first and
//!    evicts the key from both dictionaries before answering.
//! 2. **Active expiry**: the [`ExpirySweeper`] task walks the deadline
//!    dictionary on a fixed interval (default 5s) and evicts whatever has
//!    passed, so keys nobody reads again still go away.

use crate::storage::StorageEngine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info};

/// Default interval between active sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Milliseconds since the Unix epoch.
pub fn unix_millis(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

/// Inverse of [`unix_millis`]; negative values clamp to the epoch.
pub fn from_unix_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

impl StorageEngine {
    /// Sets an absolute deadline on a live key. Returns false if the key
    /// does not exist.
    pub fn expire(&self, key: &Bytes, at: SystemTime) -> bool {
        let stores = self.stores();
        if !self.check_live(&stores, key) || !stores.data.contains_key(key) {
            return false;
        }
        stores.ttl.put(key.clone(), at);
        true
    }

    /// Clears the deadline on a live key. Returns true if one was removed.
    pub fn persist(&self, key: &[u8]) -> bool {
        let stores = self.stores();
        if !self.check_live(&stores, key) {
            return false;
        }
        stores.ttl.remove(key).is_some()
    }

    /// Deadline of a live key, if it has one.
    pub fn expire_at(&self, key: &[u8]) -> Option<SystemTime> {
        let stores = self.stores();
        if !self.check_live(&stores, key) {
            return None;
        }
        stores.ttl.get(key)
    }

    /// Returns true (and evicts the key) if its deadline has passed.
    pub fn is_expired(&self, key: &[u8]) -> bool {
        let stores = self.stores();
        !self.check_live(&stores, key)
    }

    /// Remaining time to live in milliseconds.
    ///
    /// - `None` if the key doesn't exist
    /// - `Some(-1)` if it exists without a deadline
    /// - `Some(ms)` otherwise
    pub fn pttl(&self, key: &[u8]) -> Option<i64> {
        let stores = self.stores();
        if !self.check_live(&stores, key) || !stores.data.contains_key(key) {
            return None;
        }
        Some(match stores.ttl.get(key) {
            Some(at) => at
                .duration_since(SystemTime::now())
                .map(|left| left.as_millis() as i64)
                .unwrap_or(0),
            None => -1,
        })
    }

    /// Remaining time to live in whole seconds, with the same sentinels as
    /// [`pttl`](Self::pttl).
    pub fn ttl(&self, key: &[u8]) -> Option<i64> {
        self.pttl(key)
            .map(|ms| if ms < 0 { ms } else { (ms + 999) / 1000 })
    }

    /// Evicts every key whose deadline has passed.
    ///
    /// Each candidate is re-checked under its key lock, so a concurrent
    /// EXPIRE or PERSIST on the same key wins or loses cleanly.
    ///
    /// # Returns
    ///
    /// The number of keys evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut due = Vec::new();
        self.stores().ttl.for_each(|key, at| {
            if *at <= now {
                due.push(key.clone());
            }
            true
        });

        let mut evicted = 0;
        for key in due {
            let _guard = self.locks().lock(&key);
            if self.is_expired(&key) {
                evicted += 1;
            }
        }
        evicted
    }
}

/// Configuration for the active sweep.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval between sweeps (default: 5s)
    pub interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the sweeper as a background Tokio task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(engine, config.clone(), shutdown_rx));

        info!(interval_ms = config.interval.as_millis() as u64, "Expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Also called on drop.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let evicted = engine.cleanup_expired();
        if evicted > 0 {
            debug!(
                evicted = evicted,
                keys_remaining = engine.len(),
                "Expired keys swept"
            );
        }
    }
}
