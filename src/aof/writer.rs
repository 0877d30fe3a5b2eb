//! AOF writer thread and handle.

use super::{AofConfig, AofError, AofState, FsyncPolicy};
use crate::protocol::encode_command;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EVERYSEC: Duration = Duration::from_secs(1);

pub(super) enum Message {
    Record(Vec<u8>),
    Sync(Sender<()>),
    Shutdown,
}

/// State guarded by the pause mutex: the open log and, while a rewrite is
/// running, the mirror of every record appended since it started.
pub(super) struct LogFile {
    pub(super) file: BufWriter<File>,
    pub(super) rewrite_buffer: Option<Vec<Vec<u8>>>,
}

impl LogFile {
    pub(super) fn open(config: &AofConfig) -> Result<Self, AofError> {
        Self::open_path(&config.path)
    }

    pub(super) fn open_path(path: &Path) -> Result<Self, AofError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: BufWriter::new(file),
            rewrite_buffer: None,
        })
    }

    fn append(&mut self, record: Vec<u8>) -> std::io::Result<()> {
        let result = self.file.write_all(&record);
        if let Some(buffer) = self.rewrite_buffer.as_mut() {
            buffer.push(record);
        }
        result
    }

    fn sync(&mut self, fsync: bool) -> std::io::Result<()> {
        self.file.flush()?;
        if fsync {
            self.file.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// Handle to the append-only file.
///
/// Producers call [`append`](Self::append); a dedicated thread does all
/// file I/O. Share it behind an `Arc`.
pub struct AofHandle {
    pub(super) config: AofConfig,
    tx: Sender<Message>,
    pub(super) log: Arc<Mutex<LogFile>>,
    state: AtomicU8,
    appended: AtomicU64,
    writer: Mutex<Option<JoinHandle<()>>>,
    pub(super) rewriter: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AofHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AofHandle")
            .field("path", &self.config.path)
            .field("fsync", &self.config.fsync)
            .field("state", &self.state())
            .finish()
    }
}

impl AofHandle {
    /// Opens (creating if needed) the log and starts the writer thread.
    ///
    /// The handle starts in the `Loading` state; call
    /// [`load`](Self::load) or [`mark_ready`](Self::mark_ready) before
    /// attaching it to an engine.
    pub fn open(config: AofConfig) -> Result<Arc<Self>, AofError> {
        let log = Arc::new(Mutex::new(LogFile::open(&config)?));
        let (tx, rx) = bounded(config.queue_size.max(1));

        let writer = {
            let log = Arc::clone(&log);
            let fsync = config.fsync;
            thread::Builder::new()
                .name("aof-writer".into())
                .spawn(move || writer_loop(rx, log, fsync))?
        };

        info!(
            path = %config.path.display(),
            fsync = ?config.fsync,
            queue_size = config.queue_size,
            "AOF opened"
        );

        Ok(Arc::new(Self {
            config,
            tx,
            log,
            state: AtomicU8::new(AofState::Loading as u8),
            appended: AtomicU64::new(0),
            writer: Mutex::new(Some(writer)),
            rewriter: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &AofConfig {
        &self.config
    }

    pub fn state(&self) -> AofState {
        AofState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn set_state(&self, state: AofState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(super) fn transition(&self, from: AofState, to: AofState) -> Result<(), AofState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(AofState::from_u8)
    }

    /// Leaves the `Loading` state without replaying anything.
    pub fn mark_ready(&self) {
        let _ = self.transition(AofState::Loading, AofState::Ready);
    }

    /// Records queued since the handle was opened.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Queues one command line. Blocks while the queue is full.
    pub fn append(&self, cmdline: &[Bytes]) {
        let mut record = Vec::with_capacity(16 + cmdline.iter().map(|a| a.len() + 16).sum::<usize>());
        encode_command(cmdline, &mut record);
        if self.tx.send(Message::Record(record)).is_err() {
            warn!("AOF writer is gone, dropping record");
            return;
        }
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    /// Blocks until everything queued so far is written and synced.
    pub fn sync(&self) -> Result<(), AofError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(Message::Sync(ack_tx))
            .map_err(|_| AofError::Closed)?;
        ack_rx.recv().map_err(|_| AofError::Closed)
    }

    /// Waits for a running rewrite, drains the queue, syncs and stops the
    /// writer thread.
    pub fn shutdown(&self) {
        if let Some(rewriter) = self.rewriter.lock().take() {
            let _ = rewriter.join();
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = self.tx.send(Message::Shutdown);
            if writer.join().is_err() {
                warn!("AOF writer thread panicked");
            }
            info!(path = %self.config.path.display(), "AOF closed");
        }
    }
}

fn writer_loop(rx: Receiver<Message>, log: Arc<Mutex<LogFile>>, fsync: FsyncPolicy) {
    let mut last_sync = Instant::now();
    let mut dirty = false;

    loop {
        let message = match fsync {
            FsyncPolicy::EverySec => match rx.recv_timeout(EVERYSEC) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            _ => match rx.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            },
        };

        match message {
            Some(Message::Record(record)) => {
                let mut log = log.lock();
                if let Err(e) = log.append(record) {
                    warn!(error = %e, "AOF write failed");
                }
                dirty = true;
                // Batch flushes while producers keep the queue busy.
                if fsync == FsyncPolicy::Always || rx.is_empty() {
                    if let Err(e) = log.sync(fsync == FsyncPolicy::Always) {
                        warn!(error = %e, "AOF flush failed");
                    }
                }
            }
            Some(Message::Sync(ack)) => {
                if let Err(e) = log.lock().sync(true) {
                    warn!(error = %e, "AOF sync failed");
                }
                dirty = false;
                last_sync = Instant::now();
                let _ = ack.send(());
            }
            Some(Message::Shutdown) => break,
            None => {}
        }

        if fsync == FsyncPolicy::EverySec && dirty && last_sync.elapsed() >= EVERYSEC {
            if let Err(e) = log.lock().sync(true) {
                warn!(error = %e, "AOF sync failed");
            }
            dirty = false;
            last_sync = Instant::now();
        }
    }

    if let Err(e) = log.lock().sync(fsync != FsyncPolicy::No) {
        warn!(error = %e, "AOF final sync failed");
    }
    debug!("AOF writer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(dir: &tempfile::TempDir, fsync: FsyncPolicy) -> AofConfig {
        AofConfig {
            path: dir.path().join("test.aof"),
            fsync,
            queue_size: 16,
        }
    }

    #[test]
    fn test_append_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        let handle = AofHandle::open(config(&dir, FsyncPolicy::EverySec)).unwrap();
        assert_eq!(handle.state(), AofState::Loading);
        handle.mark_ready();
        assert_eq!(handle.state(), AofState::Ready);

        handle.append(&[Bytes::from("SET"), Bytes::from("k"), Bytes::from("v")]);
        handle.sync().unwrap();

        let contents = fs::read(dir.path().join("test.aof")).unwrap();
        assert_eq!(contents, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
        assert_eq!(handle.appended(), 1);
        handle.shutdown();
    }

    #[test]
    fn test_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test.aof"), b"*1\r\n$4\r\nPING\r\n").unwrap();

        let handle = AofHandle::open(config(&dir, FsyncPolicy::Always)).unwrap();
        handle.append(&[Bytes::from("DEL"), Bytes::from("k")]);
        handle.shutdown();

        let contents = fs::read(dir.path().join("test.aof")).unwrap();
        assert_eq!(contents, b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n");
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let handle = AofHandle::open(config(&dir, FsyncPolicy::No)).unwrap();
        for i in 0..100 {
            handle.append(&[Bytes::from("INCR"), Bytes::from(format!("k{}", i))]);
        }
        handle.shutdown();
        // Second shutdown is a no-op.
        handle.shutdown();

        let contents = fs::read(dir.path().join("test.aof")).unwrap();
        let records = contents.windows(4).filter(|w| w == b"INCR").count();
        assert_eq!(records, 100);
        assert!(matches!(handle.sync(), Err(AofError::Closed)));
    }
}
