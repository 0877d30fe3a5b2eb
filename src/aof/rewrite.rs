//! Online AOF rewrite.
//!
//! ```text
//!  pause ─► flush, note log length L, open temp file, start mirroring
//!  replay log[0..L] into a scratch engine           (writer keeps going)
//!  dump scratch engine as SET/RPUSH/SADD/HMSET/ZADD + PEXPIREAT
//!  pause ─► append mirrored records, fsync, rename temp over log, reopen
//! ```
//!
//! Records written after the first pause land both in the live log and in
//! the mirror, and only the first `L` bytes are replayed, so nothing is
//! applied twice. If anything fails the temp file is discarded and the
//! original log stays authoritative.

use super::loader::load_prefix;
use super::writer::{AofHandle, LogFile};
use super::{make_expire_cmd, AofError, AofState};
use crate::commands::{format_score, CommandHandler};
use crate::protocol::encode_command;
use crate::storage::{DataEntity, StorageEngine};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Elements emitted per reconstruction record.
const CHUNK: usize = 64;

/// What a completed rewrite produced.
#[derive(Debug, Clone, Default)]
pub struct RewriteSummary {
    /// Keys written to the new log
    pub keys: u64,
    /// Records written for those keys
    pub records: u64,
    /// Records appended while the rewrite ran
    pub mirrored: u64,
    /// Size of the new log
    pub bytes: u64,
    pub elapsed: Duration,
}

struct RewriteContext {
    prefix_len: u64,
    temp: NamedTempFile,
}

impl AofHandle {
    /// Starts a rewrite on a background thread.
    ///
    /// Returns [`AofError::RewriteInProgress`] if one is already running.
    pub fn start_rewrite(self: &Arc<Self>) -> Result<(), AofError> {
        self.begin_rewrite()?;

        let handle = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("aof-rewrite".into())
            .spawn(move || {
                if let Err(e) = handle.run_rewrite() {
                    warn!(error = %e, "AOF rewrite failed, keeping the current log");
                }
            });

        match spawned {
            Ok(thread) => {
                *self.rewriter.lock() = Some(thread);
                Ok(())
            }
            Err(e) => {
                self.abort_rewrite();
                Err(e.into())
            }
        }
    }

    /// Runs a rewrite on the calling thread.
    pub fn rewrite(&self) -> Result<RewriteSummary, AofError> {
        self.begin_rewrite()?;
        self.run_rewrite()
    }

    /// Blocks until a background rewrite (if any) finishes.
    pub fn wait_for_rewrite(&self) {
        if let Some(thread) = self.rewriter.lock().take() {
            let _ = thread.join();
        }
    }

    fn begin_rewrite(&self) -> Result<(), AofError> {
        match self.transition(AofState::Ready, AofState::Rewriting) {
            Ok(()) => Ok(()),
            Err(AofState::Rewriting) => Err(AofError::RewriteInProgress),
            Err(state) => Err(AofError::NotReady(state)),
        }
    }

    fn abort_rewrite(&self) {
        self.log.lock().rewrite_buffer = None;
        self.set_state(AofState::Ready);
    }

    fn run_rewrite(&self) -> Result<RewriteSummary, AofError> {
        let started = Instant::now();
        info!(path = %self.config.path.display(), "AOF rewrite started");

        let result = self
            .prepare_rewrite()
            .and_then(|ctx| self.write_snapshot(ctx))
            .and_then(|(ctx, summary)| self.finish_rewrite(ctx, summary));

        match result {
            Ok(mut summary) => {
                self.set_state(AofState::Ready);
                summary.elapsed = started.elapsed();
                info!(
                    keys = summary.keys,
                    records = summary.records,
                    mirrored = summary.mirrored,
                    bytes = summary.bytes,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "AOF rewrite finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.abort_rewrite();
                Err(e)
            }
        }
    }

    /// First pause: fixes the replay prefix and starts mirroring.
    fn prepare_rewrite(&self) -> Result<RewriteContext, AofError> {
        let mut log = self.log.lock();
        log.file.flush()?;
        let prefix_len = log.file.get_ref().metadata()?.len();

        let dir = match self.config.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".rewrite-")
            .suffix(".aof")
            .tempfile_in(dir)?;

        log.rewrite_buffer = Some(Vec::new());
        Ok(RewriteContext { prefix_len, temp })
    }

    fn write_snapshot(
        &self,
        ctx: RewriteContext,
    ) -> Result<(RewriteContext, RewriteSummary), AofError> {
        let scratch = Arc::new(StorageEngine::new());
        let handler = CommandHandler::new(Arc::clone(&scratch));
        let loaded = load_prefix(&self.config.path, ctx.prefix_len, &handler)?;
        // The prefix was flushed before it was measured, so it must replay
        // cleanly to the end. Anything less would drop keys from the new log.
        if let Some(reason) = loaded.error {
            return Err(AofError::Malformed {
                offset: loaded.bytes,
                reason,
            });
        }
        if loaded.truncated || loaded.bytes != ctx.prefix_len {
            return Err(AofError::Malformed {
                offset: loaded.bytes,
                reason: format!("log prefix of {} bytes ends mid-record", ctx.prefix_len),
            });
        }

        let mut summary = RewriteSummary::default();
        let mut out = BufWriter::new(ctx.temp.as_file());
        let mut record = Vec::with_capacity(4096);
        let mut failed: Option<io::Error> = None;

        scratch.for_each(|key, entity, deadline| {
            record.clear();
            let cmds = rebuild_commands(key, entity, deadline);
            for cmd in &cmds {
                encode_command(cmd, &mut record);
            }
            if let Err(e) = out.write_all(&record) {
                failed = Some(e);
                return false;
            }
            summary.keys += 1;
            summary.records += cmds.len() as u64;
            true
        });

        if let Some(e) = failed {
            return Err(e.into());
        }
        out.flush()?;
        drop(out);
        Ok((ctx, summary))
    }

    /// Second pause: appends the mirror and swaps the files.
    fn finish_rewrite(
        &self,
        ctx: RewriteContext,
        mut summary: RewriteSummary,
    ) -> Result<RewriteSummary, AofError> {
        let mut log = self.log.lock();

        {
            let mut out = BufWriter::new(ctx.temp.as_file());
            for record in log.rewrite_buffer.iter().flatten() {
                out.write_all(record)?;
                summary.mirrored += 1;
            }
            out.flush()?;
        }
        ctx.temp.as_file().sync_all()?;
        summary.bytes = ctx.temp.as_file().metadata()?.len();

        // Opened before the rename so a failure here leaves the old log in
        // place. After the rename this handle points at the new log.
        let reopened = LogFile::open_path(ctx.temp.path())?;

        // The old log may still hold buffered bytes; they are all mirrored.
        let _ = log.file.flush();
        let persisted: File = ctx.temp.persist(&self.config.path).map_err(|e| e.error)?;
        drop(persisted);

        *log = reopened;
        Ok(summary)
    }
}

/// Records that rebuild one key.
fn rebuild_commands(key: &Bytes, entity: &DataEntity, deadline: Option<SystemTime>) -> Vec<Vec<Bytes>> {
    let mut cmds = Vec::new();
    match entity {
        DataEntity::Str(value) => {
            cmds.push(vec![Bytes::from_static(b"SET"), key.clone(), value.clone()]);
        }
        DataEntity::List(list) => {
            chunked(&mut cmds, "RPUSH", key, list.iter().cloned());
        }
        DataEntity::Set(set) => {
            chunked(&mut cmds, "SADD", key, set.iter().cloned());
        }
        DataEntity::Hash(hash) => {
            let fields: Vec<(Bytes, Bytes)> = hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect();
            for chunk in fields.chunks(CHUNK) {
                let mut cmd = Vec::with_capacity(2 + chunk.len() * 2);
                cmd.push(Bytes::from_static(b"HMSET"));
                cmd.push(key.clone());
                for (field, value) in chunk {
                    cmd.push(field.clone());
                    cmd.push(value.clone());
                }
                cmds.push(cmd);
            }
        }
        DataEntity::ZSet(zset) => {
            let elements: Vec<_> = zset.iter().collect();
            for chunk in elements.chunks(CHUNK) {
                let mut cmd = Vec::with_capacity(2 + chunk.len() * 2);
                cmd.push(Bytes::from_static(b"ZADD"));
                cmd.push(key.clone());
                for element in chunk {
                    cmd.push(Bytes::from(format_score(element.score)));
                    cmd.push(element.member.clone());
                }
                cmds.push(cmd);
            }
        }
    }
    if let Some(at) = deadline {
        cmds.push(make_expire_cmd(key, at));
    }
    cmds
}

fn chunked(cmds: &mut Vec<Vec<Bytes>>, name: &'static str, key: &Bytes, items: impl Iterator<Item = Bytes>) {
    let items: Vec<Bytes> = items.collect();
    for chunk in items.chunks(CHUNK) {
        let mut cmd = Vec::with_capacity(2 + chunk.len());
        cmd.push(Bytes::from_static(name.as_bytes()));
        cmd.push(key.clone());
        cmd.extend(chunk.iter().cloned());
        cmds.push(cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::{AofConfig, FsyncPolicy};
    use crate::protocol::RespValue;
    use std::fs;

    struct Node {
        engine: Arc<StorageEngine>,
        handler: CommandHandler,
        aof: Arc<AofHandle>,
    }

    fn open(dir: &tempfile::TempDir) -> Node {
        let config = AofConfig {
            path: dir.path().join("appendonly.aof"),
            fsync: FsyncPolicy::EverySec,
            queue_size: 64,
        };
        let aof = AofHandle::open(config).unwrap();
        let engine = Arc::new(StorageEngine::new());
        let handler = CommandHandler::new(Arc::clone(&engine));
        aof.load(&handler).unwrap();
        assert!(engine.attach_aof(Arc::clone(&aof)));
        Node { engine, handler, aof }
    }

    fn run(handler: &CommandHandler, args: &[&str]) -> RespValue {
        let args: Vec<Bytes> = args.iter().map(|a| Bytes::from(a.to_string())).collect();
        handler.execute_args(&args)
    }

    #[test]
    fn test_rebuild_commands_chunks() {
        let list = (0..150).map(|i| Bytes::from(i.to_string())).collect();
        let cmds = rebuild_commands(&Bytes::from("l"), &DataEntity::List(list), None);
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0].len(), 2 + 64);
        assert_eq!(cmds[2].len(), 2 + 22);
        assert_eq!(cmds[0][0], Bytes::from("RPUSH"));
    }

    #[test]
    fn test_rewrite_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        {
            let node = open(&dir);
            for _ in 0..200 {
                run(&node.handler, &["INCR", "counter"]);
            }
            run(&node.handler, &["RPUSH", "list", "a", "b", "c"]);
            run(&node.handler, &["SADD", "set", "x", "y"]);
            run(&node.handler, &["HSET", "hash", "f", "v"]);
            run(&node.handler, &["ZADD", "zset", "1.5", "m1", "-inf", "m0"]);
            run(&node.handler, &["SET", "temp", "v", "EX", "100"]);
            run(&node.handler, &["SET", "gone", "v"]);
            run(&node.handler, &["DEL", "gone"]);
            node.aof.sync().unwrap();
            let before = fs::metadata(&path).unwrap().len();

            let summary = node.aof.rewrite().unwrap();
            assert_eq!(summary.keys, 6);
            assert!(summary.bytes < before);
            assert_eq!(node.aof.state(), AofState::Ready);
            node.aof.shutdown();
        }

        let node = open(&dir);
        assert_eq!(run(&node.handler, &["GET", "counter"]), RespValue::bulk_string("200"));
        assert_eq!(run(&node.handler, &["LLEN", "list"]), RespValue::integer(3));
        assert_eq!(run(&node.handler, &["SCARD", "set"]), RespValue::integer(2));
        assert_eq!(run(&node.handler, &["HGET", "hash", "f"]), RespValue::bulk_string("v"));
        assert_eq!(run(&node.handler, &["ZRANK", "zset", "m1"]), RespValue::integer(1));
        assert!(node.engine.ttl(b"temp").unwrap() > 90);
        assert!(!node.engine.exists(b"gone"));
        node.aof.shutdown();
    }

    #[test]
    fn test_writes_after_rewrite_are_not_lost_or_doubled() {
        let dir = tempfile::tempdir().unwrap();
        {
            let node = open(&dir);
            run(&node.handler, &["SET", "a", "1"]);
            run(&node.handler, &["RPUSH", "l", "x"]);
            node.aof.rewrite().unwrap();
            run(&node.handler, &["SET", "a", "2"]);
            run(&node.handler, &["SET", "b", "3"]);
            run(&node.handler, &["RPUSH", "l", "y"]);
            node.aof.shutdown();
        }

        let node = open(&dir);
        assert_eq!(run(&node.handler, &["GET", "a"]), RespValue::bulk_string("2"));
        assert_eq!(run(&node.handler, &["GET", "b"]), RespValue::bulk_string("3"));
        assert_eq!(run(&node.handler, &["LLEN", "l"]), RespValue::integer(2));
        node.aof.shutdown();
    }

    #[test]
    fn test_concurrent_writes_during_background_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        {
            let node = open(&dir);
            for i in 0..500 {
                run(&node.handler, &["SET", &format!("k{}", i), "v"]);
            }

            let writer = {
                let handler = node.handler.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        run(&handler, &["INCR", "counter"]);
                    }
                })
            };
            node.aof.start_rewrite().unwrap();
            writer.join().unwrap();
            node.aof.wait_for_rewrite();
            assert_eq!(node.aof.state(), AofState::Ready);
            node.aof.shutdown();
        }

        let node = open(&dir);
        assert_eq!(run(&node.handler, &["GET", "counter"]), RespValue::bulk_string("1000"));
        assert_eq!(node.engine.len(), 501);
        node.aof.shutdown();
    }

    #[test]
    fn test_rewrite_refuses_malformed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let original = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\ngarbage\r\n*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1\r\n2\r\n";
        fs::write(&path, original).unwrap();

        let aof = AofHandle::open(AofConfig {
            path: path.clone(),
            fsync: FsyncPolicy::Always,
            queue_size: 16,
        })
        .unwrap();
        aof.mark_ready();

        assert!(matches!(aof.rewrite(), Err(AofError::Malformed { offset: 27, .. })));
        assert_eq!(aof.state(), AofState::Ready);
        assert_eq!(fs::read(&path).unwrap(), original.to_vec());

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
        aof.shutdown();
    }

    #[test]
    fn test_rewritten_log_keeps_receiving_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let node = open(&dir);
        run(&node.handler, &["SET", "a", "1"]);
        node.aof.rewrite().unwrap();
        let rewritten = fs::metadata(&path).unwrap().len();

        run(&node.handler, &["SET", "b", "2"]);
        node.aof.sync().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > rewritten);
        node.aof.shutdown();
    }

    #[test]
    fn test_second_rewrite_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(&dir);
        node.aof.set_state(AofState::Rewriting);
        assert!(matches!(node.aof.rewrite(), Err(AofError::RewriteInProgress)));
        node.aof.set_state(AofState::Loading);
        assert!(matches!(node.aof.start_rewrite(), Err(AofError::NotReady(AofState::Loading))));
        node.aof.set_state(AofState::Ready);
        node.aof.shutdown();
    }
}
