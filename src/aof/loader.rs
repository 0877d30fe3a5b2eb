//! Strict AOF reader and replay.
//!
//! The log is read as a stream of multibulk records. Anything that is not
//! `*<argc>` followed by `$<len>` argument headers aborts the replay with a
//! warning, keeping whatever was rebuilt so far. A record cut short by a
//! crash mid-write is treated as the end of the log.

use super::{AofError, AofHandle, AofState};
use crate::commands::CommandHandler;
use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on argument count accepted from a record header.
const MAX_ARGS: usize = 1024 * 1024;

/// Upper bound on a single argument (512 MB, as for client requests).
const MAX_ARG_LEN: usize = 512 * 1024 * 1024;

/// Outcome of reading one record.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    Record(Vec<Bytes>),
    /// Clean end of the log
    Eof,
    /// The log ends in the middle of a record
    Truncated,
}

/// What a replay did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    /// Records executed
    pub commands: u64,
    /// Bytes consumed by complete records
    pub bytes: u64,
    /// Whether a partial trailing record was dropped
    pub truncated: bool,
    /// Set if replay stopped at a malformed record
    pub error: Option<String>,
}

/// Reads multibulk records one at a time.
pub struct AofReader<R> {
    reader: R,
    offset: u64,
    line: Vec<u8>,
}

impl<R: BufRead> AofReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            line: Vec::with_capacity(64),
        }
    }

    /// Byte offset just past the last complete record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_record(&mut self) -> Result<ReadOutcome, AofError> {
        let start = self.offset;
        let mut consumed = 0u64;

        let header = match self.read_header(&mut consumed)? {
            Some(header) => header,
            None if consumed == 0 => return Ok(ReadOutcome::Eof),
            None => return Ok(ReadOutcome::Truncated),
        };
        let argc = self.parse_header(start, b'*', header)?;
        if argc == 0 || argc > MAX_ARGS {
            return Err(malformed(start, format!("invalid argument count {}", argc)));
        }

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let at = start + consumed;
            let header = match self.read_header(&mut consumed)? {
                Some(header) => header,
                None => return Ok(ReadOutcome::Truncated),
            };
            let len = self.parse_header(at, b'$', header)?;
            if len > MAX_ARG_LEN {
                return Err(malformed(at, format!("argument of {} bytes", len)));
            }

            let mut arg = vec![0u8; len + 2];
            match self.reader.read_exact(&mut arg) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(ReadOutcome::Truncated),
                Err(e) => return Err(e.into()),
            }
            consumed += arg.len() as u64;
            if !arg.ends_with(b"\r\n") {
                return Err(malformed(at, "argument missing trailing CRLF".to_string()));
            }
            arg.truncate(len);
            args.push(Bytes::from(arg));
        }

        self.offset = start + consumed;
        Ok(ReadOutcome::Record(args))
    }

    /// Reads one CRLF-terminated line. `None` if the stream ends first.
    fn read_header(&mut self, consumed: &mut u64) -> io::Result<Option<usize>> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        *consumed += n as u64;
        if n == 0 || !self.line.ends_with(b"\n") {
            return Ok(None);
        }
        Ok(Some(n))
    }

    /// Parses `<prefix><decimal>\r\n` from the current line.
    fn parse_header(&self, at: u64, prefix: u8, _len: usize) -> Result<usize, AofError> {
        let line = &self.line;
        if line.first() != Some(&prefix) {
            return Err(malformed(
                at,
                format!("expected '{}', found {:?}", prefix as char, String::from_utf8_lossy(line)),
            ));
        }
        let digits = line[1..]
            .strip_suffix(b"\r\n")
            .ok_or_else(|| malformed(at, "header missing CRLF".to_string()))?;
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| malformed(at, format!("bad length {:?}", String::from_utf8_lossy(digits))))
    }
}

fn malformed(offset: u64, reason: String) -> AofError {
    AofError::Malformed { offset, reason }
}

/// Replays every record from `reader` through `handler`.
///
/// Malformed input stops the replay and is reported in the summary; I/O
/// errors are returned.
pub fn replay<R: BufRead>(reader: R, handler: &CommandHandler) -> Result<LoadSummary, AofError> {
    let mut reader = AofReader::new(reader);
    let mut summary = LoadSummary::default();

    loop {
        match reader.next_record() {
            Ok(ReadOutcome::Record(args)) => {
                let reply = handler.execute_args(&args);
                if reply.is_error() {
                    debug!(
                        command = %String::from_utf8_lossy(&args[0]),
                        reply = %reply,
                        "Replayed command returned an error"
                    );
                }
                summary.commands += 1;
            }
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::Truncated) => {
                warn!(offset = reader.offset(), "AOF ends with a partial record, ignoring it");
                summary.truncated = true;
                break;
            }
            Err(AofError::Malformed { offset, reason }) => {
                warn!(offset = offset, reason = %reason, "Malformed AOF record, replay aborted");
                summary.error = Some(format!("byte {}: {}", offset, reason));
                break;
            }
            Err(e) => return Err(e),
        }
    }

    summary.bytes = reader.offset();
    Ok(summary)
}

/// Replays the log file at `path`. A missing file replays nothing.
pub fn load(path: &Path, handler: &CommandHandler) -> Result<LoadSummary, AofError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LoadSummary::default()),
        Err(e) => return Err(e.into()),
    };
    replay(BufReader::new(file), handler)
}

/// Replays at most the first `limit` bytes of the log at `path`.
pub(super) fn load_prefix(
    path: &Path,
    limit: u64,
    handler: &CommandHandler,
) -> Result<LoadSummary, AofError> {
    let file = File::open(path)?;
    replay(BufReader::new(file.take(limit)), handler)
}

impl AofHandle {
    /// Replays this log into `handler`'s engine, then moves to `Ready`.
    ///
    /// Run this before the handle is attached to the engine so replayed
    /// commands are not appended again.
    pub fn load(&self, handler: &CommandHandler) -> Result<LoadSummary, AofError> {
        let started = Instant::now();
        self.set_state(AofState::Loading);
        let result = load(&self.config.path, handler).and_then(|summary| {
            if summary.truncated || summary.error.is_some() {
                self.cut_tail(summary.bytes)?;
            }
            Ok(summary)
        });
        self.set_state(AofState::Ready);

        let summary = result?;
        info!(
            path = %self.config.path.display(),
            commands = summary.commands,
            bytes = summary.bytes,
            truncated = summary.truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "AOF replayed"
        );
        Ok(summary)
    }

    /// Drops everything past the last complete record so new appends do
    /// not land behind a partial one.
    fn cut_tail(&self, len: u64) -> Result<(), AofError> {
        let mut log = self.log.lock();
        log.file.flush()?;
        let file = log.file.get_ref();
        let size = file.metadata()?.len();
        if size > len {
            file.set_len(len)?;
            file.sync_all()?;
            warn!(
                path = %self.config.path.display(),
                kept = len,
                dropped = size - len,
                "Truncated AOF to the last complete record"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use std::sync::Arc;

    fn reader(data: &[u8]) -> AofReader<&[u8]> {
        AofReader::new(data)
    }

    fn handler() -> (Arc<StorageEngine>, CommandHandler) {
        let engine = Arc::new(StorageEngine::new());
        let handler = CommandHandler::new(Arc::clone(&engine));
        (engine, handler)
    }

    #[test]
    fn test_reads_records() {
        let mut r = reader(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n*1\r\n$0\r\n\r\n");
        assert_eq!(
            r.next_record().unwrap(),
            ReadOutcome::Record(vec![Bytes::from("GET"), Bytes::from("k")])
        );
        assert_eq!(r.next_record().unwrap(), ReadOutcome::Record(vec![Bytes::new()]));
        assert_eq!(r.next_record().unwrap(), ReadOutcome::Eof);
        assert_eq!(r.offset(), 30);
    }

    #[test]
    fn test_truncated_tail() {
        for cut in [b"*2\r\n$3\r\nSE".as_ref(), b"*2\r\n$3\r\nSET\r\n", b"*2\r\n$3", b"*2"] {
            let mut r = reader(cut);
            assert_eq!(r.next_record().unwrap(), ReadOutcome::Truncated, "{:?}", cut);
        }
    }

    #[test]
    fn test_binary_argument() {
        let mut r = reader(b"*1\r\n$4\r\na\r\nb\r\n");
        assert_eq!(
            r.next_record().unwrap(),
            ReadOutcome::Record(vec![Bytes::from_static(b"a\r\nb")])
        );
    }

    #[test]
    fn test_malformed_prefixes() {
        let mut r = reader(b"SET k v\r\n");
        assert!(matches!(r.next_record(), Err(AofError::Malformed { offset: 0, .. })));

        let mut r = reader(b"*1\r\n3\r\nSET\r\n");
        assert!(matches!(r.next_record(), Err(AofError::Malformed { offset: 4, .. })));

        let mut r = reader(b"*x\r\n");
        assert!(matches!(r.next_record(), Err(AofError::Malformed { .. })));
    }

    #[test]
    fn test_replay_keeps_state_before_corruption() {
        let (engine, handler) = handler();
        let log = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\ngarbage\r\n*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1\r\n2\r\n";

        let summary = replay(&log[..], &handler).unwrap();
        assert_eq!(summary.commands, 1);
        assert!(summary.error.is_some());
        assert_eq!(engine.get_string(b"a"), Ok(Some(Bytes::from("1"))));
        assert_eq!(engine.get_string(b"b"), Ok(None));
    }

    #[test]
    fn test_replay_truncated_log() {
        let (engine, handler) = handler();
        let log = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*3\r\n$3\r\nSET\r\n$1\r\nb";

        let summary = replay(&log[..], &handler).unwrap();
        assert_eq!(summary.commands, 1);
        assert!(summary.truncated);
        assert_eq!(summary.bytes, 27);
        assert_eq!(engine.len(), 1);
    }

    fn open_aof(path: &Path) -> Arc<AofHandle> {
        AofHandle::open(crate::aof::AofConfig {
            path: path.to_path_buf(),
            fsync: crate::aof::FsyncPolicy::Always,
            queue_size: 16,
        })
        .unwrap()
    }

    fn set(handler: &CommandHandler, key: &str, value: &str) {
        let args = [Bytes::from_static(b"SET"), Bytes::from(key.to_string()), Bytes::from(value.to_string())];
        assert_eq!(handler.execute_args(&args), crate::protocol::RespValue::ok());
    }

    #[test]
    fn test_writes_after_torn_tail_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        std::fs::write(&path, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*3\r\n$3\r\nSET\r\n$1\r\nb").unwrap();

        {
            let aof = open_aof(&path);
            let (engine, handler) = handler();
            let summary = aof.load(&handler).unwrap();
            assert!(summary.truncated);
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 27);
            assert!(engine.attach_aof(Arc::clone(&aof)));
            set(&handler, "c", "3");
            aof.shutdown();
        }

        let aof = open_aof(&path);
        let (engine, handler) = handler();
        let summary = aof.load(&handler).unwrap();
        assert!(!summary.truncated);
        assert_eq!(summary.error, None);
        assert_eq!(engine.get_string(b"a"), Ok(Some(Bytes::from("1"))));
        assert_eq!(engine.get_string(b"c"), Ok(Some(Bytes::from("3"))));
        aof.shutdown();
    }

    #[test]
    fn test_load_cuts_malformed_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        std::fs::write(&path, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\ngarbage\r\n").unwrap();

        let aof = open_aof(&path);
        let (_, handler) = handler();
        let summary = aof.load(&handler).unwrap();
        assert!(summary.error.is_some());
        assert_eq!(aof.state(), crate::aof::AofState::Ready);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 27);
        aof.shutdown();
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_, handler) = handler();
        let summary = load(&dir.path().join("absent.aof"), &handler).unwrap();
        assert_eq!(summary, LoadSummary::default());
    }
}
