//! Per-client connection loop.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! accept ─► ConnectionHandler::run
//!              │
//!              ▼
//!         ┌──────────────────────────────┐
//!         │ parse every complete request │◄──┐
//!         │ in the buffer, execute each, │   │
//!         │ queue the replies            │   │
//!         └──────────────┬───────────────┘   │
//!                        ▼                   │
//!         ┌──────────────────────────────┐   │
//!         │ write queued replies, flush  │   │
//!         └──────────────┬───────────────┘   │
//!                        ▼                   │
//!         ┌──────────────────────────────┐   │
//!         │ read more bytes from socket  │───┘
//!         └──────────────────────────────┘
//! ```
//!
//! TCP is a stream protocol: a read may hold half a request or several
//! pipelined ones, so bytes accumulate in a `BytesMut` until the parser
//! can frame a whole value. Replies to one batch are flushed together.
//!
//! A framing error is answered with `-ERR Protocol error: ...` and the
//! connection is closed, since the stream cannot be resynchronised.

use crate::commands::CommandHandler;
use crate::protocol::parser::{MAX_BULK_SIZE, MAX_INLINE_SIZE};
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Largest amount of unparsed input a client may buffer: one maximal bulk
/// string plus its framing.
const MAX_BUFFER_SIZE: usize = MAX_BULK_SIZE + MAX_INLINE_SIZE;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Counters shared by every connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Requests executed over the network
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Outcome of draining the read buffer.
enum Batch {
    /// Keep serving.
    Continue,
    /// The client asked to close (QUIT) or sent unframeable input.
    Close,
}

/// State of one connected client.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    /// Serialized replies waiting to be written
    out: Vec<u8>,
    command_handler: CommandHandler,
    parser: RespParser,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            out: Vec::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: RespParser::new(),
            stats,
        }
    }

    /// Serves the client until it disconnects, sends QUIT, or fails.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let batch = self.process_buffer();
            self.flush_replies().await?;
            if let Batch::Close = batch {
                return Ok(());
            }
            self.read_more_data().await?;
        }
    }

    /// Executes every complete request currently buffered.
    fn process_buffer(&mut self) -> Batch {
        while !self.buffer.is_empty() {
            let request = match self.parser.parse(&self.buffer) {
                Ok(Some((value, consumed))) => {
                    let _ = self.buffer.split_to(consumed);
                    value
                }
                Ok(None) => {
                    trace!(
                        client = %self.addr,
                        buffered = self.buffer.len(),
                        "Incomplete request, need more data"
                    );
                    break;
                }
                Err(e) => {
                    warn!(client = %self.addr, error = %e, "Protocol error");
                    RespValue::error(protocol_error_line(&e)).serialize_into(&mut self.out);
                    self.buffer.clear();
                    return Batch::Close;
                }
            };

            let quit = is_quit(&request);
            let reply = self.command_handler.execute(request);
            self.stats.command_processed();
            reply.serialize_into(&mut self.out);
            if quit {
                return Batch::Close;
            }
        }
        Batch::Continue
    }

    async fn flush_replies(&mut self) -> Result<(), ConnectionError> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(self.out.len());
        trace!(client = %self.addr, bytes = self.out.len(), "Sent replies");
        self.out.clear();
        Ok(())
    }

    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            warn!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(if self.buffer.is_empty() {
                ConnectionError::ClientDisconnected
            } else {
                ConnectionError::UnexpectedEof
            });
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(())
    }
}

fn is_quit(request: &RespValue) -> bool {
    match request.as_array() {
        Some([RespValue::BulkString(name), ..]) => name.eq_ignore_ascii_case(b"quit"),
        _ => false,
    }
}

fn protocol_error_line(e: &ParseError) -> String {
    format!("ERR Protocol error: {}", e)
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Client disconnected")]
    ClientDisconnected,

    /// The peer closed the stream in the middle of a request
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Runs a [`ConnectionHandler`] to completion. Ordinary disconnects are
/// not reported.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => debug!(client = %addr, error = %e, "Connection ended with error"),
        }
    }
}
