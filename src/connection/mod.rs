//! Connection Module
//!
//! The network boundary of RivetKV. `main` accepts TCP clients and spawns
//! one task per connection; each task owns a read buffer, frames RESP
//! requests (pipelined or inline) and answers them through a shared
//! [`CommandHandler`](crate::commands::CommandHandler).
//!
//! ```text
//! TcpListener ──accept──► tokio::spawn(handle_connection)
//!                                 │
//!                    read ─► parse ─► execute ─► write
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use rivetkv::commands::CommandHandler;
//! use rivetkv::connection::{handle_connection, ConnectionStats};
//! use rivetkv::storage::StorageEngine;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! # async fn serve() -> std::io::Result<()> {
//! let handler = CommandHandler::new(Arc::new(StorageEngine::new()));
//! let stats = Arc::new(ConnectionStats::new());
//! let listener = TcpListener::bind("127.0.0.1:6379").await?;
//!
//! loop {
//!     let (stream, addr) = listener.accept().await?;
//!     tokio::spawn(handle_connection(stream, addr, handler.clone(), Arc::clone(&stats)));
//! }
//! # }
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
