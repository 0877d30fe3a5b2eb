//! RESP Protocol Implementation
//!
//! Parsing and serialization for the Redis Serialization Protocol (RESP),
//! used on client connections and as the record format of the AOF.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` enum, reply serialization, `encode_command`
//! - `parser`: incremental parser for incoming requests
//!
//! ## Example
//!
//! ```
//! use rivetkv::protocol::{parse_message, RespValue};
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (value, consumed) = parse_message(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//! assert_eq!(value.as_array().map(|args| args.len()), Some(2));
//!
//! let reply = RespValue::bulk_string("rivet");
//! assert_eq!(reply.serialize(), b"$5\r\nrivet\r\n");
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{encode_command, RespValue};
