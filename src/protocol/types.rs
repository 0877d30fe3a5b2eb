//! RESP Data Types
//!
//! Every RESP value starts with a type byte and ends with CRLF:
//!
//! | Type          | Wire form                         |
//! |---------------|-----------------------------------|
//! | Simple string | `+OK\r\n`                         |
//! | Error         | `-ERR unknown command\r\n`        |
//! | Integer       | `:1000\r\n`                       |
//! | Bulk string   | `$5\r\nhello\r\n`                 |
//! | Null          | `$-1\r\n`                         |
//! | Array         | `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n` |
//!
//! The same multibulk form is used for client requests and for the
//! records of the append-only file; [`encode_command`] writes it directly
//! from a command line without building a `RespValue` first.

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A value in the RESP protocol, parsed from a request or sent as a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Status reply, no CRLF inside: `+<string>\r\n`
    SimpleString(String),

    /// Error reply: `-<message>\r\n`
    Error(String),

    /// Signed 64-bit integer: `:<n>\r\n`
    Integer(i64),

    /// Binary-safe string: `$<len>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string `$-1\r\n`; a null array parses to this too
    Null,

    /// `*<count>\r\n` followed by `count` values
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates an error reply.
    ///
    /// # Example
    /// ```
    /// use rivetkv::protocol::RespValue;
    /// let err = RespValue::error("ERR unknown command 'FOO'");
    /// assert_eq!(err.serialize(), b"-ERR unknown command 'FOO'\r\n");
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a bulk string reply.
    ///
    /// # Example
    /// ```
    /// use rivetkv::protocol::RespValue;
    /// let bulk = RespValue::bulk_string("hello");
    /// assert_eq!(bulk.serialize(), b"$5\r\nhello\r\n");
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// An array of bulk strings.
    pub fn bulk_array(items: impl IntoIterator<Item = Bytes>) -> Self {
        RespValue::Array(items.into_iter().map(RespValue::BulkString).collect())
    }

    /// A bulk string, or null when absent.
    pub fn optional(value: Option<Bytes>) -> Self {
        value.map_or(RespValue::Null, RespValue::BulkString)
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the value to its wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the value onto the end of `buf`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => write_header(buf, prefix::INTEGER, *n),
            RespValue::BulkString(data) => write_bulk(buf, data),
            RespValue::Null => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(values) => {
                write_header(buf, prefix::ARRAY, values.len() as i64);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// The text of a simple or UTF-8 bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

fn write_header(buf: &mut Vec<u8>, prefix: u8, n: i64) {
    buf.push(prefix);
    buf.extend_from_slice(n.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

fn write_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    write_header(buf, prefix::BULK_STRING, data.len() as i64);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

/// Appends a command line as a multibulk record.
///
/// # Example
/// ```
/// use rivetkv::protocol::encode_command;
/// use bytes::Bytes;
///
/// let mut buf = Vec::new();
/// encode_command(&[Bytes::from("DEL"), Bytes::from("k")], &mut buf);
/// assert_eq!(buf, b"*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n");
/// ```
pub fn encode_command(args: &[Bytes], buf: &mut Vec<u8>) {
    write_header(buf, prefix::ARRAY, args.len() as i64);
    for arg in args {
        write_bulk(buf, arg);
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) if values.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
