//! Incremental RESP Parser
//!
//! Requests arrive on a socket in arbitrary fragments, so the parser never
//! assumes a whole message is buffered. Each call returns one of:
//!
//! - `Ok(Some((value, consumed)))`: a complete value used `consumed` bytes
//! - `Ok(None)`: the buffer holds only a prefix of a value
//! - `Err(ParseError)`: the bytes cannot be RESP; drop the client
//!
//! The connection layer appends network reads to a `BytesMut`, parses as
//! many values as are complete (pipelining), and advances past each.
//!
//! Lines that do not start with a RESP type byte are inline commands
//! (`PING\r\n`, `SET k v\r\n`) split on ASCII whitespace.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

type Parsed = ParseResult<Option<(RespValue, usize)>>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum size of an inline command line
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// A RESP parser.
///
/// # Example
///
/// ```
/// use rivetkv::protocol::{RespParser, RespValue};
/// use bytes::Bytes;
///
/// let mut parser = RespParser::new();
/// let buf = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
///
/// let (value, consumed) = parser.parse(buf).unwrap().unwrap();
/// assert_eq!(consumed, buf.len());
/// assert_eq!(
///     value,
///     RespValue::array(vec![
///         RespValue::bulk_string(Bytes::from("GET")),
///         RespValue::bulk_string(Bytes::from("name")),
///     ])
/// );
/// ```
#[derive(Debug)]
pub struct RespParser {
    max_bulk: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self {
            max_bulk: MAX_BULK_SIZE,
        }
    }

    /// Parser that rejects bulk strings longer than `max_bulk`.
    pub fn with_max_bulk(max_bulk: usize) -> Self {
        Self { max_bulk }
    }

    /// Attempts to parse one value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> Parsed {
        self.parse_value(buf, 0)
    }

    fn parse_value(&self, buf: &[u8], depth: usize) -> Parsed {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        if depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match first {
            prefix::SIMPLE_STRING => parse_text(buf, RespValue::SimpleString),
            prefix::ERROR => parse_text(buf, RespValue::Error),
            prefix::INTEGER => Ok(read_number(buf)?.map(|(n, used)| (RespValue::Integer(n), used))),
            prefix::BULK_STRING => self.parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf, depth),
            _ => parse_inline(buf),
        }
    }

    /// `$<length>\r\n<data>\r\n`, or `$-1\r\n` for null.
    fn parse_bulk_string(&self, buf: &[u8]) -> Parsed {
        let (length, header) = match read_number(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        if length == -1 {
            return Ok(Some((RespValue::Null, header)));
        }
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }
        let length = length as usize;
        if length > self.max_bulk {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: self.max_bulk,
            });
        }

        let total = header + length + 2;
        if buf.len() < total {
            return Ok(None);
        }
        if &buf[header + length..total] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[header..header + length]);
        Ok(Some((RespValue::BulkString(data), total)))
    }

    /// `*<count>\r\n<elements...>`, or `*-1\r\n` for null.
    fn parse_array(&self, buf: &[u8], depth: usize) -> Parsed {
        let (count, mut consumed) = match read_number(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        // Don't trust the header for the allocation size.
        let mut elements = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            match self.parse_value(&buf[consumed..], depth + 1)? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// `+text\r\n` / `-text\r\n`
fn parse_text(buf: &[u8], make: fn(String) -> RespValue) -> Parsed {
    let Some(pos) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[1..1 + pos])
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    Ok(Some((make(text.to_string()), 1 + pos + 2)))
}

/// Reads the signed decimal after a type byte. Returns it with the length
/// of the whole header line.
fn read_number(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    let Some(pos) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let digits = &buf[1..1 + pos];
    let n = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ParseError::InvalidInteger(String::from_utf8_lossy(digits).into_owned()))?;
    Ok(Some((n, 1 + pos + 2)))
}

/// A plain-text command line.
fn parse_inline(buf: &[u8]) -> Parsed {
    let Some(pos) = find_crlf(buf) else {
        if buf.len() > MAX_INLINE_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: buf.len(),
                max: MAX_INLINE_SIZE,
            });
        }
        return Ok(None);
    };

    let elements: Vec<RespValue> = buf[..pos]
        .split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| RespValue::BulkString(Bytes::copy_from_slice(word)))
        .collect();

    if elements.is_empty() {
        return Err(ParseError::ProtocolError("empty inline command".to_string()));
    }
    Ok(Some((RespValue::Array(elements), pos + 2)))
}

/// Position of the `\r` of the first CRLF in `buf`.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    memchr::memchr_iter(b'\r', buf).find(|&i| buf.get(i + 1) == Some(&b'\n'))
}

/// Parses a single RESP message from `buf`.
pub fn parse_message(buf: &[u8]) -> Parsed {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Bytes::from(s.to_string()))
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(
            parse_message(b"+OK\r\n").unwrap(),
            Some((RespValue::SimpleString("OK".to_string()), 5))
        );
        assert_eq!(
            parse_message(b"-ERR unknown command\r\n").unwrap(),
            Some((RespValue::Error("ERR unknown command".to_string()), 22))
        );
        assert_eq!(parse_message(b":-42\r\n").unwrap(), Some((RespValue::Integer(-42), 6)));
    }

    #[test]
    fn test_parse_bulk_strings() {
        assert_eq!(parse_message(b"$5\r\nhello\r\n").unwrap(), Some((bulk("hello"), 11)));
        assert_eq!(parse_message(b"$0\r\n\r\n").unwrap(), Some((bulk(""), 6)));
        assert_eq!(parse_message(b"$-1\r\n").unwrap(), Some((RespValue::Null, 5)));
        assert_eq!(
            parse_message(b"$5\r\nhel\x00o\r\n").unwrap().unwrap().0,
            RespValue::BulkString(Bytes::from_static(b"hel\x00o"))
        );
    }

    #[test]
    fn test_bulk_string_with_embedded_crlf() {
        let (value, used) = parse_message(b"$4\r\na\r\nb\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::BulkString(Bytes::from_static(b"a\r\nb")));
        assert_eq!(used, 10);
    }

    #[test]
    fn test_incomplete_input() {
        for input in [&b"+OK"[..], b"$5\r\nhel", b"$5", b"*2\r\n$3\r\nGET\r\n", b"*2", b""] {
            assert_eq!(parse_message(input).unwrap(), None, "{:?}", input);
        }
    }

    #[test]
    fn test_parse_arrays() {
        let input = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
        assert_eq!(
            parse_message(input).unwrap(),
            Some((RespValue::Array(vec![bulk("GET"), bulk("name")]), 23))
        );
        assert_eq!(parse_message(b"*-1\r\n").unwrap(), Some((RespValue::Null, 5)));
        assert_eq!(parse_message(b"*0\r\n").unwrap(), Some((RespValue::Array(vec![]), 4)));

        let nested = b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n";
        assert_eq!(
            parse_message(nested).unwrap().unwrap().0,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Integer(2), RespValue::Integer(3)]),
            ])
        );
    }

    #[test]
    fn test_pipelined_messages() {
        let input = b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n";
        let mut parser = RespParser::new();
        let (first, used) = parser.parse(input).unwrap().unwrap();
        assert_eq!(first, RespValue::Array(vec![bulk("PING")]));
        let (second, rest) = parser.parse(&input[used..]).unwrap().unwrap();
        assert_eq!(second, RespValue::Array(vec![bulk("ECHO"), bulk("hi")]));
        assert_eq!(used + rest, input.len());
    }

    #[test]
    fn test_parse_inline_command() {
        let (value, used) = parse_message(b"SET  key   value\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![bulk("SET"), bulk("key"), bulk("value")]));
        assert_eq!(used, 18);
        assert!(matches!(parse_message(b"   \r\n"), Err(ParseError::ProtocolError(_))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_message(b":abc\r\n"), Err(ParseError::InvalidInteger(_))));
        assert!(matches!(parse_message(b"$-2\r\n"), Err(ParseError::InvalidBulkLength(-2))));
        assert!(matches!(parse_message(b"*-3\r\n"), Err(ParseError::InvalidArrayLength(-3))));
        assert!(matches!(parse_message(b"$3\r\nabcd\r\n"), Err(ParseError::ProtocolError(_))));

        let mut parser = RespParser::with_max_bulk(4);
        assert!(matches!(
            parser.parse(b"$5\r\nhello\r\n"),
            Err(ParseError::MessageTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let mut input = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(parse_message(&input), Err(ParseError::ProtocolError(_))));
    }
}
