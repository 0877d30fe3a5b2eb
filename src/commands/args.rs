//! Argument parsing shared by the command handlers.

use super::error::CommandError;
use std::time::{Duration, SystemTime};

pub(crate) fn parse_int(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::NotInteger)
}

/// Parses a score. Accepts `inf`, `+inf` and `-inf`; rejects NaN.
pub(crate) fn parse_float(arg: &[u8]) -> Result<f64, CommandError> {
    let text = std::str::from_utf8(arg).map_err(|_| CommandError::NotFloat)?;
    match text.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        other => other
            .parse::<f64>()
            .ok()
            .filter(|v| !v.is_nan())
            .ok_or(CommandError::NotFloat),
    }
}

/// Renders a score the way replies and the AOF carry it.
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[inline]
pub(crate) fn is_option(arg: &[u8], name: &str) -> bool {
    arg.eq_ignore_ascii_case(name.as_bytes())
}

/// Deadline `amount` units from now, `unit_ms` milliseconds per unit.
/// A non-positive amount yields a deadline already in the past.
pub(crate) fn deadline_after(
    amount: i64,
    unit_ms: i64,
    command: &'static str,
) -> Result<SystemTime, CommandError> {
    let ms = amount
        .checked_mul(unit_ms)
        .ok_or(CommandError::InvalidExpire(command))?;
    let now = SystemTime::now();
    let at = if ms >= 0 {
        now.checked_add(Duration::from_millis(ms as u64))
    } else {
        now.checked_sub(Duration::from_millis(ms.unsigned_abs()))
    };
    at.ok_or(CommandError::InvalidExpire(command))
}

/// Resolves Redis-style `start`/`stop` (negative counts from the end) to
/// an inclusive index range over `len` items. `None` if the range is
/// empty.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Resolves a possibly negative index into `len` items.
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(b"-42"), Ok(-42));
        assert_eq!(parse_int(b"4.2"), Err(CommandError::NotInteger));
        assert_eq!(parse_int(b"99999999999999999999"), Err(CommandError::NotInteger));
    }

    #[test]
    fn test_parse_float_and_format() {
        assert_eq!(parse_float(b"1.5"), Ok(1.5));
        assert_eq!(parse_float(b"-INF"), Ok(f64::NEG_INFINITY));
        assert_eq!(parse_float(b"nan"), Err(CommandError::NotFloat));
        assert_eq!(format_score(3.0), "3");
        assert_eq!(format_score(0.25), "0.25");
        assert_eq!(format_score(f64::INFINITY), "inf");
        assert_eq!(parse_float(format_score(f64::NEG_INFINITY).as_bytes()), Ok(f64::NEG_INFINITY));
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range(0, -1, 5), Some((0, 4)));
        assert_eq!(normalize_range(-2, -1, 5), Some((3, 4)));
        assert_eq!(normalize_range(-100, 2, 5), Some((0, 2)));
        assert_eq!(normalize_range(1, 100, 5), Some((1, 4)));
        assert_eq!(normalize_range(3, 1, 5), None);
        assert_eq!(normalize_range(5, 10, 5), None);
        assert_eq!(normalize_range(0, -1, 0), None);
    }

    #[test]
    fn test_normalize_index() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(-4, 3), None);
    }
}
