//! List commands.

use super::args::{normalize_index, normalize_range, parse_int};
use super::router::CommandSpec;
use super::{propagate, CommandError, CommandHandler, CommandResult};
use crate::protocol::RespValue;
use bytes::Bytes;
use std::collections::VecDeque;

type List = VecDeque<Bytes>;

pub(super) static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("lpush", -3, lpush),
    CommandSpec::new("lpushx", -3, lpushx),
    CommandSpec::new("rpush", -3, rpush),
    CommandSpec::new("rpushx", -3, rpushx),
    CommandSpec::new("lpop", 2, lpop),
    CommandSpec::new("rpop", 2, rpop),
    CommandSpec::new("rpoplpush", 3, rpoplpush),
    CommandSpec::new("llen", 2, llen),
    CommandSpec::new("lindex", 3, lindex),
    CommandSpec::new("lrange", 4, lrange),
    CommandSpec::new("lset", 4, lset),
    CommandSpec::new("lrem", 4, lrem),
];

#[derive(Clone, Copy, PartialEq)]
enum End {
    Head,
    Tail,
}

fn push(ctx: &CommandHandler, args: &[Bytes], end: End, create: bool, name: &'static str) -> CommandResult {
    let db = ctx.engine();
    let key = &args[0];
    let _guard = db.locks().lock(key);

    let pushed = db.update_as(key, create, |list: &mut List| {
        for value in &args[1..] {
            match end {
                End::Head => list.push_front(value.clone()),
                End::Tail => list.push_back(value.clone()),
            }
        }
        list.len()
    })?;

    match pushed {
        Some(len) => {
            propagate(db, name, args);
            Ok(RespValue::integer(len as i64))
        }
        None => Ok(RespValue::integer(0)),
    }
}

/// LPUSH key value [value ...]. Values end up in reverse argument order.
fn lpush(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    push(ctx, args, End::Head, true, "LPUSH")
}

fn lpushx(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    push(ctx, args, End::Head, false, "LPUSHX")
}

fn rpush(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    push(ctx, args, End::Tail, true, "RPUSH")
}

fn rpushx(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    push(ctx, args, End::Tail, false, "RPUSHX")
}

fn pop(ctx: &CommandHandler, args: &[Bytes], end: End, name: &'static str) -> CommandResult {
    let db = ctx.engine();
    let key = &args[0];
    let _guard = db.locks().lock(key);

    let popped = db
        .update_as(key, false, |list: &mut List| match end {
            End::Head => list.pop_front(),
            End::Tail => list.pop_back(),
        })?
        .flatten();

    if popped.is_some() {
        propagate(db, name, args);
    }
    Ok(RespValue::optional(popped))
}

fn lpop(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    pop(ctx, args, End::Head, "LPOP")
}

fn rpop(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    pop(ctx, args, End::Tail, "RPOP")
}

/// RPOPLPUSH source destination
fn rpoplpush(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let (src, dst) = (&args[0], &args[1]);
    let _guard = db.locks().locks(args);

    if src == dst {
        let rotated = db
            .update_as(src, false, |list: &mut List| {
                let value = list.pop_back()?;
                list.push_front(value.clone());
                Some(value)
            })?
            .flatten();
        if rotated.is_some() {
            propagate(db, "RPOPLPUSH", args);
        }
        return Ok(RespValue::optional(rotated));
    }

    // Check the destination first so a type error leaves the source intact.
    db.read_as(dst, |_: &List| ())?;
    let popped = db
        .update_as(src, false, |list: &mut List| list.pop_back())?
        .flatten();
    let Some(value) = popped else {
        return Ok(RespValue::Null);
    };
    db.update_as(dst, true, |list: &mut List| list.push_front(value.clone()))?;
    propagate(db, "RPOPLPUSH", args);
    Ok(RespValue::bulk_string(value))
}

fn llen(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let len = db.read_as(&args[0], |list: &List| list.len())?.unwrap_or(0);
    Ok(RespValue::integer(len as i64))
}

fn lindex(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let index = parse_int(&args[1])?;
    let _guard = db.locks().rlock(&args[0]);
    let value = db
        .read_as(&args[0], |list: &List| {
            normalize_index(index, list.len()).and_then(|i| list.get(i).cloned())
        })?
        .flatten();
    Ok(RespValue::optional(value))
}

fn lrange(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let start = parse_int(&args[1])?;
    let stop = parse_int(&args[2])?;
    let _guard = db.locks().rlock(&args[0]);
    let items = db
        .read_as(&args[0], |list: &List| match normalize_range(start, stop, list.len()) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })?
        .unwrap_or_default();
    Ok(RespValue::bulk_array(items))
}

fn lset(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let index = parse_int(&args[1])?;
    let _guard = db.locks().lock(&args[0]);

    db.update_as(&args[0], false, |list: &mut List| -> Result<(), CommandError> {
        let i = normalize_index(index, list.len()).ok_or(CommandError::OutOfRange)?;
        list[i] = args[2].clone();
        Ok(())
    })?
    .ok_or(CommandError::NoSuchKey)??;

    propagate(db, "LSET", args);
    Ok(RespValue::ok())
}

/// LREM key count value: `count > 0` scans from the head, `count < 0`
/// from the tail, `0` removes every match.
fn lrem(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let count = parse_int(&args[1])?;
    let target = &args[2];
    let _guard = db.locks().lock(&args[0]);

    let removed = db
        .update_as(&args[0], false, |list: &mut List| {
            let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
            let before = list.len();
            let mut removed = 0;
            if count >= 0 {
                list.retain(|item| {
                    if removed < limit && item == target {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                });
            } else {
                let mut i = list.len();
                while i > 0 && removed < limit {
                    i -= 1;
                    if list[i] == *target {
                        list.remove(i);
                        removed += 1;
                    }
                }
            }
            before - list.len()
        })?
        .unwrap_or(0);

    if removed > 0 {
        propagate(db, "LREM", args);
    }
    Ok(RespValue::integer(removed as i64))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{handler, run};
    use super::*;

    fn items(values: &[&str]) -> RespValue {
        RespValue::bulk_array(values.iter().map(|v| Bytes::from(v.to_string())))
    }

    #[test]
    fn test_push_pop() {
        let h = handler();
        assert_eq!(run(&h, &["RPUSH", "l", "a", "b"]), RespValue::integer(2));
        assert_eq!(run(&h, &["LPUSH", "l", "x", "y"]), RespValue::integer(4));
        assert_eq!(run(&h, &["LRANGE", "l", "0", "-1"]), items(&["y", "x", "a", "b"]));

        assert_eq!(run(&h, &["LPOP", "l"]), RespValue::bulk_string("y"));
        assert_eq!(run(&h, &["RPOP", "l"]), RespValue::bulk_string("b"));
        assert_eq!(run(&h, &["LLEN", "l"]), RespValue::integer(2));
        assert_eq!(run(&h, &["LPOP", "missing"]), RespValue::Null);
    }

    #[test]
    fn test_pushx_requires_existing_list() {
        let h = handler();
        assert_eq!(run(&h, &["LPUSHX", "l", "a"]), RespValue::integer(0));
        assert_eq!(run(&h, &["EXISTS", "l"]), RespValue::integer(0));
        run(&h, &["RPUSH", "l", "a"]);
        assert_eq!(run(&h, &["RPUSHX", "l", "b"]), RespValue::integer(2));
    }

    #[test]
    fn test_popping_last_element_deletes_key() {
        let h = handler();
        run(&h, &["RPUSH", "l", "only"]);
        run(&h, &["EXPIRE", "l", "100"]);
        run(&h, &["LPOP", "l"]);
        assert_eq!(run(&h, &["EXISTS", "l"]), RespValue::integer(0));
        assert_eq!(h.engine().stats().volatile_keys, 0);
    }

    #[test]
    fn test_rpoplpush() {
        let h = handler();
        run(&h, &["RPUSH", "src", "a", "b", "c"]);
        assert_eq!(run(&h, &["RPOPLPUSH", "src", "dst"]), RespValue::bulk_string("c"));
        assert_eq!(run(&h, &["LRANGE", "dst", "0", "-1"]), items(&["c"]));

        assert_eq!(run(&h, &["RPOPLPUSH", "src", "src"]), RespValue::bulk_string("b"));
        assert_eq!(run(&h, &["LRANGE", "src", "0", "-1"]), items(&["b", "a"]));

        run(&h, &["SET", "str", "v"]);
        assert!(run(&h, &["RPOPLPUSH", "src", "str"]).is_error());
        assert_eq!(run(&h, &["LLEN", "src"]), RespValue::integer(2));
        assert_eq!(run(&h, &["RPOPLPUSH", "none", "dst"]), RespValue::Null);
    }

    #[test]
    fn test_lindex_lrange_bounds() {
        let h = handler();
        run(&h, &["RPUSH", "l", "a", "b", "c", "d"]);
        assert_eq!(run(&h, &["LINDEX", "l", "-1"]), RespValue::bulk_string("d"));
        assert_eq!(run(&h, &["LINDEX", "l", "10"]), RespValue::Null);
        assert_eq!(run(&h, &["LRANGE", "l", "1", "2"]), items(&["b", "c"]));
        assert_eq!(run(&h, &["LRANGE", "l", "-2", "100"]), items(&["c", "d"]));
        assert_eq!(run(&h, &["LRANGE", "l", "3", "1"]), items(&[]));
        assert_eq!(run(&h, &["LRANGE", "missing", "0", "-1"]), items(&[]));
    }

    #[test]
    fn test_lset() {
        let h = handler();
        run(&h, &["RPUSH", "l", "a", "b"]);
        assert_eq!(run(&h, &["LSET", "l", "-1", "z"]), RespValue::ok());
        assert_eq!(run(&h, &["LRANGE", "l", "0", "-1"]), items(&["a", "z"]));
        assert_eq!(run(&h, &["LSET", "l", "5", "z"]), RespValue::error("ERR index out of range"));
        assert_eq!(run(&h, &["LSET", "nope", "0", "z"]), RespValue::error("ERR no such key"));
    }

    #[test]
    fn test_lrem() {
        let h = handler();
        run(&h, &["RPUSH", "l", "a", "b", "a", "c", "a"]);
        assert_eq!(run(&h, &["LREM", "l", "-2", "a"]), RespValue::integer(2));
        assert_eq!(run(&h, &["LRANGE", "l", "0", "-1"]), items(&["a", "b", "c"]));
        run(&h, &["RPUSH", "l", "a", "a"]);
        assert_eq!(run(&h, &["LREM", "l", "1", "a"]), RespValue::integer(1));
        assert_eq!(run(&h, &["LRANGE", "l", "0", "-1"]), items(&["b", "c", "a", "a"]));
        assert_eq!(run(&h, &["LREM", "l", "0", "a"]), RespValue::integer(2));
        assert_eq!(run(&h, &["LRANGE", "l", "0", "-1"]), items(&["b", "c"]));
    }

    #[test]
    fn test_wrong_type() {
        let h = handler();
        run(&h, &["SET", "s", "v"]);
        assert!(matches!(run(&h, &["LPUSH", "s", "x"]), RespValue::Error(e) if e.starts_with("WRONGTYPE")));
        assert!(run(&h, &["LLEN", "s"]).is_error());
    }
}
