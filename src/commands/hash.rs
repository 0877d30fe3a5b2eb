//! Hash commands.

use super::args::parse_int;
use super::router::CommandSpec;
use super::{propagate, CommandError, CommandHandler, CommandResult};
use crate::protocol::RespValue;
use bytes::Bytes;
use std::collections::HashMap;

type Hash = HashMap<Bytes, Bytes>;

pub(super) static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("hset", -4, hset),
    CommandSpec::new("hsetnx", 4, hsetnx),
    CommandSpec::new("hmset", -4, hmset),
    CommandSpec::new("hget", 3, hget),
    CommandSpec::new("hmget", -3, hmget),
    CommandSpec::new("hexists", 3, hexists),
    CommandSpec::new("hdel", -3, hdel),
    CommandSpec::new("hlen", 2, hlen),
    CommandSpec::new("hkeys", 2, hkeys),
    CommandSpec::new("hvals", 2, hvals),
    CommandSpec::new("hgetall", 2, hgetall),
    CommandSpec::new("hincrby", 4, hincrby),
];

/// Sets every field/value pair in `args[1..]`, returning how many fields
/// were new.
fn set_pairs(ctx: &CommandHandler, args: &[Bytes], name: &'static str) -> Result<usize, CommandError> {
    if (args.len() - 1) % 2 != 0 {
        return Err(CommandError::WrongArity(name.to_ascii_lowercase()));
    }
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let added = db
        .update_as(&args[0], true, |hash: &mut Hash| {
            args[1..]
                .chunks_exact(2)
                .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
                .count()
        })?
        .unwrap_or(0);
    propagate(db, name, args);
    Ok(added)
}

fn hset(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let added = set_pairs(ctx, args, "HSET")?;
    Ok(RespValue::integer(added as i64))
}

fn hmset(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    set_pairs(ctx, args, "HMSET")?;
    Ok(RespValue::ok())
}

fn hsetnx(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let inserted = db
        .update_as(&args[0], true, |hash: &mut Hash| {
            if hash.contains_key(&args[1]) {
                false
            } else {
                hash.insert(args[1].clone(), args[2].clone());
                true
            }
        })?
        .unwrap_or(false);
    if inserted {
        propagate(db, "HSET", args);
    }
    Ok(RespValue::integer(inserted as i64))
}

fn hget(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let value = db.read_as(&args[0], |hash: &Hash| hash.get(&args[1]).cloned())?;
    Ok(RespValue::optional(value.flatten()))
}

fn hmget(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let fields = &args[1..];
    let values = db
        .read_as(&args[0], |hash: &Hash| {
            fields.iter().map(|f| hash.get(f).cloned()).collect::<Vec<_>>()
        })?
        .unwrap_or_else(|| vec![None; fields.len()]);
    Ok(RespValue::array(values.into_iter().map(RespValue::optional).collect()))
}

fn hexists(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let found = db
        .read_as(&args[0], |hash: &Hash| hash.contains_key(&args[1]))?
        .unwrap_or(false);
    Ok(RespValue::integer(found as i64))
}

fn hdel(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let removed = db
        .update_as(&args[0], false, |hash: &mut Hash| {
            args[1..].iter().filter(|f| hash.remove(*f).is_some()).count()
        })?
        .unwrap_or(0);
    if removed > 0 {
        propagate(db, "HDEL", args);
    }
    Ok(RespValue::integer(removed as i64))
}

fn hlen(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let len = db.read_as(&args[0], |hash: &Hash| hash.len())?.unwrap_or(0);
    Ok(RespValue::integer(len as i64))
}

fn hkeys(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let fields = db
        .read_as(&args[0], |hash: &Hash| hash.keys().cloned().collect::<Vec<_>>())?
        .unwrap_or_default();
    Ok(RespValue::bulk_array(fields))
}

fn hvals(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let values = db
        .read_as(&args[0], |hash: &Hash| hash.values().cloned().collect::<Vec<_>>())?
        .unwrap_or_default();
    Ok(RespValue::bulk_array(values))
}

/// Field/value pairs flattened into one array.
fn hgetall(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let items = db
        .read_as(&args[0], |hash: &Hash| {
            hash.iter()
                .flat_map(|(f, v)| [f.clone(), v.clone()])
                .collect::<Vec<_>>()
        })?
        .unwrap_or_default();
    Ok(RespValue::bulk_array(items))
}

fn hincrby(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let delta = parse_int(&args[2])?;
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let result = db
        .update_as(&args[0], true, |hash: &mut Hash| -> Result<i64, CommandError> {
            let current = match hash.get(&args[1]) {
                Some(raw) => parse_int(raw)?,
                None => 0,
            };
            let next = current.checked_add(delta).ok_or(CommandError::Overflow)?;
            hash.insert(args[1].clone(), Bytes::from(next.to_string()));
            Ok(next)
        })?;
    match result {
        Some(Ok(next)) => {
            propagate(db, "HINCRBY", args);
            Ok(RespValue::integer(next))
        }
        Some(Err(e)) => Err(e),
        None => Ok(RespValue::integer(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{handler, run};
    use super::*;

    #[test]
    fn test_hset_hget() {
        let h = handler();
        assert_eq!(run(&h, &["HSET", "h", "a", "1", "b", "2"]), RespValue::integer(2));
        assert_eq!(run(&h, &["HSET", "h", "a", "3"]), RespValue::integer(0));
        assert_eq!(run(&h, &["HGET", "h", "a"]), RespValue::bulk_string("3"));
        assert_eq!(run(&h, &["HGET", "h", "z"]), RespValue::null());
        assert_eq!(run(&h, &["HGET", "nope", "a"]), RespValue::null());
        assert_eq!(run(&h, &["HLEN", "h"]), RespValue::integer(2));
        assert!(run(&h, &["HSET", "h", "a", "1", "b"]).is_error());
    }

    #[test]
    fn test_hsetnx_hmset_hmget() {
        let h = handler();
        assert_eq!(run(&h, &["HSETNX", "h", "a", "1"]), RespValue::integer(1));
        assert_eq!(run(&h, &["HSETNX", "h", "a", "2"]), RespValue::integer(0));
        assert_eq!(run(&h, &["HMSET", "h", "b", "2", "c", "3"]), RespValue::ok());
        assert_eq!(
            run(&h, &["HMGET", "h", "a", "x", "c"]),
            RespValue::array(vec![
                RespValue::bulk_string("1"),
                RespValue::null(),
                RespValue::bulk_string("3"),
            ])
        );
        assert_eq!(
            run(&h, &["HMGET", "missing", "a"]),
            RespValue::array(vec![RespValue::null()])
        );
    }

    #[test]
    fn test_hdel_removes_empty_hash() {
        let h = handler();
        run(&h, &["HSET", "h", "a", "1", "b", "2"]);
        assert_eq!(run(&h, &["HDEL", "h", "a", "z"]), RespValue::integer(1));
        assert_eq!(run(&h, &["HEXISTS", "h", "a"]), RespValue::integer(0));
        assert_eq!(run(&h, &["HDEL", "h", "b"]), RespValue::integer(1));
        assert_eq!(run(&h, &["EXISTS", "h"]), RespValue::integer(0));
    }

    #[test]
    fn test_hgetall_keys_vals() {
        let h = handler();
        run(&h, &["HSET", "h", "f", "v"]);
        assert_eq!(
            run(&h, &["HGETALL", "h"]),
            RespValue::array(vec![RespValue::bulk_string("f"), RespValue::bulk_string("v")])
        );
        assert_eq!(run(&h, &["HKEYS", "h"]), RespValue::array(vec![RespValue::bulk_string("f")]));
        assert_eq!(run(&h, &["HVALS", "h"]), RespValue::array(vec![RespValue::bulk_string("v")]));
        assert_eq!(run(&h, &["HGETALL", "none"]), RespValue::array(vec![]));
    }

    #[test]
    fn test_hincrby() {
        let h = handler();
        assert_eq!(run(&h, &["HINCRBY", "h", "n", "5"]), RespValue::integer(5));
        assert_eq!(run(&h, &["HINCRBY", "h", "n", "-7"]), RespValue::integer(-2));
        run(&h, &["HSET", "h", "s", "abc"]);
        assert!(run(&h, &["HINCRBY", "h", "s", "1"]).is_error());
        assert!(run(&h, &["HINCRBY", "h", "n", "x"]).is_error());
        run(&h, &["HSET", "h", "big", &i64::MAX.to_string()]);
        assert!(run(&h, &["HINCRBY", "h", "big", "1"]).is_error());
    }

    #[test]
    fn test_wrong_type() {
        let h = handler();
        run(&h, &["SET", "s", "v"]);
        assert!(run(&h, &["HGET", "s", "a"]).is_error());
        assert!(run(&h, &["HSET", "s", "a", "1"]).is_error());
    }
}
