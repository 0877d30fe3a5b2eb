//! Keyspace and expiration commands.

use super::args::{deadline_after, parse_int};
use super::router::CommandSpec;
use super::{propagate, CommandError, CommandHandler, CommandResult};
use crate::aof::make_expire_cmd;
use crate::protocol::RespValue;
use crate::storage::expiry::from_unix_millis;
use bytes::Bytes;
use std::time::SystemTime;

pub(super) static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("del", -2, del),
    CommandSpec::new("exists", -2, exists),
    CommandSpec::new("type", 2, type_of),
    CommandSpec::new("rename", 3, rename),
    CommandSpec::new("renamenx", 3, renamenx),
    CommandSpec::new("expire", 3, expire),
    CommandSpec::new("pexpire", 3, pexpire),
    CommandSpec::new("expireat", 3, expireat),
    CommandSpec::new("pexpireat", 3, pexpireat),
    CommandSpec::new("ttl", 2, ttl),
    CommandSpec::new("pttl", 2, pttl),
    CommandSpec::new("persist", 2, persist),
    CommandSpec::new("keys", 2, keys),
    CommandSpec::new("flushdb", -1, flushdb),
    CommandSpec::new("flushall", -1, flushdb),
    CommandSpec::new("dbsize", 1, dbsize),
];

fn del(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().locks(args);
    let removed = db.removes(args);
    if removed > 0 {
        propagate(db, "DEL", args);
    }
    Ok(RespValue::integer(removed as i64))
}

/// EXISTS key [key ...]. A key named twice counts twice.
fn exists(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlocks(args);
    let count = args.iter().filter(|key| db.exists(key)).count();
    Ok(RespValue::integer(count as i64))
}

fn type_of(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    Ok(RespValue::simple_string(db.type_of(&args[0]).unwrap_or("none")))
}

/// Moves `src` to `dst` with its deadline. Caller holds both key locks.
fn move_key(ctx: &CommandHandler, src: &Bytes, dst: &Bytes, only_if_absent: bool) -> Result<bool, CommandError> {
    let db = ctx.engine();
    let entity = db.get(src).ok_or(CommandError::NoSuchKey)?;
    if src == dst {
        return Ok(!only_if_absent);
    }
    if only_if_absent && db.exists(dst) {
        return Ok(false);
    }

    let deadline = db.expire_at(src);
    db.remove(src);
    db.put(dst.clone(), entity);
    db.persist(dst);
    if let Some(at) = deadline {
        db.expire(dst, at);
    }
    Ok(true)
}

fn rename(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().locks(args);
    if move_key(ctx, &args[0], &args[1], false)? {
        propagate(db, "RENAME", args);
    }
    Ok(RespValue::ok())
}

fn renamenx(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().locks(args);
    let moved = move_key(ctx, &args[0], &args[1], true)?;
    if moved {
        propagate(db, "RENAME", args);
    }
    Ok(RespValue::integer(moved as i64))
}

/// Applies an absolute deadline. A deadline already past deletes the key.
fn expire_key(ctx: &CommandHandler, key: &Bytes, at: SystemTime) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(key);
    if !db.exists(key) {
        return Ok(RespValue::integer(0));
    }
    if at <= SystemTime::now() {
        db.remove(key);
        propagate(db, "DEL", std::slice::from_ref(key));
    } else {
        db.expire(key, at);
        db.add_aof(&make_expire_cmd(key, at));
    }
    Ok(RespValue::integer(1))
}

/// EXPIRE key seconds
fn expire(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let at = deadline_after(parse_int(&args[1])?, 1000, "expire")?;
    expire_key(ctx, &args[0], at)
}

/// PEXPIRE key milliseconds
fn pexpire(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let at = deadline_after(parse_int(&args[1])?, 1, "pexpire")?;
    expire_key(ctx, &args[0], at)
}

/// EXPIREAT key unix-seconds
fn expireat(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let millis = parse_int(&args[1])?
        .checked_mul(1000)
        .ok_or(CommandError::InvalidExpire("expireat"))?;
    expire_key(ctx, &args[0], from_unix_millis(millis))
}

/// PEXPIREAT key unix-milliseconds
fn pexpireat(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let millis = parse_int(&args[1])?;
    expire_key(ctx, &args[0], from_unix_millis(millis))
}

/// TTL key: -2 if missing, -1 without a deadline.
fn ttl(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    Ok(RespValue::integer(db.ttl(&args[0]).unwrap_or(-2)))
}

fn pttl(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    Ok(RespValue::integer(db.pttl(&args[0]).unwrap_or(-2)))
}

fn persist(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let cleared = db.persist(&args[0]);
    if cleared {
        propagate(db, "PERSIST", args);
    }
    Ok(RespValue::integer(cleared as i64))
}

fn keys(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    Ok(RespValue::bulk_array(ctx.engine().keys(&args[0])))
}

/// FLUSHDB / FLUSHALL. Holds every key lock so the log sees the flush
/// between whole commands.
fn flushdb(ctx: &CommandHandler, _args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock_all();
    db.flush();
    propagate(db, "FLUSHDB", &[]);
    Ok(RespValue::ok())
}

fn dbsize(ctx: &CommandHandler, _args: &[Bytes]) -> CommandResult {
    Ok(RespValue::integer(ctx.engine().len() as i64))
}
