//! String commands.

use super::args::{deadline_after, is_option, parse_int};
use super::router::CommandSpec;
use super::{propagate, CommandError, CommandHandler, CommandResult};
use crate::aof::{make_cmd, make_expire_cmd};
use crate::protocol::RespValue;
use crate::storage::{DataEntity, StorageEngine};
use bytes::{Bytes, BytesMut};
use std::time::SystemTime;

pub(super) static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("get", 2, get),
    CommandSpec::new("set", -3, set),
    CommandSpec::new("setnx", 3, setnx),
    CommandSpec::new("setex", 4, setex),
    CommandSpec::new("psetex", 4, psetex),
    CommandSpec::new("getset", 3, getset),
    CommandSpec::new("mset", -3, mset),
    CommandSpec::new("msetnx", -3, msetnx),
    CommandSpec::new("mget", -2, mget),
    CommandSpec::new("incr", 2, incr),
    CommandSpec::new("incrby", 3, incrby),
    CommandSpec::new("decr", 2, decr),
    CommandSpec::new("decrby", 3, decrby),
    CommandSpec::new("append", 3, append),
    CommandSpec::new("strlen", 2, strlen),
];

/// Stores a plain string, dropping any previous deadline, and logs it.
fn store(db: &StorageEngine, key: &Bytes, value: &Bytes, deadline: Option<SystemTime>) {
    db.put(key.clone(), DataEntity::Str(value.clone()));
    match deadline {
        Some(at) => {
            db.expire(key, at);
        }
        None => {
            db.persist(key);
        }
    }
    db.add_aof(&make_cmd("SET", [key, value]));
    if let Some(at) = deadline {
        db.add_aof(&make_expire_cmd(key, at));
    }
}

fn get(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    Ok(RespValue::optional(db.get_string(&args[0])?))
}

/// SET key value [EX seconds | PX milliseconds] [NX | XX]
fn set(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let (key, value) = (&args[0], &args[1]);

    let mut deadline = None;
    let (mut nx, mut xx) = (false, false);
    let mut i = 2;
    while i < args.len() {
        let opt = &args[i];
        if is_option(opt, "NX") {
            nx = true;
        } else if is_option(opt, "XX") {
            xx = true;
        } else if is_option(opt, "EX") || is_option(opt, "PX") {
            if deadline.is_some() {
                return Err(CommandError::Syntax);
            }
            let amount = parse_int(args.get(i + 1).ok_or(CommandError::Syntax)?)?;
            if amount <= 0 {
                return Err(CommandError::InvalidExpire("set"));
            }
            let unit = if is_option(opt, "EX") { 1000 } else { 1 };
            deadline = Some(deadline_after(amount, unit, "set")?);
            i += 1;
        } else {
            return Err(CommandError::Syntax);
        }
        i += 1;
    }
    if nx && xx {
        return Err(CommandError::Syntax);
    }

    let _guard = db.locks().lock(key);
    let exists = db.exists(key);
    if (nx && exists) || (xx && !exists) {
        return Ok(RespValue::Null);
    }
    store(db, key, value, deadline);
    Ok(RespValue::ok())
}

fn setnx(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    if db.exists(&args[0]) {
        return Ok(RespValue::integer(0));
    }
    store(db, &args[0], &args[1], None);
    Ok(RespValue::integer(1))
}

fn set_with_ttl(ctx: &CommandHandler, args: &[Bytes], unit_ms: i64, name: &'static str) -> CommandResult {
    let db = ctx.engine();
    let amount = parse_int(&args[1])?;
    if amount <= 0 {
        return Err(CommandError::InvalidExpire(name));
    }
    let at = deadline_after(amount, unit_ms, name)?;

    let _guard = db.locks().lock(&args[0]);
    store(db, &args[0], &args[2], Some(at));
    Ok(RespValue::ok())
}

/// SETEX key seconds value
fn setex(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    set_with_ttl(ctx, args, 1000, "setex")
}

/// PSETEX key milliseconds value
fn psetex(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    set_with_ttl(ctx, args, 1, "psetex")
}

fn getset(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let old = db.get_string(&args[0])?;
    store(db, &args[0], &args[1], None);
    Ok(RespValue::optional(old))
}

fn pairs(args: &[Bytes], name: &str) -> Result<Vec<Bytes>, CommandError> {
    if args.len() % 2 != 0 {
        return Err(CommandError::WrongArity(name.to_string()));
    }
    Ok(args.iter().step_by(2).cloned().collect())
}

fn mset_locked(db: &StorageEngine, args: &[Bytes]) {
    for pair in args.chunks(2) {
        db.put(pair[0].clone(), DataEntity::Str(pair[1].clone()));
        db.persist(&pair[0]);
    }
    propagate(db, "MSET", args);
}

/// MSET key value [key value ...]
fn mset(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let keys = pairs(args, "mset")?;
    let _guard = db.locks().locks(&keys);
    mset_locked(db, args);
    Ok(RespValue::ok())
}

/// MSETNX key value [key value ...]: all or nothing.
fn msetnx(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let keys = pairs(args, "msetnx")?;
    let _guard = db.locks().locks(&keys);
    if keys.iter().any(|key| db.exists(key)) {
        return Ok(RespValue::integer(0));
    }
    mset_locked(db, args);
    Ok(RespValue::integer(1))
}

/// MGET key [key ...]. Keys holding other types read as nil.
fn mget(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlocks(args);
    let values = args
        .iter()
        .map(|key| RespValue::optional(db.get_string(key).ok().flatten()))
        .collect();
    Ok(RespValue::Array(values))
}

fn incr_by(ctx: &CommandHandler, key: &Bytes, delta: i64, name: &'static str, logged: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(key);
    let current = match db.get_string(key)? {
        Some(raw) => parse_int(&raw)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(CommandError::Overflow)?;
    // The deadline, if any, survives.
    db.put(key.clone(), DataEntity::Str(Bytes::from(next.to_string())));
    propagate(db, name, logged);
    Ok(RespValue::integer(next))
}

fn incr(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    incr_by(ctx, &args[0], 1, "INCR", args)
}

fn incrby(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let delta = parse_int(&args[1])?;
    incr_by(ctx, &args[0], delta, "INCRBY", args)
}

fn decr(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    incr_by(ctx, &args[0], -1, "DECR", args)
}

fn decrby(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let delta = parse_int(&args[1])?
        .checked_neg()
        .ok_or(CommandError::Overflow)?;
    incr_by(ctx, &args[0], delta, "DECRBY", args)
}

fn append(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let key = &args[0];
    let _guard = db.locks().lock(key);

    let mut value = BytesMut::new();
    if let Some(current) = db.get_string(key)? {
        value.extend_from_slice(&current);
    }
    value.extend_from_slice(&args[1]);
    let len = value.len();
    db.put(key.clone(), DataEntity::Str(value.freeze()));
    propagate(db, "APPEND", args);
    Ok(RespValue::integer(len as i64))
}

fn strlen(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let len = db.get_string(&args[0])?.map_or(0, |value| value.len());
    Ok(RespValue::integer(len as i64))
}
