//! Set commands.

use super::router::CommandSpec;
use super::{propagate, CommandHandler, CommandResult};
use crate::protocol::RespValue;
use crate::storage::{DataEntity, StorageEngine, WrongType};
use bytes::Bytes;
use std::collections::HashSet;

type Set = HashSet<Bytes>;

pub(super) static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("sadd", -3, sadd),
    CommandSpec::new("srem", -3, srem),
    CommandSpec::new("sismember", 3, sismember),
    CommandSpec::new("scard", 2, scard),
    CommandSpec::new("smembers", 2, smembers),
    CommandSpec::new("sinter", -2, sinter),
    CommandSpec::new("sinterstore", -3, sinterstore),
    CommandSpec::new("sunion", -2, sunion),
    CommandSpec::new("sunionstore", -3, sunionstore),
    CommandSpec::new("sdiff", -2, sdiff),
    CommandSpec::new("sdiffstore", -3, sdiffstore),
];

fn sadd(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let added = db
        .update_as(&args[0], true, |set: &mut Set| {
            args[1..].iter().filter(|m| set.insert((*m).clone())).count()
        })?
        .unwrap_or(0);
    if added > 0 {
        propagate(db, "SADD", args);
    }
    Ok(RespValue::integer(added as i64))
}

fn srem(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let removed = db
        .update_as(&args[0], false, |set: &mut Set| {
            args[1..].iter().filter(|m| set.remove(*m)).count()
        })?
        .unwrap_or(0);
    if removed > 0 {
        propagate(db, "SREM", args);
    }
    Ok(RespValue::integer(removed as i64))
}

fn sismember(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let found = db
        .read_as(&args[0], |set: &Set| set.contains(&args[1]))?
        .unwrap_or(false);
    Ok(RespValue::integer(found as i64))
}

fn scard(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let len = db.read_as(&args[0], |set: &Set| set.len())?.unwrap_or(0);
    Ok(RespValue::integer(len as i64))
}

fn smembers(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let members = db
        .read_as(&args[0], |set: &Set| set.iter().cloned().collect::<Vec<_>>())?
        .unwrap_or_default();
    Ok(RespValue::bulk_array(members))
}

#[derive(Clone, Copy)]
enum SetOp {
    Inter,
    Union,
    Diff,
}

/// Combines the sets under `keys`. Missing keys are empty sets. Caller
/// holds the key locks.
fn combine(db: &StorageEngine, keys: &[Bytes], op: SetOp) -> Result<Set, WrongType> {
    let mut result: Option<Set> = None;
    for key in keys {
        let members = db
            .read_as(key, |set: &Set| set.clone())?
            .unwrap_or_default();
        result = Some(match (result, op) {
            (None, _) => members,
            (Some(acc), SetOp::Inter) => acc.into_iter().filter(|m| members.contains(m)).collect(),
            (Some(mut acc), SetOp::Union) => {
                acc.extend(members);
                acc
            }
            (Some(acc), SetOp::Diff) => acc.into_iter().filter(|m| !members.contains(m)).collect(),
        });
        // An intersection with an empty set stays empty.
        if matches!(op, SetOp::Inter) && result.as_ref().map_or(false, Set::is_empty) {
            break;
        }
    }
    Ok(result.unwrap_or_default())
}

fn read_combined(ctx: &CommandHandler, args: &[Bytes], op: SetOp) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlocks(args);
    Ok(RespValue::bulk_array(combine(db, args, op)?))
}

/// `*STORE destination key [key ...]`: replaces the destination with the
/// result and returns its size. An empty result deletes the destination.
fn store_combined(ctx: &CommandHandler, args: &[Bytes], op: SetOp, name: &'static str) -> CommandResult {
    let db = ctx.engine();
    let (dst, sources) = (&args[0], &args[1..]);
    let _guard = db.locks().rw_locks(std::slice::from_ref(dst), sources);

    let result = combine(db, sources, op)?;
    let size = result.len();
    let existed = db.remove(dst);
    if !result.is_empty() {
        db.put(dst.clone(), DataEntity::Set(result));
    }
    if existed || size > 0 {
        propagate(db, name, args);
    }
    Ok(RespValue::integer(size as i64))
}

fn sinter(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    read_combined(ctx, args, SetOp::Inter)
}

fn sinterstore(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    store_combined(ctx, args, SetOp::Inter, "SINTERSTORE")
}

fn sunion(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    read_combined(ctx, args, SetOp::Union)
}

fn sunionstore(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    store_combined(ctx, args, SetOp::Union, "SUNIONSTORE")
}

fn sdiff(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    read_combined(ctx, args, SetOp::Diff)
}

fn sdiffstore(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    store_combined(ctx, args, SetOp::Diff, "SDIFFSTORE")
}

#[cfg(test)]
mod tests {
    use super::super::tests::{handler, run};
    use super::*;

    fn sorted(reply: RespValue) -> Vec<String> {
        let mut members: Vec<String> = reply
            .into_array()
            .unwrap()
            .iter()
            .map(|m| m.as_str().unwrap().to_string())
            .collect();
        members.sort();
        members
    }

    #[test]
    fn test_sadd_srem() {
        let h = handler();
        assert_eq!(run(&h, &["SADD", "s", "a", "b", "a"]), RespValue::integer(2));
        assert_eq!(run(&h, &["SADD", "s", "b"]), RespValue::integer(0));
        assert_eq!(run(&h, &["SCARD", "s"]), RespValue::integer(2));
        assert_eq!(run(&h, &["SISMEMBER", "s", "a"]), RespValue::integer(1));
        assert_eq!(run(&h, &["SISMEMBER", "s", "z"]), RespValue::integer(0));
        assert_eq!(sorted(run(&h, &["SMEMBERS", "s"])), vec!["a", "b"]);

        assert_eq!(run(&h, &["SREM", "s", "a", "z"]), RespValue::integer(1));
        assert_eq!(run(&h, &["SREM", "s", "b"]), RespValue::integer(1));
        assert_eq!(run(&h, &["EXISTS", "s"]), RespValue::integer(0));
    }

    #[test]
    fn test_set_algebra() {
        let h = handler();
        run(&h, &["SADD", "a", "1", "2", "3"]);
        run(&h, &["SADD", "b", "2", "3", "4"]);

        assert_eq!(sorted(run(&h, &["SINTER", "a", "b"])), vec!["2", "3"]);
        assert_eq!(sorted(run(&h, &["SUNION", "a", "b"])), vec!["1", "2", "3", "4"]);
        assert_eq!(sorted(run(&h, &["SDIFF", "a", "b"])), vec!["1"]);
        assert!(sorted(run(&h, &["SINTER", "a", "missing"])).is_empty());
        assert_eq!(sorted(run(&h, &["SDIFF", "a", "missing"])), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_store_variants() {
        let h = handler();
        run(&h, &["SADD", "a", "1", "2"]);
        run(&h, &["SADD", "b", "2", "3"]);

        assert_eq!(run(&h, &["SUNIONSTORE", "dst", "a", "b"]), RespValue::integer(3));
        assert_eq!(run(&h, &["SCARD", "dst"]), RespValue::integer(3));

        // Destination may also be a source.
        assert_eq!(run(&h, &["SINTERSTORE", "dst", "dst", "a"]), RespValue::integer(2));
        assert_eq!(sorted(run(&h, &["SMEMBERS", "dst"])), vec!["1", "2"]);

        assert_eq!(run(&h, &["SDIFFSTORE", "dst", "a", "a"]), RespValue::integer(0));
        assert_eq!(run(&h, &["EXISTS", "dst"]), RespValue::integer(0));
    }

    #[test]
    fn test_wrong_type() {
        let h = handler();
        run(&h, &["SET", "str", "v"]);
        run(&h, &["SADD", "s", "1"]);
        assert!(run(&h, &["SADD", "str", "1"]).is_error());
        assert!(run(&h, &["SINTER", "s", "str"]).is_error());
    }
}
