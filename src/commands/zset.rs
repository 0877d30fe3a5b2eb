//! Sorted set commands.
//!
//! Ranks in requests and replies are 0-based. Score borders accept
//! `-inf`/`+inf` and a `(` prefix for exclusive bounds.

use super::args::{format_score, is_option, normalize_range, parse_float, parse_int};
use super::router::CommandSpec;
use super::{propagate, CommandError, CommandHandler, CommandResult};
use crate::protocol::RespValue;
use crate::storage::{Element, ScoreBorder, SortedSet};
use bytes::Bytes;

pub(super) static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("zadd", -4, zadd),
    CommandSpec::new("zscore", 3, zscore),
    CommandSpec::new("zincrby", 4, zincrby),
    CommandSpec::new("zrank", 3, zrank),
    CommandSpec::new("zrevrank", 3, zrevrank),
    CommandSpec::new("zcard", 2, zcard),
    CommandSpec::new("zcount", 4, zcount),
    CommandSpec::new("zrange", -4, zrange),
    CommandSpec::new("zrevrange", -4, zrevrange),
    CommandSpec::new("zrangebyscore", -4, zrangebyscore),
    CommandSpec::new("zrevrangebyscore", -4, zrevrangebyscore),
    CommandSpec::new("zrem", -3, zrem),
    CommandSpec::new("zremrangebyrank", 4, zremrangebyrank),
    CommandSpec::new("zremrangebyscore", 4, zremrangebyscore),
];

fn parse_border(raw: &[u8]) -> Result<ScoreBorder, CommandError> {
    ScoreBorder::parse(raw).ok_or(CommandError::InvalidBorder)
}

fn elements_reply(elements: Vec<Element>, with_scores: bool) -> RespValue {
    let mut items = Vec::with_capacity(elements.len() * if with_scores { 2 } else { 1 });
    for element in elements {
        items.push(element.member);
        if with_scores {
            items.push(Bytes::from(format_score(element.score)));
        }
    }
    RespValue::bulk_array(items)
}

/// `ZADD key score member [score member ...]`. Every score is validated
/// before anything is written.
fn zadd(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let pairs = &args[1..];
    if pairs.len() % 2 != 0 {
        return Err(CommandError::Syntax);
    }
    let scored = pairs
        .chunks_exact(2)
        .map(|pair| -> Result<(f64, Bytes), CommandError> {
            Ok((parse_float(&pair[0])?, pair[1].clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let (added, rescored) = db
        .update_as(&args[0], true, |zset: &mut SortedSet| {
            let (mut added, mut rescored) = (0usize, 0usize);
            for (score, member) in scored {
                let previous = zset.score(&member);
                if zset.add(member, score) {
                    added += 1;
                } else if previous != Some(score) {
                    rescored += 1;
                }
            }
            (added, rescored)
        })?
        .unwrap_or((0, 0));
    if added + rescored > 0 {
        propagate(db, "ZADD", args);
    }
    Ok(RespValue::integer(added as i64))
}

fn zscore(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let score = db
        .read_as(&args[0], |zset: &SortedSet| zset.score(&args[1]))?
        .flatten();
    Ok(RespValue::optional(score.map(|s| Bytes::from(format_score(s)))))
}

fn zincrby(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let delta = parse_float(&args[1])?;
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let result = db.update_as(&args[0], true, |zset: &mut SortedSet| {
        let next = zset.score(&args[2]).unwrap_or(0.0) + delta;
        if next.is_nan() {
            return Err(CommandError::NanScore);
        }
        zset.add(args[2].clone(), next);
        Ok(next)
    })?;
    match result {
        Some(Ok(score)) => {
            propagate(db, "ZINCRBY", args);
            Ok(RespValue::bulk_string(format_score(score)))
        }
        Some(Err(e)) => Err(e),
        None => Ok(RespValue::null()),
    }
}

fn rank(ctx: &CommandHandler, args: &[Bytes], desc: bool) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let rank = db
        .read_as(&args[0], |zset: &SortedSet| zset.rank(&args[1], desc))?
        .flatten();
    Ok(rank.map_or_else(RespValue::null, |r| RespValue::integer(r as i64)))
}

fn zrank(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    rank(ctx, args, false)
}

fn zrevrank(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    rank(ctx, args, true)
}

fn zcard(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let len = db.read_as(&args[0], |zset: &SortedSet| zset.len())?.unwrap_or(0);
    Ok(RespValue::integer(len as i64))
}

fn zcount(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let min = parse_border(&args[1])?;
    let max = parse_border(&args[2])?;
    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let count = db
        .read_as(&args[0], |zset: &SortedSet| zset.count(&min, &max))?
        .unwrap_or(0);
    Ok(RespValue::integer(count as i64))
}

fn range(ctx: &CommandHandler, args: &[Bytes], desc: bool) -> CommandResult {
    let start = parse_int(&args[1])?;
    let stop = parse_int(&args[2])?;
    let with_scores = match &args[3..] {
        [] => false,
        [opt] if is_option(opt, "WITHSCORES") => true,
        _ => return Err(CommandError::Syntax),
    };

    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let elements = db
        .read_as(&args[0], |zset: &SortedSet| {
            match normalize_range(start, stop, zset.len()) {
                Some((start, stop)) => zset.range_by_rank(start, stop, desc),
                None => Vec::new(),
            }
        })?
        .unwrap_or_default();
    Ok(elements_reply(elements, with_scores))
}

fn zrange(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    range(ctx, args, false)
}

fn zrevrange(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    range(ctx, args, true)
}

/// `min max [WITHSCORES] [LIMIT offset count]`; the reversed form takes
/// `max min`. A negative count means no limit.
fn range_by_score(ctx: &CommandHandler, args: &[Bytes], desc: bool) -> CommandResult {
    let (min, max) = if desc {
        (parse_border(&args[2])?, parse_border(&args[1])?)
    } else {
        (parse_border(&args[1])?, parse_border(&args[2])?)
    };

    let mut with_scores = false;
    let mut offset = 0i64;
    let mut limit: Option<usize> = None;
    let mut i = 3;
    while i < args.len() {
        if is_option(&args[i], "WITHSCORES") {
            with_scores = true;
            i += 1;
        } else if is_option(&args[i], "LIMIT") && i + 2 < args.len() {
            offset = parse_int(&args[i + 1])?;
            let count = parse_int(&args[i + 2])?;
            limit = (count >= 0).then_some(count as usize);
            i += 3;
        } else {
            return Err(CommandError::Syntax);
        }
    }
    if offset < 0 {
        return Ok(RespValue::array(vec![]));
    }

    let db = ctx.engine();
    let _guard = db.locks().rlock(&args[0]);
    let elements = db
        .read_as(&args[0], |zset: &SortedSet| {
            zset.range_by_score(&min, &max, offset as usize, limit, desc)
        })?
        .unwrap_or_default();
    Ok(elements_reply(elements, with_scores))
}

fn zrangebyscore(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    range_by_score(ctx, args, false)
}

fn zrevrangebyscore(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    range_by_score(ctx, args, true)
}

fn zrem(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let removed = db
        .update_as(&args[0], false, |zset: &mut SortedSet| {
            args[1..].iter().filter(|m| zset.remove(m)).count()
        })?
        .unwrap_or(0);
    if removed > 0 {
        propagate(db, "ZREM", args);
    }
    Ok(RespValue::integer(removed as i64))
}

fn zremrangebyrank(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let start = parse_int(&args[1])?;
    let stop = parse_int(&args[2])?;
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let removed = db
        .update_as(&args[0], false, |zset: &mut SortedSet| {
            match normalize_range(start, stop, zset.len()) {
                Some((start, stop)) => zset.remove_range_by_rank(start, stop),
                None => 0,
            }
        })?
        .unwrap_or(0);
    if removed > 0 {
        propagate(db, "ZREMRANGEBYRANK", args);
    }
    Ok(RespValue::integer(removed as i64))
}

fn zremrangebyscore(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let min = parse_border(&args[1])?;
    let max = parse_border(&args[2])?;
    let db = ctx.engine();
    let _guard = db.locks().lock(&args[0]);
    let removed = db
        .update_as(&args[0], false, |zset: &mut SortedSet| {
            zset.remove_range_by_score(&min, &max)
        })?
        .unwrap_or(0);
    if removed > 0 {
        propagate(db, "ZREMRANGEBYSCORE", args);
    }
    Ok(RespValue::integer(removed as i64))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{handler, logged_handler, run};
    use super::*;

    fn members(reply: RespValue) -> Vec<String> {
        reply
            .into_array()
            .unwrap()
            .iter()
            .map(|m| m.as_str().unwrap().to_string())
            .collect()
    }

    fn seeded() -> CommandHandler {
        let h = handler();
        run(&h, &["ZADD", "z", "1", "a", "2", "b", "3", "c", "4", "d"]);
        h
    }

    #[test]
    fn test_zadd_logs_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (h, aof) = logged_handler(&dir);

        assert_eq!(run(&h, &["ZADD", "z", "1", "a", "2", "b"]), RespValue::integer(2));
        assert_eq!(aof.appended(), 1);
        assert_eq!(run(&h, &["ZADD", "z", "1", "a", "2", "b"]), RespValue::integer(0));
        assert_eq!(aof.appended(), 1);
        assert_eq!(run(&h, &["ZADD", "z", "1", "a", "5", "b"]), RespValue::integer(0));
        assert_eq!(aof.appended(), 2);
        aof.shutdown();
    }

    #[test]
    fn test_zadd_and_score() {
        let h = handler();
        assert_eq!(run(&h, &["ZADD", "z", "1", "a", "2", "b"]), RespValue::integer(2));
        assert_eq!(run(&h, &["ZADD", "z", "5", "a"]), RespValue::integer(0));
        assert_eq!(run(&h, &["ZSCORE", "z", "a"]), RespValue::bulk_string("5"));
        assert_eq!(run(&h, &["ZSCORE", "z", "x"]), RespValue::null());
        assert_eq!(run(&h, &["ZCARD", "z"]), RespValue::integer(2));

        // A bad score anywhere rejects the whole command.
        assert!(run(&h, &["ZADD", "z", "1", "n", "oops", "m"]).is_error());
        assert_eq!(run(&h, &["ZCARD", "z"]), RespValue::integer(2));
        assert!(run(&h, &["ZADD", "z", "1", "a", "2"]).is_error());
    }

    #[test]
    fn test_zincrby() {
        let h = handler();
        assert_eq!(run(&h, &["ZINCRBY", "z", "2.5", "m"]), RespValue::bulk_string("2.5"));
        assert_eq!(run(&h, &["ZINCRBY", "z", "-1", "m"]), RespValue::bulk_string("1.5"));
        run(&h, &["ZADD", "z", "inf", "top"]);
        assert_eq!(
            run(&h, &["ZINCRBY", "z", "-inf", "top"]),
            RespValue::error("ERR resulting score is not a number (NaN)")
        );
        assert_eq!(run(&h, &["ZSCORE", "z", "top"]), RespValue::bulk_string("inf"));
    }

    #[test]
    fn test_rank() {
        let h = seeded();
        assert_eq!(run(&h, &["ZRANK", "z", "a"]), RespValue::integer(0));
        assert_eq!(run(&h, &["ZRANK", "z", "d"]), RespValue::integer(3));
        assert_eq!(run(&h, &["ZREVRANK", "z", "d"]), RespValue::integer(0));
        assert_eq!(run(&h, &["ZRANK", "z", "x"]), RespValue::null());
        assert_eq!(run(&h, &["ZRANK", "none", "x"]), RespValue::null());
    }

    #[test]
    fn test_zrange() {
        let h = seeded();
        assert_eq!(members(run(&h, &["ZRANGE", "z", "0", "-1"])), ["a", "b", "c", "d"]);
        assert_eq!(members(run(&h, &["ZRANGE", "z", "1", "2"])), ["b", "c"]);
        assert_eq!(members(run(&h, &["ZREVRANGE", "z", "0", "1"])), ["d", "c"]);
        assert_eq!(
            members(run(&h, &["ZRANGE", "z", "-1", "-1", "WITHSCORES"])),
            ["d", "4"]
        );
        assert!(members(run(&h, &["ZRANGE", "z", "5", "10"])).is_empty());
        assert!(run(&h, &["ZRANGE", "z", "0", "1", "BOGUS"]).is_error());
    }

    #[test]
    fn test_range_by_score() {
        let h = seeded();
        assert_eq!(members(run(&h, &["ZRANGEBYSCORE", "z", "2", "3"])), ["b", "c"]);
        assert_eq!(members(run(&h, &["ZRANGEBYSCORE", "z", "(2", "+inf"])), ["c", "d"]);
        assert_eq!(
            members(run(&h, &["ZRANGEBYSCORE", "z", "-inf", "+inf", "LIMIT", "1", "2"])),
            ["b", "c"]
        );
        assert_eq!(
            members(run(&h, &["ZRANGEBYSCORE", "z", "-inf", "+inf", "LIMIT", "2", "-1"])),
            ["c", "d"]
        );
        assert_eq!(
            members(run(&h, &["ZREVRANGEBYSCORE", "z", "3", "(1", "WITHSCORES"])),
            ["c", "3", "b", "2"]
        );
        assert_eq!(
            run(&h, &["ZRANGEBYSCORE", "z", "x", "1"]),
            RespValue::error("ERR min or max is not a float")
        );
    }

    #[test]
    fn test_zcount() {
        let h = seeded();
        assert_eq!(run(&h, &["ZCOUNT", "z", "2", "3"]), RespValue::integer(2));
        assert_eq!(run(&h, &["ZCOUNT", "z", "(1", "(4"]), RespValue::integer(2));
        assert_eq!(run(&h, &["ZCOUNT", "none", "-inf", "+inf"]), RespValue::integer(0));
    }

    #[test]
    fn test_removals() {
        let h = seeded();
        assert_eq!(run(&h, &["ZREM", "z", "a", "x"]), RespValue::integer(1));
        assert_eq!(run(&h, &["ZREMRANGEBYRANK", "z", "0", "0"]), RespValue::integer(1));
        assert_eq!(members(run(&h, &["ZRANGE", "z", "0", "-1"])), ["c", "d"]);
        assert_eq!(run(&h, &["ZREMRANGEBYSCORE", "z", "-inf", "+inf"]), RespValue::integer(2));
        assert_eq!(run(&h, &["EXISTS", "z"]), RespValue::integer(0));
    }
}
