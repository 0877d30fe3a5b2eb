//! Server and connection-level commands.

use super::router::{command_names, CommandSpec};
use super::{CommandError, CommandHandler, CommandResult};
use crate::aof::AofState;
use crate::protocol::RespValue;
use bytes::Bytes;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

pub(super) static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("ping", -1, ping),
    CommandSpec::new("echo", 2, echo),
    CommandSpec::new("info", -1, info_cmd),
    CommandSpec::new("time", 1, time),
    CommandSpec::new("command", -1, command),
    CommandSpec::new("bgrewriteaof", 1, bgrewriteaof),
    CommandSpec::new("quit", -1, quit),
];

fn ping(_: &CommandHandler, args: &[Bytes]) -> CommandResult {
    match args {
        [] => Ok(RespValue::pong()),
        [message] => Ok(RespValue::bulk_string(message.clone())),
        _ => Err(CommandError::WrongArity("ping".to_string())),
    }
}

fn echo(_: &CommandHandler, args: &[Bytes]) -> CommandResult {
    Ok(RespValue::bulk_string(args[0].clone()))
}

/// `INFO [section]`. Sections: server, stats, persistence, keyspace.
fn info_cmd(ctx: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let wanted = match args {
        [] => None,
        [section] => Some(String::from_utf8_lossy(section).to_ascii_lowercase()),
        _ => return Err(CommandError::Syntax),
    };
    let include = |name: &str| match wanted.as_deref() {
        None | Some("all") | Some("everything") | Some("default") => true,
        Some(section) => section == name,
    };

    let db = ctx.engine();
    let stats = db.stats();
    let mut out = String::new();

    if include("server") {
        let _ = write!(
            out,
            "# Server\r\n\
             rivetkv_version:{}\r\n\
             os:{}\r\n\
             process_id:{}\r\n\
             uptime_in_seconds:{}\r\n\
             \r\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::process::id(),
            ctx.uptime_secs(),
        );
    }
    if include("stats") {
        let _ = write!(
            out,
            "# Stats\r\n\
             total_commands_processed:{}\r\n\
             get_ops:{}\r\n\
             set_ops:{}\r\n\
             del_ops:{}\r\n\
             expired_keys:{}\r\n\
             dict_capacity:{}\r\n\
             dict_rehashing:{}\r\n\
             \r\n",
            ctx.processed(),
            stats.get_ops,
            stats.set_ops,
            stats.del_ops,
            stats.expired,
            stats.capacity,
            stats.rehashing as u8,
        );
    }
    if include("persistence") {
        let (state, appended) = match db.aof() {
            Some(aof) => (aof.state(), aof.appended()),
            None => (AofState::Disabled, 0),
        };
        let _ = write!(
            out,
            "# Persistence\r\n\
             aof_enabled:{}\r\n\
             aof_state:{}\r\n\
             aof_rewrite_in_progress:{}\r\n\
             aof_appended_records:{}\r\n\
             \r\n",
            (state != AofState::Disabled) as u8,
            state.as_str(),
            (state == AofState::Rewriting) as u8,
            appended,
        );
    }
    if include("keyspace") {
        let _ = write!(out, "# Keyspace\r\n");
        if stats.keys > 0 {
            let _ = write!(
                out,
                "db0:keys={},expires={}\r\n",
                stats.keys, stats.volatile_keys
            );
        }
    }

    Ok(RespValue::bulk_string(Bytes::from(out)))
}

fn time(_: &CommandHandler, _: &[Bytes]) -> CommandResult {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    Ok(RespValue::array(vec![
        RespValue::bulk_string(Bytes::from(now.as_secs().to_string())),
        RespValue::bulk_string(Bytes::from(now.subsec_micros().to_string())),
    ]))
}

/// `COMMAND` lists every command name; `COMMAND COUNT` returns how many.
fn command(_: &CommandHandler, args: &[Bytes]) -> CommandResult {
    let names = command_names();
    match args {
        [] => Ok(RespValue::bulk_array(
            names.into_iter().map(|n| Bytes::from_static(n.as_bytes())),
        )),
        [sub] if sub.eq_ignore_ascii_case(b"count") => Ok(RespValue::integer(names.len() as i64)),
        _ => Err(CommandError::Syntax),
    }
}

fn bgrewriteaof(ctx: &CommandHandler, _: &[Bytes]) -> CommandResult {
    let aof = ctx
        .engine()
        .aof()
        .ok_or_else(|| CommandError::Other("AOF is not enabled".to_string()))?;
    aof.start_rewrite()?;
    info!("Background AOF rewrite requested");
    Ok(RespValue::simple_string(
        "Background append only file rewriting started",
    ))
}

/// The connection layer closes the socket after this reply is written.
fn quit(_: &CommandHandler, _: &[Bytes]) -> CommandResult {
    Ok(RespValue::ok())
}
