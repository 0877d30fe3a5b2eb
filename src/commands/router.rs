//! The command table.
//!
//! Built once on first use and never modified afterwards, so lookups need
//! no synchronization.

use super::handler::CommandHandler;
use super::{hash, keys, list, server, set, string, zset, CommandResult};
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Handlers get the arguments after the command name.
pub(crate) type Handler = fn(&CommandHandler, &[Bytes]) -> CommandResult;

/// One entry of the command table.
pub struct CommandSpec {
    /// Lower-case command name
    pub name: &'static str,
    /// Positive: exact argument count including the name. Negative: at
    /// least `-arity`.
    pub arity: i32,
    pub(crate) handler: Handler,
}

impl CommandSpec {
    pub(crate) const fn new(name: &'static str, arity: i32, handler: Handler) -> Self {
        Self {
            name,
            arity,
            handler,
        }
    }

    /// Whether `argc` (including the name) satisfies the arity.
    pub fn accepts(&self, argc: usize) -> bool {
        let argc = argc as i32;
        if self.arity >= 0 {
            argc == self.arity
        } else {
            argc >= -self.arity
        }
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

static COMMAND_TABLE: Lazy<HashMap<&'static str, &'static CommandSpec>> = Lazy::new(|| {
    [
        string::COMMANDS,
        keys::COMMANDS,
        list::COMMANDS,
        set::COMMANDS,
        hash::COMMANDS,
        zset::COMMANDS,
        server::COMMANDS,
    ]
    .into_iter()
    .flatten()
    .map(|spec| (spec.name, spec))
    .collect()
});

/// Finds a command by name, case-insensitively.
pub fn lookup(name: &[u8]) -> Option<&'static CommandSpec> {
    let name = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
    COMMAND_TABLE.get(name.as_str()).copied()
}

/// Every registered command name, sorted.
pub fn command_names() -> Vec<&'static str> {
    let mut names: Vec<_> = COMMAND_TABLE.keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup(b"GET").map(|c| c.name), Some("get"));
        assert_eq!(lookup(b"zRangeByScore").map(|c| c.name), Some("zrangebyscore"));
        assert!(lookup(b"nosuch").is_none());
        assert!(lookup(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn test_arity() {
        let get = lookup(b"get").unwrap();
        assert!(get.accepts(2));
        assert!(!get.accepts(3));

        let del = lookup(b"del").unwrap();
        assert!(!del.accepts(1));
        assert!(del.accepts(2));
        assert!(del.accepts(10));
    }

    #[test]
    fn test_no_duplicate_names() {
        let total: usize = [
            string::COMMANDS,
            keys::COMMANDS,
            list::COMMANDS,
            set::COMMANDS,
            hash::COMMANDS,
            zset::COMMANDS,
            server::COMMANDS,
        ]
        .iter()
        .map(|table| table.len())
        .sum();
        assert_eq!(command_names().len(), total);
    }
}
