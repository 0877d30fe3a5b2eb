use crate::aof::AofError;
use crate::protocol::RespValue;
use crate::storage::WrongType;
use thiserror::Error;

/// Why a command was rejected. The `Display` form is the error line sent
/// to the client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    WrongType(#[from] WrongType),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR min or max is not a float")]
    InvalidBorder,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR index out of range")]
    OutOfRange,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),

    #[error("ERR resulting score is not a number (NaN)")]
    NanScore,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR {0}")]
    Other(String),
}

impl From<AofError> for CommandError {
    fn from(e: AofError) -> Self {
        match e {
            AofError::RewriteInProgress => CommandError::Other(e.to_string()),
            other => CommandError::Other(format!("AOF: {}", other)),
        }
    }
}

impl From<CommandError> for RespValue {
    fn from(e: CommandError) -> Self {
        RespValue::Error(e.to_string())
    }
}

pub type CommandResult = Result<RespValue, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_lines() {
        assert_eq!(
            RespValue::from(CommandError::from(WrongType)),
            RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
        );
        assert_eq!(
            CommandError::WrongArity("get".into()).to_string(),
            "ERR wrong number of arguments for 'get' command"
        );
        assert_eq!(
            CommandError::from(AofError::RewriteInProgress).to_string(),
            "ERR Background append only file rewriting already in progress"
        );
    }
}
