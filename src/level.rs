//! Log levels and record types understood by the transport.
//!
//! Both enums carry the single-byte codes used on the wire and in client
//! configuration files (`0` is the most severe level).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a level or log type cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised {kind}: {value}")]
pub struct ParseLevelError {
    kind: &'static str,
    value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Default for Level {
    fn default() -> Self {
        Level::Info
    }
}

impl Level {
    /// Wire code of the level.
    pub const fn code(self) -> u8 {
        match self {
            Level::Error => 0,
            Level::Warn => 1,
            Level::Info => 2,
            Level::Debug => 3,
        }
    }

    /// Severity rank where larger is more severe (`debug` = 0, `error` = 3).
    pub const fn severity(self) -> i32 {
        3 - self.code() as i32
    }

    /// Returns `true` when `self` is at least as severe as `threshold`.
    pub fn at_least(self, threshold: Level) -> bool {
        self.severity() >= threshold.severity()
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        level.code()
    }
}

impl TryFrom<u8> for Level {
    type Error = ParseLevelError;

    fn try_from(code: u8) -> Result<Self, ParseLevelError> {
        match code {
            0 => Ok(Level::Error),
            1 => Ok(Level::Warn),
            2 => Ok(Level::Info),
            3 => Ok(Level::Debug),
            other => Err(ParseLevelError {
                kind: "level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        };
        f.write_str(s)
    }
}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            _ => Err(ParseLevelError {
                kind: "level",
                value: s.to_owned(),
            }),
        }
    }
}

/// Kind of record: ordinary log line or audit entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogType {
    #[default]
    Log,
    Audit,
}

impl From<LogType> for u8 {
    fn from(kind: LogType) -> Self {
        match kind {
            LogType::Log => 0,
            LogType::Audit => 1,
        }
    }
}

impl TryFrom<u8> for LogType {
    type Error = ParseLevelError;

    fn try_from(code: u8) -> Result<Self, ParseLevelError> {
        match code {
            0 => Ok(LogType::Log),
            1 => Ok(LogType::Audit),
            other => Err(ParseLevelError {
                kind: "log type",
                value: other.to_string(),
            }),
        }
    }
}
