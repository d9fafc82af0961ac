//! Dispatch keys — the routing identity of every transformer.
//!
//! Canonical string forms:
//! - `Source:Event`                    contract event
//! - `Source.Function`                 call trace (requires `include_call_traces`)
//! - `Source:transaction:from|to`      account transaction by direction
//! - `Source:transfer:from|to`         account native transfer by direction
//! - `Source:block`                    block sample
//! - `Source:setup`                    reserved, runs once before the
//!                                     source's first dispatched item

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

/// Direction of an account match relative to the watched address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    From,
    To,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From => f.write_str("from"),
            Self::To => f.write_str("to"),
        }
    }
}

/// Identifies exactly one registered transformer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DispatchKey {
    Event { source: String, event: String },
    Call { source: String, function: String },
    Transaction { source: String, direction: Direction },
    Transfer { source: String, direction: Direction },
    Block { source: String },
    Setup { source: String },
}

impl DispatchKey {
    /// The source name this key belongs to.
    pub fn source(&self) -> &str {
        match self {
            Self::Event { source, .. }
            | Self::Call { source, .. }
            | Self::Transaction { source, .. }
            | Self::Transfer { source, .. }
            | Self::Block { source }
            | Self::Setup { source } => source,
        }
    }

    pub fn event(source: impl Into<String>, event: impl Into<String>) -> Self {
        Self::Event {
            source: source.into(),
            event: event.into(),
        }
    }

    pub fn setup(source: impl Into<String>) -> Self {
        Self::Setup {
            source: source.into(),
        }
    }

    /// Parse the canonical string form of a key.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDispatchKey {
            key: s.to_string(),
            reason: reason.to_string(),
        };

        // `Source.Function` — the dot form is only used for call traces.
        if let Some(dot) = s.find('.') {
            if s.contains(':') {
                return Err(invalid("mixed ':' and '.' separators"));
            }
            let (source, function) = (&s[..dot], &s[dot + 1..]);
            if source.is_empty() || function.is_empty() {
                return Err(invalid("empty source or function name"));
            }
            return Ok(Self::Call {
                source: source.to_string(),
                function: function.to_string(),
            });
        }

        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [source, tail] if !source.is_empty() && !tail.is_empty() => {
                let source = source.to_string();
                Ok(match *tail {
                    "setup" => Self::Setup { source },
                    "block" => Self::Block { source },
                    event => Self::Event {
                        source,
                        event: event.to_string(),
                    },
                })
            }
            [source, kind, dir] if !source.is_empty() => {
                let direction = match *dir {
                    "from" => Direction::From,
                    "to" => Direction::To,
                    _ => return Err(invalid("direction must be 'from' or 'to'")),
                };
                let source = source.to_string();
                match *kind {
                    "transaction" => Ok(Self::Transaction { source, direction }),
                    "transfer" => Ok(Self::Transfer { source, direction }),
                    _ => Err(invalid("expected 'transaction' or 'transfer'")),
                }
            }
            _ => Err(invalid("expected 'Source:Event', 'Source.Function', \
                              'Source:transaction:from', 'Source:transfer:to', \
                              'Source:block', or 'Source:setup'")),
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event { source, event } => write!(f, "{source}:{event}"),
            Self::Call { source, function } => write!(f, "{source}.{function}"),
            Self::Transaction { source, direction } => {
                write!(f, "{source}:transaction:{direction}")
            }
            Self::Transfer { source, direction } => write!(f, "{source}:transfer:{direction}"),
            Self::Block { source } => write!(f, "{source}:block"),
            Self::Setup { source } => write!(f, "{source}:setup"),
        }
    }
}
