//! Error types for the arkiver pipeline.

use thiserror::Error;

/// Configuration errors. All of these are fatal at startup — a config that
/// fails validation never produces a partial run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("source '{source_name}' references undeclared chain '{chain}'")]
    UnknownChain { source_name: String, chain: String },

    #[error("source '{source_name}': start block {start} is after end block {end}")]
    InvalidRange {
        source_name: String,
        start: u64,
        end: u64,
    },

    #[error("source '{source_name}': ABI has no event named '{event}'")]
    UnknownEvent { source_name: String, event: String },

    #[error("source '{source_name}': ABI has no function named '{function}'")]
    UnknownFunction { source_name: String, function: String },

    #[error("source '{source_name}': event name '{event}' is overloaded; use the full signature")]
    AmbiguousEvent { source_name: String, event: String },

    #[error(
        "source '{source_name}': function name '{function}' is overloaded; use the full signature"
    )]
    AmbiguousFunction { source_name: String, function: String },

    #[error("factory for '{source_name}': event '{event}' has no parameter named '{parameter}'")]
    UnknownFactoryParameter {
        source_name: String,
        event: String,
        parameter: String,
    },

    #[error("source '{source_name}': filter on event '{event}' names unknown argument '{argument}'")]
    UnknownFilterArgument {
        source_name: String,
        event: String,
        argument: String,
    },

    #[error("transformer key '{key}' is not a valid dispatch key: {reason}")]
    InvalidDispatchKey { key: String, reason: String },

    #[error("transformer key '{key}' references undeclared source '{source_name}'")]
    UnknownSource { key: String, source_name: String },

    #[error("duplicate transformer registered for dispatch key '{key}'")]
    DuplicateTransformer { key: String },

    #[error("missing {what}")]
    Missing { what: String },
}

/// Errors that can occur while a chain pipeline is running.
///
/// Only `Rpc` is retryable; `Reorg` is recoverable (rollback + resume);
/// `Decode` skips the offending item; everything else is fatal for the
/// chain it occurred on. A fatal error on one chain never aborts others.
#[derive(Debug, Error)]
pub enum ArkiveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("RPC error on chain '{chain}': {reason}")]
    Rpc { chain: String, reason: String },

    #[error("decode error at block {block}: {reason}")]
    Decode { block: u64, reason: String },

    #[error("handler '{key}' failed at block {block} on chain '{chain}': {reason}")]
    Handler {
        chain: String,
        block: u64,
        key: String,
        reason: String,
    },

    #[error("reorg on chain '{chain}': detected at block {detected_at}, common ancestor {ancestor}")]
    Reorg {
        chain: String,
        detected_at: u64,
        ancestor: u64,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("chain '{chain}' aborted: {reason}")]
    Aborted { chain: String, reason: String },
}

impl ArkiveError {
    /// Returns `true` if the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }

    /// Returns `true` if the error is a reorg (recoverable).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::Reorg { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_name_the_offending_source() {
        let err = ConfigError::UnknownChain {
            source_name: "Usdc".into(),
            chain: "mainnet".into(),
        };
        assert_eq!(
            err.to_string(),
            "source 'Usdc' references undeclared chain 'mainnet'"
        );

        let err: ArkiveError = ConfigError::InvalidRange {
            source_name: "Usdc".into(),
            start: 100,
            end: 50,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "source 'Usdc': start block 100 is after end block 50"
        );
    }

    #[test]
    fn classification() {
        let rpc = ArkiveError::Rpc {
            chain: "testnet".into(),
            reason: "timeout".into(),
        };
        assert!(rpc.is_retryable());
        assert!(!rpc.is_reorg());

        let reorg = ArkiveError::Reorg {
            chain: "testnet".into(),
            detected_at: 56,
            ancestor: 50,
        };
        assert!(reorg.is_reorg());
        assert!(!reorg.is_retryable());
    }
}
