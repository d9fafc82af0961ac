//! Declarative configuration: chains, sources, and their filters.
//!
//! This is the static input to the engine. It is normalized into per-chain
//! [`crate::watch::WatchSpec`]s by [`crate::registry::resolve`] and never
//! mutated afterwards.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::abi::Abi;

// ─── Chains ───────────────────────────────────────────────────────────────────

/// One declared chain. Every source's `chain` reference must name an entry
/// in [`ArkiveConfig::chains`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Numeric chain id (e.g. 1 for Ethereum mainnet).
    pub id: u64,
    /// One or more RPC endpoints.
    pub rpc: RpcEndpoints,
    /// Live-mode polling interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval_ms: Option<u64>,
}

/// A single endpoint or a list of fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcEndpoints {
    Single(String),
    Many(Vec<String>),
}

impl RpcEndpoints {
    pub fn primary(&self) -> Option<&str> {
        match self {
            Self::Single(url) => Some(url.as_str()),
            Self::Many(urls) => urls.first().map(String::as_str),
        }
    }
}

// ─── Block bounds ─────────────────────────────────────────────────────────────

/// A block-range bound: a concrete number or `"latest"`.
///
/// As a start bound, `Latest` means "the head at startup". As an end bound
/// it means open-ended — re-evaluated each chunk, the watch never completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockBound {
    Number(u64),
    Latest,
}

impl Serialize for BlockBound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_u64(*n),
            Self::Latest => serializer.serialize_str("latest"),
        }
    }
}

impl<'de> Deserialize<'de> for BlockBound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundVisitor;

        impl Visitor<'_> for BoundVisitor {
            type Value = BlockBound;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a block number or the string \"latest\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<BlockBound, E> {
                Ok(BlockBound::Number(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<BlockBound, E> {
                u64::try_from(v)
                    .map(BlockBound::Number)
                    .map_err(|_| E::custom("block number must be non-negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<BlockBound, E> {
                if v == "latest" {
                    Ok(BlockBound::Latest)
                } else {
                    Err(E::custom(format!("unknown block bound '{v}'")))
                }
            }
        }

        deserializer.deserialize_any(BoundVisitor)
    }
}

// ─── Addresses ────────────────────────────────────────────────────────────────

/// A single address or a list of addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Addresses {
    Single(String),
    Many(Vec<String>),
}

impl Addresses {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            Self::Single(a) => std::slice::from_ref(a).iter().map(String::as_str),
            Self::Many(list) => list[..].iter().map(String::as_str),
        }
    }
}

/// A factory reference: the parent contract(s) whose creation event
/// announces new child addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factory {
    /// Address(es) of the factory contract.
    pub address: Addresses,
    /// Name (or full signature) of the creation event.
    pub event: String,
    /// Name of the event parameter that carries the child address.
    pub parameter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockBound>,
}

/// Fixed address(es) or a factory to discover them at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressSpec {
    Factory(Factory),
    Static(Addresses),
}

// ─── Filters ──────────────────────────────────────────────────────────────────

/// An event filter: the event to watch plus optional indexed-argument
/// value constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilterSpec {
    /// Event name or full signature (required for overloaded names).
    pub event: String,
    /// Argument name → expected value. An item matches only if every
    /// listed argument decodes to the given value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, serde_json::Value>,
}

impl EventFilterSpec {
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            event: name.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }
}

// ─── Chain binding ────────────────────────────────────────────────────────────

/// Which chain(s) a source is bound to. The per-chain form carries field
/// overrides that take precedence over the source's top-level values;
/// unspecified fields inherit the top-level value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainBinding<O> {
    Single(String),
    PerChain(BTreeMap<String, O>),
}

impl<O> ChainBinding<O> {
    /// Expand into `(chain name, overrides)` pairs.
    pub fn bindings(&self) -> Vec<(&str, Option<&O>)> {
        match self {
            Self::Single(name) => vec![(name.as_str(), None)],
            Self::PerChain(map) => map.iter().map(|(k, v)| (k.as_str(), Some(v))).collect(),
        }
    }
}

// ─── Sources ──────────────────────────────────────────────────────────────────

/// A contract watch target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSource {
    pub abi: Abi,
    pub chain: ChainBinding<ContractOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressSpec>,
    /// Events to watch. Empty means every decodable event of the ABI.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<EventFilterSpec>,
    #[serde(default)]
    pub include_transaction_receipts: bool,
    #[serde(default)]
    pub include_call_traces: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockBound>,
}

/// Per-chain overrides for a contract source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<EventFilterSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_transaction_receipts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_call_traces: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockBound>,
}

/// An account watch target (transactions and native transfers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSource {
    pub chain: ChainBinding<AccountOverrides>,
    /// Address(es) to watch. Required for accounts.
    pub address: Addresses,
    #[serde(default)]
    pub include_transaction_receipts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockBound>,
}

/// Per-chain overrides for an account source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addresses>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_transaction_receipts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockBound>,
}

/// A block sampling target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSource {
    pub chain: ChainBinding<BlockOverrides>,
    /// Sample every `interval` blocks. Defaults to 1 (every block).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockBound>,
}

/// Per-chain overrides for a block source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockBound>,
}

/// All declared sources, keyed by source name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contracts: BTreeMap<String, ContractSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<String, AccountSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blocks: BTreeMap<String, BlockSource>,
}

impl Sources {
    /// Returns `true` if a source of any kind is declared under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
            || self.accounts.contains_key(name)
            || self.blocks.contains_key(name)
    }
}

/// The full declarative configuration consumed by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArkiveConfig {
    #[serde(default)]
    pub chains: BTreeMap<String, ChainConfig>,
    #[serde(default)]
    pub sources: Sources,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_bound_roundtrip() {
        let n: BlockBound = serde_json::from_str("42").unwrap();
        assert_eq!(n, BlockBound::Number(42));
        let l: BlockBound = serde_json::from_str("\"latest\"").unwrap();
        assert_eq!(l, BlockBound::Latest);
        assert_eq!(serde_json::to_string(&l).unwrap(), "\"latest\"");
        assert!(serde_json::from_str::<BlockBound>("\"pending\"").is_err());
    }

    #[test]
    fn address_spec_untagged() {
        let single: AddressSpec = serde_json::from_str("\"0xAB\"").unwrap();
        assert!(matches!(single, AddressSpec::Static(Addresses::Single(_))));

        let factory: AddressSpec = serde_json::from_value(serde_json::json!({
            "address": "0xFF",
            "event": "Created",
            "parameter": "child",
        }))
        .unwrap();
        assert!(matches!(factory, AddressSpec::Factory(_)));
    }

    #[test]
    fn config_from_json() {
        let cfg: ArkiveConfig = serde_json::from_value(serde_json::json!({
            "chains": {
                "testnet": { "id": 1337, "rpc": "http://localhost:8545" }
            },
            "sources": {
                "contracts": {
                    "Usdc": {
                        "abi": { "events": [], "functions": [] },
                        "chain": "testnet",
                        "start_block": 0
                    }
                }
            }
        }))
        .unwrap();
        assert_eq!(cfg.chains["testnet"].id, 1337);
        assert!(cfg.sources.contains("Usdc"));
    }
}
