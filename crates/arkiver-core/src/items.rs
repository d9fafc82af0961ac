//! Decoded chain items and the dispatch envelope.
//!
//! Items arrive from the RPC/decoding boundary already decoded where
//! possible: a `None` payload means the decoding library could not match
//! the item against any known ABI, and the router skips it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::key::DispatchKey;

/// Normalize an address for comparison and storage (lowercase hex).
pub fn normalize_address(addr: &str) -> String {
    addr.to_ascii_lowercase()
}

/// A decoded event or function payload: name, canonical signature, and
/// argument values keyed by argument name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedPayload {
    pub name: String,
    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub signature: String,
    pub args: BTreeMap<String, serde_json::Value>,
}

impl DecodedPayload {
    pub fn arg(&self, name: &str) -> Option<&serde_json::Value> {
        self.args.get(name)
    }
}

/// A log emitted by a contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogItem {
    /// Emitting contract address.
    pub address: String,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: u32,
    pub log_index: u32,
    /// Decoded event, or `None` if the decoder could not match it.
    pub event: Option<DecodedPayload>,
    /// Transaction receipt, attached when the owning source requested it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<serde_json::Value>,
}

/// A call trace targeting a watched contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTraceItem {
    pub from: String,
    /// Called contract address.
    pub to: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub tx_index: u32,
    pub trace_index: u32,
    /// Decoded function call, or `None` if the decoder could not match it.
    pub function: Option<DecodedPayload>,
}

/// A transaction touching a watched account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionItem {
    pub hash: String,
    pub from: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    /// Native value transferred, as a decimal string.
    pub value: String,
    pub block_number: u64,
    pub tx_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<serde_json::Value>,
}

/// A native value transfer (top-level or internal via trace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub from: String,
    pub to: String,
    /// Native value transferred, as a decimal string.
    pub value: String,
    pub block_number: u64,
    pub tx_index: u32,
    pub trace_index: u32,
}

/// A block header — enough to order work and verify the parent-hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockItem {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl BlockItem {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockItem) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

/// Everything retrieved for one chunk of blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkData {
    /// Block headers, ascending. Must cover every block in the chunk range.
    pub blocks: Vec<BlockItem>,
    pub logs: Vec<LogItem>,
    pub traces: Vec<CallTraceItem>,
    pub transactions: Vec<TransactionItem>,
    pub transfers: Vec<TransferItem>,
}

impl ChunkData {
    /// Sort all item categories into canonical per-block dispatch order.
    pub fn sort(&mut self) {
        self.blocks.sort_by_key(|b| b.number);
        self.logs
            .sort_by_key(|l| (l.block_number, l.tx_index, l.log_index));
        self.traces
            .sort_by_key(|t| (t.block_number, t.tx_index, t.trace_index));
        self.transactions
            .sort_by_key(|t| (t.block_number, t.tx_index));
        self.transfers
            .sort_by_key(|t| (t.block_number, t.tx_index, t.trace_index));
    }
}

/// One deliverable unit: a decoded item bound to the transformer that
/// should receive it, carrying the coordinates used for ordering and
/// idempotency checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub key: DispatchKey,
    pub chain: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_index: u32,
    pub log_index: u32,
    /// Decoded payload handed to the transformer.
    pub payload: serde_json::Value,
}
