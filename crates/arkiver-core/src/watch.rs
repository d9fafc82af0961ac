//! Resolved watch specs and the factory-discovered address arena.
//!
//! A [`WatchSpec`] is the per-chain, post-merge view of one declared source.
//! All fields are fixed at resolution time except the factory-discovered
//! address set, which lives in the chain's [`AddressArena`] and grows as
//! creation events are observed. The arena is mutated only by the factory
//! resolver; the router reads it through snapshot-at-block queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::config::BlockBound;
use crate::items::normalize_address;

// ─── WatchSpec ────────────────────────────────────────────────────────────────

/// The resolved view of one source on one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSpec {
    /// Declared source name.
    pub name: String,
    /// Chain this spec watches.
    pub chain: String,
    pub kind: WatchKind,
    pub start_block: BlockBound,
    pub end_block: BlockBound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatchKind {
    Contract(ContractWatch),
    Account(AccountWatch),
    Block(BlockWatch),
}

/// Resolved contract watch: effective addresses, filters, and flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractWatch {
    /// Fixed addresses (lowercase). Empty with no factory means the spec
    /// matches any emitting address.
    pub static_addresses: Vec<String>,
    pub factory: Option<ResolvedFactory>,
    /// Effective event filters. Empty means every decodable event matches.
    pub filters: Vec<ResolvedEventFilter>,
    pub include_transaction_receipts: bool,
    pub include_call_traces: bool,
}

/// A factory reference with its creation event resolved to a signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedFactory {
    /// Factory (parent) contract addresses, lowercase.
    pub addresses: Vec<String>,
    pub event_name: String,
    pub event_signature: String,
    /// Creation-event argument carrying the child address.
    pub parameter: String,
    pub start_block: BlockBound,
    pub end_block: BlockBound,
}

/// An event filter with its event resolved to a signature, so overloaded
/// names are unambiguous at match time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEventFilter {
    pub event: String,
    pub signature: String,
    /// Argument name → required value. Empty means any arguments match.
    pub args: BTreeMap<String, serde_json::Value>,
}

/// Resolved account watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountWatch {
    /// Watched addresses, lowercase. Never empty.
    pub addresses: Vec<String>,
    pub include_transaction_receipts: bool,
}

/// Resolved block watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockWatch {
    /// Sample every `interval` blocks, anchored at the start block.
    pub interval: u64,
}

impl WatchSpec {
    /// Returns `true` if `block` falls inside this spec's effective range.
    ///
    /// A `Latest` start bound only matches once the scheduler has pinned it
    /// to a concrete head block, so it matches nothing here.
    pub fn in_range(&self, block: u64) -> bool {
        let after_start = match self.start_block {
            BlockBound::Number(start) => block >= start,
            BlockBound::Latest => false,
        };
        let before_end = match self.end_block {
            BlockBound::Number(end) => block <= end,
            BlockBound::Latest => true,
        };
        after_start && before_end
    }

    /// Pin a `Latest` start bound to the given head block.
    pub fn pin_start(&mut self, head: u64) {
        if self.start_block == BlockBound::Latest {
            self.start_block = BlockBound::Number(head);
        }
        if let WatchKind::Contract(c) = &mut self.kind {
            if let Some(f) = &mut c.factory {
                if f.start_block == BlockBound::Latest {
                    f.start_block = BlockBound::Number(head);
                }
            }
        }
    }

    /// Numeric start block, once pinned. Defaults to 0 before pinning.
    pub fn start_number(&self) -> u64 {
        match self.start_block {
            BlockBound::Number(n) => n,
            BlockBound::Latest => 0,
        }
    }

    /// Numeric end block, or `None` for an open-ended watch.
    pub fn end_number(&self) -> Option<u64> {
        match self.end_block {
            BlockBound::Number(n) => Some(n),
            BlockBound::Latest => None,
        }
    }
}

impl ContractWatch {
    /// Returns `true` if `address` is in this spec's effective set at
    /// `block`: a static address (active across the spec's whole range), a
    /// factory child discovered at or before `block`, or — when neither
    /// static addresses nor a factory are declared — any address.
    pub fn address_active_at(
        &self,
        spec_name: &str,
        address: &str,
        block: u64,
        arena: &AddressArena,
    ) -> bool {
        if self.static_addresses.is_empty() && self.factory.is_none() {
            return true;
        }
        let addr = normalize_address(address);
        if self.static_addresses.iter().any(|a| *a == addr) {
            return true;
        }
        self.factory.is_some() && arena.active_at(spec_name, &addr, block)
    }
}

// ─── AddressArena ─────────────────────────────────────────────────────────────

/// A factory-discovered child address and the block it was discovered at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredAddress {
    pub address: String,
    /// Block of the creation event. The address is never active before it.
    pub block: u64,
}

/// Per-chain growable list of discovered addresses, keyed by source name.
///
/// Owned by the factory resolver's pass inside each chain pipeline; all
/// other components query it read-only via [`AddressArena::active_at`].
#[derive(Debug, Clone, Default)]
pub struct AddressArena {
    entries: HashMap<String, Vec<DiscoveredAddress>>,
}

impl AddressArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery. If the address was already discovered, the
    /// earliest discovery block wins.
    pub fn insert(&mut self, source: &str, address: String, block: u64) -> bool {
        let address = normalize_address(&address);
        let list = self.entries.entry(source.to_string()).or_default();
        if let Some(existing) = list.iter_mut().find(|d| d.address == address) {
            if block < existing.block {
                existing.block = block;
            }
            return false;
        }
        list.push(DiscoveredAddress { address, block });
        true
    }

    /// Snapshot-at-block query: was `address` discovered for `source` at
    /// or before `block`?
    pub fn active_at(&self, source: &str, address: &str, block: u64) -> bool {
        self.entries
            .get(source)
            .map(|list| {
                list.iter()
                    .any(|d| d.address == address && d.block <= block)
            })
            .unwrap_or(false)
    }

    /// All addresses for `source` active at `block`.
    pub fn addresses_at(&self, source: &str, block: u64) -> Vec<&str> {
        self.entries
            .get(source)
            .map(|list| {
                list.iter()
                    .filter(|d| d.block <= block)
                    .map(|d| d.address.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop discoveries made after `block` (reorg rollback).
    pub fn revert_after(&mut self, block: u64) {
        for list in self.entries.values_mut() {
            list.retain(|d| d.block <= block);
        }
    }

    /// Total number of discovered addresses across all sources.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
