//! Event router — matches decoded items against the effective watch specs
//! and computes the dispatch keys identifying which transformer runs.
//!
//! One raw item may yield several envelopes (e.g. a transfer log matching
//! both a contract event filter and an account transfer filter); each is
//! dispatched independently. Contract events and call traces are emitted
//! under both the plain-name and full-signature key forms, so a transformer
//! may bind either (the signature form is the only unambiguous binding for
//! overloaded ABI entries). Dispatch order within a block: logs, then call
//! traces, then account items, then the block item, each category in
//! ascending transaction/log index.

use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ArkiveError;
use crate::items::{normalize_address, ChunkData, Envelope};
use crate::key::{Direction, DispatchKey};
use crate::watch::{AddressArena, ResolvedEventFilter, WatchKind, WatchSpec};

/// Classifies one chain's retrieved items.
#[derive(Debug, Clone)]
pub struct EventRouter {
    chain: String,
    chain_id: u64,
}

impl EventRouter {
    pub fn new(chain: impl Into<String>, chain_id: u64) -> Self {
        Self {
            chain: chain.into(),
            chain_id,
        }
    }

    /// Route a sorted chunk against the current watch specs, producing the
    /// envelopes for each block in dispatch order.
    ///
    /// The arena must already reflect this chunk's discovery pass.
    pub fn route(
        &self,
        chunk: &ChunkData,
        specs: &[WatchSpec],
        arena: &AddressArena,
    ) -> BTreeMap<u64, Vec<Envelope>> {
        let mut out: BTreeMap<u64, Vec<Envelope>> = BTreeMap::new();

        // Logs first.
        for log in &chunk.logs {
            for spec in specs {
                let WatchKind::Contract(watch) = &spec.kind else {
                    continue;
                };
                if !spec.in_range(log.block_number)
                    || !watch.address_active_at(&spec.name, &log.address, log.block_number, arena)
                {
                    continue;
                }
                let Some(event) = &log.event else {
                    let err = ArkiveError::Decode {
                        block: log.block_number,
                        reason: format!("no ABI match for log {} in {}", log.log_index, log.tx_hash),
                    };
                    debug!(
                        chain = %self.chain,
                        address = %log.address,
                        error = %err,
                        "skipping undecodable log"
                    );
                    continue;
                };
                if !filters_match(&watch.filters, &event.signature, &event.args) {
                    continue;
                }
                let payload = serde_json::json!({
                    "event": event.name,
                    "args": event.args,
                    "address": log.address,
                    "transactionHash": log.tx_hash,
                    "receipt": log.receipt,
                });
                // Name form and signature form; whichever is unregistered
                // drops at dispatch.
                for key in [
                    DispatchKey::event(&spec.name, &event.name),
                    DispatchKey::event(&spec.name, &event.signature),
                ] {
                    out.entry(log.block_number).or_default().push(Envelope {
                        key,
                        chain: self.chain.clone(),
                        chain_id: self.chain_id,
                        block_number: log.block_number,
                        tx_index: log.tx_index,
                        log_index: log.log_index,
                        payload: payload.clone(),
                    });
                }
            }
        }

        // Call traces.
        for trace in &chunk.traces {
            for spec in specs {
                let WatchKind::Contract(watch) = &spec.kind else {
                    continue;
                };
                if !watch.include_call_traces
                    || !spec.in_range(trace.block_number)
                    || !watch.address_active_at(&spec.name, &trace.to, trace.block_number, arena)
                {
                    continue;
                }
                let Some(function) = &trace.function else {
                    let err = ArkiveError::Decode {
                        block: trace.block_number,
                        reason: format!(
                            "no ABI match for trace {} in {}",
                            trace.trace_index, trace.tx_hash
                        ),
                    };
                    debug!(
                        chain = %self.chain,
                        address = %trace.to,
                        error = %err,
                        "skipping undecodable call trace"
                    );
                    continue;
                };
                let payload = serde_json::json!({
                    "function": function.name,
                    "args": function.args,
                    "from": trace.from,
                    "to": trace.to,
                    "transactionHash": trace.tx_hash,
                });
                for function_key in [&function.name, &function.signature] {
                    out.entry(trace.block_number).or_default().push(Envelope {
                        key: DispatchKey::Call {
                            source: spec.name.clone(),
                            function: function_key.clone(),
                        },
                        chain: self.chain.clone(),
                        chain_id: self.chain_id,
                        block_number: trace.block_number,
                        tx_index: trace.tx_index,
                        log_index: trace.trace_index,
                        payload: payload.clone(),
                    });
                }
            }
        }

        // Account transactions, then account transfers.
        for tx in &chunk.transactions {
            for spec in specs {
                let WatchKind::Account(watch) = &spec.kind else {
                    continue;
                };
                if !spec.in_range(tx.block_number) {
                    continue;
                }
                let payload = serde_json::json!({
                    "hash": tx.hash,
                    "from": tx.from,
                    "to": tx.to,
                    "value": tx.value,
                    "receipt": tx.receipt,
                });
                let from = normalize_address(&tx.from);
                let to = tx.to.as_deref().map(normalize_address);
                for (member, direction) in [
                    (watch.addresses.contains(&from), Direction::From),
                    (
                        to.as_ref().map(|a| watch.addresses.contains(a)).unwrap_or(false),
                        Direction::To,
                    ),
                ] {
                    if member {
                        out.entry(tx.block_number).or_default().push(Envelope {
                            key: DispatchKey::Transaction {
                                source: spec.name.clone(),
                                direction,
                            },
                            chain: self.chain.clone(),
                            chain_id: self.chain_id,
                            block_number: tx.block_number,
                            tx_index: tx.tx_index,
                            log_index: 0,
                            payload: payload.clone(),
                        });
                    }
                }
            }
        }

        for transfer in &chunk.transfers {
            for spec in specs {
                let WatchKind::Account(watch) = &spec.kind else {
                    continue;
                };
                if !spec.in_range(transfer.block_number) {
                    continue;
                }
                let payload = serde_json::json!({
                    "from": transfer.from,
                    "to": transfer.to,
                    "value": transfer.value,
                });
                let from = normalize_address(&transfer.from);
                let to = normalize_address(&transfer.to);
                for (member, direction) in [
                    (watch.addresses.contains(&from), Direction::From),
                    (watch.addresses.contains(&to), Direction::To),
                ] {
                    if member {
                        out.entry(transfer.block_number).or_default().push(Envelope {
                            key: DispatchKey::Transfer {
                                source: spec.name.clone(),
                                direction,
                            },
                            chain: self.chain.clone(),
                            chain_id: self.chain_id,
                            block_number: transfer.block_number,
                            tx_index: transfer.tx_index,
                            log_index: transfer.trace_index,
                            payload: payload.clone(),
                        });
                    }
                }
            }
        }

        // Block items last.
        for block in &chunk.blocks {
            for spec in specs {
                let WatchKind::Block(watch) = &spec.kind else {
                    continue;
                };
                if !spec.in_range(block.number) {
                    continue;
                }
                let anchor = spec.start_number();
                if (block.number - anchor) % watch.interval != 0 {
                    continue;
                }
                out.entry(block.number).or_default().push(Envelope {
                    key: DispatchKey::Block {
                        source: spec.name.clone(),
                    },
                    chain: self.chain.clone(),
                    chain_id: self.chain_id,
                    block_number: block.number,
                    tx_index: u32::MAX,
                    log_index: u32::MAX,
                    payload: serde_json::json!({
                        "number": block.number,
                        "hash": block.hash,
                        "timestamp": block.timestamp,
                    }),
                });
            }
        }

        out
    }
}

/// Returns `true` if the decoded payload passes the spec's filters.
/// No filters means every decodable event matches.
fn filters_match(
    filters: &[ResolvedEventFilter],
    signature: &str,
    args: &BTreeMap<String, serde_json::Value>,
) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|f| {
        f.signature == signature && f.args.iter().all(|(name, want)| args.get(name) == Some(want))
    })
}
