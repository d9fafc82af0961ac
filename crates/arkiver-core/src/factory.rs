//! Factory resolver — expands contract address sets from creation events.
//!
//! For every contract watch with a factory reference, the resolver carries
//! a discovery filter (parent addresses + creation-event signature + block
//! range). The discovery pass for a chunk runs strictly before that chunk's
//! classification pass, and applies the whole chunk's discoveries as one
//! batch, so the router never observes a partially-updated address set and
//! an address created and used within the same block still matches.

use tracing::{debug, warn};

use crate::config::BlockBound;
use crate::items::{normalize_address, LogItem};
use crate::watch::{AddressArena, WatchKind, WatchSpec};

/// The discovery filter for one factory-bearing watch spec.
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    /// Owning source name — discoveries land in the arena under this key.
    pub source: String,
    /// Factory (parent) addresses, lowercase.
    pub addresses: Vec<String>,
    pub event_signature: String,
    /// Creation-event argument carrying the child address.
    pub parameter: String,
    pub start_block: BlockBound,
    pub end_block: BlockBound,
}

impl DiscoveryFilter {
    fn in_range(&self, block: u64) -> bool {
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
}

/// Observes factory creation events and grows the address arena.
#[derive(Debug, Clone, Default)]
pub struct FactoryResolver {
    filters: Vec<DiscoveryFilter>,
}

impl FactoryResolver {
    /// Collect discovery filters from the chain's resolved watch specs.
    pub fn new(specs: &[WatchSpec]) -> Self {
        let filters = specs
            .iter()
            .filter_map(|spec| match &spec.kind {
                WatchKind::Contract(c) => c.factory.as_ref().map(|f| DiscoveryFilter {
                    source: spec.name.clone(),
                    addresses: f.addresses.clone(),
                    event_signature: f.event_signature.clone(),
                    parameter: f.parameter.clone(),
                    start_block: f.start_block,
                    end_block: f.end_block,
                }),
                _ => None,
            })
            .collect();
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the discovery pass over one chunk's logs (sorted ascending).
    ///
    /// Returns the number of newly discovered addresses. Mutations land in
    /// the arena before any caller classifies the same range, which keeps
    /// the published address set consistent per chunk.
    pub fn apply(&self, logs: &[LogItem], arena: &mut AddressArena) -> usize {
        if self.filters.is_empty() {
            return 0;
        }

        let mut discovered = 0;
        for log in logs {
            let address = normalize_address(&log.address);
            for filter in &self.filters {
                if !filter.in_range(log.block_number)
                    || !filter.addresses.iter().any(|a| *a == address)
                {
                    continue;
                }
                let Some(event) = &log.event else {
                    debug!(
                        block = log.block_number,
                        log_index = log.log_index,
                        "skipping undecodable log during discovery"
                    );
                    continue;
                };
                if event.signature != filter.event_signature {
                    continue;
                }
                match event.arg(&filter.parameter).and_then(|v| v.as_str()) {
                    Some(child) => {
                        if arena.insert(&filter.source, child.to_string(), log.block_number) {
                            debug!(
                                source = %filter.source,
                                child,
                                block = log.block_number,
                                "factory child discovered"
                            );
                            discovered += 1;
                        }
                    }
                    None => warn!(
                        source = %filter.source,
                        parameter = %filter.parameter,
                        block = log.block_number,
                        "creation event missing child address argument"
                    ),
                }
            }
        }
        discovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::DecodedPayload;
    use crate::watch::{ContractWatch, ResolvedFactory};
    use std::collections::BTreeMap;

    fn factory_spec() -> WatchSpec {
        WatchSpec {
            name: "Pool".into(),
            chain: "testnet".into(),
            kind: WatchKind::Contract(ContractWatch {
                static_addresses: vec![],
                factory: Some(ResolvedFactory {
                    addresses: vec!["0xff".into()],
                    event_name: "Created".into(),
                    event_signature: "Created(address)".into(),
                    parameter: "child".into(),
                    start_block: BlockBound::Number(0),
                    end_block: BlockBound::Latest,
                }),
                filters: vec![],
                include_transaction_receipts: false,
                include_call_traces: false,
            }),
            start_block: BlockBound::Number(0),
            end_block: BlockBound::Latest,
        }
    }

    fn created_log(block: u64, child: &str) -> LogItem {
        let mut args = BTreeMap::new();
        args.insert("child".to_string(), serde_json::json!(child));
        LogItem {
            address: "0xFF".into(),
            block_number: block,
            block_hash: format!("0x{block}"),
            tx_hash: "0xt".into(),
            tx_index: 0,
            log_index: 0,
            event: Some(DecodedPayload {
                name: "Created".into(),
                signature: "Created(address)".into(),
                args,
            }),
            receipt: None,
        }
    }

    #[test]
    fn discovers_child_at_creation_block() {
        let specs = vec![factory_spec()];
        let resolver = FactoryResolver::new(&specs);
        let mut arena = AddressArena::new();

        let n = resolver.apply(&[created_log(10, "0xAA")], &mut arena);
        assert_eq!(n, 1);
        assert!(arena.active_at("Pool", "0xaa", 10));
        assert!(!arena.active_at("Pool", "0xaa", 9));
    }

    #[test]
    fn ignores_logs_from_other_addresses() {
        let specs = vec![factory_spec()];
        let resolver = FactoryResolver::new(&specs);
        let mut arena = AddressArena::new();

        let mut log = created_log(10, "0xAA");
        log.address = "0xDEAD".into();
        assert_eq!(resolver.apply(&[log], &mut arena), 0);
        assert!(arena.is_empty());
    }

    #[test]
    fn ignores_logs_outside_factory_range() {
        let mut spec = factory_spec();
        if let WatchKind::Contract(c) = &mut spec.kind {
            let f = c.factory.as_mut().unwrap();
            f.start_block = BlockBound::Number(5);
            f.end_block = BlockBound::Number(20);
        }
        let resolver = FactoryResolver::new(&[spec]);
        let mut arena = AddressArena::new();

        assert_eq!(resolver.apply(&[created_log(4, "0xAA")], &mut arena), 0);
        assert_eq!(resolver.apply(&[created_log(21, "0xBB")], &mut arena), 0);
        assert_eq!(resolver.apply(&[created_log(5, "0xCC")], &mut arena), 1);
    }

    #[test]
    fn signature_mismatch_not_discovered() {
        let specs = vec![factory_spec()];
        let resolver = FactoryResolver::new(&specs);
        let mut arena = AddressArena::new();

        let mut log = created_log(10, "0xAA");
        log.event.as_mut().unwrap().signature = "Created(address,uint256)".into();
        assert_eq!(resolver.apply(&[log], &mut arena), 0);
    }
}
