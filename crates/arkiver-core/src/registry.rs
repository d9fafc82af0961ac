//! Source registry — resolves the declared configuration into canonical
//! per-chain watch specs.
//!
//! Resolution is pure and deterministic: the same configuration always
//! yields the same specs (before any factory expansion). Per-chain override
//! fields take precedence over a source's top-level fields; unspecified
//! fields inherit the top-level value.

use std::collections::BTreeMap;

use crate::abi::SignatureTable;
use crate::config::{
    AccountSource, AddressSpec, Addresses, ArkiveConfig, BlockBound, BlockSource, ContractSource,
    EventFilterSpec, Factory,
};
use crate::error::ConfigError;
use crate::items::normalize_address;
use crate::key::DispatchKey;
use crate::watch::{
    AccountWatch, BlockWatch, ContractWatch, ResolvedEventFilter, ResolvedFactory, WatchKind,
    WatchSpec,
};

/// Resolve a configuration into per-chain watch specs.
///
/// Fails with a [`ConfigError`] if any source references an undeclared
/// chain, a factory parameter does not exist among its event's arguments,
/// a filter names an unknown or ambiguous event, or a numeric range has
/// `start_block > end_block`.
pub fn resolve(config: &ArkiveConfig) -> Result<BTreeMap<String, Vec<WatchSpec>>, ConfigError> {
    let mut out: BTreeMap<String, Vec<WatchSpec>> = config
        .chains
        .keys()
        .map(|name| (name.clone(), Vec::new()))
        .collect();

    for (name, contract) in &config.sources.contracts {
        for spec in resolve_contract(config, name, contract)? {
            out.get_mut(&spec.chain)
                .ok_or_else(|| ConfigError::UnknownChain {
                    source_name: name.clone(),
                    chain: spec.chain.clone(),
                })?
                .push(spec);
        }
    }
    for (name, account) in &config.sources.accounts {
        for spec in resolve_account(config, name, account)? {
            out.get_mut(&spec.chain)
                .ok_or_else(|| ConfigError::UnknownChain {
                    source_name: name.clone(),
                    chain: spec.chain.clone(),
                })?
                .push(spec);
        }
    }
    for (name, blocks) in &config.sources.blocks {
        for spec in resolve_blocks(config, name, blocks)? {
            out.get_mut(&spec.chain)
                .ok_or_else(|| ConfigError::UnknownChain {
                    source_name: name.clone(),
                    chain: spec.chain.clone(),
                })?
                .push(spec);
        }
    }

    Ok(out)
}

fn check_chain(config: &ArkiveConfig, source: &str, chain: &str) -> Result<(), ConfigError> {
    if config.chains.contains_key(chain) {
        Ok(())
    } else {
        Err(ConfigError::UnknownChain {
            source_name: source.to_string(),
            chain: chain.to_string(),
        })
    }
}

fn check_range(
    source: &str,
    start: Option<BlockBound>,
    end: Option<BlockBound>,
) -> Result<(), ConfigError> {
    if let (Some(BlockBound::Number(s)), Some(BlockBound::Number(e))) = (start, end) {
        if s > e {
            return Err(ConfigError::InvalidRange {
                source_name: source.to_string(),
                start: s,
                end: e,
            });
        }
    }
    Ok(())
}

fn normalize_all(addresses: &Addresses) -> Vec<String> {
    addresses.iter().map(normalize_address).collect()
}

fn resolve_contract(
    config: &ArkiveConfig,
    name: &str,
    contract: &ContractSource,
) -> Result<Vec<WatchSpec>, ConfigError> {
    let table = SignatureTable::build(&contract.abi);
    let mut specs = Vec::new();

    for (chain, overrides) in contract.chain.bindings() {
        check_chain(config, name, chain)?;

        // Per-chain override > top-level default, field by field.
        let address = overrides
            .and_then(|o| o.address.as_ref())
            .or(contract.address.as_ref());
        let filter: &[EventFilterSpec] = overrides
            .and_then(|o| o.filter.as_deref())
            .unwrap_or(&contract.filter);
        let include_receipts = overrides
            .and_then(|o| o.include_transaction_receipts)
            .unwrap_or(contract.include_transaction_receipts);
        let include_traces = overrides
            .and_then(|o| o.include_call_traces)
            .unwrap_or(contract.include_call_traces);
        let start_block = overrides
            .and_then(|o| o.start_block)
            .or(contract.start_block);
        let end_block = overrides.and_then(|o| o.end_block).or(contract.end_block);

        check_range(name, start_block, end_block)?;

        let (static_addresses, factory) = match address {
            None => (Vec::new(), None),
            Some(AddressSpec::Static(addrs)) => (normalize_all(addrs), None),
            Some(AddressSpec::Factory(f)) => (Vec::new(), Some(resolve_factory(name, f, &table)?)),
        };

        let filters = filter
            .iter()
            .map(|f| resolve_filter(name, f, &table))
            .collect::<Result<Vec<_>, _>>()?;

        specs.push(WatchSpec {
            name: name.to_string(),
            chain: chain.to_string(),
            kind: WatchKind::Contract(ContractWatch {
                static_addresses,
                factory,
                filters,
                include_transaction_receipts: include_receipts,
                include_call_traces: include_traces,
            }),
            start_block: start_block.unwrap_or(BlockBound::Number(0)),
            end_block: end_block.unwrap_or(BlockBound::Latest),
        });
    }

    Ok(specs)
}

fn resolve_factory(
    source: &str,
    factory: &Factory,
    table: &SignatureTable,
) -> Result<ResolvedFactory, ConfigError> {
    let event = table.event(source, &factory.event)?;
    if event.input(&factory.parameter).is_none() {
        return Err(ConfigError::UnknownFactoryParameter {
            source_name: source.to_string(),
            event: event.name.clone(),
            parameter: factory.parameter.clone(),
        });
    }
    check_range(source, factory.start_block, factory.end_block)?;
    Ok(ResolvedFactory {
        addresses: normalize_all(&factory.address),
        event_name: event.name.clone(),
        event_signature: event.signature(),
        parameter: factory.parameter.clone(),
        start_block: factory.start_block.unwrap_or(BlockBound::Number(0)),
        end_block: factory.end_block.unwrap_or(BlockBound::Latest),
    })
}

fn resolve_filter(
    source: &str,
    filter: &EventFilterSpec,
    table: &SignatureTable,
) -> Result<ResolvedEventFilter, ConfigError> {
    let event = table.event(source, &filter.event)?;
    for arg in filter.args.keys() {
        if event.input(arg).is_none() {
            return Err(ConfigError::UnknownFilterArgument {
                source_name: source.to_string(),
                event: event.name.clone(),
                argument: arg.clone(),
            });
        }
    }
    Ok(ResolvedEventFilter {
        event: event.name.clone(),
        signature: event.signature(),
        args: filter.args.clone(),
    })
}

fn resolve_account(
    config: &ArkiveConfig,
    name: &str,
    account: &AccountSource,
) -> Result<Vec<WatchSpec>, ConfigError> {
    let mut specs = Vec::new();

    for (chain, overrides) in account.chain.bindings() {
        check_chain(config, name, chain)?;

        let addresses = overrides
            .and_then(|o| o.address.as_ref())
            .unwrap_or(&account.address);
        let include_receipts = overrides
            .and_then(|o| o.include_transaction_receipts)
            .unwrap_or(account.include_transaction_receipts);
        let start_block = overrides
            .and_then(|o| o.start_block)
            .or(account.start_block);
        let end_block = overrides.and_then(|o| o.end_block).or(account.end_block);

        check_range(name, start_block, end_block)?;

        specs.push(WatchSpec {
            name: name.to_string(),
            chain: chain.to_string(),
            kind: WatchKind::Account(AccountWatch {
                addresses: normalize_all(addresses),
                include_transaction_receipts: include_receipts,
            }),
            start_block: start_block.unwrap_or(BlockBound::Number(0)),
            end_block: end_block.unwrap_or(BlockBound::Latest),
        });
    }

    Ok(specs)
}

fn resolve_blocks(
    config: &ArkiveConfig,
    name: &str,
    blocks: &BlockSource,
) -> Result<Vec<WatchSpec>, ConfigError> {
    let mut specs = Vec::new();

    for (chain, overrides) in blocks.chain.bindings() {
        check_chain(config, name, chain)?;

        let interval = overrides
            .and_then(|o| o.interval)
            .or(blocks.interval)
            .unwrap_or(1)
            .max(1);
        let start_block = overrides.and_then(|o| o.start_block).or(blocks.start_block);
        let end_block = overrides.and_then(|o| o.end_block).or(blocks.end_block);

        check_range(name, start_block, end_block)?;

        specs.push(WatchSpec {
            name: name.to_string(),
            chain: chain.to_string(),
            kind: WatchKind::Block(BlockWatch { interval }),
            start_block: start_block.unwrap_or(BlockBound::Number(0)),
            end_block: end_block.unwrap_or(BlockBound::Latest),
        });
    }

    Ok(specs)
}

/// Validate transformer dispatch keys against the configuration.
///
/// Every key must reference a declared source of the right kind, and event
/// or function names must resolve unambiguously in the source's ABI.
pub fn validate_keys<'a>(
    config: &ArkiveConfig,
    keys: impl IntoIterator<Item = &'a DispatchKey>,
) -> Result<(), ConfigError> {
    for key in keys {
        let source = key.source();
        match key {
            DispatchKey::Event { event, .. } => {
                let contract = config.sources.contracts.get(source).ok_or_else(|| {
                    ConfigError::UnknownSource {
                        key: key.to_string(),
                        source_name: source.to_string(),
                    }
                })?;
                SignatureTable::build(&contract.abi).event(source, event)?;
            }
            DispatchKey::Call { function, .. } => {
                let contract = config.sources.contracts.get(source).ok_or_else(|| {
                    ConfigError::UnknownSource {
                        key: key.to_string(),
                        source_name: source.to_string(),
                    }
                })?;
                SignatureTable::build(&contract.abi).function(source, function)?;
            }
            DispatchKey::Transaction { .. } | DispatchKey::Transfer { .. } => {
                if !config.sources.accounts.contains_key(source) {
                    return Err(ConfigError::UnknownSource {
                        key: key.to_string(),
                        source_name: source.to_string(),
                    });
                }
            }
            DispatchKey::Block { .. } => {
                if !config.sources.blocks.contains_key(source) {
                    return Err(ConfigError::UnknownSource {
                        key: key.to_string(),
                        source_name: source.to_string(),
                    });
                }
            }
            DispatchKey::Setup { .. } => {
                if !config.sources.contains(source) {
                    return Err(ConfigError::UnknownSource {
                        key: key.to_string(),
                        source_name: source.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}
