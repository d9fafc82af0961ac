//! Runtime ABI model and the signature table built from it.
//!
//! Event and function names referenced by filters, factories, and
//! transformer keys are checked against the ABI once at startup. A plain
//! name resolves only if it is unambiguous; overloaded names must be given
//! as a full signature (`Transfer(address,address,uint256)`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ConfigError;

// ─── ABI items ────────────────────────────────────────────────────────────────

/// A single named input of an event or function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    pub name: String,
    /// Solidity type string, e.g. `"address"` or `"uint256"`.
    #[serde(rename = "type")]
    pub ty: String,
    /// EVM: whether this parameter is an indexed topic.
    #[serde(default)]
    pub indexed: bool,
}

/// An event declared by an ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiEvent {
    pub name: String,
    pub inputs: Vec<AbiParam>,
}

impl AbiEvent {
    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn signature(&self) -> String {
        signature_of(&self.name, &self.inputs)
    }

    /// Look up an input by name.
    pub fn input(&self, name: &str) -> Option<&AbiParam> {
        self.inputs.iter().find(|p| p.name == name)
    }
}

/// A function declared by an ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiFunction {
    pub name: String,
    pub inputs: Vec<AbiParam>,
}

impl AbiFunction {
    /// Canonical signature, e.g. `transfer(address,uint256)`.
    pub fn signature(&self) -> String {
        signature_of(&self.name, &self.inputs)
    }
}

fn signature_of(name: &str, inputs: &[AbiParam]) -> String {
    let types: Vec<&str> = inputs.iter().map(|p| p.ty.as_str()).collect();
    format!("{}({})", name, types.join(","))
}

/// The application byte interface of a contract: its events and functions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abi {
    #[serde(default)]
    pub events: Vec<AbiEvent>,
    #[serde(default)]
    pub functions: Vec<AbiFunction>,
}

// ─── SignatureTable ───────────────────────────────────────────────────────────

/// Name and signature lookup for one ABI.
///
/// Built once per contract source at startup and used to fail fast on any
/// reference to an undeclared or ambiguous name.
#[derive(Debug, Clone)]
pub struct SignatureTable {
    events_by_name: HashMap<String, Vec<AbiEvent>>,
    events_by_sig: HashMap<String, AbiEvent>,
    functions_by_name: HashMap<String, Vec<AbiFunction>>,
    functions_by_sig: HashMap<String, AbiFunction>,
}

impl SignatureTable {
    pub fn build(abi: &Abi) -> Self {
        let mut events_by_name: HashMap<String, Vec<AbiEvent>> = HashMap::new();
        let mut events_by_sig = HashMap::new();
        for ev in &abi.events {
            events_by_name.entry(ev.name.clone()).or_default().push(ev.clone());
            events_by_sig.insert(ev.signature(), ev.clone());
        }
        let mut functions_by_name: HashMap<String, Vec<AbiFunction>> = HashMap::new();
        let mut functions_by_sig = HashMap::new();
        for f in &abi.functions {
            functions_by_name.entry(f.name.clone()).or_default().push(f.clone());
            functions_by_sig.insert(f.signature(), f.clone());
        }
        Self {
            events_by_name,
            events_by_sig,
            functions_by_name,
            functions_by_sig,
        }
    }

    /// Resolve an event by plain name or full signature.
    pub fn event(&self, source: &str, name_or_sig: &str) -> Result<&AbiEvent, ConfigError> {
        if name_or_sig.contains('(') {
            return self
                .events_by_sig
                .get(name_or_sig)
                .ok_or_else(|| ConfigError::UnknownEvent {
                    source_name: source.to_string(),
                    event: name_or_sig.to_string(),
                });
        }
        match self.events_by_name.get(name_or_sig) {
            None => Err(ConfigError::UnknownEvent {
                source_name: source.to_string(),
                event: name_or_sig.to_string(),
            }),
            Some(candidates) if candidates.len() > 1 => Err(ConfigError::AmbiguousEvent {
                source_name: source.to_string(),
                event: name_or_sig.to_string(),
            }),
            Some(candidates) => Ok(&candidates[0]),
        }
    }

    /// Resolve a function by plain name or full signature.
    pub fn function(&self, source: &str, name_or_sig: &str) -> Result<&AbiFunction, ConfigError> {
        if name_or_sig.contains('(') {
            return self
                .functions_by_sig
                .get(name_or_sig)
                .ok_or_else(|| ConfigError::UnknownFunction {
                    source_name: source.to_string(),
                    function: name_or_sig.to_string(),
                });
        }
        match self.functions_by_name.get(name_or_sig) {
            None => Err(ConfigError::UnknownFunction {
                source_name: source.to_string(),
                function: name_or_sig.to_string(),
            }),
            Some(candidates) if candidates.len() > 1 => Err(ConfigError::AmbiguousFunction {
                source_name: source.to_string(),
                function: name_or_sig.to_string(),
            }),
            Some(candidates) => Ok(&candidates[0]),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
