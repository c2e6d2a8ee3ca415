//! The deployment ledger: the authoritative record of what a plan created.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::primitives::Address;
use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeployError, DeployResult},
    plan::ArgValue,
};

/// One confirmed creation. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub name: String,
    pub address: Address,
    pub args: Vec<ArgValue>,
    pub contract: Option<String>,
}

impl DeploymentRecord {
    /// Constructor arguments rendered as literal text.
    pub fn rendered_args(&self) -> Vec<String> {
        self.args.iter().map(ToString::to_string).collect()
    }
}

/// Append-only map from component name to [`DeploymentRecord`], in deployment order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentLedger {
    records: Vec<DeploymentRecord>,
}

impl DeploymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed creation. Recording the same name twice is a programmer error.
    pub fn insert(&mut self, record: DeploymentRecord) -> DeployResult<()> {
        if self.contains(&record.name) {
            return Err(DeployError::DuplicateComponent { name: record.name });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&DeploymentRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.get(name).map(|r| r.address)
    }

    pub fn records(&self) -> &[DeploymentRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Export the ledger for persistence, stamped with the current time.
    pub fn snapshot(&self, network: &str, chain_id: u64) -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::empty(network, chain_id);
        for record in &self.records {
            snapshot.contracts.insert(
                record.name.clone(),
                LedgerEntry {
                    address: record.address,
                    args: record.rendered_args(),
                    contract: record.contract.clone(),
                },
            );
        }
        snapshot
    }
}

/// Persisted shape of a ledger:
/// `{network, chainId, timestamp, contracts: {name: {address, args}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub network: String,
    pub chain_id: u64,
    pub timestamp: String,
    pub contracts: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub address: Address,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
}

impl LedgerSnapshot {
    pub fn empty(network: &str, chain_id: u64) -> Self {
        Self {
            network: network.to_string(),
            chain_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            contracts: BTreeMap::new(),
        }
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.contracts.get(name).map(|entry| entry.address)
    }

    /// Fold a newer snapshot into this one. Names already present are never overwritten.
    pub fn merge(&mut self, newer: LedgerSnapshot) -> DeployResult<()> {
        if let Some(name) = newer
            .contracts
            .keys()
            .find(|name| self.contracts.contains_key(*name))
        {
            return Err(DeployError::DuplicateComponent { name: name.clone() });
        }
        self.network = newer.network;
        self.chain_id = newer.chain_id;
        self.timestamp = newer.timestamp;
        self.contracts.extend(newer.contracts);
        Ok(())
    }
}

/// Durable storage for ledger snapshots, keyed by network name.
pub trait LedgerStore: Send + Sync {
    /// Load the snapshot for `network`, if one was persisted.
    fn load(&self, network: &str) -> anyhow::Result<Option<LedgerSnapshot>>;

    /// Persist `snapshot`, returning where it was written.
    fn save(&self, snapshot: &LedgerSnapshot) -> anyhow::Result<PathBuf>;
}

/// Stores each network's ledger as `{dir}/{network}.json`.
#[derive(Debug, Clone)]
pub struct JsonLedgerStore {
    dir: PathBuf,
}

impl JsonLedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, network: &str) -> PathBuf {
        self.dir.join(format!("{network}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&self, network: &str) -> anyhow::Result<Option<LedgerSnapshot>> {
        let path = self.path_for(network);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read ledger from {}", path.display()))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse ledger {}", path.display()))?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create deployments directory {}", self.dir.display())
        })?;

        let path = self.path_for(&snapshot.network);
        let json =
            serde_json::to_string_pretty(snapshot).context("Failed to serialize ledger snapshot")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write ledger to {}", path.display()))?;
        Ok(path)
    }
}
