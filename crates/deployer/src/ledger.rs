//! Durable record of what has been deployed where.
//!
//! The ledger is the orchestrator's source of truth for "already
//! deployed". It persists as an append-only JSON-lines file: every
//! mutation appends a full record and later lines for the same
//! `(network, label)` key supersede earlier ones on replay. A torn
//! trailing line from an interrupted write is skipped, so partial writes
//! never corrupt prior entries.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Address, H256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub network: String,
    pub label: String,
    pub contract_name: String,
    pub address: Address,
    pub tx_hash: H256,
    /// Constructor arguments as supplied by the caller, in order.
    pub constructor_args: Vec<String>,
    /// ABI-encoded constructor argument blob, 0x-prefixed. This is what
    /// explorer verification submits alongside the source.
    pub constructor_calldata: String,
    pub deployed_at_block: u64,
    pub verified: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(
        "label {label:?} on {network} is already deployed at {existing:#x}; refusing to overwrite it with {incoming:#x}"
    )]
    Conflict {
        network: String,
        label: String,
        existing: Address,
        incoming: Address,
    },
    #[error("no deployment recorded for label {label:?} on {network}")]
    NotFound { network: String, label: String },
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// File-backed `(network, label)` -> [`DeploymentRecord`] store.
///
/// Opened explicitly at process start and closed at process end; all
/// mutations go through [`record`](Self::record) and
/// [`mark_verified`](Self::mark_verified) and are flushed to disk before
/// they return.
pub struct DeploymentLedger {
    path: PathBuf,
    file: File,
    entries: BTreeMap<(String, String), DeploymentRecord>,
}

impl DeploymentLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = BTreeMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<DeploymentRecord>(&line) {
                    Ok(record) => {
                        entries.insert(
                            (record.network.clone(), record.label.clone()),
                            record,
                        );
                    }
                    Err(err) => {
                        // Interrupted append; the entry was never
                        // acknowledged, so dropping it is correct.
                        warn!(
                            path = %path.display(),
                            line = line_number + 1,
                            %err,
                            "skipping unparsable ledger line"
                        );
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "ledger opened");
        Ok(Self {
            path,
            file,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, network: &str, label: &str) -> Option<&DeploymentRecord> {
        self.entries
            .get(&(network.to_owned(), label.to_owned()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.entries.values()
    }

    /// Records a deployment. Re-recording the identical address is a
    /// no-op; a differing address under an existing key is a conflict,
    /// guarding against an accidental redeploy under a reused label.
    pub fn record(&mut self, record: DeploymentRecord) -> Result<(), LedgerError> {
        let key = (record.network.clone(), record.label.clone());
        if let Some(existing) = self.entries.get(&key) {
            if existing.address != record.address {
                return Err(LedgerError::Conflict {
                    network: record.network,
                    label: record.label,
                    existing: existing.address,
                    incoming: record.address,
                });
            }
            debug!(
                network = %record.network,
                label = %record.label,
                "deployment already recorded"
            );
            return Ok(());
        }
        self.append(&record)?;
        self.entries.insert(key, record);
        Ok(())
    }

    /// Flips the one mutable flag on a record. The transition is
    /// `false -> true` exactly once; marking an already-verified record
    /// is a no-op.
    pub fn mark_verified(
        &mut self,
        network: &str,
        label: &str,
    ) -> Result<DeploymentRecord, LedgerError> {
        let key = (network.to_owned(), label.to_owned());
        let record = self
            .entries
            .get(&key)
            .ok_or_else(|| LedgerError::NotFound {
                network: network.to_owned(),
                label: label.to_owned(),
            })?;
        if record.verified {
            return Ok(record.clone());
        }
        let mut updated = record.clone();
        updated.verified = true;
        self.append(&updated)?;
        self.entries.insert(key, updated.clone());
        Ok(updated)
    }

    fn append(&mut self, record: &DeploymentRecord) -> Result<(), LedgerError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}")?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn close(self) -> Result<(), LedgerError> {
        self.file.sync_all()?;
        Ok(())
    }
}
