//! The deployment flow.
//!
//! One orchestrator instance drives deployments against one network. For
//! each request it checks the ledger, resolves the artifact, encodes the
//! constructor arguments, submits through the transaction submitter,
//! records the result, and only then attempts verification. The ledger
//! write always precedes verification, and a verification failure never
//! rolls it back.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use ethereum_types::U256;
use sha3::{Digest, Keccak256};
use tracing::{info, warn};

use crate::{
    Address,
    artifacts::{ArtifactError, ArtifactResolver},
    calldata::{self, CalldataError},
    client::{ChainClient, ChainClientError, DeployTransaction},
    ledger::{DeploymentLedger, DeploymentRecord, LedgerError},
    submitter::{RetryPolicy, SubmitterError, TransactionSubmitter},
    verifier::{VerificationSubmitter, VerifierError},
};

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub label: String,
    pub contract_name: String,
    pub constructor_args: Vec<String>,
    pub should_verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Resolving,
    AwaitingReceipt,
    Recorded,
    Verifying,
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployPhase::Resolving => write!(f, "resolving"),
            DeployPhase::AwaitingReceipt => write!(f, "awaiting-receipt"),
            DeployPhase::Recorded => write!(f, "recorded"),
            DeployPhase::Verifying => write!(f, "verifying"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Calldata(#[from] CalldataError),
    #[error(transparent)]
    Submitter(#[from] SubmitterError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Client(#[from] ChainClientError),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    #[error("deployment of {label:?} on {network} is already in progress (phase: {phase})")]
    InProgress {
        network: String,
        label: String,
        phase: DeployPhase,
    },
    #[error("no explorer configured; pass an explorer URL to enable verification")]
    ExplorerNotConfigured,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Computes the address a CREATE deployment from `deployer` at `nonce`
/// will land on: `keccak256(rlp([deployer, nonce]))[12..]`.
pub fn predict_create_address(deployer: Address, nonce: u64) -> Address {
    let mut payload = Vec::with_capacity(30);
    payload.push(0x80 + 20);
    payload.extend_from_slice(deployer.as_bytes());
    if nonce == 0 {
        payload.push(0x80);
    } else if nonce < 0x80 {
        payload.push(nonce as u8);
    } else {
        let bytes = nonce.to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        payload.push(0x80 + (bytes.len() - skip) as u8);
        payload.extend_from_slice(&bytes[skip..]);
    }

    let mut encoded = Vec::with_capacity(payload.len() + 1);
    encoded.push(0xc0 + payload.len() as u8);
    encoded.extend_from_slice(&payload);

    let digest = Keccak256::digest(&encoded);
    Address::from_slice(&digest[12..])
}

struct InFlightGuard {
    table: Arc<Mutex<HashMap<String, DeployPhase>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(
        table: &Arc<Mutex<HashMap<String, DeployPhase>>>,
        network: &str,
        label: &str,
    ) -> Result<Self, DeployError> {
        let key = format!("{network}:{label}");
        let mut entries = table
            .lock()
            .map_err(|_| DeployError::Internal("in-flight table lock poisoned".to_owned()))?;
        if let Some(phase) = entries.get(&key) {
            return Err(DeployError::InProgress {
                network: network.to_owned(),
                label: label.to_owned(),
                phase: *phase,
            });
        }
        entries.insert(key.clone(), DeployPhase::Resolving);
        Ok(Self {
            table: Arc::clone(table),
            key,
        })
    }

    fn advance(&self, phase: DeployPhase) {
        if let Ok(mut entries) = self.table.lock() {
            entries.insert(self.key.clone(), phase);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.table.lock() {
            entries.remove(&self.key);
        }
    }
}

pub struct DeploymentOrchestrator {
    network: String,
    deployer: Address,
    client: Arc<dyn ChainClient>,
    submitter: TransactionSubmitter,
    ledger: Mutex<DeploymentLedger>,
    artifacts: ArtifactResolver,
    verifier: Option<VerificationSubmitter>,
    gas_limit: Option<u64>,
    gas_price: Option<U256>,
    in_flight: Arc<Mutex<HashMap<String, DeployPhase>>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        network: String,
        deployer: Address,
        client: Arc<dyn ChainClient>,
        policy: RetryPolicy,
        ledger: DeploymentLedger,
        artifacts: ArtifactResolver,
        verifier: Option<VerificationSubmitter>,
    ) -> Self {
        Self {
            network,
            deployer,
            submitter: TransactionSubmitter::new(Arc::clone(&client), policy),
            client,
            ledger: Mutex::new(ledger),
            artifacts,
            verifier,
            gas_limit: None,
            gas_price: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: Option<u64>) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_gas_price(mut self, gas_price: Option<U256>) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Deploys `request` exactly once. A label that is already recorded
    /// returns its record without any network traffic, even when
    /// `should_verify` is set; re-verification only happens through
    /// [`verify`](Self::verify).
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeploymentRecord, DeployError> {
        if let Some(existing) = self.lookup(&request.label)? {
            info!(
                label = %request.label,
                address = %format!("{:#x}", existing.address),
                "already deployed, skipping"
            );
            return Ok(existing);
        }

        let guard = InFlightGuard::acquire(&self.in_flight, &self.network, &request.label)?;
        // A deployment may have finished between the lookup above and
        // acquiring the guard.
        if let Some(existing) = self.lookup(&request.label)? {
            return Ok(existing);
        }

        let artifact = self.artifacts.resolve(&request.contract_name)?;
        let values = calldata::parse_values(&artifact.constructor_params, &request.constructor_args)?;
        let encoded_args =
            calldata::encode_constructor_args(&artifact.constructor_params, &values)?;

        let mut data = artifact.bytecode.to_vec();
        data.extend_from_slice(&encoded_args);

        let nonce = self.client.get_nonce(self.deployer).await?;
        let predicted = predict_create_address(self.deployer, nonce);
        info!(
            label = %request.label,
            contract = %request.contract_name,
            nonce,
            predicted_address = %format!("{predicted:#x}"),
            "submitting deployment"
        );

        guard.advance(DeployPhase::AwaitingReceipt);
        let tx = DeployTransaction {
            from: self.deployer,
            data: data.into(),
            nonce,
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
        };
        let receipt = self.submitter.submit(&tx).await?;
        let address = receipt
            .contract_address
            .ok_or(SubmitterError::Reverted {
                tx_hash: receipt.transaction_hash,
            })?;
        if address != predicted {
            // Another transaction from the deployer account slipped in
            // between the nonce query and inclusion.
            warn!(
                predicted = %format!("{predicted:#x}"),
                actual = %format!("{address:#x}"),
                "deployed address differs from prediction"
            );
        }

        guard.advance(DeployPhase::Recorded);
        let mut record = DeploymentRecord {
            network: self.network.clone(),
            label: request.label.clone(),
            contract_name: request.contract_name.clone(),
            address,
            tx_hash: receipt.transaction_hash,
            constructor_args: request.constructor_args.clone(),
            constructor_calldata: format!("0x{}", hex::encode(&encoded_args)),
            deployed_at_block: receipt.block_number,
            verified: false,
        };
        self.with_ledger(|ledger| ledger.record(record.clone()))??;
        info!(
            label = %request.label,
            address = %format!("{address:#x}"),
            tx_hash = %format!("{:#x}", receipt.transaction_hash),
            block = receipt.block_number,
            "deployment recorded"
        );

        if request.should_verify {
            guard.advance(DeployPhase::Verifying);
            record = self.try_verify(record, &artifact).await;
        }

        Ok(record)
    }

    /// Explicit verification retry for a recorded deployment. This is the
    /// only path that re-submits verification for an existing record.
    pub async fn verify(&self, label: &str) -> Result<DeploymentRecord, DeployError> {
        let record = self
            .lookup(label)?
            .ok_or_else(|| LedgerError::NotFound {
                network: self.network.clone(),
                label: label.to_owned(),
            })?;
        if record.verified {
            info!(label, "deployment already verified");
            return Ok(record);
        }
        let verifier = self
            .verifier
            .as_ref()
            .ok_or(DeployError::ExplorerNotConfigured)?;
        let artifact = self.artifacts.resolve(&record.contract_name)?;
        verifier
            .verify(record.address, &artifact, &record.constructor_calldata)
            .await?;
        let updated = self.with_ledger(|ledger| ledger.mark_verified(&self.network, label))??;
        Ok(updated)
    }

    /// Read-only view over the ledger for this network.
    pub fn status(&self, label: Option<&str>) -> Result<Vec<DeploymentRecord>, DeployError> {
        self.with_ledger(|ledger| {
            ledger
                .entries()
                .filter(|record| record.network == self.network)
                .filter(|record| label.is_none_or(|wanted| record.label == wanted))
                .cloned()
                .collect()
        })
    }

    /// Flushes and closes the underlying ledger.
    pub fn close(self) -> Result<(), DeployError> {
        let ledger = self
            .ledger
            .into_inner()
            .map_err(|_| DeployError::Internal("ledger lock poisoned".to_owned()))?;
        ledger.close()?;
        Ok(())
    }

    fn lookup(&self, label: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        self.with_ledger(|ledger| ledger.lookup(&self.network, label).cloned())
    }

    fn with_ledger<T>(
        &self,
        operation: impl FnOnce(&mut DeploymentLedger) -> T,
    ) -> Result<T, DeployError> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| DeployError::Internal("ledger lock poisoned".to_owned()))?;
        Ok(operation(&mut ledger))
    }

    /// Verification never taints a recorded deployment: any failure is
    /// downgraded to a warning and the record keeps `verified = false`.
    async fn try_verify(
        &self,
        record: DeploymentRecord,
        artifact: &crate::artifacts::Artifact,
    ) -> DeploymentRecord {
        let Some(verifier) = &self.verifier else {
            warn!(
                label = %record.label,
                "verification requested but no explorer is configured"
            );
            return record;
        };
        match verifier
            .verify(record.address, artifact, &record.constructor_calldata)
            .await
        {
            Ok(outcome) => {
                info!(label = %record.label, ?outcome, "source verification succeeded");
                match self.with_ledger(|ledger| ledger.mark_verified(&record.network, &record.label))
                {
                    Ok(Ok(updated)) => updated,
                    Ok(Err(err)) => {
                        warn!(%err, "could not persist verification flag");
                        record
                    }
                    Err(err) => {
                        warn!(%err, "could not persist verification flag");
                        record
                    }
                }
            }
            Err(err) => {
                warn!(
                    label = %record.label,
                    %err,
                    "verification failed; the deployment itself remains recorded"
                );
                record
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> Address {
        let bytes = hex::decode(text.trim_start_matches("0x")).unwrap();
        Address::from_slice(&bytes)
    }

    #[test]
    fn predicts_known_create_addresses() {
        let deployer = addr("0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0");
        assert_eq!(
            predict_create_address(deployer, 0),
            addr("0xcd234a471b72ba2f1ccf0a70fcaba648a5eecd8d")
        );
        assert_eq!(
            predict_create_address(deployer, 1),
            addr("0x343c43a37d37dff08ae8c4a11544c718abb4fcf8")
        );
    }

    #[test]
    fn prediction_varies_with_nonce_and_sender() {
        let a = Address::repeat_byte(0x11);
        let b = Address::repeat_byte(0x22);
        assert_ne!(predict_create_address(a, 0), predict_create_address(a, 1));
        assert_ne!(predict_create_address(a, 5), predict_create_address(b, 5));
        // Deterministic for equal inputs.
        assert_eq!(
            predict_create_address(a, 1000),
            predict_create_address(a, 1000)
        );
    }

    #[test]
    fn large_nonces_use_multi_byte_rlp_encoding() {
        let deployer = Address::repeat_byte(0x33);
        // 0x80 is the first nonce needing a length prefix; crossing that
        // boundary must not collide with the single-byte form.
        assert_ne!(
            predict_create_address(deployer, 0x7f),
            predict_create_address(deployer, 0x80)
        );
    }
}
