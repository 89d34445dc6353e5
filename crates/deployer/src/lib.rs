//! Contract deployment orchestration.
//!
//! This crate deploys already-compiled contracts exactly once per target
//! network, records each deployment in a durable ledger, and optionally
//! drives source verification against a block explorer. The pieces:
//!
//! - [`ledger`]: `(network, label)` -> [`ledger::DeploymentRecord`] store,
//!   persisted as an append-only JSON-lines file.
//! - [`artifacts`]: resolves a contract name to its ABI and bytecode.
//! - [`calldata`]: constructor-argument parsing and ABI encoding.
//! - [`client`]: the [`client::ChainClient`] boundary to the node, plus a
//!   JSON-RPC implementation with bounded retry.
//! - [`submitter`]: submission retry and receipt polling with backoff.
//! - [`verifier`]: explorer verification submission and status polling.
//! - [`orchestrator`]: the deployment flow tying the above together.

pub mod artifacts;
pub mod calldata;
pub mod client;
pub mod ledger;
pub mod orchestrator;
pub mod submitter;
pub mod verifier;

pub use ethereum_types::{H160, H256, U256};

pub type Address = H160;

pub use artifacts::{Artifact, ArtifactError, ArtifactResolver};
pub use client::{ChainClient, ChainClientError, DeployTransaction, EthClient, TxReceipt};
pub use ledger::{DeploymentLedger, DeploymentRecord, LedgerError};
pub use orchestrator::{
    DeployError, DeployPhase, DeployRequest, DeploymentOrchestrator, predict_create_address,
};
pub use submitter::{RetryPolicy, SubmitterError, TransactionSubmitter};
pub use verifier::{VerificationOutcome, VerificationSubmitter, VerifierError};
