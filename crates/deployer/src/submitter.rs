//! Submission retry and receipt confirmation.
//!
//! Wraps a [`ChainClient`] with the retry policy the orchestrator relies
//! on: submission is retried a few times on transport-class errors, the
//! receipt wait backs off exponentially, and every wait is bounded. A
//! reverted deployment is surfaced as its own error so callers never
//! mistake it for a transient condition.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    H256,
    client::{ChainClient, ChainClientError, DeployTransaction, TxReceipt},
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Submission attempts before giving up on transport errors.
    pub submit_attempts: u32,
    pub submit_retry_delay: Duration,
    /// Receipt poll attempts before declaring a timeout.
    pub receipt_attempts: u32,
    pub receipt_base_delay: Duration,
    pub receipt_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            submit_attempts: 3,
            submit_retry_delay: Duration::from_secs(1),
            receipt_attempts: 10,
            receipt_base_delay: Duration::from_secs(2),
            receipt_max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next receipt poll, doubling from the base and
    /// capped by the maximum.
    fn receipt_delay(&self, attempts_used: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempts_used.saturating_sub(1));
        self.receipt_base_delay
            .saturating_mul(multiplier)
            .min(self.receipt_max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitterError {
    #[error("failed to submit deployment transaction after {attempts} attempt(s): {source}")]
    Submission {
        attempts: u32,
        #[source]
        source: ChainClientError,
    },
    #[error(
        "no receipt for transaction {tx_hash:#x} after {attempts} attempts; it may still be included later"
    )]
    ReceiptTimeout { tx_hash: H256, attempts: u32 },
    #[error("deployment transaction {tx_hash:#x} reverted on chain")]
    Reverted { tx_hash: H256 },
}

pub struct TransactionSubmitter {
    client: Arc<dyn ChainClient>,
    policy: RetryPolicy,
}

impl TransactionSubmitter {
    pub fn new(client: Arc<dyn ChainClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Submits `tx` and waits for its receipt within the policy budget.
    pub async fn submit(&self, tx: &DeployTransaction) -> Result<TxReceipt, SubmitterError> {
        let tx_hash = self.broadcast(tx).await?;
        info!(tx_hash = %format!("{tx_hash:#x}"), "deployment transaction submitted");
        self.await_receipt(tx_hash).await
    }

    async fn broadcast(&self, tx: &DeployTransaction) -> Result<H256, SubmitterError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.client.send_deploy_transaction(tx).await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(err) => {
                    if !err.is_transient() || attempts >= self.policy.submit_attempts {
                        return Err(SubmitterError::Submission {
                            attempts,
                            source: err,
                        });
                    }
                    warn!(%err, attempts, "submission failed, retrying");
                    tokio::time::sleep(self.policy.submit_retry_delay).await;
                }
            }
        }
    }

    async fn await_receipt(&self, tx_hash: H256) -> Result<TxReceipt, SubmitterError> {
        for attempt in 1..=self.policy.receipt_attempts {
            match self.client.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    let created = receipt
                        .contract_address
                        .is_some_and(|address| !address.is_zero());
                    if !receipt.succeeded || !created {
                        return Err(SubmitterError::Reverted { tx_hash });
                    }
                    debug!(
                        block = receipt.block_number,
                        "deployment transaction confirmed"
                    );
                    return Ok(receipt);
                }
                Ok(None) => {
                    debug!(
                        attempt,
                        max_attempts = self.policy.receipt_attempts,
                        "receipt not yet available"
                    );
                }
                Err(err) => {
                    // Receipt queries share the poll budget; a flaky
                    // node costs attempts, not an unbounded wait.
                    warn!(%err, attempt, "receipt query failed");
                }
            }
            if attempt < self.policy.receipt_attempts {
                tokio::time::sleep(self.policy.receipt_delay(attempt)).await;
            }
        }
        Err(SubmitterError::ReceiptTimeout {
            tx_hash,
            attempts: self.policy.receipt_attempts,
        })
    }
}
