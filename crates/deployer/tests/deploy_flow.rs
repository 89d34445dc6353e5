//! End-to-end orchestration flows against a scripted chain double.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use ethereum_types::U256;
use groundwork_deployer::{
    Address, ArtifactResolver, ChainClient, ChainClientError, DeployError, DeployRequest,
    DeploymentLedger, DeploymentOrchestrator, DeployTransaction, H256, RetryPolicy,
    SubmitterError, TxReceipt, predict_create_address,
};
use tempfile::{TempDir, tempdir};

const GREETER_ARTIFACT: &str = r#"{
    "contractName": "Greeter",
    "abi": [
        {
            "type": "constructor",
            "inputs": [
                {"name": "_greeting", "type": "string"},
                {"name": "_fee", "type": "uint256"}
            ]
        }
    ],
    "bytecode": "0x608060405261beef"
}"#;

/// Scripted node double. Counts submissions, releases receipts after a
/// configurable number of polls, and can be told to revert.
struct MockChain {
    submissions: AtomicU32,
    receipt_polls: AtomicU32,
    /// Polls to swallow before the receipt appears; `None` never
    /// produces a receipt.
    receipt_after: Option<u32>,
    succeed: bool,
    nonce: u64,
}

impl MockChain {
    fn healthy() -> Self {
        Self {
            submissions: AtomicU32::new(0),
            receipt_polls: AtomicU32::new(0),
            receipt_after: Some(0),
            succeed: true,
            nonce: 7,
        }
    }

    fn reverting() -> Self {
        Self {
            succeed: false,
            ..Self::healthy()
        }
    }

    fn never_confirming() -> Self {
        Self {
            receipt_after: None,
            ..Self::healthy()
        }
    }

    fn slow_confirming(polls: u32) -> Self {
        Self {
            receipt_after: Some(polls),
            ..Self::healthy()
        }
    }

    fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, ChainClientError> {
        Ok(31337)
    }

    async fn get_nonce(&self, _address: Address) -> Result<u64, ChainClientError> {
        Ok(self.nonce)
    }

    async fn gas_price(&self) -> Result<U256, ChainClientError> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn send_deploy_transaction(
        &self,
        tx: &DeployTransaction,
    ) -> Result<H256, ChainClientError> {
        let submission = self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(H256::from_low_u64_be(
            tx.nonce * 1000 + u64::from(submission) + 1,
        ))
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, ChainClientError> {
        let polls = self.receipt_polls.fetch_add(1, Ordering::SeqCst);
        let Some(threshold) = self.receipt_after else {
            return Ok(None);
        };
        if polls < threshold {
            return Ok(None);
        }
        let contract_address = self
            .succeed
            .then(|| predict_create_address(deployer_address(), self.nonce));
        Ok(Some(TxReceipt {
            transaction_hash: tx_hash,
            block_number: 42,
            contract_address,
            succeeded: self.succeed,
        }))
    }

    async fn get_code(&self, _address: Address) -> Result<Bytes, ChainClientError> {
        Ok(Bytes::new())
    }
}

fn deployer_address() -> Address {
    Address::repeat_byte(0xfc)
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        submit_attempts: 3,
        submit_retry_delay: Duration::from_millis(1),
        receipt_attempts: 5,
        receipt_base_delay: Duration::from_millis(2),
        receipt_max_delay: Duration::from_millis(10),
    }
}

fn orchestrator(dir: &TempDir, chain: Arc<MockChain>) -> DeploymentOrchestrator {
    let artifacts_dir = dir.path().join("artifacts");
    std::fs::create_dir_all(&artifacts_dir).unwrap();
    std::fs::write(artifacts_dir.join("Greeter.json"), GREETER_ARTIFACT).unwrap();

    let ledger = DeploymentLedger::open(dir.path().join("deployments.jsonl")).unwrap();
    DeploymentOrchestrator::new(
        "chain-31337".to_owned(),
        deployer_address(),
        chain,
        fast_policy(),
        ledger,
        ArtifactResolver::new(artifacts_dir),
        None,
    )
}

fn greeter_request(verify: bool) -> DeployRequest {
    DeployRequest {
        label: "greeter".to_owned(),
        contract_name: "Greeter".to_owned(),
        constructor_args: vec!["hello".to_owned(), "100".to_owned()],
        should_verify: verify,
    }
}

#[tokio::test]
async fn deploys_and_records_the_predicted_address() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::healthy());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    let record = orchestrator.deploy(greeter_request(false)).await.unwrap();

    assert_eq!(record.address, predict_create_address(deployer_address(), 7));
    assert_eq!(record.deployed_at_block, 42);
    assert!(!record.verified);
    assert_eq!(chain.submissions(), 1);

    // The record survives a process restart.
    orchestrator.close().unwrap();
    let ledger = DeploymentLedger::open(dir.path().join("deployments.jsonl")).unwrap();
    assert_eq!(
        ledger.lookup("chain-31337", "greeter").unwrap().address,
        predict_create_address(deployer_address(), 7)
    );
}

#[tokio::test]
async fn second_deploy_returns_the_same_record_without_submitting() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::healthy());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    let first = orchestrator.deploy(greeter_request(false)).await.unwrap();
    let second = orchestrator.deploy(greeter_request(true)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(chain.submissions(), 1);
    // Even with should_verify set the second call stays a no-op.
    assert!(!second.verified);
}

#[tokio::test]
async fn wrong_arity_fails_before_any_submission() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::healthy());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    let request = DeployRequest {
        constructor_args: vec!["hello".to_owned()],
        ..greeter_request(false)
    };
    let err = orchestrator.deploy(request).await.unwrap_err();

    assert!(matches!(err, DeployError::Calldata(_)));
    assert_eq!(chain.submissions(), 0);
}

#[tokio::test]
async fn unknown_contract_fails_before_any_submission() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::healthy());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    let request = DeployRequest {
        contract_name: "Nonexistent".to_owned(),
        ..greeter_request(false)
    };
    let err = orchestrator.deploy(request).await.unwrap_err();

    assert!(matches!(err, DeployError::Artifact(_)));
    assert_eq!(chain.submissions(), 0);
}

#[tokio::test]
async fn reverted_deployment_leaves_the_ledger_untouched() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::reverting());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    let err = orchestrator.deploy(greeter_request(false)).await.unwrap_err();

    assert!(matches!(
        err,
        DeployError::Submitter(SubmitterError::Reverted { .. })
    ));
    assert!(orchestrator.status(Some("greeter")).unwrap().is_empty());
}

#[tokio::test]
async fn missing_receipt_times_out_within_the_policy_budget() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::never_confirming());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    let started = Instant::now();
    let err = orchestrator.deploy(greeter_request(false)).await.unwrap_err();

    assert!(matches!(
        err,
        DeployError::Submitter(SubmitterError::ReceiptTimeout { attempts: 5, .. })
    ));
    // Millisecond-scale policy: the whole wait is bounded well under a
    // second rather than hanging.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(orchestrator.status(Some("greeter")).unwrap().is_empty());
}

#[tokio::test]
async fn verification_failure_still_records_the_deployment() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::healthy());

    let artifacts_dir = dir.path().join("artifacts");
    std::fs::create_dir_all(&artifacts_dir).unwrap();
    std::fs::write(artifacts_dir.join("Greeter.json"), GREETER_ARTIFACT).unwrap();
    let ledger = DeploymentLedger::open(dir.path().join("deployments.jsonl")).unwrap();

    // Explorer endpoint nobody listens on: submission fails with a
    // transport error, which must stay non-fatal.
    let verifier = groundwork_deployer::VerificationSubmitter::new_with_policy(
        url::Url::parse("http://127.0.0.1:9").unwrap(),
        None,
        Duration::from_millis(1),
        2,
    );
    let orchestrator = DeploymentOrchestrator::new(
        "chain-31337".to_owned(),
        deployer_address(),
        Arc::clone(&chain) as Arc<dyn ChainClient>,
        fast_policy(),
        ledger,
        ArtifactResolver::new(artifacts_dir),
        Some(verifier),
    );

    let record = orchestrator.deploy(greeter_request(true)).await.unwrap();

    assert!(!record.verified);
    let stored = orchestrator.status(Some("greeter")).unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].verified);
}

#[tokio::test]
async fn explicit_verify_requires_a_recorded_deployment() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::healthy());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    let err = orchestrator.verify("never-deployed").await.unwrap_err();
    assert!(matches!(err, DeployError::Ledger(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_deploys_submit_exactly_once() {
    let dir = tempdir().unwrap();
    // Receipts appear only after a couple of polls so the two calls
    // genuinely overlap.
    let chain = Arc::new(MockChain::slow_confirming(2));
    let orchestrator = Arc::new(orchestrator(&dir, Arc::clone(&chain)));

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.deploy(greeter_request(false)).await }
    });
    let second = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.deploy(greeter_request(false)).await }
    });

    let (first, second) = (first.await.unwrap(), second.await.unwrap());
    assert_eq!(chain.submissions(), 1);

    let mut records = Vec::new();
    let mut in_progress = 0;
    for outcome in [first, second] {
        match outcome {
            Ok(record) => records.push(record),
            Err(DeployError::InProgress { phase, .. }) => {
                let _ = phase;
                in_progress += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    // The winner always lands a record; the loser either lost the race
    // cleanly (same record) or was turned away by the in-flight guard.
    assert!(!records.is_empty());
    assert!(records.len() + in_progress == 2);
    if records.len() == 2 {
        assert_eq!(records[0], records[1]);
    }
}

#[tokio::test]
async fn records_are_scoped_to_the_orchestrator_network() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(MockChain::healthy());
    let orchestrator = orchestrator(&dir, Arc::clone(&chain));

    orchestrator.deploy(greeter_request(false)).await.unwrap();

    let all = orchestrator.status(None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].network, "chain-31337");
    assert!(orchestrator.status(Some("other-label")).unwrap().is_empty());
}
