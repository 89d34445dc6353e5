use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand};
use ethereum_types::U256;
use groundwork_deployer::{
    Address, ArtifactResolver, ChainClient, DeployRequest, DeploymentLedger,
    DeploymentOrchestrator, EthClient, RetryPolicy, VerificationSubmitter,
};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, filter::Directive};
use url::Url;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "groundwork",
    author,
    version,
    about = "Deploy, record and verify smart contracts"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "rpc-url",
        value_name = "RPC_URL",
        default_value = "http://localhost:8545",
        env = "GROUNDWORK_RPC_URL",
        help_heading = "Node options"
    )]
    pub rpc_url: Url,
    #[arg(
        long = "from",
        value_name = "ADDRESS",
        value_parser = parse_address,
        env = "GROUNDWORK_FROM",
        help_heading = "Node options",
        help = "Unlocked account the node signs deployment transactions with."
    )]
    pub from: Option<Address>,
    #[arg(
        long = "network",
        value_name = "NAME",
        env = "GROUNDWORK_NETWORK",
        help_heading = "Node options",
        help = "Ledger namespace for this chain. Defaults to `chain-<chain id>` of the connected node."
    )]
    pub network: Option<String>,
    #[arg(
        long = "ledger",
        value_name = "PATH",
        default_value = "deployments.jsonl",
        env = "GROUNDWORK_LEDGER_PATH",
        help_heading = "Storage options",
        help = "Append-only deployments file; one JSON record per line."
    )]
    pub ledger: PathBuf,
    #[arg(
        long = "artifacts-dir",
        value_name = "PATH",
        default_value = "artifacts",
        env = "GROUNDWORK_ARTIFACTS_DIR",
        help_heading = "Storage options",
        help = "Directory of compiled contract artifacts (<Name>.json)."
    )]
    pub artifacts_dir: PathBuf,
    #[arg(
        long = "explorer-url",
        value_name = "URL",
        env = "GROUNDWORK_EXPLORER_URL",
        help_heading = "Explorer options"
    )]
    pub explorer_url: Option<Url>,
    #[arg(
        long = "explorer-api-key",
        value_name = "KEY",
        env = "GROUNDWORK_EXPLORER_API_KEY",
        help_heading = "Explorer options"
    )]
    pub explorer_api_key: Option<String>,
    #[arg(
        long = "gas-limit",
        value_name = "UINT64",
        env = "GROUNDWORK_GAS_LIMIT",
        help_heading = "Transaction options",
        help = "Fixed gas limit for the deployment transaction; the node estimates when unset."
    )]
    pub gas_limit: Option<u64>,
    #[arg(
        long = "gas-price",
        value_name = "WEI",
        env = "GROUNDWORK_GAS_PRICE",
        help_heading = "Transaction options"
    )]
    pub gas_price: Option<u64>,
    #[arg(
        long = "max-number-of-retries",
        default_value = "10",
        value_name = "UINT64",
        env = "GROUNDWORK_MAX_NUMBER_OF_RETRIES",
        help_heading = "Retry options"
    )]
    pub max_number_of_retries: u64,
    #[arg(
        long = "backoff-factor",
        default_value = "2",
        value_name = "UINT64",
        env = "GROUNDWORK_BACKOFF_FACTOR",
        help_heading = "Retry options"
    )]
    pub backoff_factor: u64,
    #[arg(
        long = "min-retry-delay-ms",
        default_value = "1000",
        value_name = "UINT64",
        env = "GROUNDWORK_MIN_RETRY_DELAY_MS",
        help_heading = "Retry options"
    )]
    pub min_retry_delay_ms: u64,
    #[arg(
        long = "max-retry-delay-ms",
        default_value = "30000",
        value_name = "UINT64",
        env = "GROUNDWORK_MAX_RETRY_DELAY_MS",
        help_heading = "Retry options"
    )]
    pub max_retry_delay_ms: u64,
    #[arg(
        long = "submit-attempts",
        default_value = "3",
        value_name = "UINT32",
        env = "GROUNDWORK_SUBMIT_ATTEMPTS",
        help_heading = "Retry options",
        help = "Submission attempts on transient transport errors."
    )]
    pub submit_attempts: u32,
    #[arg(
        long = "receipt-attempts",
        default_value = "10",
        value_name = "UINT32",
        env = "GROUNDWORK_RECEIPT_ATTEMPTS",
        help_heading = "Retry options"
    )]
    pub receipt_attempts: u32,
    #[arg(
        long = "receipt-base-delay-ms",
        default_value = "2000",
        value_name = "UINT64",
        env = "GROUNDWORK_RECEIPT_BASE_DELAY_MS",
        help_heading = "Retry options"
    )]
    pub receipt_base_delay_ms: u64,
    #[arg(
        long = "receipt-max-delay-ms",
        default_value = "30000",
        value_name = "UINT64",
        env = "GROUNDWORK_RECEIPT_MAX_DELAY_MS",
        help_heading = "Retry options"
    )]
    pub receipt_max_delay_ms: u64,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help_heading = "Logging options",
        help = "Possible values: info, debug, trace, warn, error"
    )]
    pub log_level: Level,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(about = "Deploy a contract once and record it in the ledger.")]
    Deploy {
        #[arg(long, value_name = "NAME", help = "Name of the compiled contract artifact.")]
        contract: String,
        #[arg(
            long,
            value_name = "LABEL",
            help = "Ledger label for this instance. Defaults to the contract name."
        )]
        label: Option<String>,
        #[arg(
            long = "constructor-args",
            num_args(0..),
            value_name = "ARGS",
            allow_negative_numbers = true
        )]
        constructor_args: Vec<String>,
        #[arg(
            long,
            action = ArgAction::SetTrue,
            help = "Submit source verification to the explorer after deploying."
        )]
        verify: bool,
        #[arg(long, action = ArgAction::SetTrue, help = "Emit the record as JSON.")]
        json: bool,
    },
    #[command(about = "Re-run source verification for a recorded deployment.")]
    Verify {
        #[arg(long, value_name = "LABEL")]
        label: String,
    },
    #[command(about = "Show recorded deployments for this network.")]
    Status {
        #[arg(long, value_name = "LABEL")]
        label: Option<String>,
        #[arg(long, action = ArgAction::SetTrue, help = "Emit records as JSON.")]
        json: bool,
    },
}

impl CLI {
    pub async fn run(self) -> eyre::Result<()> {
        init_tracing(&self.opts);

        let client = Arc::new(EthClient::new_with_config(
            self.opts.rpc_url.clone(),
            self.opts.max_number_of_retries,
            self.opts.backoff_factor,
            Duration::from_millis(self.opts.min_retry_delay_ms),
            Duration::from_millis(self.opts.max_retry_delay_ms),
        ));

        let network = match &self.opts.network {
            Some(network) => network.clone(),
            None => format!("chain-{}", client.chain_id().await?),
        };
        info!(network = %network, rpc_url = %self.opts.rpc_url, "groundwork starting");

        let ledger = DeploymentLedger::open(&self.opts.ledger)?;
        let verifier = self
            .opts
            .explorer_url
            .clone()
            .map(|url| VerificationSubmitter::new(url, self.opts.explorer_api_key.clone()));
        let policy = RetryPolicy {
            submit_attempts: self.opts.submit_attempts,
            submit_retry_delay: Duration::from_millis(self.opts.min_retry_delay_ms),
            receipt_attempts: self.opts.receipt_attempts,
            receipt_base_delay: Duration::from_millis(self.opts.receipt_base_delay_ms),
            receipt_max_delay: Duration::from_millis(self.opts.receipt_max_delay_ms),
        };

        let orchestrator = DeploymentOrchestrator::new(
            network,
            self.opts.from.unwrap_or_default(),
            client,
            policy,
            ledger,
            ArtifactResolver::new(&self.opts.artifacts_dir),
            verifier,
        )
        .with_gas_limit(self.opts.gas_limit)
        .with_gas_price(self.opts.gas_price.map(U256::from));

        match self.command {
            Subcommand::Deploy {
                contract,
                label,
                constructor_args,
                verify,
                json,
            } => {
                if self.opts.from.is_none() {
                    eyre::bail!("--from is required to deploy (or set GROUNDWORK_FROM)");
                }
                let request = DeployRequest {
                    label: label.unwrap_or_else(|| contract.clone()),
                    contract_name: contract,
                    constructor_args,
                    should_verify: verify,
                };
                let record = orchestrator.deploy(request).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                } else {
                    println!("Label:            {}", record.label);
                    println!("Deployed to:      {:#x}", record.address);
                    println!("Transaction hash: {:#x}", record.tx_hash);
                    println!("Block:            {}", record.deployed_at_block);
                    println!("Verified:         {}", record.verified);
                }
            }
            Subcommand::Verify { label } => {
                let record = orchestrator.verify(&label).await?;
                println!("Label:    {}", record.label);
                println!("Address:  {:#x}", record.address);
                println!("Verified: {}", record.verified);
            }
            Subcommand::Status { label, json } => {
                let records = orchestrator.status(label.as_deref())?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else if records.is_empty() {
                    println!("No recorded deployments.");
                } else {
                    for record in records {
                        println!(
                            "{}\t{}\t{:#x}\tblock {}\tverified: {}",
                            record.label,
                            record.contract_name,
                            record.address,
                            record.deployed_at_block,
                            record.verified
                        );
                    }
                }
            }
        }

        orchestrator.close()?;
        Ok(())
    }
}

fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_target(false)
        .init();
}

pub fn parse_address(s: &str) -> eyre::Result<Address> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits)?;
    if bytes.len() != 20 {
        eyre::bail!("expected a 20-byte address, got {} bytes", bytes.len());
    }
    Ok(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parses_deploy_with_constructor_args_and_verify() {
        let cli = CLI::parse_from([
            "groundwork",
            "--from",
            "0x4417092b70a3e5f10dc504d0947dd256b965fc62",
            "deploy",
            "--contract",
            "Greeter",
            "--label",
            "greeter-main",
            "--constructor-args",
            "hello",
            "100",
            "--verify",
        ]);
        match cli.command {
            Subcommand::Deploy {
                contract,
                label,
                constructor_args,
                verify,
                ..
            } => {
                assert_eq!(contract, "Greeter");
                assert_eq!(label.as_deref(), Some("greeter-main"));
                assert_eq!(constructor_args, vec!["hello", "100"]);
                assert!(verify);
            }
            _ => panic!("expected the deploy subcommand"),
        }
        assert!(cli.opts.from.is_some());
    }

    #[test]
    fn retry_knobs_have_bounded_defaults() {
        let cli = CLI::parse_from(["groundwork", "status"]);
        assert_eq!(cli.opts.receipt_attempts, 10);
        assert_eq!(cli.opts.receipt_base_delay_ms, 2000);
        assert_eq!(cli.opts.receipt_max_delay_ms, 30000);
        assert_eq!(cli.opts.submit_attempts, 3);
    }

    #[test]
    fn address_parser_accepts_prefixed_and_bare_hex() {
        let prefixed = parse_address("0x4417092b70a3e5f10dc504d0947dd256b965fc62").unwrap();
        let bare = parse_address("4417092b70a3e5f10dc504d0947dd256b965fc62").unwrap();
        assert_eq!(prefixed, bare);
        assert!(parse_address("0x1234").is_err());
    }

    #[test]
    fn negative_constructor_args_are_not_eaten_as_flags() {
        let cli = CLI::parse_from([
            "groundwork",
            "deploy",
            "--contract",
            "Counter",
            "--constructor-args",
            "-5",
        ]);
        match cli.command {
            Subcommand::Deploy {
                constructor_args, ..
            } => assert_eq!(constructor_args, vec!["-5"]),
            _ => panic!("expected the deploy subcommand"),
        }
    }
}
