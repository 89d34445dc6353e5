//! Source verification against an etherscan-compatible explorer.
//!
//! Verification is a post-deployment side effect with its own bounded
//! retry budget. An "already verified" answer, at submission or while
//! polling, counts as success so repeated runs stay idempotent from the
//! caller's perspective.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::{Address, artifacts::Artifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    AlreadyVerified,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("explorer transport error: {0}")]
    Transport(String),
    #[error("explorer rejected the verification request: {message}")]
    Rejected { message: String },
    #[error("verification still pending after {attempts} status checks")]
    Timeout { attempts: u32 },
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: String,
}

enum PollOutcome {
    Done(VerificationOutcome),
    Pending,
    Failed(String),
}

pub struct VerificationSubmitter {
    http: reqwest::Client,
    explorer_url: Url,
    api_key: Option<String>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl VerificationSubmitter {
    pub fn new(explorer_url: Url, api_key: Option<String>) -> Self {
        Self::new_with_policy(explorer_url, api_key, Duration::from_secs(5), 12)
    }

    pub fn new_with_policy(
        explorer_url: Url,
        api_key: Option<String>,
        poll_interval: Duration,
        poll_attempts: u32,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            explorer_url,
            api_key,
            poll_interval,
            poll_attempts,
        }
    }

    /// Submits a verification job and polls it to completion.
    pub async fn verify(
        &self,
        address: Address,
        artifact: &Artifact,
        constructor_calldata: &str,
    ) -> Result<VerificationOutcome, VerifierError> {
        let guid = match self.submit(address, artifact, constructor_calldata).await? {
            SubmitOutcome::Queued(guid) => guid,
            SubmitOutcome::AlreadyVerified => {
                info!(address = %format!("{address:#x}"), "contract already verified");
                return Ok(VerificationOutcome::AlreadyVerified);
            }
        };
        debug!(guid = %guid, "verification job queued");

        for attempt in 1..=self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            match self.poll(&guid).await? {
                PollOutcome::Done(outcome) => {
                    info!(address = %format!("{address:#x}"), ?outcome, "verification finished");
                    return Ok(outcome);
                }
                PollOutcome::Pending => {
                    debug!(attempt, max_attempts = self.poll_attempts, "verification pending");
                }
                PollOutcome::Failed(message) => {
                    return Err(VerifierError::Rejected { message });
                }
            }
        }
        Err(VerifierError::Timeout {
            attempts: self.poll_attempts,
        })
    }

    async fn submit(
        &self,
        address: Address,
        artifact: &Artifact,
        constructor_calldata: &str,
    ) -> Result<SubmitOutcome, VerifierError> {
        let mut form = vec![
            ("module".to_owned(), "contract".to_owned()),
            ("action".to_owned(), "verifysourcecode".to_owned()),
            ("contractaddress".to_owned(), format!("{address:#x}")),
            ("contractname".to_owned(), artifact.contract_name.clone()),
            (
                "sourceCode".to_owned(),
                artifact.source.clone().unwrap_or_default(),
            ),
            (
                "compilerversion".to_owned(),
                artifact.compiler_version.clone().unwrap_or_default(),
            ),
            (
                // The explorer API spells this field `constructorArguements`.
                "constructorArguements".to_owned(),
                constructor_calldata.trim_start_matches("0x").to_owned(),
            ),
        ];
        if let Some(api_key) = &self.api_key {
            form.push(("apikey".to_owned(), api_key.clone()));
        }

        let response: ExplorerResponse = self
            .http
            .post(self.api_endpoint())
            .form(&form)
            .send()
            .await
            .map_err(|err| VerifierError::Transport(err.to_string()))?
            .json()
            .await
            .map_err(|err| VerifierError::Transport(err.to_string()))?;

        classify_submit_response(&response)
    }

    async fn poll(&self, guid: &str) -> Result<PollOutcome, VerifierError> {
        let mut query = vec![
            ("module".to_owned(), "contract".to_owned()),
            ("action".to_owned(), "checkverifystatus".to_owned()),
            ("guid".to_owned(), guid.to_owned()),
        ];
        if let Some(api_key) = &self.api_key {
            query.push(("apikey".to_owned(), api_key.clone()));
        }

        let response: ExplorerResponse = self
            .http
            .get(self.api_endpoint())
            .query(&query)
            .send()
            .await
            .map_err(|err| VerifierError::Transport(err.to_string()))?
            .json()
            .await
            .map_err(|err| VerifierError::Transport(err.to_string()))?;

        Ok(classify_poll_response(&response))
    }

    fn api_endpoint(&self) -> Url {
        let mut url = self.explorer_url.clone();
        if !url.path().trim_end_matches('/').ends_with("/api") {
            let joined = format!("{}/api", url.path().trim_end_matches('/'));
            url.set_path(&joined);
        }
        url
    }
}

#[derive(Debug)]
enum SubmitOutcome {
    Queued(String),
    AlreadyVerified,
}

fn classify_submit_response(
    response: &ExplorerResponse,
) -> Result<SubmitOutcome, VerifierError> {
    if response.status == "1" {
        return Ok(SubmitOutcome::Queued(response.result.clone()));
    }
    if is_already_verified(&response.result) || is_already_verified(&response.message) {
        return Ok(SubmitOutcome::AlreadyVerified);
    }
    Err(VerifierError::Rejected {
        message: if response.result.is_empty() {
            response.message.clone()
        } else {
            response.result.clone()
        },
    })
}

fn classify_poll_response(response: &ExplorerResponse) -> PollOutcome {
    let result = response.result.as_str();
    if is_already_verified(result) {
        return PollOutcome::Done(VerificationOutcome::AlreadyVerified);
    }
    if result.starts_with("Pass") {
        return PollOutcome::Done(VerificationOutcome::Verified);
    }
    if result.contains("Pending") {
        return PollOutcome::Pending;
    }
    PollOutcome::Failed(result.to_owned())
}

fn is_already_verified(text: &str) -> bool {
    text.to_ascii_lowercase().contains("already verified")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: &str, message: &str, result: &str) -> ExplorerResponse {
        ExplorerResponse {
            status: status.to_owned(),
            message: message.to_owned(),
            result: result.to_owned(),
        }
    }

    #[test]
    fn queued_submission_returns_the_guid() {
        let outcome =
            classify_submit_response(&response("1", "OK", "abc123guid")).unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(guid) if guid == "abc123guid"));
    }

    #[test]
    fn already_verified_at_submit_time_is_success() {
        let outcome = classify_submit_response(&response(
            "0",
            "NOTOK",
            "Contract source code already verified",
        ))
        .unwrap();
        assert!(matches!(outcome, SubmitOutcome::AlreadyVerified));
    }

    #[test]
    fn rejection_carries_the_explorer_message() {
        let err = classify_submit_response(&response("0", "NOTOK", "Invalid API Key"))
            .unwrap_err();
        assert!(matches!(err, VerifierError::Rejected { message } if message == "Invalid API Key"));
    }

    #[test]
    fn poll_states_are_classified() {
        assert!(matches!(
            classify_poll_response(&response("1", "OK", "Pass - Verified")),
            PollOutcome::Done(VerificationOutcome::Verified)
        ));
        assert!(matches!(
            classify_poll_response(&response("0", "NOTOK", "Pending in queue")),
            PollOutcome::Pending
        ));
        assert!(matches!(
            classify_poll_response(&response("0", "NOTOK", "Already Verified")),
            PollOutcome::Done(VerificationOutcome::AlreadyVerified)
        ));
        assert!(matches!(
            classify_poll_response(&response("0", "NOTOK", "Fail - Unable to verify")),
            PollOutcome::Failed(_)
        ));
    }

    #[test]
    fn api_endpoint_appends_api_path_once() {
        let submitter = VerificationSubmitter::new(
            Url::parse("https://explorer.example").unwrap(),
            None,
        );
        assert_eq!(submitter.api_endpoint().path(), "/api");

        let submitter = VerificationSubmitter::new(
            Url::parse("https://explorer.example/api").unwrap(),
            None,
        );
        assert_eq!(submitter.api_endpoint().path(), "/api");
    }
}
