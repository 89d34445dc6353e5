//! Resolution of compiled contract artifacts.
//!
//! Artifacts are produced by an external compilation step as one JSON
//! file per contract (`<dir>/<Name>.json`) carrying at least `abi` and
//! `bytecode`. Resolution is read-only and happens before any network
//! cost is incurred, so a missing or malformed artifact aborts a
//! deployment pre-flight.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Deserialize;

use crate::calldata::{CalldataError, ParamType};

#[derive(Debug, Clone)]
pub struct Artifact {
    pub contract_name: String,
    pub bytecode: Bytes,
    pub constructor_params: Vec<ParamType>,
    /// Raw ABI as found in the artifact, forwarded to explorer
    /// verification.
    pub abi: serde_json::Value,
    pub compiler_version: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("no compiled artifact found for contract {0:?}")]
    UnknownContract(String),
    #[error("artifact for {name:?} is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("invalid contract name {0:?}")]
    InvalidName(String),
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Calldata(#[from] CalldataError),
}

#[derive(Deserialize)]
struct RawArtifact {
    abi: serde_json::Value,
    bytecode: String,
    #[serde(default, alias = "compilerVersion")]
    compiler_version: Option<String>,
    #[serde(default, alias = "sourceCode")]
    source: Option<String>,
}

#[derive(Deserialize)]
struct AbiEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    inputs: Vec<AbiParam>,
}

#[derive(Deserialize)]
struct AbiParam {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    dir: PathBuf,
}

impl ArtifactResolver {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn resolve(&self, contract_name: &str) -> Result<Artifact, ArtifactError> {
        if contract_name.is_empty()
            || !contract_name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(ArtifactError::InvalidName(contract_name.to_owned()));
        }

        let path = self.dir.join(format!("{contract_name}.json"));
        if !path.exists() {
            return Err(ArtifactError::UnknownContract(contract_name.to_owned()));
        }

        let malformed = |reason: String| ArtifactError::Malformed {
            name: contract_name.to_owned(),
            reason,
        };

        let contents = std::fs::read_to_string(&path)?;
        let raw: RawArtifact =
            serde_json::from_str(&contents).map_err(|err| malformed(err.to_string()))?;

        let bytecode_hex = raw.bytecode.trim_start_matches("0x");
        let bytecode =
            hex::decode(bytecode_hex).map_err(|err| malformed(format!("bytecode: {err}")))?;
        if bytecode.is_empty() {
            return Err(malformed("artifact carries no bytecode".to_owned()));
        }

        let constructor_params = constructor_params(&raw.abi)
            .map_err(malformed)?
            .into_iter()
            .map(|kind| ParamType::parse(&kind))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Artifact {
            contract_name: contract_name.to_owned(),
            bytecode: Bytes::from(bytecode),
            constructor_params,
            abi: raw.abi,
            compiler_version: raw.compiler_version,
            source: raw.source,
        })
    }
}

/// Pulls the constructor input types out of the ABI. A contract without
/// a constructor entry takes no arguments.
fn constructor_params(abi: &serde_json::Value) -> Result<Vec<String>, String> {
    let entries: Vec<AbiEntry> =
        serde_json::from_value(abi.clone()).map_err(|err| format!("abi: {err}"))?;
    Ok(entries
        .into_iter()
        .find(|entry| entry.kind == "constructor")
        .map(|entry| entry.inputs.into_iter().map(|input| input.kind).collect())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const GREETER_ARTIFACT: &str = r#"{
        "contractName": "Greeter",
        "abi": [
            {
                "type": "constructor",
                "inputs": [
                    {"name": "_greeting", "type": "string"},
                    {"name": "_fee", "type": "uint256"}
                ],
                "stateMutability": "nonpayable"
            },
            {
                "type": "function",
                "name": "greet",
                "inputs": [],
                "outputs": [{"name": "", "type": "string"}]
            }
        ],
        "bytecode": "0x6080604052"
    }"#;

    fn write_artifact(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(format!("{name}.json")), contents).unwrap();
    }

    #[test]
    fn resolves_bytecode_and_constructor_params() {
        let dir = tempdir().unwrap();
        write_artifact(dir.path(), "Greeter", GREETER_ARTIFACT);

        let artifact = ArtifactResolver::new(dir.path()).resolve("Greeter").unwrap();
        assert_eq!(artifact.bytecode.as_ref(), &[0x60, 0x80, 0x60, 0x40, 0x52]);
        assert_eq!(
            artifact.constructor_params,
            vec![ParamType::String, ParamType::Uint(256)]
        );
    }

    #[test]
    fn unknown_contract_is_reported_by_name() {
        let dir = tempdir().unwrap();
        let err = ArtifactResolver::new(dir.path()).resolve("Missing").unwrap_err();
        assert!(matches!(err, ArtifactError::UnknownContract(name) if name == "Missing"));
    }

    #[test]
    fn missing_constructor_means_no_arguments() {
        let dir = tempdir().unwrap();
        write_artifact(
            dir.path(),
            "Bare",
            r#"{"abi": [], "bytecode": "0x00"}"#,
        );
        let artifact = ArtifactResolver::new(dir.path()).resolve("Bare").unwrap();
        assert!(artifact.constructor_params.is_empty());
    }

    #[test]
    fn empty_bytecode_is_malformed() {
        let dir = tempdir().unwrap();
        write_artifact(dir.path(), "Empty", r#"{"abi": [], "bytecode": "0x"}"#);
        let err = ArtifactResolver::new(dir.path()).resolve("Empty").unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed { .. }));
    }

    #[test]
    fn path_traversal_names_are_rejected() {
        let dir = tempdir().unwrap();
        let err = ArtifactResolver::new(dir.path())
            .resolve("../secrets")
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidName(_)));
    }
}
