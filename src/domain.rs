use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DtsError;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = DtsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| DtsError::InvalidTransferId(value.to_string()))
    }
}

/// Name of a registered repository or service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RepositoryName {
    /// The default service instance name.
    fn default() -> Self {
        Self("dts".to_string())
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RepositoryName {
    type Err = DtsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !NAME_PATTERN.is_match(trimmed) {
            return Err(DtsError::InvalidRepositoryName(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = DtsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RepositoryName> for String {
    fn from(value: RepositoryName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Unknown,
    Staging,
    Active,
    Inactive,
    Finalizing,
    Succeeded,
    Failed,
}

impl StatusCode {
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusCode::Succeeded | StatusCode::Failed)
    }

    /// Position along the pipeline; a multi-task transfer reports the lowest.
    pub fn progress_rank(self) -> u8 {
        match self {
            StatusCode::Unknown => 0,
            StatusCode::Staging => 1,
            StatusCode::Active => 2,
            StatusCode::Inactive => 3,
            StatusCode::Finalizing => 4,
            StatusCode::Succeeded => 5,
            StatusCode::Failed => 6,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusCode::Unknown => "unknown",
            StatusCode::Staging => "staging",
            StatusCode::Active => "active",
            StatusCode::Inactive => "inactive",
            StatusCode::Finalizing => "finalizing",
            StatusCode::Succeeded => "succeeded",
            StatusCode::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
    pub num_files: usize,
    pub num_files_transferred: usize,
}

impl TransferStatus {
    pub fn new(code: StatusCode, num_files: usize) -> Self {
        Self {
            code,
            message: String::new(),
            num_files,
            num_files_transferred: 0,
        }
    }

    pub fn failed(message: impl Into<String>, num_files: usize) -> Self {
        Self {
            code: StatusCode::Failed,
            message: message.into(),
            num_files,
            num_files_transferred: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identity in the federation the client authenticated with (e.g. an ORCID).
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnownInstruction {
    Extract {
        file_id: String,
        #[serde(default)]
        members: Vec<String>,
    },
    PushManifest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instruction {
    Known(KnownInstruction),
    Unrecognized(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub file_id: String,
    pub members: Vec<String>,
}

/// Post-processing instructions attached to a specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instructions(Vec<Instruction>);

impl Instructions {
    pub fn new(items: Vec<Instruction>) -> Self {
        Self(items)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.0.iter()
    }

    pub fn extract_requests(&self) -> Vec<ExtractRequest> {
        self.0
            .iter()
            .filter_map(|item| match item {
                Instruction::Known(KnownInstruction::Extract { file_id, members }) => {
                    Some(ExtractRequest {
                        file_id: file_id.clone(),
                        members: members.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    pub fn push_manifest(&self) -> bool {
        self.0
            .iter()
            .any(|item| matches!(item, Instruction::Known(KnownInstruction::PushManifest)))
    }

    pub fn unrecognized(&self) -> Vec<&Value> {
        self.0
            .iter()
            .filter_map(|item| match item {
                Instruction::Unrecognized(value) => Some(value),
                Instruction::Known(_) => None,
            })
            .collect()
    }

    pub fn validate(&self, file_ids: &[String], manifest_endpoint: bool) -> Result<(), DtsError> {
        for item in &self.0 {
            match item {
                Instruction::Known(KnownInstruction::Extract { file_id, members }) => {
                    if !file_ids.iter().any(|id| id == file_id) {
                        return Err(DtsError::InvalidInstructions(format!(
                            "extract names {file_id}, which is not a requested file"
                        )));
                    }
                    if members.iter().any(|member| member.trim().is_empty()) {
                        return Err(DtsError::InvalidInstructions(format!(
                            "extract for {file_id} lists an empty member name"
                        )));
                    }
                }
                Instruction::Known(KnownInstruction::PushManifest) => {
                    if !manifest_endpoint {
                        return Err(DtsError::InvalidInstructions(
                            "push_manifest requires a configured manifest endpoint".to_string(),
                        ));
                    }
                }
                Instruction::Unrecognized(value) => {
                    // A known kind that failed to parse is malformed, not foreign.
                    let kind = value.get("kind").and_then(Value::as_str);
                    if matches!(kind, Some("extract") | Some("push_manifest")) {
                        return Err(DtsError::InvalidInstructions(format!(
                            "malformed {} instruction: {value}",
                            kind.unwrap_or_default()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// What a client submits to start a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub source: String,
    pub destination: String,
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: Instructions,
    pub user: User,
}

impl Specification {
    /// File ids in first-seen order with duplicates dropped.
    pub fn unique_file_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.file_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }
}
