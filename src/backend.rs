//! Capability contracts for the repositories and transport endpoints the
//! engine drives, plus the registry that resolves them by name.
//!
//! Adapters take `&self` everywhere and keep any mutable bookkeeping behind
//! their own locks; the engine calls them from its actor thread only.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{RepositoryName, TransferStatus};
use crate::error::DtsError;

/// Metadata for one file a repository can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    pub name: String,
    /// Location relative to the serving endpoint's root.
    pub path: String,
    #[serde(default)]
    pub format: Option<String>,
    pub bytes: u64,
    #[serde(default)]
    pub hash: Option<String>,
    /// Transport endpoint that serves this file; empty when unassigned.
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagingHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferHandle(pub String);

impl fmt::Display for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingStatus {
    Unknown,
    Active,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParameters {
    pub query: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub resources: Vec<ResourceDescriptor>,
    pub total: usize,
}

/// One file to copy, paths relative to the source and destination roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub source_path: String,
    pub destination_path: String,
    #[serde(default)]
    pub hash: Option<String>,
}

pub trait Repository: Send + Sync {
    /// Endpoints this repository serves files through; the first is the default.
    fn endpoints(&self) -> Vec<String>;
    fn search(&self, params: &SearchParameters) -> Result<SearchResults, DtsError>;
    fn resolve_resources(&self, file_ids: &[String]) -> Result<Vec<ResourceDescriptor>, DtsError>;
    fn stage_files(&self, file_ids: &[String]) -> Result<StagingHandle, DtsError>;
    fn staging_status(&self, handle: &StagingHandle) -> Result<StagingStatus, DtsError>;
    fn resolve_local_user(&self, external_id: &str) -> Result<String, DtsError>;
    fn save_state(&self) -> Result<Vec<u8>, DtsError>;
    fn load_state(&self, state: &[u8]) -> Result<(), DtsError>;
}

pub trait TransportEndpoint: Send + Sync {
    fn root(&self) -> String;
    fn files_staged(&self, resources: &[ResourceDescriptor]) -> Result<bool, DtsError>;
    fn begin_transfer(
        &self,
        destination: &dyn TransportEndpoint,
        files: &[FileTransfer],
    ) -> Result<TransferHandle, DtsError>;
    fn status(&self, handle: &TransferHandle) -> Result<TransferStatus, DtsError>;
    fn cancel(&self, handle: &TransferHandle) -> Result<(), DtsError>;
}

/// Named repositories and endpoints available to one engine.
#[derive(Clone, Default)]
pub struct Registry {
    repositories: BTreeMap<RepositoryName, Arc<dyn Repository>>,
    endpoints: BTreeMap<String, Arc<dyn TransportEndpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(mut self, name: RepositoryName, repository: Arc<dyn Repository>) -> Self {
        self.repositories.insert(name, repository);
        self
    }

    pub fn with_endpoint(
        mut self,
        name: impl Into<String>,
        endpoint: Arc<dyn TransportEndpoint>,
    ) -> Self {
        self.endpoints.insert(name.into(), endpoint);
        self
    }

    pub fn repository(&self, name: &str) -> Result<&Arc<dyn Repository>, DtsError> {
        let key: RepositoryName = name.parse()?;
        self.repositories
            .get(&key)
            .ok_or_else(|| DtsError::UnknownRepository(name.to_string()))
    }

    pub fn endpoint(&self, name: &str) -> Result<&Arc<dyn TransportEndpoint>, DtsError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| DtsError::UnknownEndpoint(name.to_string()))
    }

    pub fn has_endpoint(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    pub fn repositories(&self) -> impl Iterator<Item = (&RepositoryName, &Arc<dyn Repository>)> {
        self.repositories.iter()
    }

    /// Default endpoint of a repository, used as the destination of its tasks.
    pub fn default_endpoint(&self, repository: &str) -> Result<String, DtsError> {
        self.repository(repository)?
            .endpoints()
            .into_iter()
            .next()
            .ok_or_else(|| DtsError::UnknownEndpoint(format!("{repository} exposes no endpoint")))
    }

    pub fn search(
        &self,
        repository: &str,
        params: &SearchParameters,
    ) -> Result<SearchResults, DtsError> {
        self.repository(repository)?.search(params)
    }
}
