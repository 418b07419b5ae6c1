use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{
    FileTransfer, ResourceDescriptor, StagingHandle, StagingStatus, TransferHandle,
};
use crate::domain::{ExtractRequest, StatusCode, TransferStatus};
use crate::fs_util::ExtractedFile;

/// Work for one (source endpoint, destination endpoint) pair of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub source: String,
    pub destination: String,
    pub source_endpoint: String,
    pub destination_endpoint: String,
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub extract: Vec<ExtractRequest>,
    #[serde(default)]
    pub staging: Option<StagingHandle>,
    #[serde(default)]
    pub staging_status: Option<StagingStatus>,
    #[serde(default)]
    pub transfer: Option<TransferHandle>,
    pub status: TransferStatus,
    #[serde(default)]
    pub extracted: Vec<ExtractedFile>,
    #[serde(default)]
    pub extraction_done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        source_endpoint: impl Into<String>,
        destination_endpoint: impl Into<String>,
        resources: Vec<ResourceDescriptor>,
        extract: Vec<ExtractRequest>,
    ) -> Self {
        let num_files = resources.len();
        let mut task = Self {
            source: source.into(),
            destination: destination.into(),
            source_endpoint: source_endpoint.into(),
            destination_endpoint: destination_endpoint.into(),
            resources,
            extract,
            staging: None,
            staging_status: None,
            transfer: None,
            status: TransferStatus::new(StatusCode::Unknown, num_files),
            extracted: Vec::new(),
            extraction_done: false,
            error: None,
        };
        task.advance_to(StatusCode::Staging);
        task
    }

    pub fn code(&self) -> StatusCode {
        self.status.code
    }

    pub fn is_terminal(&self) -> bool {
        self.status.code.is_terminal()
    }

    pub fn file_ids(&self) -> Vec<String> {
        self.resources.iter().map(|res| res.id.clone()).collect()
    }

    pub fn payload_bytes(&self) -> u64 {
        self.resources.iter().map(|res| res.bytes).sum()
    }

    /// Copies for this task, landing under `destination_folder` at the destination root.
    pub fn file_transfers(&self, destination_folder: &str) -> Vec<FileTransfer> {
        self.resources
            .iter()
            .map(|res| FileTransfer {
                source_path: res.path.clone(),
                destination_path: format!("{destination_folder}/{}", res.path),
                hash: res.hash.clone(),
            })
            .collect()
    }

    pub fn needs_extraction(&self) -> bool {
        !self.extract.is_empty() && !self.extraction_done
    }

    /// Moves to `next` if the state machine allows it; returns whether it moved.
    pub fn advance_to(&mut self, next: StatusCode) -> bool {
        let current = self.status.code;
        if !allowed(current, next) {
            debug!(from = %current, to = %next, "ignoring task transition");
            return false;
        }
        self.status.code = next;
        true
    }

    pub fn record_progress(&mut self, transferred: usize) {
        self.status.num_files_transferred = transferred.min(self.status.num_files);
    }

    /// Terminal failure; the first error wins.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let message = message.into();
        self.status.code = StatusCode::Failed;
        self.status.message = message.clone();
        self.error.get_or_insert(message);
    }
}

fn allowed(from: StatusCode, to: StatusCode) -> bool {
    use StatusCode::*;
    match (from, to) {
        (Unknown, Staging) => true,
        (Staging, Active) => true,
        (Active, Inactive) | (Inactive, Active) => true,
        (Active, Finalizing) | (Inactive, Finalizing) => true,
        (Finalizing, Succeeded) => true,
        (from, Failed) => !from.is_terminal(),
        _ => false,
    }
}
