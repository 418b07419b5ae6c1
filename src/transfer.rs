use std::collections::HashMap;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::backend::{Registry, ResourceDescriptor, TransferHandle};
use crate::domain::{
    Instructions, Specification, StatusCode, TransferId, TransferStatus, User,
};
use crate::error::DtsError;
use crate::task::Task;

/// Client-visible aggregate of the tasks created from one specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub source: String,
    pub destination: String,
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: Instructions,
    pub user: User,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub canceled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub destination_folder: String,
    #[serde(default)]
    pub manifest_id: Option<Uuid>,
    #[serde(default)]
    pub manifest_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub manifest_transfer: Option<TransferHandle>,
    pub payload_bytes: u64,
}

impl Transfer {
    /// Validates a specification and splits it into one task per endpoint pair.
    ///
    /// Backend calls made here (user lookup, resource resolution) are
    /// request validation: any failure rejects the specification outright.
    /// Files whose endpoint cannot be served still get a task, which fails
    /// during prepare.
    pub fn scatter(
        spec: &Specification,
        registry: &Registry,
        manifest_endpoint: bool,
        now: DateTime<Utc>,
    ) -> Result<Self, DtsError> {
        if spec.file_ids.is_empty() {
            return Err(DtsError::NoFilesRequested);
        }
        let file_ids = spec.unique_file_ids();

        let source = registry.repository(&spec.source)?;
        let destination = registry.repository(&spec.destination)?;
        spec.instructions.validate(&file_ids, manifest_endpoint)?;
        for value in spec.instructions.unrecognized() {
            warn!(instruction = %value, "carrying unrecognized instruction");
        }

        let destination_endpoint = registry.default_endpoint(&spec.destination)?;
        let local_user = destination.resolve_local_user(&spec.user.id)?;
        let resources = with_unresolved(&file_ids, source.resolve_resources(&file_ids)?);
        let payload_bytes = resources.iter().map(|res| res.bytes).sum();

        let extract = spec.instructions.extract_requests();
        let tasks = group_by_endpoint(resources)
            .into_iter()
            .map(|(endpoint, resources)| {
                let task_extract = extract
                    .iter()
                    .filter(|req| resources.iter().any(|res| res.id == req.file_id))
                    .cloned()
                    .collect();
                Task::new(
                    spec.source.as_str(),
                    spec.destination.as_str(),
                    endpoint,
                    destination_endpoint.as_str(),
                    resources,
                    task_extract,
                )
            })
            .collect();

        let id = TransferId::new();
        Ok(Self {
            id,
            source: spec.source.clone(),
            destination: spec.destination.clone(),
            file_ids,
            description: spec.description.clone(),
            instructions: spec.instructions.clone(),
            user: spec.user.clone(),
            tasks,
            canceled: false,
            created_at: now,
            completed_at: None,
            destination_folder: format!("{local_user}/dts-{id}"),
            manifest_id: None,
            manifest_path: None,
            manifest_transfer: None,
            payload_bytes,
        })
    }

    /// Aggregate status derived from the tasks.
    pub fn status(&self) -> TransferStatus {
        let num_files = self.tasks.iter().map(|task| task.status.num_files).sum();
        let num_files_transferred = self
            .tasks
            .iter()
            .map(|task| task.status.num_files_transferred)
            .sum();

        let failed: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|task| task.code() == StatusCode::Failed)
            .collect();
        if let Some(first) = failed.first() {
            let message = if self.tasks.len() == 1 {
                first.status.message.clone()
            } else {
                format!(
                    "{} of {} tasks failed: {}",
                    failed.len(),
                    self.tasks.len(),
                    first.status.message
                )
            };
            return TransferStatus {
                code: StatusCode::Failed,
                message,
                num_files,
                num_files_transferred,
            };
        }

        let slowest = self
            .tasks
            .iter()
            .filter(|task| task.code() != StatusCode::Succeeded)
            .min_by_key(|task| task.code().progress_rank());
        let (code, message) = match slowest {
            Some(task) => (task.code(), task.status.message.clone()),
            None if self.tasks.is_empty() => (StatusCode::Unknown, String::new()),
            None => (StatusCode::Succeeded, String::new()),
        };
        TransferStatus {
            code,
            message,
            num_files,
            num_files_transferred,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().code.is_terminal()
    }

    /// Every task has finished copying and extracting; ready for the manifest.
    pub fn ready_for_manifest(&self) -> bool {
        self.tasks
            .iter()
            .all(|task| task.code() == StatusCode::Finalizing && !task.needs_extraction())
    }

    pub fn fail_open_tasks(&mut self, message: &str) {
        for task in self.tasks.iter_mut().filter(|task| !task.is_terminal()) {
            task.fail(message);
        }
    }

    /// Terminal for longer than `retention` as of `now`.
    pub fn expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.completed_at
            .and_then(|done| done.checked_add_signed(retention))
            .is_some_and(|end| end < now)
    }
}

/// One descriptor per requested id, in request order. Ids the repository
/// did not describe get an endpoint-less placeholder whose task fails in
/// prepare.
fn with_unresolved(
    file_ids: &[String],
    resolved: Vec<ResourceDescriptor>,
) -> Vec<ResourceDescriptor> {
    let mut by_id: HashMap<String, ResourceDescriptor> = HashMap::new();
    for res in resolved {
        if file_ids.contains(&res.id) {
            by_id.entry(res.id.clone()).or_insert(res);
        } else {
            warn!(file_id = %res.id, "repository described a file that was not requested");
        }
    }
    file_ids
        .iter()
        .map(|id| {
            by_id.remove(id).unwrap_or_else(|| {
                warn!(file_id = %id, "repository did not resolve file");
                ResourceDescriptor {
                    id: id.clone(),
                    name: id.clone(),
                    path: id.clone(),
                    format: None,
                    bytes: 0,
                    hash: None,
                    endpoint: String::new(),
                }
            })
        })
        .collect()
}

/// Groups resources by serving endpoint, keeping first-seen order.
fn group_by_endpoint(resources: Vec<ResourceDescriptor>) -> Vec<(String, Vec<ResourceDescriptor>)> {
    let mut groups: Vec<(String, Vec<ResourceDescriptor>)> = Vec::new();
    for res in resources {
        match groups.iter_mut().find(|(endpoint, _)| *endpoint == res.endpoint) {
            Some((_, members)) => members.push(res),
            None => groups.push((res.endpoint.clone(), vec![res])),
        }
    }
    groups
}
