//! Simulated backends: a directory-backed repository with delayed staging and
//! a local-filesystem endpoint whose copies complete after a fixed delay.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    FileTransfer, Registry, Repository, ResourceDescriptor, SearchParameters, SearchResults, StagingHandle,
    StagingStatus, TransferHandle, TransportEndpoint,
};
use crate::domain::{RepositoryName, StatusCode, TransferStatus};
use crate::error::DtsError;
use crate::fs_util;

/// Configured delays saturate instead of wrapping.
fn delay(ms: u64) -> TimeDelta {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

fn ready_at(delay: TimeDelta) -> DateTime<Utc> {
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRepositoryConfig {
    pub name: String,
    pub root: Utf8PathBuf,
    pub endpoint: String,
    /// First path segment -> endpoint serving files under it.
    #[serde(default)]
    pub tiers: BTreeMap<String, String>,
    #[serde(default)]
    pub staging_delay_ms: u64,
    /// External identity -> local username; empty means identities map to themselves.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEndpointConfig {
    pub name: String,
    pub root: Utf8PathBuf,
    #[serde(default)]
    pub transfer_delay_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StagingLedger {
    requests: BTreeMap<String, StagingRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StagingRequest {
    file_ids: Vec<String>,
    ready_at: DateTime<Utc>,
}

pub struct SimRepository {
    name: String,
    root: Utf8PathBuf,
    endpoint: String,
    tiers: BTreeMap<String, String>,
    staging_delay: TimeDelta,
    users: BTreeMap<String, String>,
    ledger: Mutex<StagingLedger>,
}

impl SimRepository {
    pub fn new(config: &SimRepositoryConfig) -> Self {
        Self {
            name: config.name.clone(),
            root: config.root.clone(),
            endpoint: config.endpoint.clone(),
            tiers: config.tiers.clone(),
            staging_delay: delay(config.staging_delay_ms),
            users: config.users.clone(),
            ledger: Mutex::new(StagingLedger::default()),
        }
    }

    fn file_path(&self, file_id: &str) -> Result<Utf8PathBuf, DtsError> {
        let relative = Utf8Path::new(file_id);
        let contained = relative
            .components()
            .all(|part| matches!(part, Utf8Component::Normal(_)));
        if file_id.is_empty() || !contained {
            return Err(DtsError::ResourceNotFound(file_id.to_string()));
        }
        let path = self.root.join(relative);
        if !path.is_file() {
            return Err(DtsError::ResourceNotFound(file_id.to_string()));
        }
        Ok(path)
    }

    fn endpoint_for(&self, file_id: &str) -> String {
        file_id
            .split_once('/')
            .and_then(|(tier, _)| self.tiers.get(tier))
            .cloned()
            .unwrap_or_else(|| self.endpoint.clone())
    }

    fn describe(&self, file_id: &str) -> Result<ResourceDescriptor, DtsError> {
        let path = self.file_path(file_id)?;
        let (bytes, hash) = fs_util::sha256_file(&path)?;
        Ok(ResourceDescriptor {
            id: file_id.to_string(),
            name: path.file_name().unwrap_or(file_id).to_string(),
            path: file_id.to_string(),
            format: path.extension().map(str::to_string),
            bytes,
            hash: Some(hash),
            endpoint: self.endpoint_for(file_id),
        })
    }

    fn file_ids(&self) -> Result<Vec<String>, DtsError> {
        let mut ids = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir).map_err(|err| DtsError::Filesystem(err.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|err| DtsError::Filesystem(err.to_string()))?;
                let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                    continue;
                };
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    ids.push(relative.as_str().replace('\\', "/"));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl Repository for SimRepository {
    fn endpoints(&self) -> Vec<String> {
        let mut endpoints = vec![self.endpoint.clone()];
        for endpoint in self.tiers.values() {
            if !endpoints.contains(endpoint) {
                endpoints.push(endpoint.clone());
            }
        }
        endpoints
    }

    fn search(&self, params: &SearchParameters) -> Result<SearchResults, DtsError> {
        let needle = params.query.to_lowercase();
        let matches: Vec<String> = self
            .file_ids()?
            .into_iter()
            .filter(|id| id.to_lowercase().contains(&needle))
            .collect();
        let total = matches.len();
        let resources = matches
            .iter()
            .skip(params.offset)
            .take(params.limit.unwrap_or(usize::MAX))
            .map(|id| self.describe(id))
            .collect::<Result<Vec<_>, DtsError>>()?;
        Ok(SearchResults { resources, total })
    }

    fn resolve_resources(&self, file_ids: &[String]) -> Result<Vec<ResourceDescriptor>, DtsError> {
        file_ids.iter().map(|id| self.describe(id)).collect()
    }

    fn stage_files(&self, file_ids: &[String]) -> Result<StagingHandle, DtsError> {
        for id in file_ids {
            self.file_path(id)?;
        }
        let handle = Uuid::new_v4().to_string();
        let request = StagingRequest {
            file_ids: file_ids.to_vec(),
            ready_at: ready_at(self.staging_delay),
        };
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .insert(handle.clone(), request);
        Ok(StagingHandle(handle))
    }

    fn staging_status(&self, handle: &StagingHandle) -> Result<StagingStatus, DtsError> {
        let request = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| DtsError::Staging(format!("unknown staging request {handle}")))?;
        if Utc::now() < request.ready_at {
            return Ok(StagingStatus::Active);
        }
        if request.file_ids.iter().any(|id| self.file_path(id).is_err()) {
            return Ok(StagingStatus::Failed);
        }
        Ok(StagingStatus::Succeeded)
    }

    fn resolve_local_user(&self, external_id: &str) -> Result<String, DtsError> {
        if self.users.is_empty() {
            return Ok(external_id.to_string());
        }
        self.users
            .get(external_id)
            .cloned()
            .ok_or_else(|| DtsError::UnknownUser(external_id.to_string()))
    }

    fn save_state(&self) -> Result<Vec<u8>, DtsError> {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_vec(&*ledger).map_err(|err| DtsError::Filesystem(err.to_string()))
    }

    fn load_state(&self, state: &[u8]) -> Result<(), DtsError> {
        let restored: StagingLedger =
            serde_json::from_slice(state).map_err(|err| DtsError::AdapterState {
                repository: self.name.clone(),
                reason: err.to_string(),
            })?;
        *self.ledger.lock().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Pending,
    Paused,
    Done { transferred: usize },
    Failed(String),
    Canceled,
}

#[derive(Debug, Clone)]
struct Job {
    destination_root: Utf8PathBuf,
    files: Vec<FileTransfer>,
    ready_at: DateTime<Utc>,
    state: JobState,
}

pub struct LocalEndpoint {
    name: String,
    root: Utf8PathBuf,
    transfer_delay: TimeDelta,
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl LocalEndpoint {
    pub fn new(config: &SimEndpointConfig) -> Self {
        Self {
            name: config.name.clone(),
            root: config.root.clone(),
            transfer_delay: delay(config.transfer_delay_ms),
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Suspends a pending copy; it reports `Inactive` until resumed.
    pub fn pause(&self, handle: &TransferHandle) -> Result<(), DtsError> {
        self.update(handle, |job| {
            if job.state == JobState::Pending {
                job.state = JobState::Paused;
            }
        })
    }

    pub fn resume(&self, handle: &TransferHandle) -> Result<(), DtsError> {
        self.update(handle, |job| {
            if job.state == JobState::Paused {
                job.state = JobState::Pending;
            }
        })
    }

    fn update(&self, handle: &TransferHandle, apply: impl FnOnce(&mut Job)) -> Result<(), DtsError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get_mut(&handle.0)
            .ok_or_else(|| DtsError::Transport(format!("unknown transfer {handle}")))?;
        apply(job);
        Ok(())
    }

    fn run_copies(&self, job: &Job) -> JobState {
        for file in &job.files {
            let source = self.root.join(&file.source_path);
            let dest = job.destination_root.join(&file.destination_path);
            if let Err(err) = fs_util::copy_file_atomic(&source, &dest) {
                return JobState::Failed(err.to_string());
            }
        }
        JobState::Done {
            transferred: job.files.len(),
        }
    }
}

impl TransportEndpoint for LocalEndpoint {
    fn root(&self) -> String {
        self.root.to_string()
    }

    fn files_staged(&self, resources: &[ResourceDescriptor]) -> Result<bool, DtsError> {
        Ok(resources
            .iter()
            .all(|res| self.root.join(&res.path).is_file()))
    }

    fn begin_transfer(
        &self,
        destination: &dyn TransportEndpoint,
        files: &[FileTransfer],
    ) -> Result<TransferHandle, DtsError> {
        let handle = Uuid::new_v4().to_string();
        let job = Job {
            destination_root: Utf8PathBuf::from(destination.root()),
            files: files.to_vec(),
            ready_at: ready_at(self.transfer_delay),
            state: JobState::Pending,
        };
        debug!(endpoint = %self.name, handle = %handle, files = files.len(), "queued copy");
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), job);
        Ok(TransferHandle(handle))
    }

    fn status(&self, handle: &TransferHandle) -> Result<TransferStatus, DtsError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get_mut(&handle.0)
            .ok_or_else(|| DtsError::Transport(format!("unknown transfer {handle}")))?;
        if job.state == JobState::Pending && Utc::now() >= job.ready_at {
            job.state = self.run_copies(job);
        }

        let num_files = job.files.len();
        let status = match &job.state {
            JobState::Pending => TransferStatus::new(StatusCode::Active, num_files),
            JobState::Paused => TransferStatus::new(StatusCode::Inactive, num_files),
            JobState::Done { transferred } => TransferStatus {
                code: StatusCode::Succeeded,
                message: String::new(),
                num_files,
                num_files_transferred: *transferred,
            },
            JobState::Failed(message) => TransferStatus::failed(message.clone(), num_files),
            JobState::Canceled => TransferStatus::failed("transfer canceled", num_files),
        };
        Ok(status)
    }

    fn cancel(&self, handle: &TransferHandle) -> Result<(), DtsError> {
        self.update(handle, |job| {
            if matches!(job.state, JobState::Pending | JobState::Paused) {
                job.state = JobState::Canceled;
            }
        })
    }
}

/// Builds a registry from simulated repository and endpoint definitions.
pub fn build_registry(
    repositories: &[SimRepositoryConfig],
    endpoints: &[SimEndpointConfig],
) -> Result<Registry, DtsError> {
    let mut registry = Registry::new();
    for endpoint in endpoints {
        registry = registry.with_endpoint(&endpoint.name, Arc::new(LocalEndpoint::new(endpoint)));
    }
    for repository in repositories {
        let name: RepositoryName = repository.name.parse()?;
        registry = registry.with_repository(name, Arc::new(SimRepository::new(repository)));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    fn repository(root: &Utf8Path) -> SimRepository {
        let mut tiers = BTreeMap::new();
        tiers.insert("tape".to_string(), "src-tape".to_string());
        SimRepository::new(&SimRepositoryConfig {
            name: "src".to_string(),
            root: root.to_path_buf(),
            endpoint: "src-disk".to_string(),
            tiers,
            staging_delay_ms: 0,
            users: BTreeMap::new(),
        })
    }

    #[test]
    fn resolve_assigns_tier_endpoints() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        fs::create_dir_all(root.join("tape")).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("tape/b.txt"), b"bb").unwrap();

        let repo = repository(&root);
        let resources = repo
            .resolve_resources(&["a.txt".to_string(), "tape/b.txt".to_string()])
            .unwrap();
        assert_eq!(resources[0].endpoint, "src-disk");
        assert_eq!(resources[1].endpoint, "src-tape");
        assert_eq!(resources[1].bytes, 2);
        assert_eq!(repo.endpoints(), vec!["src-disk", "src-tape"]);
    }

    #[test]
    fn resolve_rejects_escaping_ids() {
        let temp = tempfile::tempdir().unwrap();
        let repo = repository(&utf8(temp.path()));
        let err = repo.resolve_resources(&["../etc/passwd".to_string()]).unwrap_err();
        assert_matches!(err, DtsError::ResourceNotFound(_));
    }

    #[test]
    fn search_paginates_matches() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        for name in ["reads_1.fq", "reads_2.fq", "notes.md"] {
            fs::write(root.join(name), b"x").unwrap();
        }
        let repo = repository(&root);
        let results = repo
            .search(&SearchParameters {
                query: "READS".to_string(),
                offset: 1,
                limit: Some(5),
            })
            .unwrap();
        assert_eq!(results.total, 2);
        assert_eq!(results.resources.len(), 1);
        assert_eq!(results.resources[0].id, "reads_2.fq");
    }

    #[test]
    fn staging_state_survives_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        fs::write(root.join("a.txt"), b"a").unwrap();
        let repo = repository(&root);
        let handle = repo.stage_files(&["a.txt".to_string()]).unwrap();
        let saved = repo.save_state().unwrap();

        let restored = repository(&root);
        restored.load_state(&saved).unwrap();
        assert_eq!(
            restored.staging_status(&handle).unwrap(),
            StagingStatus::Succeeded
        );
    }

    #[test]
    fn oversized_staging_delay_saturates() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        fs::write(root.join("a.txt"), b"a").unwrap();
        let repo = SimRepository::new(&SimRepositoryConfig {
            name: "src".to_string(),
            root: root.clone(),
            endpoint: "src-disk".to_string(),
            tiers: BTreeMap::new(),
            staging_delay_ms: u64::MAX,
            users: BTreeMap::new(),
        });
        let handle = repo.stage_files(&["a.txt".to_string()]).unwrap();
        assert_eq!(repo.staging_status(&handle).unwrap(), StagingStatus::Active);
    }

    #[test]
    fn endpoint_copies_after_delay_and_honours_pause() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path());
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/a.txt"), b"payload").unwrap();
        let source = LocalEndpoint::new(&SimEndpointConfig {
            name: "src".to_string(),
            root: root.join("src"),
            transfer_delay_ms: 0,
        });
        let destination = LocalEndpoint::new(&SimEndpointConfig {
            name: "dst".to_string(),
            root: root.join("dst"),
            transfer_delay_ms: 0,
        });
        let files = [FileTransfer {
            source_path: "a.txt".to_string(),
            destination_path: "alice/a.txt".to_string(),
            hash: None,
        }];

        let handle = source.begin_transfer(&destination, &files).unwrap();
        source.pause(&handle).unwrap();
        assert_eq!(source.status(&handle).unwrap().code, StatusCode::Inactive);
        source.resume(&handle).unwrap();
        let status = source.status(&handle).unwrap();
        assert_eq!(status.code, StatusCode::Succeeded);
        assert_eq!(status.num_files_transferred, 1);
        assert_eq!(
            fs::read(root.join("dst/alice/a.txt")).unwrap(),
            b"payload".to_vec()
        );
    }
}
