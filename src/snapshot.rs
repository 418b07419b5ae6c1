use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::Registry;
use crate::domain::RepositoryName;
use crate::error::DtsError;
use crate::fs_util;
use crate::transfer::Transfer;

pub const SNAPSHOT_SCHEMA: &str = "dts-snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Transfer table plus adapter-private state, as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema: String,
    pub version: u32,
    pub instance: String,
    pub saved_at: DateTime<Utc>,
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub repositories: Vec<AdapterState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterState {
    pub name: String,
    pub state: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct SnapshotHeader {
    schema: String,
    version: u32,
}

impl Snapshot {
    /// Captures `transfers` and the save hook of every registered repository.
    /// A repository that cannot save its state fails the whole capture.
    pub fn capture<'a>(
        instance: &RepositoryName,
        transfers: impl IntoIterator<Item = &'a Transfer>,
        registry: &Registry,
        saved_at: DateTime<Utc>,
    ) -> Result<Self, DtsError> {
        let mut transfers: Vec<Transfer> = transfers.into_iter().cloned().collect();
        transfers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut repositories = Vec::new();
        for (name, repository) in registry.repositories() {
            let state = repository
                .save_state()
                .map_err(|err| DtsError::AdapterState {
                    repository: name.to_string(),
                    reason: err.to_string(),
                })?;
            repositories.push(AdapterState {
                name: name.to_string(),
                state,
            });
        }

        Ok(Self {
            schema: SNAPSHOT_SCHEMA.to_string(),
            version: SNAPSHOT_VERSION,
            instance: instance.to_string(),
            saved_at,
            transfers,
            repositories,
        })
    }

    /// Hands each saved adapter state back to the repository of the same name.
    pub fn restore_adapters(&self, registry: &Registry) {
        for saved in &self.repositories {
            let restored = registry
                .repository(&saved.name)
                .and_then(|repository| repository.load_state(&saved.state));
            if let Err(err) = restored {
                warn!(repository = %saved.name, error = %err, "could not restore adapter state");
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DtsError> {
        serde_json::to_vec_pretty(self).map_err(|err| DtsError::SnapshotWrite {
            path: self.instance.clone(),
            reason: err.to_string(),
        })
    }

    /// Parses a snapshot, checking schema and version before the body.
    pub fn decode(bytes: &[u8], origin: &str) -> Result<Self, DtsError> {
        let corrupt = |reason: String| DtsError::SnapshotCorrupt {
            path: origin.to_string(),
            reason,
        };
        let header: SnapshotHeader =
            serde_json::from_slice(bytes).map_err(|err| corrupt(err.to_string()))?;
        if header.schema != SNAPSHOT_SCHEMA {
            return Err(corrupt(format!("unexpected schema {:?}", header.schema)));
        }
        if header.version != SNAPSHOT_VERSION {
            return Err(DtsError::SnapshotVersion {
                found: header.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        serde_json::from_slice(bytes).map_err(|err| corrupt(err.to_string()))
    }
}

/// Snapshot file owned by one service instance.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: Utf8PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Utf8Path, instance: &RepositoryName) -> Self {
        Self {
            path: data_dir.join(format!("{instance}.snapshot.json")),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), DtsError> {
        let write_err = |reason: String| DtsError::SnapshotWrite {
            path: self.path.to_string(),
            reason,
        };
        let content = snapshot
            .encode()
            .map_err(|err| write_err(err.to_string()))?;
        fs_util::write_bytes_atomic(&self.path, &content).map_err(|err| write_err(err.to_string()))?;
        debug!(path = %self.path, transfers = snapshot.transfers.len(), "saved snapshot");
        Ok(())
    }

    /// `Ok(None)` when there is no usable prior state; corruption is an error.
    pub fn load(&self) -> Result<Option<Snapshot>, DtsError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                warn!(path = %self.path, error = %err, "snapshot unreadable, starting empty");
                return Ok(None);
            }
        };
        Snapshot::decode(&bytes, self.path.as_str()).map(Some)
    }
}
