//! Inventory of what a transfer delivered, written once per transfer.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Instructions, TransferId, User};
use crate::error::DtsError;
use crate::fs_util;
use crate::transfer::Transfer;

pub const MANIFEST_PROFILE: &str = "data-package";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub profile: String,
    pub id: Uuid,
    pub transfer_id: TransferId,
    pub created: DateTime<Utc>,
    pub description: String,
    pub source: String,
    pub destination: String,
    pub destination_folder: String,
    pub user: User,
    pub instructions: Instructions,
    pub resources: Vec<ManifestResource>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestResource {
    pub id: String,
    pub name: String,
    /// Location relative to the destination endpoint root.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_from: Option<String>,
}

impl Manifest {
    pub fn for_transfer(transfer: &Transfer, id: Uuid, created: DateTime<Utc>) -> Self {
        let folder = transfer.destination_folder.as_str();
        let mut resources = Vec::new();
        for task in &transfer.tasks {
            for res in &task.resources {
                resources.push(ManifestResource {
                    id: res.id.clone(),
                    name: res.name.clone(),
                    path: format!("{folder}/{}", res.path),
                    format: res.format.clone(),
                    bytes: res.bytes,
                    hash: res.hash.clone(),
                    extracted_from: None,
                });
            }
            for file in &task.extracted {
                resources.push(ManifestResource {
                    id: format!("{}#{}", file.archive_id, file.member),
                    name: file.member.clone(),
                    path: file.path.clone(),
                    format: None,
                    bytes: file.bytes,
                    hash: Some(file.hash.clone()),
                    extracted_from: Some(file.archive_id.clone()),
                });
            }
        }
        let total_bytes = resources.iter().map(|res| res.bytes).sum();

        Self {
            name: "manifest".to_string(),
            profile: MANIFEST_PROFILE.to_string(),
            id,
            transfer_id: transfer.id,
            created,
            description: transfer.description.clone(),
            source: transfer.source.clone(),
            destination: transfer.destination.clone(),
            destination_folder: transfer.destination_folder.clone(),
            user: transfer.user.clone(),
            instructions: transfer.instructions.clone(),
            resources,
            total_bytes,
        }
    }

    pub fn path_in(&self, manifest_dir: &Utf8Path) -> Utf8PathBuf {
        manifest_dir.join(format!("{}.json", self.id))
    }

    /// Writes the manifest atomically and returns where it landed.
    pub fn write(&self, manifest_dir: &Utf8Path) -> Result<Utf8PathBuf, DtsError> {
        let path = self.path_in(manifest_dir);
        let content =
            serde_json::to_vec_pretty(self).map_err(|err| DtsError::Manifest(err.to_string()))?;
        fs_util::write_bytes_atomic(&path, &content)
            .map_err(|err| DtsError::Manifest(err.to_string()))?;
        Ok(path)
    }
}
