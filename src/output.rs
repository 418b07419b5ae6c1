use std::io::{self, Write};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::SearchResults;
use crate::domain::{StatusCode, TransferId, TransferStatus};
use crate::snapshot::Snapshot;
use crate::transfer::Transfer;

/// One observed status change while a CLI run waits on a transfer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub transfer_id: TransferId,
    pub at: DateTime<Utc>,
    pub status: TransferStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub destination_folder: String,
    pub payload_bytes: u64,
    pub manifest: Option<Utf8PathBuf>,
}

impl RunReport {
    pub fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id,
            status: transfer.status(),
            destination_folder: transfer.destination_folder.clone(),
            payload_bytes: transfer.payload_bytes,
            manifest: transfer.manifest_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub path: Utf8PathBuf,
    pub instance: String,
    pub saved_at: DateTime<Utc>,
    pub transfers: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub id: TransferId,
    pub code: StatusCode,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SnapshotSummary {
    pub fn new(path: Utf8PathBuf, snapshot: &Snapshot) -> Self {
        let transfers = snapshot
            .transfers
            .iter()
            .map(|transfer| {
                let status = transfer.status();
                SnapshotEntry {
                    id: transfer.id,
                    code: status.code,
                    message: status.message,
                    created_at: transfer.created_at,
                    completed_at: transfer.completed_at,
                }
            })
            .collect();
        Self {
            path,
            instance: snapshot.instance.clone(),
            saved_at: snapshot.saved_at,
            transfers,
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    /// Single line, so a run's progress can be piped line by line.
    pub fn print_event(event: &StatusEvent) -> io::Result<()> {
        let json = serde_json::to_string(event).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }

    pub fn print_run(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_search(results: &SearchResults) -> io::Result<()> {
        Self::print_json(results)
    }

    pub fn print_snapshot(summary: &SnapshotSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
