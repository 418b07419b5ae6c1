//! Stage functions the engine applies to tasks on every poll tick.
//!
//! Stages never schedule themselves and never retry; an error from any
//! stage fails the owning task and the engine moves on.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{FileTransfer, Registry, StagingStatus};
use crate::domain::StatusCode;
use crate::error::DtsError;
use crate::fs_util::{self, ExtractedFile};
use crate::manifest::{MANIFEST_FILE_NAME, Manifest};
use crate::task::Task;
use crate::transfer::Transfer;

pub const CANCELED_MESSAGE: &str = "canceled by user request";

/// Everything a stage may consult besides the task itself.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub registry: &'a Registry,
    pub manifest_dir: &'a Utf8Path,
    pub manifest_endpoint: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Moves one task as far as the backends currently allow.
pub fn advance_task(task: &mut Task, destination_folder: &str, ctx: &StageContext<'_>) {
    if task.is_terminal() {
        return;
    }
    if let Err(err) = run_stages(task, destination_folder, ctx) {
        warn!(
            source_endpoint = %task.source_endpoint,
            destination_endpoint = %task.destination_endpoint,
            error = %err,
            "task failed"
        );
        task.fail(err.to_string());
    }
}

fn run_stages(
    task: &mut Task,
    destination_folder: &str,
    ctx: &StageContext<'_>,
) -> Result<(), DtsError> {
    if task.code() == StatusCode::Staging {
        prepare(task, ctx)?;
        // A freshly staged task starts copying in the same tick.
        if task.code() == StatusCode::Active {
            return transfer(task, destination_folder, ctx);
        }
        return Ok(());
    }
    if matches!(task.code(), StatusCode::Active | StatusCode::Inactive) {
        transfer(task, destination_folder, ctx)?;
    }
    if task.code() == StatusCode::Finalizing && task.needs_extraction() {
        extract(task, destination_folder, ctx)?;
    }
    Ok(())
}

/// Requests staging once, then polls it until every file is ready.
pub fn prepare(task: &mut Task, ctx: &StageContext<'_>) -> Result<(), DtsError> {
    if task.source_endpoint.is_empty() || !ctx.registry.has_endpoint(&task.source_endpoint) {
        return Err(DtsError::UnknownEndpoint(format!(
            "no endpoint serves {} (assigned {:?})",
            task.file_ids().join(", "),
            task.source_endpoint
        )));
    }
    ctx.registry.endpoint(&task.destination_endpoint)?;
    let repository = ctx.registry.repository(&task.source)?;

    let handle = match &task.staging {
        Some(handle) => handle.clone(),
        None => {
            let handle = repository
                .stage_files(&task.file_ids())
                .map_err(|err| DtsError::Staging(err.to_string()))?;
            debug!(staging = %handle, files = task.resources.len(), "requested staging");
            task.staging = Some(handle.clone());
            task.staging_status = Some(StagingStatus::Unknown);
            handle
        }
    };

    let status = repository
        .staging_status(&handle)
        .map_err(|err| DtsError::Staging(err.to_string()))?;
    task.staging_status = Some(status);
    match status {
        StagingStatus::Succeeded => {
            debug!(staging = %handle, "staging complete");
            task.advance_to(StatusCode::Active);
            Ok(())
        }
        StagingStatus::Failed => Err(DtsError::Staging(format!(
            "repository {} reported staging failure for {handle}",
            task.source
        ))),
        StagingStatus::Unknown | StagingStatus::Active => Ok(()),
    }
}

/// Starts the byte copy once files are staged, then tracks it to completion.
pub fn transfer(
    task: &mut Task,
    destination_folder: &str,
    ctx: &StageContext<'_>,
) -> Result<(), DtsError> {
    let source = ctx.registry.endpoint(&task.source_endpoint)?;

    let Some(handle) = task.transfer.clone() else {
        if !source.files_staged(&task.resources)? {
            debug!(endpoint = %task.source_endpoint, "files not yet visible at endpoint");
            return Ok(());
        }
        let destination = ctx.registry.endpoint(&task.destination_endpoint)?;
        let files = task.file_transfers(destination_folder);
        let handle = source
            .begin_transfer(destination.as_ref(), &files)
            .map_err(|err| DtsError::Transport(err.to_string()))?;
        debug!(transfer = %handle, files = files.len(), "began transfer");
        task.transfer = Some(handle);
        return Ok(());
    };

    let status = source
        .status(&handle)
        .map_err(|err| DtsError::Transport(err.to_string()))?;
    task.record_progress(status.num_files_transferred);
    match status.code {
        StatusCode::Succeeded => {
            task.record_progress(task.status.num_files);
            task.advance_to(StatusCode::Finalizing);
        }
        StatusCode::Failed => {
            return Err(DtsError::Transport(if status.message.is_empty() {
                format!("endpoint {} reported failure", task.source_endpoint)
            } else {
                status.message
            }));
        }
        code @ (StatusCode::Active | StatusCode::Inactive) if code != task.code() => {
            debug!(endpoint = %task.source_endpoint, to = %code, "transfer activity changed");
            task.advance_to(code);
        }
        _ => {}
    }
    Ok(())
}

/// Unpacks archive-bearing files the specification asked to extract.
pub fn extract(
    task: &mut Task,
    destination_folder: &str,
    ctx: &StageContext<'_>,
) -> Result<(), DtsError> {
    let destination = ctx.registry.endpoint(&task.destination_endpoint)?;
    let root = Utf8PathBuf::from(destination.root());
    let folder = root.join(destination_folder);

    let mut extracted = Vec::new();
    for request in &task.extract {
        let resource = task
            .resources
            .iter()
            .find(|res| res.id == request.file_id)
            .ok_or_else(|| {
                DtsError::Extraction(format!("{} is not part of this task", request.file_id))
            })?;
        let archive = folder.join(&resource.path);
        let target = archive.parent().unwrap_or(folder.as_path()).to_path_buf();

        let unpacked = match archive.extension() {
            Some("zip") => fs_util::extract_zip_members(&archive, &request.members, &target)?,
            Some("gz") => vec![fs_util::gunzip_file(&archive)?],
            _ => {
                return Err(DtsError::Extraction(format!(
                    "{} is not a supported archive",
                    resource.path
                )));
            }
        };
        for member in unpacked {
            let path = member
                .path
                .strip_prefix(&root)
                .map(|rel| rel.to_string())
                .unwrap_or_else(|_| member.path.to_string());
            extracted.push(ExtractedFile {
                archive_id: request.file_id.clone(),
                member: member.member,
                path,
                bytes: member.bytes,
                hash: member.hash,
            });
        }
    }

    debug!(files = extracted.len(), "extracted archive members");
    task.extracted = extracted;
    task.extraction_done = true;
    Ok(())
}

/// Writes the transfer manifest once every task is finalizing, optionally
/// pushes it to the destination, and then completes the tasks.
pub fn gather(transfer: &mut Transfer, ctx: &StageContext<'_>) -> Result<(), DtsError> {
    if transfer.is_terminal() || !transfer.ready_for_manifest() {
        return Ok(());
    }

    if transfer.manifest_path.is_none() {
        let manifest_id = *transfer.manifest_id.get_or_insert_with(Uuid::new_v4);
        let manifest = Manifest::for_transfer(transfer, manifest_id, ctx.now);
        let path = manifest.write(ctx.manifest_dir)?;
        info!(transfer_id = %transfer.id, manifest = %path, "wrote manifest");
        transfer.manifest_path = Some(path);
    }

    if !transfer.instructions.push_manifest() {
        complete(transfer);
        return Ok(());
    }

    let endpoint_name = ctx
        .manifest_endpoint
        .ok_or_else(|| DtsError::Manifest("no manifest endpoint configured".to_string()))?;
    let source = ctx.registry.endpoint(endpoint_name)?;

    match transfer.manifest_transfer.clone() {
        None => {
            let destination_endpoint = transfer
                .tasks
                .first()
                .map(|task| task.destination_endpoint.clone())
                .unwrap_or_default();
            let destination = ctx.registry.endpoint(&destination_endpoint)?;
            let file_name = transfer
                .manifest_path
                .as_ref()
                .and_then(|path| path.file_name())
                .ok_or_else(|| DtsError::Manifest("manifest path has no file name".to_string()))?
                .to_string();
            let files = [FileTransfer {
                source_path: file_name,
                destination_path: format!("{}/{MANIFEST_FILE_NAME}", transfer.destination_folder),
                hash: None,
            }];
            let handle = source
                .begin_transfer(destination.as_ref(), &files)
                .map_err(|err| DtsError::Manifest(err.to_string()))?;
            debug!(transfer_id = %transfer.id, handle = %handle, "pushing manifest");
            transfer.manifest_transfer = Some(handle);
        }
        Some(handle) => {
            let status = source
                .status(&handle)
                .map_err(|err| DtsError::Manifest(err.to_string()))?;
            match status.code {
                StatusCode::Succeeded => complete(transfer),
                StatusCode::Failed => {
                    return Err(DtsError::Manifest(format!(
                        "manifest push failed: {}",
                        status.message
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Acts on a cancellation request at the next checkpoint of every open task.
pub fn cancel(transfer: &mut Transfer, ctx: &StageContext<'_>) {
    for task in transfer.tasks.iter_mut().filter(|task| !task.is_terminal()) {
        if let Some(handle) = &task.transfer {
            let cancelled = ctx
                .registry
                .endpoint(&task.source_endpoint)
                .and_then(|endpoint| endpoint.cancel(handle));
            if let Err(err) = cancelled {
                warn!(transfer = %handle, error = %err, "endpoint cancel failed");
            }
        }
        task.fail(CANCELED_MESSAGE);
    }

    if let (Some(handle), Some(name)) = (&transfer.manifest_transfer, ctx.manifest_endpoint) {
        let cancelled = ctx
            .registry
            .endpoint(name)
            .and_then(|endpoint| endpoint.cancel(handle));
        if let Err(err) = cancelled {
            warn!(transfer = %handle, error = %err, "manifest push cancel failed");
        }
    }
}

fn complete(transfer: &mut Transfer) {
    for task in &mut transfer.tasks {
        task.advance_to(StatusCode::Succeeded);
    }
}
