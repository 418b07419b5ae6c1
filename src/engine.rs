//! Single-threaded command actor that owns the transfer table.
//!
//! Clients talk to the worker thread through a bounded queue of
//! (request, reply channel) pairs. A ticker on the same `select!` drives
//! the poll step, so table mutations never overlap.

use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use tracing::{debug, error, info, warn};

use crate::backend::Registry;
use crate::config::EngineConfig;
use crate::domain::{Specification, TransferId, TransferStatus};
use crate::error::DtsError;
use crate::fs_util;
use crate::pipeline::{self, StageContext};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::transfer::Transfer;

type Reply<T> = Sender<Result<T, DtsError>>;

enum Command {
    Create {
        spec: Box<Specification>,
        reply: Reply<TransferId>,
    },
    Cancel {
        id: TransferId,
        reply: Reply<()>,
    },
    Status {
        id: TransferId,
        reply: Reply<TransferStatus>,
    },
    Describe {
        id: TransferId,
        reply: Reply<Transfer>,
    },
    Stop {
        reply: Reply<()>,
    },
}

/// The transfer table and the operations applied to it.
///
/// Only the engine's worker thread touches a live table; tests drive one
/// directly with explicit timestamps.
pub struct TransferTable {
    config: EngineConfig,
    registry: Registry,
    transfers: BTreeMap<TransferId, Transfer>,
}

impl TransferTable {
    pub fn new(config: EngineConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            transfers: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TransferId> {
        self.transfers.keys()
    }

    pub fn get(&self, id: &TransferId) -> Option<&Transfer> {
        self.transfers.get(id)
    }

    pub fn create(
        &mut self,
        spec: &Specification,
        now: DateTime<Utc>,
    ) -> Result<TransferId, DtsError> {
        let transfer = Transfer::scatter(
            spec,
            &self.registry,
            self.config.manifest_endpoint.is_some(),
            now,
        )?;
        let id = transfer.id;
        info!(
            transfer_id = %id,
            source = %transfer.source,
            destination = %transfer.destination,
            files = transfer.file_ids.len(),
            tasks = transfer.tasks.len(),
            "created transfer"
        );
        self.transfers.insert(id, transfer);
        Ok(id)
    }

    /// Flags a transfer for cancellation; the next poll acts on it.
    pub fn cancel(&mut self, id: &TransferId) -> Result<(), DtsError> {
        let transfer = self
            .transfers
            .get_mut(id)
            .ok_or(DtsError::TransferNotFound(*id))?;
        if !transfer.canceled {
            info!(transfer_id = %id, "cancellation requested");
            transfer.canceled = true;
        }
        Ok(())
    }

    pub fn status(&self, id: &TransferId) -> Result<TransferStatus, DtsError> {
        self.transfers
            .get(id)
            .map(Transfer::status)
            .ok_or(DtsError::TransferNotFound(*id))
    }

    /// Advances every open transfer by one step, then purges expired ones.
    pub fn poll(&mut self, now: DateTime<Utc>) {
        let ctx = StageContext {
            registry: &self.registry,
            manifest_dir: &self.config.manifest_dir,
            manifest_endpoint: self.config.manifest_endpoint.as_deref(),
            now,
        };
        for transfer in self.transfers.values_mut() {
            poll_transfer(transfer, &ctx);
        }

        let retention = self.config.retention;
        self.transfers.retain(|id, transfer| {
            let expired = transfer.expired(now, retention);
            if expired {
                info!(transfer_id = %id, "purged expired transfer");
            }
            !expired
        });
    }

    pub fn snapshot(&self, saved_at: DateTime<Utc>) -> Result<Snapshot, DtsError> {
        Snapshot::capture(
            &self.config.instance_name,
            self.transfers.values(),
            &self.registry,
            saved_at,
        )
    }

    /// Replaces the table with a snapshot's transfers and restores adapter state.
    pub fn restore(&mut self, snapshot: Snapshot) {
        snapshot.restore_adapters(&self.registry);
        self.transfers = snapshot
            .transfers
            .into_iter()
            .map(|transfer| (transfer.id, transfer))
            .collect();
    }
}

fn poll_transfer(transfer: &mut Transfer, ctx: &StageContext<'_>) {
    let before = transfer.status().code;
    if !before.is_terminal() {
        if transfer.canceled {
            pipeline::cancel(transfer, ctx);
        } else {
            for task in transfer.tasks.iter_mut() {
                pipeline::advance_task(task, &transfer.destination_folder, ctx);
            }
            if let Err(err) = pipeline::gather(transfer, ctx) {
                warn!(transfer_id = %transfer.id, error = %err, "manifest stage failed");
                transfer.fail_open_tasks(&err.to_string());
            }
        }
    }

    let after = transfer.status().code;
    if after != before {
        debug!(transfer_id = %transfer.id, from = %before, to = %after, "status changed");
    }
    if after.is_terminal() && transfer.completed_at.is_none() {
        info!(transfer_id = %transfer.id, status = %after, "transfer finished");
        transfer.completed_at = Some(ctx.now);
    }
}

struct Worker {
    tx: Sender<Command>,
    handle: JoinHandle<()>,
}

/// Handle to the engine; all methods are safe to call from any thread.
pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    worker: Option<Worker>,
}

impl Engine {
    pub fn new(config: EngineConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            worker: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Restores the previous snapshot and starts accepting requests.
    pub fn start(&mut self) -> Result<(), DtsError> {
        if self.worker.is_some() {
            return Err(DtsError::AlreadyRunning);
        }
        fs_util::ensure_writable_dir(&self.config.data_dir)?;
        fs_util::ensure_writable_dir(&self.config.manifest_dir)?;

        let store = self.config.snapshot_store();
        let mut table = TransferTable::new(self.config.clone(), self.registry.clone());
        match store.load() {
            Ok(Some(snapshot)) => {
                info!(
                    path = %store.path(),
                    transfers = snapshot.transfers.len(),
                    "restored snapshot"
                );
                table.restore(snapshot);
            }
            Ok(None) => debug!(path = %store.path(), "no prior snapshot"),
            Err(err) => {
                error!(path = %store.path(), error = %err, "ignoring unusable snapshot, starting empty");
            }
        }

        let (tx, rx) = bounded(self.config.queue_capacity.max(1));
        let ticker = tick(self.config.poll_interval);
        let handle = thread::Builder::new()
            .name(format!("dts-{}", self.config.instance_name))
            .spawn(move || run(table, store, rx, ticker))
            .map_err(|err| DtsError::WorkerSpawn(err.to_string()))?;

        info!(
            instance = %self.config.instance_name,
            poll_interval = ?self.config.poll_interval,
            "engine started"
        );
        self.worker = Some(Worker { tx, handle });
        Ok(())
    }

    /// Persists the table and stops the worker. A failed save is returned
    /// after the worker has exited.
    pub fn stop(&mut self) -> Result<(), DtsError> {
        let worker = self.worker.take().ok_or(DtsError::NotRunning)?;
        let (reply, response) = bounded(1);
        let outcome = match worker.tx.send(Command::Stop { reply }) {
            Ok(()) => response
                .recv()
                .unwrap_or(Err(DtsError::EngineDisconnected)),
            Err(_) => Err(DtsError::EngineDisconnected),
        };
        drop(worker.tx);
        if worker.handle.join().is_err() {
            error!("engine thread panicked");
            return Err(DtsError::EngineDisconnected);
        }
        info!(instance = %self.config.instance_name, "engine stopped");
        outcome
    }

    pub fn create(&self, spec: Specification) -> Result<TransferId, DtsError> {
        self.request(|reply| Command::Create {
            spec: Box::new(spec),
            reply,
        })
    }

    pub fn cancel(&self, id: TransferId) -> Result<(), DtsError> {
        self.request(|reply| Command::Cancel { id, reply })
    }

    pub fn status(&self, id: TransferId) -> Result<TransferStatus, DtsError> {
        self.request(|reply| Command::Status { id, reply })
    }

    /// Full record of a transfer, including tasks and manifest location.
    pub fn transfer(&self, id: TransferId) -> Result<Transfer, DtsError> {
        self.request(|reply| Command::Describe { id, reply })
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, DtsError> {
        let worker = self.worker.as_ref().ok_or(DtsError::NotRunning)?;
        let (reply, response) = bounded(1);
        worker
            .tx
            .send(command(reply))
            .map_err(|_| DtsError::EngineDisconnected)?;
        response.recv().map_err(|_| DtsError::EngineDisconnected)?
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.stop() {
                error!(error = %err, "engine did not shut down cleanly");
            }
        }
    }
}

fn run(mut table: TransferTable, store: SnapshotStore, rx: Receiver<Command>, ticker: Receiver<Instant>) {
    loop {
        select! {
            recv(rx) -> command => {
                let Ok(command) = command else {
                    // Every handle is gone without a Stop; keep what we have.
                    if let Err(err) = persist(&table, &store) {
                        error!(error = %err, "failed to save snapshot");
                    }
                    return;
                };
                match command {
                    Command::Create { spec, reply } => {
                        let _ = reply.send(table.create(&spec, Utc::now()));
                    }
                    Command::Cancel { id, reply } => {
                        let _ = reply.send(table.cancel(&id));
                    }
                    Command::Status { id, reply } => {
                        let _ = reply.send(table.status(&id));
                    }
                    Command::Describe { id, reply } => {
                        let found = table.get(&id).cloned().ok_or(DtsError::TransferNotFound(id));
                        let _ = reply.send(found);
                    }
                    Command::Stop { reply } => {
                        let saved = persist(&table, &store);
                        if let Err(err) = &saved {
                            error!(error = %err, "failed to save snapshot");
                        }
                        let _ = reply.send(saved);
                        return;
                    }
                }
            }
            recv(ticker) -> _ => table.poll(Utc::now()),
        }
    }
}

fn persist(table: &TransferTable, store: &SnapshotStore) -> Result<(), DtsError> {
    store.save(&table.snapshot(Utc::now())?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::backend::{
        Repository, ResourceDescriptor, SearchParameters, SearchResults, StagingHandle,
        StagingStatus,
    };

    /// Repository whose ledger can never be saved.
    struct UnsavableRepository;

    impl Repository for UnsavableRepository {
        fn endpoints(&self) -> Vec<String> {
            Vec::new()
        }

        fn search(&self, _params: &SearchParameters) -> Result<SearchResults, DtsError> {
            Err(DtsError::ResourceNotFound("not implemented".to_string()))
        }

        fn resolve_resources(&self, _ids: &[String]) -> Result<Vec<ResourceDescriptor>, DtsError> {
            Ok(Vec::new())
        }

        fn stage_files(&self, _ids: &[String]) -> Result<StagingHandle, DtsError> {
            Err(DtsError::Staging("not implemented".to_string()))
        }

        fn staging_status(&self, _handle: &StagingHandle) -> Result<StagingStatus, DtsError> {
            Ok(StagingStatus::Unknown)
        }

        fn resolve_local_user(&self, external_id: &str) -> Result<String, DtsError> {
            Ok(external_id.to_string())
        }

        fn save_state(&self) -> Result<Vec<u8>, DtsError> {
            Err(DtsError::Filesystem("ledger disk full".to_string()))
        }

        fn load_state(&self, _state: &[u8]) -> Result<(), DtsError> {
            Ok(())
        }
    }

    fn engine() -> (tempfile::TempDir, Engine) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, Engine::new(EngineConfig::new(dir), Registry::new()))
    }

    #[test]
    fn requests_before_start_are_rejected() {
        let (_temp, engine) = engine();
        assert_matches!(engine.status(TransferId::new()), Err(DtsError::NotRunning));
    }

    #[test]
    fn lifecycle_errors() {
        let (_temp, mut engine) = engine();
        assert_matches!(engine.stop(), Err(DtsError::NotRunning));
        engine.start().unwrap();
        assert_matches!(engine.start(), Err(DtsError::AlreadyRunning));
        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert!(engine.config().snapshot_store().path().exists());
    }

    #[test]
    fn stop_reports_unsavable_adapter_state() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let registry = Registry::new()
            .with_repository("ledger".parse().unwrap(), Arc::new(UnsavableRepository));
        let mut engine = Engine::new(EngineConfig::new(dir), registry);

        engine.start().unwrap();
        assert_matches!(
            engine.stop(),
            Err(DtsError::AdapterState { repository, reason })
                if repository == "ledger" && reason.contains("disk full")
        );
        assert!(!engine.is_running());
        assert!(!engine.config().snapshot_store().path().exists());
    }

    #[test]
    fn start_accepts_unbounded_poll_interval() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let config = EngineConfig::new(dir).with_poll_interval(std::time::Duration::MAX);
        let mut engine = Engine::new(config, Registry::new());

        engine.start().unwrap();
        assert_matches!(engine.status(TransferId::new()), Err(DtsError::TransferNotFound(_)));
        engine.stop().unwrap();
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (_temp, mut engine) = engine();
        engine.start().unwrap();
        let id = TransferId::new();
        assert_matches!(engine.status(id), Err(DtsError::TransferNotFound(found)) if found == id);
        assert_matches!(engine.cancel(id), Err(DtsError::TransferNotFound(_)));
        engine.stop().unwrap();
    }
}
