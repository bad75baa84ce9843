// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The download bridge.
//!
//! Single authoritative mapping from job id to [`TaskConfig`], backed by the
//! durable [`TaskStore`] and kept in sync with the transfer backend. All
//! mutation happens on one worker task: application commands and backend
//! updates funnel through its two channels, so the persisted map is never
//! touched from two contexts at once.
//!
//! ```text
//! application ──commands──▶ ┌────────────────┐ ◀──updates── backend
//!                           │  bridge worker │
//!           ◀───events───── │  (owns store)  │ ──submit/cancel──▶
//! ```
//!
//! Per job: `Created → Submitted → {Begun → InProgress}* →
//! {Completed | Failed | Cancelled}`. `Begun` is entered at most once,
//! gated by the persisted `reported_begin` flag; every terminal state
//! deletes the record.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::DownloadEvent;
use crate::session::{SessionHandle, SessionRegistry};
use crate::store::TaskStore;
use crate::task::{DownloadRequest, ExistingDownload, TaskConfig, TaskState};
use crate::transfer::{BackgroundTransfer, TransferRequest, TransferUpdate};

type Respond<T> = oneshot::Sender<Result<T, BridgeError>>;

/// Commands sent from the application layer to the worker.
enum BridgeCommand {
    Enqueue {
        request: DownloadRequest,
        respond: Respond<()>,
    },
    Cancel {
        id: String,
        respond: Respond<()>,
    },
    Pause {
        id: String,
        respond: Respond<()>,
    },
    Resume {
        id: String,
        respond: Respond<()>,
    },
    ListExisting {
        respond: Respond<Vec<ExistingDownload>>,
    },
    Rehydrate {
        session_id: String,
        respond: Respond<SessionHandle>,
    },
    CompleteHandler {
        session_id: String,
        job_id: String,
        respond: Respond<()>,
    },
    SessionDeadline {
        session_id: String,
    },
    Shutdown {
        respond: Respond<()>,
    },
}

/// Facade over the worker task. Cheap to clone; all clones talk to the same
/// worker.
#[derive(Clone)]
pub struct DownloadBridge {
    command_tx: mpsc::UnboundedSender<BridgeCommand>,
}

impl DownloadBridge {
    /// Open the store at `store_path`, start the worker, and return the
    /// bridge plus the application-facing event stream.
    ///
    /// `updates` is the callback channel of the backend this bridge shadows;
    /// wire it from the same backend instance passed here.
    pub fn new(
        backend: Arc<dyn BackgroundTransfer>,
        updates: mpsc::UnboundedReceiver<TransferUpdate>,
        store_path: impl Into<PathBuf>,
        config: BridgeConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DownloadEvent>), BridgeError> {
        let store =
            TaskStore::open(store_path).map_err(|e| BridgeError::Store(format!("{:#}", e)))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            backend,
            store,
            config,
            events: event_tx,
            sessions: SessionRegistry::new(),
            progress: HashMap::new(),
            command_tx: command_tx.clone(),
        };
        tokio::spawn(worker.run(command_rx, updates));

        Ok((Self { command_tx }, event_rx))
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Respond<T>) -> BridgeCommand,
    ) -> Result<T, BridgeError> {
        let (respond, rx) = oneshot::channel();
        self.command_tx
            .send(make(respond))
            .map_err(|_| BridgeError::Closed)?;
        rx.await.map_err(|_| BridgeError::Closed)?
    }

    /// Persist a new job and submit it to the backend.
    ///
    /// The record is written durably before the backend sees the request, so
    /// a crash between the two leaves an orphan that the next
    /// [`rehydrate`](Self::rehydrate) surfaces as failed. A backend that
    /// rejects the submission synchronously does not fail this call; the
    /// rejection arrives as a `Failed` event, like every other terminal
    /// failure.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<(), BridgeError> {
        self.call(|respond| BridgeCommand::Enqueue { request, respond })
            .await
    }

    /// Cancel a job: abort the transfer, delete the record, emit nothing
    /// further for the id.
    pub async fn cancel(&self, id: impl Into<String>) -> Result<(), BridgeError> {
        let id = id.into();
        self.call(|respond| BridgeCommand::Cancel { id, respond })
            .await
    }

    /// Suspend a job's transfer. Backends without pause support reject this
    /// with [`BridgeError::Transfer`].
    pub async fn pause(&self, id: impl Into<String>) -> Result<(), BridgeError> {
        let id = id.into();
        self.call(|respond| BridgeCommand::Pause { id, respond })
            .await
    }

    /// Resume a suspended transfer.
    pub async fn resume(&self, id: impl Into<String>) -> Result<(), BridgeError> {
        let id = id.into();
        self.call(|respond| BridgeCommand::Resume { id, respond })
            .await
    }

    /// Persisted jobs matched against transfers the backend still knows
    /// about, for application-side relaunch reconciliation.
    pub async fn list_existing(&self) -> Result<Vec<ExistingDownload>, BridgeError> {
        self.call(|respond| BridgeCommand::ListExisting { respond })
            .await
    }

    /// Relaunch reconciliation. Re-associates persisted records with the
    /// backend's live transfers, fails orphaned records, and returns a
    /// barrier that resolves once every still-outstanding job for this
    /// session reaches a terminal state (or the configured deadline fires).
    pub async fn rehydrate(
        &self,
        session_id: impl Into<String>,
    ) -> Result<SessionHandle, BridgeError> {
        let session_id = session_id.into();
        self.call(|respond| BridgeCommand::Rehydrate {
            session_id,
            respond,
        })
        .await
    }

    /// Early acknowledgment that the application layer finished processing a
    /// job's terminal event for the given relaunch session.
    pub async fn complete_handler(
        &self,
        session_id: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Result<(), BridgeError> {
        let session_id = session_id.into();
        let job_id = job_id.into();
        self.call(|respond| BridgeCommand::CompleteHandler {
            session_id,
            job_id,
            respond,
        })
        .await
    }

    /// Flush the store and stop the worker.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.call(|respond| BridgeCommand::Shutdown { respond })
            .await
    }
}

/// Per-job progress bookkeeping for event throttling.
#[derive(Debug, Default)]
struct ProgressGate {
    bytes_seen: u64,
    total_seen: u64,
    emitted_bytes: u64,
    emitted_fraction: f64,
    last_emit: Option<Instant>,
    /// A threshold-met report landed inside the interval window and is
    /// waiting to be flushed when the window reopens.
    pending: bool,
}

struct Worker {
    backend: Arc<dyn BackgroundTransfer>,
    store: TaskStore,
    config: BridgeConfig,
    events: mpsc::UnboundedSender<DownloadEvent>,
    sessions: SessionRegistry,
    progress: HashMap<String, ProgressGate>,
    /// For deadline timers to call back into the worker
    command_tx: mpsc::UnboundedSender<BridgeCommand>,
}

impl Worker {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<BridgeCommand>,
        mut updates_rx: mpsc::UnboundedReceiver<TransferUpdate>,
    ) {
        let mut updates_open = true;
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    // Every bridge handle dropped; nothing can reach us.
                    None => break,
                },
                update = updates_rx.recv(), if updates_open => match update {
                    Some(update) => self.handle_update(update).await,
                    None => updates_open = false,
                },
            }
        }

        if let Err(e) = self.store.save() {
            tracing::error!(error = %format!("{:#}", e), "failed to save task store on shutdown");
        }
    }

    /// Returns true when the worker should stop.
    async fn handle_command(&mut self, command: BridgeCommand) -> bool {
        match command {
            BridgeCommand::Enqueue { request, respond } => {
                let _ = respond.send(self.enqueue(request).await);
            }
            BridgeCommand::Cancel { id, respond } => {
                let _ = respond.send(self.cancel(&id).await);
            }
            BridgeCommand::Pause { id, respond } => {
                let _ = respond.send(self.pause_resume(&id, true).await);
            }
            BridgeCommand::Resume { id, respond } => {
                let _ = respond.send(self.pause_resume(&id, false).await);
            }
            BridgeCommand::ListExisting { respond } => {
                let _ = respond.send(self.list_existing().await);
            }
            BridgeCommand::Rehydrate {
                session_id,
                respond,
            } => {
                let _ = respond.send(self.rehydrate(session_id).await);
            }
            BridgeCommand::CompleteHandler {
                session_id,
                job_id,
                respond,
            } => {
                self.sessions.acknowledge(&session_id, &job_id);
                let _ = respond.send(Ok(()));
            }
            BridgeCommand::SessionDeadline { session_id } => {
                if self.sessions.force_fire(&session_id) {
                    tracing::warn!(session = %session_id,
                        "relaunch session hit the acknowledgment deadline with callbacks outstanding");
                }
            }
            BridgeCommand::Shutdown { respond } => {
                let result = self
                    .store
                    .save()
                    .map_err(|e| BridgeError::Store(format!("{:#}", e)));
                let _ = respond.send(result);
                return true;
            }
        }
        false
    }

    async fn enqueue(&mut self, request: DownloadRequest) -> Result<(), BridgeError> {
        if request.id.is_empty() || request.url.is_empty() || request.destination.is_empty() {
            return Err(BridgeError::InvalidRequest(
                "id, url and destination must be set".to_string(),
            ));
        }
        if self.store.contains(&request.id) {
            return Err(BridgeError::DuplicateJobId(request.id));
        }

        // Durable write before network submission: a crash from here on is
        // recoverable through rehydrate.
        let task = TaskConfig::new(
            &request.id,
            &request.url,
            &request.destination,
            &request.metadata,
        );
        self.store.insert(task);
        if let Err(e) = self.store.save() {
            self.store.remove(&request.id);
            return Err(BridgeError::Store(format!("{:#}", e)));
        }

        let mut headers = self.config.headers.clone();
        headers.extend(request.headers.clone());

        let submit = self
            .backend
            .submit(TransferRequest {
                id: request.id.clone(),
                url: request.url.clone(),
                headers,
            })
            .await;

        if let Err(e) = submit {
            tracing::warn!(id = %request.id, error = %format!("{:#}", e),
                "backend rejected submission");
            self.remove_record(&request.id);
            self.emit(DownloadEvent::Failed {
                id: request.id,
                error: format!("{:#}", e),
                error_code: None,
            });
        }

        Ok(())
    }

    async fn cancel(&mut self, id: &str) -> Result<(), BridgeError> {
        if !self.store.contains(id) {
            return Err(BridgeError::UnknownJobId(id.to_string()));
        }

        if let Err(e) = self.backend.cancel(id).await {
            // The record goes away regardless; the backend may simply no
            // longer know the transfer.
            tracing::debug!(id = %id, error = %format!("{:#}", e), "backend cancel failed");
        }

        self.remove_record(id);
        self.sessions.job_done(id);
        Ok(())
    }

    async fn pause_resume(&mut self, id: &str, pause: bool) -> Result<(), BridgeError> {
        if !self.store.contains(id) {
            return Err(BridgeError::UnknownJobId(id.to_string()));
        }
        let result = if pause {
            self.backend.pause(id).await
        } else {
            self.backend.resume(id).await
        };
        result.map_err(|e| BridgeError::Transfer(format!("{:#}", e)))
    }

    async fn list_existing(&mut self) -> Result<Vec<ExistingDownload>, BridgeError> {
        let snapshots = self
            .backend
            .snapshot()
            .await
            .map_err(|e| BridgeError::Transfer(format!("{:#}", e)))?;

        let mut found = Vec::new();
        for snapshot in snapshots {
            let Some(task) = self.store.get(&snapshot.id) else {
                // A transfer we have no record of cannot be surfaced to the
                // application layer; tear it down.
                tracing::debug!(id = %snapshot.id, "cancelling untracked transfer");
                let _ = self.backend.cancel(&snapshot.id).await;
                continue;
            };

            if snapshot.state == TaskState::Completed {
                if let Some(local_path) = &snapshot.local_path {
                    if let Err(e) = finalize_file(local_path, Path::new(&task.destination)) {
                        tracing::warn!(id = %snapshot.id, error = %format!("{:#}", e),
                            "failed to move completed download into place");
                    }
                }
            }

            found.push(ExistingDownload {
                id: task.id.clone(),
                metadata: task.metadata.clone(),
                state: snapshot.state,
                bytes_downloaded: snapshot.bytes_downloaded,
                bytes_total: snapshot.bytes_total,
            });
        }

        Ok(found)
    }

    async fn rehydrate(&mut self, session_id: String) -> Result<SessionHandle, BridgeError> {
        let snapshots = self
            .backend
            .snapshot()
            .await
            .map_err(|e| BridgeError::Transfer(format!("{:#}", e)))?;
        let live: HashSet<String> = snapshots.into_iter().map(|s| s.id).collect();

        // Records with no matching transfer never get a terminal callback;
        // fail them now rather than carry them forever.
        let orphans: Vec<String> = self
            .store
            .ids()
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        for id in &orphans {
            tracing::warn!(id = %id, "persisted job has no matching transfer after relaunch");
            self.remove_record(id);
            self.emit(DownloadEvent::Failed {
                id: id.clone(),
                error: "no matching transfer after relaunch".to_string(),
                error_code: None,
            });
        }

        let outstanding: HashSet<String> = self
            .store
            .ids()
            .into_iter()
            .filter(|id| live.contains(id))
            .collect();
        tracing::info!(session = %session_id, outstanding = outstanding.len(),
            orphaned = orphans.len(), "rehydrated persisted downloads");

        let handle = self.sessions.register(session_id.clone(), outstanding);

        let deadline = self.config.ack_deadline;
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = command_tx.send(BridgeCommand::SessionDeadline { session_id });
        });

        Ok(handle)
    }

    async fn handle_update(&mut self, update: TransferUpdate) {
        // This path is driven by the backend and must never fail outward:
        // errors degrade to logging or a Failed event.
        match update {
            TransferUpdate::Started {
                id,
                headers,
                expected_bytes,
            } => {
                if self.store.contains(&id) {
                    self.report_begin(&id, expected_bytes, headers);
                } else {
                    tracing::debug!(id = %id, "start callback for unknown transfer");
                }
            }
            TransferUpdate::Progress {
                id,
                bytes_downloaded,
                bytes_total,
            } => self.on_progress(&id, bytes_downloaded, bytes_total),
            TransferUpdate::Finished { id, temp_path } => self.on_finished(&id, &temp_path),
            TransferUpdate::Failed { id, code, message } => self.on_failed(&id, code, message),
        }
    }

    /// Emit the begin event for a job if it has not been reported yet, and
    /// persist the flip so a relaunch does not report it again.
    fn report_begin(&mut self, id: &str, expected_bytes: u64, headers: HashMap<String, String>) {
        let Some(task) = self.store.get_mut(id) else {
            return;
        };
        if task.reported_begin {
            return;
        }
        task.reported_begin = true;
        if let Err(e) = self.store.save() {
            tracing::warn!(id = %id, error = %format!("{:#}", e),
                "failed to persist reported_begin");
        }
        self.progress.entry(id.to_string()).or_default();
        self.emit(DownloadEvent::Begin {
            id: id.to_string(),
            expected_bytes,
            headers,
        });
    }

    fn on_progress(&mut self, id: &str, bytes_downloaded: u64, bytes_total: u64) {
        if !self.store.contains(id) {
            tracing::debug!(id = %id, "progress callback for unknown transfer");
            return;
        }

        // First signal for a relaunched job carries the begin event.
        self.report_begin(id, bytes_total, HashMap::new());

        let interval = self.config.progress_interval;
        let min_bytes = self.config.progress_min_bytes;
        let gate = self.progress.entry(id.to_string()).or_default();
        gate.bytes_seen = bytes_downloaded;
        gate.total_seen = bytes_total;

        let fraction = if bytes_total > 0 {
            bytes_downloaded as f64 / bytes_total as f64
        } else {
            0.0
        };
        let moved_enough = fraction - gate.emitted_fraction > 0.01
            || bytes_downloaded.saturating_sub(gate.emitted_bytes) >= min_bytes
            || bytes_total == 0;
        if moved_enough {
            gate.pending = true;
        }
        let spaced_enough = gate
            .last_emit
            .map(|at| at.elapsed() >= interval)
            .unwrap_or(true);

        // A report held back by the interval window is deferred, not
        // dropped: the next callback after the window flushes it with the
        // current counters.
        if gate.last_emit.is_none() || (gate.pending && spaced_enough) {
            gate.pending = false;
            gate.emitted_bytes = bytes_downloaded;
            gate.emitted_fraction = fraction;
            gate.last_emit = Some(Instant::now());
            self.emit(DownloadEvent::Progress {
                id: id.to_string(),
                bytes_downloaded,
                bytes_total,
            });
        }
    }

    fn on_finished(&mut self, id: &str, temp_path: &Path) {
        let Some(task) = self.store.get(id) else {
            tracing::debug!(id = %id, "finish callback for unknown transfer");
            let _ = std::fs::remove_file(temp_path);
            return;
        };
        let destination = task.destination.clone();
        let metadata = task.metadata.clone();

        let gate = self.progress.get(id);
        let bytes_downloaded = gate.map(|g| g.bytes_seen).unwrap_or(0);
        let bytes_total = gate.map(|g| g.total_seen).unwrap_or(0);

        let event = match finalize_file(temp_path, Path::new(&destination)) {
            Ok(()) => DownloadEvent::Done {
                id: id.to_string(),
                location: destination,
                metadata,
                bytes_downloaded,
                bytes_total,
            },
            Err(e) => {
                tracing::warn!(id = %id, error = %format!("{:#}", e),
                    "failed to move finished download to destination");
                DownloadEvent::Failed {
                    id: id.to_string(),
                    error: format!("{:#}", e),
                    error_code: None,
                }
            }
        };

        // Terminal either way; a failed move is not retried.
        self.remove_record(id);
        self.emit(event);
        self.sessions.job_done(id);
    }

    fn on_failed(&mut self, id: &str, code: Option<i64>, message: String) {
        if !self.store.contains(id) {
            tracing::debug!(id = %id, "failure callback for unknown transfer");
            return;
        }

        self.remove_record(id);
        self.emit(DownloadEvent::Failed {
            id: id.to_string(),
            error: message,
            error_code: code,
        });
        self.sessions.job_done(id);
    }

    fn remove_record(&mut self, id: &str) {
        self.store.remove(id);
        self.progress.remove(id);
        if let Err(e) = self.store.save() {
            tracing::warn!(id = %id, error = %format!("{:#}", e),
                "failed to persist record removal");
        }
    }

    fn emit(&self, event: DownloadEvent) {
        // A dropped receiver means the application stopped listening; that
        // must not stall callback processing.
        let _ = self.events.send(event);
    }
}

/// Move a finished transfer's payload into its destination: replace any
/// existing file, create missing parent directories, and fall back to
/// copy+remove when the rename crosses filesystems.
fn finalize_file(temp_path: &Path, destination: &Path) -> Result<()> {
    if destination.exists() {
        std::fs::remove_file(destination)
            .with_context(|| format!("failed to replace {:?}", destination))?;
    }
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
    }

    match std::fs::rename(temp_path, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(temp_path, destination).with_context(|| {
                format!("failed to move {:?} to {:?}", temp_path, destination)
            })?;
            let _ = std::fs::remove_file(temp_path);
            Ok(())
        }
    }
}
