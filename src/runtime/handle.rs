//! Single-writer editor task and its cloneable handle.

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::{
    core::temp_store::PickedFile,
    gateway::FileGateway,
    patient::{Patient, RecordDraft, RecordPatch},
    persist::PatientStore,
    session::{
        Confirm, ConfirmPrompt, DiscardOutcome, EditorSession, InFlight, InFlightGuard, RemoveRecordOutcome,
        SaveReport, SessionError,
    },
    types::{DocumentRef, FileRef},
};

use super::events::EditorEvent;

/// Failure of a handle call.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The session rejected the verb.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The editor task has stopped.
    #[error("editor task is gone")]
    ChannelClosed,
}

/// Channel sizing for [`spawn_editor`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Commands buffered before senders wait.
    pub command_queue_bound: usize,
    /// Events retained for slow subscribers.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_queue_bound: 64,
            event_capacity: 256,
        }
    }
}

/// Cloneable front end of a spawned session. Every verb is serialized
/// through one task.
pub struct EditorHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<EditorEvent>,
    in_flight: InFlight,
}

impl Clone for EditorHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    AddRecord {
        draft: RecordDraft,
        resp: Reply<usize>,
    },
    UpdateRecord {
        index: usize,
        patch: RecordPatch,
        resp: Reply<usize>,
    },
    RemoveRecord {
        index: usize,
        confirm: Box<dyn Confirm>,
        resp: Reply<RemoveRecordOutcome>,
    },
    UndoRecordDeletion {
        index: usize,
        resp: Reply<()>,
    },
    AddDocument {
        record_index: usize,
        file: PickedFile,
        resp: Reply<DocumentRef>,
    },
    ReattachDocument {
        record_index: usize,
        file_ref: FileRef,
        resp: Reply<()>,
    },
    RemoveDocument {
        record_index: usize,
        document_index: usize,
        resp: Reply<()>,
    },
    Save {
        guard: InFlightGuard,
        resp: Reply<SaveReport>,
    },
    Discard {
        guard: InFlightGuard,
        confirm: Box<dyn Confirm>,
        resp: Reply<DiscardOutcome>,
    },
    Snapshot {
        resp: oneshot::Sender<Patient>,
    },
    PendingCount {
        resp: oneshot::Sender<usize>,
    },
    UnloadPrompt {
        resp: oneshot::Sender<Option<ConfirmPrompt>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Moves `session` into a task and returns the handle that drives it.
pub fn spawn_editor<G, S>(session: EditorSession<G, S>, config: RuntimeConfig) -> EditorHandle
where
    G: FileGateway + 'static,
    S: PatientStore + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<EditorEvent>(config.event_capacity.max(1));
    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut session = session;
        while let Some(cmd) = cmd_rx.recv().await {
            if handle_command(cmd, &mut session, &events_tx_loop).await {
                break;
            }
        }
        debug!(session = %session.id(), "editor task stopped");
    });

    EditorHandle {
        cmd_tx,
        events_tx,
        in_flight: InFlight::new(),
    }
}

impl EditorHandle {
    /// Receives [`EditorEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EditorEvent> {
        self.events_tx.subscribe()
    }

    /// True while a save or discard issued through any clone is outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_busy()
    }

    /// See [`EditorSession::add_record`].
    pub async fn add_record(&self, draft: RecordDraft) -> Result<usize, RuntimeError> {
        self.request(|resp| Command::AddRecord { draft, resp }).await
    }

    /// Returns the record's position after re-sorting.
    pub async fn update_record(&self, index: usize, patch: RecordPatch) -> Result<usize, RuntimeError> {
        self.request(|resp| Command::UpdateRecord { index, patch, resp }).await
    }

    /// Changes the visit time, returning the new position.
    pub async fn update_record_date(&self, index: usize, timestamp: DateTime<Utc>) -> Result<usize, RuntimeError> {
        let patch = RecordPatch {
            timestamp: Some(timestamp),
            ..RecordPatch::default()
        };
        self.update_record(index, patch).await
    }

    /// Replaces the record's notes; position is unchanged.
    pub async fn update_record_notes(&self, index: usize, notes: Option<String>) -> Result<(), RuntimeError> {
        let patch = RecordPatch {
            notes: Some(notes),
            ..RecordPatch::default()
        };
        self.update_record(index, patch).await.map(|_| ())
    }

    /// Marks a record for deletion once `confirm` agrees.
    pub async fn remove_record(
        &self,
        index: usize,
        confirm: impl Confirm + 'static,
    ) -> Result<RemoveRecordOutcome, RuntimeError> {
        let confirm: Box<dyn Confirm> = Box::new(confirm);
        self.request(|resp| Command::RemoveRecord { index, confirm, resp })
            .await
    }

    /// Restores a record marked for deletion.
    pub async fn undo_record_deletion(&self, index: usize) -> Result<(), RuntimeError> {
        self.request(|resp| Command::UndoRecordDeletion { index, resp }).await
    }

    /// Attaches a picked file.
    pub async fn add_document(&self, record_index: usize, file: PickedFile) -> Result<DocumentRef, RuntimeError> {
        self.request(|resp| Command::AddDocument {
            record_index,
            file,
            resp,
        })
        .await
    }

    /// Links a durable file; see [`EditorSession::reattach_document`].
    pub async fn reattach_document(&self, record_index: usize, file_ref: FileRef) -> Result<(), RuntimeError> {
        self.request(|resp| Command::ReattachDocument {
            record_index,
            file_ref,
            resp,
        })
        .await
    }

    /// Detaches a document.
    pub async fn remove_document(&self, record_index: usize, document_index: usize) -> Result<(), RuntimeError> {
        self.request(|resp| Command::RemoveDocument {
            record_index,
            document_index,
            resp,
        })
        .await
    }

    /// Rejected with `OperationInProgress` while another save or discard runs.
    pub async fn save(&self) -> Result<SaveReport, RuntimeError> {
        let guard = self.claim()?;
        self.request(|resp| Command::Save { guard, resp }).await
    }

    /// Rejected with `OperationInProgress` while another save or discard runs.
    pub async fn discard(&self, confirm: impl Confirm + 'static) -> Result<DiscardOutcome, RuntimeError> {
        let guard = self.claim()?;
        let confirm: Box<dyn Confirm> = Box::new(confirm);
        self.request(|resp| Command::Discard { guard, confirm, resp })
            .await
    }

    /// Copy of the working document.
    pub async fn snapshot(&self) -> Result<Patient, RuntimeError> {
        self.query(|resp| Command::Snapshot { resp }).await
    }

    /// Ledger entries awaiting save.
    pub async fn pending_count(&self) -> Result<usize, RuntimeError> {
        self.query(|resp| Command::PendingCount { resp }).await
    }

    /// Prompt to show before unloading, if anything is pending.
    pub async fn unload_prompt(&self) -> Result<Option<ConfirmPrompt>, RuntimeError> {
        self.query(|resp| Command::UnloadPrompt { resp }).await
    }

    /// Stops the task; later calls return `ChannelClosed`.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.query(|resp| Command::Shutdown { resp }).await
    }

    fn claim(&self) -> Result<InFlightGuard, RuntimeError> {
        self.in_flight
            .try_begin()
            .ok_or(RuntimeError::Session(SessionError::OperationInProgress))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }
}

async fn handle_command<G, S>(
    cmd: Command,
    session: &mut EditorSession<G, S>,
    events_tx: &broadcast::Sender<EditorEvent>,
) -> bool
where
    G: FileGateway,
    S: PatientStore,
{
    match cmd {
        Command::AddRecord { draft, resp } => {
            let res = session.add_record(draft).await;
            reply_changed(session, events_tx, resp, res);
        }
        Command::UpdateRecord { index, patch, resp } => {
            let res = session.update_record(index, patch);
            reply_changed(session, events_tx, resp, res);
        }
        Command::RemoveRecord { index, confirm, resp } => {
            let res = session.remove_record(index, confirm.as_ref());
            reply_changed(session, events_tx, resp, res);
        }
        Command::UndoRecordDeletion { index, resp } => {
            let res = session.undo_record_deletion(index);
            reply_changed(session, events_tx, resp, res);
        }
        Command::AddDocument {
            record_index,
            file,
            resp,
        } => {
            let res = session.add_document(record_index, file).await;
            reply_changed(session, events_tx, resp, res);
        }
        Command::ReattachDocument {
            record_index,
            file_ref,
            resp,
        } => {
            let res = session.reattach_document(record_index, file_ref);
            reply_changed(session, events_tx, resp, res);
        }
        Command::RemoveDocument {
            record_index,
            document_index,
            resp,
        } => {
            let res = session.remove_document(record_index, document_index);
            reply_changed(session, events_tx, resp, res);
        }
        Command::Save { guard, resp } => {
            let res = session.save().await;
            let _ = match &res {
                Ok(report) => events_tx.send(EditorEvent::Saved {
                    orphaned: report.orphaned.len(),
                }),
                Err(err) => events_tx.send(EditorEvent::SaveFailed {
                    reason: err.to_string(),
                }),
            };
            drop(guard);
            let _ = resp.send(res);
        }
        Command::Discard { guard, confirm, resp } => {
            let res = session.discard(confirm.as_ref()).await;
            if matches!(res, Ok(DiscardOutcome::Discarded(_))) {
                let _ = events_tx.send(EditorEvent::Discarded);
            }
            drop(guard);
            let _ = resp.send(res);
        }
        Command::Snapshot { resp } => {
            let _ = resp.send(session.working().clone());
        }
        Command::PendingCount { resp } => {
            let _ = resp.send(session.pending_count());
        }
        Command::UnloadPrompt { resp } => {
            let _ = resp.send(session.unload_prompt());
        }
        Command::Shutdown { resp } => {
            let _ = resp.send(());
            return true;
        }
    }

    false
}

fn reply_changed<G, S, T>(
    session: &EditorSession<G, S>,
    events_tx: &broadcast::Sender<EditorEvent>,
    resp: Reply<T>,
    res: Result<T, SessionError>,
) where
    G: FileGateway,
    S: PatientStore,
{
    if res.is_ok() {
        let _ = events_tx.send(EditorEvent::Changed {
            pending: session.pending_count(),
            unsaved: session.has_unsaved_changes(),
        });
    }
    let _ = resp.send(res);
}
