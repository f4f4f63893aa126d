use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use tracing::{debug, info, warn};

use crate::{
    config::{EditorConfig, UploadStrategy},
    core::{
        ledger::{AddOutcome, CommitError, CommitReport, Ledger, LedgerError, RemoveOutcome, RollbackReport},
        temp_store::{PickedFile, TempFileError, TempFileStore},
    },
    gateway::{DeleteFailure, FileGateway, GatewayError, UploadContext},
    patient::{HistoryRecord, Patient, PatientPatch, RecordDraft, RecordPatch, RecordStatus},
    persist::{JournalSession, JournalSink, PatientStore, SessionOutcome, StoreError},
    types::{ClinicId, DocumentRef, FileRef, PatientId, RecordId, SessionId, TempFileId, now_ms},
};

use super::{
    confirm::{Confirm, ConfirmPrompt},
    guard::InFlight,
};

/// Lifecycle of one edit session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Fetching the patient document.
    Loading,
    /// Accepting edits.
    Ready,
    /// Commit and persistence write in progress.
    Saving,
    /// Rollback in progress.
    Discarding,
    /// Ended after a successful save.
    Saved,
    /// Ended after a discard.
    Discarded,
}

impl SessionState {
    /// True for `Saved` and `Discarded`.
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Saved | Self::Discarded)
    }
}

/// Failure of a session verb.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Required patient fields are blank.
    #[error("missing required fields: {}", .missing.join(", "))]
    ValidationFailed {
        /// Blank field names.
        missing: Vec<&'static str>,
    },
    /// The picked file was rejected.
    #[error(transparent)]
    File(#[from] TempFileError),
    /// An eager upload failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// The ledger refused the intent.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Commit aborted in its upload phase.
    #[error(transparent)]
    Commit(#[from] CommitError),
    /// Loading or writing the patient document failed.
    #[error(transparent)]
    Persist(#[from] StoreError),
    /// Another save or discard is outstanding.
    #[error("another save or discard is in progress")]
    OperationInProgress,
    /// The session already ended.
    #[error("session already ended ({0:?})")]
    Terminated(SessionState),
    /// No record at this position.
    #[error("no record at index {0}")]
    RecordOutOfRange(usize),
    /// No document at this position.
    #[error("record {record_index} has no document at index {document_index}")]
    DocumentOutOfRange {
        /// Record position.
        record_index: usize,
        /// Document position.
        document_index: usize,
    },
    /// A temporary reference survived commit.
    #[error("temporary file {0} was never uploaded")]
    TemporaryReference(TempFileId),
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    /// Temporary files uploaded during commit.
    pub uploaded: Vec<(TempFileId, FileRef)>,
    /// Remote files deleted.
    pub deleted: BTreeSet<FileRef>,
    /// Deletions that failed; those files remain orphaned.
    pub orphaned: Vec<DeleteFailure>,
    /// Document as returned by the patient store.
    pub patient: Patient,
}

/// Result of `remove_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveRecordOutcome {
    /// Marked for deletion.
    Removed {
        /// File operations carried by the deletion.
        file_operations: usize,
    },
    /// The user declined.
    Cancelled,
}

/// Result of `discard`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardOutcome {
    /// Session ended; edits rolled back.
    Discarded(RollbackReport),
    /// The user declined; nothing changed.
    Cancelled,
}

/// One patient's edit session.
///
/// Owns the working copy, the load-time snapshot, the ledger and the
/// temporary file store. Document mutations always go through the ledger;
/// record mutations are local until `save`.
pub struct EditorSession<G, S> {
    id: SessionId,
    gateway: G,
    store: S,
    config: EditorConfig,
    original: Patient,
    working: Patient,
    ledger: Ledger,
    temps: TempFileStore,
    state: SessionState,
    next_record_id: RecordId,
    in_flight: InFlight,
    committed: Option<CommitReport>,
    journal: Option<Box<dyn JournalSink>>,
}

impl<G: FileGateway, S: PatientStore> EditorSession<G, S> {
    /// Fetches the patient and opens a session on it.
    pub async fn load(
        gateway: G,
        store: S,
        clinic_id: &ClinicId,
        patient_id: &PatientId,
        config: EditorConfig,
    ) -> Result<Self, SessionError> {
        debug!(clinic = %clinic_id, patient = %patient_id, "loading patient");
        let patient = store.fetch(clinic_id, patient_id).await?;
        Ok(Self::from_patient(gateway, store, patient, config))
    }

    /// Opens a session on an already-fetched patient.
    pub fn from_patient(gateway: G, store: S, mut patient: Patient, config: EditorConfig) -> Self {
        let mut next_record_id = 1;
        for record in &mut patient.history {
            record.id = next_record_id;
            record.status = RecordStatus::Active;
            next_record_id += 1;
        }
        patient.sort_history();

        Self {
            id: SessionId::generate(),
            gateway,
            store,
            temps: TempFileStore::new(config.clone()),
            config,
            original: patient.clone(),
            working: patient,
            ledger: Ledger::new(),
            state: SessionState::Ready,
            next_record_id,
            in_flight: InFlight::new(),
            committed: None,
            journal: None,
        }
    }

    /// Attaches a journal and records the session opening in it.
    pub fn with_journal(mut self, mut journal: Box<dyn JournalSink>) -> Self {
        let row = JournalSession {
            id: self.id,
            clinic_id: self.working.clinic_id.clone(),
            patient_id: self.working.id.clone(),
            opened_ms: now_ms(),
        };
        if let Err(err) = journal.open_session(&row) {
            warn!(session = %self.id, %err, "journal open failed");
        }
        self.journal = Some(journal);
        self
    }

    /// Journal key of this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Copy the verbs mutate.
    pub fn working(&self) -> &Patient {
        &self.working
    }

    /// Document as loaded, or as last saved.
    pub fn original(&self) -> &Patient {
        &self.original
    }

    /// Pending operations.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Temporary files held for this session.
    pub fn temp_files(&self) -> &TempFileStore {
        &self.temps
    }

    /// Settings the session was opened with.
    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    /// Records to display, newest first.
    pub fn visible_records(&self) -> Vec<&HistoryRecord> {
        self.working.visible_history().collect()
    }

    /// Ledger entries awaiting save.
    pub fn pending_count(&self) -> usize {
        self.ledger.pending_count()
    }

    /// True when the working copy differs from the original or the ledger
    /// is not empty.
    pub fn has_unsaved_changes(&self) -> bool {
        self.working != self.original || self.ledger.pending_count() > 0
    }

    /// True when saving would delete `file_ref`.
    pub fn is_pending_deletion(&self, file_ref: &FileRef) -> bool {
        self.ledger.is_pending_deletion(file_ref)
    }

    /// True when the record at `index` is marked for deletion.
    pub fn is_record_marked_for_deletion(&self, index: usize) -> bool {
        self.working
            .history
            .get(index)
            .is_some_and(|r| self.ledger.is_record_marked_for_deletion(r.id))
    }

    /// Prompt the host must show before unloading, if anything is pending.
    pub fn unload_prompt(&self) -> Option<ConfirmPrompt> {
        if self.ledger.pending_count() == 0 {
            return None;
        }
        Some(ConfirmPrompt::Unload {
            pending_operations: self.ledger.file_operation_count(),
        })
    }

    /// Inserts a record and attaches its files, returning its position.
    ///
    /// Every file is validated before anything changes. With eager uploads
    /// an upload failure leaves the record and its earlier attachments in
    /// place.
    pub async fn add_record(&mut self, draft: RecordDraft) -> Result<usize, SessionError> {
        self.ensure_ready()?;
        for file in &draft.files {
            self.temps.validate(file)?;
        }

        let id = self.take_record_id();
        let mut record = HistoryRecord::new(draft.timestamp.unwrap_or_else(Utc::now), draft.notes);
        record.id = id;
        self.working.history.push(record);
        self.working.sort_history();
        debug!(record = id, "record added");

        for file in draft.files {
            self.attach(id, file).await?;
        }
        self.flush_journal();
        self.position(id)
    }

    /// Applies `patch` to the record at `index`, returning its new position.
    pub fn update_record(&mut self, index: usize, patch: RecordPatch) -> Result<usize, SessionError> {
        self.ensure_ready()?;
        let record = self
            .working
            .history
            .get_mut(index)
            .ok_or(SessionError::RecordOutOfRange(index))?;
        let id = record.id;
        patch.apply_to(record);
        if patch.timestamp.is_some() {
            self.working.sort_history();
        }
        self.position(id)
    }

    /// Changes the visit time and re-sorts, returning the new position.
    pub fn update_record_date(&mut self, index: usize, timestamp: DateTime<Utc>) -> Result<usize, SessionError> {
        self.update_record(
            index,
            RecordPatch {
                timestamp: Some(timestamp),
                ..RecordPatch::default()
            },
        )
    }

    /// Replaces the record's notes; position is unchanged.
    pub fn update_record_notes(&mut self, index: usize, notes: Option<String>) -> Result<(), SessionError> {
        self.update_record(
            index,
            RecordPatch {
                notes: Some(notes),
                ..RecordPatch::default()
            },
        )
        .map(|_| ())
    }

    /// Marks the record at `index` for deletion after confirmation.
    pub fn remove_record(&mut self, index: usize, confirm: &dyn Confirm) -> Result<RemoveRecordOutcome, SessionError> {
        self.ensure_ready()?;
        let record = self
            .working
            .history
            .get(index)
            .ok_or(SessionError::RecordOutOfRange(index))?;
        let id = record.id;
        if self.ledger.is_record_marked_for_deletion(id) {
            return Err(LedgerError::RecordPendingDeletion(id).into());
        }

        let prompt = ConfirmPrompt::RemoveRecord {
            record_index: index,
            documents: record.document_refs.len(),
        };
        if !confirm.confirm(&prompt) {
            return Ok(RemoveRecordOutcome::Cancelled);
        }

        let documents = record.document_refs.clone();
        let file_operations = self.ledger.record_delete_entire_record(id, &documents)?;
        if let Some(record) = self.working.record_mut(id) {
            record.status = RecordStatus::PendingDeletion;
        }
        self.flush_journal();
        Ok(RemoveRecordOutcome::Removed { file_operations })
    }

    /// Restores a record marked for deletion.
    pub fn undo_record_deletion(&mut self, index: usize) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let id = self.record_id_at(index)?;
        self.ledger.undo_record_deletion(id)?;
        if let Some(record) = self.working.record_mut(id) {
            record.status = RecordStatus::Active;
        }
        self.flush_journal();
        Ok(())
    }

    /// Attaches a picked file to the record at `record_index`.
    pub async fn add_document(&mut self, record_index: usize, file: PickedFile) -> Result<DocumentRef, SessionError> {
        self.ensure_ready()?;
        let id = self.record_id_at(record_index)?;
        if self.ledger.is_record_marked_for_deletion(id) {
            return Err(LedgerError::RecordPendingDeletion(id).into());
        }
        let document = self.attach(id, file).await?;
        self.flush_journal();
        Ok(document)
    }

    /// Re-attaches an existing remote file, e.g. to undo its removal or to
    /// move it from another record. The file itself is never uploaded or
    /// deleted by this.
    pub fn reattach_document(&mut self, record_index: usize, file_ref: FileRef) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let id = self.record_id_at(record_index)?;
        let outcome = self.ledger.record_reattach(id, file_ref.clone())?;
        let document = DocumentRef::Remote(file_ref);
        if let Some(record) = self.working.record_mut(id) {
            match outcome {
                AddOutcome::CancelledRemoval { document_index } => {
                    let at = document_index.min(record.document_refs.len());
                    record.document_refs.insert(at, document);
                }
                AddOutcome::Recorded => record.document_refs.push(document),
                AddOutcome::AlreadyPending => {}
            }
        }
        self.flush_journal();
        Ok(())
    }

    /// Detaches a document; the UI stops showing it immediately.
    pub fn remove_document(&mut self, record_index: usize, document_index: usize) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let record = self
            .working
            .history
            .get(record_index)
            .ok_or(SessionError::RecordOutOfRange(record_index))?;
        let id = record.id;
        let document = record
            .document_refs
            .get(document_index)
            .cloned()
            .ok_or(SessionError::DocumentOutOfRange {
                record_index,
                document_index,
            })?;

        let outcome = self.ledger.record_remove(id, document_index, document)?;
        if let RemoveOutcome::CancelledAdd(DocumentRef::Temporary { temp_id }) = outcome {
            self.temps.release(temp_id);
        }
        if let Some(record) = self.working.record_mut(id) {
            record.document_refs.remove(document_index);
        }
        self.flush_journal();
        Ok(())
    }

    /// Commits the ledger, then writes the patient document.
    ///
    /// A persistence failure leaves the ledger committed and the session
    /// `Ready`; calling `save` again retries only the write.
    pub async fn save(&mut self) -> Result<SaveReport, SessionError> {
        self.ensure_ready()?;
        let _guard = self.in_flight.try_begin().ok_or(SessionError::OperationInProgress)?;

        let missing = self.working.missing_required_fields();
        if !missing.is_empty() {
            return Err(SessionError::ValidationFailed { missing });
        }

        self.state = SessionState::Saving;
        let owner = self.upload_context();
        let referenced: HashSet<FileRef> = self.working.durable_refs().cloned().collect();
        match self
            .ledger
            .commit(&self.gateway, &mut self.temps, &owner, &referenced)
            .await
        {
            Ok(report) => {
                self.apply_uploads(&report.uploaded);
                self.working.purge_deleted();
                self.merge_committed(report);
            }
            Err(err) => {
                let CommitError::PartialUploadFailure { uploaded, .. } = &err;
                self.apply_uploads(uploaded);
                self.flush_journal();
                self.state = SessionState::Ready;
                return Err(err.into());
            }
        }
        self.flush_journal();

        let patch = match PatientPatch::from_patient(&self.working) {
            Ok(patch) => patch,
            Err(temp_id) => {
                self.state = SessionState::Ready;
                return Err(SessionError::TemporaryReference(temp_id));
            }
        };

        let saved = match self
            .store
            .update(&self.working.clinic_id, &self.working.id, &patch)
            .await
        {
            Ok(saved) => saved,
            Err(err) => {
                warn!(session = %self.id, %err, "patient write failed after commit");
                self.state = SessionState::Ready;
                return Err(err.into());
            }
        };

        let committed = self.committed.take().unwrap_or_default();
        self.original = self.working.clone();
        self.temps.clear();
        self.state = SessionState::Saved;
        self.close_journal(SessionOutcome::Saved);
        info!(
            session = %self.id,
            uploaded = committed.uploaded.len(),
            deleted = committed.deleted.len(),
            orphaned = committed.orphaned.len(),
            "patient saved"
        );

        Ok(SaveReport {
            uploaded: committed.uploaded,
            deleted: committed.deleted,
            orphaned: committed.orphaned,
            patient: saved,
        })
    }

    /// Rolls every edit back and ends the session.
    ///
    /// Asks for confirmation only when something is unsaved. Cleanup of
    /// cancelled eager uploads runs either way.
    pub async fn discard(&mut self, confirm: &dyn Confirm) -> Result<DiscardOutcome, SessionError> {
        self.ensure_ready()?;
        let _guard = self.in_flight.try_begin().ok_or(SessionError::OperationInProgress)?;

        if self.has_unsaved_changes() {
            let prompt = ConfirmPrompt::Discard {
                pending_operations: self.ledger.file_operation_count(),
            };
            if !confirm.confirm(&prompt) {
                return Ok(DiscardOutcome::Cancelled);
            }
        }

        self.state = SessionState::Discarding;
        let referenced: HashSet<FileRef> = self.original.durable_refs().cloned().collect();
        let report = self.ledger.rollback(&self.gateway, &mut self.temps, &referenced).await;
        let leaked = self.temps.clear();
        if leaked > 0 {
            warn!(session = %self.id, leaked, "temporary files without ledger entry released on discard");
        }
        self.working = self.original.clone();
        self.committed = None;
        self.state = SessionState::Discarded;
        self.close_journal(SessionOutcome::Discarded);
        info!(session = %self.id, orphaned = report.orphaned.len(), "session discarded");
        Ok(DiscardOutcome::Discarded(report))
    }

    async fn attach(&mut self, record: RecordId, file: PickedFile) -> Result<DocumentRef, SessionError> {
        let temp_id = self.temps.create(file, record)?.id;

        let document = match self.config.upload_strategy {
            UploadStrategy::Deferred => DocumentRef::temporary(temp_id),
            UploadStrategy::Eager => {
                let owner = self.upload_context();
                let uploaded = match self.temps.get(temp_id) {
                    Some(file) => self.gateway.upload(file, &owner).await,
                    None => return Err(LedgerError::UnknownTemporary(temp_id).into()),
                };
                self.temps.release(temp_id);
                DocumentRef::Remote(uploaded?)
            }
        };

        self.ledger.record_add(record, document.clone())?;
        if let Some(rec) = self.working.record_mut(record) {
            rec.document_refs.push(document.clone());
        }
        Ok(document)
    }

    fn apply_uploads(&mut self, uploaded: &[(TempFileId, FileRef)]) {
        for (temp_id, file_ref) in uploaded {
            if !self.working.replace_temporary(*temp_id, file_ref) {
                debug!(%temp_id, %file_ref, "uploaded file no longer referenced by working copy");
            }
        }
    }

    fn merge_committed(&mut self, report: CommitReport) {
        match self.committed.as_mut() {
            None => self.committed = Some(report),
            Some(prev) => {
                prev.uploaded.extend(report.uploaded);
                prev.durable.extend(report.durable);
                prev.deleted.extend(report.deleted);
                prev.orphaned.extend(report.orphaned);
            }
        }
    }

    fn upload_context(&self) -> UploadContext {
        UploadContext {
            clinic_id: self.working.clinic_id.clone(),
            patient_id: self.working.id.clone(),
        }
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Loading | SessionState::Saving | SessionState::Discarding => {
                Err(SessionError::OperationInProgress)
            }
            state @ (SessionState::Saved | SessionState::Discarded) => Err(SessionError::Terminated(state)),
        }
    }

    fn record_id_at(&self, index: usize) -> Result<RecordId, SessionError> {
        self.working
            .history
            .get(index)
            .map(|r| r.id)
            .ok_or(SessionError::RecordOutOfRange(index))
    }

    fn position(&self, id: RecordId) -> Result<usize, SessionError> {
        self.working
            .position_of(id)
            .ok_or(SessionError::RecordOutOfRange(self.working.history.len()))
    }

    fn take_record_id(&mut self) -> RecordId {
        let id = self.next_record_id;
        self.next_record_id += 1;
        id
    }

    fn flush_journal(&mut self) {
        let events = self.ledger.drain_pending_events();
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Err(err) = journal.append_events(self.id, &events) {
            warn!(session = %self.id, %err, lost = events.len(), "journal append failed");
        }
    }

    fn close_journal(&mut self, outcome: SessionOutcome) {
        self.flush_journal();
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Err(err) = journal.close_session(self.id, outcome).and_then(|_| journal.flush()) {
            warn!(session = %self.id, %err, "journal close failed");
        }
    }
}
