//! Pending operation ledger.
//!
//! Records document intents for one session and applies them on commit or
//! undoes them on rollback. Entries are keyed by [`RecordId`], never by list
//! position.

use std::collections::BTreeSet;

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use crate::{
    core::temp_store::TempFileStore,
    gateway::{BatchDeleteResult, DeleteFailure, FileGateway, GatewayError, UploadContext},
    op::{LedgerEvent, PendingOperation, StoredEvent},
    types::{DocumentRef, EventSeq, FileRef, RecordId, TempFileId, now_ms},
};

/// Intent the ledger refuses to record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The record already carries a deletion entry.
    #[error("record {0} is marked for deletion")]
    RecordPendingDeletion(RecordId),
    /// Undo asked for a record with no deletion entry.
    #[error("record {0} is not marked for deletion")]
    NotMarkedForDeletion(RecordId),
    /// A temporary document was removed without a matching add.
    #[error("temporary file {0} has no pending add")]
    UnknownTemporary(TempFileId),
}

/// One upload that failed during commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    /// Temporary file that stays pending.
    pub temp_id: TempFileId,
    /// Gateway failure.
    pub error: GatewayError,
}

/// Commit aborted before its delete phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// Some uploads failed. Nothing was deleted; successful uploads stay
    /// in the ledger as durable adds.
    #[error("{} of {} uploads failed", .failed.len(), .failed.len() + .uploaded.len())]
    PartialUploadFailure {
        /// Uploads that reached the remote store.
        uploaded: Vec<(TempFileId, FileRef)>,
        /// Uploads that did not.
        failed: Vec<UploadFailure>,
    },
}

/// Result of recording an attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new entry was appended.
    Recorded,
    /// The same attach is already pending.
    AlreadyPending,
    /// The add re-attached a document whose removal was pending.
    CancelledRemoval {
        /// Position the document had when it was detached.
        document_index: usize,
    },
}

/// Result of recording a detach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// A new entry was appended.
    Recorded,
    /// The same removal is already pending.
    AlreadyPending,
    /// The remove undid a pending add; a temporary handle must be released
    /// by the caller.
    CancelledAdd(DocumentRef),
}

/// What a successful commit did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitReport {
    /// Temporary files uploaded by this call.
    pub uploaded: Vec<(TempFileId, FileRef)>,
    /// Durable refs of every committed add.
    pub durable: Vec<FileRef>,
    /// Remote files deleted.
    pub deleted: BTreeSet<FileRef>,
    /// Deletions that failed; the files remain orphaned in storage.
    pub orphaned: Vec<DeleteFailure>,
}

/// What a rollback undid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RollbackReport {
    /// Temporary files released.
    pub released: Vec<TempFileId>,
    /// Uploads deleted again.
    pub undone: BTreeSet<FileRef>,
    /// Uploads whose deletion failed.
    pub orphaned: Vec<DeleteFailure>,
}

/// Ordered pending operations of one session.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<PendingOperation>,
    abandoned_uploads: Vec<FileRef>,
    pending_events: Vec<StoredEvent>,
    next_seq: EventSeq,
}

impl Ledger {
    /// Creates an empty ledger whose first event gets sequence 1.
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            ..Self::default()
        }
    }

    /// Records a newly attached file, temporary or freshly uploaded.
    ///
    /// A remote document with a pending removal on the same record cancels
    /// that removal instead.
    pub fn record_add(&mut self, record: RecordId, document: DocumentRef) -> Result<AddOutcome, LedgerError> {
        self.ensure_not_deleted(record)?;

        if let Some(outcome) = self.cancel_removal(record, &document) {
            return Ok(outcome);
        }

        if self.find_add(record, &document).is_some() {
            return Ok(AddOutcome::AlreadyPending);
        }

        if let Some(file_ref) = document.as_remote() {
            self.abandoned_uploads.retain(|f| f != file_ref);
        }

        let op = PendingOperation::AddDocument { record, document };
        self.entries.push(op.clone());
        self.push_event(LedgerEvent::Recorded { op });
        Ok(AddOutcome::Recorded)
    }

    /// Links a durable file that already exists in remote storage.
    ///
    /// Cancels a pending removal of the same file on the same record.
    /// Otherwise the link is recorded as an attach that neither commit nor
    /// rollback deletes.
    pub fn record_reattach(&mut self, record: RecordId, file_ref: FileRef) -> Result<AddOutcome, LedgerError> {
        self.ensure_not_deleted(record)?;

        let document = DocumentRef::Remote(file_ref.clone());
        if let Some(outcome) = self.cancel_removal(record, &document) {
            return Ok(outcome);
        }
        if self.find_add(record, &document).is_some() {
            return Ok(AddOutcome::AlreadyPending);
        }

        debug!(record, %file_ref, "durable file linked");
        let op = PendingOperation::AttachDocument { record, file_ref };
        self.entries.push(op.clone());
        self.push_event(LedgerEvent::Recorded { op });
        Ok(AddOutcome::Recorded)
    }

    /// Records a detach. Removing a document whose attach is still pending
    /// cancels that attach.
    pub fn record_remove(
        &mut self,
        record: RecordId,
        document_index: usize,
        document: DocumentRef,
    ) -> Result<RemoveOutcome, LedgerError> {
        self.ensure_not_deleted(record)?;

        if let Some(pos) = self.find_add(record, &document) {
            if let PendingOperation::AddDocument {
                document: DocumentRef::Remote(file_ref),
                ..
            } = self.entries.remove(pos)
            {
                // Already uploaded: the remote copy goes on both commit and rollback.
                self.abandoned_uploads.push(file_ref);
            }
            debug!(record, %document, "remove cancelled pending add");
            self.push_event(LedgerEvent::Cancelled {
                record,
                document: document.clone(),
            });
            return Ok(RemoveOutcome::CancelledAdd(document));
        }

        let file_ref = match document {
            DocumentRef::Remote(file_ref) => file_ref,
            DocumentRef::Temporary { temp_id } => return Err(LedgerError::UnknownTemporary(temp_id)),
        };

        let exists = self.entries.iter().any(|op| {
            matches!(op, PendingOperation::RemoveDocument { record: r, file_ref: f, .. }
                if *r == record && *f == file_ref)
        });
        if exists {
            return Ok(RemoveOutcome::AlreadyPending);
        }

        let op = PendingOperation::RemoveDocument {
            record,
            document_index,
            file_ref,
        };
        self.entries.push(op.clone());
        self.push_event(LedgerEvent::Recorded { op });
        Ok(RemoveOutcome::Recorded)
    }

    /// Marks a whole record for deletion, folding its per-document entries
    /// into the new entry. `documents` are the record's current attachments.
    ///
    /// Returns the number of file operations the deletion carries.
    pub fn record_delete_entire_record(
        &mut self,
        record: RecordId,
        documents: &[DocumentRef],
    ) -> Result<usize, LedgerError> {
        self.ensure_not_deleted(record)?;

        let mut superseded = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for op in self.entries.drain(..) {
            if op.record() == record {
                superseded.push(op);
            } else {
                kept.push(op);
            }
        }
        self.entries = kept;

        let mut seen = HashSet::new();
        let mut file_refs = Vec::new();
        {
            let pending_links: HashSet<&FileRef> = superseded
                .iter()
                .filter_map(|op| match op {
                    PendingOperation::AddDocument { document, .. } => document.as_remote(),
                    PendingOperation::AttachDocument { file_ref, .. } => Some(file_ref),
                    _ => None,
                })
                .collect();
            for file_ref in documents.iter().filter_map(DocumentRef::as_remote) {
                if !pending_links.contains(file_ref) && seen.insert(file_ref.clone()) {
                    file_refs.push(file_ref.clone());
                }
            }
        }
        for op in &superseded {
            if let PendingOperation::RemoveDocument { file_ref, .. } = op {
                if seen.insert(file_ref.clone()) {
                    file_refs.push(file_ref.clone());
                }
            }
        }

        let op = PendingOperation::RemoveRecord {
            record,
            file_refs,
            superseded,
        };
        let count = op.file_count();
        debug!(record, files = count, "record marked for deletion");
        self.entries.push(op.clone());
        self.push_event(LedgerEvent::Recorded { op });
        Ok(count)
    }

    /// Drops the record's deletion entry and restores the entries it folded in.
    pub fn undo_record_deletion(&mut self, record: RecordId) -> Result<(), LedgerError> {
        let pos = self
            .entries
            .iter()
            .position(|op| matches!(op, PendingOperation::RemoveRecord { record: r, .. } if *r == record))
            .ok_or(LedgerError::NotMarkedForDeletion(record))?;

        if let PendingOperation::RemoveRecord { superseded, .. } = self.entries.remove(pos) {
            self.entries.extend(superseded);
        }
        self.push_event(LedgerEvent::RecordRestored { record });
        Ok(())
    }

    /// True when a commit would delete `file_ref`.
    pub fn is_pending_deletion(&self, file_ref: &FileRef) -> bool {
        self.entries.iter().any(|op| match op {
            PendingOperation::RemoveDocument { file_ref: f, .. } => f == file_ref,
            PendingOperation::RemoveRecord { file_refs, .. } => file_refs.contains(file_ref),
            PendingOperation::AddDocument { .. } | PendingOperation::AttachDocument { .. } => false,
        })
    }

    /// True while `document` has an attach entry awaiting commit.
    pub fn is_pending_upload(&self, document: &DocumentRef) -> bool {
        self.entries.iter().any(|op| {
            matches!(op, PendingOperation::AddDocument { document: d, .. } if d == document)
        })
    }

    /// True when the record carries a deletion entry.
    pub fn is_record_marked_for_deletion(&self, record: RecordId) -> bool {
        self.entries
            .iter()
            .any(|op| matches!(op, PendingOperation::RemoveRecord { record: r, .. } if *r == record))
    }

    /// Every remote file a commit would delete.
    pub fn pending_deletions(&self) -> HashSet<&FileRef> {
        let mut out = HashSet::new();
        for op in &self.entries {
            match op {
                PendingOperation::RemoveDocument { file_ref, .. } => {
                    out.insert(file_ref);
                }
                PendingOperation::RemoveRecord { file_refs, .. } => out.extend(file_refs.iter()),
                PendingOperation::AddDocument { .. } | PendingOperation::AttachDocument { .. } => {}
            }
        }
        out
    }

    /// Temporary files a commit would upload.
    pub fn pending_uploads(&self) -> Vec<TempFileId> {
        self.entries
            .iter()
            .filter_map(|op| match op {
                PendingOperation::AddDocument { document, .. } => document.as_temporary(),
                _ => None,
            })
            .collect()
    }

    /// Number of entries; cancelled pairs leave none behind.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// File-level effects across all entries, for confirmation prompts.
    pub fn file_operation_count(&self) -> usize {
        self.entries.iter().map(PendingOperation::file_count).sum()
    }

    /// Uploads whose add was cancelled and whose remote copy still exists.
    pub fn cleanup_count(&self) -> usize {
        self.abandoned_uploads.len()
    }

    /// Entries in recording order.
    pub fn entries(&self) -> &[PendingOperation] {
        &self.entries
    }

    /// True when neither entries nor cleanup work remain.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.abandoned_uploads.is_empty()
    }

    /// Applies every entry: uploads first, then one best-effort batch delete.
    ///
    /// Files in `referenced` are still attached to a live record and are
    /// never deleted.
    pub async fn commit<G: FileGateway>(
        &mut self,
        gateway: &G,
        temps: &mut TempFileStore,
        owner: &UploadContext,
        referenced: &HashSet<FileRef>,
    ) -> Result<CommitReport, CommitError> {
        let mut uploaded = Vec::new();
        let mut failed = Vec::new();

        for idx in 0..self.entries.len() {
            let (record, temp_id) = match &self.entries[idx] {
                PendingOperation::AddDocument {
                    record,
                    document: DocumentRef::Temporary { temp_id },
                } => (*record, *temp_id),
                _ => continue,
            };

            let result = match temps.get(temp_id) {
                Some(file) => gateway.upload(file, owner).await,
                None => Err(GatewayError::UploadFailed {
                    name: temp_id.to_string(),
                    reason: "temporary file missing".to_string(),
                }),
            };

            match result {
                Ok(file_ref) => {
                    self.entries[idx] = PendingOperation::AddDocument {
                        record,
                        document: DocumentRef::Remote(file_ref.clone()),
                    };
                    temps.release(temp_id);
                    self.push_event(LedgerEvent::Uploaded {
                        temp_id,
                        file_ref: file_ref.clone(),
                    });
                    uploaded.push((temp_id, file_ref));
                }
                Err(error) => {
                    warn!(%temp_id, %error, "upload failed during commit");
                    failed.push(UploadFailure { temp_id, error });
                }
            }
        }

        if !failed.is_empty() {
            return Err(CommitError::PartialUploadFailure { uploaded, failed });
        }

        let mut seen: HashSet<FileRef> = referenced.clone();
        let mut targets = Vec::new();
        let mut releases = Vec::new();
        let mut durable = Vec::new();
        for op in &self.entries {
            match op {
                PendingOperation::AddDocument { document, .. } => {
                    if let Some(file_ref) = document.as_remote() {
                        durable.push(file_ref.clone());
                    }
                }
                PendingOperation::AttachDocument { file_ref, .. } => durable.push(file_ref.clone()),
                PendingOperation::RemoveDocument { file_ref, .. } => {
                    push_unique(&mut seen, &mut targets, file_ref);
                }
                PendingOperation::RemoveRecord {
                    file_refs, superseded, ..
                } => {
                    for file_ref in file_refs {
                        push_unique(&mut seen, &mut targets, file_ref);
                    }
                    for inner in superseded {
                        if let PendingOperation::AddDocument { document, .. } = inner {
                            match document {
                                DocumentRef::Remote(file_ref) => push_unique(&mut seen, &mut targets, file_ref),
                                DocumentRef::Temporary { temp_id } => releases.push(*temp_id),
                            }
                        }
                    }
                }
            }
        }
        for file_ref in &self.abandoned_uploads {
            push_unique(&mut seen, &mut targets, file_ref);
        }

        let result = if targets.is_empty() {
            BatchDeleteResult::default()
        } else {
            gateway.batch_delete(&targets).await
        };
        for failure in &result.failed {
            warn!(file_ref = %failure.file_ref, reason = %failure.reason, "remote file left orphaned after commit");
        }

        for temp_id in releases {
            temps.release(temp_id);
        }
        self.entries.clear();
        self.abandoned_uploads.clear();

        self.push_event(LedgerEvent::Committed {
            deleted: result.succeeded.iter().cloned().collect(),
            orphaned: result.failed.iter().map(|f| f.file_ref.clone()).collect(),
        });
        info!(
            uploaded = uploaded.len(),
            deleted = result.succeeded.len(),
            orphaned = result.failed.len(),
            "ledger committed"
        );

        Ok(CommitReport {
            uploaded,
            durable,
            deleted: result.succeeded,
            orphaned: result.failed,
        })
    }

    /// Discards every entry, undoing uploads and releasing temporary files.
    /// Gateway failures are reported, never propagated.
    ///
    /// Files in `referenced` belong to the restored document and are never
    /// deleted.
    pub async fn rollback<G: FileGateway>(
        &mut self,
        gateway: &G,
        temps: &mut TempFileStore,
        referenced: &HashSet<FileRef>,
    ) -> RollbackReport {
        let mut seen: HashSet<FileRef> = referenced.clone();
        let mut targets = Vec::new();
        let mut released = Vec::new();

        let mut collect = |document: &DocumentRef, targets: &mut Vec<FileRef>| match document {
            DocumentRef::Remote(file_ref) => push_unique(&mut seen, targets, file_ref),
            DocumentRef::Temporary { temp_id } => released.push(*temp_id),
        };

        for op in self.entries.drain(..) {
            match op {
                PendingOperation::AddDocument { document, .. } => collect(&document, &mut targets),
                PendingOperation::RemoveRecord { superseded, .. } => {
                    for inner in superseded {
                        if let PendingOperation::AddDocument { document, .. } = inner {
                            collect(&document, &mut targets);
                        }
                    }
                }
                PendingOperation::AttachDocument { .. } | PendingOperation::RemoveDocument { .. } => {}
            }
        }
        for file_ref in self.abandoned_uploads.drain(..) {
            collect(&DocumentRef::Remote(file_ref), &mut targets);
        }

        let result = if targets.is_empty() {
            BatchDeleteResult::default()
        } else {
            gateway.batch_delete(&targets).await
        };
        for failure in &result.failed {
            warn!(file_ref = %failure.file_ref, reason = %failure.reason, "could not undo upload during rollback");
        }
        for temp_id in &released {
            temps.release(*temp_id);
        }

        self.push_event(LedgerEvent::RolledBack {
            undone: result.succeeded.iter().cloned().collect(),
            orphaned: result.failed.iter().map(|f| f.file_ref.clone()).collect(),
        });
        info!(
            released = released.len(),
            undone = result.succeeded.len(),
            orphaned = result.failed.len(),
            "ledger rolled back"
        );

        RollbackReport {
            released,
            undone: result.succeeded,
            orphaned: result.failed,
        }
    }

    /// Takes events recorded since the last drain.
    pub fn drain_pending_events(&mut self) -> Vec<StoredEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Sequence of the most recent event, 0 before the first.
    pub fn latest_event_seq(&self) -> EventSeq {
        self.next_seq.saturating_sub(1)
    }

    fn cancel_removal(&mut self, record: RecordId, document: &DocumentRef) -> Option<AddOutcome> {
        let file_ref = document.as_remote()?;
        let pos = self.entries.iter().position(|op| {
            matches!(op, PendingOperation::RemoveDocument { record: r, file_ref: f, .. }
                if *r == record && f == file_ref)
        })?;
        let document_index = match self.entries.remove(pos) {
            PendingOperation::RemoveDocument { document_index, .. } => document_index,
            _ => 0,
        };
        debug!(record, %document, "re-add cancelled pending removal");
        self.push_event(LedgerEvent::Cancelled {
            record,
            document: document.clone(),
        });
        Some(AddOutcome::CancelledRemoval { document_index })
    }

    fn find_add(&self, record: RecordId, document: &DocumentRef) -> Option<usize> {
        self.entries.iter().position(|op| match op {
            PendingOperation::AddDocument { record: r, document: d } => *r == record && d == document,
            PendingOperation::AttachDocument { record: r, file_ref } => {
                *r == record && document.as_remote() == Some(file_ref)
            }
            _ => false,
        })
    }

    fn ensure_not_deleted(&self, record: RecordId) -> Result<(), LedgerError> {
        if self.is_record_marked_for_deletion(record) {
            return Err(LedgerError::RecordPendingDeletion(record));
        }
        Ok(())
    }

    fn push_event(&mut self, event: LedgerEvent) {
        let seq = self.next_seq.max(1);
        self.next_seq = seq + 1;
        self.pending_events.push(StoredEvent {
            seq,
            ts_ms: now_ms(),
            event,
        });
    }
}

fn push_unique(seen: &mut HashSet<FileRef>, targets: &mut Vec<FileRef>, file_ref: &FileRef) {
    if seen.insert(file_ref.clone()) {
        targets.push(file_ref.clone());
    }
}
