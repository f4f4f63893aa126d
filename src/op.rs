//! Pending operation model and journal wrappers.

use serde::{Deserialize, Serialize};

use crate::types::{DocumentRef, EventSeq, FileRef, RecordId, TempFileId};

/// Version number for serialized [`StoredEventEnvelope`] payloads.
pub const EVENT_FORMAT_VERSION: u16 = 1;

/// One uncommitted intent against the remote file store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOperation {
    /// A file was attached and is not durable in the saved document yet.
    AddDocument {
        /// Owning record.
        record: RecordId,
        /// Attached file, temporary or already uploaded.
        document: DocumentRef,
    },
    /// A durable file already held elsewhere was linked to a record.
    /// Neither commit nor rollback ever deletes it.
    AttachDocument {
        /// Receiving record.
        record: RecordId,
        /// Linked remote copy.
        file_ref: FileRef,
    },
    /// An existing document was detached; its remote copy still exists.
    RemoveDocument {
        /// Owning record.
        record: RecordId,
        /// Position of the document when it was detached.
        document_index: usize,
        /// Remote copy to delete on commit.
        file_ref: FileRef,
    },
    /// A whole record was removed.
    RemoveRecord {
        /// Removed record.
        record: RecordId,
        /// Durable attachments to delete on commit.
        file_refs: Vec<FileRef>,
        /// Per-document entries folded into this one, restored on undo.
        superseded: Vec<PendingOperation>,
    },
}

impl PendingOperation {
    /// Record the operation belongs to.
    pub fn record(&self) -> RecordId {
        match self {
            Self::AddDocument { record, .. }
            | Self::AttachDocument { record, .. }
            | Self::RemoveDocument { record, .. }
            | Self::RemoveRecord { record, .. } => *record,
        }
    }

    /// Number of file-level effects, used for confirmation prompts.
    pub fn file_count(&self) -> usize {
        match self {
            Self::AddDocument { .. } | Self::AttachDocument { .. } | Self::RemoveDocument { .. } => 1,
            Self::RemoveRecord { file_refs, superseded, .. } => {
                let extra_adds = superseded
                    .iter()
                    .filter(|op| matches!(op, Self::AddDocument { .. }))
                    .count();
                file_refs.len() + extra_adds
            }
        }
    }
}

/// Ledger transition, appended to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// A new entry was appended.
    Recorded {
        /// Appended entry.
        op: PendingOperation,
    },
    /// An add and a remove for the same document cancelled out.
    Cancelled {
        /// Owning record.
        record: RecordId,
        /// Document whose entries cancelled.
        document: DocumentRef,
    },
    /// A record deletion was undone.
    RecordRestored {
        /// Restored record.
        record: RecordId,
    },
    /// A temporary file reached the remote store during commit.
    Uploaded {
        /// Released temporary handle.
        temp_id: TempFileId,
        /// New durable locator.
        file_ref: FileRef,
    },
    /// Every entry was applied.
    Committed {
        /// Remote files deleted.
        deleted: Vec<FileRef>,
        /// Remote files whose deletion failed.
        orphaned: Vec<FileRef>,
    },
    /// Every entry was discarded.
    RolledBack {
        /// Uploads undone.
        undone: Vec<FileRef>,
        /// Uploads whose deletion failed.
        orphaned: Vec<FileRef>,
    },
}

/// Journal row metadata plus event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Monotonic event sequence.
    pub seq: EventSeq,
    /// Event timestamp in milliseconds.
    pub ts_ms: u64,
    /// Event body.
    pub event: LedgerEvent,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEventEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped event.
    pub stored: StoredEvent,
}

impl StoredEventEnvelope {
    /// Constructs an envelope using [`EVENT_FORMAT_VERSION`].
    pub fn new(stored: StoredEvent) -> Self {
        Self {
            format_version: EVENT_FORMAT_VERSION,
            stored,
        }
    }
}
