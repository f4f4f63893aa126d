//! Shared identifiers and document references.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session-local record identifier, stable across re-sorts.
pub type RecordId = u64;
/// Monotonic ledger event sequence number.
pub type EventSeq = u64;

/// Wall-clock milliseconds since the Unix epoch, 0 if the clock is before it.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Clinic (tenant) identifier as issued by the document database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClinicId(pub String);

/// Patient identifier as issued by the document database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub String);

/// Durable locator of a file stored in the remote blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(pub String);

impl FileRef {
    /// Wraps a locator string.
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    /// Returns the raw locator.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ClinicId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl PatientId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ClinicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token for a file held in the temporary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempFileId(pub Uuid);

impl TempFileId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TempFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of one edit session in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document attached to a history record.
///
/// Saved patient documents only ever contain `Remote` references; a
/// `Temporary` reference exists only inside an edit session, between the
/// user picking a file and the commit that uploads it. `Remote` serializes
/// as the bare locator string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentRef {
    /// Durable remote file.
    Remote(FileRef),
    /// File picked in this session and not uploaded yet.
    Temporary {
        /// Temporary store handle.
        temp_id: TempFileId,
    },
}

impl DocumentRef {
    /// Builds a temporary reference.
    pub fn temporary(temp_id: TempFileId) -> Self {
        Self::Temporary { temp_id }
    }

    /// Returns the durable locator, if any.
    pub fn as_remote(&self) -> Option<&FileRef> {
        match self {
            Self::Remote(file_ref) => Some(file_ref),
            Self::Temporary { .. } => None,
        }
    }

    /// Returns the temporary handle, if any.
    pub fn as_temporary(&self) -> Option<TempFileId> {
        match self {
            Self::Remote(_) => None,
            Self::Temporary { temp_id } => Some(*temp_id),
        }
    }

    /// True when the reference points at the remote store.
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl From<FileRef> for DocumentRef {
    fn from(value: FileRef) -> Self {
        Self::Remote(value)
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(file_ref) => write!(f, "{file_ref}"),
            Self::Temporary { temp_id } => write!(f, "temp:{temp_id}"),
        }
    }
}
