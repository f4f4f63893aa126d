//! Patient document store contract and the session journal.

/// HTTP implementation of [`PatientStore`].
pub mod http;
/// SQLite implementation of [`JournalSink`].
pub mod sqlite;

use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    op::StoredEvent,
    patient::{Patient, PatientPatch},
    types::{ClinicId, EventSeq, PatientId, SessionId},
};

/// Patient store failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No such patient in this clinic.
    #[error("patient {0} not found")]
    NotFound(PatientId),
    /// The store rejected the document.
    #[error("rejected by the patient store: {0}")]
    ValidationError(String),
    /// Transport failure or server error.
    #[error("patient store unreachable: {0}")]
    NetworkError(String),
}

/// Read/update contract of the patient document database. `update` applies
/// the whole patch or none of it.
pub trait PatientStore: Send + Sync {
    /// Loads one patient document.
    fn fetch(
        &self,
        clinic_id: &ClinicId,
        patient_id: &PatientId,
    ) -> impl Future<Output = Result<Patient, StoreError>> + Send;

    /// Writes `patch` and returns the stored document.
    fn update(
        &self,
        clinic_id: &ClinicId,
        patient_id: &PatientId,
        patch: &PatientPatch,
    ) -> impl Future<Output = Result<Patient, StoreError>> + Send;
}

impl<T: PatientStore> PatientStore for Arc<T> {
    fn fetch(
        &self,
        clinic_id: &ClinicId,
        patient_id: &PatientId,
    ) -> impl Future<Output = Result<Patient, StoreError>> + Send {
        (**self).fetch(clinic_id, patient_id)
    }

    fn update(
        &self,
        clinic_id: &ClinicId,
        patient_id: &PatientId,
        patch: &PatientPatch,
    ) -> impl Future<Output = Result<Patient, StoreError>> + Send {
        (**self).update(clinic_id, patient_id, patch)
    }
}

/// Journal storage failure.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// SQLite error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload encoding error.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else, e.g. a bad row.
    #[error("{0}")]
    Message(String),
}

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Journal row describing one edit session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSession {
    /// Session key.
    pub id: SessionId,
    /// Owning clinic.
    pub clinic_id: ClinicId,
    /// Edited patient.
    pub patient_id: PatientId,
    /// Open time in milliseconds.
    pub opened_ms: u64,
}

/// How a journaled session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    /// Committed and written.
    Saved,
    /// Rolled back.
    Discarded,
    /// Closed by a recovery sweep after a crash.
    Recovered,
}

impl SessionOutcome {
    /// Column value stored in the journal.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Discarded => "discarded",
            Self::Recovered => "recovered",
        }
    }
}

/// Append-only sink for ledger events, one stream per session.
pub trait JournalSink: Send {
    /// Registers a session as open.
    fn open_session(&mut self, session: &JournalSession) -> JournalResult<()>;
    /// Appends events in order, returning the last stored sequence.
    fn append_events(&mut self, session: SessionId, events: &[StoredEvent]) -> JournalResult<EventSeq>;
    /// Marks an open session as ended.
    fn close_session(&mut self, session: SessionId, outcome: SessionOutcome) -> JournalResult<()>;
    /// Forces buffered writes out.
    fn flush(&mut self) -> JournalResult<()> {
        Ok(())
    }
}
