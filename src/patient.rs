//! Patient document, history records, drafts and patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ClinicId, DocumentRef, FileRef, PatientId, RecordId, TempFileId};

/// Whether a record is shown or waiting to be deleted on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RecordStatus {
    /// Displayed and persisted.
    #[default]
    Active,
    /// Hidden from display; dropped from the document on save.
    PendingDeletion,
}

/// One medical-history visit with its attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Session-local identity, assigned on load.
    #[serde(skip)]
    pub id: RecordId,
    /// Display tag.
    #[serde(skip)]
    pub status: RecordStatus,
    /// When the visit occurred.
    pub timestamp: DateTime<Utc>,
    /// Free-text notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Attachments in display order.
    #[serde(default)]
    pub document_refs: Vec<DocumentRef>,
}

impl HistoryRecord {
    /// Builds an active record with no attachments.
    pub fn new(timestamp: DateTime<Utc>, notes: Option<String>) -> Self {
        Self {
            id: 0,
            status: RecordStatus::Active,
            timestamp,
            notes,
            document_refs: Vec::new(),
        }
    }

    /// Adds a durable attachment, builder style.
    pub fn with_document(mut self, file_ref: FileRef) -> Self {
        self.document_refs.push(DocumentRef::Remote(file_ref));
        self
    }

    /// True unless the record is marked for deletion.
    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }

    /// Durable attachments.
    pub fn durable_refs(&self) -> impl Iterator<Item = &FileRef> {
        self.document_refs.iter().filter_map(DocumentRef::as_remote)
    }
}

/// Patient document as stored by the document database.
///
/// Fields the editor does not understand are kept in `extra` so a load,
/// edit and save cycle never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Document id.
    #[serde(rename = "_id", alias = "id")]
    pub id: PatientId,
    /// Owning clinic.
    #[serde(rename = "clinicId")]
    pub clinic_id: ClinicId,
    /// Display name; required for save.
    #[serde(default)]
    pub name: String,
    /// Hospital number; required for save.
    #[serde(rename = "HN_code", default)]
    pub hn_code: String,
    /// Medical history, newest first.
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    /// Unmodelled document fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Patient {
    /// Builds an empty patient for the given ids.
    pub fn new(id: PatientId, clinic_id: ClinicId, name: impl Into<String>, hn_code: impl Into<String>) -> Self {
        Self {
            id,
            clinic_id,
            name: name.into(),
            hn_code: hn_code.into(),
            history: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Names of required fields that are blank.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.hn_code.trim().is_empty() {
            missing.push("HN_code");
        }
        missing
    }

    /// Sorts history newest first. Equal timestamps keep their current order.
    pub fn sort_history(&mut self) {
        self.history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    /// Position of the record with `id`.
    pub fn position_of(&self, id: RecordId) -> Option<usize> {
        self.history.iter().position(|r| r.id == id)
    }

    /// Mutable access by record id.
    pub fn record_mut(&mut self, id: RecordId) -> Option<&mut HistoryRecord> {
        self.history.iter_mut().find(|r| r.id == id)
    }

    /// Records that should be displayed.
    pub fn visible_history(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.history.iter().filter(|r| r.is_active())
    }

    /// Every durable ref across active records.
    pub fn durable_refs(&self) -> impl Iterator<Item = &FileRef> {
        self.visible_history().flat_map(HistoryRecord::durable_refs)
    }

    /// True when any record still points at a temporary file.
    pub fn has_temporary_refs(&self) -> bool {
        self.history
            .iter()
            .flat_map(|r| r.document_refs.iter())
            .any(|d| !d.is_durable())
    }

    /// Replaces one temporary reference with its uploaded locator.
    pub fn replace_temporary(&mut self, temp_id: TempFileId, file_ref: &FileRef) -> bool {
        let target = DocumentRef::temporary(temp_id);
        for record in &mut self.history {
            if let Some(slot) = record.document_refs.iter_mut().find(|d| **d == target) {
                *slot = DocumentRef::Remote(file_ref.clone());
                return true;
            }
        }
        false
    }

    /// Physically drops records marked for deletion.
    pub fn purge_deleted(&mut self) {
        self.history.retain(HistoryRecord::is_active);
    }
}

/// Input of the "add record" form.
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
    /// Visit time; `None` means now.
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-text notes.
    pub notes: Option<String>,
    /// Files picked together with the record.
    pub files: Vec<crate::core::temp_store::PickedFile>,
}

/// Sparse patch where each `Some` field overwrites the record value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordPatch {
    /// Optional replacement for the visit time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Optional replacement for notes; `Some(None)` clears them.
    pub notes: Option<Option<String>>,
}

impl RecordPatch {
    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies this patch in place to `rec`.
    pub fn apply_to(&self, rec: &mut HistoryRecord) {
        if let Some(v) = self.timestamp {
            rec.timestamp = v;
        }
        if let Some(v) = &self.notes {
            rec.notes = v.clone();
        }
    }
}

/// Body of the persistence `update` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientPatch {
    /// Display name.
    pub name: String,
    /// Hospital number.
    #[serde(rename = "HN_code")]
    pub hn_code: String,
    /// Active history, all references durable.
    pub history: Vec<HistoryRecord>,
}

impl PatientPatch {
    /// Builds the patch from a committed working copy.
    ///
    /// Returns the first offending handle when a temporary reference is
    /// still present; such a patch must never reach the database.
    pub fn from_patient(patient: &Patient) -> Result<Self, TempFileId> {
        let history: Vec<HistoryRecord> = patient.visible_history().cloned().collect();
        if let Some(temp_id) = history
            .iter()
            .flat_map(|r| r.document_refs.iter())
            .find_map(DocumentRef::as_temporary)
        {
            return Err(temp_id);
        }
        Ok(Self {
            name: patient.name.clone(),
            hn_code: patient.hn_code.clone(),
            history,
        })
    }
}
