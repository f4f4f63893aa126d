#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeZone, Utc};

use clinic_ledger::{
    core::temp_store::{PickedFile, TemporaryFile},
    gateway::{BatchDeleteResult, DeleteFailure, FileGateway, GatewayError, UploadContext},
    patient::{HistoryRecord, Patient, PatientPatch},
    persist::{PatientStore, StoreError},
    types::{ClinicId, FileRef, PatientId},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).single().expect("valid date")
}

pub fn clinic() -> ClinicId {
    ClinicId::new("clinic-1")
}

pub fn patient_id() -> PatientId {
    PatientId::new("patient-1")
}

pub fn fr(s: &str) -> FileRef {
    FileRef::new(s)
}

/// Picked PDF of `len` bytes.
pub fn pdf(name: &str, len: usize) -> PickedFile {
    let mut bytes = b"%PDF-1.7\n".to_vec();
    bytes.resize(len.max(bytes.len()), b'0');
    PickedFile::new(name, "application/pdf", bytes)
}

/// One record dated 2024-01-05 with `doc-a` and `doc-b` attached.
pub fn patient_with_two_docs() -> Patient {
    let mut patient = Patient::new(patient_id(), clinic(), "Somchai", "HN-0001");
    patient.history.push(
        HistoryRecord::new(ts(2024, 1, 5), Some("checkup".to_string()))
            .with_document(fr("doc-a"))
            .with_document(fr("doc-b")),
    );
    patient
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Upload(String),
    Delete(FileRef),
    BatchDelete(Vec<FileRef>),
}

#[derive(Debug, Default)]
struct GatewayState {
    calls: Vec<GatewayCall>,
    next: u32,
    fail_uploads: HashSet<String>,
    fail_deletes: HashSet<FileRef>,
}

/// Records every call; failures are injected per file name or ref.
#[derive(Debug, Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_upload(&self, name: &str) {
        self.state.lock().expect("lock").fail_uploads.insert(name.to_string());
    }

    pub fn fail_delete(&self, file_ref: &FileRef) {
        self.state.lock().expect("lock").fail_deletes.insert(file_ref.clone());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().expect("lock");
        state.fail_uploads.clear();
        state.fail_deletes.clear();
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().expect("lock").calls.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Upload(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Every ref passed to `delete` or `batch_delete`.
    pub fn deleted(&self) -> Vec<FileRef> {
        let mut out = Vec::new();
        for call in self.calls() {
            match call {
                GatewayCall::Delete(file_ref) => out.push(file_ref),
                GatewayCall::BatchDelete(refs) => out.extend(refs),
                GatewayCall::Upload(_) => {}
            }
        }
        out
    }
}

impl FileGateway for FakeGateway {
    async fn upload(&self, file: &TemporaryFile, _owner: &UploadContext) -> Result<FileRef, GatewayError> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(GatewayCall::Upload(file.display_name.clone()));
        if state.fail_uploads.contains(&file.display_name) {
            return Err(GatewayError::UploadFailed {
                name: file.display_name.clone(),
                reason: "injected".to_string(),
            });
        }
        state.next += 1;
        Ok(FileRef(format!("blob/{}-{}", state.next, file.display_name)))
    }

    async fn delete(&self, file_ref: &FileRef) -> Result<(), GatewayError> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(GatewayCall::Delete(file_ref.clone()));
        if state.fail_deletes.contains(file_ref) {
            return Err(GatewayError::DeleteFailed {
                file_ref: file_ref.clone(),
                reason: "injected".to_string(),
            });
        }
        Ok(())
    }

    async fn batch_delete(&self, refs: &[FileRef]) -> BatchDeleteResult {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(GatewayCall::BatchDelete(refs.to_vec()));
        let mut out = BatchDeleteResult::default();
        for file_ref in refs {
            if state.fail_deletes.contains(file_ref) {
                out.failed.push(DeleteFailure {
                    file_ref: file_ref.clone(),
                    reason: "injected".to_string(),
                });
            } else {
                out.succeeded.insert(file_ref.clone());
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct StoreState {
    patient: Option<Patient>,
    fetches: usize,
    updates: Vec<PatientPatch>,
    fail_update: Option<StoreError>,
}

/// In-memory patient store that applies patches to the held document.
#[derive(Debug, Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn with_patient(patient: Patient) -> Self {
        let store = Self::default();
        store.state.lock().expect("lock").patient = Some(patient);
        store
    }

    pub fn fail_updates(&self, err: StoreError) {
        self.state.lock().expect("lock").fail_update = Some(err);
    }

    pub fn heal(&self) {
        self.state.lock().expect("lock").fail_update = None;
    }

    pub fn updates(&self) -> Vec<PatientPatch> {
        self.state.lock().expect("lock").updates.clone()
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().expect("lock").fetches
    }

    pub fn stored(&self) -> Option<Patient> {
        self.state.lock().expect("lock").patient.clone()
    }
}

impl PatientStore for FakeStore {
    async fn fetch(&self, _clinic_id: &ClinicId, patient_id: &PatientId) -> Result<Patient, StoreError> {
        let mut state = self.state.lock().expect("lock");
        state.fetches += 1;
        state
            .patient
            .clone()
            .filter(|p| &p.id == patient_id)
            .ok_or_else(|| StoreError::NotFound(patient_id.clone()))
    }

    async fn update(
        &self,
        _clinic_id: &ClinicId,
        patient_id: &PatientId,
        patch: &PatientPatch,
    ) -> Result<Patient, StoreError> {
        let mut state = self.state.lock().expect("lock");
        state.updates.push(patch.clone());
        if let Some(err) = state.fail_update.clone() {
            return Err(err);
        }
        let patient = state
            .patient
            .as_mut()
            .filter(|p| &p.id == patient_id)
            .ok_or_else(|| StoreError::NotFound(patient_id.clone()))?;
        patient.name = patch.name.clone();
        patient.hn_code = patch.hn_code.clone();
        patient.history = patch.history.clone();
        Ok(patient.clone())
    }
}
