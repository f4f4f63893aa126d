//! Remote file gateway contract.
//!
//! The gateway is the only component that talks to blob storage. The core
//! treats every call as independent: it never assumes ordering between
//! calls and never retries on the caller's behalf.

use std::{collections::BTreeSet, future::Future, sync::Arc};

use crate::{
    core::temp_store::TemporaryFile,
    types::{ClinicId, FileRef, PatientId},
};

/// HTTP implementation of [`FileGateway`].
pub mod http;

/// Owner of an upload, forwarded to the storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadContext {
    /// Owning clinic.
    pub clinic_id: ClinicId,
    /// Owning patient.
    pub patient_id: PatientId,
}

/// Per-file gateway failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The file could not be stored.
    #[error("upload of {name} failed: {reason}")]
    UploadFailed {
        /// File name.
        name: String,
        /// Backend or transport message.
        reason: String,
    },
    /// The file could not be deleted.
    #[error("delete of {file_ref} failed: {reason}")]
    DeleteFailed {
        /// Target locator.
        file_ref: FileRef,
        /// Backend or transport message.
        reason: String,
    },
}

/// One failed target of a batch delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    /// File left in remote storage.
    pub file_ref: FileRef,
    /// Backend or transport message.
    pub reason: String,
}

/// Outcome of a best-effort batch delete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchDeleteResult {
    /// Deleted locators.
    pub succeeded: BTreeSet<FileRef>,
    /// Locators that remain in storage.
    pub failed: Vec<DeleteFailure>,
}

impl BatchDeleteResult {
    /// Marks every target failed with the same reason.
    pub fn all_failed(refs: &[FileRef], reason: &str) -> Self {
        Self {
            succeeded: BTreeSet::new(),
            failed: refs
                .iter()
                .map(|file_ref| DeleteFailure {
                    file_ref: file_ref.clone(),
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }
}

/// Upload/delete contract against the blob store.
pub trait FileGateway: Send + Sync {
    /// Stores `file` and returns its durable locator.
    fn upload(
        &self,
        file: &TemporaryFile,
        owner: &UploadContext,
    ) -> impl Future<Output = Result<FileRef, GatewayError>> + Send;

    /// Deletes one stored file.
    fn delete(&self, file_ref: &FileRef) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Deletes every target; one failure never aborts the others.
    ///
    /// The default issues one `delete` per target.
    fn batch_delete(&self, refs: &[FileRef]) -> impl Future<Output = BatchDeleteResult> + Send {
        async move {
            let mut out = BatchDeleteResult::default();
            for file_ref in refs {
                match self.delete(file_ref).await {
                    Ok(()) => {
                        out.succeeded.insert(file_ref.clone());
                    }
                    Err(err) => out.failed.push(DeleteFailure {
                        file_ref: file_ref.clone(),
                        reason: err.to_string(),
                    }),
                }
            }
            out
        }
    }
}

impl<T: FileGateway> FileGateway for Arc<T> {
    fn upload(
        &self,
        file: &TemporaryFile,
        owner: &UploadContext,
    ) -> impl Future<Output = Result<FileRef, GatewayError>> + Send {
        (**self).upload(file, owner)
    }

    fn delete(&self, file_ref: &FileRef) -> impl Future<Output = Result<(), GatewayError>> + Send {
        (**self).delete(file_ref)
    }

    fn batch_delete(&self, refs: &[FileRef]) -> impl Future<Output = BatchDeleteResult> + Send {
        (**self).batch_delete(refs)
    }
}
