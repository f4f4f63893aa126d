//! `reqwest` client for the blob storage HTTP contract.

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::HttpConfig,
    core::temp_store::TemporaryFile,
    types::FileRef,
};

use super::{BatchDeleteResult, DeleteFailure, FileGateway, GatewayError, UploadContext};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_ref: String,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchDeleteRequest<'a> {
    refs: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BatchDeleteResponse {
    #[serde(default)]
    results: Vec<BatchDeleteItem>,
}

#[derive(Debug, Deserialize)]
struct BatchDeleteItem {
    #[serde(rename = "ref")]
    file_ref: String,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Blob gateway over `POST /files`, `DELETE /files` and `POST /files/batch-delete`.
#[derive(Debug, Clone)]
pub struct HttpFileGateway {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpFileGateway {
    /// Builds a client with the configured timeout.
    pub fn new(config: HttpConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    async fn try_upload(&self, file: &TemporaryFile, owner: &UploadContext) -> Result<FileRef, String> {
        let part = Part::bytes(file.bytes().to_vec())
            .file_name(file.display_name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| e.to_string())?;
        let form = Form::new()
            .part("file", part)
            .text("clinicId", owner.clinic_id.0.clone())
            .text("patientId", owner.patient_id.0.clone());

        let resp = self
            .client
            .post(self.config.url("files"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("status {status}"));
        }
        let body: UploadResponse = resp.json().await.map_err(|e| e.to_string())?;
        Ok(FileRef(body.file_ref))
    }

    async fn try_delete(&self, file_ref: &FileRef) -> Result<(), String> {
        let resp = self
            .client
            .delete(self.config.url("files"))
            .query(&[("ref", file_ref.as_str())])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let body: DeleteResponse = resp
            .json()
            .await
            .map_err(|e| format!("status {status}: {e}"))?;
        if body.success {
            Ok(())
        } else {
            Err(body.error.unwrap_or_else(|| format!("status {status}")))
        }
    }

    async fn try_batch_delete(&self, refs: &[FileRef]) -> Result<BatchDeleteResponse, String> {
        let req = BatchDeleteRequest {
            refs: refs.iter().map(FileRef::as_str).collect(),
        };
        let resp = self
            .client
            .post(self.config.url("files/batch-delete"))
            .json(&req)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(format!("status {status}"));
        }
        resp.json().await.map_err(|e| e.to_string())
    }
}

impl FileGateway for HttpFileGateway {
    async fn upload(&self, file: &TemporaryFile, owner: &UploadContext) -> Result<FileRef, GatewayError> {
        let file_ref = self
            .try_upload(file, owner)
            .await
            .map_err(|reason| GatewayError::UploadFailed {
                name: file.display_name.clone(),
                reason,
            })?;
        debug!(%file_ref, name = %file.display_name, "uploaded");
        Ok(file_ref)
    }

    async fn delete(&self, file_ref: &FileRef) -> Result<(), GatewayError> {
        self.try_delete(file_ref)
            .await
            .map_err(|reason| GatewayError::DeleteFailed {
                file_ref: file_ref.clone(),
                reason,
            })
    }

    async fn batch_delete(&self, refs: &[FileRef]) -> BatchDeleteResult {
        if refs.is_empty() {
            return BatchDeleteResult::default();
        }
        let body = match self.try_batch_delete(refs).await {
            Ok(body) => body,
            Err(reason) => return BatchDeleteResult::all_failed(refs, &reason),
        };

        let mut out = BatchDeleteResult::default();
        for target in refs {
            let item = body.results.iter().find(|r| r.file_ref == target.as_str());
            match item {
                Some(item) if item.success => {
                    out.succeeded.insert(target.clone());
                }
                Some(item) => out.failed.push(DeleteFailure {
                    file_ref: target.clone(),
                    reason: item.error.clone().unwrap_or_else(|| "delete failed".to_string()),
                }),
                None => out.failed.push(DeleteFailure {
                    file_ref: target.clone(),
                    reason: "missing from batch response".to_string(),
                }),
            }
        }
        out
    }
}
