//! `reqwest` client for `GET`/`PATCH /patients/{id}?clinicId=`.

use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    config::HttpConfig,
    patient::{Patient, PatientPatch},
    types::{ClinicId, PatientId},
};

use super::{PatientStore, StoreError};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Patient document store reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPatientStore {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpPatientStore {
    /// Builds a client with the configured timeout.
    pub fn new(config: HttpConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    fn patient_url(&self, patient_id: &PatientId) -> String {
        self.config.url(&format!("patients/{}", patient_id.0))
    }
}

impl PatientStore for HttpPatientStore {
    async fn fetch(&self, clinic_id: &ClinicId, patient_id: &PatientId) -> Result<Patient, StoreError> {
        let resp = self
            .client
            .get(self.patient_url(patient_id))
            .query(&[("clinicId", clinic_id.0.as_str())])
            .send()
            .await
            .map_err(|e| StoreError::NetworkError(e.to_string()))?;
        decode_patient(resp, patient_id).await
    }

    async fn update(
        &self,
        clinic_id: &ClinicId,
        patient_id: &PatientId,
        patch: &PatientPatch,
    ) -> Result<Patient, StoreError> {
        let resp = self
            .client
            .patch(self.patient_url(patient_id))
            .query(&[("clinicId", clinic_id.0.as_str())])
            .json(patch)
            .send()
            .await
            .map_err(|e| StoreError::NetworkError(e.to_string()))?;
        let patient = decode_patient(resp, patient_id).await?;
        debug!(patient = %patient_id, records = patient.history.len(), "patient updated");
        Ok(patient)
    }
}

async fn decode_patient(resp: Response, patient_id: &PatientId) -> Result<Patient, StoreError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(patient_id.clone()));
    }
    if status.is_client_error() {
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => format!("status {status}"),
        };
        return Err(StoreError::ValidationError(message));
    }
    if !status.is_success() {
        return Err(StoreError::NetworkError(format!("status {status}")));
    }
    let body: Value = resp
        .json()
        .await
        .map_err(|e| StoreError::NetworkError(format!("invalid response body: {e}")))?;
    if let Some(message) = body.get("error").and_then(Value::as_str) {
        return Err(StoreError::ValidationError(message.to_string()));
    }
    serde_json::from_value(body).map_err(|e| StoreError::NetworkError(format!("invalid patient document: {e}")))
}
