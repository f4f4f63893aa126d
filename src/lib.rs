//! Deferred file mutations for a patient medical-history editor.
//!
//! An [`session::EditorSession`] owns one patient's working copy. Attaching
//! or detaching documents and removing records only records intent in a
//! [`crate::core::ledger::Ledger`]; nothing touches remote storage until `save`
//! commits the ledger (uploads first, then one best-effort batch delete) and
//! writes the patient document. `discard` rolls every intent back.
//!
//! # Examples
//!
//! ```no_run
//! use clinic_ledger::{
//!     config::{EditorConfig, HttpConfig},
//!     core::temp_store::PickedFile,
//!     gateway::http::HttpFileGateway,
//!     persist::http::HttpPatientStore,
//!     runtime::handle::{RuntimeConfig, spawn_editor},
//!     session::EditorSession,
//!     types::{ClinicId, PatientId},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let http = HttpConfig::new("https://clinic.example/api");
//! let gateway = HttpFileGateway::new(http.clone()).expect("gateway");
//! let store = HttpPatientStore::new(http).expect("store");
//! let session = EditorSession::load(
//!     gateway,
//!     store,
//!     &ClinicId::new("c-1"),
//!     &PatientId::new("p-1"),
//!     EditorConfig::default(),
//! )
//! .await
//! .expect("load");
//!
//! let handle = spawn_editor(session, RuntimeConfig::default());
//! let pdf = PickedFile::new("scan.pdf", "application/pdf", b"%PDF-1.7".to_vec());
//! handle.add_document(0, pdf).await.expect("attach");
//! let report = handle.save().await.expect("save");
//! assert!(report.orphaned.is_empty());
//! # }
//! ```
#![deny(missing_docs)]

/// Editor, upload and HTTP settings.
pub mod config;
/// Temporary file store and pending operation ledger.
pub mod core;
/// Remote file storage contract and HTTP client.
pub mod gateway;
/// Ledger entries and journal event payloads.
pub mod op;
/// Patient document model and patches.
pub mod patient;
/// Patient store contract, HTTP client and SQLite journal.
pub mod persist;
/// Cleanup of sessions that never ended.
pub mod recovery;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Edit session, confirmation prompts and in-flight guard.
pub mod session;
/// Shared identifiers.
pub mod types;
