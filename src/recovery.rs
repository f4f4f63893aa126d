//! Cleanup after sessions that never reached `Saved` or `Discarded`.
//!
//! A crashed session may leave uploaded files that no saved patient document
//! references. The sweep replays each open session's journal, compares the
//! refs it uploaded against the stored document and deletes the strays.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::{
    gateway::{BatchDeleteResult, DeleteFailure, FileGateway},
    op::{LedgerEvent, PendingOperation},
    persist::{
        JournalResult, JournalSession, JournalSink, PatientStore, SessionOutcome, StoreError, sqlite::SqliteJournal,
    },
    types::{DocumentRef, FileRef, SessionId},
};

/// Result of sweeping one abandoned session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredSession {
    /// Swept session.
    pub session: SessionId,
    /// Uploaded refs the patient document still references.
    pub kept: BTreeSet<FileRef>,
    /// Stray uploads deleted.
    pub deleted: BTreeSet<FileRef>,
    /// Stray uploads whose deletion failed.
    pub orphaned: Vec<DeleteFailure>,
}

/// Outcome of [`sweep_abandoned`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions closed as recovered.
    pub recovered: Vec<RecoveredSession>,
    /// Sessions left open because the patient store was unreachable.
    pub skipped: Vec<(SessionId, StoreError)>,
}

/// Remote refs a session's journal shows it uploaded. Links to files
/// that were already durable do not count.
pub fn uploaded_refs<'a>(events: impl IntoIterator<Item = &'a LedgerEvent>) -> BTreeSet<FileRef> {
    let mut out = BTreeSet::new();
    for event in events {
        match event {
            LedgerEvent::Recorded {
                op:
                    PendingOperation::AddDocument {
                        document: DocumentRef::Remote(file_ref),
                        ..
                    },
            } => {
                out.insert(file_ref.clone());
            }
            LedgerEvent::Uploaded { file_ref, .. } => {
                out.insert(file_ref.clone());
            }
            _ => {}
        }
    }
    out
}

/// Sweeps every session the journal still has open.
///
/// Refs of a patient that no longer exists are all deleted. A session whose
/// patient cannot be fetched for any other reason stays open for the next
/// sweep.
pub async fn sweep_abandoned<G, S>(journal: &mut SqliteJournal, gateway: &G, store: &S) -> JournalResult<RecoveryReport>
where
    G: FileGateway,
    S: PatientStore,
{
    let mut report = RecoveryReport::default();

    for session in journal.load_open_sessions()? {
        let events = journal.load_events(session.id)?;
        let uploaded = uploaded_refs(events.iter().map(|stored| &stored.event));

        let referenced = match store.fetch(&session.clinic_id, &session.patient_id).await {
            Ok(patient) => patient.durable_refs().cloned().collect::<BTreeSet<_>>(),
            Err(StoreError::NotFound(_)) => BTreeSet::new(),
            Err(err) => {
                warn!(session = %session.id, %err, "patient unavailable, session left for next sweep");
                report.skipped.push((session.id, err));
                continue;
            }
        };

        let recovered = sweep_session(&session, uploaded, &referenced, gateway).await;
        journal.close_session(session.id, SessionOutcome::Recovered)?;
        report.recovered.push(recovered);
    }

    journal.flush()?;
    info!(
        recovered = report.recovered.len(),
        skipped = report.skipped.len(),
        "abandoned session sweep finished"
    );
    Ok(report)
}

async fn sweep_session<G: FileGateway>(
    session: &JournalSession,
    uploaded: BTreeSet<FileRef>,
    referenced: &BTreeSet<FileRef>,
    gateway: &G,
) -> RecoveredSession {
    let (kept, strays): (BTreeSet<_>, BTreeSet<_>) = uploaded.into_iter().partition(|f| referenced.contains(f));
    let strays: Vec<FileRef> = strays.into_iter().collect();

    let result = if strays.is_empty() {
        BatchDeleteResult::default()
    } else {
        gateway.batch_delete(&strays).await
    };
    for failure in &result.failed {
        warn!(session = %session.id, file_ref = %failure.file_ref, reason = %failure.reason, "stray upload left orphaned");
    }

    RecoveredSession {
        session: session.id,
        kept,
        deleted: result.succeeded,
        orphaned: result.failed,
    }
}
