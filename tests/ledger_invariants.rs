mod common;

use hashbrown::HashSet;
use proptest::prelude::*;

use clinic_ledger::{
    config::EditorConfig,
    core::{
        ledger::{AddOutcome, CommitError, Ledger, LedgerError, RemoveOutcome},
        temp_store::TempFileStore,
    },
    gateway::UploadContext,
    op::{LedgerEvent, PendingOperation},
    patient::{HistoryRecord, Patient},
    session::{AlwaysConfirm, EditorSession},
    types::{DocumentRef, FileRef, RecordId},
};

use common::{FakeGateway, FakeStore, GatewayCall, clinic, fr, patient_id, pdf, ts};

fn owner() -> UploadContext {
    UploadContext {
        clinic_id: clinic(),
        patient_id: patient_id(),
    }
}

fn none_referenced() -> HashSet<FileRef> {
    HashSet::new()
}

fn entries_for(ledger: &Ledger, record: RecordId, file_ref: &FileRef) -> usize {
    ledger
        .entries()
        .iter()
        .filter(|op| match op {
            PendingOperation::AddDocument { record: r, document } => {
                *r == record && document.as_remote() == Some(file_ref)
            }
            PendingOperation::AttachDocument { record: r, file_ref: f } => *r == record && f == file_ref,
            PendingOperation::RemoveDocument { record: r, file_ref: f, .. } => *r == record && f == file_ref,
            PendingOperation::RemoveRecord { .. } => false,
        })
        .count()
}

#[derive(Debug, Clone)]
enum Action {
    Add { record: RecordId, doc: u8 },
    Reattach { record: RecordId, doc: u8 },
    Remove { record: RecordId, doc: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1u64..4, 0u8..5).prop_map(|(record, doc)| Action::Add { record, doc }),
        (1u64..4, 0u8..5).prop_map(|(record, doc)| Action::Reattach { record, doc }),
        (1u64..4, 0u8..5).prop_map(|(record, doc)| Action::Remove { record, doc }),
    ]
}

fn doc_ref(doc: u8) -> FileRef {
    fr(&format!("doc-{doc}"))
}

fn apply(ledger: &mut Ledger, action: Action) {
    match action {
        Action::Add { record, doc } => {
            ledger.record_add(record, DocumentRef::Remote(doc_ref(doc))).expect("add");
        }
        Action::Reattach { record, doc } => {
            ledger.record_reattach(record, doc_ref(doc)).expect("reattach");
        }
        Action::Remove { record, doc } => {
            ledger
                .record_remove(record, usize::from(doc), DocumentRef::Remote(doc_ref(doc)))
                .expect("remove");
        }
    }
}

proptest! {
    #[test]
    fn at_most_one_entry_per_record_and_file(actions in prop::collection::vec(action_strategy(), 1..120)) {
        let mut ledger = Ledger::new();

        for action in actions {
            apply(&mut ledger, action);

            for record in 1u64..4 {
                for doc in 0u8..5 {
                    prop_assert!(entries_for(&ledger, record, &doc_ref(doc)) <= 1);
                }
            }
        }
    }

    #[test]
    fn add_then_remove_leaves_pending_count_unchanged(
        prefix in prop::collection::vec(action_strategy(), 0..40),
        record in 1u64..4,
    ) {
        let mut ledger = Ledger::new();
        for action in prefix {
            apply(&mut ledger, action);
        }

        let before = ledger.pending_count();
        let mut temps = TempFileStore::new(EditorConfig::default());
        let temp = temps.create(pdf("fresh.pdf", 64), record).expect("temp").id;
        ledger.record_add(record, DocumentRef::temporary(temp)).expect("add temp");
        let outcome = ledger.record_remove(record, 0, DocumentRef::temporary(temp)).expect("remove temp");

        prop_assert_eq!(outcome, RemoveOutcome::CancelledAdd(DocumentRef::temporary(temp)));
        prop_assert_eq!(ledger.pending_count(), before);
        prop_assert!(!ledger.is_pending_upload(&DocumentRef::temporary(temp)));
    }
}

#[tokio::test]
async fn cancelled_temporary_add_never_reaches_the_gateway() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    let temp = temps.create(pdf("scan.pdf", 128), 1).expect("temp").id;
    ledger.record_add(1, DocumentRef::temporary(temp)).expect("add");
    ledger.record_remove(1, 0, DocumentRef::temporary(temp)).expect("remove");
    temps.release(temp);
    assert_eq!(ledger.pending_count(), 0);

    let report = ledger.commit(&gateway, &mut temps, &owner(), &none_referenced()).await.expect("commit");
    assert!(report.uploaded.is_empty());
    assert!(gateway.calls().is_empty());
    assert!(temps.is_empty());
}

#[test]
fn re_adding_a_removed_file_cancels_the_removal() {
    let mut ledger = Ledger::new();
    ledger
        .record_remove(1, 1, DocumentRef::Remote(fr("doc-b")))
        .expect("remove");
    assert!(ledger.is_pending_deletion(&fr("doc-b")));

    let outcome = ledger.record_add(1, DocumentRef::Remote(fr("doc-b"))).expect("add");
    assert_eq!(outcome, AddOutcome::CancelledRemoval { document_index: 1 });
    assert_eq!(ledger.pending_count(), 0);
    assert!(!ledger.is_pending_deletion(&fr("doc-b")));
}

#[test]
fn removing_an_unknown_temporary_is_rejected() {
    let mut temps = TempFileStore::new(EditorConfig::default());
    let temp = temps.create(pdf("stray.pdf", 16), 1).expect("temp").id;
    let mut ledger = Ledger::new();

    let err = ledger
        .record_remove(1, 0, DocumentRef::temporary(temp))
        .expect_err("no pending add");
    assert_eq!(err, LedgerError::UnknownTemporary(temp));
}

#[test]
fn record_deletion_folds_document_entries_and_undo_restores_them() {
    let mut temps = TempFileStore::new(EditorConfig::default());
    let temp = temps.create(pdf("new.pdf", 16), 7).expect("temp").id;
    let mut ledger = Ledger::new();
    ledger
        .record_remove(7, 0, DocumentRef::Remote(fr("doc-a")))
        .expect("remove");
    ledger.record_add(7, DocumentRef::temporary(temp)).expect("add");
    ledger.record_add(8, DocumentRef::Remote(fr("other"))).expect("add other");

    let documents = vec![DocumentRef::Remote(fr("doc-b")), DocumentRef::temporary(temp)];
    let files = ledger.record_delete_entire_record(7, &documents).expect("delete record");

    // doc-b from the record, doc-a from the folded removal, the folded temporary add
    assert_eq!(files, 3);
    assert_eq!(ledger.pending_count(), 2);
    assert!(ledger.is_record_marked_for_deletion(7));
    assert!(ledger.is_pending_deletion(&fr("doc-a")));
    assert!(ledger.is_pending_deletion(&fr("doc-b")));
    assert_eq!(
        ledger.record_add(7, DocumentRef::Remote(fr("late"))),
        Err(LedgerError::RecordPendingDeletion(7))
    );

    ledger.undo_record_deletion(7).expect("undo");
    assert!(!ledger.is_record_marked_for_deletion(7));
    assert_eq!(ledger.pending_count(), 3);
    assert!(ledger.is_pending_deletion(&fr("doc-a")));
    assert!(!ledger.is_pending_deletion(&fr("doc-b")));
    assert!(ledger.is_pending_upload(&DocumentRef::temporary(temp)));

    assert_eq!(ledger.undo_record_deletion(7), Err(LedgerError::NotMarkedForDeletion(7)));
}

#[tokio::test]
async fn commit_uploads_before_one_batch_delete() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    let temp = temps.create(pdf("lab.pdf", 2048), 1).expect("temp").id;
    ledger.record_add(1, DocumentRef::temporary(temp)).expect("add");
    ledger
        .record_remove(1, 0, DocumentRef::Remote(fr("doc-a")))
        .expect("remove a");
    ledger
        .record_remove(1, 1, DocumentRef::Remote(fr("doc-b")))
        .expect("remove b");

    let report = ledger.commit(&gateway, &mut temps, &owner(), &none_referenced()).await.expect("commit");

    assert_eq!(
        gateway.calls(),
        vec![
            GatewayCall::Upload("lab.pdf".to_string()),
            GatewayCall::BatchDelete(vec![fr("doc-a"), fr("doc-b")]),
        ]
    );
    assert_eq!(report.uploaded.len(), 1);
    assert_eq!(report.durable, vec![report.uploaded[0].1.clone()]);
    assert_eq!(report.deleted.len(), 2);
    assert!(report.orphaned.is_empty());
    assert!(ledger.is_empty());
    assert!(temps.is_empty());

    let events = ledger.drain_pending_events();
    assert!(matches!(events.last().map(|e| &e.event), Some(LedgerEvent::Committed { .. })));
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn failed_upload_aborts_before_any_delete() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    gateway.fail_upload("bad.pdf");
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    let good = temps.create(pdf("good.pdf", 64), 1).expect("temp").id;
    let bad = temps.create(pdf("bad.pdf", 64), 1).expect("temp").id;
    ledger.record_add(1, DocumentRef::temporary(good)).expect("add good");
    ledger.record_add(1, DocumentRef::temporary(bad)).expect("add bad");
    ledger
        .record_remove(1, 0, DocumentRef::Remote(fr("doc-a")))
        .expect("remove");

    let err = ledger.commit(&gateway, &mut temps, &owner(), &none_referenced()).await.expect_err("partial");
    let CommitError::PartialUploadFailure { uploaded, failed } = err;
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].0, good);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].temp_id, bad);
    assert!(gateway.deleted().is_empty());

    // the uploaded file is now a durable add; retry uploads only the failed one
    assert!(ledger.is_pending_upload(&DocumentRef::Remote(uploaded[0].1.clone())));
    assert!(temps.get(good).is_none());
    assert!(temps.get(bad).is_some());

    gateway.heal();
    let report = ledger.commit(&gateway, &mut temps, &owner(), &none_referenced()).await.expect("retry");
    assert_eq!(report.uploaded.len(), 1);
    assert_eq!(report.uploaded[0].0, bad);
    assert_eq!(gateway.uploads(), vec!["good.pdf", "bad.pdf", "bad.pdf"]);
    assert_eq!(gateway.deleted(), vec![fr("doc-a")]);
}

#[tokio::test]
async fn delete_failures_are_reported_not_fatal() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    gateway.fail_delete(&fr("doc-3"));
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    for doc in 1..=5 {
        ledger
            .record_remove(1, doc, DocumentRef::Remote(fr(&format!("doc-{doc}"))))
            .expect("remove");
    }

    let report = ledger.commit(&gateway, &mut temps, &owner(), &none_referenced()).await.expect("commit");
    assert_eq!(report.deleted.len(), 4);
    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(report.orphaned[0].file_ref, fr("doc-3"));
    assert_eq!(ledger.pending_count(), 0);
}

#[tokio::test]
async fn rollback_undoes_uploads_and_ignores_removals() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    let temp = temps.create(pdf("held.pdf", 64), 1).expect("temp").id;
    ledger.record_add(1, DocumentRef::temporary(temp)).expect("add temp");
    ledger.record_add(1, DocumentRef::Remote(fr("eager-1"))).expect("add eager");
    ledger.record_add(1, DocumentRef::Remote(fr("eager-2"))).expect("add eager");
    ledger
        .record_remove(1, 2, DocumentRef::Remote(fr("eager-2")))
        .expect("cancel eager");
    ledger
        .record_remove(1, 0, DocumentRef::Remote(fr("doc-a")))
        .expect("remove");
    assert_eq!(ledger.cleanup_count(), 1);

    let report = ledger.rollback(&gateway, &mut temps, &none_referenced()).await;

    assert_eq!(report.released, vec![temp]);
    assert_eq!(
        report.undone.into_iter().collect::<Vec<_>>(),
        vec![fr("eager-1"), fr("eager-2")]
    );
    assert!(!gateway.deleted().contains(&fr("doc-a")));
    assert!(ledger.is_empty());
    assert!(temps.is_empty());
}

#[test]
fn re_adding_an_abandoned_upload_keeps_it() {
    let mut ledger = Ledger::new();
    ledger.record_add(1, DocumentRef::Remote(fr("eager"))).expect("add");
    ledger
        .record_remove(1, 0, DocumentRef::Remote(fr("eager")))
        .expect("cancel");
    assert_eq!(ledger.cleanup_count(), 1);

    ledger.record_add(1, DocumentRef::Remote(fr("eager"))).expect("re-add");
    assert_eq!(ledger.cleanup_count(), 0);
    assert_eq!(ledger.pending_count(), 1);
}

#[tokio::test]
async fn reattached_durable_file_is_never_undone() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    let outcome = ledger.record_reattach(2, fr("doc-a")).expect("reattach");
    assert_eq!(outcome, AddOutcome::Recorded);
    assert_eq!(ledger.record_reattach(2, fr("doc-a")), Ok(AddOutcome::AlreadyPending));
    assert!(ledger.pending_uploads().is_empty());

    let report = ledger.rollback(&gateway, &mut temps, &none_referenced()).await;
    assert!(report.undone.is_empty());
    assert!(gateway.calls().is_empty());
    assert!(ledger.is_empty());
}

#[test]
fn removing_a_reattached_file_drops_the_link_only() {
    let mut ledger = Ledger::new();
    ledger.record_reattach(2, fr("doc-a")).expect("reattach");

    let outcome = ledger
        .record_remove(2, 0, DocumentRef::Remote(fr("doc-a")))
        .expect("remove");
    assert_eq!(outcome, RemoveOutcome::CancelledAdd(DocumentRef::Remote(fr("doc-a"))));
    assert_eq!(ledger.pending_count(), 0);
    assert_eq!(ledger.cleanup_count(), 0);
}

#[tokio::test]
async fn moved_file_is_kept_while_another_record_references_it() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    ledger
        .record_remove(1, 0, DocumentRef::Remote(fr("doc-a")))
        .expect("remove from first record");
    ledger.record_reattach(2, fr("doc-a")).expect("reattach to second record");
    let referenced: HashSet<FileRef> = [fr("doc-a"), fr("doc-b")].into_iter().collect();

    let report = ledger
        .commit(&gateway, &mut temps, &owner(), &referenced)
        .await
        .expect("commit");
    assert_eq!(report.durable, vec![fr("doc-a")]);
    assert!(report.deleted.is_empty());
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn removing_one_of_two_copies_keeps_the_file() {
    common::init_tracing();
    let gateway = FakeGateway::new();
    let mut temps = TempFileStore::new(EditorConfig::default());
    let mut ledger = Ledger::new();

    ledger
        .record_remove(1, 1, DocumentRef::Remote(fr("doc-a")))
        .expect("remove second copy");
    ledger
        .record_remove(1, 2, DocumentRef::Remote(fr("doc-c")))
        .expect("remove other");
    let referenced: HashSet<FileRef> = [fr("doc-a")].into_iter().collect();

    let report = ledger
        .commit(&gateway, &mut temps, &owner(), &referenced)
        .await
        .expect("commit");
    assert_eq!(gateway.deleted(), vec![fr("doc-c")]);
    assert_eq!(report.deleted.into_iter().collect::<Vec<_>>(), vec![fr("doc-c")]);
}

#[test]
fn deleting_a_record_skips_its_reattached_links() {
    let mut ledger = Ledger::new();
    ledger.record_reattach(2, fr("doc-a")).expect("reattach");

    let documents = vec![DocumentRef::Remote(fr("doc-x")), DocumentRef::Remote(fr("doc-a"))];
    let files = ledger.record_delete_entire_record(2, &documents).expect("delete record");

    assert_eq!(files, 1);
    assert!(ledger.is_pending_deletion(&fr("doc-x")));
    assert!(!ledger.is_pending_deletion(&fr("doc-a")));
}

#[derive(Debug, Clone)]
enum Edit {
    RemoveDocument { record: usize, doc: usize },
    Reattach { record: usize, doc: u8 },
    RemoveRecord { record: usize },
    UndoRecordDeletion { record: usize },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        4 => (0usize..3, 0usize..4).prop_map(|(record, doc)| Edit::RemoveDocument { record, doc }),
        4 => (0usize..3, 0u8..6).prop_map(|(record, doc)| Edit::Reattach { record, doc }),
        1 => (0usize..3).prop_map(|record| Edit::RemoveRecord { record }),
        1 => (0usize..3).prop_map(|record| Edit::UndoRecordDeletion { record }),
    ]
}

/// Three records sharing `doc-0`; the middle one holds `doc-2` twice.
fn patient_with_shared_docs() -> Patient {
    let mut patient = Patient::new(patient_id(), clinic(), "Somchai", "HN-0001");
    patient.history.push(
        HistoryRecord::new(ts(2024, 3, 1), None)
            .with_document(doc_ref(0))
            .with_document(doc_ref(1)),
    );
    patient.history.push(
        HistoryRecord::new(ts(2024, 2, 1), None)
            .with_document(doc_ref(2))
            .with_document(doc_ref(3))
            .with_document(doc_ref(2)),
    );
    patient.history.push(
        HistoryRecord::new(ts(2024, 1, 1), None)
            .with_document(doc_ref(4))
            .with_document(doc_ref(0)),
    );
    patient
}

fn run_edits(session: &mut EditorSession<FakeGateway, FakeStore>, edits: Vec<Edit>) {
    for edit in edits {
        // rejected edits (ended ranges, records marked for deletion) leave state as is
        let _ = match edit {
            Edit::RemoveDocument { record, doc } => {
                let len = session.working().history[record].document_refs.len();
                if len == 0 {
                    continue;
                }
                session.remove_document(record, doc % len).map(|_| ())
            }
            Edit::Reattach { record, doc } => session.reattach_document(record, doc_ref(doc)),
            Edit::RemoveRecord { record } => session.remove_record(record, &AlwaysConfirm).map(|_| ()),
            Edit::UndoRecordDeletion { record } => session.undo_record_deletion(record),
        };
    }
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(fut)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn save_never_deletes_a_file_the_saved_document_references(
        edits in prop::collection::vec(edit_strategy(), 1..30),
    ) {
        let gateway = FakeGateway::new();
        let store = FakeStore::with_patient(patient_with_shared_docs());
        let (deleted, saved) = block_on(async {
            let mut session = EditorSession::from_patient(
                gateway.clone(),
                store.clone(),
                patient_with_shared_docs(),
                EditorConfig::default(),
            );
            run_edits(&mut session, edits);
            session.save().await.expect("save");
            (gateway.deleted(), store.stored().expect("stored patient"))
        });

        let live: HashSet<FileRef> = saved.durable_refs().cloned().collect();
        for file_ref in &deleted {
            prop_assert!(!live.contains(file_ref), "deleted {} but the saved document references it", file_ref);
        }
    }

    #[test]
    fn discard_never_deletes_a_loaded_file(
        edits in prop::collection::vec(edit_strategy(), 1..30),
    ) {
        let gateway = FakeGateway::new();
        let store = FakeStore::with_patient(patient_with_shared_docs());
        let deleted = block_on(async {
            let mut session = EditorSession::from_patient(
                gateway.clone(),
                store,
                patient_with_shared_docs(),
                EditorConfig::default(),
            );
            run_edits(&mut session, edits);
            session.discard(&AlwaysConfirm).await.expect("discard");
            gateway.deleted()
        });

        prop_assert!(deleted.is_empty());
    }
}
