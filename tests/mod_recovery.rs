use lodestore::codec::LogOp;
use lodestore::recovery::RecoveryManager;
use lodestore::storage::{FileStorage, PageManager};
use lodestore::wal::Wal;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn stack(dir: &Path) -> (Arc<Wal>, Arc<PageManager>, RecoveryManager) {
    let storage = Arc::new(FileStorage::open(&dir.join("data.lode")).unwrap());
    let pages = Arc::new(PageManager::new(storage, 64).unwrap());
    let wal = Arc::new(Wal::open(&dir.join("wal.lode")).unwrap());
    let recovery = RecoveryManager::new(Arc::clone(&wal), Arc::clone(&pages));
    (wal, pages, recovery)
}

#[test]
fn committed_transaction_survives_crash_before_page_apply() {
    let dir = tempdir().unwrap();
    let (wal, pages, recovery) = stack(dir.path());

    // The transaction logged its write and its commit, then the process
    // died before any lazy page apply.
    wal.append_op(LogOp::Insert, "tx-1", 0, Vec::new(), b"a=1".to_vec()).unwrap();
    wal.append_op(LogOp::Commit, "tx-1", -1, Vec::new(), Vec::new()).unwrap();

    assert!(!recovery.is_recovery_needed().unwrap());
    let report = recovery.recover().unwrap();
    assert_eq!(report.redone_records, 1);
    assert_eq!(pages.get_page(0).unwrap().data(), b"a=1");
}

#[test]
fn uncommitted_transaction_is_undone() {
    let dir = tempdir().unwrap();
    let (wal, pages, recovery) = stack(dir.path());

    // Committed baseline on page 0, then an uncommitted overwrite.
    wal.append_op(LogOp::Insert, "tx-1", 0, Vec::new(), b"b=1".to_vec()).unwrap();
    wal.append_op(LogOp::Commit, "tx-1", -1, Vec::new(), Vec::new()).unwrap();
    wal.append_op(LogOp::Update, "tx-2", 0, b"b=1".to_vec(), b"b=2".to_vec()).unwrap();

    assert!(recovery.is_recovery_needed().unwrap());
    assert_eq!(recovery.uncommitted_transactions().unwrap(), vec!["tx-2".to_string()]);

    let report = recovery.recover().unwrap();
    assert_eq!(report.undone_transactions, vec!["tx-2".to_string()]);
    // The uncommitted update is gone; the committed value is back.
    assert_eq!(pages.get_page(0).unwrap().data(), b"b=1");
    assert!(!recovery.is_recovery_needed().unwrap());
}

#[test]
fn insert_undo_frees_the_allocated_page() {
    let dir = tempdir().unwrap();
    let (wal, pages, recovery) = stack(dir.path());

    // Insert with an empty before-image: the page was allocated by the
    // transaction itself.
    wal.append_op(LogOp::Insert, "tx-1", 0, Vec::new(), b"c=1".to_vec()).unwrap();

    recovery.recover().unwrap();
    assert!(!pages.page_exists(0).unwrap());
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    let (wal, pages, recovery) = stack(dir.path());

    wal.append_op(LogOp::Insert, "tx-1", 0, Vec::new(), b"x=1".to_vec()).unwrap();
    wal.append_op(LogOp::Update, "tx-1", 1, Vec::new(), b"y=2".to_vec()).unwrap();
    wal.append_op(LogOp::Commit, "tx-1", -1, Vec::new(), Vec::new()).unwrap();
    wal.append_op(LogOp::Insert, "tx-2", 2, Vec::new(), b"z=3".to_vec()).unwrap();

    recovery.recover().unwrap();
    let first_pass: Vec<Vec<u8>> = (0..2)
        .map(|id| pages.get_page(id).unwrap().data().to_vec())
        .collect();
    let freed_after_first = pages.page_exists(2).unwrap();

    recovery.recover().unwrap();
    let second_pass: Vec<Vec<u8>> = (0..2)
        .map(|id| pages.get_page(id).unwrap().data().to_vec())
        .collect();
    assert_eq!(first_pass, second_pass);
    assert_eq!(pages.page_exists(2).unwrap(), freed_after_first);
    assert!(!recovery.is_recovery_needed().unwrap());
}

#[test]
fn rollback_after_checkpoint_stays_rolled_back() {
    let dir = tempdir().unwrap();
    let (wal, pages, recovery) = stack(dir.path());

    wal.append_op(LogOp::Insert, "tx-1", 0, Vec::new(), b"v1".to_vec()).unwrap();
    wal.append_op(LogOp::Commit, "tx-1", -1, Vec::new(), Vec::new()).unwrap();
    wal.checkpoint(wal.last_lsn()).unwrap();
    wal.append_op(LogOp::Update, "tx-2", 0, b"v1".to_vec(), b"v2".to_vec()).unwrap();
    wal.append_op(LogOp::Rollback, "tx-2", -1, Vec::new(), Vec::new()).unwrap();

    // tx-2 rolled back before the crash; analysis must not undo it again,
    // and redo must not replay it.
    assert!(!recovery.is_recovery_needed().unwrap());
    recovery.recover().unwrap();
    let page = pages.get_page(0);
    // Page 0 was never applied (checkpoint happened before any apply), so
    // redo starting at the checkpoint may leave it untouched; what matters
    // is that v2 never appears.
    if let Ok(page) = page {
        assert_ne!(page.data(), b"v2");
    }
}

#[test]
fn single_transaction_redo_and_rollback() {
    let dir = tempdir().unwrap();
    let (wal, pages, recovery) = stack(dir.path());

    wal.append_op(LogOp::Insert, "tx-1", 0, Vec::new(), b"one".to_vec()).unwrap();
    wal.append_op(LogOp::Commit, "tx-1", -1, Vec::new(), Vec::new()).unwrap();
    wal.append_op(LogOp::Insert, "tx-2", 1, Vec::new(), b"two".to_vec()).unwrap();

    recovery.redo_transaction("tx-1").unwrap();
    assert_eq!(pages.get_page(0).unwrap().data(), b"one");

    recovery.rollback_transaction("tx-2").unwrap();
    assert!(!pages.page_exists(1).unwrap());
    assert!(recovery.redo_transaction("missing").is_err());
}
