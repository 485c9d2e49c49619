use lodestore::DbError;
use lodestore::codec::LogOp;
use lodestore::storage::{FileStorage, PageManager};
use lodestore::txn::manager::TxConfig;
use lodestore::txn::{
    Coordinator, IsolationLevel, Participant, ParticipantStatus, TransactionManager, TxState,
};
use lodestore::wal::Wal;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn manager(dir: &Path) -> (Arc<TransactionManager>, Arc<Wal>) {
    let storage = Arc::new(FileStorage::open(&dir.join("data.lode")).unwrap());
    let pages = Arc::new(PageManager::new(storage, 64).unwrap());
    let wal = Arc::new(Wal::open(&dir.join("wal.lode")).unwrap());
    (TransactionManager::new(Arc::clone(&wal), pages, TxConfig::default()), wal)
}

#[test]
fn commit_publishes_and_persists() {
    let dir = tempdir().unwrap();
    let (txns, wal) = manager(dir.path());

    let tx = txns.begin(None);
    assert_eq!(tx.isolation(), IsolationLevel::Serializable);
    tx.write("users/1", b"ada".to_vec()).unwrap();
    tx.write("users/2", b"grace".to_vec()).unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.state(), TxState::Committed);

    assert_eq!(txns.versions().latest("users/1"), Some(b"ada".to_vec()));
    assert_eq!(txns.versions().latest("users/2"), Some(b"grace".to_vec()));
    assert!(txns.resource_page("users/1").is_some());

    // Two data records and one commit record, commit last.
    let entries = wal.read_entries(0).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.last().unwrap().op, LogOp::Commit);
    assert!(entries[..2].iter().all(|r| r.op == LogOp::Insert));
    txns.shutdown();
}

#[test]
fn read_your_writes_at_every_isolation_level() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());
    for isolation in [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ] {
        let tx = txns.begin(Some(isolation));
        tx.write("kv/x", b"mine".to_vec()).unwrap();
        assert_eq!(tx.read("kv/x").unwrap(), Some(b"mine".to_vec()));
        tx.rollback().unwrap();
        // The buffered write never escaped.
        assert_eq!(txns.versions().latest("kv/x"), None);
    }
    txns.shutdown();
}

#[test]
fn rollback_discards_the_write_buffer() {
    let dir = tempdir().unwrap();
    let (txns, wal) = manager(dir.path());

    let seed = txns.begin(None);
    seed.write("kv/a", b"1".to_vec()).unwrap();
    seed.commit().unwrap();

    let tx = txns.begin(None);
    tx.write("kv/a", b"2".to_vec()).unwrap();
    tx.rollback().unwrap();
    assert_eq!(tx.state(), TxState::Aborted);
    assert_eq!(txns.versions().latest("kv/a"), Some(b"1".to_vec()));

    // Rolled-back transactions write no data records, only the Rollback.
    let rollback_records: Vec<_> = wal
        .read_entries(0)
        .unwrap()
        .into_iter()
        .filter(|r| r.op == LogOp::Rollback)
        .collect();
    assert_eq!(rollback_records.len(), 1);
    txns.shutdown();
}

#[test]
fn terminal_transactions_fail_fast() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());

    let tx = txns.begin(None);
    tx.write("kv/t", b"v".to_vec()).unwrap();
    tx.commit().unwrap();
    assert!(matches!(tx.read("kv/t"), Err(DbError::InvalidState(_))));
    assert!(matches!(tx.write("kv/t", Vec::new()), Err(DbError::InvalidState(_))));
    assert!(matches!(tx.commit(), Err(DbError::InvalidState(_))));
    assert!(matches!(tx.rollback(), Err(DbError::InvalidState(_))));
    txns.shutdown();
}

#[test]
fn delete_needs_an_existing_value() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());

    let tx = txns.begin(None);
    assert!(matches!(tx.delete("kv/none"), Err(DbError::NotFound(_))));
    tx.write("kv/d", b"v".to_vec()).unwrap();
    tx.delete("kv/d").unwrap();
    tx.commit().unwrap();
    assert_eq!(txns.versions().latest("kv/d"), None);
    txns.shutdown();
}

#[test]
fn delete_leaves_a_tombstone_and_frees_the_page() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());

    let tx = txns.begin(None);
    tx.write("kv/gone", b"v".to_vec()).unwrap();
    tx.commit().unwrap();
    let page_id = txns.resource_page("kv/gone").unwrap();

    let tx = txns.begin(None);
    tx.delete("kv/gone").unwrap();
    tx.commit().unwrap();

    assert_eq!(txns.versions().latest("kv/gone"), None);
    assert!(txns.resource_page("kv/gone").is_none());
    // The version chain keeps the history: value then tombstone.
    assert_eq!(txns.versions().chain_len("kv/gone"), 2);
    let _ = page_id;
    txns.shutdown();
}

#[test]
fn write_write_conflict_blocks_until_commit() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());

    let t1 = txns.begin(None);
    t1.write("kv/c", b"first".to_vec()).unwrap();

    let txns2 = Arc::clone(&txns);
    let writer = std::thread::spawn(move || {
        let t2 = txns2.begin(None);
        t2.write("kv/c", b"second".to_vec()).unwrap();
        t2.commit().unwrap();
    });
    std::thread::sleep(std::time::Duration::from_millis(100));
    t1.commit().unwrap();
    writer.join().unwrap();
    // FIFO: t2 applied after t1.
    assert_eq!(txns.versions().latest("kv/c"), Some(b"second".to_vec()));
    txns.shutdown();
}

#[test]
fn two_phase_commit_commits_on_unanimous_yes() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());

    let t1 = txns.begin(None);
    t1.write("2pc/a", b"1".to_vec()).unwrap();
    let t2 = txns.begin(None);
    t2.write("2pc/b", b"2".to_vec()).unwrap();

    let p1: Arc<dyn Participant> = t1.clone();
    let p2: Arc<dyn Participant> = t2.clone();
    Coordinator::default().run(&[p1, p2]).unwrap();

    assert_eq!(t1.status(), ParticipantStatus::Committed);
    assert_eq!(t2.status(), ParticipantStatus::Committed);
    assert_eq!(txns.versions().latest("2pc/a"), Some(b"1".to_vec()));
    assert_eq!(txns.versions().latest("2pc/b"), Some(b"2".to_vec()));
    txns.shutdown();
}

#[test]
fn two_phase_commit_aborts_everyone_on_a_no_vote() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());

    let t1 = txns.begin(None);
    t1.write("2pc/x", b"1".to_vec()).unwrap();
    let t2 = txns.begin(None);
    t2.write("2pc/y", b"2".to_vec()).unwrap();
    // t2 already rolled back, so its prepare votes no.
    t2.rollback().unwrap();

    let p1: Arc<dyn Participant> = t1.clone();
    let p2: Arc<dyn Participant> = t2.clone();
    assert!(matches!(
        Coordinator::default().run(&[p1, p2]),
        Err(DbError::Conflict(_))
    ));
    assert_eq!(t1.status(), ParticipantStatus::Aborted);
    assert_eq!(txns.versions().latest("2pc/x"), None);
    assert_eq!(txns.versions().latest("2pc/y"), None);
    txns.shutdown();
}

#[test]
fn prepared_state_machine_path() {
    let dir = tempdir().unwrap();
    let (txns, _wal) = manager(dir.path());

    let tx = txns.begin(None);
    tx.write("2pc/solo", b"v".to_vec()).unwrap();
    tx.prepare().unwrap();
    assert_eq!(tx.state(), TxState::Prepared);
    // Preparing twice is invalid.
    assert!(matches!(tx.prepare(), Err(DbError::InvalidState(_))));
    tx.commit().unwrap();
    assert_eq!(tx.state(), TxState::Committed);
    txns.shutdown();
}
