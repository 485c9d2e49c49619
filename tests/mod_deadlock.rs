use lodestore::DbError;
use lodestore::storage::{FileStorage, PageManager};
use lodestore::txn::manager::TxConfig;
use lodestore::txn::{IsolationLevel, Transaction, TransactionManager};
use lodestore::wal::Wal;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn manager(dir: &std::path::Path) -> Arc<TransactionManager> {
    let storage = Arc::new(FileStorage::open(&dir.join("data.lode")).unwrap());
    let pages = Arc::new(PageManager::new(storage, 64).unwrap());
    let wal = Arc::new(Wal::open(&dir.join("wal.lode")).unwrap());
    let config = TxConfig {
        lock_timeout: Duration::from_secs(5),
        detector_interval: Duration::from_millis(100),
        ..TxConfig::default()
    };
    TransactionManager::new(wal, pages, config)
}

/// Read `path`; a victimized transaction rolls itself back, as the
/// deadlock protocol expects of the loser.
fn read_and_settle(tx: &Arc<Transaction>, path: &str) -> Result<Option<Vec<u8>>, DbError> {
    let result = tx.read(path);
    if matches!(result, Err(DbError::Deadlock(_))) {
        let _ = tx.rollback();
    }
    result
}

#[test]
fn youngest_transaction_is_the_victim() {
    let dir = tempdir().unwrap();
    let txns = manager(dir.path());

    // Seed both resources.
    let seed = txns.begin(None);
    seed.write("kv/x", b"x0".to_vec()).unwrap();
    seed.write("kv/y", b"y0".to_vec()).unwrap();
    seed.commit().unwrap();

    // T1 (older) writes x; T2 (younger) writes y.
    let t1 = txns.begin(Some(IsolationLevel::Serializable));
    let t2 = txns.begin(Some(IsolationLevel::Serializable));
    assert!(t1.start_ts() < t2.start_ts());
    t1.write("kv/x", b"x1".to_vec()).unwrap();
    t2.write("kv/y", b"y2".to_vec()).unwrap();

    // Cross reads close the cycle: T1 → y (held by T2), T2 → x (held by T1).
    let t1_thread = {
        let t1 = Arc::clone(&t1);
        std::thread::spawn(move || read_and_settle(&t1, "kv/y"))
    };
    let t2_thread = {
        let t2 = Arc::clone(&t2);
        std::thread::spawn(move || read_and_settle(&t2, "kv/x"))
    };
    let r1 = t1_thread.join().unwrap();
    let r2 = t2_thread.join().unwrap();

    // Exactly one side aborts, and it is the younger.
    assert!(matches!(r2, Err(DbError::Deadlock(_))), "younger t2 must lose: {r2:?}");
    assert_eq!(r1.unwrap(), Some(b"y0".to_vec()), "older t1 reads after the victim unblocks");
    assert!(t2.is_deadlock_victim());
    assert!(!t1.is_deadlock_victim());
    assert_eq!(txns.deadlock_victims(), vec![t2.id().to_string()]);

    // The survivor commits its write.
    t1.commit().unwrap();
    assert_eq!(txns.versions().latest("kv/x"), Some(b"x1".to_vec()));
    assert_eq!(txns.versions().latest("kv/y"), Some(b"y0".to_vec()));

    // No cycle outlives the scan.
    assert!(txns.wait_for_graph().find_cycle().is_none());
    txns.shutdown();
}

#[test]
fn aborted_victim_fails_fast_on_further_operations() {
    let dir = tempdir().unwrap();
    let txns = manager(dir.path());

    let seed = txns.begin(None);
    seed.write("kv/a", b"a".to_vec()).unwrap();
    seed.write("kv/b", b"b".to_vec()).unwrap();
    seed.commit().unwrap();

    let t1 = txns.begin(None);
    let t2 = txns.begin(None);
    t1.write("kv/a", b"a1".to_vec()).unwrap();
    t2.write("kv/b", b"b2".to_vec()).unwrap();

    let h1 = {
        let t1 = Arc::clone(&t1);
        std::thread::spawn(move || read_and_settle(&t1, "kv/b"))
    };
    let h2 = {
        let t2 = Arc::clone(&t2);
        std::thread::spawn(move || read_and_settle(&t2, "kv/a"))
    };
    let r1 = h1.join().unwrap();
    let r2 = h2.join().unwrap();
    assert_eq!(
        [r1.is_err(), r2.is_err()].iter().filter(|b| **b).count(),
        1,
        "exactly one side is victimized"
    );

    let (victim, survivor) = if t1.is_deadlock_victim() { (&t1, &t2) } else { (&t2, &t1) };
    // Everything after victimization fails fast with Deadlock; the
    // rollback already ran in the victim's own thread.
    assert!(matches!(victim.read("kv/a"), Err(DbError::Deadlock(_))));
    assert!(matches!(victim.write("kv/a", Vec::new()), Err(DbError::Deadlock(_))));
    assert!(matches!(victim.commit(), Err(DbError::Deadlock(_))));
    assert!(matches!(victim.rollback(), Err(DbError::InvalidState(_))));

    survivor.commit().unwrap();
    txns.shutdown();
}
