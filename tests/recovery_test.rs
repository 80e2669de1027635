use anyhow::Result;
use lowkeydb::failpoint;
use lowkeydb::storage::wal::wal_path;
use lowkeydb::{Database, DatabaseConfig, IsolationLevel, LowkeyError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

fn test_config() -> DatabaseConfig {
    let mut config = DatabaseConfig {
        buffer_pool_capacity: 8,
        bucket_count: 4,
        ..Default::default()
    };
    config.wal.sync_on_commit = false;
    config
}

/// Abandons the handle without closing it: no final checkpoint, dirty
/// pages never written.
fn crash(db: Database) {
    std::mem::forget(db);
}

fn reopen(path: &Path) -> Result<Database> {
    Ok(Database::open_with_config(path, test_config())?)
}

#[test]
fn test_committed_writes_survive_crash() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");

    let db = Database::create_with_config(&db_path, test_config())?;
    for i in 0..100 {
        db.put(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes())?;
    }
    db.delete(b"k7")?;

    let tx = db.begin(IsolationLevel::Serializable)?;
    db.tx_put(tx, b"tx-key", b"tx-value")?;
    db.tx_delete(tx, b"k8")?;
    db.commit(tx)?;
    crash(db);

    let db = reopen(&db_path)?;
    let recovery = db.recovery_stats().clone();
    assert_eq!(recovery.transactions_replayed, 102);
    assert_eq!(recovery.transactions_discarded, 0);

    assert_eq!(db.key_count()?, 99);
    assert_eq!(db.get(b"k42")?, b"v42".to_vec());
    assert_eq!(db.get(b"tx-key")?, b"tx-value".to_vec());
    assert!(matches!(db.get(b"k7"), Err(LowkeyError::KeyNotFound)));
    assert!(matches!(db.get(b"k8"), Err(LowkeyError::KeyNotFound)));

    // Recovery checkpointed, so a second crash has nothing to replay
    crash(db);
    let db = reopen(&db_path)?;
    assert_eq!(db.recovery_stats().records_scanned, 0);
    assert_eq!(db.key_count()?, 99);
    Ok(())
}

#[test]
fn test_uncommitted_writes_never_appear() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");

    let db = Database::create_with_config(&db_path, test_config())?;
    db.put(b"stable", b"1")?;

    let open_tx = db.begin(IsolationLevel::ReadCommitted)?;
    db.tx_put(open_tx, b"ghost", b"boo")?;
    db.tx_delete(open_tx, b"stable")?;

    let rolled_back = db.begin(IsolationLevel::RepeatableRead)?;
    db.tx_put(rolled_back, b"undone", b"x")?;
    db.rollback(rolled_back)?;
    crash(db);

    let db = reopen(&db_path)?;
    assert_eq!(db.get(b"stable")?, b"1".to_vec());
    assert!(matches!(db.get(b"ghost"), Err(LowkeyError::KeyNotFound)));
    assert!(matches!(db.get(b"undone"), Err(LowkeyError::KeyNotFound)));
    assert_eq!(db.key_count()?, 1);
    Ok(())
}

#[test]
fn test_transaction_ids_are_not_reused() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");

    let db = Database::create_with_config(&db_path, test_config())?;
    let mut last = db.begin(IsolationLevel::ReadCommitted)?;
    for _ in 0..5 {
        db.put(b"k", b"v")?;
    }
    crash(db);

    let db = reopen(&db_path)?;
    let next = db.begin(IsolationLevel::ReadCommitted)?;
    assert!(next > last);
    last = next;
    db.close();

    let db = reopen(&db_path)?;
    assert!(db.begin(IsolationLevel::ReadCommitted)? > last);
    Ok(())
}

#[test]
fn test_torn_wal_tail_is_discarded() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");

    let db = Database::create_with_config(&db_path, test_config())?;
    db.put(b"a", b"1")?;
    db.put(b"b", b"2")?;
    crash(db);

    // Half-written frame after the last commit
    let mut wal = OpenOptions::new().append(true).open(wal_path(&db_path))?;
    wal.write_all(&[0x40, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef, 1, 2, 3])?;
    drop(wal);

    let db = reopen(&db_path)?;
    assert_eq!(db.get(b"a")?, b"1".to_vec());
    assert_eq!(db.get(b"b")?, b"2".to_vec());
    db.put(b"c", b"3")?;
    crash(db);

    let db = reopen(&db_path)?;
    assert_eq!(db.key_count()?, 3);
    Ok(())
}

#[test]
fn test_failed_checkpoint_keeps_state() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");

    let db = Database::create_with_config(&db_path, test_config())?;
    db.put(b"before", b"1")?;
    db.checkpoint()?;
    db.put(b"after", b"2")?;
    let stats = db.checkpoint_stats()?;

    failpoint::enable(failpoint::PAGE_WRITE);
    let result = db.checkpoint();
    failpoint::clear();
    assert_eq!(
        result.err().map(|e| e.code()),
        Some(lowkeydb::ErrorCode::Io)
    );
    assert_eq!(db.checkpoint_stats()?, stats);
    assert_eq!(db.get(b"after")?, b"2".to_vec());

    failpoint::enable(failpoint::WAL_ROTATE);
    let result = db.checkpoint();
    failpoint::clear();
    assert!(result.is_err());
    assert_eq!(db.checkpoint_stats()?.checkpoints_performed, 1);

    db.put(b"later", b"3")?;
    crash(db);

    let db = reopen(&db_path)?;
    assert_eq!(db.key_count()?, 3);
    assert_eq!(db.get(b"before")?, b"1".to_vec());
    assert_eq!(db.get(b"after")?, b"2".to_vec());
    assert_eq!(db.get(b"later")?, b"3".to_vec());
    Ok(())
}

#[test]
fn test_random_operations_match_model() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");
    let mut rng = StdRng::seed_from_u64(0x10_ec_db);
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

    let mut db = Database::create_with_config(&db_path, test_config())?;
    for step in 0..3000 {
        let key = format!("key{}", rng.gen_range(0..150)).into_bytes();
        match rng.gen_range(0..100) {
            0..=49 => {
                let len = rng.gen_range(0..600);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                db.put(&key, &value)?;
                model.insert(key, value);
            }
            50..=74 => match (db.delete(&key), model.remove(&key)) {
                (Ok(()), Some(_)) => {}
                (Err(LowkeyError::KeyNotFound), None) => {}
                (result, expected) => panic!(
                    "step {}: delete returned {:?}, model had {:?}",
                    step,
                    result,
                    expected.is_some()
                ),
            },
            75..=94 => match db.get(&key) {
                Ok(value) => assert_eq!(Some(&value), model.get(&key), "step {}", step),
                Err(LowkeyError::KeyNotFound) => assert!(!model.contains_key(&key)),
                Err(e) => return Err(e.into()),
            },
            95..=96 => db.checkpoint()?,
            97 => {
                db.close();
                db = reopen(&db_path)?;
            }
            _ => {
                crash(db);
                db = reopen(&db_path)?;
            }
        }
    }

    assert_eq!(db.key_count()?, model.len() as u64);
    for (key, value) in &model {
        assert_eq!(&db.get(key)?, value);
    }
    Ok(())
}
