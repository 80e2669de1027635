use anyhow::Result;
use lowkeydb::storage::buffer::lru::LruReplacer;
use lowkeydb::storage::{BufferPoolManager, PageId, PageManager};
use lowkeydb::{Database, DatabaseConfig, ErrorCode, IsolationLevel, LowkeyError};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn test_config() -> DatabaseConfig {
    let mut config = DatabaseConfig {
        buffer_pool_capacity: 32,
        bucket_count: 16,
        ..Default::default()
    };
    config.wal.sync_on_commit = false;
    config
}

fn create_test_db(path: &Path) -> Result<Database> {
    Ok(Database::create_with_config(path, test_config())?)
}

#[test]
fn test_basic_crud() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;

    db.put(b"alpha", b"1")?;
    db.put(b"beta", b"2")?;
    assert_eq!(db.get(b"alpha")?, b"1".to_vec());
    assert_eq!(db.key_count()?, 2);

    db.put(b"alpha", b"one")?;
    assert_eq!(db.get(b"alpha")?, b"one".to_vec());
    assert_eq!(db.key_count()?, 2);

    db.delete(b"alpha")?;
    assert!(matches!(db.get(b"alpha"), Err(LowkeyError::KeyNotFound)));
    assert!(matches!(db.delete(b"alpha"), Err(LowkeyError::KeyNotFound)));
    assert_eq!(db.key_count()?, 1);

    let err = db.get(b"alpha").err().map(|e| e.code().code());
    assert_eq!(err, Some(-4));
    assert_eq!(lowkeydb::error_message(-4), "Key not found");
    Ok(())
}

#[test]
fn test_oversized_value_is_invalid_param() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;

    let result = db.put(b"big", &vec![0u8; 9000]);
    assert_eq!(result.err().map(|e| e.code()), Some(ErrorCode::InvalidParam));
    assert_eq!(db.checkpoint_stats()?.wal_size, 0);
    Ok(())
}

#[test]
fn test_reopen_is_durable() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");

    {
        let db = create_test_db(&db_path)?;
        for i in 0..500 {
            db.put(format!("key{:04}", i).as_bytes(), format!("value{}", i).as_bytes())?;
        }
        for i in (0..500).step_by(5) {
            db.delete(format!("key{:04}", i).as_bytes())?;
        }
        db.close();
    }

    let db = Database::open_with_config(&db_path, test_config())?;
    assert_eq!(db.key_count()?, 400);
    for i in 0..500 {
        let key = format!("key{:04}", i);
        let result = db.get(key.as_bytes());
        if i % 5 == 0 {
            assert!(matches!(result, Err(LowkeyError::KeyNotFound)), "{}", key);
        } else {
            assert_eq!(result?, format!("value{}", i).into_bytes());
        }
    }
    Ok(())
}

#[test]
fn test_transaction_overlay_and_rollback() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;
    db.put(b"shared", b"committed")?;

    let tx = db.begin(IsolationLevel::ReadCommitted)?;
    db.tx_put(tx, b"shared", b"pending")?;
    db.tx_put(tx, b"fresh", b"new")?;
    assert_eq!(db.tx_get(tx, b"shared")?, b"pending".to_vec());
    // Other readers only see committed state
    assert_eq!(db.get(b"shared")?, b"committed".to_vec());
    assert!(matches!(db.get(b"fresh"), Err(LowkeyError::KeyNotFound)));

    db.rollback(tx)?;
    assert_eq!(db.get(b"shared")?, b"committed".to_vec());
    assert_eq!(db.key_count()?, 1);

    assert!(matches!(db.commit(tx), Err(LowkeyError::InvalidTransaction(_))));
    assert!(matches!(db.rollback(tx), Err(LowkeyError::InvalidTransaction(_))));
    Ok(())
}

#[test]
fn test_transactional_delete() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;
    db.put(b"doomed", b"x")?;

    let tx = db.begin(IsolationLevel::RepeatableRead)?;
    db.tx_delete(tx, b"doomed")?;
    assert!(matches!(db.tx_get(tx, b"doomed"), Err(LowkeyError::KeyNotFound)));
    assert!(matches!(db.tx_delete(tx, b"doomed"), Err(LowkeyError::KeyNotFound)));
    assert_eq!(db.get(b"doomed")?, b"x".to_vec());

    db.commit(tx)?;
    assert!(matches!(db.get(b"doomed"), Err(LowkeyError::KeyNotFound)));
    assert_eq!(db.key_count()?, 0);
    Ok(())
}

#[test]
fn test_repeatable_read_vs_read_committed() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;
    db.put(b"k", b"v1")?;

    let rr = db.begin(IsolationLevel::RepeatableRead)?;
    let rc = db.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(db.tx_get(rr, b"k")?, b"v1".to_vec());
    assert_eq!(db.tx_get(rc, b"k")?, b"v1".to_vec());

    db.put(b"k", b"v2")?;

    assert_eq!(db.tx_get(rr, b"k")?, b"v1".to_vec());
    assert_eq!(db.tx_get(rc, b"k")?, b"v2".to_vec());

    db.delete(b"k")?;
    assert_eq!(db.tx_get(rr, b"k")?, b"v1".to_vec());
    assert!(matches!(db.tx_get(rc, b"k"), Err(LowkeyError::KeyNotFound)));

    db.commit(rr)?;
    db.commit(rc)?;
    Ok(())
}

#[test]
fn test_serializable_conflict() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;
    db.put(b"balance", b"100")?;

    let t1 = db.begin(IsolationLevel::Serializable)?;
    let t2 = db.begin(IsolationLevel::Serializable)?;
    db.tx_get(t1, b"balance")?;
    db.tx_get(t2, b"balance")?;
    db.tx_put(t1, b"balance", b"90")?;
    db.tx_put(t2, b"balance", b"80")?;

    db.commit(t1)?;
    let err = db.commit(t2).err().map(|e| e.code());
    assert_eq!(err, Some(ErrorCode::TransactionConflict));
    db.rollback(t2)?;

    assert_eq!(db.get(b"balance")?, b"90".to_vec());

    // A retry starting after the winner commits succeeds
    let retry = db.begin(IsolationLevel::Serializable)?;
    db.tx_get(retry, b"balance")?;
    db.tx_put(retry, b"balance", b"80")?;
    db.commit(retry)?;
    assert_eq!(db.get(b"balance")?, b"80".to_vec());
    Ok(())
}

#[test]
fn test_serializable_exactly_one_winner_concurrently() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(create_test_db(&dir.path().join("test.db"))?);
    db.put(b"counter", b"0")?;

    let txs: Vec<_> = (0..8)
        .map(|_| db.begin(IsolationLevel::Serializable))
        .collect::<lowkeydb::Result<_>>()?;
    for &tx in &txs {
        db.tx_get(tx, b"counter")?;
        db.tx_put(tx, b"counter", format!("{}", tx.value()).as_bytes())?;
    }

    let handles: Vec<_> = txs
        .into_iter()
        .map(|tx| {
            let db = Arc::clone(&db);
            thread::spawn(move || db.commit(tx).err().map(|e| e.code()))
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_none()).count(), 1);
    assert!(outcomes
        .iter()
        .flatten()
        .all(|code| *code == ErrorCode::TransactionConflict));
    Ok(())
}

#[test]
fn test_concurrent_writers_on_disjoint_keys() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(create_test_db(&dir.path().join("test.db"))?);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || -> lowkeydb::Result<()> {
                for i in 0..200 {
                    let key = format!("t{}-{}", t, i);
                    db.put(key.as_bytes(), key.as_bytes())?;
                    assert_eq!(db.get(key.as_bytes())?, key.as_bytes());
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }

    assert_eq!(db.key_count()?, 800);
    Ok(())
}

#[test]
fn test_buffer_pool_eviction_scenario() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pages.db");
    let lru = |frames| Box::new(LruReplacer::new(frames));

    {
        let pool =
            BufferPoolManager::new(PageManager::create(&path)?, lru(2), 2, Duration::from_secs(1));
        for _ in 0..3 {
            pool.new_page()?;
        }
        pool.flush_all()?;
        pool.commit_flushed()?;
    }

    let pool =
        BufferPoolManager::new(PageManager::open(&path)?, lru(2), 2, Duration::from_secs(1));
    let (a, b, c) = (PageId(0), PageId(1), PageId(2));

    drop(pool.fetch_page(a)?);
    {
        let mut guard = pool.fetch_page_write(b)?;
        guard[0] = 42;
    }
    let stats = pool.stats();
    assert_eq!((stats.cache_hits, stats.cache_misses, stats.evictions), (0, 2, 0));
    assert_eq!(stats.pages_in_buffer, 2);

    // B was touched last, so A is the victim; A is clean
    drop(pool.fetch_page(c)?);
    let stats = pool.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.write_backs, 0);

    // C is now most recent, B is the victim and it is dirty
    drop(pool.fetch_page(a)?);
    let stats = pool.stats();
    assert_eq!(stats.evictions, 2);
    assert_eq!(stats.write_backs, 1);
    assert_eq!(stats.cache_hits + stats.cache_misses, 4);
    assert_eq!(stats.cache_misses, 4);
    assert_eq!(stats.hit_ratio, 0.0);

    drop(pool.fetch_page(a)?);
    let stats = pool.stats();
    assert_eq!(stats.cache_hits, 1);
    assert!((stats.hit_ratio - 0.2).abs() < f64::EPSILON);

    // The write-back reached disk
    assert_eq!(pool.fetch_page(b)?[0], 42);
    Ok(())
}

#[test]
fn test_database_buffer_stats() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;

    let before = db.buffer_stats()?;
    assert_eq!(before.capacity, 32);
    db.put(b"k", b"v")?;
    db.get(b"k")?;
    db.get(b"k")?;

    let after = db.buffer_stats()?;
    assert!(after.cache_hits > before.cache_hits);
    let total = after.cache_hits + after.cache_misses;
    let expected = after.cache_hits as f64 / total as f64;
    assert!((after.hit_ratio - expected).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_checkpoint_stats() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;

    let initial = db.checkpoint_stats()?;
    assert_eq!(initial.checkpoints_performed, 0);
    assert_eq!(initial.wal_size, 0);

    for i in 0..20 {
        db.put(format!("k{}", i).as_bytes(), b"value")?;
    }
    assert!(db.checkpoint_stats()?.wal_size > 0);

    db.checkpoint()?;
    let stats = db.checkpoint_stats()?;
    assert_eq!(stats.checkpoints_performed, 1);
    assert_eq!(stats.wal_size, 0);
    assert!(stats.pages_written > 0);
    assert!(stats.last_checkpoint_time > 0);

    db.put(b"after", b"x")?;
    let wal_size = db.checkpoint_stats()?.wal_size;
    assert!(wal_size > 0);

    db.checkpoint()?;
    assert_eq!(db.checkpoint_stats()?.checkpoints_performed, 2);
    Ok(())
}

#[test]
fn test_flush_wal_and_archives() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");
    let db = create_test_db(&db_path)?;
    db.configure_checkpointing(0, 0, 2)?;

    for round in 0..4 {
        db.put(format!("round{}", round).as_bytes(), b"x")?;
        db.flush_wal()?;
        db.checkpoint()?;
    }

    let archives = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("test.db-wal."))
        .count();
    assert_eq!(archives, 2);
    Ok(())
}

#[test]
fn test_auto_checkpoint_on_wal_size() -> Result<()> {
    let dir = tempdir()?;
    let db = create_test_db(&dir.path().join("test.db"))?;
    db.configure_checkpointing(0, 1, 2)?;
    db.start_auto_checkpoint()?;

    let value = vec![b'x'; 4096];
    let mut i = 0;
    while db.checkpoint_stats()?.checkpoints_performed == 0 && i < 2000 {
        db.put(format!("key{}", i).as_bytes(), &value)?;
        i += 1;
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while db.checkpoint_stats()?.checkpoints_performed == 0
        && std::time::Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(10));
    }
    db.stop_auto_checkpoint()?;

    assert!(db.checkpoint_stats()?.checkpoints_performed >= 1);
    assert_eq!(db.key_count()?, i as u64);
    Ok(())
}
