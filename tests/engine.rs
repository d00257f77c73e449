//! End-to-end tests against the public `Environment`/`Database`/`Cursor`
//! surface: on-disk round trips, splits, transaction conflicts, cursor
//! coupling across a split, duplicate ordering, and crash recovery.

use pagetree::blob::InsertPosition;
use pagetree::{DataAccessMode, EnvFlags, ErrorCode, Environment};
use pagetree::env::{DatabaseConfig, EnvConfig};
use pagetree::types::OpFlags;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn temp_path(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("pagetree-it-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("db.hdb");
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
fn tiny_record_round_trips_through_reopen() {
    init_logging();
    let path = temp_path("tiny");
    let path_str = path.to_str().unwrap();
    let flags = EnvFlags::empty();

    let mut env = Environment::create(Some(path_str), flags, EnvConfig { page_size: 1024, ..Default::default() }).unwrap();
    let mut db = env
        .create_database(DatabaseConfig { name: 1, key_size: 16, dam: DataAccessMode::empty() }, flags)
        .unwrap();
    {
        let (cache, freelist) = env.cache_and_freelist_mut();
        db.insert(cache, freelist, b"alpha", b"beta", false, None).unwrap();
    }
    env.sync_database(&db).unwrap();
    env.close().unwrap();

    let mut reopened = Environment::open(path_str, flags, EnvConfig { page_size: 1024, ..Default::default() }).unwrap();
    let mut db2 = reopened.open_database(1, flags).unwrap();
    let (cache, freelist) = reopened.cache_and_freelist_mut();
    let value = db2.find(cache, freelist, b"alpha", OpFlags::empty(), None).unwrap();
    assert_eq!(value, b"beta");

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn many_keys_force_splits_and_stay_findable() {
    init_logging();
    let flags = EnvFlags::IN_MEMORY_DB;
    let mut env = Environment::create(None, flags, EnvConfig::default()).unwrap();
    let mut db = env
        .create_database(DatabaseConfig { name: 1, key_size: 8, dam: DataAccessMode::empty() }, flags)
        .unwrap();

    let (cache, freelist) = env.cache_and_freelist_mut();
    for i in 0..200u32 {
        let key = i.to_be_bytes();
        let value = format!("value-{i}");
        db.insert(cache, freelist, &key, value.as_bytes(), false, None).unwrap();
    }

    for i in 0..200u32 {
        let key = i.to_be_bytes();
        let value = db.find(cache, freelist, &key, OpFlags::empty(), None).unwrap();
        assert_eq!(value, format!("value-{i}").as_bytes());
    }

    let report = db.check_integrity(cache, freelist).unwrap();
    assert!(report.is_clean(), "violations: {:?}", report.violations);
}

#[test]
fn second_writer_conflicts_until_first_commits() {
    init_logging();
    let flags = EnvFlags::IN_MEMORY_DB | EnvFlags::ENABLE_TRANSACTIONS;
    let mut env = Environment::create(None, flags, EnvConfig::default()).unwrap();
    let mut db = env
        .create_database(DatabaseConfig { name: 1, key_size: 8, dam: DataAccessMode::empty() }, flags)
        .unwrap();
    let (cache, freelist) = env.cache_and_freelist_mut();

    let t1 = db.begin(false).unwrap();
    let t2 = db.begin(false).unwrap();
    db.insert(cache, freelist, b"k", b"from-t1", false, Some(t1)).unwrap();
    let err = db.insert(cache, freelist, b"k", b"from-t2", false, Some(t2)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TxnConflict);

    db.commit(cache, freelist, t1).unwrap();
    db.insert(cache, freelist, b"k", b"from-t2-overwrite", true, Some(t2)).unwrap();
    db.commit(cache, freelist, t2).unwrap();

    let value = db.find(cache, freelist, b"k", OpFlags::empty(), None).unwrap();
    assert_eq!(value, b"from-t2-overwrite");
}

#[test]
fn cursor_walks_keys_in_order_across_a_split() {
    init_logging();
    let flags = EnvFlags::IN_MEMORY_DB;
    let mut env = Environment::create(None, flags, EnvConfig::default()).unwrap();
    let mut db = env
        .create_database(DatabaseConfig { name: 1, key_size: 4, dam: DataAccessMode::empty() }, flags)
        .unwrap();
    let (cache, freelist) = env.cache_and_freelist_mut();

    let mut keys: Vec<u32> = (0..10).collect();
    for &i in &keys {
        db.insert(cache, freelist, &i.to_be_bytes(), b"v", false, None).unwrap();
    }

    // Couples the cursor to a page this run's later inserts will split, so
    // the walk below only succeeds if the cursor re-couples by key instead
    // of trusting its now-stale `(page, generation, slot)`.
    let mut cursor = db.cursor_create(None).unwrap();
    db.cursor_find(cache, freelist, &mut cursor, &0u32.to_be_bytes(), OpFlags::empty()).unwrap();

    let mut rest: Vec<u32> = (10..150).collect();
    for &i in &rest {
        db.insert(cache, freelist, &i.to_be_bytes(), b"v", false, None).unwrap();
    }
    keys.append(&mut rest);
    keys.sort_unstable();

    let mut seen = Vec::new();
    loop {
        let key = match db.cursor_current_key(cache, freelist, &mut cursor) {
            Ok(key) => key,
            Err(_) => break,
        };
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&key);
        seen.push(u32::from_be_bytes(buf));
        db.cursor_move_next(cache, freelist, &mut cursor).unwrap();
    }

    assert_eq!(seen, keys);
    db.cursor_close(&mut cursor).unwrap();
}

#[test]
fn duplicate_entries_preserve_insert_position_order() {
    init_logging();
    let flags = EnvFlags::IN_MEMORY_DB | EnvFlags::ENABLE_DUPLICATES;
    let mut env = Environment::create(None, flags, EnvConfig::default()).unwrap();
    let mut db = env
        .create_database(DatabaseConfig { name: 1, key_size: 8, dam: DataAccessMode::empty() }, flags)
        .unwrap();
    let (cache, freelist) = env.cache_and_freelist_mut();

    db.insert(cache, freelist, b"k", b"middle", false, None).unwrap();
    db.insert_duplicate(cache, freelist, b"k", b"last", InsertPosition::Last, None).unwrap();
    db.insert_duplicate(cache, freelist, b"k", b"first", InsertPosition::First, None).unwrap();

    let value = db.find(cache, freelist, b"k", OpFlags::empty(), None).unwrap();
    assert_eq!(value, b"first");
}

#[test]
fn recovery_replays_a_commit_after_reopen() {
    init_logging();
    let path = temp_path("recover");
    let path_str = path.to_str().unwrap();
    let flags = EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::ENABLE_RECOVERY;

    let mut env = Environment::create(Some(path_str), flags, EnvConfig { page_size: 1024, ..Default::default() }).unwrap();
    let mut db = env
        .create_database(DatabaseConfig { name: 1, key_size: 8, dam: DataAccessMode::empty() }, flags)
        .unwrap();
    {
        let (cache, freelist) = env.cache_and_freelist_mut();
        let txn = db.begin(false).unwrap();
        db.insert(cache, freelist, b"durable", b"survives", false, Some(txn)).unwrap();
        db.commit(cache, freelist, txn).unwrap();
    }
    env.sync_database(&db).unwrap();
    env.close().unwrap();

    let mut reopened = Environment::open(path_str, flags, EnvConfig { page_size: 1024, ..Default::default() }).unwrap();
    let mut db2 = reopened.open_database(1, flags).unwrap();
    let (cache, freelist) = reopened.cache_and_freelist_mut();
    let value = db2.find(cache, freelist, b"durable", OpFlags::empty(), None).unwrap();
    assert_eq!(value, b"survives");

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
