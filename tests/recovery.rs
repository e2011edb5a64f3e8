//! Durability: clean close leaves an empty journal, a dropped (crashed)
//! environment replays from the journal on the next open, and committed
//! transactions survive a crash mid-flush while uncommitted ones vanish.

use stratadb::{DbConfig, EnvConfig, Environment};

fn txn_config() -> EnvConfig {
    EnvConfig::default().enable_transactions(true)
}

#[test]
fn clean_close_leaves_the_journal_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"k", b"v", 0).unwrap();
        assert!(env.metrics().journal_bytes > 0);
        env.close().unwrap();
    }

    assert_eq!(
        std::fs::metadata(dir.path().join("test.db.jrn0")).unwrap().len(),
        0
    );
    assert_eq!(
        std::fs::metadata(dir.path().join("test.db.jrn1")).unwrap().len(),
        0
    );

    let env = Environment::open(&path, txn_config()).unwrap();
    assert_eq!(env.metrics().journal_bytes, 0);
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"k", 0).unwrap(), Some(b"v".to_vec()));
    env.close().unwrap();
}

#[test]
fn open_close_open_without_writes_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 0..50u32 {
            db.insert(None, &i.to_be_bytes(), b"payload", 0).unwrap();
        }
        env.close().unwrap();
    }
    let image_after_first_close = std::fs::read(&path).unwrap();

    {
        let env = Environment::open(&path, txn_config()).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.count(None, false).unwrap(), 50);
        env.close().unwrap();
    }
    let image_after_second_close = std::fs::read(&path).unwrap();

    assert_eq!(image_after_first_close, image_after_second_close);
}

#[test]
fn crash_replays_one_hundred_autocommitted_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 1..=100u32 {
            let key = format!("{:05}", i);
            db.insert(None, key.as_bytes(), key.as_bytes(), 0).unwrap();
        }
        // dropped without close: simulated crash
    }

    let env = Environment::open(&path, txn_config()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, false).unwrap(), 100);
    assert_eq!(
        db.find(None, b"00050", 0).unwrap(),
        Some(b"00050".to_vec())
    );
    assert_eq!(env.metrics().journal_bytes, 0, "recovery clears the journal");
    env.close().unwrap();
}

#[test]
fn crash_mid_transaction_discards_the_uncommitted_half() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();

        let committed = env.begin_txn(0).unwrap();
        db.insert(Some(&committed), b"committed", b"yes", 0).unwrap();
        committed.commit().unwrap();

        let pending = env.begin_txn(0).unwrap();
        db.insert(Some(&pending), b"pending", b"no", 0).unwrap();
        // neither committed nor aborted: crash
        drop(pending);
    }

    let env = Environment::open(&path, txn_config()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"committed", 0).unwrap(), Some(b"yes".to_vec()));
    assert_eq!(db.find(None, b"pending", 0).unwrap(), None);
    env.close().unwrap();
}

#[test]
fn crash_replays_erases_and_tolerates_missing_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 0..20u32 {
            db.insert(None, format!("k{:02}", i).as_bytes(), b"v", 0).unwrap();
        }
        for i in (0..20u32).step_by(2) {
            db.erase(None, format!("k{:02}", i).as_bytes(), 0).unwrap();
        }
    }

    let env = Environment::open(&path, txn_config()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, false).unwrap(), 10);
    assert_eq!(db.find(None, b"k04", 0).unwrap(), None);
    assert_eq!(db.find(None, b"k05", 0).unwrap(), Some(b"v".to_vec()));
    env.close().unwrap();
}

#[test]
fn crash_recovery_preserves_transaction_interleaving() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();

        let first = env.begin_txn(0).unwrap();
        db.insert(Some(&first), b"a", b"1", 0).unwrap();

        let second = env.begin_txn(0).unwrap();
        db.insert(Some(&second), b"b", b"2", 0).unwrap();

        // commit out of begin order
        second.commit().unwrap();

        db.insert(Some(&first), b"c", b"3", 0).unwrap();
        first.commit().unwrap();

        let aborted = env.begin_txn(0).unwrap();
        db.insert(Some(&aborted), b"d", b"4", 0).unwrap();
        aborted.abort().unwrap();
    }

    let env = Environment::open(&path, txn_config()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"a", 0).unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.find(None, b"b", 0).unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.find(None, b"c", 0).unwrap(), Some(b"3".to_vec()));
    assert_eq!(db.find(None, b"d", 0).unwrap(), None);
    env.close().unwrap();
}

#[test]
fn recovery_restores_record_number_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env
            .create_db(1, DbConfig::default().record_number(true))
            .unwrap();
        for _ in 0..5 {
            db.insert(None, b"", b"row", 0).unwrap();
        }
    }

    let env = Environment::open(&path, txn_config()).unwrap();
    let db = env.open_db(1).unwrap();
    db.insert(None, b"", b"sixth", 0).unwrap();

    assert_eq!(
        db.find(None, &6u64.to_le_bytes(), 0).unwrap(),
        Some(b"sixth".to_vec())
    );
    assert_eq!(db.count(None, false).unwrap(), 6);
    env.close().unwrap();
}

#[test]
fn repeated_crashes_converge_to_the_same_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, txn_config()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"stable", b"1", 0).unwrap();
    }

    // recover, crash again without writing
    for _ in 0..3 {
        let env = Environment::open(&path, txn_config()).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.find(None, b"stable", 0).unwrap(), Some(b"1".to_vec()));
        drop(env);
    }

    let env = Environment::open(&path, txn_config()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, false).unwrap(), 1);
    env.close().unwrap();
}
