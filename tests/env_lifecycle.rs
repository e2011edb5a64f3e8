//! Environment lifecycle: database management, header persistence,
//! read-only mode, CRC verification, freelist reuse across sessions.

use stratadb::error::kind_of;
use stratadb::{DbConfig, EnvConfig, Environment, ErrorKind, KeyType};

#[test]
fn create_db_twice_fails_open_db_missing_fails() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvConfig::default()).unwrap();

    env.create_db(1, DbConfig::default()).unwrap();
    let err = env.create_db(1, DbConfig::default()).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::DatabaseExists));

    let err = env.open_db(9).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::DatabaseNotFound));
}

#[test]
fn databases_reopen_with_their_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, EnvConfig::default()).unwrap();
        let numbers = env
            .create_db(1, DbConfig::default().key_type(KeyType::U64))
            .unwrap();
        let texts = env
            .create_db(2, DbConfig::default().enable_duplicates(true))
            .unwrap();

        numbers.insert(None, &42u64.to_le_bytes(), b"answer", 0).unwrap();
        texts.insert(None, b"word", b"a", 0).unwrap();
        texts
            .insert(None, b"word", b"b", stratadb::op_flags::DUPLICATE)
            .unwrap();
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvConfig::default()).unwrap();
    let mut names = env.database_names().unwrap();
    names.sort_unstable();
    assert_eq!(names, vec![1, 2]);

    let numbers = env.open_db(1).unwrap();
    assert_eq!(
        numbers.find(None, &42u64.to_le_bytes(), 0).unwrap(),
        Some(b"answer".to_vec())
    );
    let texts = env.open_db(2).unwrap();
    assert_eq!(texts.count(None, false).unwrap(), 2);
    env.close().unwrap();
}

#[test]
fn erase_db_frees_its_pages_for_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    let env = Environment::create(&path, EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    for i in 0..500u32 {
        db.insert(None, &i.to_be_bytes(), &[0u8; 100], 0).unwrap();
    }
    db.close().unwrap();
    env.erase_db(1).unwrap();

    assert!(env.metrics().freelist_pages > 0);
    let err = env.open_db(1).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::DatabaseNotFound));

    // a new database reuses the freed pages instead of growing the file
    let before = std::fs::metadata(&path).unwrap().len();
    let again = env.create_db(1, DbConfig::default()).unwrap();
    again.insert(None, b"fresh", b"start", 0).unwrap();
    let after = std::fs::metadata(&path).unwrap().len();
    assert_eq!(before, after);
    env.close().unwrap();
}

#[test]
fn freelist_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 0..300u32 {
            db.insert(None, &i.to_be_bytes(), &[1u8; 64], 0).unwrap();
        }
        db.close().unwrap();
        env.erase_db(1).unwrap();
        assert!(env.metrics().freelist_pages > 0);
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvConfig::default()).unwrap();
    assert!(
        env.metrics().freelist_pages > 0,
        "persisted freelist must reload"
    );
    env.close().unwrap();
}

#[test]
fn read_only_environments_reject_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, EnvConfig::default()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"k", b"v", 0).unwrap();
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvConfig::default().read_only(true)).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"k", 0).unwrap(), Some(b"v".to_vec()));

    let err = db.insert(None, b"new", b"x", 0).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::ReadOnly));
    let err = db.erase(None, b"k", 0).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::ReadOnly));
}

#[test]
fn crc32_checked_environments_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env =
            Environment::create(&path, EnvConfig::default().enable_crc32(true)).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 0..200u32 {
            db.insert(None, &i.to_be_bytes(), b"checksummed", 0).unwrap();
        }
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvConfig::default().enable_crc32(true)).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, false).unwrap(), 200);
    env.close().unwrap();
}

#[test]
fn corrupted_pages_fail_the_crc_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let page_size = EnvConfig::default().page_size;

    {
        let env =
            Environment::create(&path, EnvConfig::default().enable_crc32(true)).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"k", b"v", 0).unwrap();
        env.close().unwrap();
    }

    // flip a payload byte in the b-tree root page
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0xFF], (page_size + 200) as u64).unwrap();
    }

    let env = Environment::open(
        &path,
        EnvConfig::default().enable_crc32(true).disable_mmap(true),
    )
    .unwrap();
    let db = env.open_db(1).unwrap();
    let err = db.find(None, b"k", 0).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::IntegrityViolated));
}

#[test]
fn opening_garbage_fails_with_integrity_violated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, vec![0xAB; 4096]).unwrap();

    let err = Environment::open(&path, EnvConfig::default()).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::IntegrityViolated));
}

#[test]
fn custom_page_size_is_stored_and_restored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(
            &path,
            EnvConfig::default().page_size(4096).max_databases(16),
        )
        .unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 0..300u32 {
            db.insert(None, &i.to_be_bytes(), b"v", 0).unwrap();
        }
        env.close().unwrap();
    }

    // the stored page size wins over the caller's default
    let env = Environment::open(&path, EnvConfig::default()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, false).unwrap(), 300);
    env.close().unwrap();
}

#[test]
fn operations_after_close_fail() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvConfig::default()).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"v", 0).unwrap();
    env.close().unwrap();

    let err = db.insert(None, b"x", b"y", 0).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::InvalidArg));
    assert!(db.find(None, b"k", 0).is_err());
}

#[test]
fn in_memory_environment_rejects_open() {
    let err = Environment::open(
        "nowhere",
        EnvConfig::default().in_memory(true),
    )
    .unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::InvalidArg));

    let env = Environment::create("unused", EnvConfig::default().in_memory(true)).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"v", 0).unwrap();
    assert_eq!(db.find(None, b"k", 0).unwrap(), Some(b"v".to_vec()));
    env.close().unwrap();
}

#[test]
fn cache_strict_environments_error_instead_of_thrashing() {
    // a tiny strict cache with every page pinned by open cursors
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(
        dir.path().join("test.db"),
        EnvConfig::default()
            .cache_size(2 * EnvConfig::default().page_size)
            .cache_strict(true),
    )
    .unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    // enough data to need more pages than the cache budget allows
    let mut cursors = Vec::new();
    let mut result = Ok(());
    for i in 0..5000u32 {
        let key = format!("key{:06}", i);
        result = db.insert(None, key.as_bytes(), &[0u8; 64], 0);
        if result.is_err() {
            break;
        }
        if i % 100 == 0 {
            let cursor = db.cursor(None).unwrap();
            if cursor.find(key.as_bytes(), 0).unwrap().is_some() {
                cursors.push(cursor);
            }
        }
    }
    // either everything fit or the strict cache refused; both are
    // valid outcomes, a panic or hang is not
    if let Err(err) = result {
        assert_eq!(kind_of(&err), Some(ErrorKind::LimitsReached));
    }
    drop(cursors);
}
