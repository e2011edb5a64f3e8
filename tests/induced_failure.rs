//! Deterministic failure injection: a changeset flush that dies after
//! the commit reached the journal must not lose the transaction.
//!
//! Kept in its own binary because the error inducer is process-global.

use stratadb::error::kind_of;
use stratadb::induce::{ErrorInducer, InducePoint};
use stratadb::{DbConfig, EnvConfig, Environment, ErrorKind};

#[test]
fn commit_survives_an_induced_changeset_flush_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(
            &path,
            EnvConfig::default()
                .enable_transactions(true)
                .enable_fsync(true),
        )
        .unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();

        let txn = env.begin_txn(0).unwrap();
        for i in 0..10u32 {
            let key = format!("key{:02}", i);
            db.insert(Some(&txn), key.as_bytes(), b"value", 0).unwrap();
        }

        // the first crossing of the changeset-flush point fails, i.e.
        // after the commit record reached the journal but before the
        // page images did
        ErrorInducer::activate(true);
        ErrorInducer::add(InducePoint::ChangesetFlush, 1, ErrorKind::Io);

        let err = txn.commit().unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Io));
        ErrorInducer::activate(false);

        // the environment is poisoned: further mutations fail read-only
        let err = db.insert(None, b"more", b"data", 0).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::ReadOnly));
        // dropped without close: crash
    }

    let env = Environment::open(
        &path,
        EnvConfig::default()
            .enable_transactions(true)
            .enable_fsync(true),
    )
    .unwrap();
    let db = env.open_db(1).unwrap();

    // every key of the committed transaction is present
    for i in 0..10u32 {
        let key = format!("key{:02}", i);
        assert_eq!(
            db.find(None, key.as_bytes(), 0).unwrap(),
            Some(b"value".to_vec()),
            "{} lost",
            key
        );
    }
    assert_eq!(
        env.metrics().journal_bytes,
        0,
        "recovery must clear the journal"
    );
    env.close().unwrap();
}
