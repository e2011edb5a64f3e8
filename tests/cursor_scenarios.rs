//! Cursor state-machine behavior: nil-on-erase rules, merge traversal
//! over pending transactional operations, clones, direction changes.

use stratadb::error::kind_of;
use stratadb::{op_flags, DbConfig, EnvConfig, Environment, ErrorKind};

fn txn_env(dir: &tempfile::TempDir) -> Environment {
    Environment::create(
        dir.path().join("test.db"),
        EnvConfig::default().enable_transactions(true),
    )
    .unwrap()
}

fn plain_env(dir: &tempfile::TempDir) -> Environment {
    Environment::create(dir.path().join("test.db"), EnvConfig::default()).unwrap()
}

#[test]
fn erase_through_one_cursor_nils_its_clone() {
    let dir = tempfile::tempdir().unwrap();
    let env = txn_env(&dir);
    let db = env
        .create_db(1, DbConfig::default().enable_duplicates(true))
        .unwrap();

    let txn = env.begin_txn(0).unwrap();
    db.insert(Some(&txn), b"k", b"v1", 0).unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    cursor.find(b"k", 0).unwrap().unwrap();
    let clone = cursor.clone_cursor().unwrap();
    clone.find(b"k", 0).unwrap().unwrap();

    cursor.erase().unwrap();

    // both cursors are nil now; the key is gone within the transaction
    // even though nothing was committed
    assert!(cursor.get_key().unwrap().is_none());
    assert!(clone.get_key().unwrap().is_none());
    assert!(clone.find(b"k", 0).unwrap().is_none());
    assert_eq!(db.find(Some(&txn), b"k", 0).unwrap(), None);
}

#[test]
fn cursor_erase_without_txn_and_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"aaaaa", b"r1", 0).unwrap();
    db.insert(None, b"bbbbb", b"r2", 0).unwrap();
    db.insert(None, b"ccccc", b"r3", 0).unwrap();

    let cursor = db.cursor(None).unwrap();
    let (key, record) = cursor.first().unwrap().unwrap();
    assert_eq!((key.as_slice(), record.as_slice()), (&b"aaaaa"[..], &b"r1"[..]));
    let (key, record) = cursor.next().unwrap().unwrap();
    assert_eq!((key.as_slice(), record.as_slice()), (&b"bbbbb"[..], &b"r2"[..]));

    cursor.erase().unwrap();

    let (key, record) = cursor.first().unwrap().unwrap();
    assert_eq!((key.as_slice(), record.as_slice()), (&b"aaaaa"[..], &b"r1"[..]));
    let (key, record) = cursor.next().unwrap().unwrap();
    assert_eq!((key.as_slice(), record.as_slice()), (&b"ccccc"[..], &b"r3"[..]));
    assert!(cursor.next().unwrap().is_none());
}

#[test]
fn merge_traversal_sees_pending_inserts_until_abort() {
    let dir = tempfile::tempdir().unwrap();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"22222", b"abcde", 0).unwrap();

    let txn = env.begin_txn(0).unwrap();
    db.insert(Some(&txn), b"11111", b"xyzab", 0).unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    let (key, record) = cursor.first().unwrap().unwrap();
    assert_eq!((key.as_slice(), record.as_slice()), (&b"11111"[..], &b"xyzab"[..]));
    let (key, record) = cursor.next().unwrap().unwrap();
    assert_eq!((key.as_slice(), record.as_slice()), (&b"22222"[..], &b"abcde"[..]));
    assert!(cursor.next().unwrap().is_none());

    txn.abort().unwrap();

    // the pending insert disappeared with the abort
    let (key, record) = cursor.first().unwrap().unwrap();
    assert_eq!((key.as_slice(), record.as_slice()), (&b"22222"[..], &b"abcde"[..]));
    assert!(cursor.next().unwrap().is_none());
}

#[test]
fn overwrite_then_erase_through_two_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"only", b"before", 0).unwrap();

    let txn = env.begin_txn(0).unwrap();
    let cursor_a = db.cursor(Some(&txn)).unwrap();
    let cursor_b = db.cursor(Some(&txn)).unwrap();

    cursor_a.find(b"only", 0).unwrap().unwrap();
    cursor_a.overwrite(b"after").unwrap();
    assert_eq!(db.find(Some(&txn), b"only", 0).unwrap(), Some(b"after".to_vec()));

    cursor_b.find(b"only", 0).unwrap().unwrap();
    cursor_b.erase().unwrap();

    assert!(cursor_a.get_key().unwrap().is_none());
    assert!(cursor_b.get_key().unwrap().is_none());
    assert_eq!(db.find(Some(&txn), b"only", 0).unwrap(), None);

    txn.commit().unwrap();
    assert_eq!(db.find(None, b"only", 0).unwrap(), None);
    assert_eq!(db.count(None, false).unwrap(), 0);
}

#[test]
fn erase_op_shadows_the_tree_during_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for key in [&b"a"[..], b"b", b"c", b"d"] {
        db.insert(None, key, b"x", 0).unwrap();
    }

    let txn = env.begin_txn(0).unwrap();
    db.erase(Some(&txn), b"b", 0).unwrap();
    db.erase(Some(&txn), b"d", 0).unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    let mut keys = Vec::new();
    let mut position = cursor.first().unwrap();
    while let Some((key, _)) = position {
        keys.push(key);
        position = cursor.next().unwrap();
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);

    // a plain cursor still sees everything
    let outside = db.cursor(None).unwrap();
    let mut all = 0;
    let mut position = outside.first().unwrap();
    while position.is_some() {
        all += 1;
        position = outside.next().unwrap();
    }
    assert_eq!(all, 4);
    txn.abort().unwrap();
}

#[test]
fn direction_change_revisits_the_neighbor_once() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for key in [&b"a"[..], b"b", b"c"] {
        db.insert(None, key, key, 0).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.first().unwrap().unwrap(); // a
    cursor.next().unwrap().unwrap(); // b
    let (key, _) = cursor.next().unwrap().unwrap(); // c
    assert_eq!(key, b"c");
    let (key, _) = cursor.previous().unwrap().unwrap();
    assert_eq!(key, b"b");
    let (key, _) = cursor.previous().unwrap().unwrap();
    assert_eq!(key, b"a");
    assert!(cursor.previous().unwrap().is_none());
}

#[test]
fn first_directional_move_behaves_as_first_or_last() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"low", b"1", 0).unwrap();
    db.insert(None, b"top", b"2", 0).unwrap();

    let forward = db.cursor(None).unwrap();
    let (key, _) = forward.next().unwrap().unwrap();
    assert_eq!(key, b"low");

    let backward = db.cursor(None).unwrap();
    let (key, _) = backward.previous().unwrap().unwrap();
    assert_eq!(key, b"top");
}

#[test]
fn next_after_last_returns_none_and_keeps_position() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"k1", b"v1", 0).unwrap();
    db.insert(None, b"k2", b"v2", 0).unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.last().unwrap().unwrap();
    assert!(cursor.next().unwrap().is_none());
    // the cursor did not move
    assert_eq!(cursor.get_key().unwrap(), Some(b"k2".to_vec()));
    let (key, _) = cursor.previous().unwrap().unwrap();
    assert_eq!(key, b"k1");
}

#[test]
fn clones_move_independently() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for key in [&b"a"[..], b"b", b"c"] {
        db.insert(None, key, key, 0).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.first().unwrap().unwrap();
    let clone = cursor.clone_cursor().unwrap();

    cursor.next().unwrap().unwrap();
    cursor.next().unwrap().unwrap();

    // the clone still stands on the first key
    assert_eq!(clone.get_key().unwrap(), Some(b"a".to_vec()));
    assert_eq!(cursor.get_key().unwrap(), Some(b"c".to_vec()));
}

#[test]
fn erase_adjusts_sibling_cursor_slots() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for key in [&b"a"[..], b"b", b"c"] {
        db.insert(None, key, key, 0).unwrap();
    }

    let at_c = db.cursor(None).unwrap();
    at_c.find(b"c", 0).unwrap().unwrap();

    // erasing "a" shifts the slot under the other cursor
    db.erase(None, b"a", 0).unwrap();
    assert_eq!(at_c.get_key().unwrap(), Some(b"c".to_vec()));
    assert_eq!(at_c.get_record().unwrap(), Some(b"c".to_vec()));

    // erasing the key under the cursor nils it
    db.erase(None, b"c", 0).unwrap();
    assert!(at_c.get_key().unwrap().is_none());
}

#[test]
fn duplicate_erase_adjusts_duplicate_positions() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env
        .create_db(1, DbConfig::default().enable_duplicates(true))
        .unwrap();

    db.insert(None, b"k", b"d0", 0).unwrap();
    db.insert(None, b"k", b"d1", op_flags::DUPLICATE).unwrap();
    db.insert(None, b"k", b"d2", op_flags::DUPLICATE).unwrap();

    let walker = db.cursor(None).unwrap();
    walker.find(b"k", 0).unwrap().unwrap();
    walker.next().unwrap().unwrap(); // duplicate 1
    let at_last = db.cursor(None).unwrap();
    at_last.find(b"k", 0).unwrap().unwrap();
    at_last.next().unwrap().unwrap();
    at_last.next().unwrap().unwrap(); // duplicate 2
    assert_eq!(at_last.duplicate_position().unwrap(), 2);

    // erase duplicate 1: walker nils, at_last decrements
    walker.erase().unwrap();
    assert!(walker.get_key().unwrap().is_none());
    assert_eq!(at_last.duplicate_position().unwrap(), 1);
    assert_eq!(at_last.get_record().unwrap(), Some(b"d2".to_vec()));
}

#[test]
fn overwrite_requires_a_positioned_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let env = plain_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"v", 0).unwrap();

    let cursor = db.cursor(None).unwrap();
    let err = cursor.overwrite(b"new").unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::InvalidArg));

    cursor.find(b"k", 0).unwrap().unwrap();
    cursor.overwrite(b"new").unwrap();
    assert_eq!(db.find(None, b"k", 0).unwrap(), Some(b"new".to_vec()));
    // the cursor did not move
    assert_eq!(cursor.get_key().unwrap(), Some(b"k".to_vec()));
}

#[test]
fn keys_inserted_behind_the_cursor_are_not_revisited() {
    let dir = tempfile::tempdir().unwrap();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.begin_txn(0).unwrap();
    db.insert(Some(&txn), b"m", b"1", 0).unwrap();
    db.insert(Some(&txn), b"t", b"2", 0).unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    let (key, _) = cursor.first().unwrap().unwrap();
    assert_eq!(key, b"m");

    // inserted before the current position: invisible to NEXT
    db.insert(Some(&txn), b"a", b"0", 0).unwrap();
    // inserted after: becomes visible on the next step
    db.insert(Some(&txn), b"p", b"1.5", 0).unwrap();

    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"p");
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"t");
    assert!(cursor.next().unwrap().is_none());
}
