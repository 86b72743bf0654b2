// Key rotation: correctness, nonce reset, integrity handling, and crash
// recovery from every interesting interruption point.

use std::fs;
use std::path::{Path, PathBuf};

use dir_store::{EncryptedDirectory, Key, ReplicatedDirectory, StoreError};
use vault_core::cipher::{self, Nonce, NONCE_LEN};
use vault_core::info::DirectoryInfo;

const STAGING: &str = ".files_using_new_key_cache";

fn replica_dirs(root: &Path, n: usize) -> Vec<PathBuf> {
    (0..n).map(|i| root.join(format!("replica{i}"))).collect()
}

#[test]
fn old_key_rejected_new_key_reads_everything() {
    let root = tempfile::tempdir().unwrap();
    let dirs = replica_dirs(root.path(), 2);
    let old = Key::new([1u8; 32]);
    let new = Key::new([2u8; 32]);

    let mut store = ReplicatedDirectory::open(dirs.clone(), &old).unwrap();
    for i in 0..5 {
        store.write(&format!("record{i}"), format!("payload {i}").as_bytes()).unwrap();
    }
    store.change_key(&new).unwrap();
    // The live handle keeps working under the new key.
    assert_eq!(store.read("record0").unwrap(), b"payload 0");
    drop(store);

    assert!(matches!(
        ReplicatedDirectory::open(dirs.clone(), &old),
        Err(StoreError::WrongKeyOrCorrupted { .. })
    ));
    let mut store = ReplicatedDirectory::open(dirs, &new).unwrap();
    for i in 0..5 {
        assert_eq!(store.read(&format!("record{i}")).unwrap(), format!("payload {i}").as_bytes());
    }
}

#[test]
fn rotation_restarts_record_nonces_at_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let old = Key::new([3u8; 32]);
    let mut dir = EncryptedDirectory::open(tmp.path(), old).unwrap();
    for i in 0..4 {
        dir.write(&format!("r{i}"), b"data").unwrap();
    }
    dir.change_key(Key::new([4u8; 32])).unwrap();

    let mut nonces = Vec::new();
    for i in 0..4 {
        let raw = fs::read(tmp.path().join(format!("r{i}"))).unwrap();
        let bytes: [u8; NONCE_LEN] = raw[1..1 + NONCE_LEN].try_into().unwrap();
        nonces.push(Nonce(bytes).counter());
    }
    nonces.sort_unstable();
    assert_eq!(nonces, vec![0, 1, 2, 3]);
}

#[test]
fn unreadable_record_is_dropped_by_rotation() {
    let tmp = tempfile::tempdir().unwrap();
    let mut dir = EncryptedDirectory::open(tmp.path(), Key::new([5u8; 32])).unwrap();
    dir.write("good", b"kept").unwrap();
    dir.write("bad", b"lost").unwrap();
    // Corrupt one record so its plaintext can no longer be trusted.
    let mut raw = fs::read(tmp.path().join("bad")).unwrap();
    raw[13] ^= 0xff;
    fs::write(tmp.path().join("bad"), raw).unwrap();

    let new = Key::new([6u8; 32]);
    dir.change_key(new.clone()).unwrap();
    assert_eq!(dir.read("good").unwrap(), b"kept");
    assert!(!dir.exists("bad"));
    assert!(!tmp.path().join("bad").exists());

    drop(dir);
    let dir = EncryptedDirectory::open(tmp.path(), new).unwrap();
    assert_eq!(dir.read("good").unwrap(), b"kept");
}

/// Build the exact on-disk state of a rotation interrupted right after its
/// control record landed under the new key: staged ciphertexts present,
/// top-level records still old-key, `key_changed` set.
fn stage_without_commit(dir: &Path, new_key: &Key, records: &[(&str, &[u8])]) {
    for (i, (name, plaintext)) in records.iter().enumerate() {
        let staged = cipher::seal(new_key, Nonce::from_counter(i as u128), plaintext);
        fs::write(dir.join(STAGING).join(name), staged).unwrap();
    }
    let mut info = DirectoryInfo {
        modified_secs: 1_000,
        next_nonce: records.len() as u128,
        key_changed: true,
    };
    let nonce = info.take_nonce();
    let packed = cipher::seal(new_key, nonce, &info.encode());
    fs::write(dir.join(".metadata").join("directory_info"), packed).unwrap();
}

#[test]
fn crash_after_stage_recovers_under_new_key() {
    let tmp = tempfile::tempdir().unwrap();
    let old = Key::new([7u8; 32]);
    let new = Key::new([8u8; 32]);
    {
        let mut dir = EncryptedDirectory::open(tmp.path(), old.clone()).unwrap();
        dir.write("a", b"v1").unwrap();
    }
    stage_without_commit(tmp.path(), &new, &[("a", b"v1")]);

    // The control record is new-key now, so the old key is locked out.
    assert!(matches!(
        EncryptedDirectory::open(tmp.path(), old),
        Err(StoreError::WrongKeyOrCorrupted { .. })
    ));

    // Opening with the new key finishes the commit.
    let dir = EncryptedDirectory::open(tmp.path(), new.clone()).unwrap();
    assert_eq!(dir.read("a").unwrap(), b"v1");
    assert_eq!(fs::read_dir(tmp.path().join(STAGING)).unwrap().count(), 0);

    // And the recovered state is stable across another reopen.
    drop(dir);
    let dir = EncryptedDirectory::open(tmp.path(), new).unwrap();
    assert_eq!(dir.read("a").unwrap(), b"v1");
}

#[test]
fn crash_after_commit_with_flag_still_set_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let old = Key::new([9u8; 32]);
    let new = Key::new([10u8; 32]);
    {
        let mut dir = EncryptedDirectory::open(tmp.path(), old).unwrap();
        dir.write("a", b"v1").unwrap();
    }
    stage_without_commit(tmp.path(), &new, &[("a", b"v1")]);
    // Simulate the crash landing after the staged file moved but before the
    // flag was cleared.
    fs::rename(tmp.path().join(STAGING).join("a"), tmp.path().join("a")).unwrap();

    let dir = EncryptedDirectory::open(tmp.path(), new).unwrap();
    assert_eq!(dir.read("a").unwrap(), b"v1");
}

#[test]
fn crash_before_info_persist_keeps_old_key() {
    // An abort during Phase A, before the control record is rewritten,
    // leaves the directory fully old-key; the staged leftovers must be
    // discarded on the next open.
    let tmp = tempfile::tempdir().unwrap();
    let old = Key::new([11u8; 32]);
    let new = Key::new([12u8; 32]);
    {
        let mut dir = EncryptedDirectory::open(tmp.path(), old.clone()).unwrap();
        dir.write("a", b"v1").unwrap();
    }
    let staged = cipher::seal(&new, Nonce::from_counter(0), b"v1");
    fs::write(tmp.path().join(STAGING).join("a"), staged).unwrap();

    let dir = EncryptedDirectory::open(tmp.path(), old).unwrap();
    assert_eq!(dir.read("a").unwrap(), b"v1");
    assert_eq!(fs::read_dir(tmp.path().join(STAGING)).unwrap().count(), 0);
}

#[test]
fn replicated_rotation_reaches_every_replica() {
    let root = tempfile::tempdir().unwrap();
    let dirs = replica_dirs(root.path(), 3);
    let old = Key::new([13u8; 32]);
    let new = Key::new([14u8; 32]);

    let mut store = ReplicatedDirectory::open(dirs.clone(), &old).unwrap();
    store.write("a", b"shared").unwrap();
    store.change_key(&new).unwrap();
    drop(store);

    // Every replica individually opens under its derived new key.
    for dir in &dirs {
        let replica_id = fs::read(dir.join(".metadata").join("replica_id")).unwrap();
        let replica =
            EncryptedDirectory::open(dir, new.derive_for_replica(&replica_id)).unwrap();
        assert_eq!(replica.read("a").unwrap(), b"shared");
    }
}
