//! Encryption layer: ChaCha20 records under a persisted counter nonce, and
//! crash-safe key rotation through a staging area.
//!
//! Nonce discipline: every nonce is drawn from the `next_nonce` counter in
//! the control record, and the advanced counter is persisted *before* the
//! ciphertext using it reaches disk. A crash in between burns a nonce,
//! which is safe; reusing one never is. The counter restarts at zero only
//! on key rotation, where every ciphertext is rewritten under the new key.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use vault_core::cipher::{self, Nonce};
use vault_core::error::StoreError;
use vault_core::info::DirectoryInfo;
use vault_core::key::Key;

use crate::hashed::HashedDirectory;

/// Metadata record holding the encrypted control record.
pub const DIRECTORY_INFO_NAME: &str = "directory_info";
/// Staging area for new-key ciphertexts during a rotation.
pub const STAGING_SUBDIR: &str = ".files_using_new_key_cache";

/// Wraps a [`HashedDirectory`] with a directory key. Record payloads are
/// encrypted on disk; the hash side-store keeps digests of the *plaintext*,
/// so integrity is checked on what the caller gets back, not on ciphertext.
pub struct EncryptedDirectory {
    inner: HashedDirectory,
    key: Key,
    info: DirectoryInfo,
}

impl EncryptedDirectory {
    /// Open `dir` with `key`.
    ///
    /// An existing control record is decrypted and checksum-verified; any
    /// failure there reads as [`StoreError::WrongKeyOrCorrupted`]. A fresh
    /// directory starts from the initial state without persisting it. A
    /// rotation left half-done (`key_changed` set) is committed before the
    /// handle is returned; staged files found *without* the flag are
    /// leftovers of an aborted rotation and are discarded.
    pub fn open(dir: impl Into<PathBuf>, key: Key) -> Result<Self, StoreError> {
        let inner = HashedDirectory::open(dir)?;
        fs::create_dir_all(inner.plain().directory().join(STAGING_SUBDIR))?;
        let info = match inner.plain().read_metadata(DIRECTORY_INFO_NAME)? {
            Some(packed) => {
                let dir = inner.plain().directory();
                let plaintext =
                    cipher::open(&key, &packed).map_err(|_| wrong_key_or_corrupted(dir))?;
                DirectoryInfo::decode(&plaintext).map_err(|_| wrong_key_or_corrupted(dir))?
            }
            None => DirectoryInfo::initial(),
        };
        let mut this = Self { inner, key, info };
        if this.info.key_changed {
            this.recover()?;
        } else {
            this.purge_staging()?;
        }
        Ok(this)
    }

    /// The directory backing this store.
    pub fn directory(&self) -> &Path {
        self.inner.plain().directory()
    }

    /// Freshness stamp: seconds since the epoch of the last control-record
    /// persist. Zero until the first write.
    pub fn modified_secs(&self) -> u64 {
        self.info.modified_secs
    }

    /// Whether `name` is a known record.
    pub fn exists(&self, name: &str) -> bool {
        self.inner.plain().exists(name)
    }

    /// Snapshot of the known record names.
    pub fn all_names(&self) -> BTreeSet<String> {
        self.inner.plain().all_names()
    }

    /// Fuzzy name search; see [`PlainDirectory::search`](crate::plain::PlainDirectory::search).
    pub fn search(&self, target: &str, n: usize) -> Vec<String> {
        self.inner.plain().search(target, n)
    }

    /// Store untyped bytes in the metadata side area (unencrypted).
    pub fn write_metadata(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        self.inner.plain().write_metadata(name, data)
    }

    /// Read bytes from the metadata side area; absence is `None`.
    pub fn read_metadata(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.plain().read_metadata(name)
    }

    /// Encrypt and store `plaintext` under `name`.
    ///
    /// The plaintext hash and the advanced counter are both durable before
    /// the ciphertext lands. A crash in between leaves a burned nonce and
    /// an orphan hash; [`cleanup`](Self::cleanup) drops the orphan.
    pub fn write(&mut self, name: &str, plaintext: &[u8]) -> Result<(), StoreError> {
        self.inner.write_hash(name, plaintext)?;
        let nonce = self.info.take_nonce();
        self.save_info()?;
        let packed = cipher::seal(&self.key, nonce, plaintext);
        self.inner.plain_mut().write(name, &packed)
    }

    /// Read and decrypt `name`, verifying the plaintext against its stored
    /// hash.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let packed = self.inner.plain().read(name)?;
        let plaintext = cipher::open(&self.key, &packed)
            .map_err(|_| StoreError::Integrity { name: name.to_owned() })?;
        if !self.inner.verify_hash(name, &plaintext)? {
            return Err(StoreError::Integrity { name: name.to_owned() });
        }
        Ok(plaintext)
    }

    /// Remove the record and its hash.
    pub fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name)
    }

    /// Stored plaintext digest for `name`.
    pub fn file_hash(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.file_hash(name)
    }

    /// Reconcile records and hashes; see [`HashedDirectory::cleanup`].
    pub fn cleanup(&mut self) -> Result<(), StoreError> {
        self.inner.cleanup()
    }

    /// Rotate the directory key with a stage-then-commit protocol.
    ///
    /// Phase A re-encrypts every readable record into the staging area
    /// under `new_key`, with the counter restarted at zero, then persists
    /// the control record, already under the new key, with `key_changed`
    /// set. Phase B renames the staged files over the originals and clears
    /// the flag. After a crash at any point, reopening commits the staged
    /// files again, so the rotation is idempotent. A record that fails its
    /// integrity check during Phase A cannot be trusted for re-encryption
    /// and is dropped.
    pub fn change_key(&mut self, new_key: Key) -> Result<(), StoreError> {
        self.cleanup()?;
        let staging = self.staging_dir();
        let mut new_nonce: u128 = 0;
        for name in self.all_names() {
            let plaintext = match self.read(&name) {
                Ok(data) => data,
                Err(StoreError::Integrity { .. }) => {
                    warn!(name = %name, "dropping unreadable record during key rotation");
                    self.delete(&name)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let packed = cipher::seal(&new_key, Nonce::from_counter(new_nonce), &plaintext);
            fs::write(staging.join(&name), packed)?;
            new_nonce += 1;
        }

        // Point of no return: once the control record is persisted under the
        // new key, only the new key can open this directory, and recovery
        // can always finish the commit from the staged files.
        self.key = new_key;
        self.info.next_nonce = new_nonce;
        self.info.key_changed = true;
        self.save_info()?;

        self.commit_staged()?;

        self.info.key_changed = false;
        self.save_info()
    }

    /// Finish an interrupted rotation: commit staged files, clear the flag.
    fn recover(&mut self) -> Result<(), StoreError> {
        debug!(dir = ?self.directory(), "committing interrupted key rotation");
        self.commit_staged()?;
        self.info.key_changed = false;
        self.save_info()
    }

    /// Move every staged file over its top-level record. `rename` within
    /// one filesystem is atomic, so a reader never sees a half-written
    /// record.
    fn commit_staged(&mut self) -> Result<(), StoreError> {
        let staging = self.staging_dir();
        let dir = self.directory().to_path_buf();
        for entry in fs::read_dir(&staging)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            fs::rename(entry.path(), dir.join(entry.file_name()))?;
        }
        Ok(())
    }

    /// Drop staged files left by a rotation that never reached its commit
    /// point. They are encrypted under a key that was never adopted.
    fn purge_staging(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(self.staging_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                warn!(path = ?entry.path(), "removing stale staged file from aborted key rotation");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Persist the control record. Drawing its nonce advances the counter,
    /// so every record write moves `next_nonce` by two.
    fn save_info(&mut self) -> Result<(), StoreError> {
        let nonce = self.info.take_nonce();
        self.info.modified_secs = now_secs();
        let packed = cipher::seal(&self.key, nonce, &self.info.encode());
        self.inner.plain().write_metadata(DIRECTORY_INFO_NAME, &packed)
    }

    fn staging_dir(&self) -> PathBuf {
        self.directory().join(STAGING_SUBDIR)
    }
}

fn wrong_key_or_corrupted(dir: &Path) -> StoreError {
    StoreError::WrongKeyOrCorrupted { dir: dir.to_path_buf() }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}
