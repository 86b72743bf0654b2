//! Integrity side-store: one SHA-256 of the plaintext per record.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use vault_core::error::StoreError;

use crate::plain::PlainDirectory;

/// Subdirectory holding one `<name>.hash` file per record.
pub const HASHES_SUBDIR: &str = ".hashes";

const HASH_EXT: &str = "hash";

/// Wraps a [`PlainDirectory`] with a per-record hash of the stored payload.
/// The hash is written before the record and checked on every read, so a
/// record that cannot be verified never reaches the caller.
///
/// The encryption layer stores ciphertext through the plain layer directly
/// while keeping the hashes here keyed on the *plaintext*; the helpers it
/// needs ([`write_hash`](Self::write_hash), [`verify_hash`](Self::verify_hash))
/// live on this type.
#[derive(Debug)]
pub struct HashedDirectory {
    inner: PlainDirectory,
}

impl HashedDirectory {
    /// Open `dir`, creating the hash area if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let inner = PlainDirectory::open(dir)?;
        fs::create_dir_all(inner.directory().join(HASHES_SUBDIR))?;
        Ok(Self { inner })
    }

    /// The wrapped plain layer.
    pub fn plain(&self) -> &PlainDirectory {
        &self.inner
    }

    /// Mutable access to the wrapped plain layer.
    pub fn plain_mut(&mut self) -> &mut PlainDirectory {
        &mut self.inner
    }

    /// Store `data` under `name`, recording its hash first.
    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        self.write_hash(name, data)?;
        self.inner.write(name, data)
    }

    /// Read the record under `name`, failing if it disagrees with its hash.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let data = self.inner.read(name)?;
        if !self.verify_hash(name, &data)? {
            return Err(StoreError::Integrity { name: name.to_owned() });
        }
        Ok(data)
    }

    /// Remove the record and its hash. Removing the hash of an already
    /// hashless record is not an error.
    pub fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name)?;
        self.delete_hash(name)
    }

    /// Stored digest for `name` (32 bytes).
    pub fn file_hash(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        if !self.inner.exists(name) {
            return Err(StoreError::NotFound { name: name.to_owned() });
        }
        Ok(fs::read(self.hash_path(name))?)
    }

    /// Reconcile records and hashes: a record without its hash is
    /// unverifiable and is deleted; a hash without its record is dropped.
    /// Afterwards the two name sets are equal.
    pub fn cleanup(&mut self) -> Result<(), StoreError> {
        let hashes_dir = self.inner.directory().join(HASHES_SUBDIR);
        fs::create_dir_all(&hashes_dir)?;
        let mut hash_files = BTreeSet::new();
        for entry in fs::read_dir(&hashes_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    hash_files.insert(name);
                }
            }
        }
        for name in self.inner.all_names() {
            if !hash_files.remove(&hash_file_name(&name)) {
                self.delete(&name)?;
            }
        }
        for stale in hash_files {
            fs::remove_file(hashes_dir.join(stale))?;
        }
        Ok(())
    }

    /// Record the hash of `data` as the expected plaintext for `name`.
    pub fn write_hash(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        fs::write(self.hash_path(name), Sha256::digest(data))?;
        Ok(())
    }

    /// Whether `data` matches the stored hash for `name`. A missing hash
    /// file means the record cannot be verified and counts as a mismatch.
    pub fn verify_hash(&self, name: &str, data: &[u8]) -> Result<bool, StoreError> {
        let stored = match fs::read(self.hash_path(name)) {
            Ok(stored) => stored,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(stored == Sha256::digest(data).as_slice())
    }

    fn delete_hash(&self, name: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.hash_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn hash_path(&self, name: &str) -> PathBuf {
        self.inner.directory().join(HASHES_SUBDIR).join(hash_file_name(name))
    }
}

fn hash_file_name(name: &str) -> String {
    format!("{name}.{HASH_EXT}")
}
