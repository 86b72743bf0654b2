//! Plain byte storage on a single filesystem directory.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use vault_core::error::StoreError;

/// Subdirectory holding untyped side metadata.
pub const METADATA_SUBDIR: &str = ".metadata";

/// Maps names to byte blobs on one directory and keeps an in-memory set of
/// the known names. The set is seeded from a scan of the top-level regular
/// files at open time; subdirectories (the metadata, hash, and staging
/// areas) are never part of it.
#[derive(Debug)]
pub struct PlainDirectory {
    dir: PathBuf,
    files: BTreeSet<String>,
}

impl PlainDirectory {
    /// Open `dir`, creating it and its metadata area if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(METADATA_SUBDIR))?;
        let mut files = BTreeSet::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    files.insert(name);
                }
            }
        }
        Ok(Self { dir, files })
    }

    /// The directory backing this store.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Whether `name` is a known record.
    pub fn exists(&self, name: &str) -> bool {
        self.files.contains(name)
    }

    /// Write `data` under `name`, overwriting any previous content.
    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        fs::write(self.dir.join(name), data)?;
        self.files.insert(name.to_owned());
        Ok(())
    }

    /// Read the record stored under `name`.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.ensure_known(name)?;
        Ok(fs::read(self.dir.join(name))?)
    }

    /// Remove the record stored under `name`.
    pub fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        self.ensure_known(name)?;
        fs::remove_file(self.dir.join(name))?;
        self.files.remove(name);
        Ok(())
    }

    /// Snapshot of the known record names.
    pub fn all_names(&self) -> BTreeSet<String> {
        self.files.clone()
    }

    /// Store untyped bytes in the metadata side area.
    pub fn write_metadata(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        fs::write(self.dir.join(METADATA_SUBDIR).join(name), data)?;
        Ok(())
    }

    /// Read bytes from the metadata side area; absence is `None`, not an
    /// error.
    pub fn read_metadata(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.dir.join(METADATA_SUBDIR).join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Case-insensitive fuzzy match of `target` against the known names.
    ///
    /// Names are scored with a normalized similarity ratio in [0, 100] and
    /// zero scores are dropped. Exact matches are taken first, the rest fill
    /// in descending score until `n` results; the returned list is sorted by
    /// descending score. Tie order is unspecified.
    pub fn search(&self, target: &str, n: usize) -> Vec<String> {
        let target = target.to_lowercase();
        let mut scored: Vec<(&String, f64)> = self
            .files
            .iter()
            .map(|name| {
                (name, 100.0 * strsim::normalized_levenshtein(&target, &name.to_lowercase()))
            })
            .filter(|&(_, score)| score > 0.0)
            .collect();

        let mut candidates: Vec<(&String, f64)> =
            scored.iter().filter(|&&(_, score)| score >= 100.0).copied().collect();
        scored.retain(|&(_, score)| score < 100.0);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        for pair in scored {
            if candidates.len() >= n {
                break;
            }
            candidates.push(pair);
        }

        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        candidates.truncate(n);
        candidates.into_iter().map(|(name, _)| name.clone()).collect()
    }

    fn ensure_known(&self, name: &str) -> Result<(), StoreError> {
        if self.exists(name) {
            Ok(())
        } else {
            Err(StoreError::NotFound { name: name.to_owned() })
        }
    }
}
