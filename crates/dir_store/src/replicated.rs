//! Replica fan-out: write-all, read-first-good with repair, and a
//! reconciliation pass that converges the replica set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};
use vault_core::error::StoreError;
use vault_core::key::Key;

use crate::encrypted::EncryptedDirectory;
use crate::plain::PlainDirectory;

/// Metadata record naming one replica: 32 opaque random bytes.
pub const REPLICA_ID_NAME: &str = "replica_id";

const REPLICA_ID_LEN: usize = 32;

/// An ordered set of [`EncryptedDirectory`] replicas under one logical key.
///
/// Each replica is encrypted under its own key, derived from the logical
/// key and the replica's id, so ciphertexts never repeat across replicas.
/// Replicas are ordered freshest-first at open and the order is fixed for
/// the lifetime of the handle; reads prefer the freshest copy and repair
/// stale ones lazily.
pub struct ReplicatedDirectory {
    dirs: Vec<PathBuf>,
    replicas: Vec<EncryptedDirectory>,
}

impl ReplicatedDirectory {
    /// Open the replica set.
    ///
    /// Replica ids are generated and stored on first use. Every replica is
    /// opened with its derived key (a single wrong-key or corrupted
    /// replica fails the whole open), then the set is ordered by the
    /// control-record freshness stamp, cleaned up, and reconciled.
    ///
    /// # Panics
    ///
    /// Panics if `dirs` is empty; a replica set has at least one member.
    pub fn open(dirs: Vec<PathBuf>, key: &Key) -> Result<Self, StoreError> {
        assert!(!dirs.is_empty(), "replica set needs at least one directory");
        let mut replicas = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            let replica_id = load_or_create_replica_id(dir)?;
            replicas
                .push(EncryptedDirectory::open(dir.clone(), key.derive_for_replica(&replica_id))?);
        }
        // Stable sort: replicas with equal stamps keep the caller's order.
        replicas.sort_by(|a, b| b.modified_secs().cmp(&a.modified_secs()));
        let mut this = Self { dirs, replicas };
        this.cleanup()?;
        this.recover()?;
        Ok(this)
    }

    /// The configured replica directories, in the caller's original order.
    pub fn directories(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Whether the freshest replica knows `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.replicas[0].exists(name)
    }

    /// Record names known to the freshest replica.
    pub fn all_names(&self) -> BTreeSet<String> {
        self.replicas[0].all_names()
    }

    /// Fuzzy name search on the freshest replica.
    pub fn search(&self, target: &str, n: usize) -> Vec<String> {
        self.replicas[0].search(target, n)
    }

    /// Write to every replica, freshest first. A failing replica aborts
    /// the fan-out mid-way; the reconciliation pass on the next open heals
    /// the stragglers.
    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        for replica in &mut self.replicas {
            replica.write(name, data)?;
        }
        Ok(())
    }

    /// Read from the first replica holding a verified copy, then write that
    /// plaintext back into every replica that failed before it. If no
    /// replica can produce the record, the freshest replica's failure is
    /// surfaced.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>, StoreError> {
        let mut failed: Vec<usize> = Vec::new();
        let mut first_err: Option<StoreError> = None;
        let mut found: Option<Vec<u8>> = None;
        for (idx, replica) in self.replicas.iter().enumerate() {
            match replica.read(name) {
                Ok(data) => {
                    found = Some(data);
                    break;
                }
                Err(err @ (StoreError::NotFound { .. } | StoreError::Integrity { .. })) => {
                    failed.push(idx);
                    first_err.get_or_insert(err);
                }
                Err(e) => return Err(e),
            }
        }
        let Some(data) = found else {
            return Err(first_err.unwrap_or(StoreError::NotFound { name: name.to_owned() }));
        };
        for idx in failed {
            debug!(name, replica = idx, "repairing replica from a good copy");
            self.replicas[idx].write(name, &data)?;
        }
        Ok(data)
    }

    /// Remove `name` from every replica. A replica that never had the
    /// record is not an error.
    pub fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        for replica in &mut self.replicas {
            match replica.delete(name) {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reconcile records and hashes on every replica.
    pub fn cleanup(&mut self) -> Result<(), StoreError> {
        for replica in &mut self.replicas {
            replica.cleanup()?;
        }
        Ok(())
    }

    /// Rotate the logical key. Each replica re-keys under its own derived
    /// key; ids are regenerated if somehow absent.
    pub fn change_key(&mut self, new_key: &Key) -> Result<(), StoreError> {
        for replica in &mut self.replicas {
            let replica_id = match replica.read_metadata(REPLICA_ID_NAME)? {
                Some(id) => id,
                None => {
                    let id = generate_replica_id();
                    replica.write_metadata(REPLICA_ID_NAME, &id)?;
                    id.to_vec()
                }
            };
            replica.change_key(new_key.derive_for_replica(&replica_id))?;
        }
        Ok(())
    }

    /// Bring all replicas into agreement on names and content hashes.
    ///
    /// A name missing from some replicas is copied in from its first
    /// holder. A replica whose stored hash disagrees with the freshest
    /// holder's is overwritten from the freshest copy. Freshness wins; a
    /// name for which no replica holds a readable copy is left untouched
    /// and will fail on a later read.
    pub fn recover(&mut self) -> Result<(), StoreError> {
        let mut holders: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, replica) in self.replicas.iter().enumerate() {
            for name in replica.all_names() {
                holders.entry(name).or_default().push(idx);
            }
        }
        for (name, holder_idxs) in holders {
            // Reference plaintext, read lazily at most once per name.
            let mut reference: Option<Vec<u8>> = None;

            if holder_idxs.len() != self.replicas.len() {
                let Some(data) = self.read_from_holders(&name, &holder_idxs)? else {
                    warn!(name = %name, "no replica holds a readable copy; leaving as-is");
                    continue;
                };
                for idx in 0..self.replicas.len() {
                    if !holder_idxs.contains(&idx) {
                        debug!(name = %name, replica = idx, "restoring missing record");
                        self.replicas[idx].write(&name, &data)?;
                    }
                }
                reference = Some(data);
            }

            let reference_hash = self.replicas[holder_idxs[0]].file_hash(&name)?;
            for idx in (0..self.replicas.len()).filter(|&i| i != holder_idxs[0]) {
                if self.replicas[idx].file_hash(&name)? == reference_hash {
                    continue;
                }
                if reference.is_none() {
                    match self.replicas[0].read(&name) {
                        Ok(data) => reference = Some(data),
                        Err(StoreError::Integrity { .. } | StoreError::NotFound { .. }) => {
                            warn!(name = %name, "freshest copy unreadable; leaving divergent");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                if let Some(data) = &reference {
                    warn!(
                        name = %name,
                        replica = idx,
                        expected = %hex::encode(&reference_hash),
                        "healing hash mismatch from freshest replica"
                    );
                    self.replicas[idx].write(&name, data)?;
                }
            }
        }
        Ok(())
    }

    /// First readable plaintext among `holder_idxs`, or `None` if every
    /// holder fails verification.
    fn read_from_holders(
        &self,
        name: &str,
        holder_idxs: &[usize],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        for &idx in holder_idxs {
            match self.replicas[idx].read(name) {
                Ok(data) => return Ok(Some(data)),
                Err(StoreError::Integrity { .. } | StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

fn load_or_create_replica_id(dir: &Path) -> Result<Vec<u8>, StoreError> {
    let plain = PlainDirectory::open(dir)?;
    match plain.read_metadata(REPLICA_ID_NAME)? {
        Some(id) => Ok(id),
        None => {
            let id = generate_replica_id();
            plain.write_metadata(REPLICA_ID_NAME, &id)?;
            Ok(id.to_vec())
        }
    }
}

fn generate_replica_id() -> [u8; REPLICA_ID_LEN] {
    let mut id = [0u8; REPLICA_ID_LEN];
    OsRng.fill_bytes(&mut id);
    id
}
