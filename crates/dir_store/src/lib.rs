//! Encrypted multi-replica directory store.
//!
//! The store is a stack of four layers, each owning the next and adding one
//! concern:
//!
//! - [`PlainDirectory`]: names to byte blobs on one directory, plus fuzzy
//!   name search and a side area for untyped metadata.
//! - [`HashedDirectory`]: per-record SHA-256 of the plaintext in a sibling
//!   area, verified on every read.
//! - [`EncryptedDirectory`]: ChaCha20 with a persisted monotonic nonce
//!   counter and crash-safe key rotation.
//! - [`ReplicatedDirectory`]: N replicas under per-replica derived keys,
//!   with write-all / read-first-good semantics and self-healing.
//!
//! One live handle per replica set: the nonce counter is held in memory
//! between control-record persists, so a second writer could reuse a nonce.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod encrypted;
pub mod hashed;
pub mod plain;
pub mod replicated;

pub use encrypted::EncryptedDirectory;
pub use hashed::HashedDirectory;
pub use plain::PlainDirectory;
pub use replicated::ReplicatedDirectory;
pub use vault_core::error::StoreError;
pub use vault_core::key::Key;
