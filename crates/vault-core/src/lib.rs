//! Core primitives shared by the directory store stack.
//!
//! Everything here is deliberately free of filesystem concerns: the error
//! taxonomy, key material handling, the ChaCha20 record envelope, and the
//! `DirectoryInfo` control-record codec. The storage layers in `dir_store`
//! compose these into the on-disk protocols.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Version of the core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error {
    //! Error taxonomy for the whole storage stack.

    use std::path::PathBuf;
    use thiserror::Error;

    /// Errors surfaced by the directory store.
    #[derive(Debug, Error)]
    pub enum StoreError {
        /// The control record could not be decrypted and checksum-verified
        /// on open. Wrong key and on-disk corruption are indistinguishable
        /// here and are reported as one condition.
        #[error("wrong key, or data is corrupted in directory {dir:?}")]
        WrongKeyOrCorrupted {
            /// Directory that rejected the key.
            dir: PathBuf,
        },
        /// Operation targeted a name the store does not know.
        #[error("file {name:?} does not exist")]
        NotFound {
            /// Record name.
            name: String,
        },
        /// The decrypted payload disagrees with its stored hash, or the
        /// record envelope is malformed or carries an unknown version.
        #[error("integrity check failed for {name:?}")]
        Integrity {
            /// Record name.
            name: String,
        },
        /// Underlying filesystem failure.
        #[error("io: {0}")]
        Io(#[from] std::io::Error),
    }
}

pub mod key {
    //! Key material and per-replica derivation.

    use sha2::{Digest, Sha256};
    use zeroize::{Zeroize, ZeroizeOnDrop};

    /// Number of bytes in a directory key.
    pub const KEY_LEN: usize = 32;

    /// A 32-byte ChaCha20 key. Zeroed on drop.
    #[derive(Clone, Zeroize, ZeroizeOnDrop)]
    pub struct Key([u8; KEY_LEN]);

    impl Key {
        /// Wrap caller-supplied key bytes.
        pub fn new(bytes: [u8; KEY_LEN]) -> Self {
            Self(bytes)
        }

        /// Raw key bytes.
        pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
            &self.0
        }

        /// Derive the key for one replica: `SHA-256(logical_key || replica_id)`.
        ///
        /// Salting with the replica id keeps ciphertexts distinct across
        /// replicas, so a replica directory cannot be moved into another
        /// replica slot.
        pub fn derive_for_replica(&self, replica_id: &[u8]) -> Self {
            let mut hasher = Sha256::new();
            hasher.update(self.0);
            hasher.update(replica_id);
            Self(hasher.finalize().into())
        }
    }

    impl std::fmt::Debug for Key {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            // Key material never reaches logs.
            f.write_str("Key(..)")
        }
    }

}

pub mod cipher {
    //! ChaCha20 record envelope: `version(1) || nonce(12) || ciphertext`.
    //!
    //! The cipher is an unauthenticated stream cipher, so the ciphertext has
    //! the same length as the plaintext. Authenticity comes from the layers
    //! above: the per-record plaintext hash and the checksum inside the
    //! control record.

    use chacha20::cipher::{KeyIvInit, StreamCipher};
    use chacha20::ChaCha20;
    use thiserror::Error;

    use crate::key::Key;

    /// Envelope format version produced and understood by this build.
    pub const VERSION: u8 = 1;
    /// Number of bytes in a ChaCha20 (IETF) nonce.
    pub const NONCE_LEN: usize = 12;
    /// Envelope header length: version byte plus nonce.
    pub const HEADER_LEN: usize = 1 + NONCE_LEN;

    /// A 96-bit nonce holding a big-endian counter value.
    ///
    /// Nonces are drawn from a per-directory counter, never at random; see
    /// the nonce-uniqueness invariant on the encryption layer.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Nonce(pub [u8; NONCE_LEN]);

    impl Nonce {
        /// Big-endian encoding of a counter value. Only the low 96 bits are
        /// representable; the counter is persisted in the same width.
        pub fn from_counter(counter: u128) -> Self {
            let wide = counter.to_be_bytes();
            let mut out = [0u8; NONCE_LEN];
            out.copy_from_slice(&wide[4..]);
            Self(out)
        }

        /// Counter value encoded by this nonce.
        pub fn counter(&self) -> u128 {
            let mut wide = [0u8; 16];
            wide[4..].copy_from_slice(&self.0);
            u128::from_be_bytes(wide)
        }

        /// Raw nonce bytes.
        pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
            &self.0
        }
    }

    /// Envelope parse failures.
    #[derive(Debug, Error)]
    pub enum EnvelopeError {
        /// Fewer bytes than a version byte plus nonce.
        #[error("record envelope truncated")]
        Truncated,
        /// Version byte this build cannot read. Higher versions would need
        /// an upgrade hook; lower ones must fail rather than be ignored.
        #[error("unsupported record version {0}")]
        UnsupportedVersion(u8),
    }

    fn keystream(key: &Key, nonce: &Nonce, data: &mut [u8]) {
        let mut cipher = ChaCha20::new(key.as_bytes().into(), nonce.as_bytes().into());
        cipher.apply_keystream(data);
    }

    /// Encrypt `plaintext` and frame it as a version-1 record.
    pub fn seal(key: &Key, nonce: Nonce, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len());
        out.push(VERSION);
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(plaintext);
        keystream(key, &nonce, &mut out[HEADER_LEN..]);
        out
    }

    /// Split a framed record and decrypt its payload.
    pub fn open(key: &Key, packed: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let (&version, rest) = packed.split_first().ok_or(EnvelopeError::Truncated)?;
        if version != VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        if rest.len() < NONCE_LEN {
            return Err(EnvelopeError::Truncated);
        }
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let mut plaintext = ciphertext.to_vec();
        keystream(key, &Nonce(nonce), &mut plaintext);
        Ok(plaintext)
    }

}

pub mod info {
    //! `DirectoryInfo` control-record codec.
    //!
    //! Wire layout, 26 bytes total, all integers big-endian unsigned:
    //! `version(1) || modified_secs(8) || next_nonce(12) || key_changed(1) ||
    //! crc32_of_preceding_22_bytes(4)`.
    //!
    //! The CRC is an integrity check, not an authentication tag: it catches
    //! silent corruption and makes a wrong-key decryption (random-looking
    //! plaintext) fail with near certainty.

    use thiserror::Error;

    use crate::cipher::{Nonce, NONCE_LEN};

    /// Serialized length in bytes.
    pub const ENCODED_LEN: usize = 26;

    const VERSION: u8 = 1;
    const CRC_OFFSET: usize = ENCODED_LEN - 4;

    /// Per-directory control record: freshness stamp, nonce counter, and
    /// the re-key commit flag.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct DirectoryInfo {
        /// Seconds since the UNIX epoch of the last persist.
        pub modified_secs: u64,
        /// Next unused nonce counter value.
        pub next_nonce: u128,
        /// True while a key rotation is staged but not yet committed.
        pub key_changed: bool,
    }

    /// Codec failures. Every variant means "wrong key or corrupted" to the
    /// layer that decrypted the record.
    #[derive(Debug, Error)]
    pub enum InfoError {
        /// Payload is not exactly [`ENCODED_LEN`] bytes.
        #[error("directory info has length {0}, expected {ENCODED_LEN}")]
        Length(usize),
        /// Stored CRC-32 disagrees with the payload.
        #[error("directory info checksum mismatch")]
        Checksum,
        /// Version byte this build cannot read.
        #[error("unsupported directory info version {0}")]
        UnsupportedVersion(u8),
    }

    impl DirectoryInfo {
        /// State for a directory with no persisted info yet: epoch zero,
        /// counter zero, no rotation pending.
        pub fn initial() -> Self {
            Self { modified_secs: 0, next_nonce: 0, key_changed: false }
        }

        /// Draw the next nonce, advancing the counter.
        pub fn take_nonce(&mut self) -> Nonce {
            let nonce = Nonce::from_counter(self.next_nonce);
            self.next_nonce += 1;
            nonce
        }

        /// Serialize to the 26-byte wire form.
        pub fn encode(&self) -> [u8; ENCODED_LEN] {
            let mut out = [0u8; ENCODED_LEN];
            out[0] = VERSION;
            out[1..9].copy_from_slice(&self.modified_secs.to_be_bytes());
            out[9..9 + NONCE_LEN].copy_from_slice(Nonce::from_counter(self.next_nonce).as_bytes());
            out[21] = u8::from(self.key_changed);
            let crc = crc32fast::hash(&out[..CRC_OFFSET]);
            out[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
            out
        }

        /// Decode and checksum-verify a serialized record.
        ///
        /// The checksum is verified before the version byte is looked at: a
        /// wrong-key decryption produces random bytes, and the CRC is what
        /// rejects them.
        pub fn decode(data: &[u8]) -> Result<Self, InfoError> {
            if data.len() != ENCODED_LEN {
                return Err(InfoError::Length(data.len()));
            }
            let mut stored = [0u8; 4];
            stored.copy_from_slice(&data[CRC_OFFSET..]);
            if u32::from_be_bytes(stored) != crc32fast::hash(&data[..CRC_OFFSET]) {
                return Err(InfoError::Checksum);
            }
            if data[0] != VERSION {
                return Err(InfoError::UnsupportedVersion(data[0]));
            }
            let mut modified = [0u8; 8];
            modified.copy_from_slice(&data[1..9]);
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&data[9..9 + NONCE_LEN]);
            Ok(Self {
                modified_secs: u64::from_be_bytes(modified),
                next_nonce: Nonce(nonce).counter(),
                key_changed: data[21] != 0,
            })
        }
    }

}
