//! Ed25519 signing and verification for package seals
//!
//! Seals are signed with an Ed25519 key pair. Keys live in the registry
//! key store under `keys/`; a root pair is generated the first time the
//! store is touched. Group and package level pairs can be imported and
//! take precedence over the root pair when present, so the signer for
//! `group/name` is resolved `keys/<group>/<name>` first, `keys/<group>`
//! next and the root last.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Signature algorithm identifier recorded in key files
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// File name suffix for private keys
const SIGNING_SUFFIX: &str = "signing.key";

/// File name suffix for public keys
const VERIFY_SUFFIX: &str = "verify.key";

/// Errors from signing/verification operations
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("no signing key found for '{repository}': looked in {searched:?}")]
    KeyNotFound {
        repository: String,
        searched: Vec<PathBuf>,
    },
}

/// Result type for signing operations
pub type SigningResult<T> = Result<T, SigningError>;

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut rand::thread_rng())
}

/// Sign arbitrary bytes, returning the base64 signature
pub fn sign(key: &SigningKey, data: &[u8]) -> String {
    let signature = key.sign(data);
    base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
}

/// Verify a base64 signature over the given bytes
pub fn verify(key: &VerifyingKey, data: &[u8], signature_b64: &str) -> SigningResult<bool> {
    let sig_bytes = base64::engine::general_purpose::STANDARD.decode(signature_b64)?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;
    Ok(key.verify(data, &signature).is_ok())
}

/// Encode a signing key to base64 for storage
pub fn encode_signing_key(key: &SigningKey) -> String {
    base64::engine::general_purpose::STANDARD.encode(key.to_bytes())
}

/// Decode a signing key from base64
pub fn decode_signing_key(encoded: &str) -> SigningResult<SigningKey> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("signing key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Encode a verifying key to base64 for storage
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    base64::engine::general_purpose::STANDARD.encode(key.as_bytes())
}

/// Decode a verifying key from base64
pub fn decode_verifying_key(encoded: &str) -> SigningResult<VerifyingKey> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("verifying key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SigningError::InvalidKey(e.to_string()))
}

/// Load a signing key from an explicit file path
pub fn load_signing_key(path: &Path) -> SigningResult<SigningKey> {
    let encoded = fs::read_to_string(path)?;
    decode_signing_key(&encoded)
}

/// The registry key store rooted at `<registry>/keys`.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// Open the key store, generating the root key pair when the store
    /// is empty.
    pub fn open(keys_root: PathBuf) -> SigningResult<Self> {
        let store = Self { root: keys_root };
        store.ensure_root_pair()?;
        Ok(store)
    }

    /// Directory holding the key material.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve the signing key for a repository by convention:
    /// package level, then group level, then root.
    pub fn signing_key_for(&self, group: &str, name: &str) -> SigningResult<SigningKey> {
        let candidates = self.candidates(group, name, SIGNING_SUFFIX);
        for path in &candidates {
            if path.exists() {
                return load_signing_key(path);
            }
        }
        Err(SigningError::KeyNotFound {
            repository: format!("{}/{}", group, name),
            searched: candidates,
        })
    }

    /// Resolve the verifying key for a repository, same convention as
    /// [`signing_key_for`](Self::signing_key_for).
    pub fn verifying_key_for(&self, group: &str, name: &str) -> SigningResult<VerifyingKey> {
        let candidates = self.candidates(group, name, VERIFY_SUFFIX);
        for path in &candidates {
            if path.exists() {
                let encoded = fs::read_to_string(path)?;
                return decode_verifying_key(&encoded);
            }
        }
        Err(SigningError::KeyNotFound {
            repository: format!("{}/{}", group, name),
            searched: candidates,
        })
    }

    /// Import a key pair at group or package level.
    pub fn import(
        &self,
        group: &str,
        name: Option<&str>,
        key: &SigningKey,
    ) -> SigningResult<()> {
        let (dir, prefix) = match name {
            Some(n) => (self.root.join(group).join(n), format!("{}_{}", group, n)),
            None => (self.root.join(group), group.to_string()),
        };
        write_pair(&dir, &prefix, key)
    }

    fn candidates(&self, group: &str, name: &str, suffix: &str) -> Vec<PathBuf> {
        vec![
            self.root
                .join(group)
                .join(name)
                .join(format!("{}_{}_{}", group, name, suffix)),
            self.root.join(group).join(format!("{}_{}", group, suffix)),
            self.root.join(format!("root_{}", suffix)),
        ]
    }

    fn ensure_root_pair(&self) -> SigningResult<()> {
        let signing_path = self.root.join(format!("root_{}", SIGNING_SUFFIX));
        if signing_path.exists() {
            return Ok(());
        }
        let key = generate_keypair();
        write_pair(&self.root, "root", &key)
    }
}

/// Persist a signing/verifying pair under `dir` with the given prefix.
fn write_pair(dir: &Path, prefix: &str, key: &SigningKey) -> SigningResult<()> {
    fs::create_dir_all(dir)?;
    fs::write(
        dir.join(format!("{}_{}", prefix, SIGNING_SUFFIX)),
        encode_signing_key(key),
    )?;
    fs::write(
        dir.join(format!("{}_{}", prefix, VERIFY_SUFFIX)),
        encode_verifying_key(&key.verifying_key()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify() {
        let key = generate_keypair();
        let signature = sign(&key, b"digest bytes");
        assert!(verify(&key.verifying_key(), b"digest bytes", &signature).unwrap());
    }

    #[test]
    fn test_verify_with_wrong_key() {
        let key = generate_keypair();
        let other = generate_keypair();
        let signature = sign(&key, b"digest bytes");
        assert!(!verify(&other.verifying_key(), b"digest bytes", &signature).unwrap());
    }

    #[test]
    fn test_verify_tampered_data() {
        let key = generate_keypair();
        let signature = sign(&key, b"digest bytes");
        assert!(!verify(&key.verifying_key(), b"digest byteZ", &signature).unwrap());
    }

    #[test]
    fn test_key_encoding_round_trip() {
        let key = generate_keypair();
        let decoded = decode_signing_key(&encode_signing_key(&key)).unwrap();
        assert_eq!(key.to_bytes(), decoded.to_bytes());

        let verifying = key.verifying_key();
        let decoded = decode_verifying_key(&encode_verifying_key(&verifying)).unwrap();
        assert_eq!(verifying.as_bytes(), decoded.as_bytes());
    }

    #[test]
    fn test_store_generates_root_pair() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path().join("keys")).unwrap();
        let key = store.signing_key_for("tools", "builder").unwrap();
        let verifying = store.verifying_key_for("tools", "builder").unwrap();
        let signature = sign(&key, b"data");
        assert!(verify(&verifying, b"data", &signature).unwrap());
    }

    #[test]
    fn test_store_resolution_prefers_most_specific() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path().join("keys")).unwrap();

        let group_key = generate_keypair();
        store.import("tools", None, &group_key).unwrap();
        let resolved = store.signing_key_for("tools", "builder").unwrap();
        assert_eq!(resolved.to_bytes(), group_key.to_bytes());

        let package_key = generate_keypair();
        store.import("tools", Some("builder"), &package_key).unwrap();
        let resolved = store.signing_key_for("tools", "builder").unwrap();
        assert_eq!(resolved.to_bytes(), package_key.to_bytes());

        // another package in the group still resolves to the group key
        let other = store.signing_key_for("tools", "scanner").unwrap();
        assert_eq!(other.to_bytes(), group_key.to_bytes());
    }

    #[test]
    fn test_load_signing_key_from_path() {
        let dir = TempDir::new().unwrap();
        let key = generate_keypair();
        let path = dir.path().join("author.key");
        fs::write(&path, encode_signing_key(&key)).unwrap();
        let loaded = load_signing_key(&path).unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());
    }
}
