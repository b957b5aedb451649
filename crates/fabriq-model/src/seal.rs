//! Package seals
//!
//! A seal is the unit of trust for a package: the manifest, a digest
//! over the manifest JSON and the artifact bytes, and a signature over
//! the digest under the author's private key. The digest is computed
//! over exactly the bytes persisted to disk, in manifest-then-artifact
//! order; verification must reproduce that ordering byte for byte.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::manifest::Manifest;

/// Prefix identifying the digest algorithm in the seal.
pub const DIGEST_PREFIX: &str = "sha256:";

/// Errors from seal construction and verification
#[derive(Debug, Error)]
pub enum SealError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot read seal file {path}: {source}")]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("seal digest mismatch for {path}: recorded {recorded}, computed {computed}")]
    DigestMismatch {
        path: PathBuf,
        recorded: String,
        computed: String,
    },
}

/// The digital seal persisted beside a package zip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seal {
    /// Package metadata, part of the digested bytes
    pub manifest: Manifest,

    /// `sha256:` + base64 of SHA-256(manifest JSON ‖ artifact bytes)
    pub digest: String,

    /// Base64 signature of the raw digest under the author's key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl Seal {
    /// Compute the raw combined checksum of the manifest and the
    /// artifact at `zip_path`.
    pub fn checksum(manifest: &Manifest, zip_path: &Path) -> Result<[u8; 32], SealError> {
        let manifest_bytes = manifest_json_bytes(manifest)?;
        let artifact = fs::read(zip_path)?;
        let mut hasher = Sha256::new();
        hasher.update(&manifest_bytes);
        hasher.update(&artifact);
        Ok(hasher.finalize().into())
    }

    /// Render a raw checksum as the seal digest string.
    pub fn encode_digest(sum: &[u8; 32]) -> String {
        format!(
            "{}{}",
            DIGEST_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(sum)
        )
    }

    /// The package id: hex SHA-256 of the complete seal JSON. This is
    /// the content address used by the registry catalogue.
    pub fn package_id(&self) -> Result<String, SealError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recompute the digest from the artifact at `zip_path` and the
    /// embedded manifest, and require byte-for-byte equality with the
    /// recorded digest. A mismatch is always an integrity failure.
    pub fn verify_digest(&self, zip_path: &Path) -> Result<(), SealError> {
        let sum = Self::checksum(&self.manifest, zip_path)?;
        let computed = Self::encode_digest(&sum);
        if computed != self.digest {
            return Err(SealError::DigestMismatch {
                path: zip_path.to_path_buf(),
                recorded: self.digest.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Load a seal from its JSON file.
    pub fn load(path: &Path) -> Result<Self, SealError> {
        let bytes = fs::read(path).map_err(|source| SealError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persist the seal as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), SealError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// The exact manifest byte representation covered by the digest.
pub fn manifest_json_bytes(manifest: &Manifest) -> Result<Vec<u8>, SealError> {
    Ok(serde_json::to_vec_pretty(manifest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_manifest() -> Manifest {
        Manifest {
            ref_name: "070826101530123-abcdef0123".to_string(),
            profile: "linux".to_string(),
            target: "bin/app".to_string(),
            time: "Friday, 07-Aug-26 10:15:30 UTC".to_string(),
            size: "12B".to_string(),
            ..Default::default()
        }
    }

    fn sealed_artifact(dir: &TempDir, content: &[u8]) -> (Seal, std::path::PathBuf) {
        let zip_path = dir.path().join("artifact.zip");
        fs::write(&zip_path, content).unwrap();
        let manifest = sample_manifest();
        let sum = Seal::checksum(&manifest, &zip_path).unwrap();
        let seal = Seal {
            manifest,
            digest: Seal::encode_digest(&sum),
            signature: String::new(),
        };
        (seal, zip_path)
    }

    #[test]
    fn test_digest_round_trip() {
        let dir = TempDir::new().unwrap();
        let (seal, zip_path) = sealed_artifact(&dir, b"artifact bytes");
        seal.verify_digest(&zip_path).unwrap();
    }

    #[test]
    fn test_artifact_tamper_detected() {
        let dir = TempDir::new().unwrap();
        let (seal, zip_path) = sealed_artifact(&dir, b"artifact bytes");
        // flip one byte
        fs::write(&zip_path, b"artifact bytez").unwrap();
        assert!(matches!(
            seal.verify_digest(&zip_path),
            Err(SealError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_manifest_tamper_detected() {
        let dir = TempDir::new().unwrap();
        let (mut seal, zip_path) = sealed_artifact(&dir, b"artifact bytes");
        seal.manifest.profile = "windows".to_string();
        assert!(matches!(
            seal.verify_digest(&zip_path),
            Err(SealError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let (seal, zip_path) = sealed_artifact(&dir, b"artifact bytes");
        let seal_path = dir.path().join("artifact.json");
        seal.save(&seal_path).unwrap();
        let loaded = Seal::load(&seal_path).unwrap();
        assert_eq!(loaded.digest, seal.digest);
        loaded.verify_digest(&zip_path).unwrap();
    }

    #[test]
    fn test_package_id_is_stable_hex() {
        let dir = TempDir::new().unwrap();
        let (seal, _) = sealed_artifact(&dir, b"artifact bytes");
        let id1 = seal.package_id().unwrap();
        let id2 = seal.package_id().unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
    }
}
