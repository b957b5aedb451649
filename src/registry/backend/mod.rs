//! Remote backends
//!
//! A backend is a remote store a package can be pushed to or pulled
//! from. All variants expose the same capability set: upload the
//! artifact/seal/metadata triple, fetch repository and package
//! metadata, update package metadata, delete a package and download a
//! file. Metadata that does not exist remotely is an empty repository,
//! not an error; a response body that should be JSON and is not is a
//! backend misconfiguration, reported instead of parsed.

pub mod fs;
pub mod nexus3;
pub mod s3;

use fabriq_model::{PackageEntry, PackageName, Repository};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use fs::FilesystemBackend;
pub use nexus3::Nexus3Backend;
pub use s3::S3Backend;

/// Errors from remote backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("the remote server responded with status code {status}: {message}")]
    Status { status: u16, message: String },

    #[error("the response body was not JSON, which suggests the backend URI '{uri}' is not correct or the server responded with a bogus payload")]
    NotJson { uri: String },

    #[error("'{file}' not found in remote repository {repository}")]
    FileNotFound { repository: String, file: String },

    #[error("package not found in remote repository, no update was made")]
    PackageNotFound,

    #[error("credentials are malformed, expected USER:PASSWORD")]
    MalformedCredentials,

    #[error("S3 error: {0}")]
    S3(String),
}

/// Basic-auth credentials for a remote backend.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Parse a `USER:PASSWORD` string; an empty input means no
    /// credentials.
    pub fn parse(creds: &str) -> Result<Option<Self>, BackendError> {
        if creds.is_empty() {
            return Ok(None);
        }
        match creds.split_once(':') {
            Some((user, password)) if !user.is_empty() => Ok(Some(Self {
                user: user.to_string(),
                password: password.to_string(),
            })),
            _ => Err(BackendError::MalformedCredentials),
        }
    }
}

/// Capability set every remote backend implements.
pub trait Backend {
    /// Short backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Upload the artifact zip, its seal and the updated repository
    /// metadata as one logical operation.
    fn upload_artifact(
        &self,
        name: &PackageName,
        file_ref: &str,
        zip_path: &Path,
        seal_path: &Path,
        repository: &Repository,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError>;

    /// Fetch the repository metadata document; a repository that does
    /// not exist yet is returned empty.
    fn get_repository_info(
        &self,
        group: &str,
        name: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Repository, BackendError>;

    /// Fetch one package's metadata by id, when present.
    fn get_package_info(
        &self,
        group: &str,
        name: &str,
        id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Option<PackageEntry>, BackendError> {
        let repo = self.get_repository_info(group, name, credentials)?;
        Ok(repo.find_package(id).cloned())
    }

    /// Replace a package's metadata in the remote repository document.
    fn update_package_info(
        &self,
        group: &str,
        name: &str,
        package: &PackageEntry,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError>;

    /// Delete a package's files from the remote repository.
    fn delete_package(
        &self,
        group: &str,
        name: &str,
        file_ref: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError>;

    /// Download a repository file into `dest_dir`, returning its path.
    fn download(
        &self,
        group: &str,
        name: &str,
        file_name: &str,
        dest_dir: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<PathBuf, BackendError>;
}

/// Check that a body parses as JSON before handing it to a
/// deserializer with a concrete shape.
pub(crate) fn is_json(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body).is_ok()
}
