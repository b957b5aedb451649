//! S3 backend
//!
//! Stores packages in an object store bucket with keys shaped
//! `<group>/<name>/<file>`. The AWS SDK is async; this backend owns a
//! dedicated tokio runtime and blocks on each call so the backend
//! surface stays synchronous like the rest of the pipeline. Credentials
//! passed per call take the place of access key id / secret; the
//! default provider chain (environment, profile) applies otherwise.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use fabriq_model::{PackageEntry, PackageName, Repository};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;

use super::{Backend, BackendError, Credentials};

/// Configuration for the S3 backend.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Bucket packages are stored in
    pub bucket: String,
    /// Region; falls back to environment configuration
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
    /// Path-style addressing, needed by most S3-compatible stores
    pub force_path_style: bool,
}

/// An object-store remote registry.
pub struct S3Backend {
    client: Client,
    bucket: String,
    runtime: Runtime,
}

impl S3Backend {
    /// Create a backend over the configured bucket.
    pub fn new(
        config: S3Config,
        credentials: Option<&Credentials>,
    ) -> Result<Self, BackendError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| BackendError::S3(e.to_string()))?;
        let shared = runtime.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = &config.region {
                loader = loader.region(Region::new(region.clone()));
            }
            if let Some(endpoint) = &config.endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            if let Some(creds) = credentials {
                loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                    creds.user.clone(),
                    creds.password.clone(),
                    None,
                    None,
                    "fabriq",
                ));
            }
            loader.load().await
        });
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        Ok(Self {
            client,
            bucket: config.bucket,
            runtime,
        })
    }

    fn key(group: &str, name: &str, file: &str) -> String {
        format!("{}/{}/{}", group, name, file)
    }

    fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type("application/octet-stream")
                    .body(ByteStream::from(bytes))
                    .send(),
            )
            .map_err(|e| BackendError::S3(e.to_string()))?;
        Ok(())
    }

    fn put_file(&self, key: &str, path: &Path) -> Result<(), BackendError> {
        let body = self
            .runtime
            .block_on(ByteStream::from_path(path))
            .map_err(|e| BackendError::S3(e.to_string()))?;
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type("application/octet-stream")
                    .body(body)
                    .send(),
            )
            .map_err(|e| BackendError::S3(e.to_string()))?;
        Ok(())
    }

    /// Fetch an object; `Ok(None)` when the key does not exist.
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let result = self.runtime.block_on(async {
            let object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await;
            match object {
                Ok(object) => match object.body.collect().await {
                    Ok(data) => Ok(Some(data.into_bytes().to_vec())),
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => {
                    let service_error = e.into_service_error();
                    if service_error.is_no_such_key() {
                        Ok(None)
                    } else {
                        Err(service_error.to_string())
                    }
                }
            }
        });
        result.map_err(BackendError::S3)
    }

    fn delete_object(&self, key: &str) -> Result<(), BackendError> {
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .map_err(|e| BackendError::S3(e.to_string()))?;
        Ok(())
    }
}

impl Backend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn upload_artifact(
        &self,
        name: &PackageName,
        file_ref: &str,
        zip_path: &Path,
        seal_path: &Path,
        repository: &Repository,
        _credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let group = name.group();
        let pkg = name.name();
        self.put_file(&Self::key(group, pkg, &format!("{}.json", file_ref)), seal_path)?;
        self.put_file(&Self::key(group, pkg, &format!("{}.zip", file_ref)), zip_path)?;
        let repo_bytes = serde_json::to_vec_pretty(repository)?;
        self.put_bytes(&Self::key(group, pkg, "repository.json"), repo_bytes)
    }

    fn get_repository_info(
        &self,
        group: &str,
        name: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Repository, BackendError> {
        match self.get_bytes(&Self::key(group, name, "repository.json"))? {
            None => Ok(Repository::empty(group, name)),
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }

    fn update_package_info(
        &self,
        group: &str,
        name: &str,
        package: &PackageEntry,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let mut repo = self.get_repository_info(group, name, credentials)?;
        if !repo.update_package(package) {
            return Err(BackendError::PackageNotFound);
        }
        let bytes = serde_json::to_vec_pretty(&repo)?;
        self.put_bytes(&Self::key(group, name, "repository.json"), bytes)
    }

    fn delete_package(
        &self,
        group: &str,
        name: &str,
        file_ref: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        self.delete_object(&Self::key(group, name, &format!("{}.zip", file_ref)))?;
        self.delete_object(&Self::key(group, name, &format!("{}.json", file_ref)))
    }

    fn download(
        &self,
        group: &str,
        name: &str,
        file_name: &str,
        dest_dir: &Path,
        _credentials: Option<&Credentials>,
    ) -> Result<PathBuf, BackendError> {
        let bytes = self
            .get_bytes(&Self::key(group, name, file_name))?
            .ok_or_else(|| BackendError::FileNotFound {
                repository: format!("{}/{}", group, name),
                file: file_name.to_string(),
            })?;
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(file_name);
        fs::write(&dest, bytes)?;
        Ok(dest)
    }
}
