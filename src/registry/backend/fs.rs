//! Filesystem backend
//!
//! Stores the remote repository layout in a directory tree:
//! `<root>/<group>/<name>/repository.json` plus the `<ref>.zip` and
//! `<ref>.json` pairs. Useful for air-gapped distribution and as the
//! reference implementation the protocol backends are tested against.

use fabriq_model::{PackageEntry, PackageName, Repository};
use std::fs;
use std::path::{Path, PathBuf};

use super::{Backend, BackendError, Credentials};
use crate::build::package::copy_file;

/// A backend rooted at a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a backend over `root`, creating it when absent.
    pub fn new(root: PathBuf) -> Result<Self, BackendError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn repo_dir(&self, group: &str, name: &str) -> PathBuf {
        self.root.join(group).join(name)
    }

    fn index_file(&self, group: &str, name: &str) -> PathBuf {
        self.repo_dir(group, name).join("repository.json")
    }

    fn save_index(&self, group: &str, name: &str, repo: &Repository) -> Result<(), BackendError> {
        fs::create_dir_all(self.repo_dir(group, name))?;
        let bytes = serde_json::to_vec_pretty(repo)?;
        fs::write(self.index_file(group, name), bytes)?;
        Ok(())
    }
}

impl Backend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
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
        let dir = self.repo_dir(name.group(), name.name());
        fs::create_dir_all(&dir)?;
        copy_file(zip_path, &dir.join(format!("{}.zip", file_ref)))?;
        copy_file(seal_path, &dir.join(format!("{}.json", file_ref)))?;
        self.save_index(name.group(), name.name(), repository)
    }

    fn get_repository_info(
        &self,
        group: &str,
        name: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Repository, BackendError> {
        let index = self.index_file(group, name);
        if !index.exists() {
            return Ok(Repository::empty(group, name));
        }
        let bytes = fs::read(&index)?;
        Ok(serde_json::from_slice(&bytes)?)
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
        self.save_index(group, name, &repo)
    }

    fn delete_package(
        &self,
        group: &str,
        name: &str,
        file_ref: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let dir = self.repo_dir(group, name);
        for ext in ["zip", "json"] {
            let path = dir.join(format!("{}.{}", file_ref, ext));
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::Io(e)),
            }
        }
        Ok(())
    }

    fn download(
        &self,
        group: &str,
        name: &str,
        file_name: &str,
        dest_dir: &Path,
        _credentials: Option<&Credentials>,
    ) -> Result<PathBuf, BackendError> {
        let src = self.repo_dir(group, name).join(file_name);
        if !src.exists() {
            return Err(BackendError::FileNotFound {
                repository: format!("{}/{}", group, name),
                file: file_name.to_string(),
            });
        }
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(file_name);
        copy_file(&src, &dest)?;
        Ok(dest)
    }
}
