//! The local package registry
//!
//! A content-addressed catalogue of built artifacts. On disk the
//! registry root holds `repository.json` (the catalogue), flat
//! `<ref>.zip` / `<ref>.json` pairs, `keys/` with signing material,
//! `build/` with ephemeral per-build work directories and `locks/` with
//! advisory lock files.
//!
//! The registry is an explicit value owning its root path, constructed
//! once per invocation and passed by reference into the builder and the
//! CLI; there is no process-wide instance.

pub mod backend;
pub mod lock;

use fabriq_model::{manifest::TIME_FORMAT, NameError, PackageEntry, PackageName, Seal, SealError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::build::package::move_file;
use crate::build::source::WorkDir;
use crate::signing::{KeyStore, SigningError};
use backend::{Backend, BackendError, Credentials};
use lock::{LockError, LockManager};

/// Catalogue file name at the registry root
const CATALOGUE_FILE: &str = "repository.json";

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("cannot determine the home directory; set FABRIQ_HOME to choose a registry location")]
    NoHome,

    #[error("the registry only accepts zip files, got '{0}'")]
    NotZip(PathBuf),

    #[error("package '{0}' not found in the local registry")]
    PackageNotFound(String),

    #[error("package '{0}' does not exist in the remote repository")]
    RemotePackageNotFound(String),

    #[error("cannot push '{repository}': the repository is locked by another process (lock age {age:?}, lifespan {lifespan:?})")]
    PushBlocked {
        repository: String,
        age: Duration,
        lifespan: Duration,
    },
}

/// On-disk shape of the catalogue.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalogue {
    packages: Vec<PackageEntry>,
}

/// The local registry.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    packages: Vec<PackageEntry>,
    locks: LockManager,
}

impl Registry {
    /// Open the registry at the default location: `FABRIQ_HOME` when
    /// set, `~/.fabriq` otherwise.
    pub fn open_default() -> Result<Self, RegistryError> {
        let root = match std::env::var_os("FABRIQ_HOME") {
            Some(home) => PathBuf::from(home),
            None => dirs::home_dir().ok_or(RegistryError::NoHome)?.join(".fabriq"),
        };
        Self::open(root)
    }

    /// Open the registry rooted at `root`, initializing the catalogue
    /// file when the registry is touched for the first time.
    pub fn open(root: PathBuf) -> Result<Self, RegistryError> {
        fs::create_dir_all(&root)?;
        let locks = LockManager::new(root.join("locks"));
        let mut registry = Self {
            root,
            packages: Vec::new(),
            locks,
        };
        registry.load()?;
        Ok(registry)
    }

    /// The registry root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The ephemeral build area, created on demand.
    pub fn build_area(&self) -> Result<PathBuf, RegistryError> {
        let area = self.root.join("build");
        fs::create_dir_all(&area)?;
        Ok(area)
    }

    /// The signing key store; a root key pair is generated the first
    /// time the store is opened.
    pub fn key_store(&self) -> Result<KeyStore, RegistryError> {
        Ok(KeyStore::open(self.root.join("keys"))?)
    }

    /// The per-repository lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Registered packages, insertion order.
    pub fn packages(&self) -> &[PackageEntry] {
        &self.packages
    }

    fn catalogue_file(&self) -> PathBuf {
        self.root.join(CATALOGUE_FILE)
    }

    /// Path of a registered artifact zip.
    pub fn zip_file(&self, file_ref: &str) -> PathBuf {
        self.root.join(format!("{}.zip", file_ref))
    }

    /// Path of a registered seal.
    pub fn seal_file(&self, file_ref: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_ref))
    }

    fn load(&mut self) -> Result<(), RegistryError> {
        let file = self.catalogue_file();
        if !file.exists() {
            // first touch: make sure the catalogue exists on disk
            return self.save();
        }
        let bytes = fs::read(&file)?;
        let catalogue: Catalogue = serde_json::from_slice(&bytes)?;
        self.packages = catalogue.packages;
        Ok(())
    }

    fn save(&self) -> Result<(), RegistryError> {
        let catalogue = Catalogue {
            packages: self.packages.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&catalogue)?;
        fs::write(self.catalogue_file(), bytes)?;
        Ok(())
    }

    /// Find the package holding `name`'s tag within `name`'s repository.
    pub fn find(&self, name: &PackageName) -> Option<&PackageEntry> {
        let repository = name.repository();
        self.packages
            .iter()
            .find(|p| p.repository == repository && p.has_tag(name.tag()))
    }

    /// Find packages whose id contains `id`.
    pub fn find_by_id(&self, id: &str) -> Vec<&PackageEntry> {
        self.packages.iter().filter(|p| p.id.contains(id)).collect()
    }

    /// Load the seal of a registered package.
    pub fn seal_of(&self, entry: &PackageEntry) -> Result<Seal, RegistryError> {
        Ok(Seal::load(&self.seal_file(&entry.file_ref))?)
    }

    /// Register an artifact: move the zip and its sibling seal into the
    /// registry, take over the tag and append a catalogue entry.
    ///
    /// When another package in the same repository already holds the
    /// tag, the tag moves to the new package and the previous holder
    /// becomes dangling. Dangling packages are never deleted
    /// automatically.
    pub fn add(
        &mut self,
        zip_path: &Path,
        name: &PackageName,
        seal: &Seal,
    ) -> Result<(), RegistryError> {
        if zip_path.extension().and_then(|e| e.to_str()) != Some("zip") {
            return Err(RegistryError::NotZip(zip_path.to_path_buf()));
        }
        let file_ref = zip_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let seal_src = zip_path.with_extension("json");

        info!(package = %name, file_ref = %file_ref, "adding package to the local registry");
        move_file(zip_path, &self.zip_file(&file_ref))?;
        move_file(&seal_src, &self.seal_file(&file_ref))?;

        let repository = name.repository();
        // tag uniqueness: strip the tag from the current holder
        for package in self
            .packages
            .iter_mut()
            .filter(|p| p.repository == repository)
        {
            package.remove_tag(name.tag());
        }

        self.packages.push(PackageEntry {
            id: seal.package_id()?,
            repository,
            file_ref,
            tags: vec![name.tag().to_string()],
            size: seal.manifest.size.clone(),
            created: seal.manifest.time.clone(),
        });
        self.save()
    }

    /// Render the catalogue as a tab-aligned table.
    pub fn list(&self) -> String {
        let mut rows: Vec<[String; 5]> = vec![[
            "REPOSITORY".to_string(),
            "TAG".to_string(),
            "PACKAGE ID".to_string(),
            "CREATED".to_string(),
            "SIZE".to_string(),
        ]];
        for package in &self.packages {
            if package.is_dangling() {
                rows.push([
                    package.repository.clone(),
                    "<none>".to_string(),
                    package.short_id().to_string(),
                    to_elapsed_label(&package.created),
                    package.size.clone(),
                ]);
            }
            for tag in &package.tags {
                rows.push([
                    package.repository.clone(),
                    tag.clone(),
                    package.short_id().to_string(),
                    to_elapsed_label(&package.created),
                    package.size.clone(),
                ]);
            }
        }
        render_table(&rows)
    }

    /// Package ids only, one per line.
    pub fn list_quiet(&self) -> String {
        let mut out = String::new();
        for package in &self.packages {
            out.push_str(package.short_id());
            out.push('\n');
        }
        out
    }

    /// Remove packages by name or id substring. A name that matches
    /// nothing is reported and the batch continues.
    pub fn remove(&mut self, names: &[String]) -> Result<Vec<String>, RegistryError> {
        let mut report = Vec::new();
        for raw in names {
            let parsed = PackageName::parse(raw);
            let by_name = parsed.as_ref().ok().and_then(|n| {
                self.packages
                    .iter()
                    .position(|p| p.repository == n.repository() && p.has_tag(n.tag()))
            });
            if let (Some(ix), Ok(name)) = (by_name, parsed) {
                let package = &mut self.packages[ix];
                package.remove_tag(name.tag());
                if package.is_dangling() {
                    let package = self.packages.remove(ix);
                    self.remove_files(&package)?;
                    report.push(format!("deleted {}", package.short_id()));
                } else {
                    report.push(format!("untagged {}", name));
                }
                self.save()?;
                continue;
            }
            // fall back to an id substring match
            let matching: Vec<usize> = self
                .packages
                .iter()
                .enumerate()
                .filter(|(_, p)| p.id.contains(raw.as_str()))
                .map(|(ix, _)| ix)
                .collect();
            if matching.is_empty() {
                report.push(format!("name {} not found", raw));
                continue;
            }
            for ix in matching.into_iter().rev() {
                let package = self.packages.remove(ix);
                self.remove_files(&package)?;
                report.push(format!("deleted {}", package.short_id()));
            }
            self.save()?;
        }
        Ok(report)
    }

    fn remove_files(&self, package: &PackageEntry) -> Result<(), RegistryError> {
        for path in [
            self.zip_file(&package.file_ref),
            self.seal_file(&package.file_ref),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "package file already missing");
                }
                Err(e) => return Err(RegistryError::Io(e)),
            }
        }
        Ok(())
    }

    /// Push a package to a remote backend. The per-repository lock is
    /// held for the duration of the upload so two pushers cannot
    /// corrupt the remote metadata; a fresh lock held by someone else
    /// blocks the push, a stale one is taken over.
    pub fn push(
        &mut self,
        name: &PackageName,
        backend: &dyn Backend,
        credentials: Option<&Credentials>,
        lock_lifespan: Duration,
    ) -> Result<(), RegistryError> {
        let entry = self
            .find(name)
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_string()))?
            .clone();
        let repository = name.repository();

        self.locks.try_release(&repository, lock_lifespan)?;
        let guard = self.locks.acquire(&repository).map_err(|e| match e {
            LockError::AlreadyLocked { repository, age } => RegistryError::PushBlocked {
                repository,
                age,
                lifespan: lock_lifespan,
            },
            other => RegistryError::Lock(other),
        })?;

        let result = self.push_locked(name, &entry, backend, credentials);
        // surface release errors on the success path; the guard drop
        // covers the failure path
        match result {
            Ok(()) => {
                guard.release()?;
                info!(package = %name, backend = backend.name(), "pushed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn push_locked(
        &self,
        name: &PackageName,
        entry: &PackageEntry,
        backend: &dyn Backend,
        credentials: Option<&Credentials>,
    ) -> Result<(), RegistryError> {
        let group = name.group();
        let package_name = name.name();
        let tag = name.tag();

        // the artifact already exists remotely: only the tag moves
        if let Some(mut remote) =
            backend.get_package_info(group, package_name, &entry.id, credentials)?
        {
            if remote.has_tag(tag) {
                info!(package = %name, "tag already exists, nothing to push");
                return Ok(());
            }
            remote.tags.push(tag.to_string());
            backend.update_package_info(group, package_name, &remote, credentials)?;
            return Ok(());
        }

        let mut repo = backend.get_repository_info(group, package_name, credentials)?;
        // the tag may label another artifact remotely; it moves to the
        // one being pushed
        if let Some(holder) = repo
            .packages
            .iter_mut()
            .find(|p| p.has_tag(tag) && p.id != entry.id)
        {
            holder.remove_tag(tag);
            if holder.is_dangling() {
                // keep the remote artifact addressable under its file
                // reference
                holder.tags.push(holder.file_ref.clone());
            }
            let holder = holder.clone();
            backend.update_package_info(group, package_name, &holder, credentials)?;
        }

        let mut pushed = entry.clone();
        pushed.tags = vec![tag.to_string()];
        repo.upsert_package(&pushed);

        backend.upload_artifact(
            name,
            &entry.file_ref,
            &self.zip_file(&entry.file_ref),
            &self.seal_file(&entry.file_ref),
            &repo,
            credentials,
        )?;
        Ok(())
    }

    /// Pull a package from a remote backend: download the seal and the
    /// artifact, verify the seal digest, then ingest with the same tag
    /// semantics as a local add. A digest mismatch aborts the pull
    /// before the registry is touched.
    pub fn pull(
        &mut self,
        name: &PackageName,
        backend: &dyn Backend,
        credentials: Option<&Credentials>,
    ) -> Result<PackageEntry, RegistryError> {
        let group = name.group();
        let package_name = name.name();
        let repo = backend.get_repository_info(group, package_name, credentials)?;
        let remote = repo
            .find_by_tag(name.tag())
            .ok_or_else(|| RegistryError::RemotePackageNotFound(name.to_string()))?
            .clone();

        let repository = name.repository();
        // the artifact may already be local under another tag
        if let Some(ix) = self
            .packages
            .iter()
            .position(|p| p.repository == repository && p.id == remote.id)
        {
            if !self.packages[ix].has_tag(name.tag()) {
                for (jx, package) in self.packages.iter_mut().enumerate() {
                    if jx != ix && package.repository == repository {
                        package.remove_tag(name.tag());
                    }
                }
                self.packages[ix].tags.push(name.tag().to_string());
                self.save()?;
                info!(package = %name, "package already exists, tag added");
            } else {
                info!(package = %name, "package already exists, nothing to do");
            }
            return Ok(self.packages[ix].clone());
        }

        // download into a private work directory, removed on drop
        let work = WorkDir::create(&self.build_area()?)?;
        let seal_path = backend.download(
            group,
            package_name,
            &format!("{}.json", remote.file_ref),
            work.path(),
            credentials,
        )?;
        let zip_path = backend.download(
            group,
            package_name,
            &format!("{}.zip", remote.file_ref),
            work.path(),
            credentials,
        )?;

        let seal = Seal::load(&seal_path)?;
        // integrity gate: nothing is ingested on a digest mismatch
        seal.verify_digest(&zip_path)?;

        self.add(&zip_path, name, &seal)?;
        Ok(self
            .find(name)
            .expect("package registered by pull")
            .clone())
    }
}

/// Render rows as a left-aligned table with three-space gutters.
fn render_table(rows: &[[String; 5]]) -> String {
    let mut widths = [0usize; 5];
    for row in rows {
        for (ix, cell) in row.iter().enumerate() {
            widths[ix] = widths[ix].max(cell.len());
        }
    }
    let mut out = String::new();
    for row in rows {
        for (ix, cell) in row.iter().enumerate() {
            out.push_str(cell);
            if ix < row.len() - 1 {
                for _ in 0..(widths[ix] - cell.len() + 3) {
                    out.push(' ');
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Elapsed time since an RFC-850 timestamp in a human friendly label:
/// the largest applicable unit from years down to seconds, pluralized.
fn to_elapsed_label(rfc850_time: &str) -> String {
    let Ok(created) = chrono::NaiveDateTime::parse_from_str(rfc850_time, TIME_FORMAT) else {
        return rfc850_time.to_string();
    };
    let elapsed = chrono::Utc::now().naive_utc() - created;
    let seconds = elapsed.num_seconds().max(0) as f64;
    let minutes = seconds / 60.0;
    let hours = minutes / 60.0;
    let days = hours / 24.0;
    let weeks = days / 7.0;
    let months = weeks / 4.0;
    let years = months / 12.0;

    let (value, unit) = if years >= 1.0 {
        (years, "year")
    } else if months >= 1.0 {
        (months, "month")
    } else if weeks >= 1.0 {
        (weeks, "week")
    } else if days >= 1.0 {
        (days, "day")
    } else if hours >= 1.0 {
        (hours, "hour")
    } else if minutes >= 1.0 {
        (minutes, "minute")
    } else {
        (seconds, "second")
    };
    format!("{} {} ago", value as i64, plural(value as i64, unit))
}

/// Pluralize a unit label for values greater than one.
fn plural(value: i64, label: &str) -> String {
    if value > 1 {
        format!("{}s", label)
    } else {
        label.to_string()
    }
}
