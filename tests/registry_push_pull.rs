//! Registry push/pull tests against the filesystem backend
//!
//! Exercise the remote protocol semantics (tag movement, metadata
//! updates, seal verification on pull) and the push locking discipline
//! without any network access.

use fabriq::registry::backend::FilesystemBackend;
use fabriq::registry::lock::LockManager;
use fabriq::{Backend, Registry, RegistryError};
use fabriq_model::{manifest::TIME_FORMAT, Manifest, PackageName, Seal};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// A generous lifespan: fresh locks stay fresh for the whole test.
const LIFESPAN: Duration = Duration::from_secs(60);

fn sealed_zip(dir: &Path, stem: &str, content: &[u8]) -> (PathBuf, Seal) {
    let zip_path = dir.join(format!("{}.zip", stem));
    fs::write(&zip_path, content).unwrap();
    let manifest = Manifest {
        ref_name: stem.to_string(),
        profile: "default".to_string(),
        target: "out".to_string(),
        time: chrono::Utc::now().format(TIME_FORMAT).to_string(),
        size: "1KB".to_string(),
        ..Default::default()
    };
    let sum = Seal::checksum(&manifest, &zip_path).unwrap();
    let seal = Seal {
        manifest,
        digest: Seal::encode_digest(&sum),
        signature: String::new(),
    };
    seal.save(&zip_path.with_extension("json")).unwrap();
    (zip_path, seal)
}

struct Fixture {
    _home: TempDir,
    registry: Registry,
    backend: FilesystemBackend,
}

fn fixture() -> Fixture {
    let home = TempDir::new().unwrap();
    let registry = Registry::open(home.path().join("registry")).unwrap();
    let backend = FilesystemBackend::new(home.path().join("remote")).unwrap();
    Fixture {
        _home: home,
        registry,
        backend,
    }
}

fn add_package(f: &mut Fixture, stem: &str, name: &str, content: &[u8]) {
    let scratch = TempDir::new().unwrap();
    let (zip, seal) = sealed_zip(scratch.path(), stem, content);
    let name = PackageName::parse(name).unwrap();
    f.registry.add(&zip, &name, &seal).unwrap();
}

#[test]
fn push_uploads_artifact_seal_and_metadata() {
    let mut f = fixture();
    add_package(&mut f, "ref-1", "tools/app:latest", b"artifact-1");
    let name = PackageName::parse("tools/app:latest").unwrap();

    f.registry
        .push(&name, &f.backend, None, LIFESPAN)
        .unwrap();

    let remote = f.backend.get_repository_info("tools", "app", None).unwrap();
    assert_eq!(remote.packages.len(), 1);
    assert_eq!(remote.packages[0].tags, vec!["latest"]);
    assert_eq!(remote.packages[0].file_ref, "ref-1");

    // pushing the same tag again is a no-op, not an error
    f.registry
        .push(&name, &f.backend, None, LIFESPAN)
        .unwrap();

    // the lock is released after the push
    assert!(!f.registry.locks().is_locked("tools/app"));
}

#[test]
fn push_moves_tag_from_previous_remote_holder() {
    let mut f = fixture();
    add_package(&mut f, "ref-1", "tools/app:latest", b"artifact-1");
    let name = PackageName::parse("tools/app:latest").unwrap();
    f.registry.push(&name, &f.backend, None, LIFESPAN).unwrap();

    // a newer artifact takes over the tag
    add_package(&mut f, "ref-2", "tools/app:latest", b"artifact-2");
    f.registry.push(&name, &f.backend, None, LIFESPAN).unwrap();

    let remote = f.backend.get_repository_info("tools", "app", None).unwrap();
    assert_eq!(remote.packages.len(), 2);
    let old = remote
        .packages
        .iter()
        .find(|p| p.file_ref == "ref-1")
        .unwrap();
    let new = remote
        .packages
        .iter()
        .find(|p| p.file_ref == "ref-2")
        .unwrap();
    // the tag labels exactly one remote package; the old holder stays
    // addressable under its file reference
    assert_eq!(new.tags, vec!["latest"]);
    assert_eq!(old.tags, vec!["ref-1"]);
}

#[test]
fn push_unknown_package_fails() {
    let mut f = fixture();
    let name = PackageName::parse("tools/ghost").unwrap();
    let err = f
        .registry
        .push(&name, &f.backend, None, LIFESPAN)
        .unwrap_err();
    assert!(matches!(err, RegistryError::PackageNotFound(_)));
}

#[test]
fn push_blocked_by_fresh_lock_until_it_expires() {
    let mut f = fixture();
    add_package(&mut f, "ref-1", "tools/app:latest", b"artifact-1");
    let name = PackageName::parse("tools/app:latest").unwrap();

    // another process holds the lock
    let locks = LockManager::new(f.registry.root().join("locks"));
    let guard = locks.acquire("tools/app").unwrap();
    std::mem::forget(guard);

    let err = f
        .registry
        .push(&name, &f.backend, None, LIFESPAN)
        .unwrap_err();
    assert!(matches!(err, RegistryError::PushBlocked { .. }));
    // nothing was uploaded
    let remote = f.backend.get_repository_info("tools", "app", None).unwrap();
    assert!(remote.packages.is_empty());

    // once the lock outlives its lifespan it is taken over
    let short = Duration::from_millis(300);
    std::thread::sleep(Duration::from_millis(400));
    f.registry.push(&name, &f.backend, None, short).unwrap();
    let remote = f.backend.get_repository_info("tools", "app", None).unwrap();
    assert_eq!(remote.packages.len(), 1);
}

#[test]
fn pull_ingests_and_verifies() {
    let mut f = fixture();
    add_package(&mut f, "ref-1", "tools/app:latest", b"artifact-1");
    let name = PackageName::parse("tools/app:latest").unwrap();
    f.registry.push(&name, &f.backend, None, LIFESPAN).unwrap();

    // a second machine pulls from the same remote
    let home2 = TempDir::new().unwrap();
    let mut registry2 = Registry::open(home2.path().join("registry")).unwrap();
    let entry = registry2.pull(&name, &f.backend, None).unwrap();

    assert_eq!(entry.repository, "tools/app");
    assert_eq!(entry.tags, vec!["latest"]);
    assert!(registry2.zip_file(&entry.file_ref).exists());
    assert!(registry2.seal_file(&entry.file_ref).exists());
    assert_eq!(
        fs::read(registry2.zip_file(&entry.file_ref)).unwrap(),
        b"artifact-1"
    );

    // pulling again is a no-op
    let again = registry2.pull(&name, &f.backend, None).unwrap();
    assert_eq!(again.id, entry.id);
    assert_eq!(registry2.packages().len(), 1);
}

#[test]
fn pull_missing_tag_fails() {
    let f = fixture();
    let home = TempDir::new().unwrap();
    let mut fresh = Registry::open(home.path().join("registry")).unwrap();
    let name = PackageName::parse("tools/app:v9").unwrap();
    let err = fresh.pull(&name, &f.backend, None).unwrap_err();
    assert!(matches!(err, RegistryError::RemotePackageNotFound(_)));
}

#[test]
fn pull_rejects_tampered_artifact() {
    let mut f = fixture();
    add_package(&mut f, "ref-1", "tools/app:latest", b"artifact-1");
    let name = PackageName::parse("tools/app:latest").unwrap();
    f.registry.push(&name, &f.backend, None, LIFESPAN).unwrap();

    // corrupt the remote artifact bytes
    let remote_zip = f
        ._home
        .path()
        .join("remote")
        .join("tools")
        .join("app")
        .join("ref-1.zip");
    fs::write(&remote_zip, b"artifact-X").unwrap();

    let home2 = TempDir::new().unwrap();
    let mut registry2 = Registry::open(home2.path().join("registry")).unwrap();
    let err = registry2.pull(&name, &f.backend, None).unwrap_err();
    assert!(matches!(err, RegistryError::Seal(_)), "got: {:?}", err);

    // the tampered bytes were never ingested
    assert!(registry2.packages().is_empty());
}

#[test]
fn pull_existing_artifact_under_new_tag_only_adds_tag() {
    let mut f = fixture();
    add_package(&mut f, "ref-1", "tools/app:latest", b"artifact-1");
    let latest = PackageName::parse("tools/app:latest").unwrap();
    f.registry.push(&latest, &f.backend, None, LIFESPAN).unwrap();

    // remotely the same artifact also carries v1
    let mut remote = f.backend.get_repository_info("tools", "app", None).unwrap();
    remote.packages[0].tags.push("v1".to_string());
    let updated = remote.packages[0].clone();
    f.backend
        .update_package_info("tools", "app", &updated, None)
        .unwrap();

    // the local registry already holds the artifact under latest
    let v1 = PackageName::parse("tools/app:v1").unwrap();
    let entry = f.registry.pull(&v1, &f.backend, None).unwrap();
    assert!(entry.has_tag("latest"));
    assert!(entry.has_tag("v1"));
    assert_eq!(f.registry.packages().len(), 1);
}
