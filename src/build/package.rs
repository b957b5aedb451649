//! Target packaging
//!
//! Compresses a build profile's target into the zip artifact that gets
//! sealed and registered. Directory targets are walked and compressed,
//! honoring a `.buildignore` file in the source root. File targets are
//! sniffed: a file that is already a zip container (a jar, for
//! instance) is moved into place unchanged and flagged on the manifest,
//! anything else is compressed.
//!
//! Files are moved with a copy-then-delete strategy, never a raw
//! rename: the work area and the registry may sit on different
//! filesystems, notably under container orchestration.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// File listing paths to leave out of a packaged directory
pub const IGNORE_FILE_NAME: &str = ".buildignore";

/// Bytes sniffed to decide whether a file is already compressed
const SNIFF_LEN: usize = 512;

/// Errors from packaging
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("failed to retrieve target to compress '{path}': {source}")]
    TargetUnreadable { path: PathBuf, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// What packaging recorded about the target.
#[derive(Debug, Clone, Copy)]
pub struct PackageOutcome {
    /// The target was a zip container before packaging
    pub already_zip: bool,
}

/// Package `target` into `dest_zip`. `source_root` is where the
/// `.buildignore` file is looked up.
pub fn package_target(
    target: &Path,
    source_root: &Path,
    dest_zip: &Path,
) -> Result<PackageOutcome, PackageError> {
    let info = fs::metadata(target).map_err(|source| PackageError::TargetUnreadable {
        path: target.to_path_buf(),
        source,
    })?;

    if info.is_dir() {
        let ignored = load_ignored(source_root)?;
        zip_dir(target, dest_zip, &ignored)?;
        return Ok(PackageOutcome { already_zip: false });
    }

    if is_zip_container(target)? {
        // already compressed; a non-.zip extension (jar, war) is given
        // the canonical name by moving, the content stays untouched
        move_file(target, dest_zip)?;
        Ok(PackageOutcome { already_zip: true })
    } else {
        zip_file(target, dest_zip)?;
        Ok(PackageOutcome { already_zip: false })
    }
}

/// Read `.buildignore` in the source root: one path per line, `#`
/// starts a comment, the ignore file itself is always excluded. Paths
/// are resolved to absolute form for comparison during the walk.
fn load_ignored(source_root: &Path) -> Result<Vec<PathBuf>, PackageError> {
    let mut ignored = vec![source_root.join(IGNORE_FILE_NAME)];
    let ignore_file = source_root.join(IGNORE_FILE_NAME);
    let Ok(contents) = fs::read_to_string(&ignore_file) else {
        return Ok(ignored);
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let path = Path::new(line);
        if path.is_absolute() {
            ignored.push(path.to_path_buf());
        } else {
            ignored.push(source_root.join(path));
        }
    }
    Ok(ignored)
}

/// Compress a directory. Archive entries are rooted at the directory's
/// base name, mirroring what unpacking should recreate.
fn zip_dir(src_dir: &Path, dest: &Path, ignored: &[PathBuf]) -> Result<(), PackageError> {
    let file = File::create(dest)?;
    let mut zip = ZipWriter::new(file);
    let base = src_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("package"));

    for entry in WalkDir::new(src_dir).follow_links(false) {
        let entry = entry?;
        let path = entry.path();
        if ignored.iter().any(|ig| path.starts_with(ig)) {
            continue;
        }
        let rel = path.strip_prefix(src_dir).expect("walk stays under root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = base.join(rel);
        let name = name.to_string_lossy().replace('\\', "/");
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(entry_mode(path));
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut f = File::open(path)?;
            io::copy(&mut f, &mut zip)?;
        }
    }
    zip.finish()?;
    Ok(())
}

/// Compress a single file.
fn zip_file(src: &Path, dest: &Path) -> Result<(), PackageError> {
    let file = File::create(dest)?;
    let mut zip = ZipWriter::new(file);
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "package".to_string());
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(entry_mode(src));
    zip.start_file(name, options)?;
    let mut f = File::open(src)?;
    io::copy(&mut f, &mut zip)?;
    zip.finish()?;
    Ok(())
}

/// Sniff the first bytes of a file for a zip container signature. The
/// zip local-file, empty-archive and spanned-archive magics all start
/// with `PK`.
fn is_zip_container(path: &Path) -> Result<bool, PackageError> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; SNIFF_LEN];
    let read = file.read(&mut buffer)?;
    Ok(sniff_zip(&buffer[..read]))
}

fn sniff_zip(bytes: &[u8]) -> bool {
    const MAGICS: [[u8; 4]; 3] = [
        [0x50, 0x4b, 0x03, 0x04],
        [0x50, 0x4b, 0x05, 0x06],
        [0x50, 0x4b, 0x07, 0x08],
    ];
    bytes.len() >= 4 && MAGICS.iter().any(|m| bytes[..4] == *m)
}

/// Move a file with copy-then-delete, preserving permissions.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    copy_file(src, dst)?;
    fs::remove_file(src)
}

/// Copy a file and its permissions, syncing the destination.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    writer.sync_all()?;
    let perms = fs::metadata(src)?.permissions();
    fs::set_permissions(dst, perms)
}

#[cfg(unix)]
fn entry_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode())
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn entry_mode(_path: &Path) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn archive_names(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        let archive = ZipArchive::new(file).unwrap();
        archive.file_names().map(String::from).collect()
    }

    #[test]
    fn test_package_directory() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("app"), "binary").unwrap();
        fs::create_dir(target.join("docs")).unwrap();
        fs::write(target.join("docs/readme.md"), "docs").unwrap();

        let dest = dir.path().join("pkg.zip");
        let outcome = package_target(&target, dir.path(), &dest).unwrap();
        assert!(!outcome.already_zip);

        let names = archive_names(&dest);
        assert!(names.iter().any(|n| n == "out/app"));
        assert!(names.iter().any(|n| n == "out/docs/readme.md"));
    }

    #[test]
    fn test_buildignore_honored() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("app"), "binary").unwrap();
        fs::write(target.join("debug.log"), "noise").unwrap();
        fs::write(dir.path().join(IGNORE_FILE_NAME), "# noise\nout/debug.log\n").unwrap();

        let dest = dir.path().join("pkg.zip");
        package_target(&target, dir.path(), &dest).unwrap();

        let names = archive_names(&dest);
        assert!(names.iter().any(|n| n == "out/app"));
        assert!(!names.iter().any(|n| n.contains("debug.log")));
    }

    #[test]
    fn test_package_plain_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("app.bin");
        fs::write(&target, "not a zip at all").unwrap();

        let dest = dir.path().join("pkg.zip");
        let outcome = package_target(&target, dir.path(), &dest).unwrap();
        assert!(!outcome.already_zip);
        assert_eq!(archive_names(&dest), vec!["app.bin"]);
    }

    #[test]
    fn test_package_existing_zip_moved() {
        let dir = TempDir::new().unwrap();
        // build a real zip under a jar-ish name
        let jar = dir.path().join("app.jar");
        {
            let file = File::create(&jar).unwrap();
            let mut zip = ZipWriter::new(file);
            zip.start_file("inner.txt", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"inner").unwrap();
            zip.finish().unwrap();
        }

        let dest = dir.path().join("pkg.zip");
        let outcome = package_target(&jar, dir.path(), &dest).unwrap();
        assert!(outcome.already_zip);
        assert!(!jar.exists(), "source should be moved, not copied");
        assert_eq!(archive_names(&dest), vec!["inner.txt"]);
    }

    #[test]
    fn test_sniff_zip_magic() {
        assert!(sniff_zip(b"PK\x03\x04rest"));
        assert!(sniff_zip(b"PK\x05\x06"));
        assert!(!sniff_zip(b"PLAIN TEXT"));
        assert!(!sniff_zip(b"PK"));
    }

    #[test]
    fn test_move_file_across_dirs() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a/file.txt");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, "payload").unwrap();
        let dst = dir.path().join("b.txt");
        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");
    }
}
