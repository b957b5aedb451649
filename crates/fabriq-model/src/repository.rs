//! Registry catalogue types
//!
//! `Repository` is the metadata document exchanged with remote backends
//! (`repository.json` for one `group/name`); `PackageEntry` is one
//! registered package within it. The local registry reuses the same
//! entry type in its flat catalogue.

use serde::{Deserialize, Serialize};

/// Metadata for one remote repository (`group/name`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repository {
    /// `group/name`, no domain, no tag
    pub repository: String,

    /// Packages pushed to this repository, in insertion order
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
}

impl Repository {
    /// An empty repository document for `group/name`.
    pub fn empty(group: &str, name: &str) -> Self {
        Self {
            repository: format!("{}/{}", group, name),
            packages: Vec::new(),
        }
    }

    /// Find a package by its full or partial id.
    pub fn find_package(&self, id: &str) -> Option<&PackageEntry> {
        self.packages.iter().find(|p| p.id.contains(id))
    }

    /// Find the package currently holding a tag.
    pub fn find_by_tag(&self, tag: &str) -> Option<&PackageEntry> {
        self.packages.iter().find(|p| p.has_tag(tag))
    }

    /// Replace the stored entry with the same id. Returns false when no
    /// entry matches.
    pub fn update_package(&mut self, package: &PackageEntry) -> bool {
        for p in self.packages.iter_mut() {
            if p.id == package.id {
                *p = package.clone();
                return true;
            }
        }
        false
    }

    /// Insert the entry, or replace an existing one with the same id.
    pub fn upsert_package(&mut self, package: &PackageEntry) {
        if !self.update_package(package) {
            self.packages.push(package.clone());
        }
    }

    /// Drop the entry with the given id.
    pub fn remove_package(&mut self, id: &str) {
        self.packages.retain(|p| p.id != id);
    }
}

/// A registered package: a content-addressed artifact plus its tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageEntry {
    /// Content address: the seal digest of the package
    pub id: String,

    /// `group/name` of the owning repository
    pub repository: String,

    /// Base file name (no extension) of the zip/seal pair
    pub file_ref: String,

    /// Tags labelling this package, insertion order
    #[serde(default)]
    pub tags: Vec<String>,

    /// Human readable size, copied from the manifest
    pub size: String,

    /// Creation time, RFC-850, copied from the manifest
    pub created: String,
}

impl PackageEntry {
    /// Whether the entry carries the tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Remove a tag if present.
    pub fn remove_tag(&mut self, tag: &str) {
        self.tags.retain(|t| t != tag);
    }

    /// A dangling entry lost all its tags to later pushes.
    pub fn is_dangling(&self) -> bool {
        self.tags.is_empty()
    }

    /// Shortened id used in listings.
    pub fn short_id(&self) -> &str {
        if self.id.len() >= 12 {
            &self.id[..12]
        } else {
            &self.id
        }
    }
}
