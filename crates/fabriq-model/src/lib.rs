//! Fabriq data model
//!
//! Defines the types shared between the build pipeline, the local
//! registry and the remote backends: package names, the `build.yaml`
//! descriptor, the artifact manifest and seal, and the repository
//! catalogue exchanged with remotes.

pub mod buildfile;
pub mod manifest;
pub mod name;
pub mod repository;
pub mod seal;

pub use buildfile::{BuildFile, BuildFileError, Function, Input, InputBinding, Profile};
pub use manifest::{FxInfo, Manifest};
pub use name::{NameError, PackageName};
pub use repository::{PackageEntry, Repository};
pub use seal::{Seal, SealError};

/// File name of the build descriptor looked up in a source tree.
pub const BUILD_FILE_NAME: &str = "build.yaml";

/// Tag applied when a package name does not carry one.
pub const DEFAULT_TAG: &str = "latest";

/// Domain used when a package name does not carry one.
pub const DEFAULT_DOMAIN: &str = "fabriq.library";

/// Group used when a package name does not carry one.
pub const DEFAULT_GROUP: &str = "library";
