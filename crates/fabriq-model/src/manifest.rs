//! Artifact manifest
//!
//! The manifest records the provenance of a built package: where the
//! source came from, which profile built it, when, and which functions
//! the package exports. It is embedded in the seal and is part of the
//! digested byte stream, so every field is covered by the integrity
//! check.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::buildfile::InputBinding;

/// Time format used for the `time` and `created` fields (RFC 850).
pub const TIME_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S UTC";

/// Build provenance for a sealed package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Technology type declared in the build file
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub app_type: String,

    /// License declared in the build file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    /// Unique build reference: UTC timestamp plus truncated commit hash
    #[serde(rename = "ref")]
    pub ref_name: String,

    /// Name of the profile that produced the package
    pub profile: String,

    /// Build-file labels merged with profile labels; ordered so the
    /// manifest bytes, and with them the seal digest, are deterministic
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// URI of the source repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    /// Full commit hash the package was built from, empty when the
    /// source had no git history
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,

    /// The profile target that was packaged (base name)
    pub target: String,

    /// Build time, RFC-850
    pub time: String,

    /// Human readable artifact size (base 1024)
    pub size: String,

    /// Whether the target was already a zip container before packaging;
    /// drives unpack semantics on open
    #[serde(default)]
    pub zip: bool,

    /// Operating system the package was built on
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,

    /// Runtime image used to execute exported functions
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime: String,

    /// Exported function descriptors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FxInfo>,
}

impl Manifest {
    /// Find an exported function by name.
    pub fn function(&self, name: &str) -> Option<&FxInfo> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// An exported function as advertised by the manifest, discoverable
/// without unpacking the artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FxInfo {
    /// Function name
    pub name: String,

    /// Function description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Inputs the caller must supply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputBinding>,

    /// Runtime image override for this function
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime: String,
}
