//! The `build.yaml` descriptor
//!
//! A build file declares build-wide environment variables and labels,
//! the input surface (variables and secrets a consumer must supply),
//! an ordered list of build profiles, and an ordered list of functions.
//! It is loaded once per invocation and immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading a build file
#[derive(Debug, Error)]
pub enum BuildFileError {
    #[error("cannot read build file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse build file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("function '{function}' binds {kind} '{binding}' which is not declared in the build file input section")]
    UnboundInput {
        function: String,
        kind: &'static str,
        binding: String,
    },
}

/// Structure of the `build.yaml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildFile {
    /// Technology type of the application (java, golang, ...), carried
    /// into the seal manifest
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,

    /// License of the packaged application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Environment variables available to every profile and function
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Labels copied into the artifact seal
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Input surface exported functions may bind against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Input>,

    /// Container image used to execute exported functions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    /// Ordered build profiles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<Profile>,

    /// Ordered functions, invocable from profiles or other functions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<Function>,
}

impl BuildFile {
    /// Load and validate a build file from disk.
    pub fn load(path: &Path) -> Result<Self, BuildFileError> {
        let bytes = fs::read(path).map_err(|source| BuildFileError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let file: BuildFile =
            serde_yaml::from_slice(&bytes).map_err(|source| BuildFileError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        file.validate()?;
        Ok(file)
    }

    /// Parse a build file from raw YAML bytes (e.g. one found inside a
    /// packaged target).
    pub fn from_yaml(bytes: &[u8], origin: &Path) -> Result<Self, BuildFileError> {
        let file: BuildFile =
            serde_yaml::from_slice(bytes).map_err(|source| BuildFileError::Malformed {
                path: origin.to_path_buf(),
                source,
            })?;
        file.validate()?;
        Ok(file)
    }

    /// Every function input binding must resolve to a declared entry in
    /// the build-file-level input section.
    fn validate(&self) -> Result<(), BuildFileError> {
        for fx in &self.functions {
            let Some(binding) = &fx.input else { continue };
            for var in &binding.var {
                if !self.declares_var(var) {
                    return Err(BuildFileError::UnboundInput {
                        function: fx.name.clone(),
                        kind: "var",
                        binding: var.clone(),
                    });
                }
            }
            for secret in &binding.secret {
                if !self.declares_secret(secret) {
                    return Err(BuildFileError::UnboundInput {
                        function: fx.name.clone(),
                        kind: "secret",
                        binding: secret.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn declares_var(&self, name: &str) -> bool {
        self.input
            .as_ref()
            .map(|i| i.var.iter().any(|v| v.name == name))
            .unwrap_or(false)
    }

    fn declares_secret(&self, name: &str) -> bool {
        self.input
            .as_ref()
            .map(|i| i.secret.iter().any(|s| s.name == name))
            .unwrap_or(false)
    }

    /// The profile flagged as default, if any. When several are flagged
    /// the first one wins.
    pub fn default_profile(&self) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.default)
    }

    /// Find a profile by name.
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Find a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// A named build configuration inside a build file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name
    pub name: String,

    /// Whether this is the default profile
    #[serde(default)]
    pub default: bool,

    /// Labels merged over the build-file labels in the seal
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Environment variables layered over the build-file environment
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Shell commands executed in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<String>,

    /// The build output to package, a file or folder relative to the
    /// execution directory
    #[serde(default)]
    pub target: String,

    /// Runtime image override used when this profile's package exports
    /// functions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    /// Target after environment substitution; computed once by the
    /// builder and reused for packaging, never serialized
    #[serde(skip)]
    pub merged_target: Option<String>,
}

/// A named, optionally exported command sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Function {
    /// Function name
    pub name: String,

    /// What the function does, surfaced in the package manifest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Whether the function is visible as a callable unit in the
    /// produced manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<bool>,

    /// Environment variables layered over the build-file environment
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Shell commands executed in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<String>,

    /// Names of input vars/secrets this function requires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputBinding>,

    /// Runtime image override for this function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl Function {
    /// Whether the function is exported in the package manifest.
    pub fn is_exported(&self) -> bool {
        self.export.unwrap_or(false)
    }
}

/// Input surface declared at build-file level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Input {
    /// Plain variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub var: Vec<Var>,

    /// Secret values, never echoed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret: Vec<Secret>,
}

/// Names of declared inputs a function binds to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputBinding {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub var: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret: Vec<String>,
}

/// A declared input variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Var {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// A declared input secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}
