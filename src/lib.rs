//! Fabriq - build, seal and distribute application packages
//!
//! This crate implements the fabriq pipeline: it prepares a source tree
//! (local or cloned from git), executes a build profile from a
//! declarative `build.yaml`, packages the profile target as a zip,
//! computes a signed integrity seal and registers the artifact in a
//! content-addressed local registry, from which packages are pushed to
//! and pulled from pluggable remote backends.

pub mod build;
pub mod registry;
pub mod signing;

pub use build::{BuildError, BuildSpec, Builder};
pub use registry::backend::{Backend, BackendError, Credentials};
pub use registry::{Registry, RegistryError};
pub use signing::{KeyStore, SigningError};
