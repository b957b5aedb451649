//! Build orchestration
//!
//! Drives a build end to end: prepare the source, resolve the effective
//! profile, execute its commands with the layered environment, package
//! the profile target, construct the signed seal and register the
//! artifact in the local registry. Any step failure is fatal to the
//! whole build; the ephemeral working directory is removed on every
//! exit path by the [`WorkDir`](source::WorkDir) drop guard.

pub mod env;
pub mod exec;
pub mod package;
pub mod source;

use chrono::Utc;
use fabriq_model::{
    manifest::TIME_FORMAT, BuildFile, BuildFileError, FxInfo, Manifest, PackageName, Seal,
    SealError, BUILD_FILE_NAME,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::registry::{Registry, RegistryError};
use crate::signing::{self, SigningError};
use env::{Envar, EnvError};
use exec::ExecError;
use package::PackageError;
use source::{SourceError, SourceTree, WorkDir};

/// Maximum function call nesting before a cycle is assumed
pub const MAX_CALL_DEPTH: usize = 32;

/// Polling attempts while waiting for a profile target to appear
const TARGET_WAIT_ATTEMPTS: u32 = 30;

/// Sleep between target polls
const TARGET_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from the build pipeline
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    BuildFile(#[from] BuildFileError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("the build file declares no profiles")]
    NoProfiles,

    #[error("the requested profile '{0}' is not defined in the build file")]
    ProfileNotFound(String),

    #[error("profile '{0}' target not specified, cannot package")]
    TargetMissing(String),

    #[error("profile target '{0}' must be a relative path inside the source root")]
    TargetOutsideRoot(String),

    #[error("target '{0}' not found after command execution")]
    TargetNotCreated(PathBuf),

    #[error("function '{0}' does not exist in the build file")]
    FunctionNotFound(String),

    #[error("function call depth exceeded {MAX_CALL_DEPTH} at '{0}': function calls form a cycle")]
    CallDepthExceeded(String),

    #[error("profile '{0}' exports functions but does not define a runtime image to run them: set the runtime attribute in the build profile or build file")]
    RuntimeRequired(String),
}

/// Everything a build invocation needs.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// Source location: http(s) git URL or filesystem path
    pub from: String,

    /// Sub folder within the source holding the build file
    pub sub_path: Option<String>,

    /// Token for cloning an authenticated repository
    pub git_token: Option<String>,

    /// Name (and tag) to register the package under
    pub name: PackageName,

    /// Profile to build; default/first profile when omitted
    pub profile: Option<String>,

    /// Copy a local source tree before building instead of building in
    /// place
    pub copy_source: bool,

    /// Prompt for missing variables instead of failing
    pub interactive: bool,

    /// Explicit signing key path; the registry key store is used by
    /// convention when omitted
    pub key_path: Option<PathBuf>,
}

/// The build pipeline, operating against one local registry.
pub struct Builder<'a> {
    registry: &'a mut Registry,
}

impl<'a> Builder<'a> {
    /// Create a builder over the given registry.
    pub fn new(registry: &'a mut Registry) -> Self {
        Self { registry }
    }

    /// Run a build end to end and register the produced artifact.
    pub fn build(&mut self, spec: &BuildSpec) -> Result<Seal, BuildError> {
        let work = WorkDir::create(&self.registry.build_area()?)?;
        let tree = source::prepare(
            &work,
            &spec.from,
            spec.sub_path.as_deref(),
            spec.git_token.as_deref(),
            spec.copy_source,
        )?;
        let ref_name = unique_ref(tree.commit.as_deref());
        info!(reference = %ref_name, from = %spec.from, "building {}", spec.name);

        // parent process environment with the build file layer on top
        let mut base = Envar::from_process();
        let vars = eval_subshells(
            &tree.build_file.env,
            &tree.load_from,
            &mut base,
            spec.interactive,
        )?;
        let base = base.append(&vars);

        let mut profile = resolve_profile(&tree.build_file, spec.profile.as_deref())?.clone();
        debug!(profile = %profile.name, "resolved build profile");

        // profile layer, then the build-injected variables
        let mut profile_env = base.clone();
        let vars = eval_subshells(
            &profile.env,
            &tree.load_from,
            &mut profile_env,
            spec.interactive,
        )?;
        let mut profile_env = profile_env.append(&vars);
        for (k, v) in build_vars(&ref_name, &tree, &work, &spec.from) {
            profile_env.set(&k, &v);
        }

        self.run_statements(
            &tree.build_file,
            &profile.run,
            &tree.load_from,
            &mut profile_env,
            spec.interactive,
            0,
        )?;

        if profile.target.is_empty() {
            return Err(BuildError::TargetMissing(profile.name.clone()));
        }
        // merged once, cached for packaging and the seal
        let merged_target = profile_env.merge_placeholders(&profile.target, spec.interactive)?;
        validate_target(&merged_target)?;
        let target_path = tree.load_from.join(&merged_target);
        profile.merged_target = Some(merged_target);
        wait_for_target(&target_path)?;

        let zip_path = work.path().join(format!("{}.zip", ref_name));
        let outcome = package::package_target(&target_path, &tree.source_root, &zip_path)?;

        let seal = self.create_seal(
            spec,
            &tree,
            &profile,
            &ref_name,
            &zip_path,
            &target_path,
            outcome.already_zip,
        )?;
        let seal_path = work.path().join(format!("{}.json", ref_name));
        seal.save(&seal_path)?;

        // registration is the last step: no partial registry state when
        // anything above fails
        self.registry.add(&zip_path, &spec.name, &seal)?;
        Ok(seal)
    }

    /// Run a named function against a source tree, outside a package
    /// build.
    pub fn run_function(
        &mut self,
        path: &str,
        function: &str,
        interactive: bool,
    ) -> Result<(), BuildError> {
        let local = if path.is_empty() { "." } else { path };
        let local = if Path::new(local).is_absolute() {
            PathBuf::from(local)
        } else {
            std::env::current_dir()?.join(local)
        };
        let build_file = BuildFile::load(&local.join(BUILD_FILE_NAME))?;

        let mut env = Envar::from_process();
        let vars = eval_subshells(&build_file.env, &local, &mut env, interactive)?;
        let mut env = env.append(&vars);

        self.call_function(&build_file, function, &local, &mut env, interactive, 0)
    }

    /// Execute run statements with an explicit interpreter loop,
    /// recursing into named functions.
    fn run_statements(
        &mut self,
        build_file: &BuildFile,
        cmds: &[String],
        dir: &Path,
        env: &mut Envar,
        interactive: bool,
        depth: usize,
    ) -> Result<(), BuildError> {
        for cmd in cmds {
            match Statement::parse(cmd) {
                Statement::Shell(shell) => {
                    // a subshell marker is evaluated first and its
                    // captured stdout merged into the outer command
                    let merged = match env::has_subshell(&shell) {
                        Some((marker, subshell)) => {
                            let out =
                                exec::execute_with_output(&subshell, dir, env, interactive)?;
                            shell.replace(&marker, out.trim_end())
                        }
                        None => shell,
                    };
                    exec::execute(&merged, dir, env, interactive)?;
                }
                Statement::FunctionCall(name) => {
                    self.call_function(build_file, &name, dir, env, interactive, depth)?;
                }
            }
        }
        Ok(())
    }

    /// Invoke a function by name with its environment layered over the
    /// caller's, so a function value wins over a profile value for the
    /// same key.
    fn call_function(
        &mut self,
        build_file: &BuildFile,
        name: &str,
        dir: &Path,
        caller_env: &Envar,
        interactive: bool,
        depth: usize,
    ) -> Result<(), BuildError> {
        if depth >= MAX_CALL_DEPTH {
            return Err(BuildError::CallDepthExceeded(name.to_string()));
        }
        let fx = build_file
            .function(name)
            .ok_or_else(|| BuildError::FunctionNotFound(name.to_string()))?;
        debug!(function = %name, depth, "running function");

        let mut fx_env = caller_env.clone();
        let vars = eval_subshells(&fx.env, dir, &mut fx_env, interactive)?;
        let mut fx_env = fx_env.append(&vars);
        self.run_statements(build_file, &fx.run, dir, &mut fx_env, interactive, depth + 1)
    }

    /// Populate the manifest, compute the digest over the manifest JSON
    /// and the zip bytes, and sign it.
    #[allow(clippy::too_many_arguments)]
    fn create_seal(
        &self,
        spec: &BuildSpec,
        tree: &SourceTree,
        profile: &fabriq_model::Profile,
        ref_name: &str,
        zip_path: &Path,
        target_path: &Path,
        already_zip: bool,
    ) -> Result<Seal, BuildError> {
        let merged_target = profile.merged_target.as_deref().unwrap_or(&profile.target);
        let mut labels: std::collections::BTreeMap<String, String> = tree
            .build_file
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &profile.labels {
            labels.insert(k.clone(), v.clone());
        }
        let size = fs::metadata(zip_path)?.len();

        let mut manifest = Manifest {
            app_type: tree.build_file.app_type.clone().unwrap_or_default(),
            license: tree.build_file.license.clone().unwrap_or_default(),
            ref_name: ref_name.to_string(),
            profile: profile.name.clone(),
            labels,
            source: tree.repo_uri.clone(),
            commit: tree.commit.clone().unwrap_or_default(),
            target: Path::new(merged_target)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| merged_target.to_string()),
            time: Utc::now().format(TIME_FORMAT).to_string(),
            size: bytes_to_label(size),
            zip: already_zip,
            os: std::env::consts::OS.to_string(),
            runtime: String::new(),
            functions: Vec::new(),
        };

        // a nested build file makes the package itself buildable: its
        // exported functions become discoverable without unpacking
        let nested_path = target_path.join(BUILD_FILE_NAME);
        if nested_path.is_file() {
            let bytes = fs::read(&nested_path)?;
            let nested = BuildFile::from_yaml(&bytes, &nested_path)?;
            let exported: Vec<&fabriq_model::Function> =
                nested.functions.iter().filter(|f| f.is_exported()).collect();
            if !exported.is_empty() {
                let runtime = profile
                    .runtime
                    .clone()
                    .or_else(|| tree.build_file.runtime.clone())
                    .ok_or_else(|| BuildError::RuntimeRequired(profile.name.clone()))?;
                manifest.runtime = runtime;
            }
            for fx in exported {
                manifest.functions.push(FxInfo {
                    name: fx.name.clone(),
                    description: fx.description.clone(),
                    input: fx.input.clone(),
                    runtime: fx.runtime.clone().unwrap_or_default(),
                });
            }
        }

        let sum = Seal::checksum(&manifest, zip_path)?;
        let key = match &spec.key_path {
            Some(path) => signing::load_signing_key(path)?,
            None => self
                .registry
                .key_store()?
                .signing_key_for(spec.name.group(), spec.name.name())?,
        };
        let signature = signing::sign(&key, &sum);

        Ok(Seal {
            manifest,
            digest: Seal::encode_digest(&sum),
            signature,
        })
    }
}

/// One run entry, classified before execution.
#[derive(Debug, PartialEq, Eq)]
enum Statement {
    /// A shell command, possibly carrying a `$((…))` subshell marker
    Shell(String),
    /// An invocation of a named build-file function, `$(name)`
    FunctionCall(String),
}

impl Statement {
    /// Classify a run entry. The subshell check runs first: `$((…))`
    /// also matches the looser function-call pattern.
    fn parse(cmd: &str) -> Self {
        if env::has_subshell(cmd).is_some() {
            return Self::Shell(cmd.to_string());
        }
        match env::has_function_call(cmd) {
            Some(name) => Self::FunctionCall(name),
            None => Self::Shell(cmd.to_string()),
        }
    }
}

/// Resolve the effective profile: explicit name, the first one flagged
/// default, or the first declared.
fn resolve_profile<'f>(
    build_file: &'f BuildFile,
    name: Option<&str>,
) -> Result<&'f fabriq_model::Profile, BuildError> {
    match name {
        Some(n) => build_file
            .profile(n)
            .ok_or_else(|| BuildError::ProfileNotFound(n.to_string())),
        None => build_file
            .default_profile()
            .or_else(|| build_file.profiles.first())
            .ok_or(BuildError::NoProfiles),
    }
}

/// Evaluate `$((command))` markers in variable values; the captured
/// stdout replaces the marker. Evaluation is single pass, so a value
/// cannot expand into further markers.
fn eval_subshells(
    vars: &HashMap<String, String>,
    dir: &Path,
    env: &mut Envar,
    interactive: bool,
) -> Result<HashMap<String, String>, BuildError> {
    let mut result = HashMap::with_capacity(vars.len());
    for (k, v) in vars {
        let value = match env::has_subshell(v) {
            Some((marker, shell_cmd)) => {
                let out = exec::execute_with_output(&shell_cmd, dir, env, interactive)?;
                v.replace(&marker, out.trim_end())
            }
            None => v.clone(),
        };
        result.insert(k.clone(), value);
    }
    Ok(result)
}

/// Build-injected variables available to every command.
fn build_vars(
    ref_name: &str,
    tree: &SourceTree,
    work: &WorkDir,
    from: &str,
) -> Vec<(String, String)> {
    vec![
        ("FABRIQ_REF".to_string(), ref_name.to_string()),
        (
            "FABRIQ_BUILD_PATH".to_string(),
            tree.load_from.display().to_string(),
        ),
        (
            "FABRIQ_GIT_COMMIT".to_string(),
            tree.commit.clone().unwrap_or_default(),
        ),
        (
            "FABRIQ_WORK_DIR".to_string(),
            work.path().display().to_string(),
        ),
        ("FABRIQ_FROM_URI".to_string(), from.to_string()),
    ]
}

/// Unique build reference: UTC timestamp plus the first ten hex
/// characters of the commit hash when one exists.
fn unique_ref(commit: Option<&str>) -> String {
    let stamp = Utc::now().format("%d%m%y%H%M%S%3f");
    match commit {
        Some(hash) => format!("{}-{}", stamp, &hash[..hash.len().min(10)]),
        None => stamp.to_string(),
    }
}

/// The target must stay inside the source root.
fn validate_target(target: &str) -> Result<(), BuildError> {
    let path = Path::new(target);
    let escapes = target == "."
        || path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
    if escapes {
        return Err(BuildError::TargetOutsideRoot(target.to_string()));
    }
    Ok(())
}

/// Commands may create their output asynchronously; poll for the target
/// with bounded retries.
fn wait_for_target(path: &Path) -> Result<(), BuildError> {
    for _ in 0..TARGET_WAIT_ATTEMPTS {
        if path.exists() {
            return Ok(());
        }
        std::thread::sleep(TARGET_WAIT_INTERVAL);
    }
    Err(BuildError::TargetNotCreated(path.to_path_buf()))
}

/// Human readable byte count, base 1024.
pub fn bytes_to_label(size: u64) -> String {
    const SUFFIXES: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size == 0 {
        return "0B".to_string();
    }
    let mut idx = 0;
    let mut value = size as f64;
    while value >= 1024.0 && idx < SUFFIXES.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{}{}", rounded, SUFFIXES[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_file_with_profiles(yaml: &str) -> BuildFile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_profile_resolution_explicit() {
        let bf = build_file_with_profiles(
            "profiles:\n  - name: a\n  - name: b\n    default: true\n",
        );
        assert_eq!(resolve_profile(&bf, Some("a")).unwrap().name, "a");
        assert!(matches!(
            resolve_profile(&bf, Some("zz")),
            Err(BuildError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn test_profile_resolution_default_then_first() {
        let bf = build_file_with_profiles(
            "profiles:\n  - name: a\n  - name: b\n    default: true\n",
        );
        assert_eq!(resolve_profile(&bf, None).unwrap().name, "b");

        let bf = build_file_with_profiles("profiles:\n  - name: a\n  - name: b\n");
        assert_eq!(resolve_profile(&bf, None).unwrap().name, "a");

        let bf = build_file_with_profiles("env: {}\n");
        assert!(matches!(resolve_profile(&bf, None), Err(BuildError::NoProfiles)));
    }

    #[test]
    fn test_statement_classification() {
        assert_eq!(
            Statement::parse("go build -o bin/app"),
            Statement::Shell("go build -o bin/app".to_string())
        );
        assert_eq!(
            Statement::parse("$(deploy)"),
            Statement::FunctionCall("deploy".to_string())
        );
        // a subshell marker keeps the statement a shell command
        assert_eq!(
            Statement::parse("echo $((git rev-parse HEAD))"),
            Statement::Shell("echo $((git rev-parse HEAD))".to_string())
        );
    }

    #[test]
    fn test_unique_ref_shape() {
        let r = unique_ref(Some("0123456789abcdef"));
        assert!(r.ends_with("-0123456789"));
        let r = unique_ref(None);
        assert!(!r.contains('-'));
        assert_eq!(r.len(), 15);
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("bin/app").is_ok());
        assert!(validate_target(".").is_err());
        assert!(validate_target("../escape").is_err());
        assert!(validate_target("/abs/path").is_err());
        assert!(validate_target("a/./b").is_err());
    }

    #[test]
    fn test_bytes_to_label() {
        assert_eq!(bytes_to_label(0), "0B");
        assert_eq!(bytes_to_label(512), "512B");
        assert_eq!(bytes_to_label(1024), "1KB");
        assert_eq!(bytes_to_label(1536), "1.5KB");
        assert_eq!(bytes_to_label(1024 * 1024), "1MB");
        assert_eq!(bytes_to_label(5 * 1024 * 1024 * 1024), "5GB");
    }

    #[cfg(unix)]
    #[test]
    fn test_eval_subshells_substitutes_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut env = Envar::from_process();
        let vars: HashMap<String, String> =
            [("REV".to_string(), "sha-$((echo abc123))".to_string())].into();
        let merged = eval_subshells(&vars, dir.path(), &mut env, false).unwrap();
        assert_eq!(merged.get("REV").map(String::as_str), Some("sha-abc123"));
    }
}
