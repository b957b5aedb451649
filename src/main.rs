//! Fabriq CLI
//!
//! Command wiring only: every operation lives in the library and
//! returns errors; this dispatcher is the single place that terminates
//! the process, printing one descriptive line and exiting non-zero.

use clap::{Args, Parser, Subcommand, ValueEnum};
use fabriq::registry::backend::s3::S3Config;
use fabriq::registry::backend::{FilesystemBackend, Nexus3Backend, S3Backend};
use fabriq::{Backend, BuildSpec, Builder, Credentials, Registry};
use fabriq_model::PackageName;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fabriq")]
#[command(about = "Build, seal and distribute application packages", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a package from a local source tree or a git URL
    Build {
        /// Source: a filesystem path or an http(s) git repository URL
        from: String,

        /// Package name to register, e.g. registry.example.com/tools/app:1.0
        #[arg(short = 't', long)]
        name: String,

        /// Build profile; the default profile when omitted
        #[arg(short, long)]
        profile: Option<String>,

        /// Sub folder within the source holding build.yaml
        #[arg(long)]
        sub_path: Option<String>,

        /// Access token for cloning an authenticated repository
        #[arg(long)]
        git_token: Option<String>,

        /// Copy a local source tree before building instead of building
        /// in place
        #[arg(long)]
        copy: bool,

        /// Prompt for missing variables instead of failing
        #[arg(short, long)]
        interactive: bool,

        /// Signing key file; resolved from the registry key store when
        /// omitted
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// List packages in the local registry
    Ls {
        /// Only print package ids
        #[arg(short, long)]
        quiet: bool,
    },

    /// Remove packages from the local registry by name or id
    Rm {
        /// Package names (name:tag) or id substrings
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Run a build file function against a source tree
    Run {
        /// Function name
        function: String,

        /// Path of the source tree holding build.yaml
        #[arg(default_value = ".")]
        path: String,

        /// Prompt for missing variables instead of failing
        #[arg(short, long)]
        interactive: bool,
    },

    /// Push a package to a remote backend
    Push {
        /// Package name, e.g. registry.example.com/tools/app:1.0
        name: String,

        /// Credentials as USER:PASSWORD
        #[arg(short = 'u', long)]
        user: Option<String>,

        /// Seconds after which a competing push lock is considered
        /// stale and taken over
        #[arg(long, default_value_t = 30)]
        lock_lifespan: u64,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Pull a package from a remote backend
    Pull {
        /// Package name, e.g. registry.example.com/tools/app:1.0
        name: String,

        /// Credentials as USER:PASSWORD
        #[arg(short = 'u', long)]
        user: Option<String>,

        #[command(flatten)]
        backend: BackendArgs,
    },
}

#[derive(Args)]
struct BackendArgs {
    /// Remote backend variant
    #[arg(long, value_enum, default_value_t = BackendKind::Nexus3)]
    backend: BackendKind,

    /// Use plain http and accept self-signed certificates
    #[arg(long)]
    insecure: bool,

    /// Root directory of the filesystem backend
    #[arg(long)]
    fs_path: Option<PathBuf>,

    /// Raw repository name on the Nexus server
    #[arg(long)]
    nexus_repository: Option<String>,

    /// Bucket of the S3 backend
    #[arg(long)]
    s3_bucket: Option<String>,

    /// Region of the S3 backend
    #[arg(long)]
    s3_region: Option<String>,

    /// Custom endpoint for S3-compatible stores
    #[arg(long)]
    s3_endpoint: Option<String>,

    /// Use path-style addressing with the S3 backend
    #[arg(long)]
    s3_path_style: bool,
}

#[derive(ValueEnum, Clone, Copy)]
enum BackendKind {
    Fs,
    Nexus3,
    S3,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FABRIQ_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Commands::Build {
            from,
            name,
            profile,
            sub_path,
            git_token,
            copy,
            interactive,
            key,
        } => {
            let mut registry = Registry::open_default()?;
            let name = PackageName::parse(&name)?;
            let spec = BuildSpec {
                from,
                sub_path,
                git_token,
                name: name.clone(),
                profile,
                copy_source: copy,
                interactive,
                key_path: key,
            };
            let seal = Builder::new(&mut registry).build(&spec)?;
            println!("built {} ({})", name, seal.manifest.ref_name);
        }
        Commands::Ls { quiet } => {
            let registry = Registry::open_default()?;
            if quiet {
                print!("{}", registry.list_quiet());
            } else {
                print!("{}", registry.list());
            }
        }
        Commands::Rm { names } => {
            let mut registry = Registry::open_default()?;
            for line in registry.remove(&names)? {
                println!("{}", line);
            }
        }
        Commands::Run {
            function,
            path,
            interactive,
        } => {
            let mut registry = Registry::open_default()?;
            Builder::new(&mut registry).run_function(&path, &function, interactive)?;
        }
        Commands::Push {
            name,
            user,
            lock_lifespan,
            backend,
        } => {
            let mut registry = Registry::open_default()?;
            let name = PackageName::parse(&name)?;
            let credentials = Credentials::parse(&user.unwrap_or_default())?;
            let backend = make_backend(&backend, &name, &registry, credentials.as_ref())?;
            registry.push(
                &name,
                backend.as_ref(),
                credentials.as_ref(),
                Duration::from_secs(lock_lifespan),
            )?;
            println!("pushed {}", name);
        }
        Commands::Pull {
            name,
            user,
            backend,
        } => {
            let mut registry = Registry::open_default()?;
            let name = PackageName::parse(&name)?;
            let credentials = Credentials::parse(&user.unwrap_or_default())?;
            let backend = make_backend(&backend, &name, &registry, credentials.as_ref())?;
            let entry = registry.pull(&name, backend.as_ref(), credentials.as_ref())?;
            println!("pulled {} ({})", name, entry.short_id());
        }
    }
    Ok(())
}

/// Construct the selected backend. The Nexus domain comes from the
/// package name; the filesystem backend defaults to a `data` directory
/// under the registry root.
fn make_backend(
    args: &BackendArgs,
    name: &PackageName,
    registry: &Registry,
    credentials: Option<&Credentials>,
) -> Result<Box<dyn Backend>, Box<dyn Error>> {
    Ok(match args.backend {
        BackendKind::Fs => {
            let root = args
                .fs_path
                .clone()
                .unwrap_or_else(|| registry.root().join("data"));
            Box::new(FilesystemBackend::new(root)?)
        }
        BackendKind::Nexus3 => {
            let mut backend = Nexus3Backend::new(name.domain(), args.insecure)?;
            if let Some(repository) = &args.nexus_repository {
                backend = backend.with_repository(repository);
            }
            Box::new(backend)
        }
        BackendKind::S3 => {
            let bucket = args
                .s3_bucket
                .clone()
                .ok_or("the s3 backend requires --s3-bucket")?;
            let config = S3Config {
                bucket,
                region: args.s3_region.clone(),
                endpoint: args.s3_endpoint.clone(),
                force_path_style: args.s3_path_style,
            };
            Box::new(S3Backend::new(config, credentials)?)
        }
    })
}
