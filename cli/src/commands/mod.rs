//! CLI command definitions and dispatch.

mod add;
mod commit;
mod config;
mod containers;
mod from;
mod images;
mod inspect;
mod mount;
mod rm;
mod run;
mod version;

use std::path::PathBuf;

use a3s_build_core::BuildConfig;
use a3s_build_runtime::{Builder, RetryOptions, Store};
use clap::{Parser, Subcommand};

pub(crate) type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// A3S Build - build container images from working containers.
#[derive(Parser, Debug)]
#[command(name = "a3s-build", version, about)]
pub struct Cli {
    /// Storage root directory
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Per-boot state directory
    #[arg(long, global = true)]
    pub run_root: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Log filter, overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a working container from an image
    From(from::FromArgs),
    /// List working containers
    Containers(containers::ContainersArgs),
    /// Add content, extracting archives and fetching URLs
    Add(add::AddArgs),
    /// Copy content into a container
    Copy(add::AddArgs),
    /// Run a command inside a container
    Run(run::RunArgs),
    /// Create an image from a container
    Commit(commit::CommitArgs),
    /// Update image configuration settings
    Config(config::ConfigArgs),
    /// Mount a container's root filesystem
    Mount(mount::MountArgs),
    /// Unmount a container's root filesystem
    Umount(mount::UmountArgs),
    /// Remove working containers
    Rm(rm::RmArgs),
    /// List images in local storage
    Images(images::ImagesArgs),
    /// Show a container's or image's configuration as JSON
    Inspect(inspect::InspectArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Global configuration with command-line overrides applied.
pub(crate) fn load_config(global: &GlobalArgs) -> Result<BuildConfig, Box<dyn std::error::Error>> {
    let mut config = BuildConfig::load()?;
    if let Some(root) = &global.root {
        config.root = root.clone();
    }
    if let Some(run_root) = &global.run_root {
        config.run_root = run_root.clone();
    }
    Ok(config)
}

/// Flags shared by every command.
#[derive(Debug, Clone, Default)]
pub(crate) struct GlobalArgs {
    pub root: Option<PathBuf>,
    pub run_root: Option<PathBuf>,
}

/// Open the store named by the configuration.
pub(crate) fn open_store(config: &BuildConfig) -> Result<Store, Box<dyn std::error::Error>> {
    Ok(Store::open(config)?)
}

/// Open a working container by name or ID.
pub(crate) fn open_builder(store: &Store, name: &str) -> Result<Builder, Box<dyn std::error::Error>> {
    match Builder::open(store, name) {
        Ok(builder) => Ok(builder),
        Err(e) if e.is_not_found() => Ok(Builder::import(store, name)?),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn retry_options(config: &BuildConfig) -> RetryOptions {
    RetryOptions {
        max_retries: config.max_retries,
        delay: std::time::Duration::from_secs(config.retry_delay_secs),
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> CmdResult {
    tracing::debug!(command = ?cli.command, "Dispatching command");
    let global = GlobalArgs {
        root: cli.root,
        run_root: cli.run_root,
    };
    match cli.command {
        Command::From(args) => from::execute(&global, args).await,
        Command::Containers(args) => containers::execute(&global, args).await,
        Command::Add(args) => add::execute(&global, args, true).await,
        Command::Copy(args) => add::execute(&global, args, false).await,
        Command::Run(args) => run::execute(&global, args).await,
        Command::Commit(args) => commit::execute(&global, args).await,
        Command::Config(args) => config::execute(&global, args).await,
        Command::Mount(args) => mount::execute(&global, args).await,
        Command::Umount(args) => mount::execute_umount(&global, args).await,
        Command::Rm(args) => rm::execute(&global, args).await,
        Command::Images(args) => images::execute(&global, args).await,
        Command::Inspect(args) => inspect::execute(&global, args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "a3s-build",
            "--root",
            "/tmp/store",
            "--log-json",
            "containers",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/store")));
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Containers(_)));
    }

    #[test]
    fn test_parse_copy_and_add() {
        let cli = Cli::try_parse_from([
            "a3s-build",
            "copy",
            "--chown",
            "1000:1000",
            "work",
            "src/",
            "/app/",
        ])
        .unwrap();
        match cli.command {
            Command::Copy(args) => {
                assert_eq!(args.container, "work");
                assert_eq!(args.paths, vec!["src/", "/app/"]);
                assert_eq!(args.chown.as_deref(), Some("1000:1000"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_run_with_separator() {
        let cli = Cli::try_parse_from([
            "a3s-build",
            "run",
            "--isolation",
            "chroot",
            "work",
            "--",
            "sh",
            "-c",
            "echo hi",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.isolation.as_deref(), Some("chroot"));
                assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_commit_flags() {
        let cli = Cli::try_parse_from([
            "a3s-build",
            "commit",
            "--format",
            "docker",
            "--squash",
            "--timestamp",
            "0",
            "work",
            "oci:/tmp/out:v1",
        ])
        .unwrap();
        match cli.command {
            Command::Commit(args) => {
                assert!(args.squash);
                assert_eq!(args.format.as_deref(), Some("docker"));
                assert_eq!(args.timestamp, Some(0));
                assert_eq!(args.image.as_deref(), Some("oci:/tmp/out:v1"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_from_scratch_creates_container() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("root").display().to_string();
        let run_root = dir.path().join("run").display().to_string();
        let args = [
            "a3s-build",
            "--root",
            root.as_str(),
            "--run-root",
            run_root.as_str(),
            "from",
            "--name",
            "work",
            "scratch",
        ];
        dispatch(Cli::try_parse_from(args).unwrap()).await.unwrap();

        let global = GlobalArgs {
            root: Some(dir.path().join("root")),
            run_root: Some(dir.path().join("run")),
        };
        let store = open_store(&load_config(&global).unwrap()).unwrap();
        let builder = open_builder(&store, "work").unwrap();
        assert_eq!(builder.container, "work");
        assert!(builder.from_image.is_empty());
    }

    #[test]
    fn test_missing_container_is_an_error() {
        assert!(Cli::try_parse_from(["a3s-build", "run"]).is_err());
    }
}
