//! RUN: execute a command in a working container.
//!
//! A run generates a runtime configuration from the container's image
//! config and the run's options, resolves `--mount` specifications into
//! mounts plus the resources behind them (secret copies, agent proxies,
//! cache locks and scratch copies), creates any missing mount targets in
//! the rootfs, and then hands the bundle either to an OCI runtime or to
//! the chroot helper. Everything acquired is released in reverse order
//! whether or not the command succeeds.

mod chroot;
mod etc;
mod mounts;
mod oci;
mod spec;
mod ssh;
mod stdio;
mod targets;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::IsTerminal;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use a3s_build_core::config::DEFAULT_CAPABILITIES;
use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::{BuildConfig, IdPair};

use crate::builder::Builder;
use crate::copier::{self, MkdirOptions};
use crate::define::{Isolation, NamespaceOption, NetworkPolicy, TerminalPolicy, PACKAGE};
use crate::store::{self, Store};
use crate::user::{lookup_user, running_in_user_namespace};

pub use chroot::{run_chroot_helper, ChrootRequest, ChrootResponse, CHROOT_HELPER_COMMAND};
pub use mounts::{parse_secret, CacheSharing, RunMount, SecretSource};
pub use spec::{map_hostname, ALL_CAPABILITIES};
pub use ssh::{parse_ssh_source, AgentProxy, Keyring, SshSource};

pub(crate) use targets::read_exclusions;

use chroot::{run_with_chroot, ChrootInvocation};
use etc::{etc_mounts, EtcSettings};
use mounts::{parse_volume, resolve_run_mounts, volume_mounts, MountContext, RunArtifacts};
use oci::{run_with_runtime, RuntimeInvocation};
use spec::{
    effective_capabilities, generate, load_seccomp, lookup_path, parse_device, process_env,
    rlimits, special_mounts, Namespaces, SpecParts,
};
use targets::{create_mount_targets, remove_mount_targets};

/// Options for [`Builder::run`].
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Overrides the image's hostname and the one derived from the
    /// container name
    pub hostname: Option<String>,
    /// Overrides the container's isolation
    pub isolation: Option<Isolation>,
    /// OCI runtime binary; `runc` when empty
    pub runtime: String,
    pub runtime_args: Vec<String>,
    /// Chroot helper binary; located automatically when unset
    pub helper: Option<PathBuf>,
    /// `--mount` specifications
    pub mounts: Vec<String>,
    /// `host:container[:options]` bind mounts
    pub volumes: Vec<String>,
    /// `KEY=value` entries added after the image's
    pub env: Vec<String>,
    /// Overrides the image's user
    pub user: Option<String>,
    /// Overrides the image's working directory
    pub working_dir: Option<String>,
    pub terminal: TerminalPolicy,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
    /// Layered over the container's namespace settings
    pub namespace_options: Vec<NamespaceOption>,
    pub network_policy: Option<NetworkPolicy>,
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    /// Added to the container's devices
    pub devices: Vec<String>,
    pub secrets: BTreeMap<String, SecretSource>,
    pub ssh_sources: BTreeMap<String, SshSource>,
    /// Source of bind and cache mounts without `from`
    pub context_dir: PathBuf,
    pub cache_parent: PathBuf,
    pub tmp_dir: PathBuf,
    /// `name=soft[:hard]` entries
    pub ulimits: Vec<String>,
    pub dns_servers: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_options: Vec<String>,
    /// `host:ip` entries for `/etc/hosts`
    pub add_hosts: Vec<String>,
    pub no_hosts: bool,
    pub no_hostname: bool,
    pub seccomp_profile: Option<PathBuf>,
}

impl RunOptions {
    /// Defaults taken from the global configuration.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            runtime_args: config.runtime_args.clone(),
            cache_parent: config.cache_parent.clone(),
            tmp_dir: config.tmp_dir.clone(),
            ulimits: config.default_ulimits.clone(),
            dns_servers: config.dns_servers.clone(),
            dns_search: config.dns_search.clone(),
            dns_options: config.dns_options.clone(),
            isolation: config.default_isolation.parse().ok(),
            ..Default::default()
        }
    }
}

fn dir_or_temp(dir: &Path) -> PathBuf {
    if dir.as_os_str().is_empty() {
        std::env::temp_dir()
    } else {
        dir.to_path_buf()
    }
}

fn destinations(mounts: &[oci_spec::runtime::Mount]) -> impl Iterator<Item = String> + '_ {
    mounts.iter().map(|m| m.destination().display().to_string())
}

/// Parse `--mount` specifications, numbering SSH agents in order.
fn parse_mounts(specs: &[String], workdir: &str) -> Result<Vec<RunMount>> {
    let mut ssh_index = 0;
    let mut parsed = Vec::with_capacity(specs.len());
    for spec in specs {
        let mount = RunMount::parse(spec, workdir, ssh_index)?;
        if matches!(mount, RunMount::Ssh { .. }) {
            ssh_index += 1;
        }
        parsed.push(mount);
    }
    Ok(parsed)
}

fn write_config(bundle: &Path, spec: &oci_spec::runtime::Spec) -> Result<()> {
    let path = bundle.join("config.json");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| BuildError::RuntimeError(format!("creating {}: {}", path.display(), e)))?;
    serde_json::to_writer_pretty(file, spec)?;
    Ok(())
}

impl Builder {
    /// The command a run with no arguments executes.
    fn default_command(&self) -> Vec<String> {
        let mut command = self.entrypoint().map(<[String]>::to_vec).unwrap_or_default();
        command.extend(self.cmd().map(<[String]>::to_vec).unwrap_or_default());
        command
    }

    /// Run `command` (or the image's entrypoint and command when empty) in
    /// the container. A non-zero exit status is an error.
    pub async fn run(&mut self, store: &Store, command: &[String], options: RunOptions) -> Result<()> {
        let mut options = options;
        let mut args = if command.is_empty() {
            self.default_command()
        } else {
            command.to_vec()
        };
        if args.is_empty() {
            return Err(BuildError::InvalidArgument("no command specified".to_string()));
        }

        let rootfs = self.rootfs(store)?;
        let container_dir = self.container_directory(store);
        let isolation = options.isolation.unwrap_or(self.isolation);
        let network = options.network_policy.unwrap_or(self.network_policy);
        let workdir = options
            .working_dir
            .clone()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| self.work_dir().to_string());
        let workdir = if workdir.is_empty() { "/".to_string() } else { workdir };

        let user_spec = options.user.clone().unwrap_or_else(|| self.user().to_string());
        let mut user = lookup_user(&rootfs, &user_spec)?;
        for group in &self.group_add {
            match group.parse::<u32>() {
                Ok(gid) if !user.additional_gids.contains(&gid) => user.additional_gids.push(gid),
                Ok(_) => {}
                Err(_) => tracing::debug!(group = %group, "Ignoring non-numeric supplemental group"),
            }
        }

        let namespaces = Namespaces::resolve(
            &self.namespace_options,
            &options.namespace_options,
            network,
            isolation,
            &self.id_mappings,
        )?;
        let hostname = if namespaces.is_host("uts") {
            nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            match options.hostname.clone().filter(|h| !h.is_empty()) {
                Some(name) => name,
                None if !self.hostname().is_empty() => self.hostname().to_string(),
                None => map_hostname(&self.container, &self.container_id),
            }
        };

        let tmp_dir = dir_or_temp(&options.tmp_dir);
        let bundle = tempfile::Builder::new()
            .prefix(&format!("{}-run-", PACKAGE))
            .tempdir_in(&tmp_dir)
            .map_err(|e| {
                BuildError::RuntimeError(format!("creating bundle in {}: {}", tmp_dir.display(), e))
            })?;

        let parsed = parse_mounts(&options.mounts, &workdir)?;
        let mut artifacts = RunArtifacts::default();
        let cache_parent = dir_or_temp(&options.cache_parent);
        let context_dir = if options.context_dir.as_os_str().is_empty() {
            std::env::current_dir()?
        } else {
            options.context_dir.clone()
        };
        let ctx = MountContext {
            store,
            container_dir: &container_dir,
            context_dir: &context_dir,
            tmp_dir: &tmp_dir,
            cache_parent: &cache_parent,
            id_mappings: &namespaces.id_mappings,
            secrets: &options.secrets,
            ssh_sources: &options.ssh_sources,
        };
        let resolved = resolve_run_mounts(&ctx, &parsed, &mut artifacts)?;

        let mut env = process_env(&self.config.config.env, &options.env, &hostname);
        args[0] = lookup_path(&rootfs, &args[0], &env);
        env.extend(resolved.env.iter().cloned());

        let volumes = options
            .volumes
            .iter()
            .map(|v| parse_volume(v))
            .collect::<Result<Vec<_>>>()?;
        let mut covered: BTreeSet<String> = destinations(&resolved.mounts)
            .chain(destinations(&volumes))
            .collect();
        let builtin = volume_mounts(&rootfs, &container_dir, &self.config.config.volumes, &covered)?;
        covered.extend(destinations(&builtin));
        covered.extend(
            self.config
                .config
                .volumes
                .iter()
                .map(|v| copier::clean_path(&Path::new("/").join(v)).display().to_string()),
        );

        let image_name = self.from_image.clone();
        let etc = etc_mounts(
            &rootfs,
            bundle.path(),
            &EtcSettings {
                hostname: &hostname,
                add_hosts: &options.add_hosts,
                dns_servers: &options.dns_servers,
                dns_search: &options.dns_search,
                dns_options: &options.dns_options,
                no_hosts: options.no_hosts,
                no_hostname: options.no_hostname,
                container_name: &self.container,
                container_id: &self.container_id,
                image_name: &image_name,
                image_id: &self.from_image_id,
            },
            &covered,
        )?;

        let mut all_mounts = special_mounts(&namespaces)?;
        all_mounts.extend(builtin);
        all_mounts.extend(volumes);
        all_mounts.extend(etc);
        all_mounts.extend(resolved.mounts);

        let defaults: Vec<String> = if self.capabilities.is_empty() {
            DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect()
        } else {
            self.capabilities.clone()
        };
        let capabilities = effective_capabilities(
            &defaults,
            &options.add_capabilities,
            &options.drop_capabilities,
        )?;
        let devices = self
            .devices
            .iter()
            .chain(&options.devices)
            .map(|d| parse_device(d))
            .collect::<Result<Vec<_>>>()?;
        let seccomp = options.seccomp_profile.as_deref().map(load_seccomp).transpose()?;
        let terminal = match options.terminal {
            TerminalPolicy::Enabled => true,
            TerminalPolicy::Disabled => false,
            TerminalPolicy::Default => options.stdin.is_none() && std::io::stdin().is_terminal(),
        };

        let spec = generate(SpecParts {
            rootfs: &rootfs,
            args: args.clone(),
            env,
            cwd: workdir.clone(),
            user: &user,
            terminal,
            hostname,
            namespaces: &namespaces,
            capabilities,
            rlimits: rlimits(&options.ulimits)?,
            mounts: all_mounts,
            devices: &devices,
            in_user_namespace: running_in_user_namespace() || namespaces.is_private("user"),
            seccomp,
        })?;

        let mount_list = spec.mounts().clone().unwrap_or_default();
        let targets = create_mount_targets(&rootfs, &container_dir, &mount_list, &namespaces.id_mappings)?;
        let outcome = self
            .execute(&rootfs, bundle.path(), spec, &user, &workdir, isolation, &namespaces, terminal, &mut options)
            .await;
        remove_mount_targets(&rootfs, &targets, &namespaces.id_mappings);
        tracing::debug!(resources = artifacts.len(), "Releasing run resources");
        drop(artifacts);

        let code = outcome?;
        if code != 0 {
            return Err(BuildError::RuntimeError(format!(
                "{:?} exited with status {}",
                args.join(" "),
                code
            )));
        }
        tracing::info!(container = %self.container, command = ?args, "Run completed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        rootfs: &Path,
        bundle: &Path,
        spec: oci_spec::runtime::Spec,
        user: &crate::user::ExecUser,
        workdir: &str,
        isolation: Isolation,
        namespaces: &Namespaces,
        terminal: bool,
        options: &mut RunOptions,
    ) -> Result<i32> {
        copier::mkdir(
            rootfs,
            Path::new(workdir),
            &MkdirOptions {
                id_mappings: namespaces.id_mappings.clone(),
                mod_time_new: None,
                chown_new: Some(IdPair::new(user.uid, user.gid)),
                chmod_new: Some(0o755),
            },
        )?;
        write_config(bundle, &spec)?;

        tracing::info!(
            container = %self.container,
            isolation = %isolation,
            terminal,
            "Running command"
        );
        match isolation {
            Isolation::Chroot => {
                run_with_chroot(ChrootInvocation {
                    helper: options.helper.as_deref(),
                    bundle,
                    spec,
                    stdin: options.stdin.take(),
                    stdout: options.stdout.take(),
                    stderr: options.stderr.take(),
                })
                .await
            }
            Isolation::Oci | Isolation::Rootless => {
                let runtime = if options.runtime.is_empty() {
                    "runc".to_string()
                } else {
                    options.runtime.clone()
                };
                run_with_runtime(RuntimeInvocation {
                    runtime: &runtime,
                    runtime_args: &options.runtime_args,
                    bundle,
                    name: format!("{}-{}", PACKAGE, &store::random_id()[..12]),
                    terminal,
                    stdin: options.stdin.take(),
                    stdout: options.stdout.take(),
                    stderr: options.stderr.take(),
                })
                .await
            }
        }
    }
}
