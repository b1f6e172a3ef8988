//! `a3s-build run` command.

use std::path::PathBuf;

use a3s_build_core::BuildError;
use a3s_build_runtime::run::{parse_secret, parse_ssh_source};
use a3s_build_runtime::{NamespaceOption, NetworkPolicy, RunOptions, TerminalPolicy};
use clap::Args;

use super::{load_config, open_builder, open_store, CmdResult, GlobalArgs};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Working container name or ID
    pub container: String,

    /// Command and arguments; the image's command when empty
    #[arg(last = true)]
    pub command: Vec<String>,

    /// Isolation: oci, chroot or rootless
    #[arg(long)]
    pub isolation: Option<String>,

    /// OCI runtime binary
    #[arg(long)]
    pub runtime: Option<String>,

    /// Mount specification, `type=bind|cache|tmpfs|secret|ssh,...`
    #[arg(long)]
    pub mount: Vec<String>,

    /// Bind mount `host:container[:options]`
    #[arg(short, long)]
    pub volume: Vec<String>,

    /// `KEY=value` added to the environment
    #[arg(short, long)]
    pub env: Vec<String>,

    /// User to run as
    #[arg(short, long)]
    pub user: Option<String>,

    /// Working directory
    #[arg(long)]
    pub workingdir: Option<String>,

    /// Hostname inside the container
    #[arg(long)]
    pub hostname: Option<String>,

    /// Network: host, none or private
    #[arg(long)]
    pub network: Option<String>,

    /// Allocate a terminal
    #[arg(short, long)]
    pub tty: bool,

    /// Capabilities to add
    #[arg(long = "cap-add")]
    pub cap_add: Vec<String>,

    /// Capabilities to drop
    #[arg(long = "cap-drop")]
    pub cap_drop: Vec<String>,

    /// Devices to add
    #[arg(long)]
    pub device: Vec<String>,

    /// Secret `id=<id>,src=<path>` or `id=<id>,env=<var>`
    #[arg(long)]
    pub secret: Vec<String>,

    /// SSH agent `default|<id>[=<socket>|<keyfile>[,<keyfile>...]]`
    #[arg(long)]
    pub ssh: Vec<String>,

    /// Directory that bind and cache mounts without `from` read from
    #[arg(long = "contextdir")]
    pub context_dir: Option<PathBuf>,

    /// `host:ip` entries for /etc/hosts
    #[arg(long = "add-host")]
    pub add_host: Vec<String>,

    /// Do not generate /etc/hosts
    #[arg(long)]
    pub no_hosts: bool,

    /// Do not generate /etc/hostname
    #[arg(long)]
    pub no_hostname: bool,

    /// Resource limit `name=soft[:hard]`
    #[arg(long)]
    pub ulimit: Vec<String>,
}

fn network(spec: &str) -> Result<(NetworkPolicy, Vec<NamespaceOption>), BuildError> {
    match spec {
        "host" => Ok((NetworkPolicy::Enabled, vec![NamespaceOption::host("network")])),
        "none" => Ok((NetworkPolicy::Disabled, vec![NamespaceOption::private("network")])),
        "private" => Ok((NetworkPolicy::Enabled, vec![NamespaceOption::private("network")])),
        other => Err(BuildError::InvalidArgument(format!(
            "unsupported network {:?}",
            other
        ))),
    }
}

pub async fn execute(global: &GlobalArgs, args: RunArgs) -> CmdResult {
    let config = load_config(global)?;
    let store = open_store(&config)?;
    let mut builder = open_builder(&store, &args.container)?;

    let mut options = RunOptions::from_config(&config);
    if let Some(isolation) = &args.isolation {
        options.isolation = Some(isolation.parse()?);
    }
    if let Some(runtime) = args.runtime {
        options.runtime = runtime;
    }
    if let Some(spec) = &args.network {
        let (policy, namespaces) = network(spec)?;
        options.network_policy = Some(policy);
        options.namespace_options = namespaces;
    }
    for spec in &args.secret {
        let (id, source) = parse_secret(spec)?;
        options.secrets.insert(id, source);
    }
    for spec in &args.ssh {
        let (id, source) = parse_ssh_source(spec, |k| std::env::var(k).ok())?;
        options.ssh_sources.insert(id, source);
    }
    options.mounts = args.mount;
    options.volumes = args.volume;
    options.env = args.env;
    options.user = args.user;
    options.working_dir = args.workingdir;
    options.hostname = args.hostname;
    options.terminal = if args.tty {
        TerminalPolicy::Enabled
    } else {
        TerminalPolicy::Default
    };
    options.add_capabilities = args.cap_add;
    options.drop_capabilities = args.cap_drop;
    options.devices = args.device;
    options.context_dir = match args.context_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    options.add_hosts = args.add_host;
    options.no_hosts = args.no_hosts;
    options.no_hostname = args.no_hostname;
    options.ulimits.extend(args.ulimit);

    let command = args.command.clone();
    builder.run(&store, &command, options).await?;
    builder.set_created_by(&format!("/bin/sh -c {}", command.join(" ")));
    builder.save(&store)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_spec() {
        let (policy, ns) = network("none").unwrap();
        assert_eq!(policy, NetworkPolicy::Disabled);
        assert!(!ns[0].host);
        let (_, ns) = network("host").unwrap();
        assert!(ns[0].host);
        assert!(network("bridge").is_err());
    }
}
