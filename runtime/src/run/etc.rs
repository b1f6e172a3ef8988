//! Files RUN provides to every container: hosts, resolv.conf, hostname
//! and `/run/.containerenv`.

use std::collections::BTreeSet;
use std::path::Path;

use a3s_build_core::dns::{generate_hostname_file, generate_hosts_file, generate_resolv_conf};
use a3s_build_core::error::{BuildError, Result};
use oci_spec::runtime::Mount;

use super::spec::mount;
use crate::copier::resolve_in_root;
use crate::define::PACKAGE;

/// What the generated files describe.
pub(crate) struct EtcSettings<'a> {
    pub hostname: &'a str,
    pub add_hosts: &'a [String],
    pub dns_servers: &'a [String],
    pub dns_search: &'a [String],
    pub dns_options: &'a [String],
    pub no_hosts: bool,
    pub no_hostname: bool,
    pub container_name: &'a str,
    pub container_id: &'a str,
    pub image_name: &'a str,
    pub image_id: &'a str,
}

fn parse_add_host(spec: &str) -> Result<(String, String)> {
    match spec.split_once(':') {
        Some((name, ip)) if !name.is_empty() && !ip.is_empty() => {
            Ok((name.to_string(), ip.to_string()))
        }
        _ => Err(BuildError::InvalidArgument(format!(
            "invalid --add-host {:?}: expected host:ip",
            spec
        ))),
    }
}

fn read_optional(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn container_env(settings: &EtcSettings<'_>) -> String {
    let rootless = if nix::unistd::geteuid().is_root() { 0 } else { 1 };
    format!(
        "engine=\"{}-{}\"\nname={:?}\nid={:?}\nimage={:?}\nimageid={:?}\nrootless={}\n",
        PACKAGE,
        env!("CARGO_PKG_VERSION"),
        settings.container_name,
        settings.container_id,
        settings.image_name,
        settings.image_id,
        rootless
    )
}

/// Write the files into `bundle` and return bind mounts for those whose
/// destination is neither a volume nor already mounted.
pub(crate) fn etc_mounts(
    rootfs: &Path,
    bundle: &Path,
    settings: &EtcSettings<'_>,
    occupied: &BTreeSet<String>,
) -> Result<Vec<Mount>> {
    let mut files: Vec<(&str, &str, String)> = Vec::new();
    if !settings.no_hosts {
        let extra = settings
            .add_hosts
            .iter()
            .map(|h| parse_add_host(h))
            .collect::<Result<Vec<_>>>()?;
        let base = resolve_in_root(rootfs, Path::new("/etc/hosts"))
            .ok()
            .and_then(|p| read_optional(&p));
        files.push((
            "/etc/hosts",
            "hosts",
            generate_hosts_file(base.as_deref(), settings.hostname, &extra),
        ));
    }
    let host_resolv = read_optional(Path::new("/etc/resolv.conf"));
    files.push((
        "/etc/resolv.conf",
        "resolv.conf",
        generate_resolv_conf(
            settings.dns_servers,
            settings.dns_search,
            settings.dns_options,
            host_resolv.as_deref(),
        ),
    ));
    if !settings.no_hostname && !settings.hostname.is_empty() {
        files.push((
            "/etc/hostname",
            "hostname",
            generate_hostname_file(settings.hostname),
        ));
    }
    files.push(("/run/.containerenv", "containerenv", container_env(settings)));

    let mut mounts = Vec::new();
    for (destination, name, content) in files {
        if occupied.contains(destination) {
            tracing::debug!(path = destination, "Not providing file under a volume or mount");
            continue;
        }
        let path = bundle.join(name);
        std::fs::write(&path, content).map_err(|e| {
            BuildError::RuntimeError(format!("writing {}: {}", path.display(), e))
        })?;
        mounts.push(mount(destination, "bind", &path, &["rbind", "ro"])?);
    }
    Ok(mounts)
}
