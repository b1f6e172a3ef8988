//! OCI runtime configuration for RUN.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::IdMappings;
use oci_spec::runtime::{
    LinuxBuilder, LinuxCapabilities, LinuxDevice, LinuxDeviceCgroup, LinuxIdMapping,
    LinuxIdMappingBuilder, LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType,
    LinuxResourcesBuilder, LinuxSeccomp, Mount, MountBuilder, PosixRlimit, ProcessBuilder,
    RootBuilder, Spec, UserBuilder,
};
use regex::Regex;

use crate::copier::{join_under, resolve_in_root};
use crate::define::{Isolation, NamespaceOption, NetworkPolicy, DEFAULT_PATH};
use crate::user::ExecUser;

/// Every capability a RUN process may be granted.
pub const ALL_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

/// Namespace kinds, in the order they appear in generated configurations.
pub(crate) const NAMESPACE_KINDS: &[&str] =
    &["cgroup", "ipc", "mount", "network", "pid", "user", "uts"];

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/sys/firmware",
    "/sys/fs/selinux",
    "/sys/dev/block",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

const HOST_NAME_MAX: usize = 64;

fn spec_error(what: &str, e: impl std::fmt::Display) -> BuildError {
    BuildError::RuntimeError(format!("building {}: {}", what, e))
}

fn normalize_capability(name: &str) -> Result<String> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    if ALL_CAPABILITIES.contains(&full.as_str()) {
        Ok(full)
    } else {
        Err(BuildError::InvalidArgument(format!(
            "unrecognized capability {:?}",
            name
        )))
    }
}

/// Start from `defaults`, add `add`, then remove `drop`. `ALL` in either
/// list stands for every capability.
pub(crate) fn effective_capabilities(
    defaults: &[String],
    add: &[String],
    drop: &[String],
) -> Result<Vec<String>> {
    let mut caps: BTreeSet<String> = BTreeSet::new();
    for cap in defaults {
        caps.insert(normalize_capability(cap)?);
    }
    for cap in add {
        if cap.eq_ignore_ascii_case("all") {
            caps.extend(ALL_CAPABILITIES.iter().map(|c| c.to_string()));
        } else {
            caps.insert(normalize_capability(cap)?);
        }
    }
    for cap in drop {
        if cap.eq_ignore_ascii_case("all") {
            caps.clear();
        } else {
            caps.remove(&normalize_capability(cap)?);
        }
    }
    Ok(caps.into_iter().collect())
}

/// Capability sets for a process. Processes that don't run as root only
/// keep the bounding set.
fn oci_capabilities(caps: &[String], root: bool) -> Result<LinuxCapabilities> {
    let granted = if root { caps.to_vec() } else { Vec::new() };
    let value = serde_json::json!({
        "bounding": caps,
        "effective": granted,
        "permitted": granted,
        "inheritable": [],
        "ambient": [],
    });
    serde_json::from_value(value).map_err(|e| spec_error("capability sets", e))
}

/// Turn a container name into a usable hostname, falling back to the
/// short form of the container ID.
pub fn map_hostname(name: &str, id: &str) -> String {
    let pattern = Regex::new("[A-Za-z0-9][A-Za-z0-9.-]+").ok();
    let matched = pattern
        .as_ref()
        .and_then(|re| re.find(name))
        .map(|m| m.as_str().to_string());
    match matched {
        Some(host) => host.chars().take(HOST_NAME_MAX).collect(),
        None => id.chars().take(12).collect(),
    }
}

fn rlimit_value(raw: &str, spec: &str) -> Result<u64> {
    if raw == "unlimited" || raw == "-1" {
        return Ok(u64::MAX);
    }
    raw.parse::<u64>()
        .map_err(|_| BuildError::InvalidArgument(format!("invalid ulimit {:?}", spec)))
}

/// Parse `name=soft[:hard]`.
pub(crate) fn parse_ulimit(spec: &str) -> Result<(String, u64, u64)> {
    let (name, values) = spec
        .split_once('=')
        .ok_or_else(|| BuildError::InvalidArgument(format!("invalid ulimit {:?}", spec)))?;
    let name = name.trim().to_ascii_lowercase();
    let known = [
        "as", "core", "cpu", "data", "fsize", "locks", "memlock", "msgqueue", "nice", "nofile",
        "nproc", "rss", "rtprio", "rttime", "sigpending", "stack",
    ];
    if !known.contains(&name.as_str()) {
        return Err(BuildError::InvalidArgument(format!(
            "unrecognized ulimit {:?}",
            name
        )));
    }
    let (soft, hard) = match values.split_once(':') {
        Some((s, h)) => (rlimit_value(s, spec)?, rlimit_value(h, spec)?),
        None => {
            let v = rlimit_value(values, spec)?;
            (v, v)
        }
    };
    if soft > hard {
        return Err(BuildError::InvalidArgument(format!(
            "ulimit {:?}: soft limit exceeds hard limit",
            spec
        )));
    }
    Ok((name, soft, hard))
}

fn host_hard_limit(resource: nix::sys::resource::Resource) -> u64 {
    match nix::sys::resource::getrlimit(resource) {
        Ok((_, hard)) => hard,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read host rlimit, using 1048576");
            1_048_576
        }
    }
}

/// Rlimits for a process; `nofile` and `nproc` default to the host's hard
/// limits.
pub(crate) fn rlimits(ulimits: &[String]) -> Result<Vec<PosixRlimit>> {
    let mut limits: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for spec in ulimits {
        let (name, soft, hard) = parse_ulimit(spec)?;
        limits.insert(name, (soft, hard));
    }
    use nix::sys::resource::Resource;
    limits.entry("nofile".to_string()).or_insert_with(|| {
        let hard = host_hard_limit(Resource::RLIMIT_NOFILE);
        (hard, hard)
    });
    limits.entry("nproc".to_string()).or_insert_with(|| {
        let hard = host_hard_limit(Resource::RLIMIT_NPROC);
        (hard, hard)
    });
    limits
        .into_iter()
        .map(|(name, (soft, hard))| {
            let value = serde_json::json!({
                "type": format!("RLIMIT_{}", name.to_ascii_uppercase()),
                "soft": soft,
                "hard": hard,
            });
            serde_json::from_value(value).map_err(|e| spec_error("rlimits", e))
        })
        .collect()
}

/// A `/dev/src[:/dev/dst[:perm]]` device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceSpec {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub permissions: String,
}

pub(crate) fn parse_device(spec: &str) -> Result<DeviceSpec> {
    let parts: Vec<&str> = spec.split(':').collect();
    let invalid = || BuildError::InvalidArgument(format!("invalid device specification {:?}", spec));
    let is_perm = |s: &str| !s.is_empty() && s.chars().all(|c| matches!(c, 'r' | 'w' | 'm'));
    let (source, destination, permissions) = match parts.as_slice() {
        [src] => (*src, *src, "rwm"),
        [src, second] if is_perm(second) => (*src, *src, *second),
        [src, dst] => (*src, *dst, "rwm"),
        [src, dst, perm] if is_perm(perm) => (*src, *dst, *perm),
        _ => return Err(invalid()),
    };
    if !source.starts_with('/') || !destination.starts_with('/') {
        return Err(invalid());
    }
    Ok(DeviceSpec {
        source: PathBuf::from(source),
        destination: PathBuf::from(destination),
        permissions: permissions.to_string(),
    })
}

/// Look up a host device node and describe it for the runtime.
fn device_entry(spec: &DeviceSpec) -> Result<(LinuxDevice, LinuxDeviceCgroup)> {
    let st = nix::sys::stat::stat(&spec.source).map_err(|e| {
        BuildError::InvalidArgument(format!("device {}: {}", spec.source.display(), e))
    })?;
    let kind = match st.st_mode & libc::S_IFMT {
        libc::S_IFCHR => "c",
        libc::S_IFBLK => "b",
        _ => {
            return Err(BuildError::InvalidArgument(format!(
                "{} is not a device node",
                spec.source.display()
            )))
        }
    };
    let major = nix::sys::stat::major(st.st_rdev) as i64;
    let minor = nix::sys::stat::minor(st.st_rdev) as i64;
    let device = serde_json::json!({
        "path": spec.destination,
        "type": kind,
        "major": major,
        "minor": minor,
        "fileMode": st.st_mode & 0o777,
        "uid": st.st_uid,
        "gid": st.st_gid,
    });
    let rule = serde_json::json!({
        "allow": true,
        "type": kind,
        "major": major,
        "minor": minor,
        "access": spec.permissions,
    });
    Ok((
        serde_json::from_value(device).map_err(|e| spec_error("device", e))?,
        serde_json::from_value(rule).map_err(|e| spec_error("device rule", e))?,
    ))
}

/// Resolved namespace settings for one run.
#[derive(Debug, Clone, Default)]
pub(crate) struct Namespaces {
    entries: BTreeMap<String, NamespaceOption>,
    pub id_mappings: IdMappings,
}

fn canonical_namespace(name: &str) -> Result<&'static str> {
    match name {
        "net" | "network" => Ok("network"),
        "mnt" | "mount" => Ok("mount"),
        other => NAMESPACE_KINDS
            .iter()
            .find(|k| **k == other)
            .copied()
            .ok_or_else(|| BuildError::InvalidArgument(format!("unknown namespace {:?}", other))),
    }
}

impl Namespaces {
    /// Layer run-time settings over the container's own. The network
    /// namespace is private only when networking is disabled; chroot runs
    /// always share the host network.
    pub fn resolve(
        container: &[NamespaceOption],
        run: &[NamespaceOption],
        network: NetworkPolicy,
        isolation: Isolation,
        id_mappings: &IdMappings,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for kind in NAMESPACE_KINDS {
            let option = match *kind {
                "user" => NamespaceOption::host("user"),
                "network" if network != NetworkPolicy::Disabled => NamespaceOption::host("network"),
                other => NamespaceOption::private(other),
            };
            entries.insert(kind.to_string(), option);
        }
        for option in container.iter().chain(run) {
            let kind = canonical_namespace(&option.name)?;
            entries.insert(
                kind.to_string(),
                NamespaceOption {
                    name: kind.to_string(),
                    ..option.clone()
                },
            );
        }

        let mut mappings = id_mappings.clone();
        if isolation == Isolation::Rootless && mappings.uid_map.is_empty() {
            let uid = nix::unistd::geteuid().as_raw();
            let gid = nix::unistd::getegid().as_raw();
            mappings = IdMappings::new(
                vec![a3s_build_core::IdMap::new(0, uid, 1)],
                vec![a3s_build_core::IdMap::new(0, gid, 1)],
            );
        }
        if !mappings.uid_map.is_empty() || !mappings.gid_map.is_empty() {
            entries.insert("user".to_string(), NamespaceOption::private("user"));
        }
        if isolation == Isolation::Chroot {
            entries.insert("network".to_string(), NamespaceOption::host("network"));
            entries.insert("pid".to_string(), NamespaceOption::host("pid"));
            entries.insert("cgroup".to_string(), NamespaceOption::host("cgroup"));
            entries.insert("user".to_string(), NamespaceOption::host("user"));
        }

        let ns = Self {
            entries,
            id_mappings: mappings,
        };
        if ns.is_host("pid") && ns.is_private("user") {
            return Err(BuildError::InvalidArgument(
                "the host PID namespace can't be used with a private user namespace".to_string(),
            ));
        }
        Ok(ns)
    }

    pub fn is_host(&self, kind: &str) -> bool {
        self.entries.get(kind).map(|o| o.host).unwrap_or(true)
    }

    pub fn is_private(&self, kind: &str) -> bool {
        !self.is_host(kind)
    }

    fn to_oci(&self) -> Result<Vec<LinuxNamespace>> {
        let mut out = Vec::new();
        for option in self.entries.values().filter(|o| !o.host) {
            let typ = match option.name.as_str() {
                "cgroup" => LinuxNamespaceType::Cgroup,
                "ipc" => LinuxNamespaceType::Ipc,
                "mount" => LinuxNamespaceType::Mount,
                "network" => LinuxNamespaceType::Network,
                "pid" => LinuxNamespaceType::Pid,
                "user" => LinuxNamespaceType::User,
                _ => LinuxNamespaceType::Uts,
            };
            let mut builder = LinuxNamespaceBuilder::default().typ(typ);
            if let Some(path) = &option.path {
                builder = builder.path(PathBuf::from(path));
            }
            out.push(builder.build().map_err(|e| spec_error("namespace", e))?);
        }
        Ok(out)
    }
}

fn id_mappings_to_oci(maps: &[a3s_build_core::IdMap]) -> Result<Vec<LinuxIdMapping>> {
    maps.iter()
        .map(|m| {
            LinuxIdMappingBuilder::default()
                .container_id(m.container_id)
                .host_id(m.host_id)
                .size(m.size)
                .build()
                .map_err(|e| spec_error("ID mapping", e))
        })
        .collect()
}

pub(crate) fn mount(destination: &str, typ: &str, source: &Path, options: &[&str]) -> Result<Mount> {
    MountBuilder::default()
        .destination(PathBuf::from(destination))
        .typ(typ.to_string())
        .source(source.to_path_buf())
        .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
        .build()
        .map_err(|e| spec_error("mount", e))
}

/// The kernel filesystems every container gets.
pub(crate) fn special_mounts(ns: &Namespaces) -> Result<Vec<Mount>> {
    let mut mounts = vec![
        mount("/proc", "proc", Path::new("proc"), &["nosuid", "noexec", "nodev"])?,
        mount(
            "/dev",
            "tmpfs",
            Path::new("tmpfs"),
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        )?,
        mount(
            "/dev/pts",
            "devpts",
            Path::new("devpts"),
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        )?,
        mount(
            "/dev/shm",
            "tmpfs",
            Path::new("shm"),
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        )?,
        mount(
            "/dev/mqueue",
            "mqueue",
            Path::new("mqueue"),
            &["nosuid", "noexec", "nodev"],
        )?,
    ];
    // sysfs can only be mounted by the owner of the network namespace
    if ns.is_private("user") && ns.is_host("network") {
        mounts.push(mount(
            "/sys",
            "bind",
            Path::new("/sys"),
            &["rbind", "nosuid", "noexec", "nodev", "ro"],
        )?);
    } else {
        mounts.push(mount(
            "/sys",
            "sysfs",
            Path::new("sysfs"),
            &["nosuid", "noexec", "nodev", "ro"],
        )?);
        mounts.push(mount(
            "/sys/fs/cgroup",
            "cgroup",
            Path::new("cgroup"),
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        )?);
    }
    Ok(mounts)
}

/// Build the environment: the default PATH, the image's variables, then
/// the run's. Later settings for a name replace earlier ones.
pub(crate) fn process_env(image_env: &[String], run_env: &[String], hostname: &str) -> Vec<String> {
    let mut env: Vec<String> = vec![format!("PATH={}", DEFAULT_PATH)];
    let mut set = |entry: &str| {
        let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
        env.retain(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e) != key);
        env.push(entry.to_string());
    };
    for entry in image_env.iter().chain(run_env) {
        set(entry);
    }
    if !hostname.is_empty() {
        set(&format!("HOSTNAME={}", hostname));
    }
    env
}

/// Resolve a relative command name against PATH inside the rootfs.
pub(crate) fn lookup_path(rootfs: &Path, command: &str, env: &[String]) -> String {
    if command.contains('/') {
        return command.to_string();
    }
    let path = env
        .iter()
        .rev()
        .find_map(|e| e.strip_prefix("PATH="))
        .unwrap_or(DEFAULT_PATH);
    for dir in path.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(command);
        let Ok(host) = resolve_in_root(rootfs, &candidate) else {
            continue;
        };
        if let Ok(meta) = std::fs::metadata(&host) {
            use std::os::unix::fs::PermissionsExt;
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return candidate.display().to_string();
            }
        }
    }
    command.to_string()
}

/// Everything a runtime configuration is generated from.
pub(crate) struct SpecParts<'a> {
    pub rootfs: &'a Path,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub user: &'a ExecUser,
    pub terminal: bool,
    pub hostname: String,
    pub namespaces: &'a Namespaces,
    pub capabilities: Vec<String>,
    pub rlimits: Vec<PosixRlimit>,
    pub mounts: Vec<Mount>,
    pub devices: &'a [DeviceSpec],
    pub in_user_namespace: bool,
    pub seccomp: Option<LinuxSeccomp>,
}

pub(crate) fn generate(parts: SpecParts<'_>) -> Result<Spec> {
    let user = UserBuilder::default()
        .uid(parts.user.uid)
        .gid(parts.user.gid)
        .additional_gids(parts.user.additional_gids.clone())
        .build()
        .map_err(|e| spec_error("process user", e))?;
    let process = ProcessBuilder::default()
        .terminal(parts.terminal)
        .user(user)
        .args(parts.args)
        .env(parts.env)
        .cwd(PathBuf::from(&parts.cwd))
        .capabilities(oci_capabilities(&parts.capabilities, parts.user.uid == 0)?)
        .rlimits(parts.rlimits)
        .no_new_privileges(true)
        .build()
        .map_err(|e| spec_error("process", e))?;
    let root = RootBuilder::default()
        .path(parts.rootfs.to_path_buf())
        .readonly(false)
        .build()
        .map_err(|e| spec_error("root", e))?;

    let mut mounts = parts.mounts;
    let mut devices = Vec::new();
    let mut rules = Vec::new();
    for device in parts.devices {
        if parts.in_user_namespace {
            // device nodes can't be created here; bind the host's instead
            mounts.push(mount(
                &device.destination.display().to_string(),
                "bind",
                &device.source,
                &["bind", "nosuid", "noexec"],
            )?);
            continue;
        }
        let (entry, rule) = device_entry(device)?;
        devices.push(entry);
        rules.push(rule);
    }

    let mut linux = LinuxBuilder::default()
        .namespaces(parts.namespaces.to_oci()?)
        .masked_paths(MASKED_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .readonly_paths(READONLY_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .devices(devices);
    if !rules.is_empty() {
        linux = linux.resources(
            LinuxResourcesBuilder::default()
                .devices(rules)
                .build()
                .map_err(|e| spec_error("resources", e))?,
        );
    }
    if parts.namespaces.is_private("user") {
        linux = linux
            .uid_mappings(id_mappings_to_oci(&parts.namespaces.id_mappings.uid_map)?)
            .gid_mappings(id_mappings_to_oci(&parts.namespaces.id_mappings.gid_map)?);
    }
    if let Some(seccomp) = parts.seccomp {
        linux = linux.seccomp(seccomp);
    }
    let linux = linux.build().map_err(|e| spec_error("linux section", e))?;

    let mut spec = Spec::default();
    spec.set_process(Some(process))
        .set_root(Some(root))
        .set_mounts(Some(mounts))
        .set_linux(Some(linux));
    if parts.namespaces.is_private("uts") && !parts.hostname.is_empty() {
        spec.set_hostname(Some(parts.hostname));
    } else {
        spec.set_hostname(None);
    }
    Ok(spec)
}

/// Read a seccomp profile in runtime-configuration form.
pub(crate) fn load_seccomp(path: &Path) -> Result<LinuxSeccomp> {
    let data = std::fs::read(path).map_err(|e| {
        BuildError::ConfigError(format!("reading seccomp profile {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&data).map_err(|e| {
        BuildError::ConfigError(format!("parsing seccomp profile {}: {}", path.display(), e))
    })
}

/// Where a mount destination lands in the rootfs, for a workdir-relative
/// target.
pub(crate) fn absolute_target(workdir: &str, target: &str) -> String {
    if target.starts_with('/') {
        target.to_string()
    } else {
        join_under(Path::new("/").join(workdir.trim_start_matches('/')).as_path(), Path::new(target))
            .display()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_capabilities_add_and_drop() {
        let caps = effective_capabilities(
            &strings(&["CAP_CHOWN", "CAP_KILL"]),
            &strings(&["net_raw"]),
            &strings(&["cap_kill"]),
        )
        .unwrap();
        assert_eq!(caps, strings(&["CAP_CHOWN", "CAP_NET_RAW"]));

        let all = effective_capabilities(&[], &strings(&["ALL"]), &strings(&["SYS_ADMIN"])).unwrap();
        assert_eq!(all.len(), ALL_CAPABILITIES.len() - 1);
        assert!(!all.contains(&"CAP_SYS_ADMIN".to_string()));

        let none = effective_capabilities(&strings(&["CAP_CHOWN"]), &[], &strings(&["all"])).unwrap();
        assert!(none.is_empty());

        assert!(effective_capabilities(&[], &strings(&["CAP_NOPE"]), &[]).is_err());
    }

    #[test]
    fn test_map_hostname() {
        assert_eq!(map_hostname("alpine-working-container", "abc"), "alpine-working-container");
        assert_eq!(map_hostname("__my.host", "abc"), "my.host");
        assert_eq!(map_hostname("___", "0123456789abcdef"), "0123456789ab");
        assert_eq!(map_hostname(&"a".repeat(80), "x").len(), 64);
    }

    #[test]
    fn test_parse_ulimit() {
        assert_eq!(parse_ulimit("nofile=1024:2048").unwrap(), ("nofile".to_string(), 1024, 2048));
        assert_eq!(parse_ulimit("core=unlimited").unwrap().1, u64::MAX);
        assert!(parse_ulimit("nofile=10:5").is_err());
        assert!(parse_ulimit("bogus=1").is_err());
        assert!(parse_ulimit("nofile").is_err());
    }

    #[test]
    fn test_rlimits_default_nofile_and_nproc() {
        let limits = rlimits(&strings(&["core=0"])).unwrap();
        let json = serde_json::to_value(&limits).unwrap();
        let kinds: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["RLIMIT_CORE", "RLIMIT_NOFILE", "RLIMIT_NPROC"]);
    }

    #[test]
    fn test_parse_device() {
        let d = parse_device("/dev/fuse").unwrap();
        assert_eq!(d.destination, PathBuf::from("/dev/fuse"));
        assert_eq!(d.permissions, "rwm");
        let d = parse_device("/dev/sda:/dev/xvda:r").unwrap();
        assert_eq!(d.destination, PathBuf::from("/dev/xvda"));
        assert_eq!(d.permissions, "r");
        let d = parse_device("/dev/null:rw").unwrap();
        assert_eq!(d.destination, PathBuf::from("/dev/null"));
        assert!(parse_device("dev/null").is_err());
        assert!(parse_device("/a:/b:xyz").is_err());
    }

    #[test]
    fn test_namespace_resolution() {
        let ns = Namespaces::resolve(
            &[],
            &[],
            NetworkPolicy::Default,
            Isolation::Oci,
            &IdMappings::default(),
        )
        .unwrap();
        assert!(ns.is_private("pid"));
        assert!(ns.is_private("mount"));
        assert!(ns.is_host("network"));
        assert!(ns.is_host("user"));

        let ns = Namespaces::resolve(
            &[NamespaceOption::host("ipc")],
            &[NamespaceOption::host("uts")],
            NetworkPolicy::Disabled,
            Isolation::Oci,
            &IdMappings::default(),
        )
        .unwrap();
        assert!(ns.is_private("network"));
        assert!(ns.is_host("ipc"));
        assert!(ns.is_host("uts"));

        let chroot = Namespaces::resolve(
            &[],
            &[],
            NetworkPolicy::Disabled,
            Isolation::Chroot,
            &IdMappings::default(),
        )
        .unwrap();
        assert!(chroot.is_host("network"));

        assert!(Namespaces::resolve(
            &[NamespaceOption::private("bogus")],
            &[],
            NetworkPolicy::Default,
            Isolation::Oci,
            &IdMappings::default()
        )
        .is_err());
    }

    #[test]
    fn test_host_pid_with_private_user_namespace_is_rejected() {
        let mappings = IdMappings::new(
            vec![a3s_build_core::IdMap::new(0, 100000, 65536)],
            vec![a3s_build_core::IdMap::new(0, 100000, 65536)],
        );
        let err = Namespaces::resolve(
            &[NamespaceOption::host("pid")],
            &[],
            NetworkPolicy::Default,
            Isolation::Oci,
            &mappings,
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }

    #[test]
    fn test_process_env_overrides() {
        let env = process_env(
            &strings(&["PATH=/custom", "A=1"]),
            &strings(&["A=2", "B=3"]),
            "host1",
        );
        assert_eq!(env, strings(&["PATH=/custom", "A=2", "B=3", "HOSTNAME=host1"]));
    }

    #[test]
    fn test_lookup_path_inside_rootfs() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("usr/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("tool"), "#!/bin/sh\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(bin.join("tool"), std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(bin.join("data"), "").unwrap();

        let env = strings(&["PATH=/usr/local/bin:/usr/bin"]);
        assert_eq!(lookup_path(dir.path(), "tool", &env), "/usr/bin/tool");
        assert_eq!(lookup_path(dir.path(), "data", &env), "data");
        assert_eq!(lookup_path(dir.path(), "./tool", &env), "./tool");
    }

    #[test]
    fn test_absolute_target() {
        assert_eq!(absolute_target("/work", "cache"), "/work/cache");
        assert_eq!(absolute_target("/work", "/abs"), "/abs");
        assert_eq!(absolute_target("", "x"), "/x");
    }

    #[test]
    fn test_generate_spec() {
        let dir = TempDir::new().unwrap();
        let ns = Namespaces::resolve(
            &[],
            &[],
            NetworkPolicy::Default,
            Isolation::Oci,
            &IdMappings::default(),
        )
        .unwrap();
        let user = ExecUser {
            uid: 1000,
            gid: 1000,
            home: "/home/app".to_string(),
            additional_gids: vec![10],
        };
        let spec = generate(SpecParts {
            rootfs: dir.path(),
            args: strings(&["/bin/sh", "-c", "true"]),
            env: strings(&["PATH=/bin"]),
            cwd: "/work".to_string(),
            user: &user,
            terminal: false,
            hostname: "box".to_string(),
            namespaces: &ns,
            capabilities: strings(&["CAP_CHOWN"]),
            rlimits: rlimits(&[]).unwrap(),
            mounts: special_mounts(&ns).unwrap(),
            devices: &[],
            in_user_namespace: false,
            seccomp: None,
        })
        .unwrap();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["hostname"], "box");
        assert_eq!(json["process"]["cwd"], "/work");
        assert_eq!(json["process"]["user"]["uid"], 1000);
        assert_eq!(json["process"]["noNewPrivileges"], true);
        assert_eq!(json["process"]["capabilities"]["bounding"][0], "CAP_CHOWN");
        assert!(json["process"]["capabilities"]["effective"]
            .as_array()
            .map(|a| a.is_empty())
            .unwrap_or(true));
        let kinds: Vec<&str> = json["linux"]["namespaces"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["type"].as_str().unwrap())
            .collect();
        assert!(kinds.contains(&"pid"));
        assert!(!kinds.contains(&"network"));
        assert!(!kinds.contains(&"user"));
    }
}
