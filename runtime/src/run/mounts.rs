//! `--mount` and `--volume` handling for RUN.
//!
//! Each mount specification is a comma-separated list of `key=value`
//! tokens. Resolving a mount may acquire resources (agent proxies, cache
//! locks, scratch copies, secret files); those are collected in
//! [`RunArtifacts`] and released in reverse order when it is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::{IdMappings, IdPair};
use nix::fcntl::{Flock, FlockArg};
use oci_spec::runtime::Mount;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use super::spec::{absolute_target, mount};
use super::ssh::{AgentProxy, SshSource};
use crate::copier::{self, join_under, GetOptions, PutOptions};
use crate::define::PACKAGE;
use crate::store::Store;

/// Where a secret's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    File(PathBuf),
    Env(String),
}

/// Parse a `--secret` value: `id=<id>[,type=file|env][,src=<path>|,env=<name>]`.
/// A bare `src` means a file and a bare `env` an environment variable;
/// without either, the ID names an environment variable.
pub fn parse_secret(spec: &str) -> Result<(String, SecretSource)> {
    let mut id = String::new();
    let mut kind = String::new();
    let mut src = String::new();
    let mut env = String::new();
    for token in spec.split(',') {
        let (key, value) = token.split_once('=').ok_or_else(|| {
            BuildError::InvalidArgument(format!("invalid secret {:?}: bad token {:?}", spec, token))
        })?;
        match key {
            "id" => id = value.to_string(),
            "type" => kind = value.to_string(),
            "src" | "source" => src = value.to_string(),
            "env" => env = value.to_string(),
            _ => {
                return Err(BuildError::InvalidArgument(format!(
                    "invalid secret {:?}: unknown key {:?}",
                    spec, key
                )))
            }
        }
    }
    if id.is_empty() {
        return Err(BuildError::InvalidArgument(format!("invalid secret {:?}: missing id", spec)));
    }
    let source = match kind.as_str() {
        "file" => SecretSource::File(PathBuf::from(if src.is_empty() { &env } else { &src })),
        "env" => SecretSource::Env(if env.is_empty() { src } else { env }),
        "" if !src.is_empty() => SecretSource::File(PathBuf::from(src)),
        "" if !env.is_empty() => SecretSource::Env(env),
        "" => SecretSource::Env(id.clone()),
        other => {
            return Err(BuildError::InvalidArgument(format!(
                "invalid secret {:?}: unknown type {:?}",
                spec, other
            )))
        }
    };
    if let SecretSource::File(path) = &source {
        if path.as_os_str().is_empty() {
            return Err(BuildError::InvalidArgument(format!(
                "invalid secret {:?}: missing source",
                spec
            )));
        }
    }
    Ok((id, source))
}

/// How concurrent runs share a cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheSharing {
    #[default]
    Shared,
    /// One run at a time; others wait
    Locked,
    /// Runs that find the cache busy get a fresh empty directory
    Private,
}

/// One parsed `--mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMount {
    Bind {
        source: String,
        target: String,
        from: Option<String>,
        read_write: bool,
        propagation: Option<String>,
    },
    Tmpfs {
        target: String,
        size: Option<String>,
        mode: Option<u32>,
        read_only: bool,
    },
    Secret {
        id: String,
        target: String,
        required: bool,
        mode: u32,
        owner: IdPair,
    },
    Ssh {
        id: String,
        target: Option<String>,
        required: bool,
        mode: u32,
        owner: IdPair,
    },
    Cache {
        id: String,
        target: String,
        source: String,
        from: Option<String>,
        sharing: CacheSharing,
        read_only: bool,
        mode: u32,
        owner: IdPair,
    },
}

fn bad_option(spec: &str, token: &str) -> BuildError {
    BuildError::InvalidMount(format!("{:?}: invalid mount option {:?}", spec, token))
}

fn parse_bool(spec: &str, token: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(_) => Err(bad_option(spec, token)),
    }
}

fn parse_mode(spec: &str, token: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 8).map_err(|_| bad_option(spec, token))
}

fn parse_id(spec: &str, token: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| bad_option(spec, token))
}

impl RunMount {
    /// Parse one specification. Relative targets are taken relative to
    /// `workdir`; `ssh_index` numbers default agent socket paths.
    pub fn parse(spec: &str, workdir: &str, ssh_index: usize) -> Result<Self> {
        let mut fields: Vec<(&str, Option<&str>, &str)> = Vec::new();
        let mut kind = "bind";
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            if key == "type" {
                kind = value.ok_or_else(|| bad_option(spec, token))?;
            } else {
                fields.push((key, value, token));
            }
        }

        let mut id = String::new();
        let mut target = String::new();
        let mut source = String::new();
        let mut from = None;
        let mut required = false;
        let mut read_only = None;
        let mut mode = None;
        let mut uid = 0;
        let mut gid = 0;
        let mut size = None;
        let mut sharing = CacheSharing::Shared;
        let mut propagation = None;
        for (key, value, token) in fields {
            let need = || value.ok_or_else(|| bad_option(spec, token));
            match (kind, key) {
                (_, "target" | "dst" | "destination") => target = need()?.to_string(),
                ("secret" | "ssh" | "cache", "id") => id = need()?.to_string(),
                ("secret" | "ssh", "required") => required = parse_bool(spec, token, value)?,
                ("bind" | "cache", "src" | "source") => source = need()?.to_string(),
                ("bind" | "cache", "from") => from = Some(need()?.to_string()),
                ("bind" | "cache" | "tmpfs", "ro" | "readonly") => {
                    read_only = Some(parse_bool(spec, token, value)?)
                }
                ("bind" | "cache" | "tmpfs", "rw" | "readwrite") => {
                    read_only = Some(!parse_bool(spec, token, value)?)
                }
                ("secret" | "ssh" | "cache", "mode") => mode = Some(parse_mode(spec, token, need()?)?),
                ("tmpfs", "tmpfs-mode") => mode = Some(parse_mode(spec, token, need()?)?),
                ("tmpfs", "tmpfs-size") => size = Some(need()?.to_string()),
                ("secret" | "ssh" | "cache", "uid") => uid = parse_id(spec, token, need()?)?,
                ("secret" | "ssh" | "cache", "gid") => gid = parse_id(spec, token, need()?)?,
                ("cache", "sharing") => {
                    sharing = match need()? {
                        "shared" => CacheSharing::Shared,
                        "locked" => CacheSharing::Locked,
                        "private" => CacheSharing::Private,
                        _ => return Err(bad_option(spec, token)),
                    }
                }
                ("bind", "bind-propagation") => {
                    let value = need()?;
                    let known = ["shared", "rshared", "private", "rprivate", "slave", "rslave"];
                    if !known.contains(&value) {
                        return Err(bad_option(spec, token));
                    }
                    propagation = Some(value.to_string());
                }
                // SELinux relabeling has no effect here
                ("bind", "z" | "Z" | "relabel") => {}
                _ => return Err(bad_option(spec, token)),
            }
        }

        let target = if target.is_empty() {
            target
        } else {
            absolute_target(workdir, &target)
        };
        let owner = IdPair::new(uid, gid);
        match kind {
            "bind" => {
                if target.is_empty() {
                    return Err(BuildError::InvalidMount(format!("{:?}: missing target", spec)));
                }
                Ok(RunMount::Bind {
                    source: if source.is_empty() { ".".to_string() } else { source },
                    target,
                    from,
                    read_write: read_only == Some(false),
                    propagation,
                })
            }
            "tmpfs" => {
                if target.is_empty() {
                    return Err(BuildError::InvalidMount(format!("{:?}: missing target", spec)));
                }
                Ok(RunMount::Tmpfs {
                    target,
                    size,
                    mode,
                    read_only: read_only.unwrap_or(false),
                })
            }
            "secret" => {
                if id.is_empty() {
                    id = Path::new(&target)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                }
                if id.is_empty() {
                    return Err(BuildError::InvalidMount(format!(
                        "{:?}: secret id or target required",
                        spec
                    )));
                }
                let target = if target.is_empty() {
                    format!("/run/secrets/{}", id)
                } else {
                    target
                };
                Ok(RunMount::Secret {
                    id,
                    target,
                    required,
                    mode: mode.unwrap_or(0o400),
                    owner,
                })
            }
            "ssh" => Ok(RunMount::Ssh {
                id: if id.is_empty() { "default".to_string() } else { id },
                target: if target.is_empty() {
                    Some(format!("/run/buildkit/ssh_agent.{}", ssh_index))
                } else {
                    Some(target)
                },
                required,
                mode: mode.unwrap_or(0o600),
                owner,
            }),
            "cache" => {
                if target.is_empty() {
                    return Err(BuildError::InvalidMount(format!("{:?}: missing target", spec)));
                }
                Ok(RunMount::Cache {
                    id: if id.is_empty() { target.clone() } else { id },
                    target,
                    source,
                    from,
                    sharing,
                    read_only: read_only.unwrap_or(false),
                    mode: mode.unwrap_or(0o755),
                    owner,
                })
            }
            other => Err(BuildError::InvalidMount(format!(
                "{:?}: unsupported mount type {:?}",
                spec, other
            ))),
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            RunMount::Bind { target, .. }
            | RunMount::Tmpfs { target, .. }
            | RunMount::Secret { target, .. }
            | RunMount::Cache { target, .. } => Some(target),
            RunMount::Ssh { target, .. } => target.as_deref(),
        }
    }
}

/// Parse a `host:container[:options]` volume.
pub(crate) fn parse_volume(spec: &str) -> Result<Mount> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, opts) = match parts.as_slice() {
        [s, t] => (*s, *t, ""),
        [s, t, o] => (*s, *t, *o),
        _ => return Err(BuildError::InvalidMount(format!("invalid volume {:?}", spec))),
    };
    if !source.starts_with('/') || !target.starts_with('/') {
        return Err(BuildError::InvalidMount(format!(
            "invalid volume {:?}: paths must be absolute",
            spec
        )));
    }
    if !Path::new(source).exists() {
        return Err(BuildError::NotFound(format!(
            "volume source {} does not exist",
            source
        )));
    }
    let mut options = vec!["rbind"];
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" | "rw" | "shared" | "rshared" | "private" | "rprivate" | "slave" | "rslave" => {
                options.push(opt)
            }
            "z" | "Z" => {}
            other => {
                return Err(BuildError::InvalidMount(format!(
                    "invalid volume {:?}: unknown option {:?}",
                    spec, other
                )))
            }
        }
    }
    mount(target, "bind", Path::new(source), &options)
}

/// One resource held for the duration of a run.
pub(crate) enum Artifact {
    Agent(AgentProxy),
    Lock(Flock<File>),
    Scratch(TempDir),
    File(PathBuf),
}

/// Resources acquired while setting up a run, released newest first.
#[derive(Default)]
pub(crate) struct RunArtifacts {
    items: Vec<Artifact>,
}

impl RunArtifacts {
    pub fn push(&mut self, item: Artifact) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

impl Drop for RunArtifacts {
    fn drop(&mut self) {
        while let Some(item) = self.items.pop() {
            match item {
                Artifact::File(path) => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(path = %path.display(), error = %e, "Failed to remove run file");
                        }
                    }
                }
                Artifact::Scratch(dir) => {
                    let path = dir.path().to_path_buf();
                    if let Err(e) = dir.close() {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
                    }
                }
                Artifact::Lock(lock) => {
                    if let Err((_, e)) = lock.unlock() {
                        tracing::warn!(error = %e, "Failed to release cache lock");
                    }
                }
                Artifact::Agent(agent) => drop(agent),
            }
        }
    }
}

/// What mount resolution needs to know about the run.
pub(crate) struct MountContext<'a> {
    pub store: &'a Store,
    pub container_dir: &'a Path,
    pub context_dir: &'a Path,
    pub tmp_dir: &'a Path,
    pub cache_parent: &'a Path,
    pub id_mappings: &'a IdMappings,
    pub secrets: &'a BTreeMap<String, SecretSource>,
    pub ssh_sources: &'a BTreeMap<String, SshSource>,
}

/// Mounts produced from `--mount` specifications, plus environment the
/// process needs to use them.
#[derive(Default)]
pub(crate) struct ResolvedMounts {
    pub mounts: Vec<Mount>,
    pub env: Vec<String>,
}

fn short_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))[..16].to_string()
}

fn host_owner(mappings: &IdMappings, owner: IdPair) -> Result<IdPair> {
    mappings
        .to_host(owner)
        .map_err(|e| BuildError::InvalidMount(format!("mapping {}:{} to the host: {}", owner.uid, owner.gid, e)))
}

fn set_owner_and_mode(path: &Path, owner: IdPair, mode: u32) -> Result<()> {
    match std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::debug!(path = %path.display(), "Skipping chown as unprivileged user");
        }
        Err(e) => {
            return Err(BuildError::RuntimeError(format!(
                "setting ownership of {}: {}",
                path.display(),
                e
            )))
        }
    }
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        BuildError::RuntimeError(format!("setting mode of {}: {}", path.display(), e))
    })
}

/// Copy `source` into a scratch directory so writes never reach it.
fn scratch_copy(source: &Path, tmp_dir: &Path, artifacts: &mut RunArtifacts) -> Result<PathBuf> {
    let scratch = tempfile::Builder::new()
        .prefix("a3s-build-mount-")
        .tempdir_in(tmp_dir)?;
    let copy = if source.is_dir() {
        let archive = copier::get(
            source,
            source,
            &GetOptions::default(),
            &[source.display().to_string()],
            Vec::new(),
        )?;
        copier::put(scratch.path(), scratch.path(), &PutOptions::default(), archive.as_slice())?;
        scratch.path().to_path_buf()
    } else {
        let name = source.file_name().unwrap_or_else(|| std::ffi::OsStr::new("file"));
        let dest = scratch.path().join(name);
        std::fs::copy(source, &dest).map_err(|e| {
            BuildError::RuntimeError(format!("copying {}: {}", source.display(), e))
        })?;
        dest
    };
    artifacts.push(Artifact::Scratch(scratch));
    Ok(copy)
}

fn lock_cache(dir: &Path, arg: FlockArg) -> Result<std::result::Result<Flock<File>, nix::Error>> {
    let lock_path = dir.with_extension("lock");
    let file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| BuildError::RuntimeError(format!("opening {}: {}", lock_path.display(), e)))?;
    Ok(Flock::lock(file, arg).map_err(|(_, e)| e))
}

/// Resolve parsed mounts into runtime mounts. Secrets and agents that are
/// missing are skipped unless required.
pub(crate) fn resolve_run_mounts(
    ctx: &MountContext<'_>,
    specs: &[RunMount],
    artifacts: &mut RunArtifacts,
) -> Result<ResolvedMounts> {
    let mut resolved = ResolvedMounts::default();
    for spec in specs {
        match spec {
            RunMount::Bind {
                source,
                target,
                from,
                read_write,
                propagation,
            } => {
                let base = match from {
                    Some(image) => ctx.store.mount_image(image)?,
                    None => ctx.context_dir.to_path_buf(),
                };
                let host = join_under(&base, Path::new(source));
                if !host.exists() {
                    return Err(BuildError::NotFound(format!(
                        "bind mount source {} does not exist",
                        host.display()
                    )));
                }
                let (host, ro) = if *read_write {
                    (scratch_copy(&host, ctx.tmp_dir, artifacts)?, false)
                } else {
                    (host, true)
                };
                let mut options = vec!["rbind"];
                if ro {
                    options.push("ro");
                }
                if let Some(p) = propagation {
                    options.push(p.as_str());
                }
                resolved.mounts.push(mount(target, "bind", &host, &options)?);
            }
            RunMount::Tmpfs {
                target,
                size,
                mode,
                read_only,
            } => {
                let mut options = vec!["nosuid".to_string(), "nodev".to_string()];
                if let Some(size) = size {
                    options.push(format!("size={}", size));
                }
                if let Some(mode) = mode {
                    options.push(format!("mode={:o}", mode));
                }
                if *read_only {
                    options.push("ro".to_string());
                }
                let options: Vec<&str> = options.iter().map(String::as_str).collect();
                resolved
                    .mounts
                    .push(mount(target, "tmpfs", Path::new("tmpfs"), &options)?);
            }
            RunMount::Secret {
                id,
                target,
                required,
                mode,
                owner,
            } => {
                let Some(source) = ctx.secrets.get(id) else {
                    if *required {
                        return Err(BuildError::NotFound(format!(
                            "secret required but no secret with id {:?} found",
                            id
                        )));
                    }
                    tracing::debug!(secret = %id, "Skipping unavailable optional secret");
                    continue;
                };
                let data = match source {
                    SecretSource::File(path) => std::fs::read(path).map_err(|e| {
                        BuildError::NotFound(format!("reading secret {:?} from {}: {}", id, path.display(), e))
                    })?,
                    SecretSource::Env(name) => std::env::var(name)
                        .map_err(|_| {
                            BuildError::NotFound(format!(
                                "secret {:?}: environment variable {} is not set",
                                id, name
                            ))
                        })?
                        .into_bytes(),
                };
                let dir = ctx.container_dir.join("secrets");
                std::fs::create_dir_all(&dir)?;
                let path = dir.join(short_digest(id));
                std::fs::write(&path, &data)?;
                artifacts.push(Artifact::File(path.clone()));
                set_owner_and_mode(&path, host_owner(ctx.id_mappings, *owner)?, *mode)?;
                resolved
                    .mounts
                    .push(mount(target, "bind", &path, &["rbind", "ro", "rprivate"])?);
            }
            RunMount::Ssh {
                id,
                target,
                required,
                mode,
                owner,
            } => {
                let Some(source) = ctx.ssh_sources.get(id) else {
                    if *required {
                        return Err(BuildError::NotFound(format!(
                            "ssh required but no ssh with id {:?} found",
                            id
                        )));
                    }
                    tracing::debug!(ssh = %id, "Skipping unavailable optional ssh agent");
                    continue;
                };
                let Some(target) = target else {
                    continue;
                };
                let agent = AgentProxy::start(source, ctx.tmp_dir)?;
                let socket = agent.socket_path().to_path_buf();
                artifacts.push(Artifact::Agent(agent));
                set_owner_and_mode(&socket, host_owner(ctx.id_mappings, *owner)?, *mode)?;
                if !resolved.env.iter().any(|e| e.starts_with("SSH_AUTH_SOCK=")) {
                    resolved.env.push(format!("SSH_AUTH_SOCK={}", target));
                }
                resolved.mounts.push(mount(target, "bind", &socket, &["rbind"])?);
            }
            RunMount::Cache {
                id,
                target,
                source,
                from,
                sharing,
                read_only,
                mode,
                owner,
            } => {
                let host = match from {
                    Some(image) => {
                        let host = join_under(&ctx.store.mount_image(image)?, Path::new(source));
                        if *read_only {
                            host
                        } else {
                            scratch_copy(&host, ctx.tmp_dir, artifacts)?
                        }
                    }
                    None => {
                        let uid = nix::unistd::geteuid().as_raw();
                        let parent = ctx.cache_parent.join(format!("{}-cache-{}", PACKAGE, uid));
                        let dir = parent.join(short_digest(&format!(
                            "{}:{}:{}",
                            id, owner.uid, owner.gid
                        )));
                        if !dir.exists() {
                            std::fs::create_dir_all(&dir).map_err(|e| {
                                BuildError::RuntimeError(format!(
                                    "creating cache directory {}: {}",
                                    dir.display(),
                                    e
                                ))
                            })?;
                            set_owner_and_mode(&dir, host_owner(ctx.id_mappings, *owner)?, *mode)?;
                        }
                        match sharing {
                            CacheSharing::Shared => dir,
                            CacheSharing::Locked => {
                                let lock = lock_cache(&dir, FlockArg::LockExclusive)?.map_err(|e| {
                                    BuildError::RuntimeError(format!(
                                        "locking cache {}: {}",
                                        dir.display(),
                                        e
                                    ))
                                })?;
                                artifacts.push(Artifact::Lock(lock));
                                dir
                            }
                            CacheSharing::Private => {
                                match lock_cache(&dir, FlockArg::LockExclusiveNonblock)? {
                                    Ok(lock) => {
                                        artifacts.push(Artifact::Lock(lock));
                                        dir
                                    }
                                    Err(_) => {
                                        let scratch = tempfile::Builder::new()
                                            .prefix("a3s-build-cache-")
                                            .tempdir_in(ctx.tmp_dir)?;
                                        let path = scratch.path().to_path_buf();
                                        set_owner_and_mode(
                                            &path,
                                            host_owner(ctx.id_mappings, *owner)?,
                                            *mode,
                                        )?;
                                        artifacts.push(Artifact::Scratch(scratch));
                                        path
                                    }
                                }
                            }
                        }
                    }
                };
                let mut options = vec!["rbind"];
                if *read_only {
                    options.push("ro");
                }
                resolved.mounts.push(mount(target, "bind", &host, &options)?);
            }
        }
    }
    Ok(resolved)
}

/// Back the image's volumes with per-container directories, seeded from
/// the rootfs the first time they are used. Volumes already covered by
/// another mount are skipped.
pub(crate) fn volume_mounts(
    rootfs: &Path,
    container_dir: &Path,
    volumes: &BTreeSet<String>,
    covered: &BTreeSet<String>,
) -> Result<Vec<Mount>> {
    let mut mounts = Vec::new();
    for volume in volumes {
        let target = copier::clean_path(&Path::new("/").join(volume)).display().to_string();
        if covered.contains(&target) {
            continue;
        }
        let dir = container_dir.join("volumes").join(short_digest(&target));
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            let seed = join_under(rootfs, Path::new(&target));
            if seed.is_dir() {
                let archive = copier::get(
                    rootfs,
                    Path::new("/"),
                    &GetOptions::default(),
                    &[glob::Pattern::escape(&seed.display().to_string())],
                    Vec::new(),
                )?;
                copier::put(&dir, &dir, &PutOptions::default(), archive.as_slice())?;
                let meta = std::fs::metadata(&seed)?;
                use std::os::unix::fs::MetadataExt;
                set_owner_and_mode(&dir, IdPair::new(meta.uid(), meta.gid()), meta.mode() & 0o7777)?;
            }
            tracing::debug!(volume = %target, dir = %dir.display(), "Created volume directory");
        }
        mounts.push(mount(&target, "bind", &dir, &["rbind"])?);
    }
    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Builder, BuilderOptions};

    #[test]
    fn test_parse_secret_mount_defaults() {
        let m = RunMount::parse("type=secret,id=token", "/", 0).unwrap();
        assert_eq!(
            m,
            RunMount::Secret {
                id: "token".to_string(),
                target: "/run/secrets/token".to_string(),
                required: false,
                mode: 0o400,
                owner: IdPair::new(0, 0),
            }
        );
        let m = RunMount::parse(
            "type=secret,target=conf/key,required,mode=0440,uid=5,gid=6",
            "/work",
            0,
        )
        .unwrap();
        assert_eq!(
            m,
            RunMount::Secret {
                id: "key".to_string(),
                target: "/work/conf/key".to_string(),
                required: true,
                mode: 0o440,
                owner: IdPair::new(5, 6),
            }
        );
    }

    #[test]
    fn test_parse_invalid_tokens() {
        for spec in [
            "type=secret,id=a,bogus=1",
            "type=secret,id=a,mode=9z",
            "type=secret,id=a,required=maybe",
            "type=cache,target=/c,sharing=sometimes",
            "type=bind,target=/x,bind-propagation=weird",
            "type=tmpfs,target=/t,id=x",
        ] {
            let err = RunMount::parse(spec, "/", 0).unwrap_err();
            assert!(matches!(err, BuildError::InvalidMount(_)), "{}", spec);
        }
        assert!(RunMount::parse("type=volume,target=/x", "/", 0).is_err());
        assert!(RunMount::parse("type=bind,source=x", "/", 0).is_err());
        assert!(RunMount::parse("type=secret", "/", 0).is_err());
    }

    #[test]
    fn test_parse_ssh_and_cache() {
        let m = RunMount::parse("type=ssh", "/", 2).unwrap();
        assert_eq!(m.target(), Some("/run/buildkit/ssh_agent.2"));
        let m = RunMount::parse("type=cache,target=/root/.cache,sharing=locked,uid=1000", "/", 0)
            .unwrap();
        match m {
            RunMount::Cache {
                id,
                sharing,
                mode,
                owner,
                ..
            } => {
                assert_eq!(id, "/root/.cache");
                assert_eq!(sharing, CacheSharing::Locked);
                assert_eq!(mode, 0o755);
                assert_eq!(owner, IdPair::new(1000, 0));
            }
            other => panic!("unexpected {:?}", other),
        }
        let m = RunMount::parse("target=/src,rw", "/", 0).unwrap();
        assert!(matches!(m, RunMount::Bind { read_write: true, .. }));
    }

    #[test]
    fn test_parse_secret_flag() {
        assert_eq!(
            parse_secret("id=a,src=/tmp/a").unwrap(),
            ("a".to_string(), SecretSource::File(PathBuf::from("/tmp/a")))
        );
        assert_eq!(
            parse_secret("id=b,env=TOKEN").unwrap(),
            ("b".to_string(), SecretSource::Env("TOKEN".to_string()))
        );
        assert_eq!(
            parse_secret("id=C").unwrap(),
            ("C".to_string(), SecretSource::Env("C".to_string()))
        );
        assert!(parse_secret("src=/tmp/a").is_err());
        assert!(parse_secret("id=a,type=pipe").is_err());
        assert!(parse_secret("id=a,type=file").is_err());
    }

    #[test]
    fn test_parse_volume() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = format!("{}:/data:ro", dir.path().display());
        let m = parse_volume(&spec).unwrap();
        assert_eq!(m.destination(), &PathBuf::from("/data"));
        assert_eq!(
            m.options().clone().unwrap(),
            vec!["rbind".to_string(), "ro".to_string()]
        );
        assert!(parse_volume("relative:/data").is_err());
        assert!(parse_volume("/definitely/not/here:/data").unwrap_err().is_not_found());
        assert!(parse_volume(&format!("{}:/data:U", dir.path().display())).is_err());
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Store,
        context: PathBuf,
        caches: PathBuf,
        mappings: IdMappings,
        secrets: BTreeMap<String, SecretSource>,
        ssh: BTreeMap<String, SshSource>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::new(&dir.path().join("root"), &dir.path().join("run")).unwrap();
        std::fs::create_dir_all(dir.path().join("context/src")).unwrap();
        std::fs::write(dir.path().join("context/src/main.c"), "int main;").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "s3cr3t").unwrap();
        let mut secrets = BTreeMap::new();
        secrets.insert(
            "token".to_string(),
            SecretSource::File(dir.path().join("secret.txt")),
        );
        Fixture {
            context: dir.path().join("context"),
            caches: dir.path().join("caches"),
            mappings: IdMappings::default(),
            dir,
            store,
            secrets,
            ssh: BTreeMap::new(),
        }
    }

    impl Fixture {
        fn ctx(&self) -> MountContext<'_> {
            MountContext {
                store: &self.store,
                container_dir: self.dir.path(),
                context_dir: &self.context,
                tmp_dir: self.dir.path(),
                cache_parent: &self.caches,
                id_mappings: &self.mappings,
                secrets: &self.secrets,
                ssh_sources: &self.ssh,
            }
        }
    }

    #[test]
    fn test_required_secret_missing() {
        let f = fixture();
        let mut artifacts = RunArtifacts::default();
        let specs = vec![RunMount::parse("type=secret,id=absent,required", "/", 0).unwrap()];
        let err = resolve_run_mounts(&f.ctx(), &specs, &mut artifacts).err().unwrap();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("secret required but no secret with id"));

        let optional = vec![RunMount::parse("type=secret,id=absent", "/", 0).unwrap()];
        let resolved = resolve_run_mounts(&f.ctx(), &optional, &mut artifacts).unwrap();
        assert!(resolved.mounts.is_empty());
    }

    #[test]
    fn test_secret_is_copied_and_removed() {
        let f = fixture();
        let specs = vec![RunMount::parse("type=secret,id=token,mode=0440", "/", 0).unwrap()];
        let copy;
        {
            let mut artifacts = RunArtifacts::default();
            let resolved = resolve_run_mounts(&f.ctx(), &specs, &mut artifacts).unwrap();
            assert_eq!(resolved.mounts.len(), 1);
            let m = &resolved.mounts[0];
            assert_eq!(m.destination(), &PathBuf::from("/run/secrets/token"));
            copy = m.source().clone().unwrap();
            assert!(copy.starts_with(f.dir.path().join("secrets")));
            assert_eq!(std::fs::read_to_string(&copy).unwrap(), "s3cr3t");
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&copy).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o440);
            assert_eq!(artifacts.len(), 1);
        }
        assert!(!copy.exists());
        assert!(f.dir.path().join("secret.txt").exists());
    }

    #[test]
    fn test_bind_and_tmpfs_mounts() {
        let f = fixture();
        let mut artifacts = RunArtifacts::default();
        let specs = vec![
            RunMount::parse("type=bind,source=src,target=/src", "/", 0).unwrap(),
            RunMount::parse("type=bind,source=src,target=/scratch,rw", "/", 0).unwrap(),
            RunMount::parse("type=tmpfs,target=/tmp,tmpfs-size=64m,tmpfs-mode=1777", "/", 0)
                .unwrap(),
        ];
        let resolved = resolve_run_mounts(&f.ctx(), &specs, &mut artifacts).unwrap();
        assert_eq!(resolved.mounts.len(), 3);
        let ro = &resolved.mounts[0];
        assert_eq!(
            ro.source().clone().unwrap(),
            f.dir.path().join("context/src")
        );
        assert!(ro.options().clone().unwrap().contains(&"ro".to_string()));
        let rw = &resolved.mounts[1];
        let copy = rw.source().clone().unwrap();
        assert_ne!(copy, f.dir.path().join("context/src"));
        assert_eq!(std::fs::read_to_string(copy.join("main.c")).unwrap(), "int main;");
        let tmpfs = &resolved.mounts[2];
        assert_eq!(tmpfs.typ().clone().unwrap(), "tmpfs");
        assert!(tmpfs
            .options()
            .clone()
            .unwrap()
            .contains(&"mode=1777".to_string()));

        let escape = vec![RunMount::parse("type=bind,source=../../etc,target=/x", "/", 0).unwrap()];
        let err = resolve_run_mounts(&f.ctx(), &escape, &mut artifacts).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cache_directory_is_stable_and_locked() {
        let f = fixture();
        let specs = vec![RunMount::parse("type=cache,id=deps,target=/deps,sharing=locked", "/", 0)
            .unwrap()];
        let first;
        {
            let mut artifacts = RunArtifacts::default();
            let resolved = resolve_run_mounts(&f.ctx(), &specs, &mut artifacts).unwrap();
            first = resolved.mounts[0].source().clone().unwrap();
            assert!(first.is_dir());
            assert_eq!(artifacts.len(), 1);

            // a private mount of the same cache finds it busy
            let private =
                vec![RunMount::parse("type=cache,id=deps,target=/deps,sharing=private", "/", 0)
                    .unwrap()];
            let mut more = RunArtifacts::default();
            let other = resolve_run_mounts(&f.ctx(), &private, &mut more).unwrap();
            assert_ne!(other.mounts[0].source().clone().unwrap(), first);
        }
        std::fs::write(first.join("kept"), "x").unwrap();
        let mut artifacts = RunArtifacts::default();
        let again = resolve_run_mounts(&f.ctx(), &specs, &mut artifacts).unwrap();
        assert_eq!(again.mounts[0].source().clone().unwrap(), first);
        assert!(first.join("kept").exists());
    }

    #[tokio::test]
    async fn test_ssh_mount_sets_agent_socket() {
        let mut f = fixture();
        let mut artifacts = RunArtifacts::default();
        let optional = vec![RunMount::parse("type=ssh", "/", 0).unwrap()];
        let resolved = resolve_run_mounts(&f.ctx(), &optional, &mut artifacts).unwrap();
        assert!(resolved.mounts.is_empty());

        let required = vec![RunMount::parse("type=ssh,required", "/", 0).unwrap()];
        assert!(resolve_run_mounts(&f.ctx(), &required, &mut artifacts)
            .err()
            .unwrap()
            .is_not_found());

        f.ssh.insert(
            "default".to_string(),
            SshSource::Socket(f.dir.path().join("host-agent.sock")),
        );
        let resolved = resolve_run_mounts(&f.ctx(), &required, &mut artifacts).unwrap();
        assert_eq!(resolved.env, vec!["SSH_AUTH_SOCK=/run/buildkit/ssh_agent.0".to_string()]);
        assert!(resolved.mounts[0].source().clone().unwrap().exists());
    }

    #[test]
    fn test_volume_mounts_seeded_from_rootfs() {
        let f = fixture();
        let mut builder = Builder::new(&f.store, BuilderOptions::default()).unwrap();
        let rootfs = builder.rootfs(&f.store).unwrap();
        std::fs::create_dir_all(rootfs.join("var/lib/data")).unwrap();
        std::fs::write(rootfs.join("var/lib/data/seed"), "seed").unwrap();
        let cdir = builder.container_directory(&f.store);

        let volumes: BTreeSet<String> =
            ["/var/lib/data".to_string(), "/covered".to_string()].into_iter().collect();
        let covered: BTreeSet<String> = ["/covered".to_string()].into_iter().collect();
        let mounts = volume_mounts(&rootfs, &cdir, &volumes, &covered).unwrap();
        assert_eq!(mounts.len(), 1);
        let source = mounts[0].source().clone().unwrap();
        assert!(source.starts_with(cdir.join("volumes")));
        assert_eq!(std::fs::read_to_string(source.join("seed")).unwrap(), "seed");

        // seeded only once
        std::fs::remove_file(source.join("seed")).unwrap();
        let again = volume_mounts(&rootfs, &cdir, &volumes, &covered).unwrap();
        assert!(!again[0].source().clone().unwrap().join("seed").exists());
    }
}
