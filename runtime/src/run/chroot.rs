//! Running a bundle without an OCI runtime.
//!
//! The configuration is handed to a helper process (this program, invoked
//! as `chroot-helper`), which unshares a mount namespace, sets up the
//! configured mounts under the rootfs, and runs the command chrooted into
//! it as the configured user. The helper reports the outcome on
//! descriptor 3; when input is forwarded it arrives on descriptor 4.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use a3s_build_core::error::{BuildError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{Gid, Uid};
use oci_spec::runtime::{LinuxNamespaceType, Mount, Spec};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};

use crate::copier::join_under;
use crate::define::PACKAGE;
use crate::pipe::os_pipe;

/// Argument that makes this program act as the helper.
pub const CHROOT_HELPER_COMMAND: &str = "chroot-helper";

const RESPONSE_FD: RawFd = 3;
const STDIN_FD: RawFd = 4;

/// What the helper is asked to run.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChrootRequest {
    pub spec: Spec,
    pub bundle: PathBuf,
    /// Whether input is forwarded on descriptor 4
    pub stdin: bool,
}

/// What the helper reports back.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChrootResponse {
    Exited { code: i32 },
    Failed { message: String },
}

/// Locate the helper binary.
pub(crate) fn find_helper() -> Result<PathBuf> {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let candidate = exe_dir.join(PACKAGE);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    for dir in ["target/debug", "target/release"] {
        let candidate = PathBuf::from(dir).join(PACKAGE);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(PACKAGE);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(BuildError::RuntimeError(format!(
        "could not find the {} binary to run chroot-isolated commands",
        PACKAGE
    )))
}

/// One chroot-isolated command.
pub(crate) struct ChrootInvocation<'a> {
    pub helper: Option<&'a Path>,
    pub bundle: &'a Path,
    pub spec: Spec,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

fn output_stdio(file: Option<File>) -> Stdio {
    match file {
        Some(f) => Stdio::from(f),
        None => Stdio::inherit(),
    }
}

/// Put the response pipe and forwarded input on their fixed descriptors
/// in a freshly forked child. Both descriptors are first copied above the low range so that moving
/// one can't clobber the other.
fn place_fds(response: RawFd, stdin: Option<RawFd>) -> std::io::Result<()> {
    let lift = |fd: RawFd| {
        fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(10)).map_err(std::io::Error::from)
    };
    let response = lift(response)?;
    let stdin = stdin.map(lift).transpose()?;
    nix::unistd::dup2(response, RESPONSE_FD).map_err(std::io::Error::from)?;
    if let Some(fd) = stdin {
        nix::unistd::dup2(fd, STDIN_FD).map_err(std::io::Error::from)?;
    }
    Ok(())
}

/// Run the configuration through the helper and return the exit code.
pub(crate) async fn run_with_chroot(inv: ChrootInvocation<'_>) -> Result<i32> {
    let helper = match inv.helper {
        Some(path) => path.to_path_buf(),
        None => find_helper()?,
    };
    let request = ChrootRequest {
        spec: inv.spec,
        bundle: inv.bundle.to_path_buf(),
        stdin: inv.stdin.is_some(),
    };
    let payload = serde_json::to_vec(&request)?;

    let (mut response_reader, response_writer) = os_pipe()?;
    let response_fd = response_writer.as_raw_fd();
    let stdin_fd = inv.stdin.as_ref().map(|f| f.as_raw_fd());

    let mut cmd = tokio::process::Command::new(&helper);
    cmd.arg(CHROOT_HELPER_COMMAND)
        .stdin(Stdio::piped())
        .stdout(output_stdio(inv.stdout))
        .stderr(output_stdio(inv.stderr));
    // SAFETY: only async-signal-safe descriptor calls run in the child.
    unsafe {
        cmd.pre_exec(move || place_fds(response_fd, stdin_fd));
    }
    tracing::debug!(helper = %helper.display(), "Starting chroot helper");
    let mut child = cmd.spawn().map_err(|e| {
        BuildError::RuntimeError(format!("running {}: {}", helper.display(), e))
    })?;
    drop(response_writer);
    drop(inv.stdin);

    if let Some(mut stdin) = child.stdin.take() {
        use tokio::io::AsyncWriteExt;
        let sent = match stdin.write_all(&payload).await {
            Ok(()) => stdin.shutdown().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            // a helper that exits early is reported below
            tracing::debug!(error = %e, "Failed to send request to chroot helper");
        }
    }

    let reader = tokio::task::spawn_blocking(move || {
        let mut data = Vec::new();
        response_reader.read_to_end(&mut data).map(|_| data)
    });

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = interrupt.recv() => forward(&mut child),
            _ = terminate.recv() => forward(&mut child),
            _ = hangup.recv() => forward(&mut child),
        }
    };

    let data = reader
        .await
        .map_err(|e| BuildError::Internal(format!("reading chroot helper response: {}", e)))??;
    if data.is_empty() {
        return Err(BuildError::RuntimeError(format!(
            "chroot helper exited with {} without reporting a result",
            status
        )));
    }
    match serde_json::from_slice::<ChrootResponse>(&data)? {
        ChrootResponse::Exited { code } => Ok(code),
        ChrootResponse::Failed { message } => Err(BuildError::RuntimeError(message)),
    }
}

fn forward(child: &mut tokio::process::Child) {
    tracing::info!("Stopping chroot-isolated command");
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to stop chroot helper");
    }
}

fn has_namespace(spec: &Spec, typ: LinuxNamespaceType) -> bool {
    spec.linux()
        .as_ref()
        .and_then(|l| l.namespaces().as_ref())
        .map(|list| list.iter().any(|n| n.typ() == typ))
        .unwrap_or(false)
}

fn mount_error(what: &str, path: &Path, e: nix::Error) -> BuildError {
    BuildError::RuntimeError(format!("{} {}: {}", what, path.display(), e))
}

fn bind(source: &Path, dest: &Path, recursive: bool, read_only: bool) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), dest, None::<&str>, flags, None::<&str>)
        .map_err(|e| mount_error("bind mounting onto", dest, e))?;
    if read_only {
        mount(
            None::<&str>,
            dest,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| mount_error("remounting read-only", dest, e))?;
    }
    Ok(())
}

fn apply_mount(rootfs: &Path, m: &Mount) -> Result<()> {
    let destination = m.destination().display().to_string();
    let dest = join_under(rootfs, m.destination());
    let options = m.options().clone().unwrap_or_default();
    let has = |o: &str| options.iter().any(|x| x == o);
    let typ = m.typ().as_deref().unwrap_or("bind");

    match (typ, destination.as_str()) {
        // kernel filesystems are shared with the host
        ("proc", _) => bind(Path::new("/proc"), &dest, true, false),
        ("sysfs", _) => bind(Path::new("/sys"), &dest, true, true),
        ("tmpfs", "/dev") => bind(Path::new("/dev"), &dest, true, false),
        ("bind", _) => {
            let source = m.source().clone().unwrap_or_default();
            bind(&source, &dest, has("rbind"), has("ro"))
        }
        ("tmpfs", d) if !d.starts_with("/dev/") => {
            let data: Vec<&str> = options
                .iter()
                .map(String::as_str)
                .filter(|o| o.starts_with("size=") || o.starts_with("mode="))
                .collect();
            let mut flags = MsFlags::empty();
            if has("ro") {
                flags |= MsFlags::MS_RDONLY;
            }
            if has("nosuid") {
                flags |= MsFlags::MS_NOSUID;
            }
            if has("nodev") {
                flags |= MsFlags::MS_NODEV;
            }
            if has("noexec") {
                flags |= MsFlags::MS_NOEXEC;
            }
            let data = data.join(",");
            mount(
                Some("tmpfs"),
                &dest,
                Some("tmpfs"),
                flags,
                if data.is_empty() { None } else { Some(data.as_str()) },
            )
            .map_err(|e| mount_error("mounting tmpfs on", &dest, e))
        }
        // devpts, mqueue and friends come with the host's /dev and /sys
        _ => {
            tracing::debug!(destination, typ, "Skipping mount in chroot isolation");
            Ok(())
        }
    }
}

fn set_up(request: &ChrootRequest) -> Result<(PathBuf, std::process::Command)> {
    let spec = &request.spec;
    let rootfs = spec
        .root()
        .as_ref()
        .map(|r| r.path().clone())
        .ok_or_else(|| BuildError::InvalidArgument("configuration has no root".to_string()))?;
    let process = spec
        .process()
        .as_ref()
        .ok_or_else(|| BuildError::InvalidArgument("configuration has no process".to_string()))?;
    let args = process.args().clone().unwrap_or_default();
    let program = args
        .first()
        .cloned()
        .ok_or_else(|| BuildError::InvalidArgument("no command specified".to_string()))?;

    let mut flags = CloneFlags::CLONE_NEWNS;
    let private_uts = has_namespace(spec, LinuxNamespaceType::Uts);
    if private_uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if has_namespace(spec, LinuxNamespaceType::Ipc) {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    unshare(flags).map_err(|e| BuildError::RuntimeError(format!("unsharing namespaces: {}", e)))?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| mount_error("making private", Path::new("/"), e))?;

    let mut mounts = spec.mounts().clone().unwrap_or_default();
    // parents before children
    mounts.sort_by_key(|m| m.destination().components().count());
    for m in &mounts {
        apply_mount(&rootfs, m)?;
    }

    if private_uts {
        if let Some(hostname) = spec.hostname() {
            nix::unistd::sethostname(hostname)
                .map_err(|e| BuildError::RuntimeError(format!("setting hostname: {}", e)))?;
        }
    }

    let user = process.user();
    let uid = Uid::from_raw(user.uid());
    let gid = Gid::from_raw(user.gid());
    let groups: Vec<Gid> = user
        .additional_gids()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(Gid::from_raw)
        .collect();
    let cwd = process.cwd().clone();

    let mut cmd = std::process::Command::new(&program);
    cmd.args(&args[1..]).env_clear();
    for entry in process.env().clone().unwrap_or_default() {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    let root = rootfs.clone();
    // SAFETY: only async-signal-safe calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::chroot(&root).map_err(std::io::Error::from)?;
            nix::unistd::chdir(&cwd).map_err(std::io::Error::from)?;
            nix::unistd::setgroups(&groups).map_err(std::io::Error::from)?;
            nix::unistd::setgid(gid).map_err(std::io::Error::from)?;
            nix::unistd::setuid(uid).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    Ok((rootfs, cmd))
}

fn execute(request: &ChrootRequest, stdin: Option<File>) -> Result<i32> {
    tracing::debug!(bundle = %request.bundle.display(), "Running chroot-isolated command");
    let (rootfs, mut cmd) = set_up(request)?;
    cmd.stdin(match stdin {
        Some(f) => Stdio::from(f),
        None => Stdio::null(),
    });
    let status = cmd.status().map_err(|e| {
        BuildError::RuntimeError(format!("running command in {}: {}", rootfs.display(), e))
    })?;
    use std::os::unix::process::ExitStatusExt;
    Ok(match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        _ => 1,
    })
}

/// Entry point of the helper process. Reads the request from stdin, runs
/// it, and reports on descriptor 3.
pub fn run_chroot_helper() -> Result<i32> {
    // SAFETY: the parent placed the response pipe on this descriptor.
    let mut response = unsafe { File::from_raw_fd(RESPONSE_FD) };
    fcntl(RESPONSE_FD, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| BuildError::RuntimeError(format!("response descriptor: {}", e)))?;

    let request: std::result::Result<ChrootRequest, _> =
        serde_json::from_reader(std::io::stdin().lock());
    let outcome = match request {
        Ok(request) => {
            let stdin = if request.stdin {
                fcntl(STDIN_FD, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                    .map_err(|e| BuildError::RuntimeError(format!("input descriptor: {}", e)))?;
                // SAFETY: the parent placed forwarded input on this descriptor.
                Some(unsafe { File::from_raw_fd(STDIN_FD) })
            } else {
                None
            };
            execute(&request, stdin)
        }
        Err(e) => Err(BuildError::SerializationError(format!(
            "reading chroot request: {}",
            e
        ))),
    };

    let (reply, code) = match outcome {
        Ok(code) => (ChrootResponse::Exited { code }, code),
        Err(e) => (
            ChrootResponse::Failed {
                message: e.to_string(),
            },
            1,
        ),
    };
    response.write_all(&serde_json::to_vec(&reply)?)?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_wire_format() {
        let exited = serde_json::to_string(&ChrootResponse::Exited { code: 3 }).unwrap();
        assert_eq!(exited, r#"{"status":"exited","code":3}"#);
        let failed: ChrootResponse =
            serde_json::from_str(r#"{"status":"failed","message":"boom"}"#).unwrap();
        assert_eq!(
            failed,
            ChrootResponse::Failed {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_has_namespace() {
        use oci_spec::runtime::{LinuxBuilder, LinuxNamespaceBuilder};
        let uts = LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Uts)
            .build()
            .unwrap();
        let mut spec = Spec::default();
        spec.set_linux(Some(LinuxBuilder::default().namespaces(vec![uts]).build().unwrap()));
        assert!(has_namespace(&spec, LinuxNamespaceType::Uts));
        assert!(!has_namespace(&spec, LinuxNamespaceType::Ipc));
        spec.set_linux(None);
        assert!(!has_namespace(&spec, LinuxNamespaceType::Uts));
    }

    #[tokio::test]
    async fn test_helper_without_report_is_an_error() {
        let err = run_with_chroot(ChrootInvocation {
            helper: Some(Path::new("true")),
            bundle: Path::new("/"),
            spec: Spec::default(),
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("without reporting"));
    }

    #[tokio::test]
    async fn test_missing_helper() {
        let err = run_with_chroot(ChrootInvocation {
            helper: Some(Path::new("/nonexistent/a3s-build")),
            bundle: Path::new("/"),
            spec: Spec::default(),
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::RuntimeError(_)));
    }
}
