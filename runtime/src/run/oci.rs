//! Running a bundle with an OCI runtime.
//!
//! The runtime is driven one subcommand at a time: `create`, `start`, then
//! `state` every 100ms until the container stops or its output streams
//! close, whichever comes first. The container's init process is
//! reparented to this process so that its exit status can be collected.
//! The container is always deleted afterwards.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use a3s_build_core::error::{BuildError, Result};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};

use super::stdio::{relay, Input, Output};
use crate::pipe::os_pipe;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One container managed through the runtime binary.
pub(crate) struct RuntimeInvocation<'a> {
    pub runtime: &'a str,
    pub runtime_args: &'a [String],
    pub bundle: &'a Path,
    pub name: String,
    pub terminal: bool,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

impl RuntimeInvocation<'_> {
    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(self.runtime);
        cmd.args(self.runtime_args).arg(subcommand);
        cmd
    }
}

/// Deletes the runtime's record of the container when dropped.
struct RuntimeContainer {
    runtime: String,
    runtime_args: Vec<String>,
    name: String,
}

impl Drop for RuntimeContainer {
    fn drop(&mut self) {
        let result = std::process::Command::new(&self.runtime)
            .args(&self.runtime_args)
            .args(["delete", "--force", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        match result {
            Ok(out) if out.status.success() => {
                tracing::debug!(container = %self.name, "Deleted runtime container")
            }
            Ok(out) => tracing::warn!(
                container = %self.name,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "Failed to delete runtime container"
            ),
            Err(e) => tracing::warn!(container = %self.name, error = %e, "Failed to run runtime delete"),
        }
    }
}

/// Puts a terminal into raw mode until dropped.
struct RawMode {
    fd: OwnedFd,
    saved: Termios,
}

impl RawMode {
    fn enter(fd: OwnedFd) -> Option<Self> {
        let saved = tcgetattr(fd.as_fd()).ok()?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(fd.as_fd(), SetArg::TCSANOW, &raw).ok()?;
        Some(Self { fd, saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(self.fd.as_fd(), SetArg::TCSANOW, &self.saved) {
            tracing::warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Receive the terminal's controlling descriptor from the runtime.
fn receive_fd(stream: &UnixStream) -> Result<OwnedFd> {
    let mut data = [0u8; 4096];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    // SAFETY: CMSG_SPACE only computes a size.
    let space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
    let mut control = vec![0u8; space];
    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;
    // SAFETY: msg points at buffers that outlive the call.
    let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(BuildError::RuntimeError(format!(
            "receiving console descriptor: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: msg was filled in by recvmsg.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    // SAFETY: cmsg is checked for null before it is read.
    if cmsg.is_null()
        || unsafe { (*cmsg).cmsg_level } != libc::SOL_SOCKET
        || unsafe { (*cmsg).cmsg_type } != libc::SCM_RIGHTS
    {
        return Err(BuildError::RuntimeError(
            "runtime sent no console descriptor".to_string(),
        ));
    }
    // SAFETY: an SCM_RIGHTS message carries at least one descriptor, now ours.
    let fd = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd) };
    // SAFETY: the descriptor was just received and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn become_subreaper() {
    // SAFETY: PR_SET_CHILD_SUBREAPER takes a plain integer flag.
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_CHILD_SUBREAPER,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "Failed to become a subreaper; exit status may be unavailable"
        );
    }
}

fn status_error(what: &str, status: std::process::ExitStatus, stderr: &[u8]) -> BuildError {
    let detail = String::from_utf8_lossy(stderr).trim().to_string();
    if detail.is_empty() {
        BuildError::RuntimeError(format!("{} failed: {}", what, status))
    } else {
        BuildError::RuntimeError(format!("{} failed: {}: {}", what, status, detail))
    }
}

async fn container_status(inv: &RuntimeInvocation<'_>) -> Result<String> {
    let out = inv
        .command("state")
        .arg(&inv.name)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BuildError::RuntimeError(format!("running {} state: {}", inv.runtime, e)))?;
    if !out.status.success() {
        return Err(status_error(
            &format!("{} state {}", inv.runtime, inv.name),
            out.status,
            &out.stderr,
        ));
    }
    let state: serde_json::Value = serde_json::from_slice(&out.stdout).map_err(|e| {
        BuildError::RuntimeError(format!("parsing state of {}: {}", inv.name, e))
    })?;
    Ok(state["status"].as_str().unwrap_or_default().to_string())
}

async fn kill(inv: &RuntimeInvocation<'_>) {
    tracing::info!(container = %inv.name, "Forwarding signal as SIGKILL");
    let result = inv
        .command("kill")
        .args([inv.name.as_str(), "KILL"])
        .stdin(Stdio::null())
        .output()
        .await;
    if let Err(e) = result {
        tracing::warn!(container = %inv.name, error = %e, "Failed to kill container");
    }
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => 1,
    }
}

fn output_sink(file: Option<File>, stderr: bool) -> Box<dyn std::io::Write + Send> {
    match (file, stderr) {
        (Some(f), _) => Box::new(f),
        (None, false) => Box::new(std::io::stdout()),
        (None, true) => Box::new(std::io::stderr()),
    }
}

fn our_stdin() -> Result<File> {
    let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
    Ok(File::from(fd))
}

/// Run the bundle and return the container's exit code.
pub(crate) async fn run_with_runtime(mut inv: RuntimeInvocation<'_>) -> Result<i32> {
    become_subreaper();
    let pid_file: PathBuf = inv.bundle.join("pid");
    let console_path = inv.bundle.join("console.sock");

    let mut create = inv.command("create");
    create
        .arg("--bundle")
        .arg(inv.bundle)
        .arg("--pid-file")
        .arg(&pid_file);

    let mut console_listener = None;
    let mut relay_parts: Option<(Option<Input>, Vec<Output>)> = None;
    if inv.terminal {
        let listener = UnixListener::bind(&console_path).map_err(|e| {
            BuildError::RuntimeError(format!("listening on {}: {}", console_path.display(), e))
        })?;
        console_listener = Some(listener);
        create
            .arg("--console-socket")
            .arg(&console_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    } else {
        let input = match inv.stdin.take() {
            Some(source) => {
                let (container_stdin, sink) = os_pipe()?;
                create.stdin(Stdio::from(container_stdin));
                Some(Input {
                    source,
                    sink,
                    close_on_eof: true,
                })
            }
            None => {
                create.stdin(Stdio::null());
                None
            }
        };
        let (stdout_reader, stdout_writer) = os_pipe()?;
        let (stderr_reader, stderr_writer) = os_pipe()?;
        create
            .stdout(Stdio::from(stdout_writer))
            .stderr(Stdio::from(stderr_writer));
        relay_parts = Some((
            input,
            vec![
                Output {
                    source: stdout_reader,
                    sink: output_sink(inv.stdout.take(), false),
                },
                Output {
                    source: stderr_reader,
                    sink: output_sink(inv.stderr.take(), true),
                },
            ],
        ));
    }
    create.arg(&inv.name);

    tracing::debug!(runtime = inv.runtime, container = %inv.name, bundle = %inv.bundle.display(), "Creating container");
    let child = create
        .spawn()
        .map_err(|e| BuildError::RuntimeError(format!("running {} create: {}", inv.runtime, e)))?;
    // our copies of the container's ends must close for output to end
    drop(create);
    let _container = RuntimeContainer {
        runtime: inv.runtime.to_string(),
        runtime_args: inv.runtime_args.to_vec(),
        name: inv.name.clone(),
    };

    let mut relay_task = relay_parts.map(|(input, outputs)| {
        tokio::task::spawn_blocking(move || relay(input, outputs))
    });

    let created = child
        .wait_with_output()
        .await
        .map_err(|e| BuildError::RuntimeError(format!("waiting for {} create: {}", inv.runtime, e)))?;
    if !created.status.success() {
        return Err(status_error(
            &format!("{} create {}", inv.runtime, inv.name),
            created.status,
            &created.stderr,
        ));
    }

    let mut _raw_mode = None;
    if let Some(listener) = console_listener.take() {
        let (stream, _) = listener.accept().map_err(|e| {
            BuildError::RuntimeError(format!("accepting console connection: {}", e))
        })?;
        let master = File::from(receive_fd(&stream)?);
        let source = match inv.stdin.take() {
            Some(f) => f,
            None => {
                let stdin = our_stdin()?;
                _raw_mode = stdin.as_fd().try_clone_to_owned().ok().and_then(RawMode::enter);
                stdin
            }
        };
        let input = Input {
            source,
            sink: master.try_clone()?,
            close_on_eof: false,
        };
        let outputs = vec![Output {
            source: master,
            sink: output_sink(inv.stdout.take(), false),
        }];
        relay_task = Some(tokio::task::spawn_blocking(move || relay(Some(input), outputs)));
    }

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .map_err(|e| BuildError::RuntimeError(format!("reading {}: {}", pid_file.display(), e)))?
        .trim()
        .parse()
        .map_err(|e| BuildError::RuntimeError(format!("parsing {}: {}", pid_file.display(), e)))?;

    let started = inv
        .command("start")
        .arg(&inv.name)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BuildError::RuntimeError(format!("running {} start: {}", inv.runtime, e)))?;
    if !started.status.success() {
        return Err(status_error(
            &format!("{} start {}", inv.runtime, inv.name),
            started.status,
            &started.stderr,
        ));
    }
    tracing::debug!(container = %inv.name, pid, "Started container");

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut relay_result: Option<Result<()>> = None;
    loop {
        let status = container_status(&inv).await?;
        match status.as_str() {
            "creating" | "created" | "running" => {}
            "stopped" => break,
            other => {
                return Err(BuildError::RuntimeError(format!(
                    "container {} in unexpected state {:?}",
                    inv.name, other
                )))
            }
        }
        let copying = relay_task.is_some() && relay_result.is_none();
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = interrupt.recv() => kill(&inv).await,
            _ = terminate.recv() => kill(&inv).await,
            _ = hangup.recv() => kill(&inv).await,
            joined = async {
                match relay_task.as_mut() {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            }, if copying => {
                relay_result = Some(joined.unwrap_or_else(|e| {
                    Err(BuildError::Internal(format!("stdio relay panicked: {}", e)))
                }));
                break;
            }
        }
    }

    let status = tokio::task::spawn_blocking(move || waitpid(Pid::from_raw(pid), None))
        .await
        .map_err(|e| BuildError::Internal(format!("waiting for container: {}", e)))?
        .map_err(|e| BuildError::RuntimeError(format!("waiting for container process {}: {}", pid, e)))?;

    if relay_result.is_none() {
        if let Some(task) = relay_task.take() {
            relay_result = Some(task.await.unwrap_or_else(|e| {
                Err(BuildError::Internal(format!("stdio relay panicked: {}", e)))
            }));
        }
    }
    if let Some(Err(e)) = relay_result {
        tracing::warn!(error = %e, "Stdio relay failed");
    }
    Ok(exit_code(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), 3);
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, nix::sys::signal::Signal::SIGKILL, false)),
            137
        );
    }

    #[tokio::test]
    async fn test_missing_runtime_binary() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = run_with_runtime(RuntimeInvocation {
            runtime: "/nonexistent/a3s-build-runtime",
            runtime_args: &[],
            bundle: dir.path(),
            name: "a3s-build-test".to_string(),
            terminal: false,
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("create"));
    }

    #[tokio::test]
    async fn test_failing_create_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = run_with_runtime(RuntimeInvocation {
            runtime: "false",
            runtime_args: &[],
            bundle: dir.path(),
            name: "a3s-build-test".to_string(),
            terminal: false,
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::RuntimeError(_)));
    }
}
