//! Relays a container's standard streams.
//!
//! Container output is read from pipes as it becomes available and
//! written straight to its destination. Input is buffered and written to
//! the container's stdin whenever that pipe can take more; once the input
//! is exhausted the pipe is closed, but only after the buffer has drained.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd};

use a3s_build_core::error::{BuildError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

const CHUNK: usize = 8192;
/// Stop reading input while this much is waiting for the container.
const MAX_PENDING: usize = 64 * 1024;

pub(crate) fn set_nonblocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| BuildError::RuntimeError(format!("reading descriptor flags: {}", e)))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| BuildError::RuntimeError(format!("setting descriptor flags: {}", e)))?;
    Ok(())
}

/// Input side of a relay.
pub(crate) struct Input {
    pub source: File,
    pub sink: File,
    /// Close `sink` when `source` runs dry; a terminal stays open
    pub close_on_eof: bool,
}

/// One output stream and where it goes.
pub(crate) struct Output {
    pub source: File,
    pub sink: Box<dyn Write + Send>,
}

struct InputState {
    source: Option<File>,
    sink: Option<File>,
    close_on_eof: bool,
    pending: Vec<u8>,
}

fn ready(flags: PollFlags) -> bool {
    flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
}

/// Copy until every output reaches end of file.
pub(crate) fn relay(input: Option<Input>, outputs: Vec<Output>) -> Result<()> {
    let mut outputs = outputs;
    for output in &outputs {
        set_nonblocking(&output.source)?;
    }
    let mut input = match input {
        Some(i) => {
            set_nonblocking(&i.sink)?;
            Some(InputState {
                source: Some(i.source),
                sink: Some(i.sink),
                close_on_eof: i.close_on_eof,
                pending: Vec::new(),
            })
        }
        None => None,
    };
    let mut buf = vec![0u8; CHUNK];

    while !outputs.is_empty() {
        let (output_events, input_events, sink_events) = {
            let mut fds: Vec<PollFd<'_>> = outputs
                .iter()
                .map(|o| PollFd::new(o.source.as_fd(), PollFlags::POLLIN))
                .collect();
            let mut input_index = None;
            let mut sink_index = None;
            if let Some(state) = &input {
                if let Some(source) = &state.source {
                    if state.pending.len() < MAX_PENDING && state.sink.is_some() {
                        fds.push(PollFd::new(source.as_fd(), PollFlags::POLLIN));
                        input_index = Some(fds.len() - 1);
                    }
                }
                if let Some(sink) = &state.sink {
                    if !state.pending.is_empty() {
                        fds.push(PollFd::new(sink.as_fd(), PollFlags::POLLOUT));
                        sink_index = Some(fds.len() - 1);
                    }
                }
            }
            match poll(&mut fds, PollTimeout::from(100u16)) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(BuildError::RuntimeError(format!("polling stdio: {}", e))),
            }
            let events: Vec<PollFlags> = fds
                .iter()
                .map(|f| f.revents().unwrap_or(PollFlags::empty()))
                .collect();
            (
                events[..outputs.len()].to_vec(),
                input_index.map(|i| events[i]),
                sink_index.map(|i| events[i]),
            )
        };

        let mut closed = Vec::new();
        for (i, flags) in output_events.iter().enumerate() {
            if !ready(*flags) {
                continue;
            }
            let output = &mut outputs[i];
            match output.source.read(&mut buf) {
                Ok(0) => closed.push(i),
                Ok(n) => {
                    output.sink.write_all(&buf[..n])?;
                    output.sink.flush()?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                // a terminal whose other end closed reports EIO
                Err(e) if e.raw_os_error() == Some(libc::EIO) => closed.push(i),
                Err(e) => return Err(e.into()),
            }
        }
        for i in closed.into_iter().rev() {
            outputs.remove(i);
        }

        if let Some(state) = input.as_mut() {
            if let (Some(flags), Some(source)) = (input_events, state.source.as_mut()) {
                if ready(flags) {
                    let room = (MAX_PENDING - state.pending.len()).min(CHUNK);
                    match source.read(&mut buf[..room]) {
                        Ok(0) => state.source = None,
                        Ok(n) => state.pending.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "Input ended");
                            state.source = None;
                        }
                    }
                }
            }
            if let (Some(flags), Some(sink)) = (sink_events, state.sink.as_mut()) {
                if flags.contains(PollFlags::POLLOUT) {
                    match sink.write(&state.pending) {
                        Ok(n) => {
                            state.pending.drain(..n);
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "Container stopped reading input");
                            state.sink = None;
                            state.source = None;
                            state.pending.clear();
                        }
                    }
                } else if flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                    state.sink = None;
                    state.source = None;
                    state.pending.clear();
                }
            }
            if state.source.is_none() && state.pending.is_empty() && state.close_on_eof {
                state.sink = None;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::os_pipe;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_relay_echoes_input_through_a_process_stand_in() {
        // stand-in container: copies its stdin to stdout, then writes to stderr
        let (container_stdin, stdin_writer) = os_pipe().unwrap();
        let (stdout_reader, container_stdout) = os_pipe().unwrap();
        let (stderr_reader, container_stderr) = os_pipe().unwrap();
        let worker = std::thread::spawn(move || {
            let mut input = container_stdin;
            let mut out = container_stdout;
            let mut err = container_stderr;
            let mut data = Vec::new();
            input.read_to_end(&mut data).unwrap();
            out.write_all(&data).unwrap();
            err.write_all(b"done").unwrap();
        });

        let dir = tempfile::TempDir::new().unwrap();
        let input_path = dir.path().join("input");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&input_path, &payload).unwrap();

        let stdout = Shared::default();
        let stderr = Shared::default();
        relay(
            Some(Input {
                source: File::open(&input_path).unwrap(),
                sink: stdin_writer,
                close_on_eof: true,
            }),
            vec![
                Output {
                    source: stdout_reader,
                    sink: Box::new(stdout.clone()),
                },
                Output {
                    source: stderr_reader,
                    sink: Box::new(stderr.clone()),
                },
            ],
        )
        .unwrap();
        worker.join().unwrap();
        assert_eq!(*stdout.0.lock().unwrap(), payload);
        assert_eq!(stderr.0.lock().unwrap().as_slice(), b"done");
    }

    #[test]
    fn test_relay_without_input() {
        let (reader, mut writer) = os_pipe().unwrap();
        let handle = std::thread::spawn(move || {
            writer.write_all(b"hello").unwrap();
        });
        let out = Shared::default();
        relay(
            None,
            vec![Output {
                source: reader,
                sink: Box::new(out.clone()),
            }],
        )
        .unwrap();
        handle.join().unwrap();
        assert_eq!(out.0.lock().unwrap().as_slice(), b"hello");
    }
}
