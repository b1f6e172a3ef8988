//! OS pipes for streaming between worker threads and subprocesses.

use std::fs::File;

use a3s_build_core::error::{BuildError, Result};

/// Create a pipe, returning `(reader, writer)`.
///
/// Both ends are close-on-exec; dropping the writer signals EOF to the
/// reader.
pub fn os_pipe() -> Result<(File, File)> {
    let (read_fd, write_fd) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .map_err(|e| BuildError::Other(format!("Failed to create pipe: {}", e)))?;
    Ok((File::from(read_fd), File::from(write_fd)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_pipe_eof_after_writer_drop() {
        let (mut reader, mut writer) = os_pipe().unwrap();
        let handle = std::thread::spawn(move || {
            writer.write_all(b"through the pipe").unwrap();
        });
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        handle.join().unwrap();
        assert_eq!(out, "through the pipe");
    }
}
