//! Composable tar stream transforms.
//!
//! A [`TarTransform`] sees every entry of an archive and decides whether
//! to keep it, drop it, or replace its contents; it may also rewrite the
//! header and path in place. [`filter_tar`] applies one transform to a
//! stream, and [`Chain`] composes several.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;

use a3s_build_core::error::{BuildError, Result};

use crate::pipe::os_pipe;

/// One archive entry as seen by a transform.
pub struct TarItem {
    pub header: tar::Header,
    pub path: PathBuf,
    pub link_name: Option<PathBuf>,
}

impl TarItem {
    pub fn new(header: tar::Header, path: impl Into<PathBuf>) -> Self {
        Self {
            header,
            path: path.into(),
            link_name: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.header.entry_type().is_dir()
    }

    pub fn size(&self) -> u64 {
        self.header.size().unwrap_or(0)
    }
}

/// A numeric header field; one left empty (only NULs or spaces) reads as 0.
fn numeric_field(value: std::io::Result<u64>, raw: &[u8]) -> Result<u64> {
    match value {
        Ok(v) => Ok(v),
        Err(_) if raw.iter().all(|b| *b == 0 || *b == b' ') => Ok(0),
        Err(e) => Err(e.into()),
    }
}

pub fn header_mode(header: &tar::Header) -> Result<u32> {
    numeric_field(header.mode().map(u64::from), &header.as_old().mode).map(|m| m as u32)
}

pub fn header_uid(header: &tar::Header) -> Result<u32> {
    numeric_field(header.uid(), &header.as_old().uid).map(|id| id as u32)
}

pub fn header_gid(header: &tar::Header) -> Result<u32> {
    numeric_field(header.gid(), &header.as_old().gid).map(|id| id as u32)
}

pub fn header_mtime(header: &tar::Header) -> Result<u64> {
    numeric_field(header.mtime(), &header.as_old().mtime)
}

/// What to do with an entry after transforming it.
pub enum TarAction {
    Keep,
    Skip,
    /// Emit the header with this content; it must supply exactly
    /// `header.size()` bytes.
    Replace(Box<dyn Read + Send>),
}

/// Per-entry header rewriting.
pub trait TarTransform: Send {
    fn transform(&mut self, item: &mut TarItem) -> Result<TarAction>;
}

impl<F> TarTransform for F
where
    F: FnMut(&mut TarItem) -> Result<TarAction> + Send,
{
    fn transform(&mut self, item: &mut TarItem) -> Result<TarAction> {
        self(item)
    }
}

/// Applies transforms in order. A skip stops the chain; a later
/// replacement wins over an earlier one.
#[derive(Default)]
pub struct Chain {
    transforms: Vec<Box<dyn TarTransform>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: TarTransform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn push<T: TarTransform + 'static>(&mut self, transform: T) {
        self.transforms.push(Box::new(transform));
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl TarTransform for Chain {
    fn transform(&mut self, item: &mut TarItem) -> Result<TarAction> {
        let mut action = TarAction::Keep;
        for t in &mut self.transforms {
            match t.transform(item)? {
                TarAction::Skip => return Ok(TarAction::Skip),
                TarAction::Keep => {}
                replace @ TarAction::Replace(_) => action = replace,
            }
        }
        Ok(action)
    }
}

/// Zero modification, access and change times.
pub fn zero_timestamps(item: &mut TarItem) -> Result<TarAction> {
    item.header.set_mtime(0);
    if let Some(gnu) = item.header.as_gnu_mut() {
        gnu.set_atime(0);
        gnu.set_ctime(0);
    }
    Ok(TarAction::Keep)
}

/// Read an archive from `reader`, transform each entry, and write the
/// result to `writer`. Returns the writer once the output is finished.
pub fn filter_tar<R, W>(reader: R, writer: W, transform: &mut dyn TarTransform) -> Result<W>
where
    R: Read,
    W: Write,
{
    let mut archive = tar::Archive::new(reader);
    let mut builder = tar::Builder::new(writer);
    let entries = archive
        .entries()
        .map_err(|e| BuildError::CopierError(format!("reading tar archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| BuildError::CopierError(format!("reading tar archive: {}", e)))?;
        let path = entry.path()?.into_owned();
        let link_name = entry.link_name()?.map(|l| l.into_owned());
        let mut item = TarItem {
            header: entry.header().clone(),
            path,
            link_name,
        };
        match transform.transform(&mut item)? {
            TarAction::Skip => continue,
            TarAction::Keep => append_item(&mut builder, &mut item, &mut entry)?,
            TarAction::Replace(content) => append_item(&mut builder, &mut item, content)?,
        }
    }
    builder
        .into_inner()
        .map_err(|e| BuildError::CopierError(format!("finishing tar archive: {}", e)))
}

/// Append one entry, enforcing that the content matches the header size.
pub fn append_item<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    item: &mut TarItem,
    content: R,
) -> Result<()> {
    let kind = item.header.entry_type();
    let name = item.path.display().to_string();
    let result = match &item.link_name {
        Some(target) if kind.is_symlink() || kind.is_hard_link() => {
            builder.append_link(&mut item.header, &item.path, target)
        }
        _ => {
            let size = item.header.size()?;
            let exact = ExactReader::new(content, size, name.clone());
            builder.append_data(&mut item.header, &item.path, exact)
        }
    };
    result.map_err(|e| BuildError::CopierError(format!("writing tar entry for {:?}: {}", name, e)))
}

/// Reader that yields exactly `expected` bytes or fails.
struct ExactReader<R> {
    inner: std::io::Take<R>,
    expected: u64,
    seen: u64,
    name: String,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, expected: u64, name: String) -> Self {
        Self {
            inner: inner.take(expected),
            expected,
            seen: 0,
            name,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.seen += n as u64;
        if n == 0 && !buf.is_empty() && self.seen != self.expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "filtering content for {:?}: expected {} bytes, got {} bytes",
                    self.name, self.expected, self.seen
                ),
            ));
        }
        Ok(n)
    }
}

/// A writer that filters the archive written to it on a background
/// thread, forwarding the result to `inner`.
pub struct TarFilterer<W> {
    writer: Option<File>,
    handle: Option<JoinHandle<Result<W>>>,
}

impl<W: Write + Send + 'static> TarFilterer<W> {
    pub fn new<T: TarTransform + 'static>(inner: W, mut transform: T) -> Result<Self> {
        let (mut reader, writer) = os_pipe()?;
        let handle = std::thread::spawn(move || {
            let result = filter_tar(&mut reader, inner, &mut transform);
            // Drain trailing padding so the writer never blocks.
            let _ = std::io::copy(&mut reader, &mut std::io::sink());
            result
        });
        Ok(Self {
            writer: Some(writer),
            handle: Some(handle),
        })
    }

    /// Close the input and wait for the filter. Returns the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.close()
    }

    fn close(&mut self) -> Result<W> {
        drop(self.writer.take());
        let handle = self
            .handle
            .take()
            .ok_or_else(|| BuildError::Internal("tar filter is already closed".to_string()))?;
        handle
            .join()
            .map_err(|_| BuildError::Internal("tar filter thread panicked".to_string()))?
    }
}

impl<W> Write for TarFilterer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf).map_err(|e| {
                std::io::Error::new(e.kind(), format!("writing to tar filter pipe: {}", e))
            }),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tar filter is already closed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<W> Drop for TarFilterer<W> {
    fn drop(&mut self) {
        drop(self.writer.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
