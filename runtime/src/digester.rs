//! Content digests for ADD/COPY history entries.
//!
//! A [`CompositeDigester`] accumulates one digest per copied item. Raw
//! items are hashed as-is; "file" and "dir" items are tar streams whose
//! timestamps are zeroed before hashing so the result only depends on
//! names, modes, ownership and content.

use std::io::Write;

use a3s_build_core::error::Result;
use sha2::{Digest as _, Sha256};

use crate::digest::{sha256_digest, SHA256_PREFIX};
use crate::tarfilter::{zero_timestamps, TarFilterer};

/// Kind of content fed to a digester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Raw,
    File,
    Dir,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Raw => "",
            ContentType::File => "file",
            ContentType::Dir => "dir",
        }
    }
}

/// A writer that produces a digest of what was written.
pub trait Digester: Write + Send {
    fn content_type(&self) -> ContentType;

    /// Flush pending work. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// `sha256:<hex>` of the content; only meaningful after `close`.
    fn digest(&self) -> String;
}

/// Hashes bytes exactly as written.
pub struct SimpleDigester {
    hasher: Sha256,
    content_type: ContentType,
}

impl SimpleDigester {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            hasher: Sha256::new(),
            content_type,
        }
    }
}

impl Write for SimpleDigester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Digester for SimpleDigester {
    fn content_type(&self) -> ContentType {
        self.content_type
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn digest(&self) -> String {
        format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.clone().finalize()))
    }
}

/// Hashes a tar stream after normalizing its timestamps.
pub struct TarDigester {
    content_type: ContentType,
    filterer: Option<TarFilterer<SimpleDigester>>,
    nested: Option<SimpleDigester>,
}

impl TarDigester {
    pub fn new(content_type: ContentType) -> Result<Self> {
        let nested = SimpleDigester::new(content_type);
        Ok(Self {
            content_type,
            filterer: Some(TarFilterer::new(nested, zero_timestamps)?),
            nested: None,
        })
    }
}

impl Write for TarDigester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.filterer.as_mut() {
            Some(f) => f.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "digester is already closed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.filterer.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Digester for TarDigester {
    fn content_type(&self) -> ContentType {
        self.content_type
    }

    fn close(&mut self) -> Result<()> {
        if let Some(filterer) = self.filterer.take() {
            self.nested = Some(filterer.finish()?);
        }
        Ok(())
    }

    fn digest(&self) -> String {
        match &self.nested {
            Some(nested) => nested.digest(),
            None => String::new(),
        }
    }
}

/// A sequence of digesters, one per copied item.
#[derive(Default)]
pub struct CompositeDigester {
    digesters: Vec<Box<dyn Digester>>,
}

impl CompositeDigester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything digested so far.
    pub fn restart(&mut self) {
        self.close_open();
        self.digesters.clear();
    }

    /// Begin a new item.
    pub fn start(&mut self, content_type: ContentType) -> Result<()> {
        self.close_open();
        let digester: Box<dyn Digester> = match content_type {
            ContentType::Raw => Box::new(SimpleDigester::new(ContentType::Raw)),
            ContentType::File | ContentType::Dir => Box::new(TarDigester::new(content_type)?),
        };
        self.digesters.push(digester);
        Ok(())
    }

    /// Writer for the item most recently started.
    pub fn hash(&mut self) -> Option<&mut (dyn Digester + 'static)> {
        self.digesters.last_mut().map(|d| d.as_mut())
    }

    fn close_open(&mut self) {
        if let Some(last) = self.digesters.last_mut() {
            if let Err(e) = last.close() {
                tracing::warn!(error = %e, "Failed to finish content digest");
            }
        }
    }

    /// Content type and digest summarizing every item.
    ///
    /// A single item reports its own type and digest; several items are
    /// combined into a "multi" digest over their individual digests.
    pub fn digest(&mut self) -> (String, String) {
        self.close_open();
        match self.digesters.len() {
            0 => (String::new(), String::new()),
            1 => (
                self.digesters[0].content_type().as_str().to_string(),
                self.digesters[0].digest(),
            ),
            _ => {
                let content = self
                    .digesters
                    .iter()
                    .map(|d| {
                        let digest = d.digest();
                        let encoded = digest.strip_prefix(SHA256_PREFIX).unwrap_or(&digest);
                        match d.content_type() {
                            ContentType::Raw => encoded.to_string(),
                            other => format!("{}:{}", other.as_str(), encoded),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                ("multi".to_string(), sha256_digest(content.as_bytes()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_with_mtime(mtime: u64) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        builder.append_data(&mut header, "file", &b"data"[..]).unwrap();
        builder.into_inner().unwrap()
    }

    fn digest_of(content_type: ContentType, data: &[u8]) -> (String, String) {
        let mut composite = CompositeDigester::new();
        composite.start(content_type).unwrap();
        composite.hash().unwrap().write_all(data).unwrap();
        composite.digest()
    }

    #[test]
    fn test_raw_digest() {
        let (kind, digest) = digest_of(ContentType::Raw, b"hello");
        assert_eq!(kind, "");
        assert_eq!(digest, sha256_digest(b"hello"));
    }

    #[test]
    fn test_tar_digest_ignores_timestamps() {
        let (kind, a) = digest_of(ContentType::File, &tar_with_mtime(1));
        let (_, b) = digest_of(ContentType::File, &tar_with_mtime(1_800_000_000));
        assert_eq!(kind, "file");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn test_multi_digest() {
        let mut composite = CompositeDigester::new();
        composite.start(ContentType::Raw).unwrap();
        composite.hash().unwrap().write_all(b"one").unwrap();
        composite.start(ContentType::Dir).unwrap();
        composite
            .hash()
            .unwrap()
            .write_all(&tar_with_mtime(5))
            .unwrap();
        let (kind, digest) = composite.digest();
        assert_eq!(kind, "multi");

        let (_, dir_digest) = digest_of(ContentType::Dir, &tar_with_mtime(5));
        let expected_content = format!(
            "{},dir:{}",
            crate::digest::sha256_bytes(b"one"),
            dir_digest.trim_start_matches("sha256:")
        );
        assert_eq!(digest, sha256_digest(expected_content.as_bytes()));
    }

    #[test]
    fn test_restart_clears() {
        let mut composite = CompositeDigester::new();
        composite.start(ContentType::Raw).unwrap();
        composite.restart();
        assert_eq!(composite.digest(), (String::new(), String::new()));
        assert!(composite.hash().is_none());
    }
}
