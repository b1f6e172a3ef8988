//! SHA-256 helpers shared by the store, the digester and commit.

use std::io::{Read, Write};
use std::path::Path;

use a3s_build_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};

/// Algorithm prefix of every digest this crate produces.
pub const SHA256_PREFIX: &str = "sha256:";

/// Digest of the empty input.
pub const EMPTY_SHA256: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Hex-encoded SHA256 of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `sha256:<hex>` of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}{}", SHA256_PREFIX, sha256_bytes(data))
}

/// `sha256:<hex>` of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        BuildError::Other(format!("Failed to open {} for hashing: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())))
}

/// Split `algorithm:hex`, validating both halves.
pub fn parse_digest(digest: &str) -> Result<(&str, &str)> {
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
        BuildError::InvalidArgument(format!("invalid digest {:?}: missing algorithm", digest))
    })?;
    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        other => {
            return Err(BuildError::InvalidArgument(format!(
                "invalid digest {:?}: unsupported algorithm {:?}",
                digest, other
            )))
        }
    };
    if encoded.len() != expected_len
        || !encoded
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(BuildError::InvalidArgument(format!(
            "invalid digest {:?}: bad encoding",
            digest
        )));
    }
    Ok((algorithm, encoded))
}

/// Hex part of a `sha256:` digest, or the input when unprefixed.
pub fn encoded(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Writer that hashes and counts everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `sha256:<hex>` of the bytes written so far.
    pub fn digest(&self) -> String {
        format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.clone().finalize()))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that hashes and counts everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn digest(&self) -> String {
        format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.clone().finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(sha256_digest(b""), EMPTY_SHA256);
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"content").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_digest(b"content"));
    }

    #[test]
    fn test_parse_digest() {
        let (alg, hex) = parse_digest(EMPTY_SHA256).unwrap();
        assert_eq!(alg, "sha256");
        assert_eq!(hex.len(), 64);
        assert!(parse_digest("sha256:abc").is_err());
        assert!(parse_digest("md5:d41d8cd98f00b204e9800998ecf8427e").is_err());
        assert!(parse_digest("nocolon").is_err());
        assert!(parse_digest(&EMPTY_SHA256.to_uppercase().replace("SHA256", "sha256")).is_err());
    }

    #[test]
    fn test_hashing_writer_and_reader_agree() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"layer bytes").unwrap();
        assert_eq!(writer.count(), 11);
        let digest = writer.digest();
        assert_eq!(digest, sha256_digest(b"layer bytes"));

        let mut reader = HashingReader::new(&b"layer bytes"[..]);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(reader.digest(), digest);
        assert_eq!(writer.into_inner(), sink);
    }
}
