//! Compression detection and transparent decompression.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use a3s_build_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// Stream compression algorithms recognized by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Uncompressed,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    /// Identify the algorithm from the first bytes of a stream.
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if header.starts_with(b"BZh") {
            Compression::Bzip2
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Compression::Xz
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Compression::Zstd
        } else {
            Compression::Uncompressed
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" | "uncompressed" => Ok(Compression::Uncompressed),
            "gzip" => Ok(Compression::Gzip),
            "bzip2" => Ok(Compression::Bzip2),
            "xz" => Ok(Compression::Xz),
            "zstd" => Ok(Compression::Zstd),
            other => Err(BuildError::InvalidArgument(format!(
                "unrecognized compression {:?}",
                other
            ))),
        }
    }
}

/// Wrap `reader` in the decoder matching its magic bytes.
pub fn decompress<R>(reader: R) -> Result<(Compression, Box<dyn Read + Send>)>
where
    R: Read + Send + 'static,
{
    let mut buffered = BufReader::new(reader);
    let compression = Compression::detect(buffered.fill_buf()?);
    let stream: Box<dyn Read + Send> = match compression {
        Compression::Uncompressed => Box::new(buffered),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(buffered)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(buffered)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(buffered)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(buffered)?),
    };
    Ok((compression, stream))
}

/// Whether the file is a (possibly compressed) tar archive.
///
/// Unreadable or short files are simply not archives.
pub fn is_archive(path: &Path) -> bool {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let (_, mut stream) = match decompress(file) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let mut block = [0u8; 512];
    if stream.read_exact(&mut block).is_err() {
        return false;
    }
    is_tar_header(&block)
}

fn is_tar_header(block: &[u8; 512]) -> bool {
    if &block[257..262] == b"ustar" {
        return true;
    }
    // v7 archives carry no magic; fall back to the header checksum
    let stored = std::str::from_utf8(&block[148..156])
        .ok()
        .map(|s| s.trim_matches(|c: char| c == '\0' || c == ' '))
        .and_then(|s| u32::from_str_radix(s, 8).ok());
    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { 32 } else { *b as u32 })
        .sum();
    stored == Some(computed) && block[0] != 0
}
