//! Layer blobs for a commit.
//!
//! A layer is produced by writing an uncompressed tar stream through a
//! chain of header transforms, hashing it (the diff ID), optionally
//! compressing it and hashing the result (the blob digest). The blob is
//! kept in a file named by its digest until the destination takes it.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::{IdMappings, IdPair};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;

use crate::archive::{decompress, Compression};
use crate::copier::{clean_path, resolve_in_root, ConditionalRemovePath, EnsureParentPath, FileTime};
use crate::digest::{encoded, sha256_file, HashingReader, HashingWriter};
use crate::store::diff::write_diff;
use crate::store::Store;
use crate::tarfilter::{Chain, TarAction, TarFilterer, TarItem};

/// Where a layer's blob can be read from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BlobSource {
    /// A file holding exactly the blob
    File(PathBuf),
    /// The uncompressed diff of a store layer, produced on demand
    StoreLayer(String),
}

/// One layer of the image being committed.
#[derive(Debug, Clone)]
pub(crate) struct CommitLayer {
    pub what: String,
    pub media_type: &'static str,
    pub digest: String,
    pub size: u64,
    pub diff_id: String,
    pub source: BlobSource,
}

/// A freshly written blob.
#[derive(Debug, Clone)]
pub(crate) struct LayerBlob {
    pub path: PathBuf,
    pub digest: String,
    pub size: u64,
    pub diff_id: String,
    pub compression: Compression,
}

enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    fn new(inner: W, compression: Compression) -> Result<Self> {
        match compression {
            Compression::Uncompressed => Ok(Encoder::Plain(inner)),
            Compression::Gzip => Ok(Encoder::Gzip(GzEncoder::new(
                inner,
                flate2::Compression::default(),
            ))),
            other => Err(BuildError::CommitError(format!(
                "{} compression is not supported for image layers",
                other.name()
            ))),
        }
    }

    fn finish(self) -> std::io::Result<W> {
        match self {
            Encoder::Plain(w) => Ok(w),
            Encoder::Gzip(gz) => gz.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gzip(gz) => gz.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gzip(gz) => gz.flush(),
        }
    }
}

type BlobWriter = HashingWriter<Encoder<HashingWriter<File>>>;

/// Write one layer blob into `blob_dir`. `fill` writes the uncompressed
/// tar stream; `transform`, when given, rewrites its entries first.
pub(crate) fn write_layer_blob<F>(
    blob_dir: &Path,
    what: &str,
    compression: Compression,
    transform: Option<Chain>,
    fill: F,
) -> Result<LayerBlob>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let tmp = tempfile::NamedTempFile::new_in(blob_dir).map_err(|e| {
        BuildError::CommitError(format!(
            "creating temporary blob for {} in {}: {}",
            what,
            blob_dir.display(),
            e
        ))
    })?;
    let file = tmp.reopen()?;
    let writer: BlobWriter = HashingWriter::new(Encoder::new(HashingWriter::new(file), compression)?);

    let writer = match transform {
        Some(chain) => {
            let mut filterer = TarFilterer::new(writer, chain)?;
            let filled = fill(&mut filterer);
            let finished = filterer.finish();
            match (filled, finished) {
                (Ok(()), Ok(w)) => w,
                (Err(e), _) | (Ok(()), Err(e)) => return Err(e),
            }
        }
        None => {
            let mut writer = writer;
            fill(&mut writer)?;
            writer
        }
    };

    let diff_id = writer.digest();
    let diff_size = writer.count();
    let mut counted = writer
        .into_inner()
        .finish()
        .map_err(|e| BuildError::CommitError(format!("compressing {}: {}", what, e)))?;
    counted.flush()?;
    let digest = counted.digest();
    let size = counted.count();
    counted.into_inner().sync_all()?;

    let path = blob_dir.join(encoded(&digest));
    tmp.persist(&path).map_err(|e| {
        BuildError::CommitError(format!("storing blob {}: {}", path.display(), e))
    })?;
    tracing::debug!(what, digest = %digest, diff_id = %diff_id, size, diff_size, "Wrote layer blob");
    Ok(LayerBlob {
        path,
        digest,
        size,
        diff_id,
        compression,
    })
}

/// Digest, size, diff ID and compression of an existing blob file.
pub(crate) fn inspect_blob(path: &Path) -> Result<(String, u64, String, Compression)> {
    let digest = sha256_file(path)?;
    let size = std::fs::metadata(path)?.len();
    let file = File::open(path).map_err(|e| {
        BuildError::CommitError(format!("opening blob {}: {}", path.display(), e))
    })?;
    let (compression, stream) = decompress(file)?;
    let mut reader = HashingReader::new(stream);
    std::io::copy(&mut reader, &mut std::io::sink()).map_err(|e| {
        BuildError::CommitError(format!("reading blob {}: {}", path.display(), e))
    })?;
    Ok((digest, size, reader.digest(), compression))
}

/// Uncompressed contents of a layer, verified against its diff ID while
/// it is read by the destination.
pub(crate) fn open_uncompressed(
    store: &Store,
    layer: &CommitLayer,
    scratch: &Path,
) -> Result<Box<dyn Read + Send>> {
    match &layer.source {
        BlobSource::File(path) => {
            let file = File::open(path).map_err(|e| {
                BuildError::CommitError(format!("opening blob {}: {}", path.display(), e))
            })?;
            Ok(decompress(file)?.1)
        }
        BlobSource::StoreLayer(id) => {
            let path = materialize_store_layer(store, id, &layer.diff_id, scratch)?;
            Ok(Box::new(File::open(path)?))
        }
    }
}

/// Write a store layer's diff to a file in `dir` and check that it is
/// still the content the digest was trusted for.
pub(crate) fn materialize_store_layer(
    store: &Store,
    id: &str,
    expected: &str,
    dir: &Path,
) -> Result<PathBuf> {
    let path = dir.join(format!("layer-{}", id));
    let file = File::create(&path)?;
    let writer = store.diff(id, HashingWriter::new(file))?;
    let actual = writer.digest();
    if actual != expected {
        let _ = std::fs::remove_file(&path);
        return Err(BuildError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    writer.into_inner().sync_all()?;
    Ok(path)
}

/// How entry timestamps are rewritten.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Timestamps {
    Keep,
    /// Every entry gets this time
    Exact(i64),
    /// Entries newer than this time get it
    Clamp(i64),
}

impl Timestamps {
    pub fn transform(self) -> Option<impl FnMut(&mut TarItem) -> Result<TarAction> + Send> {
        if self == Timestamps::Keep {
            return None;
        }
        Some(move |item: &mut TarItem| {
            let mtime = item.header.mtime().unwrap_or(0) as i64;
            let wanted = match self {
                Timestamps::Exact(t) => t,
                Timestamps::Clamp(t) if mtime > t => t,
                _ => mtime,
            };
            item.header.set_mtime(wanted.max(0) as u64);
            if let Some(gnu) = item.header.as_gnu_mut() {
                gnu.set_atime(0);
                gnu.set_ctime(0);
            }
            Ok(TarAction::Keep)
        })
    }
}

/// Map entry owners from host IDs back into the container.
pub(crate) fn unmap_owners(
    id_mappings: IdMappings,
) -> Option<impl FnMut(&mut TarItem) -> Result<TarAction> + Send> {
    if id_mappings.is_identity() {
        return None;
    }
    Some(move |item: &mut TarItem| {
        let host = IdPair::new(
            item.header.uid().unwrap_or(0) as u32,
            item.header.gid().unwrap_or(0) as u32,
        );
        let mapped = id_mappings.to_container(host).map_err(|e| {
            BuildError::CommitError(format!(
                "mapping owner of {}: {}",
                item.path.display(),
                e
            ))
        })?;
        item.header.set_uid(mapped.uid as u64);
        item.header.set_gid(mapped.gid as u64);
        Ok(TarAction::Keep)
    })
}

/// Give every entry to root.
pub(crate) fn root_owned(item: &mut TarItem) -> Result<TarAction> {
    item.header.set_uid(0);
    item.header.set_gid(0);
    Ok(TarAction::Keep)
}

fn absolute(path: &Path) -> PathBuf {
    clean_path(&Path::new("/").join(path))
}

/// Paths left out of the working layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct Exclusions {
    /// Dropped while the entry still looks the way it was recorded
    conditional: Vec<(PathBuf, ConditionalRemovePath)>,
    /// Dropped unconditionally
    always: BTreeSet<PathBuf>,
}

/// Directories Docker leaves out of layers when they belong to root.
const COMPAT_OMISSIONS: &[&str] = &["/dev", "/proc", "/sys"];

impl Exclusions {
    /// Created mount targets are dropped while unchanged. Pulled-up
    /// parents are dropped only when `base` (the rootfs of the layer below
    /// the working layer) still has them with the recorded metadata.
    pub fn new(
        created: Vec<ConditionalRemovePath>,
        pulled_up: &[EnsureParentPath],
        base: Option<&Path>,
        compat_omissions: bool,
        id_mappings: &IdMappings,
    ) -> Result<Self> {
        let mut exclusions = Exclusions::default();
        for mut item in created {
            if let Some(owner) = item.owner {
                item.owner = Some(id_mappings.to_host(owner)?);
            }
            exclusions.conditional.push((absolute(Path::new(&item.path)), item));
        }
        if compat_omissions {
            let root = Some(id_mappings.root_pair());
            for path in COMPAT_OMISSIONS {
                exclusions.conditional.push((
                    PathBuf::from(path),
                    ConditionalRemovePath {
                        path: path.to_string(),
                        mod_time: None,
                        mode: None,
                        owner: root,
                    },
                ));
            }
        }
        if let Some(base) = base {
            for item in pulled_up {
                let path = absolute(Path::new(&item.path));
                if pulled_up_unchanged(base, &path, item, id_mappings) {
                    exclusions.always.insert(path);
                }
            }
        }
        Ok(exclusions)
    }

    pub fn is_empty(&self) -> bool {
        self.conditional.is_empty() && self.always.is_empty()
    }

    fn excludes(&self, item: &TarItem) -> bool {
        let path = absolute(&item.path);
        if self.always.contains(&path) {
            return true;
        }
        self.conditional
            .iter()
            .filter(|(p, _)| *p == path)
            .any(|(_, recorded)| header_matches(&item.header, recorded))
    }

    pub fn transform(self) -> impl FnMut(&mut TarItem) -> Result<TarAction> + Send {
        move |item: &mut TarItem| {
            if self.excludes(item) {
                tracing::debug!(path = %item.path.display(), "Excluding from layer");
                Ok(TarAction::Skip)
            } else {
                Ok(TarAction::Keep)
            }
        }
    }
}

fn header_matches(header: &tar::Header, recorded: &ConditionalRemovePath) -> bool {
    if let Some(mode) = recorded.mode {
        if header.mode().unwrap_or(0) & 0o777 != mode & 0o777 {
            return false;
        }
    }
    if let Some(when) = &recorded.mod_time {
        if header.mtime().unwrap_or(0) as i64 != when.timestamp() {
            return false;
        }
    }
    if let Some(owner) = recorded.owner {
        if header.uid().unwrap_or(0) as u32 != owner.uid
            || header.gid().unwrap_or(0) as u32 != owner.gid
        {
            return false;
        }
    }
    true
}

fn pulled_up_unchanged(
    base: &Path,
    path: &Path,
    recorded: &EnsureParentPath,
    id_mappings: &IdMappings,
) -> bool {
    let host = match resolve_in_root(base, path) {
        Ok(h) => h,
        Err(_) => return false,
    };
    let meta = match std::fs::symlink_metadata(&host) {
        Ok(m) => m,
        Err(_) => return false,
    };
    if let Some(mode) = recorded.mode {
        if meta.permissions().mode() & 0o777 != mode & 0o777 {
            return false;
        }
    }
    if let Some(when) = &recorded.mod_time {
        if FileTime::mtime_of(&meta).secs != when.timestamp() {
            return false;
        }
    }
    if let Some(owner) = recorded.owner {
        match id_mappings.to_host(owner) {
            Ok(host) if (meta.uid(), meta.gid()) == (host.uid, host.gid) => {}
            _ => return false,
        }
    }
    true
}

/// Build a tree holding `content` (image path to host file or
/// directory) under `staging`, for the extra-content layer.
pub(crate) fn stage_extra_content(
    staging: &Path,
    content: &std::collections::BTreeMap<String, PathBuf>,
) -> Result<()> {
    for (destination, source) in content {
        let target = staging.join(
            clean_path(&Path::new("/").join(destination))
                .strip_prefix("/")
                .unwrap_or(Path::new("")),
        );
        if target == staging {
            return Err(BuildError::InvalidArgument(format!(
                "extra image content destination {:?} names the root directory",
                destination
            )));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let meta = std::fs::metadata(source).map_err(|e| {
            BuildError::CommitError(format!(
                "reading extra image content {}: {}",
                source.display(),
                e
            ))
        })?;
        if meta.is_dir() {
            std::fs::create_dir_all(&target)?;
            crate::store::diff::copy_tree(source, &target)?;
        } else {
            std::fs::copy(source, &target).map_err(|e| {
                BuildError::CommitError(format!(
                    "copying extra image content {} to {}: {}",
                    source.display(),
                    target.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

/// The whole tree under `dir` as a layer.
pub(crate) fn write_tree(dir: &Path, writer: &mut dyn Write) -> Result<()> {
    write_diff(None, dir, writer)?;
    Ok(())
}

/// Time as seconds since the epoch, for [`Timestamps`].
pub(crate) fn seconds(when: &DateTime<Utc>) -> i64 {
    when.timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entries(blob: &LayerBlob) -> Vec<(String, u64, u64)> {
        let file = File::open(&blob.path).unwrap();
        let (_, stream) = decompress(file).unwrap();
        let mut archive = tar::Archive::new(stream);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().display().to_string(),
                    e.header().mtime().unwrap(),
                    e.header().uid().unwrap(),
                )
            })
            .collect()
    }

    fn tree(dir: &TempDir) -> PathBuf {
        let root = dir.path().join("tree");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/motd"), "hello").unwrap();
        std::fs::create_dir_all(root.join("run/secrets")).unwrap();
        root
    }

    #[test]
    fn test_gzip_blob_digests() {
        let dir = TempDir::new().unwrap();
        let root = tree(&dir);
        let blobs = dir.path().join("blobs");
        std::fs::create_dir_all(&blobs).unwrap();
        let blob = write_layer_blob(&blobs, "layer", Compression::Gzip, None, |w| write_tree(&root, w))
            .unwrap();
        assert_eq!(blob.path, blobs.join(encoded(&blob.digest)));
        assert_eq!(sha256_file(&blob.path).unwrap(), blob.digest);
        let (digest, size, diff_id, compression) = inspect_blob(&blob.path).unwrap();
        assert_eq!(digest, blob.digest);
        assert_eq!(size, blob.size);
        assert_eq!(diff_id, blob.diff_id);
        assert_eq!(compression, Compression::Gzip);
        assert_ne!(blob.digest, blob.diff_id);
    }

    #[test]
    fn test_rejects_other_compression() {
        let dir = TempDir::new().unwrap();
        let err = write_layer_blob(dir.path(), "layer", Compression::Zstd, None, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, BuildError::CommitError(_)));
    }

    #[test]
    fn test_fixed_timestamps_are_reproducible() {
        let dir = TempDir::new().unwrap();
        let root = tree(&dir);
        let blobs = dir.path().join("blobs");
        std::fs::create_dir_all(&blobs).unwrap();
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let write = || {
            let mut chain = Chain::new();
            if let Some(t) = Timestamps::Exact(seconds(&when)).transform() {
                chain.push(t);
            }
            write_layer_blob(&blobs, "layer", Compression::Gzip, Some(chain), |w| write_tree(&root, w))
                .unwrap()
        };
        let first = write();
        std::fs::write(root.join("etc/motd"), "hello").unwrap();
        let second = write();
        assert_eq!(first.digest, second.digest);
        assert!(entries(&first).iter().all(|(_, mtime, _)| *mtime == seconds(&when) as u64));
    }

    #[test]
    fn test_clamped_timestamps() {
        let mut item = TarItem::new(tar::Header::new_gnu(), "a");
        item.header.set_mtime(500);
        let mut clamp = Timestamps::Clamp(100).transform().unwrap();
        clamp(&mut item).unwrap();
        assert_eq!(item.header.mtime().unwrap(), 100);
        item.header.set_mtime(50);
        clamp(&mut item).unwrap();
        assert_eq!(item.header.mtime().unwrap(), 50);
        assert!(Timestamps::Keep.transform().is_none());
    }

    #[test]
    fn test_exclusions() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        std::fs::create_dir_all(base.join("etc")).unwrap();
        std::fs::set_permissions(base.join("etc"), std::fs::Permissions::from_mode(0o755)).unwrap();
        let etc_meta = std::fs::metadata(base.join("etc")).unwrap();
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();

        let created = vec![ConditionalRemovePath {
            path: "/run/secrets".to_string(),
            mod_time: Some(epoch),
            mode: Some(0o755),
            owner: None,
        }];
        let pulled_up = vec![
            EnsureParentPath {
                path: "etc".to_string(),
                mod_time: Some(FileTime::mtime_of(&etc_meta).to_chrono()),
                mode: Some(0o755),
                owner: None,
            },
            EnsureParentPath {
                path: "/var".to_string(),
                mod_time: None,
                mode: None,
                owner: None,
            },
        ];
        let exclusions =
            Exclusions::new(created, &pulled_up, Some(&base), true, &IdMappings::default()).unwrap();
        let mut transform = exclusions.transform();

        let mut check = |path: &str, mode: u32, mtime: u64, uid: u64| {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(mode);
            header.set_mtime(mtime);
            header.set_uid(uid);
            let mut item = TarItem::new(header, path);
            matches!(transform(&mut item).unwrap(), TarAction::Skip)
        };
        assert!(check("run/secrets", 0o755, 0, 0));
        assert!(!check("run/secrets", 0o755, 99, 0));
        assert!(check("etc", 0o755, 12345, 0));
        assert!(!check("var", 0o755, 0, 0));
        assert!(check("proc", 0o555, 7, 0));
        assert!(!check("proc", 0o555, 7, 1000));
        assert!(!check("etc/motd", 0o644, 0, 0));
    }

    #[test]
    fn test_unmap_owners() {
        let mappings = IdMappings::new(
            vec![a3s_build_core::IdMap::new(0, 100000, 65536)],
            vec![a3s_build_core::IdMap::new(0, 100000, 65536)],
        );
        let mut transform = unmap_owners(mappings).unwrap();
        let mut item = TarItem::new(tar::Header::new_gnu(), "a");
        item.header.set_uid(100001);
        item.header.set_gid(100000);
        transform(&mut item).unwrap();
        assert_eq!((item.header.uid().unwrap(), item.header.gid().unwrap()), (1, 0));
        assert!(unmap_owners(IdMappings::default()).is_none());
    }

    #[test]
    fn test_stage_extra_content() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("ca.pem");
        std::fs::write(&source, "cert").unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let mut content = std::collections::BTreeMap::new();
        content.insert("/etc/ssl/ca.pem".to_string(), source.clone());
        stage_extra_content(&staging, &content).unwrap();
        assert_eq!(std::fs::read_to_string(staging.join("etc/ssl/ca.pem")).unwrap(), "cert");

        let mut root = std::collections::BTreeMap::new();
        root.insert("/".to_string(), source);
        assert!(stage_extra_content(&staging, &root).is_err());
    }
}
