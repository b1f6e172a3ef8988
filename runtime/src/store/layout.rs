//! OCI image layout directories.
//!
//! Reading is used to start builds from `oci:<path>` images; writing is
//! the target of commits to `oci:<dir>[:<tag>]`.

use std::io::Read;
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};

use super::{write_atomic, Image, Store};
use crate::archive::decompress;
use crate::digest::{encoded, parse_digest, sha256_digest, HashingWriter};
use crate::image::docker::DockerManifest;
use crate::image::oci::{Descriptor, OciIndex, OciManifest};
use crate::image::ImageConfig;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Split an `oci:` reference into a directory and an optional tag.
pub fn parse_layout_reference(reference: &str) -> Option<(PathBuf, Option<String>)> {
    let rest = reference.strip_prefix("oci:")?;
    match rest.rsplit_once(':') {
        Some((dir, tag)) if !tag.is_empty() && !tag.contains('/') => {
            Some((PathBuf::from(dir), Some(tag.to_string())))
        }
        _ => Some((PathBuf::from(rest), None)),
    }
}

/// An image read from a layout.
#[derive(Debug, Clone)]
pub struct LayoutImage {
    pub manifest_digest: String,
    pub manifest: Vec<u8>,
    pub config: Vec<u8>,
    /// Layer descriptors, bottom to top
    pub layers: Vec<Descriptor>,
}

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open an existing layout.
    pub fn open(path: &Path) -> Result<Self> {
        for required in [OCI_LAYOUT_FILE, "index.json", "blobs"] {
            if !path.join(required).exists() {
                return Err(BuildError::NotFound(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    path.display()
                )));
            }
        }
        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    /// Open a layout, creating an empty one if the directory has none.
    pub fn create(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path.join("blobs").join("sha256")).map_err(|e| {
            BuildError::StorageError(format!(
                "Failed to create OCI layout {}: {}",
                path.display(),
                e
            ))
        })?;
        if !path.join(OCI_LAYOUT_FILE).exists() {
            write_atomic(&path.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT.as_bytes())?;
        }
        let layout = Self {
            root: path.to_path_buf(),
        };
        if !path.join("index.json").exists() {
            layout.write_index(&OciIndex::default())?;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob by digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algorithm, hash) = match digest.split_once(':') {
            Some((a, h)) => (a, h),
            None => ("sha256", digest),
        };
        self.root.join("blobs").join(algorithm).join(hash)
    }

    pub fn index(&self) -> Result<OciIndex> {
        let path = self.root.join("index.json");
        let content = std::fs::read(&path).map_err(|e| {
            BuildError::StorageError(format!(
                "Failed to read index.json at {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_slice(&content).map_err(|e| {
            BuildError::SerializationError(format!("Failed to parse index.json: {}", e))
        })
    }

    fn write_index(&self, index: &OciIndex) -> Result<()> {
        let data = serde_json::to_vec(index)?;
        write_atomic(&self.root.join("index.json"), &data)
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        std::fs::read(&path).map_err(|e| {
            BuildError::StorageError(format!("Failed to read blob {}: {}", path.display(), e))
        })
    }

    /// Store a small blob, returning its digest.
    pub fn put_blob(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        let path = self.blob_path(&digest);
        if !path.exists() {
            write_atomic(&path, data)?;
        }
        Ok(digest)
    }

    /// Move or copy a blob file whose digest is already known.
    pub fn put_blob_file(&self, file: &Path, digest: &str) -> Result<()> {
        parse_digest(digest)?;
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        std::fs::copy(file, &tmp).map_err(|e| {
            BuildError::StorageError(format!(
                "Failed to copy {} to {}: {}",
                file.display(),
                tmp.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            BuildError::StorageError(format!("Failed to rename {}: {}", tmp.display(), e))
        })
    }

    /// Record a manifest (already stored as a blob) in the index.
    pub fn add_manifest(&self, media_type: &str, manifest: &[u8], tag: Option<&str>) -> Result<String> {
        let digest = self.put_blob(manifest)?;
        let mut index = self.index()?;
        index.add(Descriptor::new(media_type, &digest, manifest.len() as i64), tag);
        self.write_index(&index)?;
        Ok(digest)
    }

    /// Read the image tagged `tag`, or the first one.
    pub fn image(&self, tag: Option<&str>) -> Result<LayoutImage> {
        let index = self.index()?;
        let descriptor = index.find(tag).ok_or_else(|| match tag {
            Some(tag) => BuildError::NotFound(format!(
                "no image tagged {:?} in {}",
                tag,
                self.root.display()
            )),
            None => BuildError::NotFound(format!("No manifests in {}/index.json", self.root.display())),
        })?;
        let manifest_digest = descriptor.digest.clone();
        let manifest = self.read_blob(&manifest_digest)?;
        let (config_digest, layers) = parse_manifest(&manifest)?;
        let config = self.read_blob(&config_digest)?;
        Ok(LayoutImage {
            manifest_digest,
            manifest,
            config,
            layers,
        })
    }
}

/// Config digest and layers of an OCI or Docker v2s2 manifest.
pub fn parse_manifest(manifest: &[u8]) -> Result<(String, Vec<Descriptor>)> {
    let value: serde_json::Value = serde_json::from_slice(manifest)
        .map_err(|e| BuildError::SerializationError(format!("Failed to parse manifest: {}", e)))?;
    let media_type = value.get("mediaType").and_then(|m| m.as_str()).unwrap_or("");
    if media_type == crate::define::DOCKER_MANIFEST_MEDIA_TYPE {
        let docker: DockerManifest = serde_json::from_value(value)?;
        let layers = docker
            .layers
            .into_iter()
            .map(|l| Descriptor::new(&l.media_type, &l.digest, l.size))
            .collect();
        return Ok((docker.config.digest, layers));
    }
    let oci: OciManifest = serde_json::from_value(value)?;
    Ok((oci.config.digest, oci.layers))
}

/// Copy an image from a layout into the store, applying each layer on
/// top of the previous one. Layers already present are reused.
pub fn import_image(store: &Store, layout: &OciLayout, tag: Option<&str>, names: &[String]) -> Result<Image> {
    let image = layout.image(tag)?;
    let config = ImageConfig::from_json(&image.config)?;
    if config.diff_ids.len() != image.layers.len() {
        return Err(BuildError::StorageError(format!(
            "image in {} lists {} layers but {} diff IDs",
            layout.root().display(),
            image.layers.len(),
            config.diff_ids.len()
        )));
    }
    let mut parent: Option<String> = None;
    for (descriptor, diff_id) in image.layers.iter().zip(&config.diff_ids) {
        let path = layout.blob_path(&descriptor.digest);
        let file = std::fs::File::open(&path).map_err(|e| {
            BuildError::StorageError(format!("Failed to open layer {}: {}", path.display(), e))
        })?;
        let (_, stream) = decompress(file)?;
        let layer = store.apply_diff(parent.as_deref(), diff_id, Some(&descriptor.digest), stream)?;
        tracing::debug!(layer = %layer.id, blob = %descriptor.digest, "Imported layer");
        parent = Some(layer.id);
    }
    let id = encoded(&sha256_digest(&image.config)).to_string();
    store.create_image(&id, names, parent.as_deref(), &image.manifest, &image.config)
}

/// Write an uncompressed layer stream from `reader` as a blob, returning
/// its digest and size.
pub fn put_layer_stream<R: Read>(layout: &OciLayout, mut reader: R) -> Result<(String, u64)> {
    let tmp = tempfile::NamedTempFile::new_in(layout.root().join("blobs"))?;
    let mut writer = HashingWriter::new(tmp.reopen()?);
    std::io::copy(&mut reader, &mut writer)?;
    let digest = writer.digest();
    let size = writer.count();
    let path = layout.blob_path(&digest);
    tmp.persist(&path).map_err(|e| {
        BuildError::StorageError(format!("Failed to persist blob {}: {}", path.display(), e))
    })?;
    Ok((digest, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::define::{OCI_CONFIG_MEDIA_TYPE, OCI_LAYER_GZIP_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn layer_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(11);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, "bin/agent", &b"#!/bin/true"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    /// A layout holding one single-layer image tagged `latest`.
    fn create_image_layout(path: &Path) -> OciLayout {
        let layout = OciLayout::create(path).unwrap();
        let tar_data = layer_tar();
        let diff_id = sha256_digest(&tar_data);
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_data).unwrap();
        let gz = encoder.finish().unwrap();
        let layer_digest = layout.put_blob(&gz).unwrap();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Entrypoint": ["/bin/agent"], "WorkingDir": "/workspace"},
            "rootfs": {"type": "layers", "diff_ids": [diff_id]},
            "history": [{"created_by": "ADD agent"}]
        });
        let config = serde_json::to_vec(&config).unwrap();
        let config_digest = layout.put_blob(&config).unwrap();
        let mut manifest = OciManifest::new(Descriptor::new(
            OCI_CONFIG_MEDIA_TYPE,
            &config_digest,
            config.len() as i64,
        ));
        manifest.layers.push(Descriptor::new(
            OCI_LAYER_GZIP_MEDIA_TYPE,
            &layer_digest,
            gz.len() as i64,
        ));
        let manifest = serde_json::to_vec(&manifest).unwrap();
        layout
            .add_manifest(OCI_MANIFEST_MEDIA_TYPE, &manifest, Some("latest"))
            .unwrap();
        layout
    }

    #[test]
    fn test_parse_layout_reference() {
        assert_eq!(
            parse_layout_reference("oci:/tmp/img:v1"),
            Some((PathBuf::from("/tmp/img"), Some("v1".to_string())))
        );
        assert_eq!(
            parse_layout_reference("oci:/tmp/img"),
            Some((PathBuf::from("/tmp/img"), None))
        );
        assert_eq!(parse_layout_reference("alpine"), None);
    }

    #[test]
    fn test_open_requires_layout_files() {
        let dir = TempDir::new().unwrap();
        let err = OciLayout::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));
        OciLayout::create(dir.path()).unwrap();
        assert!(OciLayout::open(dir.path()).is_ok());
    }

    #[test]
    fn test_read_image() {
        let dir = TempDir::new().unwrap();
        let layout = create_image_layout(dir.path());
        let image = layout.image(Some("latest")).unwrap();
        assert_eq!(image.layers.len(), 1);
        let config = ImageConfig::from_json(&image.config).unwrap();
        assert_eq!(config.config.working_dir, "/workspace");
        assert!(layout.image(Some("missing")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_import_into_store() {
        let dir = TempDir::new().unwrap();
        let layout = create_image_layout(&dir.path().join("layout"));
        let store = Store::new(&dir.path().join("root"), &dir.path().join("run")).unwrap();
        let image = import_image(&store, &layout, None, &["localhost/agent:latest".to_string()]).unwrap();
        let top = image.top_layer.clone().unwrap();
        assert!(store.layer_path(&top).join("bin/agent").is_file());
        assert_eq!(store.image("agent").unwrap().id, image.id);

        // a second import reuses the layer
        let again = import_image(&store, &layout, None, &[]).unwrap();
        assert_eq!(again.top_layer, image.top_layer);
        assert_eq!(store.layers().unwrap().len(), 1);
    }

    #[test]
    fn test_put_layer_stream() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        let (digest, size) = put_layer_stream(&layout, &b"blob"[..]).unwrap();
        assert_eq!(digest, sha256_digest(b"blob"));
        assert_eq!(size, 4);
        assert_eq!(layout.read_blob(&digest).unwrap(), b"blob");
    }
}
