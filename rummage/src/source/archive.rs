//! Images stored in a local tar file.
//!
//! Two layouts are understood: the one written by `docker save`, described by
//! a top-level `manifest.json`, and an OCI image layout with an `index.json`.
//! Layers are never copied out of the archive; each one is read as a byte
//! range of the archive file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{AcquisitionError, Error, Result};
use crate::layer::Layer;
use crate::manifest::{ArchiveManifestEntry, ImageConfig, Manifest, ManifestList, Platform};
use crate::source::Image;

const DOCKER_MANIFEST: &str = "manifest.json";
const OCI_INDEX: &str = "index.json";

/// Reads images from `docker save` or OCI layout archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveSource;

impl ArchiveSource {
    /// `reference` is the path of the archive.
    pub async fn resolve(&self, reference: &str) -> Result<Image> {
        let path = PathBuf::from(reference);
        tokio::task::spawn_blocking(move || open_archive(&path))
            .await
            .map_err(|e| AcquisitionError::Io(io::Error::other(e)))?
    }
}

/// Location of one archive member's data.
#[derive(Debug, Clone, Copy)]
struct Member {
    offset: u64,
    len: u64,
}

/// Index of an archive's regular files by normalized name.
struct ArchiveIndex {
    path: PathBuf,
    members: HashMap<String, Member>,
}

impl ArchiveIndex {
    fn scan(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                AcquisitionError::NotFound(format!("archive {}", path.display()))
            }
            _ => AcquisitionError::Io(e),
        })?;

        let mut archive = tar::Archive::new(file);
        let mut members = HashMap::new();
        let entries = archive
            .entries()
            .map_err(|e| invalid(path, format!("not a tar archive: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| invalid(path, format!("corrupt tar entry: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = member_name(&String::from_utf8_lossy(&entry.path_bytes()));
            members.insert(
                name,
                Member {
                    offset: entry.raw_file_position(),
                    len: entry.size(),
                },
            );
        }

        tracing::debug!(archive = %path.display(), members = members.len(), "indexed archive");
        Ok(Self {
            path: path.to_path_buf(),
            members,
        })
    }

    fn member(&self, name: &str) -> Result<Member> {
        self.members
            .get(&member_name(name))
            .copied()
            .ok_or_else(|| invalid(&self.path, format!("missing {name}")))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let member = self.member(name)?;
        let mut file = File::open(&self.path).map_err(AcquisitionError::Io)?;
        file.seek(SeekFrom::Start(member.offset))
            .map_err(AcquisitionError::Io)?;
        let mut data = Vec::with_capacity(member.len as usize);
        file.take(member.len)
            .read_to_end(&mut data)
            .map_err(AcquisitionError::Io)?;
        Ok(data)
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let data = self.read(name)?;
        serde_json::from_slice(&data).map_err(|e| invalid(&self.path, format!("bad {name}: {e}")))
    }

    fn layer(&self, digest: &str, name: &str) -> Result<Layer> {
        let member = self.member(name)?;
        Ok(Layer::from_file_range(
            digest,
            self.path.clone(),
            member.offset,
            member.len,
        ))
    }

    fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }
}

/// Read the image stored in the archive at `path`.
pub fn open_archive(path: &Path) -> Result<Image> {
    let index = ArchiveIndex::scan(path)?;
    if index.contains(DOCKER_MANIFEST) {
        docker_image(&index)
    } else if index.contains(OCI_INDEX) {
        oci_image(&index)
    } else {
        Err(invalid(
            path,
            format!("neither {DOCKER_MANIFEST} nor {OCI_INDEX} found"),
        ))
    }
}

fn docker_image(index: &ArchiveIndex) -> Result<Image> {
    let entries: Vec<ArchiveManifestEntry> = index.read_json(DOCKER_MANIFEST)?;
    let entry = single(index, entries)?;
    let config: ImageConfig = index.read_json(&entry.config)?;

    let layers = entry
        .layers
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let digest = config
                .rootfs
                .diff_ids
                .get(i)
                .cloned()
                .unwrap_or_else(|| digest_from_name(name));
            index.layer(&digest, name)
        })
        .collect::<Result<Vec<_>>>()?;

    let name = entry
        .repo_tags
        .as_ref()
        .and_then(|tags| tags.first().cloned())
        .unwrap_or_else(|| default_name(&index.path));

    Ok(Image::new(name, layers)
        .with_config_digest(digest_from_name(&entry.config))
        .with_platform(platform_of(&config)))
}

fn oci_image(index: &ArchiveIndex) -> Result<Image> {
    let list: ManifestList = index.read_json(OCI_INDEX)?;
    let mut descriptor = single(index, list.manifests)?;
    let name = descriptor
        .annotations
        .as_ref()
        .and_then(|a| a.get("org.opencontainers.image.ref.name").cloned())
        .unwrap_or_else(|| default_name(&index.path));

    // A top-level entry may itself be a per-platform index; follow one level.
    let mut followed = false;
    let manifest = loop {
        let data = index.read(&blob_name(index, &descriptor.digest)?)?;
        let media_type = Some(descriptor.media_type.as_str()).filter(|m| !m.is_empty());
        let parsed = Manifest::from_slice(media_type, &data).map_err(|e| {
            invalid(&index.path, format!("bad manifest {}: {e}", descriptor.digest))
        })?;
        match parsed {
            Manifest::Image(manifest) => break manifest,
            Manifest::Index(nested) if !followed => {
                descriptor = nested.select(None).cloned().ok_or_else(|| {
                    invalid(&index.path, format!("empty index {}", descriptor.digest))
                })?;
                followed = true;
            }
            Manifest::Index(_) => {
                return Err(invalid(&index.path, "image indexes nested too deeply"));
            }
        }
    };

    let config: Option<ImageConfig> = blob_name(index, &manifest.config.digest)
        .and_then(|name| index.read_json(&name))
        .ok();

    let layers = manifest
        .layers
        .iter()
        .map(|layer| index.layer(&layer.digest, &blob_name(index, &layer.digest)?))
        .collect::<Result<Vec<_>>>()?;

    Ok(Image::new(name, layers)
        .with_config_digest(manifest.config.digest.clone())
        .with_platform(config.as_ref().and_then(platform_of)))
}

/// Exactly one image is expected per archive.
fn single<T>(index: &ArchiveIndex, items: Vec<T>) -> Result<T> {
    let count = items.len();
    let mut items = items.into_iter();
    match (items.next(), count) {
        (Some(item), 1) => Ok(item),
        (None, _) => Err(invalid(&index.path, "archive holds no image")),
        _ => Err(invalid(
            &index.path,
            format!("archive holds {count} images, expected one"),
        )),
    }
}

/// `blobs/<algorithm>/<hex>` for a digest.
fn blob_name(index: &ArchiveIndex, digest: &str) -> Result<String> {
    let (algorithm, hex) = digest
        .split_once(':')
        .filter(|(a, h)| !a.is_empty() && !h.is_empty() && !h.contains('/'))
        .ok_or_else(|| invalid(&index.path, format!("bad digest {digest}")))?;
    Ok(format!("blobs/{algorithm}/{hex}"))
}

/// Best-effort digest for a member such as `blobs/sha256/<hex>` or
/// `<hex>.json`.
fn digest_from_name(name: &str) -> String {
    let name = member_name(name);
    if let Some((algorithm, hex)) = name.strip_prefix("blobs/").and_then(|r| r.split_once('/')) {
        return format!("{algorithm}:{hex}");
    }
    match name.strip_suffix(".json") {
        Some(hex) if !hex.contains('/') => format!("sha256:{hex}"),
        _ => name,
    }
}

fn platform_of(config: &ImageConfig) -> Option<Platform> {
    match (&config.os, &config.architecture) {
        (Some(os), Some(arch)) => Some(Platform::new(os, arch)),
        _ => None,
    }
}

fn default_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn member_name(raw: &str) -> String {
    raw.trim_start_matches("./").trim_start_matches('/').to_string()
}

fn invalid(path: &Path, reason: impl Into<String>) -> Error {
    AcquisitionError::InvalidArchive {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::reader::{LayerStream, Merger};

    fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn write_archive(dir: &tempfile::TempDir, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.path().join("image.tar");
        std::fs::write(&path, tar_of(files)).unwrap();
        path
    }

    async fn list_paths(image: &Image) -> Vec<String> {
        let mut streams = Vec::new();
        for layer in image.layers() {
            streams.push(LayerStream::new(layer.digest(), layer.open().await.unwrap()));
        }
        Merger::new(streams).map(|e| e.unwrap().path).collect()
    }

    const CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux",
        "rootfs":{"type":"layers","diff_ids":["sha256:base","sha256:top"]}}"#;

    #[tokio::test]
    async fn test_docker_save_layout() {
        let dir = tempfile::tempdir().unwrap();
        let base = tar_of(&[("etc/passwd", b"root"), ("etc/hosts", b"")]);
        let top = gzip(&tar_of(&[("etc/.wh.passwd", b""), ("app", b"bin")]));
        let manifest = br#"[{"Config":"abc.json","RepoTags":["demo:1.0"],
            "Layers":["l1/layer.tar","l2/layer.tar"]}]"#;
        let path = write_archive(
            &dir,
            &[
                ("manifest.json", manifest),
                ("abc.json", CONFIG),
                ("l1/layer.tar", &base),
                ("l2/layer.tar", &top),
            ],
        );

        let image = ArchiveSource.resolve(path.to_str().unwrap()).await.unwrap();
        assert_eq!(image.name(), "demo:1.0");
        assert_eq!(image.config_digest(), Some("sha256:abc"));
        assert_eq!(image.platform().unwrap().to_string(), "linux/amd64");
        let digests: Vec<&str> = image.layers().iter().map(|l| l.digest()).collect();
        assert_eq!(digests, vec!["sha256:base", "sha256:top"]);

        assert_eq!(list_paths(&image).await, vec!["/app", "/etc/hosts"]);
    }

    #[tokio::test]
    async fn test_oci_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layer = gzip(&tar_of(&[("usr/bin/tool", b"#!")]));
        let index = br#"{"schemaVersion":2,"manifests":[{"mediaType":"application/vnd.oci.image.manifest.v1+json",
            "digest":"sha256:m1","size":1,
            "annotations":{"org.opencontainers.image.ref.name":"oci:tag"}}]}"#;
        let manifest = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json",
            "config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:c1","size":1},
            "layers":[{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"sha256:l1","size":1}]}"#;
        let path = write_archive(
            &dir,
            &[
                ("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#),
                ("index.json", index),
                ("blobs/sha256/m1", manifest),
                ("blobs/sha256/c1", CONFIG),
                ("blobs/sha256/l1", &layer),
            ],
        );

        let image = open_archive(&path).unwrap();
        assert_eq!(image.name(), "oci:tag");
        assert_eq!(image.config_digest(), Some("sha256:c1"));
        assert_eq!(list_paths(&image).await, vec!["/usr/bin/tool"]);
    }

    #[test]
    fn test_missing_manifest_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(&dir, &[("random.txt", b"hello")]);
        assert!(matches!(
            open_archive(&path),
            Err(Error::Acquisition(AcquisitionError::InvalidArchive { .. }))
        ));
    }

    #[test]
    fn test_multiple_images_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = br#"[{"Config":"a.json","Layers":[]},{"Config":"b.json","Layers":[]}]"#;
        let path = write_archive(&dir, &[("manifest.json", manifest), ("a.json", CONFIG)]);
        match open_archive(&path) {
            Err(Error::Acquisition(AcquisitionError::InvalidArchive { reason, .. })) => {
                assert!(reason.contains("2 images"), "{reason}");
            }
            other => panic!("expected an invalid archive, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_layer_blob_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = br#"[{"Config":"abc.json","Layers":["gone/layer.tar"]}]"#;
        let path = write_archive(&dir, &[("manifest.json", manifest), ("abc.json", CONFIG)]);
        match open_archive(&path) {
            Err(Error::Acquisition(AcquisitionError::InvalidArchive { reason, .. })) => {
                assert!(reason.contains("gone/layer.tar"), "{reason}");
            }
            other => panic!("expected an invalid archive, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_not_found() {
        assert!(matches!(
            open_archive(Path::new("/definitely/not/here.tar")),
            Err(Error::Acquisition(AcquisitionError::NotFound(_)))
        ));
    }

    #[test]
    fn test_digest_from_name() {
        assert_eq!(digest_from_name("blobs/sha256/abc"), "sha256:abc");
        assert_eq!(digest_from_name("./abc.json"), "sha256:abc");
        assert_eq!(digest_from_name("l1/layer.tar"), "l1/layer.tar");
    }
}
