//! Content-addressed cache of decompressed layers.
//!
//! Each layer is stored once under its digest, so a base layer shared by many
//! images is downloaded and decompressed a single time. Files are written to a
//! temporary name and renamed into place; a blob that exists is complete.

use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::layer::{LayerReader, decompress};

#[derive(Debug, Clone)]
pub struct LayerCache {
    dir: PathBuf,
}

impl LayerCache {
    /// The directory is created lazily on the first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the blob for `digest`, or `None` if the digest could not
    /// be a file name (e.g. it contains a path separator).
    pub fn blob_path(&self, digest: &str) -> Option<PathBuf> {
        let (algorithm, hex) = digest.split_once(':')?;
        let safe = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '_' | '-'))
        };
        if !safe(algorithm) || !safe(hex) || hex.starts_with('.') {
            return None;
        }
        Some(self.dir.join(format!("{algorithm}_{hex}")))
    }

    /// Open the cached tar stream for `digest`; `None` on a miss.
    pub fn get(&self, digest: &str) -> io::Result<Option<LayerReader>> {
        let Some(path) = self.blob_path(digest) else {
            return Ok(None);
        };
        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store the uncompressed tar stream `reader` under `digest`.
    ///
    /// Writing the same digest again replaces the file with identical bytes.
    pub fn put(&self, digest: &str, mut reader: impl Read) -> Result<()> {
        let write_error = |source: io::Error| Error::CacheWrite {
            digest: digest.to_string(),
            source,
        };

        let path = self.blob_path(digest).ok_or_else(|| {
            write_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "digest is not usable as a file name",
            ))
        })?;
        fs::create_dir_all(&self.dir).map_err(write_error)?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(write_error)?;
        io::copy(&mut reader, &mut tmp).map_err(write_error)?;
        tmp.as_file().sync_all().map_err(write_error)?;
        tmp.persist(&path).map_err(|e| write_error(e.error))?;

        tracing::debug!(%digest, path = %path.display(), "cached layer");
        Ok(())
    }

    /// Serve `digest` from the cache, or run `fetch` for the compressed blob,
    /// store it decompressed and serve that.
    ///
    /// Failing to write the cache is logged and the fetched bytes are served
    /// from memory instead.
    pub async fn read_through<F, Fut>(&self, digest: &str, fetch: F) -> Result<LayerReader>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        match self.get(digest) {
            Ok(Some(reader)) => {
                tracing::debug!(%digest, "layer cache hit");
                return Ok(reader);
            }
            Ok(None) => tracing::debug!(%digest, "layer cache miss"),
            Err(e) => tracing::warn!(%digest, error = %e, "layer cache unreadable, fetching"),
        }

        let compressed = fetch().await?;

        let stored = decompress(&compressed[..])
            .map_err(|e| Error::stream(digest, e))
            .and_then(|reader| self.put(digest, reader));
        match stored {
            Ok(()) => match self.get(digest) {
                Ok(Some(reader)) => return Ok(reader),
                Ok(None) => tracing::warn!(%digest, "cached layer vanished, serving from memory"),
                Err(e) => tracing::warn!(%digest, error = %e, "cached layer unreadable, serving from memory"),
            },
            Err(e) => tracing::warn!(%digest, error = %e, "not caching layer"),
        }

        decompress(Cursor::new(compressed)).map_err(|e| Error::stream(digest, e))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    const DIGEST: &str = "sha256:aaaabbbbccccdddd";

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn read_all(mut reader: LayerReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_cold_then_warm_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().join("layers"));
        let fetches = AtomicUsize::new(0);
        let payload = b"decompressed layer bytes".to_vec();
        let compressed = gzip(&payload);

        let fetch = || {
            fetches.fetch_add(1, Ordering::SeqCst);
            let bytes = compressed.clone();
            async move { Ok::<_, Error>(bytes) }
        };

        let cold = read_all(cache.read_through(DIGEST, fetch).await.unwrap());
        let warm = read_all(cache.read_through(DIGEST, fetch).await.unwrap());

        assert_eq!(cold, payload);
        assert_eq!(warm, cold);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let stored = std::fs::read(cache.blob_path(DIGEST).unwrap()).unwrap();
        assert_eq!(stored, payload);
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path());
        cache.put(DIGEST, &b"same"[..]).unwrap();
        cache.put(DIGEST, &b"same"[..]).unwrap();

        assert_eq!(read_all(cache.get(DIGEST).unwrap().unwrap()), b"same");
        let blobs = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[tokio::test]
    async fn test_unwritable_cache_still_serves_layer() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the cache directory should be.
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        let cache = LayerCache::new(&blocker);

        let payload = b"fresh".to_vec();
        let compressed = gzip(&payload);
        let reader = cache
            .read_through(DIGEST, || {
                let bytes = compressed.clone();
                async move { Ok::<_, Error>(bytes) }
            })
            .await
            .unwrap();
        assert_eq!(read_all(reader), payload);
        assert!(matches!(
            cache.put(DIGEST, &b"x"[..]),
            Err(Error::CacheWrite { .. })
        ));
    }

    #[test]
    fn test_rejects_path_like_digests() {
        let cache = LayerCache::new("/tmp/cache");
        assert!(cache.blob_path("sha256:../../etc").is_none());
        assert!(cache.blob_path("nodigest").is_none());
        assert_eq!(
            cache.blob_path("sha256:abc").unwrap(),
            PathBuf::from("/tmp/cache/sha256_abc")
        );
    }
}
