//! Images pulled from an OCI registry.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::LayerCache;
use crate::error::{AcquisitionError, Error, Result};
use crate::layer::Layer;
use crate::manifest::Platform;
use crate::reference::ImageReference;
use crate::registry::{DefaultKeychain, Keychain, RegistryClient, RegistryError};
use crate::source::Image;

pub struct RemoteSource {
    keychain: Arc<dyn Keychain>,
    cache: Option<Arc<LayerCache>>,
    platform: Option<Platform>,
    progress: bool,
}

impl Default for RemoteSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteSource {
    /// Anonymous unless the default keychain knows the registry; no cache.
    pub fn new() -> Self {
        Self {
            keychain: Arc::new(DefaultKeychain::default()),
            cache: None,
            platform: None,
            progress: false,
        }
    }

    pub fn with_keychain(mut self, keychain: Arc<dyn Keychain>) -> Self {
        self.keychain = keychain;
        self
    }

    /// Read layers through a cache kept in `dir`.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache = Some(Arc::new(LayerCache::new(dir)));
        self
    }

    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    /// Draw progress bars while layers download. Needs the `progress`
    /// feature; without it downloads stay silent.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn cache(&self) -> Option<&LayerCache> {
        self.cache.as_deref()
    }

    pub async fn resolve(&self, reference: &str) -> Result<Image> {
        let reference = ImageReference::parse(reference)?;
        let credential = self.keychain.resolve_or_anonymous(&reference.registry);

        let mut client = RegistryClient::new(&reference.registry_url(), &reference.repository)
            .with_credential(credential);
        if self.progress {
            client = enable_progress(client);
        }

        let manifest = client
            .get_image_manifest(reference.identifier(), self.platform.as_ref())
            .await
            .map_err(not_found)?;
        let config = client.get_config(&manifest.config).await?;
        tracing::debug!(
            image = %reference,
            config = %manifest.config.digest,
            layers = manifest.layers.len(),
            "fetched manifest"
        );

        let platform = match (config.os, config.architecture) {
            (Some(os), Some(arch)) => Some(Platform::new(&os, &arch)),
            _ => self.platform.clone(),
        };

        // Authentication happened while fetching the manifest, so the client
        // can be shared by concurrent blob downloads from here on.
        let client = Arc::new(client);
        let layers = manifest
            .layers
            .into_iter()
            .map(|descriptor| Layer::from_registry(Arc::clone(&client), descriptor, self.cache.clone()))
            .collect();

        Ok(Image::new(reference.to_string(), layers)
            .with_config_digest(manifest.config.digest)
            .with_platform(platform))
    }
}

fn not_found(err: RegistryError) -> Error {
    match err {
        RegistryError::ManifestNotFound(name) => AcquisitionError::NotFound(name).into(),
        other => other.into(),
    }
}

#[cfg(feature = "progress")]
fn enable_progress(client: RegistryClient) -> RegistryClient {
    client.enable_progress()
}

#[cfg(not(feature = "progress"))]
fn enable_progress(client: RegistryClient) -> RegistryClient {
    tracing::debug!("built without the progress feature, downloads are silent");
    client
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use sha2::{Digest, Sha256};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::list::{self, Format};
    use crate::registry::Credential;

    struct Nobody;

    impl Keychain for Nobody {
        fn resolve(&self, _registry: &str) -> Option<Credential> {
            None
        }
    }

    fn digest_of(data: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(data))
    }

    fn gzip_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&builder.into_inner().unwrap()).unwrap();
        encoder.finish().unwrap()
    }

    /// A registry serving one image over plain HTTP, counting blob requests.
    struct FakeRegistry {
        addr: String,
        blob_hits: Arc<AtomicUsize>,
    }

    impl FakeRegistry {
        async fn start(routes: HashMap<String, (&'static str, Vec<u8>)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let blob_hits = Arc::new(AtomicUsize::new(0));
            let routes = Arc::new(routes);

            let hits = Arc::clone(&blob_hits);
            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let routes = Arc::clone(&routes);
                    let hits = Arc::clone(&hits);
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        let request = String::from_utf8_lossy(&request);
                        let mut parts = request.split_whitespace();
                        let method = parts.next().unwrap_or_default().to_string();
                        let path = parts.next().unwrap_or_default().to_string();

                        let response = match routes.get(&path) {
                            Some((content_type, body)) => {
                                if path.contains("/blobs/") && method == "GET" {
                                    hits.fetch_add(1, Ordering::SeqCst);
                                }
                                let mut head = format!(
                                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                    body.len()
                                )
                                .into_bytes();
                                if method != "HEAD" {
                                    head.extend_from_slice(body);
                                }
                                head
                            }
                            None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_vec(),
                        };
                        let _ = socket.write_all(&response).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });

            Self { addr, blob_hits }
        }
    }

    async fn demo_registry() -> FakeRegistry {
        let base = gzip_layer(&[("etc/passwd", b"root:x:0:0"), ("etc/hostname", b"box")]);
        let top = gzip_layer(&[("etc/.wh.passwd", b""), ("srv/app", b"run")]);
        let config = br#"{"architecture":"arm64","os":"linux",
            "rootfs":{"type":"layers","diff_ids":["sha256:d1","sha256:d2"]}}"#
            .to_vec();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": digest_of(&config),
                "size": config.len(),
            },
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                 "digest": digest_of(&base), "size": base.len()},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                 "digest": digest_of(&top), "size": top.len()},
            ],
        });

        let mut routes = HashMap::new();
        routes.insert(
            "/v2/demo/app/manifests/latest".to_string(),
            (
                "application/vnd.oci.image.manifest.v1+json",
                serde_json::to_vec(&manifest).unwrap(),
            ),
        );
        for blob in [config, base, top] {
            routes.insert(
                format!("/v2/demo/app/blobs/{}", digest_of(&blob)),
                ("application/octet-stream", blob),
            );
        }
        FakeRegistry::start(routes).await
    }

    /// A writer that keeps its bytes reachable after the sink moves away.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    async fn list_remote(source: &RemoteSource, reference: &str) -> String {
        let image = source.resolve(reference).await.unwrap();
        let out = Captured::default();
        list::list_image(&image, Format::Short.sink(out.clone()), &CancellationToken::new(), 2)
            .await
            .unwrap();
        String::from_utf8(out.0.lock().unwrap().clone()).unwrap()
    }

    #[tokio::test]
    async fn test_lists_remote_image_through_cache() {
        let registry = demo_registry().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let source = RemoteSource::new()
            .with_keychain(Arc::new(Nobody))
            .with_cache_dir(cache_dir.path());
        let reference = format!("{}/demo/app", registry.addr);

        let image = source.resolve(&reference).await.unwrap();
        assert_eq!(image.layers().len(), 2);
        assert_eq!(image.platform().unwrap().to_string(), "linux/arm64");

        let cold = list_remote(&source, &reference).await;
        assert_eq!(cold, "/srv/app\n/etc/hostname\n");
        let hits_after_cold = registry.blob_hits.load(Ordering::SeqCst);

        let warm = list_remote(&source, &reference).await;
        assert_eq!(warm, cold);
        // Only the config blob is fetched again; layers come from the cache.
        assert_eq!(registry.blob_hits.load(Ordering::SeqCst), hits_after_cold + 1);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let registry = demo_registry().await;
        let source = RemoteSource::new().with_keychain(Arc::new(Nobody));

        let result = source.resolve(&format!("{}/demo/app:nope", registry.addr)).await;
        assert!(matches!(
            result,
            Err(Error::Acquisition(AcquisitionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_reference_fails_before_io() {
        let result = RemoteSource::new().resolve("Bad Reference").await;
        assert!(matches!(result, Err(Error::Reference { .. })));
    }

    #[tokio::test]
    #[ignore = "needs network access to Docker Hub"]
    async fn test_lists_public_image() {
        let source = RemoteSource::new().with_platform(Some(Platform::new("linux", "amd64")));
        let listing = list_remote(&source, "alpine:3.20").await;
        assert!(listing.lines().any(|line| line == "/etc/alpine-release"));
    }
}
