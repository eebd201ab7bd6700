//! Layer handles and the readers that turn their blobs into tar streams.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use flate2::read::GzDecoder;

use crate::cache::LayerCache;
use crate::error::{Error, Result};
use crate::manifest::Descriptor;
use crate::registry::RegistryClient;

/// An uncompressed tar stream for one layer.
pub type LayerReader = Box<dyn Read + Send>;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if header.starts_with(ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Wrap `reader` in the decoder its leading bytes call for.
pub fn decompress<'a, R: Read + Send + 'a>(reader: R) -> io::Result<Box<dyn Read + Send + 'a>> {
    let mut reader = BufReader::new(reader);
    let compression = Compression::detect(reader.fill_buf()?);
    Ok(match compression {
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::Decoder::with_buffer(reader)?),
        Compression::None => Box::new(reader),
    })
}

enum Blob {
    /// A byte range inside a local file, e.g. a member of an image archive.
    FileRange {
        path: PathBuf,
        offset: u64,
        len: u64,
    },
    Remote {
        client: Arc<RegistryClient>,
        descriptor: Descriptor,
        cache: Option<Arc<LayerCache>>,
    },
    Memory(Arc<[u8]>),
}

/// One entry in an image's layer stack.
pub struct Layer {
    digest: String,
    media_type: String,
    size: u64,
    blob: Blob,
}

impl Layer {
    pub fn from_file_range(digest: &str, path: PathBuf, offset: u64, len: u64) -> Self {
        Self {
            digest: digest.to_string(),
            media_type: String::new(),
            size: len,
            blob: Blob::FileRange { path, offset, len },
        }
    }

    pub fn from_registry(
        client: Arc<RegistryClient>,
        descriptor: Descriptor,
        cache: Option<Arc<LayerCache>>,
    ) -> Self {
        Self {
            digest: descriptor.digest.clone(),
            media_type: descriptor.media_type.clone(),
            size: descriptor.size,
            blob: Blob::Remote {
                client,
                descriptor,
                cache,
            },
        }
    }

    /// A layer held in memory; the bytes may be compressed.
    pub fn from_bytes(digest: &str, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            digest: digest.to_string(),
            media_type: String::new(),
            size: bytes.len() as u64,
            blob: Blob::Memory(bytes),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Size of the stored blob, which is usually compressed.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the layer as an uncompressed tar stream.
    pub async fn open(&self) -> Result<LayerReader> {
        match &self.blob {
            Blob::FileRange { path, offset, len } => {
                let open = || -> io::Result<LayerReader> {
                    let mut file = File::open(path)?;
                    file.seek(SeekFrom::Start(*offset))?;
                    decompress(file.take(*len))
                };
                open().map_err(|e| Error::stream(&self.digest, e))
            }
            Blob::Remote {
                client,
                descriptor,
                cache,
            } => {
                let fetch =
                    move || async move { Ok::<_, Error>(client.fetch_blob(descriptor).await?) };
                match cache {
                    Some(cache) => cache.read_through(&self.digest, fetch).await,
                    None => {
                        let bytes = fetch().await?;
                        decompress(Cursor::new(bytes)).map_err(|e| Error::stream(&self.digest, e))
                    }
                }
            }
            Blob::Memory(bytes) => decompress(Cursor::new(Arc::clone(bytes)))
                .map_err(|e| Error::stream(&self.digest, e)),
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("digest", &self.digest)
            .field("media_type", &self.media_type)
            .field("size", &self.size)
            .finish()
    }
}
