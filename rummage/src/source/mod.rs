//! Where images come from: a registry, the local daemon or an archive file.
//!
//! Every source resolves a reference string to an [`Image`]: the ordered
//! layer stack plus what the manifest says about it.

pub mod archive;
pub mod daemon;
pub mod remote;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tempfile::TempPath;

pub use archive::ArchiveSource;
pub use daemon::DaemonSource;
pub use remote::RemoteSource;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::manifest::Platform;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceKind {
    #[default]
    Remote,
    Daemon,
    Archive,
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Ok(SourceKind::Remote),
            "daemon" => Ok(SourceKind::Daemon),
            "archive" | "tarball" => Ok(SourceKind::Archive),
            _ => Err(Error::SourceUnsupported(s.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Remote => "remote",
            SourceKind::Daemon => "daemon",
            SourceKind::Archive => "archive",
        })
    }
}

/// A resolved image, ready to be listed. Layers are ordered base first.
#[derive(Debug)]
pub struct Image {
    name: String,
    config_digest: Option<String>,
    platform: Option<Platform>,
    layers: Vec<Layer>,
    /// Keeps an exported archive on disk while its layers are read.
    scratch: Option<TempPath>,
}

impl Image {
    pub fn new(name: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self {
            name: name.into(),
            config_digest: None,
            platform: None,
            layers,
            scratch: None,
        }
    }

    pub fn with_config_digest(mut self, digest: impl Into<String>) -> Self {
        self.config_digest = Some(digest.into());
        self
    }

    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub(crate) fn with_scratch(mut self, scratch: TempPath) -> Self {
        self.scratch = Some(scratch);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config_digest(&self) -> Option<&str> {
        self.config_digest.as_deref()
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Whether the image is backed by a temporary export.
    pub fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }
}

/// The configured source, chosen once per run.
pub enum ImageSource {
    Remote(RemoteSource),
    Daemon(DaemonSource),
    Archive(ArchiveSource),
}

impl ImageSource {
    pub fn from_config(config: &Config) -> Self {
        match config.source {
            SourceKind::Remote => {
                let mut source = RemoteSource::new()
                    .with_platform(config.platform.clone())
                    .with_progress(config.progress);
                if let Some(dir) = &config.cache_dir {
                    source = source.with_cache_dir(dir.clone());
                }
                ImageSource::Remote(source)
            }
            SourceKind::Daemon => ImageSource::Daemon(DaemonSource::from_env()),
            SourceKind::Archive => ImageSource::Archive(ArchiveSource),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            ImageSource::Remote(_) => SourceKind::Remote,
            ImageSource::Daemon(_) => SourceKind::Daemon,
            ImageSource::Archive(_) => SourceKind::Archive,
        }
    }

    /// Resolve `reference` (an image name, or a file path for archives).
    pub async fn resolve(&self, reference: &str) -> Result<Image> {
        tracing::debug!(source = %self.kind(), reference, "resolving image");
        match self {
            ImageSource::Remote(source) => source.resolve(reference).await,
            ImageSource::Daemon(source) => source.resolve(reference).await,
            ImageSource::Archive(source) => source.resolve(reference).await,
        }
    }
}

/// Resolve `reference` from `kind` with default settings, caching remote
/// layers under `cache_dir` when given.
pub async fn resolve(reference: &str, kind: SourceKind, cache_dir: Option<PathBuf>) -> Result<Image> {
    let config = Config {
        source: kind,
        cache_dir,
        ..Config::default()
    };
    ImageSource::from_config(&config).resolve(reference).await
}
