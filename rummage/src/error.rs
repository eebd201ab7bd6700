use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::registry::RegistryError;

/// Errors surfaced by acquisition, merging and listing.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid image reference '{reference}': {reason}")]
    Reference { reference: String, reason: String },

    #[error("Unsupported source: {0} (expected remote, daemon or archive)")]
    SourceUnsupported(String),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("Failed to cache layer {digest}: {source}")]
    CacheWrite {
        digest: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read layer {layer}: {source}")]
    Stream {
        layer: String,
        #[source]
        source: io::Error,
    },

    #[error("Listing cancelled")]
    Cancelled,

    #[error("Failed to write output: {0}")]
    Output(#[source] io::Error),
}

/// Failures while locating an image and its layers.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Invalid archive {}: {reason}", path.display())]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("Container runtime error: {0}")]
    Daemon(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn reference(reference: &str, reason: impl Into<String>) -> Self {
        Error::Reference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn stream(layer: &str, source: io::Error) -> Self {
        Error::Stream {
            layer: layer.to_string(),
            source,
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Error::Acquisition(AcquisitionError::Registry(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
