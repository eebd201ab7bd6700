//! List the files of a container image without extracting it.
//!
//! An image is resolved from a registry, the local daemon or an archive into
//! an ordered stack of layers. The layers are merged with OCI whiteout rules
//! into the final filesystem, and its entries are written to an output sink
//! much like `tar -t` or `tar -tv` would print them.

/// Layer cache keyed by content digest.
pub mod cache;
/// Settings for a listing run.
pub mod config;
/// Error types shared by every stage.
pub mod error;
/// Layer handles and decompression.
pub mod layer;
/// Listing driver and output formats.
pub mod list;
/// Types that model OCI image manifests and configs.
pub mod manifest;
/// File entries and the layer merge.
pub mod reader;
/// Image reference parsing.
pub mod reference;
/// Clients for talking to OCI compatible registries.
pub mod registry;
/// Image sources.
pub mod source;

pub use config::Config;
pub use error::{AcquisitionError, Error, Result};
pub use list::{Format, Output, list, list_image};
pub use reader::{EntryKind, FileEntry, Merger};
pub use reference::ImageReference;
pub use source::{Image, ImageSource, SourceKind};
