//! Turning layer tar streams into the entries of the final filesystem.

pub mod entry;
pub mod merge;

pub use entry::{EntryKind, FileEntry, normalize_path};
pub use merge::{LayerStream, Merger};
