//! Squash an ordered layer stack into the files of the final image.
//!
//! Layers are walked from the top down. An entry is emitted the first time
//! its path is seen, unless an upper layer already claimed the path, deleted
//! it with a whiteout, emptied one of its ancestors with an opaque marker, or
//! replaced an ancestor directory with a non-directory. Whiteouts only affect
//! lower layers, never entries in their own layer.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use super::entry::{FileEntry, Record, ancestors};
use crate::error::{Error, Result};
use crate::layer::LayerReader;

/// An opened layer: its digest, for error context, and its tar stream.
pub struct LayerStream {
    pub digest: String,
    pub reader: LayerReader,
}

impl LayerStream {
    pub fn new(digest: impl Into<String>, reader: LayerReader) -> Self {
        Self {
            digest: digest.into(),
            reader,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Directory,
    /// A file, link or device; hides lower entries beneath its path.
    NonDirectory,
    Whiteout,
}

/// Lazy sequence of the merged filesystem's entries.
///
/// Each layer is read when the entries of the layers above it are used up,
/// and its stream is dropped as soon as it has been read. After an error the
/// sequence ends.
pub struct Merger {
    /// Base first; layers are popped from the end.
    pending: Vec<LayerStream>,
    ready: VecDeque<FileEntry>,
    claims: HashMap<String, Claim>,
    opaque: HashSet<String>,
    failed: bool,
}

impl Merger {
    /// `layers` must be ordered base first.
    pub fn new(layers: Vec<LayerStream>) -> Self {
        Self {
            pending: layers,
            ready: VecDeque::new(),
            claims: HashMap::new(),
            opaque: HashSet::new(),
            failed: false,
        }
    }

    fn is_hidden(&self, path: &str) -> bool {
        if self.claims.contains_key(path) {
            return true;
        }
        ancestors(path).any(|dir| {
            self.opaque.contains(dir)
                || matches!(
                    self.claims.get(dir),
                    Some(Claim::NonDirectory | Claim::Whiteout)
                )
        })
    }

    /// Read one layer and queue the entries that survive the layers above.
    fn merge_layer(&mut self, layer: LayerStream) -> Result<()> {
        let records = read_records(layer)?;

        let mut visible: Vec<FileEntry> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut whiteouts = Vec::new();
        let mut opaque_dirs = Vec::new();

        for record in records {
            match record {
                Record::Entry(entry) => {
                    if self.is_hidden(&entry.path) {
                        // An upper directory re-created over this layer's
                        // non-directory; nothing below it may come back.
                        if !entry.is_dir()
                            && self.claims.get(&entry.path) == Some(&Claim::Directory)
                        {
                            opaque_dirs.push(entry.path);
                        }
                        continue;
                    }
                    // A path repeated within one archive keeps its first
                    // position and its last metadata.
                    match positions.entry(entry.path.clone()) {
                        Entry::Occupied(slot) => visible[*slot.get()] = entry,
                        Entry::Vacant(slot) => {
                            slot.insert(visible.len());
                            visible.push(entry);
                        }
                    }
                }
                Record::Whiteout(path) => whiteouts.push(path),
                Record::Opaque(dir) => opaque_dirs.push(dir),
            }
        }

        // Claims are recorded only after the whole layer is read so that
        // this layer's markers never hide this layer's entries.
        for entry in &visible {
            let claim = if entry.is_dir() {
                Claim::Directory
            } else {
                Claim::NonDirectory
            };
            self.claims.insert(entry.path.clone(), claim);
        }
        for path in whiteouts {
            match self.claims.entry(path) {
                Entry::Vacant(slot) => {
                    slot.insert(Claim::Whiteout);
                }
                // Deleted here and re-created above: the directory survives
                // but none of its lower contents do.
                Entry::Occupied(slot) => {
                    if *slot.get() == Claim::Directory {
                        self.opaque.insert(slot.key().clone());
                    }
                }
            }
        }
        for dir in opaque_dirs {
            self.opaque.insert(dir);
        }

        self.ready.extend(visible);
        Ok(())
    }
}

impl Iterator for Merger {
    type Item = Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Some(Ok(entry));
            }
            if self.failed {
                return None;
            }
            let layer = self.pending.pop()?;
            if let Err(e) = self.merge_layer(layer) {
                self.failed = true;
                self.pending.clear();
                return Some(Err(e));
            }
        }
    }
}

fn read_records(layer: LayerStream) -> Result<Vec<Record>> {
    let LayerStream { digest, reader } = layer;
    let mut archive = tar::Archive::new(reader);
    let mut records = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::stream(&digest, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::stream(&digest, e))?;
        if let Some(record) = Record::from_tar(&entry).map_err(|e| Error::stream(&digest, e))? {
            records.push(record);
        }
    }

    tracing::debug!(layer = %digest, records = records.len(), "read layer");
    Ok(records)
}
