use std::io::{self, Read};

use tar::EntryType;

/// Basename prefix of whiteout markers.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Basename of the marker that empties its directory in lower layers.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Other,
}

impl From<EntryType> for EntryKind {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                EntryKind::Regular
            }
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::Link => EntryKind::HardLink,
            EntryType::Char => EntryKind::CharDevice,
            EntryType::Block => EntryKind::BlockDevice,
            EntryType::Fifo => EntryKind::Fifo,
            _ => EntryKind::Other,
        }
    }
}

/// One file in the merged filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute, slash-separated path, e.g. `/etc/passwd`.
    pub path: String,
    pub kind: EntryKind,
    /// Permission and special bits (`0o4755`), without the file type.
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    /// Target of a symlink or hard link.
    pub link_target: Option<String>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// What a single tar member means to the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Entry(FileEntry),
    /// Delete this path and everything under it in lower layers.
    Whiteout(String),
    /// Delete everything under this directory in lower layers.
    Opaque(String),
}

impl Record {
    /// Interpret one tar member; `None` for members with no place in the
    /// listing (the root directory, empty whiteouts).
    pub(crate) fn from_tar<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<Option<Self>> {
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(path) = normalize_path(&raw) else {
            return Ok(None);
        };

        let (parent, name) = split_parent(&path);
        if name == OPAQUE_MARKER {
            return Ok(Some(Record::Opaque(parent.to_string())));
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            // `.wh..wh.*` names are reserved for the storage driver.
            if target.is_empty() || target.starts_with(WHITEOUT_PREFIX) {
                return Ok(None);
            }
            return Ok(Some(Record::Whiteout(join(parent, target))));
        }

        let header = entry.header();
        let kind = EntryKind::from(header.entry_type());
        let link_target = match kind {
            EntryKind::Symlink => entry
                .link_name_bytes()
                .map(|target| String::from_utf8_lossy(&target).into_owned()),
            EntryKind::HardLink => entry
                .link_name_bytes()
                .and_then(|target| normalize_path(&String::from_utf8_lossy(&target))),
            _ => None,
        };

        let fields = header.as_old();
        Ok(Some(Record::Entry(FileEntry {
            path,
            kind,
            mode: numeric(&fields.mode, header.mode())? & 0o7777,
            uid: numeric(&fields.uid, header.uid())?,
            gid: numeric(&fields.gid, header.gid())?,
            size: entry.size(),
            mtime: numeric(&fields.mtime, header.mtime())? as i64,
            link_target,
        })))
    }
}

/// A numeric header field, reading an all-blank field as zero.
fn numeric<T: Default>(raw: &[u8], parsed: io::Result<T>) -> io::Result<T> {
    if raw.iter().all(|&b| b == 0 || b == b' ') {
        Ok(T::default())
    } else {
        parsed
    }
}

/// Normalize a tar member name to `/a/b` form; `None` for the root.
pub fn normalize_path(raw: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

/// Split a normalized path into its parent directory and basename.
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Proper ancestors of a normalized path, nearest first, ending with `/`.
pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(path);
    std::iter::from_fn(move || {
        let current = rest?;
        if current == "/" {
            rest = None;
            return None;
        }
        let (parent, _) = split_parent(current);
        rest = Some(parent);
        Some(parent)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./etc/passwd").as_deref(), Some("/etc/passwd"));
        assert_eq!(normalize_path("usr/bin/").as_deref(), Some("/usr/bin"));
        assert_eq!(normalize_path("/a//b/./c").as_deref(), Some("/a/b/c"));
        assert_eq!(normalize_path("a/../b").as_deref(), Some("/b"));
        assert_eq!(normalize_path("./"), None);
        assert_eq!(normalize_path("/"), None);
    }

    #[test]
    fn test_blank_numeric_fields_read_as_zero() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(2);
        header.as_old_mut().mode = [0; 8];
        header.as_old_mut().mtime = [b' '; 12];
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, "etc/blank", &b"hi"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        match Record::from_tar(&entry).unwrap() {
            Some(Record::Entry(file)) => {
                assert_eq!(file.path, "/etc/blank");
                assert_eq!((file.mode, file.uid, file.gid, file.mtime), (0, 0, 0, 0));
                assert_eq!(file.size, 2);
            }
            other => panic!("expected an entry, got {other:?}"),
        }
    }

    #[test]
    fn test_ancestors() {
        let all: Vec<&str> = ancestors("/a/b/c").collect();
        assert_eq!(all, vec!["/a/b", "/a", "/"]);
        let top: Vec<&str> = ancestors("/a").collect();
        assert_eq!(top, vec!["/"]);
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_parent("/etc/passwd"), ("/etc", "passwd"));
        assert_eq!(split_parent("/etc"), ("/", "etc"));
        assert_eq!(join("/", "etc"), "/etc");
        assert_eq!(join("/etc", "passwd"), "/etc/passwd");
    }
}
