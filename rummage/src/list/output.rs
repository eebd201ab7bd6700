//! Sinks that render file entries as `tar -t` or `tar -tv` style lines.

use std::io::{self, Write};

use chrono::DateTime;

use crate::reader::{EntryKind, FileEntry};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Receives the entries of a listing, one at a time.
pub trait Output {
    fn write(&mut self, entry: &FileEntry) -> io::Result<()>;

    /// Flush anything buffered. Called once, after the last entry.
    fn close(&mut self) -> io::Result<()>;
}

/// One path per line.
pub struct ShortOutput<W: Write> {
    out: W,
}

impl<W: Write> ShortOutput<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Output for ShortOutput<W> {
    fn write(&mut self, entry: &FileEntry) -> io::Result<()> {
        writeln!(self.out, "{}", entry.path)
    }

    fn close(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Mode, owner, group, size, time and name in tab-separated columns.
///
/// Rows are held until [`Output::close`] so that every column can be padded
/// to its widest cell.
pub struct LongOutput<W: Write> {
    out: W,
    rows: Vec<[String; 6]>,
}

impl<W: Write> LongOutput<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            rows: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Output for LongOutput<W> {
    fn write(&mut self, entry: &FileEntry) -> io::Result<()> {
        self.rows.push(long_row(entry));
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        // Padded by hand: the columns must stay separated by literal tabs,
        // which table renderers such as tabled do not emit.
        let mut widths = [0usize; 6];
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let last = widths.len() - 1;
        for row in self.rows.drain(..) {
            let mut line = String::new();
            for (i, cell) in row.iter().enumerate() {
                if i == last {
                    line.push_str(cell);
                } else {
                    line.push_str(&format!("{cell:<width$}\t", width = widths[i]));
                }
            }
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()
    }
}

fn long_row(entry: &FileEntry) -> [String; 6] {
    let mut name = entry.path.clone();
    match (entry.kind, &entry.link_target) {
        (EntryKind::Symlink, Some(target)) => name.push_str(&format!(" -> {target}")),
        (EntryKind::HardLink, Some(target)) => name.push_str(&format!(" link to {target}")),
        _ => {}
    }

    [
        mode_string(entry.kind, entry.mode),
        entry.uid.to_string(),
        entry.gid.to_string(),
        entry.size.to_string(),
        format_time(entry.mtime),
        name,
    ]
}

/// `ls -l` style permission string, e.g. `drwxr-xr-x` or `-rwsr-xr-x`.
pub fn mode_string(kind: EntryKind, mode: u32) -> String {
    let type_char = match kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::CharDevice => 'c',
        EntryKind::BlockDevice => 'b',
        EntryKind::Fifo => 'p',
        EntryKind::Regular | EntryKind::HardLink | EntryKind::Other => '-',
    };

    let bit = |mask: u32, c: char| if mode & mask != 0 { c } else { '-' };
    let exec = |mask: u32, special: u32, set: char, unset: char| {
        match (mode & mask != 0, mode & special != 0) {
            (true, true) => set,
            (false, true) => unset,
            (true, false) => 'x',
            (false, false) => '-',
        }
    };

    [
        type_char,
        bit(0o400, 'r'),
        bit(0o200, 'w'),
        exec(0o100, 0o4000, 's', 'S'),
        bit(0o040, 'r'),
        bit(0o020, 'w'),
        exec(0o010, 0o2000, 's', 'S'),
        bit(0o004, 'r'),
        bit(0o002, 'w'),
        exec(0o001, 0o1000, 't', 'T'),
    ]
    .into_iter()
    .collect()
}

/// UTC time as `YYYY-MM-DD HH:MM:SS`.
pub fn format_time(mtime: i64) -> String {
    match DateTime::from_timestamp(mtime, 0) {
        Some(time) => time.format(TIME_FORMAT).to_string(),
        None => mtime.to_string(),
    }
}
