//! On-the-wire layout of an archive.
//!
//! The whole archive is one zstd stream. Inside it: [`MAGIC`], then one header per
//! entry followed by exactly `size` content bytes, then a single end byte.

use stratus_core::error::ArchiveError;

use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MAGIC: &[u8; 8] = b"STRATUS\x01";

/// Tuned for throughput, not ratio.
pub const COMPRESSION_LEVEL: i32 = 3;

const KIND_END: u8 = 0;
const KIND_FILE: u8 = 1;
const KIND_DIRECTORY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One record of an archive. `path` is relative to the build directory and uses `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: EntryKind,
    /// Content length; always 0 for directories.
    pub size: u64,
    pub modified: SystemTime,
    /// Unix permission bits.
    pub mode: u32,
}

impl ArchiveEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn modified_utc(&self) -> DateTime<Utc> {
        self.modified.into()
    }
}

pub(crate) fn write_magic<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)
}

pub(crate) fn read_magic<R: Read>(r: &mut R) -> Result<(), ArchiveError> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(truncated)?;
    if &magic != MAGIC {
        return Err(ArchiveError::Malformed("not a stratus archive".into()));
    }
    Ok(())
}

pub(crate) fn write_header<W: Write>(w: &mut W, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
    let path = entry.path.as_bytes();
    let len = u16::try_from(path.len())
        .map_err(|_| ArchiveError::Malformed(format!("path too long: {}", entry.path)))?;

    let (secs, nanos) = split_time(entry.modified);
    let kind = match entry.kind {
        EntryKind::File => KIND_FILE,
        EntryKind::Directory => KIND_DIRECTORY,
    };

    w.write_all(&[kind])?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(path)?;
    w.write_all(&secs.to_le_bytes())?;
    w.write_all(&nanos.to_le_bytes())?;
    w.write_all(&entry.mode.to_le_bytes())?;
    w.write_all(&entry.size.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_end<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&[KIND_END])
}

/// Reads the next header, `None` at the end marker.
pub(crate) fn read_header<R: Read>(r: &mut R) -> Result<Option<ArchiveEntry>, ArchiveError> {
    let kind = match read_array::<1, _>(r)?[0] {
        KIND_END => return Ok(None),
        KIND_FILE => EntryKind::File,
        KIND_DIRECTORY => EntryKind::Directory,
        other => {
            return Err(ArchiveError::Malformed(format!(
                "unknown entry kind {other}"
            )));
        }
    };

    let len = u16::from_le_bytes(read_array(r)?) as usize;
    let mut path = vec![0u8; len];
    r.read_exact(&mut path).map_err(truncated)?;
    let path = String::from_utf8(path)
        .map_err(|_| ArchiveError::Malformed("entry path is not UTF-8".into()))?;

    let secs = i64::from_le_bytes(read_array(r)?);
    let nanos = u32::from_le_bytes(read_array(r)?);
    let mode = u32::from_le_bytes(read_array(r)?);
    let size = u64::from_le_bytes(read_array(r)?);

    let modified = join_time(secs, nanos)
        .ok_or_else(|| ArchiveError::Malformed(format!("invalid timestamp for {path}")))?;

    if kind == EntryKind::Directory && size != 0 {
        return Err(ArchiveError::Malformed(format!(
            "directory {path} carries content"
        )));
    }

    Ok(Some(ArchiveEntry {
        path,
        kind,
        size,
        modified,
        mode,
    }))
}

fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N], ArchiveError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

pub(crate) fn truncated(err: io::Error) -> ArchiveError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ArchiveError::Malformed("archive is truncated".into())
    } else {
        ArchiveError::Io(err)
    }
}

fn split_time(t: SystemTime) -> (i64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(before) => {
            let d = before.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    }
}

fn join_time(secs: i64, nanos: u32) -> Option<SystemTime> {
    if nanos >= 1_000_000_000 {
        return None;
    }
    let base = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64))?
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))?
    };
    base.checked_add(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789))]
    #[case(UNIX_EPOCH - Duration::new(10, 250_000_000))]
    #[case(UNIX_EPOCH)]
    fn timestamps_keep_nanoseconds(#[case] t: SystemTime) {
        let (secs, nanos) = split_time(t);
        assert_eq!(join_time(secs, nanos), Some(t));
    }

    #[test]
    fn header_layout_is_stable() {
        let entry = ArchiveEntry {
            path: "a/b".into(),
            kind: EntryKind::File,
            size: 5,
            modified: UNIX_EPOCH + Duration::from_secs(1),
            mode: 0o644,
        };
        let mut buf = Vec::new();
        write_header(&mut buf, &entry).unwrap();

        assert_eq!(buf[0], KIND_FILE);
        assert_eq!(&buf[1..3], &3u16.to_le_bytes());
        assert_eq!(&buf[3..6], b"a/b");
        assert_eq!(buf.len(), 1 + 2 + 3 + 8 + 4 + 4 + 8);
        assert_eq!(read_header(&mut buf.as_slice()).unwrap(), Some(entry));
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let err = read_header(&mut [9u8].as_slice()).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn short_input_is_truncated_not_io() {
        let err = read_header(&mut [KIND_FILE, 4].as_slice()).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }
}
