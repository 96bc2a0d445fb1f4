use crate::format::{self, ArchiveEntry, EntryKind};

use stratus_core::error::ArchiveError;

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Paths of the files written, in archive order.
    pub written: Vec<String>,
    pub skipped: usize,
}

/// Extracts a compressed archive into `target`.
///
/// `select` decides per entry whether it is written; it runs before anything is written
/// for that entry. Files are written to a temporary sibling and renamed into place, with
/// their recorded modification time restored. An entry that would escape `target` aborts
/// the whole unpack.
pub fn unpack<R, F>(reader: R, target: &Path, mut select: F) -> Result<UnpackSummary, ArchiveError>
where
    R: Read,
    F: FnMut(&ArchiveEntry) -> bool,
{
    let mut decoder = zstd::Decoder::new(reader)?;
    let mut summary = UnpackSummary::default();

    format::read_magic(&mut decoder)?;
    while let Some(entry) = format::read_header(&mut decoder)? {
        let destination = target.join(safe_relative_path(&entry.path)?);

        if !select(&entry) {
            skip(&mut decoder, &entry)?;
            summary.skipped += 1;
            continue;
        }

        match entry.kind {
            EntryKind::Directory => fs::create_dir_all(&destination)?,
            EntryKind::File => {
                write_file(&mut decoder, &entry, &destination)?;
                summary.written.push(entry.path);
            }
        }
    }

    debug!(
        target = %target.display(),
        written = summary.written.len(),
        skipped = summary.skipped,
        "Unpacked archive"
    );
    Ok(summary)
}

/// Rejects absolute paths and any `..`, `.` or empty segment.
pub fn safe_relative_path(path: &str) -> Result<PathBuf, ArchiveError> {
    let escape = || ArchiveError::PathEscape(path.to_string());

    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(escape());
    }

    let mut out = PathBuf::new();
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(escape());
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => out.push(part),
            _ => return Err(escape()),
        }
    }
    Ok(out)
}

fn skip<R: Read>(reader: &mut R, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
    let skipped = io::copy(&mut reader.by_ref().take(entry.size), &mut io::sink())?;
    if skipped != entry.size {
        return Err(ArchiveError::Malformed("archive is truncated".into()));
    }
    Ok(())
}

fn write_file<R: Read>(
    reader: &mut R,
    entry: &ArchiveEntry,
    destination: &Path,
) -> Result<(), ArchiveError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temporary_sibling(destination);
    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        let written = io::copy(&mut reader.by_ref().take(entry.size), &mut file)?;
        if written != entry.size {
            return Err(ArchiveError::Malformed("archive is truncated".into()));
        }
        file.set_modified(entry.modified)?;
        set_mode(&file, entry.mode)?;
        drop(file);
        fs::rename(&tmp_path, destination)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.stratus-tmp"))
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("../etc/passwd")]
    #[case("results/../../x")]
    #[case("/abs/path")]
    #[case("a//b")]
    #[case("./a")]
    #[case("a\\..\\b")]
    #[case("")]
    fn escaping_paths_are_rejected(#[case] path: &str) {
        assert!(matches!(
            safe_relative_path(path),
            Err(ArchiveError::PathEscape(_))
        ));
    }

    #[rstest]
    #[case("Snakefile")]
    #[case("results/tree.nwk")]
    #[case("données/été.csv")]
    #[case("..hidden/file")]
    fn ordinary_paths_are_accepted(#[case] path: &str) {
        assert!(safe_relative_path(path).is_ok());
    }
}
