use crate::format::{self, ArchiveEntry, COMPRESSION_LEVEL, EntryKind};

use stratus_core::constants::archive::ALWAYS_EXCLUDED;
use stratus_core::error::ArchiveError;
use stratus_core::glob::{GlobPattern, PatternSet};

use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// An entry found while walking the build directory, with the file to read its content from.
#[derive(Debug, Clone)]
pub struct PackEntry {
    pub entry: ArchiveEntry,
    pub source: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub files: usize,
    pub directories: usize,
    /// Uncompressed content bytes.
    pub bytes: u64,
}

/// Walks a build directory into archive entries.
///
/// Holds no walk state, so [`entries`](Self::entries) and [`write_to`](Self::write_to)
/// can be called any number of times and always reflect the directory as it is now.
#[derive(Debug, Clone)]
pub struct Packer {
    root: PathBuf,
    exclude: PatternSet,
}

impl Packer {
    /// `exclude` is applied on top of the always-excluded patterns.
    pub fn new(root: impl Into<PathBuf>, exclude: &PatternSet) -> Self {
        let mut patterns = PatternSet::new(
            ALWAYS_EXCLUDED
                .iter()
                .filter_map(|p| GlobPattern::new(p).ok()),
        );
        patterns.extend(exclude.clone());

        Self {
            root: root.into(),
            exclude: patterns,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories are also tested with a trailing `/` so `dir/` patterns prune them.
    pub fn is_excluded(&self, path: &str, is_dir: bool) -> bool {
        self.exclude.matches(path) || (is_dir && self.exclude.matches(&format!("{path}/")))
    }

    /// Lazily walks the tree in file name order. Excluded directories are pruned whole.
    pub fn entries(&self) -> impl Iterator<Item = Result<PackEntry, ArchiveError>> + '_ {
        WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| match relative_path(&self.root, e.path()) {
                Ok(rel) => !self.is_excluded(&rel, e.file_type().is_dir()),
                Err(_) => true,
            })
            .map(move |e| {
                let e = e.map_err(|err| {
                    ArchiveError::Io(
                        err.into_io_error()
                            .unwrap_or_else(|| io::Error::other("filesystem loop")),
                    )
                })?;
                let path = relative_path(&self.root, e.path())?;
                let meta = e.metadata().map_err(|err| {
                    ArchiveError::Io(
                        err.into_io_error()
                            .unwrap_or_else(|| io::Error::other("metadata unavailable")),
                    )
                })?;

                let kind = if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };

                Ok(PackEntry {
                    entry: ArchiveEntry {
                        path,
                        kind,
                        size: if meta.is_dir() { 0 } else { meta.len() },
                        modified: meta.modified()?,
                        mode: mode(&meta),
                    },
                    source: e.into_path(),
                })
            })
    }

    /// Writes the compressed archive to `writer`. `on_entry` sees each entry before its
    /// content is written.
    pub fn write_to<W, F>(&self, writer: W, mut on_entry: F) -> Result<PackSummary, ArchiveError>
    where
        W: Write,
        F: FnMut(&ArchiveEntry),
    {
        let mut encoder = zstd::Encoder::new(writer, COMPRESSION_LEVEL)?;
        let mut summary = PackSummary::default();

        format::write_magic(&mut encoder)?;
        for item in self.entries() {
            let PackEntry { entry, source } = item?;
            on_entry(&entry);

            match entry.kind {
                EntryKind::Directory => {
                    format::write_header(&mut encoder, &entry)?;
                    summary.directories += 1;
                }
                EntryKind::File => {
                    let mut file = File::open(&source)?;
                    format::write_header(&mut encoder, &entry)?;
                    copy_exact(&mut file, &mut encoder, entry.size, &entry.path)?;
                    summary.files += 1;
                    summary.bytes += entry.size;
                }
            }
        }
        format::write_end(&mut encoder)?;

        let mut inner = encoder.finish()?;
        inner.flush()?;

        debug!(
            root = %self.root.display(),
            files = summary.files,
            directories = summary.directories,
            bytes = summary.bytes,
            "Packed build directory"
        );
        Ok(summary)
    }
}

/// Copies exactly `size` bytes and fails if the file grew or shrank meanwhile.
fn copy_exact<R: Read, W: Write>(
    file: &mut R,
    out: &mut W,
    size: u64,
    path: &str,
) -> Result<(), ArchiveError> {
    let copied = io::copy(&mut file.by_ref().take(size), out)?;
    let mut extra = [0u8; 1];
    if copied != size || file.read(&mut extra)? != 0 {
        return Err(ArchiveError::Changed(path.to_string()));
    }
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> Result<String, ArchiveError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| ArchiveError::Malformed(format!("{} is outside the root", path.display())))?;

    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            ArchiveError::Malformed(format!("{} is not valid UTF-8", path.display()))
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
