use crate::glob::PatternSet;

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Which of the job's modified files are brought back into the build directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DownloadSelection {
    /// Everything modified by the job.
    #[default]
    All,
    /// Modified files matching the set (negated patterns exclude).
    Matching(PatternSet),
    /// Nothing; results stay remote.
    Nothing,
}

impl DownloadSelection {
    /// An empty set means no filtering was asked for.
    pub fn from_patterns(patterns: PatternSet) -> Self {
        if patterns.is_empty() {
            Self::All
        } else {
            Self::Matching(patterns)
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    /// `modified` must be strictly newer than `since` to be a candidate at all.
    pub fn selects(&self, key: &str, modified: DateTime<Utc>, since: DateTime<Utc>) -> bool {
        if modified <= since {
            return false;
        }
        match self {
            Self::All => true,
            Self::Matching(patterns) => patterns.matches(key),
            Self::Nothing => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub key: String,
    pub modified: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn new(key: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            modified,
        }
    }
}

/// The keys a job produced or touched, with their modification times.
///
/// Entries are offered one at a time as they come off the results archive; each is
/// recorded and checked against the upload time and the download selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferManifest {
    since: DateTime<Utc>,
    selection: DownloadSelection,
    entries: Vec<ManifestEntry>,
}

impl TransferManifest {
    pub fn new(since: DateTime<Utc>, selection: DownloadSelection) -> Self {
        Self {
            since,
            selection,
            entries: Vec::new(),
        }
    }

    /// Records `entry` and reports whether it should be downloaded.
    pub fn offer(&mut self, entry: ManifestEntry) -> bool {
        let wanted = self.selection.selects(&entry.key, entry.modified, self.since);
        self.entries.push(entry);
        wanted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every key offered so far that should be downloaded.
    pub fn selected(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|e| self.selection.selects(&e.key, e.modified, self.since))
            .map(|e| e.key.clone())
            .collect()
    }
}
