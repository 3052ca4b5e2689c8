//! Recursive discovery of OpenCode record files
//!
//! The walk never decides error policy itself: every entry comes back as a
//! `Result`, and callers choose whether a failure skips the entry or aborts.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

use crate::models::Millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub mtime: Millis,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot read {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },
    #[error("cannot stat {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// File name filter: `<prefix>*<suffix>`
#[derive(Debug, Clone, Copy)]
pub struct NamePattern {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

pub const SESSION_FILES: NamePattern = NamePattern {
    prefix: "ses_",
    suffix: ".json",
};

pub const MESSAGE_FILES: NamePattern = NamePattern {
    prefix: "msg_",
    suffix: ".json",
};

impl NamePattern {
    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(self.prefix) && n.ends_with(self.suffix))
            .unwrap_or(false)
    }
}

/// Lazy walk over `root` yielding matching files in a deterministic order
pub struct FileScan {
    inner: walkdir::IntoIter,
    pattern: NamePattern,
}

impl Iterator for FileScan {
    type Item = Result<FileEntry, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(source) => {
                    let path = source
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    return Some(Err(ScanError::Walk { path, source }));
                }
            };

            if !entry.file_type().is_file() || !self.pattern.matches(entry.path()) {
                continue;
            }

            return Some(
                entry
                    .metadata()
                    .map_err(|e| ScanError::Metadata {
                        path: entry.path().display().to_string(),
                        source: e
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("metadata unavailable")),
                    })
                    .map(|meta| FileEntry {
                        path: entry.path().to_path_buf(),
                        mtime: meta.modified().map(system_time_millis).unwrap_or(0),
                        size: meta.len(),
                    }),
            );
        }
    }
}

pub fn scan(root: &Path, pattern: NamePattern) -> FileScan {
    FileScan {
        inner: WalkDir::new(root)
            .sort_by_file_name()
            .follow_links(false)
            .into_iter(),
        pattern,
    }
}

/// Skip-and-log policy used by the reporting paths
pub fn scan_lenient(root: &Path, pattern: NamePattern) -> Vec<FileEntry> {
    if !root.is_dir() {
        warn!(path = %root.display(), "directory not accessible, treating as empty");
        return Vec::new();
    }

    scan(root, pattern)
        .filter_map(|result| match result {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping entry: {}", e);
                None
            }
        })
        .collect()
}

pub fn system_time_millis(time: SystemTime) -> Millis {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}
