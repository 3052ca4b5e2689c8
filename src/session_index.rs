//! Metadata-only catalog of session files
//!
//! Built from `storage/session/**/ses_*.json` by stat alone. A rebuild
//! constructs a fresh snapshot and swaps it in, so concurrent readers see
//! either the previous or the new index in full.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};
use tracing::{info, warn};

use crate::models::{Millis, SessionIndexEntry};
use crate::scanner::{self, SESSION_FILES};

static SESSION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ses_[a-zA-Z0-9]+").expect("valid regex"));

pub const DEFAULT_RANGE_LIMIT: usize = 1000;

/// Extract a `ses_...` id from any path or file name
pub fn session_id_from(text: &str) -> Option<String> {
    SESSION_ID
        .find(text)
        .map(|m| m.as_str().replace('\u{0}', ""))
}

#[derive(Debug, Default)]
struct Snapshot {
    /// Insertion order is scan order, the tie-break for equal mtimes
    entries: Vec<SessionIndexEntry>,
    by_id: HashMap<String, usize>,
}

impl Snapshot {
    fn build(data_dir: &Path) -> Self {
        let root = data_dir.join("storage").join("session");
        let mut snapshot = Snapshot::default();

        if !root.is_dir() {
            warn!(path = %root.display(), "Could not access session directory");
            return snapshot;
        }

        for result in scanner::scan(&root, SESSION_FILES) {
            let file = match result {
                Ok(file) => file,
                Err(e) => {
                    warn!("skipping session entry: {}", e);
                    continue;
                }
            };

            let Some(id) = file
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(session_id_from)
            else {
                continue;
            };

            let entry = SessionIndexEntry {
                id: id.clone(),
                mtime: file.mtime,
                size: file.size,
                file_path: file.path,
            };

            match snapshot.by_id.get(&id) {
                Some(&pos) => {
                    if entry.mtime >= snapshot.entries[pos].mtime {
                        snapshot.entries[pos] = entry;
                    }
                }
                None => {
                    snapshot.by_id.insert(id, snapshot.entries.len());
                    snapshot.entries.push(entry);
                }
            }
        }

        snapshot
    }

    fn sorted<'a, I>(iter: I, limit: usize) -> Vec<SessionIndexEntry>
    where
        I: Iterator<Item = &'a SessionIndexEntry>,
    {
        let mut entries: Vec<SessionIndexEntry> = iter.cloned().collect();
        // stable sort keeps insertion order among equal mtimes
        entries.sort_by(|a, b| b.mtime.cmp(&a.mtime));
        entries.truncate(limit);
        entries
    }
}

pub struct SessionIndex {
    data_dir: PathBuf,
    current: RwLock<Arc<Snapshot>>,
}

impl SessionIndex {
    pub fn init(data_dir: &Path) -> Self {
        let index = Self {
            data_dir: data_dir.to_path_buf(),
            current: RwLock::new(Arc::new(Snapshot::default())),
        };
        index.reload();
        index
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Full rebuild; the new snapshot replaces the old one atomically
    pub fn reload(&self) {
        let fresh = Arc::new(Snapshot::build(&self.data_dir));
        info!(sessions = fresh.entries.len(), "Session index built (metadata only)");
        match self.current.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<SessionIndexEntry> {
        let snapshot = self.snapshot();
        snapshot
            .by_id
            .get(id)
            .map(|&pos| snapshot.entries[pos].clone())
    }

    pub fn recent_sessions(&self, limit: usize) -> Vec<SessionIndexEntry> {
        let snapshot = self.snapshot();
        Snapshot::sorted(snapshot.entries.iter(), limit)
    }

    /// Entries with `start <= mtime <= end`, newest first
    pub fn sessions_by_date_range(
        &self,
        start: Millis,
        end: Millis,
        limit: usize,
    ) -> Vec<SessionIndexEntry> {
        let snapshot = self.snapshot();
        Snapshot::sorted(
            snapshot
                .entries
                .iter()
                .filter(|e| e.mtime >= start && e.mtime <= end),
            limit,
        )
    }

    pub fn most_recent(&self) -> Option<SessionIndexEntry> {
        self.recent_sessions(1).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{set_mtime, write_session};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_session_id_from() {
        assert_eq!(session_id_from("proj/ses_abc123.json"), Some("ses_abc123".into()));
        assert_eq!(session_id_from("ses_XY9/msg_1.json"), Some("ses_XY9".into()));
        assert_eq!(session_id_from("notes.json"), None);
    }

    #[test]
    fn test_recent_sessions_order_and_ties() {
        let dir = tempdir().unwrap();
        let a = write_session(dir.path(), "p1", "ses_a", "A", 1);
        let b = write_session(dir.path(), "p1", "ses_b", "B", 2);
        let c = write_session(dir.path(), "p2", "ses_c", "C", 3);
        set_mtime(&a, 5_000);
        set_mtime(&b, 9_000);
        set_mtime(&c, 5_000);

        let index = SessionIndex::init(dir.path());
        assert_eq!(index.len(), 3);

        let ids: Vec<String> = index.recent_sessions(10).into_iter().map(|e| e.id).collect();
        // ses_a is scanned before ses_c (p1 < p2)
        assert_eq!(ids, vec!["ses_b", "ses_a", "ses_c"]);
        assert_eq!(index.recent_sessions(1)[0].id, "ses_b");
        assert_eq!(index.most_recent().unwrap().id, "ses_b");
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let dir = tempdir().unwrap();
        for (id, mtime) in [("ses_a", 1_000), ("ses_b", 2_000), ("ses_c", 3_000)] {
            let path = write_session(dir.path(), "p", id, id, 0);
            set_mtime(&path, mtime);
        }
        let index = SessionIndex::init(dir.path());
        let ids: Vec<String> = index
            .sessions_by_date_range(1_000, 2_000, DEFAULT_RANGE_LIMIT)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["ses_b", "ses_a"]);
        assert_eq!(index.sessions_by_date_range(0, 10_000, 2).len(), 2);
    }

    #[test]
    fn test_missing_directory_is_empty_index() {
        let dir = tempdir().unwrap();
        let index = SessionIndex::init(dir.path());
        assert!(index.is_empty());
        assert!(index.most_recent().is_none());
    }

    #[test]
    fn test_reload_is_idempotent_and_picks_up_new_files() {
        let dir = tempdir().unwrap();
        write_session(dir.path(), "p", "ses_a", "A", 1);
        let index = SessionIndex::init(dir.path());
        index.reload();
        index.reload();
        assert_eq!(index.len(), 1);

        write_session(dir.path(), "p", "ses_b", "B", 2);
        index.reload();
        assert_eq!(index.len(), 2);
        assert!(index.get("ses_b").is_some());
    }

    #[test]
    fn test_readers_never_observe_partial_index() {
        let dir = tempdir().unwrap();
        for i in 0..40 {
            write_session(dir.path(), "p", &format!("ses_{}", i), "t", i);
        }
        let index = Arc::new(SessionIndex::init(dir.path()));

        let writer = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for _ in 0..20 {
                    index.reload();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    for _ in 0..200 {
                        assert_eq!(index.recent_sessions(usize::MAX).len(), 40);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
