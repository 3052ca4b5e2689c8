//! Materializes one session at a time from its message files
//!
//! The most recently loaded session is kept in a single slot and reused
//! while the index still reports the same mtime for it. The slot is shared
//! with the file watcher, which clears it when the session's messages move.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::models::{
    self, Millis, MessageRecord, MessageSummary, RecentActivity, SessionData, SessionIndexEntry,
    SessionRecord, TokenCounts,
};
use crate::pricing::ModelCatalog;
use crate::scanner::MESSAGE_FILES;
use crate::helpers::{MS_PER_MINUTE, now_millis};
use crate::session_index::SessionIndex;

pub const DEFAULT_TITLE: &str = "Untitled";

/// The single cached materialization
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub id: String,
    pub mtime: Millis,
    pub data: Arc<SessionData>,
}

/// Handle to the loader's cache slot, cloneable across threads
#[derive(Debug, Clone, Default)]
pub struct ActiveSlot(Arc<Mutex<Option<ActiveSession>>>);

impl ActiveSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self) -> Option<ActiveSession> {
        self.lock().clone()
    }

    pub(crate) fn replace(&self, session: ActiveSession) {
        *self.lock() = Some(session);
    }

    /// Drop the cached session if it is `id`; returns whether it was
    pub fn invalidate(&self, id: &str) -> bool {
        let mut guard = self.lock();
        if guard.as_ref().is_some_and(|a| a.id == id) {
            *guard = None;
            true
        } else {
            false
        }
    }
}

/// The cached copy is reusable only for the same id at the same index mtime
pub fn is_fresh(cached: &ActiveSession, id: &str, index_mtime: Millis) -> bool {
    cached.id == id && cached.mtime == index_mtime
}

pub struct SessionLoader {
    index: Arc<SessionIndex>,
    catalog: Arc<ModelCatalog>,
    active: ActiveSlot,
}

impl SessionLoader {
    pub fn new(index: Arc<SessionIndex>, catalog: Arc<ModelCatalog>) -> Self {
        Self {
            index,
            catalog,
            active: ActiveSlot::default(),
        }
    }

    pub fn index(&self) -> &SessionIndex {
        &self.index
    }

    pub fn active_slot(&self) -> ActiveSlot {
        self.active.clone()
    }

    fn message_dir(&self, id: &str) -> PathBuf {
        self.index
            .data_dir()
            .join("storage")
            .join("message")
            .join(id.replace('\u{0}', ""))
    }

    /// `None` when the id is not indexed, the metadata file is unreadable,
    /// or the session has no valid messages.
    pub fn load_session(&self, id: &str) -> Option<Arc<SessionData>> {
        let Some(entry) = self.index.get(id) else {
            warn!(session_id = %id, "Session not found in index");
            return None;
        };

        if let Some(cached) = self.active.get() {
            if is_fresh(&cached, id, entry.mtime) {
                return Some(cached.data);
            }
        }

        let data = Arc::new(self.materialize(id, &entry)?);
        self.active.replace(ActiveSession {
            id: id.to_string(),
            mtime: entry.mtime,
            data: Arc::clone(&data),
        });
        Some(data)
    }

    /// Same as [`load_session`](Self::load_session) but leaves the active
    /// slot untouched, for bulk readers such as the budget tracker.
    pub fn read_session(&self, id: &str) -> Option<SessionData> {
        let entry = self.index.get(id)?;
        if let Some(cached) = self.active.get() {
            if is_fresh(&cached, id, entry.mtime) {
                return Some((*cached.data).clone());
            }
        }
        self.materialize(id, &entry)
    }

    fn materialize(&self, id: &str, entry: &SessionIndexEntry) -> Option<SessionData> {
        let meta: SessionRecord = match models::read_json(&entry.file_path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(session_id = %id, "Error loading session: {}", e);
                return None;
            }
        };

        let messages = read_session_messages(&self.message_dir(id));
        if messages.is_empty() {
            debug!(session_id = %id, "session has no messages yet");
            return None;
        }

        Some(SessionData::derive(
            meta.id,
            meta.title,
            meta.time,
            messages,
            DEFAULT_TITLE,
        ))
    }

    pub fn recent_activity(&self, id: &str, minutes: u32) -> RecentActivity {
        self.recent_activity_at(id, minutes, now_millis())
    }

    /// Trailing-window totals from the cached session only. Any other id
    /// yields the zero value; callers load the session first.
    pub fn recent_activity_at(&self, id: &str, minutes: u32, now: Millis) -> RecentActivity {
        let Some(active) = self.active.get().filter(|a| a.id == id) else {
            return RecentActivity::default();
        };
        let session = &active.data;

        let cutoff = now - minutes as Millis * MS_PER_MINUTE;
        let mut tokens = TokenCounts::default();
        let mut count = 0;
        for message in session.messages.iter().filter(|m| m.created >= cutoff) {
            tokens.add(&message.tokens);
            count += 1;
        }

        let cost = self.catalog.model_cost(&session.model.qualified(), &tokens);

        let last_message_time = session.last_message_time().unwrap_or(0);
        let has_recent = count > 0 && minutes > 0;

        RecentActivity {
            messages: count,
            tokens: tokens.total(),
            cost,
            tokens_per_minute: if has_recent {
                tokens.total() as f64 / minutes as f64
            } else {
                0.0
            },
            cost_per_minute: if has_recent { cost / minutes as f64 } else { 0.0 },
            last_message_time,
            time_since_last: now - last_message_time,
        }
    }
}

/// All readable `msg_*.json` records directly under `dir`. A missing
/// directory is an empty session; unreadable files are skipped.
pub fn read_session_messages(dir: &Path) -> Vec<MessageSummary> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), "Error scanning messages: {}", e);
            }
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && MESSAGE_FILES.matches(p))
        .collect();
    paths.sort();

    paths
        .iter()
        .filter_map(|path| match models::read_json::<MessageRecord>(path) {
            Ok(record) => Some(MessageSummary::from_record(record)),
            Err(e) => {
                warn!("Skipping message: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::testing::sample_service;
    use crate::test_support::*;
    use tempfile::tempdir;

    fn loader_for(root: &Path) -> SessionLoader {
        SessionLoader::new(
            Arc::new(SessionIndex::init(root)),
            Arc::new(sample_service()),
        )
    }

    #[test]
    fn test_load_session_derives_fields() {
        let dir = tempdir().unwrap();
        write_session(dir.path(), "p", "ses_one", "Fix parser", 1_000);
        write_assistant(dir.path(), "ses_one", "msg_b", 300, "openai", "gpt-4o-mini", 10, 20, 0.5);
        write_user(dir.path(), "ses_one", "msg_a", 100, "hello");
        write_assistant(dir.path(), "ses_one", "msg_c", 200, "anthropic", "claude-sonnet-4", 1, 2, 0.25);
        write_message_json(dir.path(), "ses_one", "msg_d", "{ not json");

        let loader = loader_for(dir.path());
        let session = loader.load_session("ses_one").unwrap();
        assert_eq!(session.title, "Fix parser");
        assert_eq!(session.message_count, 3);
        assert_eq!(session.tokens_used, 33);
        assert_eq!(session.cost_cents, 75);
        assert_eq!(session.model.model, "gpt-4o-mini");
        let created: Vec<Millis> = session.messages.iter().map(|m| m.created).collect();
        assert_eq!(created, vec![100, 200, 300]);
    }

    #[test]
    fn test_unknown_id_is_none() {
        let dir = tempdir().unwrap();
        let loader = loader_for(dir.path());
        assert!(loader.load_session("ses_missing").is_none());
    }

    #[test]
    fn test_session_without_message_dir_is_not_loadable() {
        let dir = tempdir().unwrap();
        write_session(dir.path(), "p", "ses_empty", "Empty", 1);
        let loader = loader_for(dir.path());
        assert!(loader.load_session("ses_empty").is_none());
    }

    #[test]
    fn test_cache_reused_until_mtime_changes() {
        let dir = tempdir().unwrap();
        let meta = write_session(dir.path(), "p", "ses_one", "T", 1);
        write_assistant(dir.path(), "ses_one", "msg_a", 100, "openai", "gpt-4o-mini", 10, 0, 0.1);
        set_mtime(&meta, 10_000);

        let index = Arc::new(SessionIndex::init(dir.path()));
        let loader = SessionLoader::new(Arc::clone(&index), Arc::new(sample_service()));
        let first = loader.load_session("ses_one").unwrap();
        let second = loader.load_session("ses_one").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        write_assistant(dir.path(), "ses_one", "msg_b", 200, "openai", "gpt-4o-mini", 5, 0, 0.1);
        set_mtime(&meta, 20_000);
        index.reload();
        let third = loader.load_session("ses_one").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.message_count, 2);
    }

    #[test]
    fn test_read_session_leaves_slot_alone() {
        let dir = tempdir().unwrap();
        write_session(dir.path(), "p", "ses_one", "T", 1);
        write_assistant(dir.path(), "ses_one", "msg_a", 100, "openai", "gpt-4o-mini", 10, 0, 0.1);
        let loader = loader_for(dir.path());
        let data = loader.read_session("ses_one").unwrap();
        assert_eq!(data.message_count, 1);
        assert!(loader.active_slot().get().is_none());
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let dir = tempdir().unwrap();
        write_session(dir.path(), "p", "ses_one", "T", 1);
        write_assistant(dir.path(), "ses_one", "msg_a", 100, "openai", "gpt-4o-mini", 10, 0, 0.1);
        let loader = loader_for(dir.path());
        let first = loader.load_session("ses_one").unwrap();
        assert!(loader.active_slot().invalidate("ses_one"));
        assert!(!loader.active_slot().invalidate("ses_one"));
        let second = loader.load_session("ses_one").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_recent_activity_window() {
        let dir = tempdir().unwrap();
        let now = 100 * MS_PER_MINUTE;
        write_session(dir.path(), "p", "ses_one", "T", 1);
        write_assistant(dir.path(), "ses_one", "msg_a", now - 30 * MS_PER_MINUTE, "openai", "gpt-4o-mini", 1_000, 0, 0.1);
        write_assistant(dir.path(), "ses_one", "msg_b", now - 2 * MS_PER_MINUTE, "openai", "gpt-4o-mini", 400, 100, 0.1);
        write_assistant(dir.path(), "ses_one", "msg_c", now - MS_PER_MINUTE, "openai", "gpt-4o-mini", 500, 0, 0.1);

        let loader = loader_for(dir.path());
        assert_eq!(loader.recent_activity_at("ses_one", 5, now), RecentActivity::default());

        loader.load_session("ses_one").unwrap();
        let activity = loader.recent_activity_at("ses_one", 5, now);
        assert_eq!(activity.messages, 2);
        assert_eq!(activity.tokens, 1_000);
        assert!((activity.tokens_per_minute - 200.0).abs() < 1e-9);
        assert!(activity.cost > 0.0);
        assert_eq!(activity.last_message_time, now - MS_PER_MINUTE);
        assert_eq!(activity.time_since_last, MS_PER_MINUTE);

        let other = loader.recent_activity_at("ses_other", 5, now);
        assert_eq!(other, RecentActivity::default());
    }
}
