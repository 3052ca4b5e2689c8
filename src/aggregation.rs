//! Bulk load of every session for the reporting commands
//!
//! Files are fingerprinted first. A result-cache hit on the exact file set
//! returns immediately; otherwise each file is decoded only if its
//! fingerprint changed since the last run, in parallel batches, and merged
//! on the calling thread.

use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache::{CacheLimits, CacheManager};
use crate::error::{OcsightError, Result};
use crate::fingerprint::{self, Fingerprint, FingerprintTable, Payload};
use crate::helpers::{MS_PER_DAY, now_millis};
use crate::models::{MessageRecord, MessageSummary, Millis, SessionData, SessionRecord};
use crate::runtime::Runtime;
use crate::scanner::{self, FileEntry, MESSAGE_FILES, SESSION_FILES};

pub const BATCH_SIZE: usize = 100;
pub const UNTITLED_SESSION: &str = "Untitled Session";

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub limit: Option<usize>,
    pub days: Option<u32>,
    pub cache: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub session_files: usize,
    pub message_files: usize,
    /// Files decoded during this run
    pub parsed: usize,
    /// Files whose previous decode was reused
    pub reused: usize,
    pub invalid: usize,
    pub dropped_sessions: usize,
    pub result_cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub sessions: Vec<SessionData>,
    pub stats: ScanStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Session,
    Message,
}

struct Processed {
    path: PathBuf,
    fingerprint: Fingerprint,
    payload: Payload,
    reused: bool,
}

/// The data root must exist and be a directory; nothing else is fatal
pub fn ensure_data_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(OcsightError::data_dir_not_found(path));
    }
    if !path.is_dir() {
        return Err(OcsightError::not_a_directory(path));
    }
    Ok(())
}

fn progress(quiet: bool, message: &str) {
    if quiet {
        debug!("{}", message);
    } else {
        info!("{}", message);
    }
}

fn decode(kind: FileKind, path: &Path, bytes: &[u8]) -> Payload {
    let payload = match kind {
        FileKind::Session => serde_json::from_slice::<SessionRecord>(bytes)
            .ok()
            .filter(|s| !s.id.trim().is_empty())
            .map(Payload::Session),
        FileKind::Message => serde_json::from_slice::<MessageRecord>(bytes)
            .ok()
            .map(|record| Payload::Message(MessageSummary::from_record(record))),
    };
    payload.unwrap_or_else(|| {
        warn!(path = %path.display(), "Skipping invalid {:?} file", kind);
        Payload::Invalid
    })
}

/// `known` is the fingerprint taken for the result-cache check; when the
/// table already has a payload for it the file is not read again
fn process(
    kind: FileKind,
    path: &Path,
    known: Option<&Fingerprint>,
    table: &FingerprintTable,
) -> Option<Processed> {
    if let Some(fingerprint) = known {
        if let Some(payload) = table.lookup(path, fingerprint) {
            return Some(Processed {
                path: path.to_path_buf(),
                fingerprint: fingerprint.clone(),
                payload: payload.clone(),
                reused: true,
            });
        }
    }

    let (fingerprint, bytes) = match fingerprint::fingerprint_file(path) {
        Ok(read) => read,
        Err(e) => {
            warn!(path = %path.display(), "Skipping unreadable file: {}", e);
            return None;
        }
    };

    if let Some(payload) = table.lookup(path, &fingerprint) {
        return Some(Processed {
            path: path.to_path_buf(),
            fingerprint,
            payload: payload.clone(),
            reused: true,
        });
    }

    let payload = decode(kind, path, &bytes);
    Some(Processed {
        path: path.to_path_buf(),
        fingerprint,
        payload,
        reused: false,
    })
}

pub struct Aggregator {
    data_dir: PathBuf,
    cache_dir: PathBuf,
    runtime: Runtime,
    limits: CacheLimits,
}

impl Aggregator {
    pub fn new(data_dir: &Path, cache_dir: &Path, runtime: Runtime, limits: CacheLimits) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            runtime,
            limits,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_key(&self, options: &AggregateOptions) -> String {
        format!(
            "{}:days={}:limit={}",
            self.data_dir.display(),
            options.days.map(|d| d.to_string()).unwrap_or_default(),
            options.limit.map(|l| l.to_string()).unwrap_or_default()
        )
    }

    /// Forget the cached result for one option set; file fingerprints stay
    pub fn invalidate(&self, options: &AggregateOptions) {
        CacheManager::open(&self.cache_dir, self.limits, self.runtime.clone())
            .invalidate(&self.cache_key(options));
    }

    /// Drop every cached result and the fingerprint table
    pub fn clear_cache(&self) -> Result<()> {
        CacheManager::open(&self.cache_dir, self.limits, self.runtime.clone()).clear();
        match fs::remove_file(FingerprintTable::path_in(&self.cache_dir)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub fn run(&self, options: &AggregateOptions) -> Result<Aggregate> {
        self.run_at(options, now_millis())
    }

    pub fn run_at(&self, options: &AggregateOptions, now: Millis) -> Result<Aggregate> {
        ensure_data_dir(&self.data_dir)?;

        let storage = self.data_dir.join("storage");
        let session_files = scanner::scan_lenient(&storage.join("session"), SESSION_FILES);
        let mut message_files = scanner::scan_lenient(&storage.join("message"), MESSAGE_FILES);
        progress(
            options.quiet,
            &format!(
                "Found {} session files and {} message files",
                session_files.len(),
                message_files.len()
            ),
        );

        if let Some(days) = options.days {
            let cutoff = now - days as Millis * MS_PER_DAY;
            message_files.retain(|f| f.mtime >= cutoff);
            progress(
                options.quiet,
                &format!("Found {} recent message files", message_files.len()),
            );
        }
        if let Some(limit) = options.limit {
            message_files.truncate(limit);
        }

        let mut stats = ScanStats {
            session_files: session_files.len(),
            message_files: message_files.len(),
            ..ScanStats::default()
        };

        let files: Vec<(FileKind, &FileEntry)> = session_files
            .iter()
            .map(|f| (FileKind::Session, f))
            .chain(message_files.iter().map(|f| (FileKind::Message, f)))
            .collect();

        let pool = self.runtime.thread_pool()?;
        let key = self.cache_key(options);
        let mut results = options
            .cache
            .then(|| CacheManager::open(&self.cache_dir, self.limits, self.runtime.clone()));

        // aligned with `files`, reused by the batches below
        let fingerprints: Vec<Option<Fingerprint>> = if results.is_some() {
            pool.install(|| {
                files
                    .par_iter()
                    .map(|(_, f)| fingerprint::fingerprint_file(&f.path).ok().map(|(fp, _)| fp))
                    .collect()
            })
        } else {
            vec![None; files.len()]
        };
        let current: HashMap<String, String> = files
            .iter()
            .zip(&fingerprints)
            .filter_map(|((_, f), fp)| {
                let fp = fp.as_ref()?;
                Some((
                    f.path.display().to_string(),
                    format!("{}:{}:{}", fp.hash, fp.mtime, fp.size),
                ))
            })
            .collect();

        if let Some(sessions) = results.as_mut().and_then(|r| r.get(&key, &current)) {
            progress(options.quiet, "Using cached results");
            stats.reused = files.len();
            stats.result_cache_hit = true;
            return Ok(Aggregate { sessions, stats });
        }

        let table_path = FingerprintTable::path_in(&self.cache_dir);
        let mut table = if options.cache {
            FingerprintTable::load(&table_path)
        } else {
            FingerprintTable::default()
        };

        let mut metas: HashMap<String, SessionRecord> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut by_session: HashMap<String, Vec<MessageSummary>> = HashMap::new();

        let batches = files
            .chunks(BATCH_SIZE)
            .zip(fingerprints.chunks(BATCH_SIZE));
        for (batch_no, (batch, known)) in batches.enumerate() {
            let processed: Vec<Processed> = pool.install(|| {
                batch
                    .par_iter()
                    .zip(known.par_iter())
                    .filter_map(|((kind, f), fp)| process(*kind, &f.path, fp.as_ref(), &table))
                    .collect()
            });

            for item in processed {
                if item.reused {
                    stats.reused += 1;
                } else {
                    stats.parsed += 1;
                }

                match &item.payload {
                    Payload::Session(meta) => {
                        if !metas.contains_key(&meta.id) {
                            order.push(meta.id.clone());
                        }
                        metas.insert(meta.id.clone(), meta.clone());
                    }
                    Payload::Message(message) => by_session
                        .entry(message.session_id.clone())
                        .or_default()
                        .push(message.clone()),
                    Payload::Invalid => stats.invalid += 1,
                }

                if options.cache && !item.reused {
                    table.record(item.path, item.fingerprint, item.payload, now);
                }
            }

            let done = (batch_no + 1) * BATCH_SIZE;
            if done % 1000 == 0 {
                progress(
                    options.quiet,
                    &format!("Processed {}/{} files...", done, files.len()),
                );
            }
        }

        progress(
            options.quiet,
            &format!(
                "Processing {} new/changed files, {} cached files",
                stats.parsed, stats.reused
            ),
        );

        let mut sessions: Vec<SessionData> = Vec::with_capacity(order.len());
        for id in order {
            let Some(meta) = metas.remove(&id) else {
                continue;
            };
            let messages = by_session.remove(&id).unwrap_or_default();
            if messages.is_empty() {
                stats.dropped_sessions += 1;
                continue;
            }
            sessions.push(SessionData::derive(
                meta.id,
                meta.title,
                meta.time,
                messages,
                UNTITLED_SESSION,
            ));
        }
        sessions.sort_by(|a, b| {
            b.time
                .created
                .cmp(&a.time.created)
                .then_with(|| a.id.cmp(&b.id))
        });

        progress(
            options.quiet,
            &format!("Completed processing {} sessions", sessions.len()),
        );

        if options.cache {
            if options.days.is_none() && options.limit.is_none() {
                table.retain_paths(files.iter().map(|(_, f)| &f.path));
            }
            table.last_processed = now;
            if let Err(e) = table.save(&table_path) {
                warn!("Failed to save cache: {}", e);
            }
            if let Some(results) = results.as_mut() {
                results.set(&key, sessions.clone(), current);
            }
            self.runtime.release_hint();
        }

        Ok(Aggregate { sessions, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CACHE_FILE;
    use crate::fingerprint::TABLE_FILE;
    use crate::runtime::Portable;
    use crate::test_support::*;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        data: TempDir,
        cache: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                data: tempdir().unwrap(),
                cache: tempdir().unwrap(),
            };
            let root = fixture.data.path();
            write_session(root, "proj", "ses_a", "Parser work", 1_000);
            write_session(root, "proj", "ses_b", "Docs", 2_000);
            write_assistant(root, "ses_a", "msg_1", 1_100, "anthropic", "claude-sonnet-4", 100, 50, 0.02);
            write_user(root, "ses_a", "msg_2", 1_050, "please fix");
            write_assistant(root, "ses_b", "msg_3", 2_100, "openai", "gpt-4o-mini", 10, 5, 0.01);
            fixture
        }

        fn aggregator(&self) -> Aggregator {
            Aggregator::new(
                self.data.path(),
                self.cache.path(),
                Runtime::with_gauge(Arc::new(Portable), 64),
                CacheLimits::default(),
            )
        }
    }

    fn cached() -> AggregateOptions {
        AggregateOptions {
            cache: true,
            quiet: true,
            ..AggregateOptions::default()
        }
    }

    #[test]
    fn test_builds_sessions_newest_first() {
        let fixture = Fixture::new();
        let result = fixture.aggregator().run(&cached()).unwrap();
        let ids: Vec<&str> = result.sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["ses_b", "ses_a"]);

        let a = &result.sessions[1];
        assert_eq!(a.message_count, 2);
        assert_eq!(a.tokens_used, 150);
        assert_eq!(a.model.qualified(), "anthropic/claude-sonnet-4");
        assert_eq!(result.stats.parsed, 5);
    }

    #[test]
    fn test_unchanged_files_are_never_reparsed() {
        let fixture = Fixture::new();
        let aggregator = fixture.aggregator();
        let first = aggregator.run(&cached()).unwrap();

        // force the fingerprint path rather than the whole-result cache
        fs::remove_file(fixture.cache.path().join(CACHE_FILE)).unwrap();
        let second = aggregator.run(&cached()).unwrap();
        assert_eq!(second.stats.parsed, 0);
        assert_eq!(second.stats.reused, 5);
        assert_eq!(
            serde_json::to_string(&first.sessions).unwrap(),
            serde_json::to_string(&second.sessions).unwrap()
        );

        let third = aggregator.run(&cached()).unwrap();
        assert!(third.stats.result_cache_hit);
        assert_eq!(third.sessions, first.sessions);
    }

    #[test]
    fn test_changed_file_is_reparsed_alone() {
        let fixture = Fixture::new();
        let aggregator = fixture.aggregator();
        aggregator.run(&cached()).unwrap();

        write_assistant(fixture.data.path(), "ses_b", "msg_3", 2_100, "openai", "gpt-4o-mini", 999, 5, 0.01);
        let rerun = aggregator.run(&cached()).unwrap();
        assert!(!rerun.stats.result_cache_hit);
        assert_eq!(rerun.stats.parsed, 1);
        assert_eq!(rerun.sessions[0].tokens_used, 1_004);
    }

    #[test]
    fn test_version_mismatch_forces_full_rescan() {
        let fixture = Fixture::new();
        let aggregator = fixture.aggregator();
        aggregator.run(&cached()).unwrap();

        fs::remove_file(fixture.cache.path().join(CACHE_FILE)).unwrap();
        let table_path = fixture.cache.path().join(TABLE_FILE);
        let stale = fs::read_to_string(&table_path)
            .unwrap()
            .replacen("\"version\":\"1.0\"", "\"version\":\"0.9\"", 1);
        fs::write(&table_path, stale).unwrap();

        let rerun = aggregator.run(&cached()).unwrap();
        assert_eq!(rerun.stats.parsed, 5);
        assert_eq!(rerun.stats.reused, 0);
    }

    #[test]
    fn test_session_without_valid_messages_is_dropped() {
        let fixture = Fixture::new();
        let root = fixture.data.path();
        write_session(root, "proj", "ses_c", "Broken", 3_000);
        write_message_json(root, "ses_c", "msg_9", "{ truncated");
        write_session(root, "proj", "ses_d", "Nothing", 4_000);

        let result = fixture.aggregator().run(&cached()).unwrap();
        assert!(result.sessions.iter().all(|s| s.id != "ses_c" && s.id != "ses_d"));
        assert_eq!(result.stats.dropped_sessions, 2);
        assert_eq!(result.stats.invalid, 1);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let aggregator = Aggregator::new(
            &missing,
            dir.path(),
            Runtime::with_gauge(Arc::new(Portable), 64),
            CacheLimits::default(),
        );
        let err = aggregator.run(&cached()).unwrap_err();
        assert!(matches!(err, OcsightError::DataDirNotFound { .. }));

        let file = dir.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            ensure_data_dir(&file),
            Err(OcsightError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_days_filter_uses_file_mtime() {
        let fixture = Fixture::new();
        let root = fixture.data.path();
        let now = 100 * MS_PER_DAY;
        set_mtime(&message_dir(root, "ses_a").join("msg_1.json"), now - 10 * MS_PER_DAY);
        set_mtime(&message_dir(root, "ses_a").join("msg_2.json"), now - 10 * MS_PER_DAY);
        set_mtime(&message_dir(root, "ses_b").join("msg_3.json"), now - MS_PER_DAY);

        let options = AggregateOptions {
            days: Some(7),
            quiet: true,
            ..AggregateOptions::default()
        };
        let result = fixture.aggregator().run_at(&options, now).unwrap();
        assert_eq!(result.stats.message_files, 1);
        let ids: Vec<&str> = result.sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["ses_b"]);
    }

    #[test]
    fn test_invalidate_and_clear_cache() {
        let fixture = Fixture::new();
        let aggregator = fixture.aggregator();
        aggregator.run(&cached()).unwrap();
        assert!(aggregator.run(&cached()).unwrap().stats.result_cache_hit);

        aggregator.invalidate(&cached());
        let rerun = aggregator.run(&cached()).unwrap();
        assert!(!rerun.stats.result_cache_hit);
        assert_eq!(rerun.stats.parsed, 0);

        aggregator.clear_cache().unwrap();
        assert!(!fixture.cache.path().join(TABLE_FILE).exists());
        let cold = aggregator.run(&cached()).unwrap();
        assert!(!cold.stats.result_cache_hit);
        assert_eq!(cold.stats.parsed, 5);
    }

    #[test]
    fn test_known_fingerprint_skips_reading() {
        let dir = tempdir().unwrap();
        // never written, so any read would fail
        let path = dir.path().join("msg_gone.json");
        let fp = Fingerprint {
            hash: "0123456789abcdef".into(),
            mtime: 1,
            size: 2,
        };
        let mut table = FingerprintTable::default();
        table.record(path.clone(), fp.clone(), Payload::Invalid, 1);

        let processed = process(FileKind::Message, &path, Some(&fp), &table).unwrap();
        assert!(processed.reused);
        assert_eq!(processed.payload, Payload::Invalid);
        assert!(process(FileKind::Message, &path, None, &table).is_none());
    }

    #[test]
    fn test_no_cache_writes_nothing() {
        let fixture = Fixture::new();
        let options = AggregateOptions {
            quiet: true,
            ..AggregateOptions::default()
        };
        let result = fixture.aggregator().run(&options).unwrap();
        assert_eq!(result.sessions.len(), 2);
        assert!(!fixture.cache.path().join(TABLE_FILE).exists());
        assert!(!fixture.cache.path().join(CACHE_FILE).exists());
    }
}
