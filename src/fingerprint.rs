//! Per-file fingerprints and the persisted fingerprint table
//!
//! A file is reprocessed only when its content hash, mtime or size differ
//! from the recorded fingerprint. The table also keeps the parsed payload of
//! every file so an unchanged file is never decoded twice.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{OcsightError, Result};
use crate::models::{MessageSummary, Millis, SessionRecord};
use crate::scanner::system_time_millis;

pub const CACHE_VERSION: &str = "1.0";
pub const HASH_LENGTH: usize = 16;
pub const TABLE_FILE: &str = "data-cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub mtime: Millis,
    pub size: u64,
}

/// Truncated hex SHA-256 of a file's bytes
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(HASH_LENGTH);
    for byte in digest.iter().take(HASH_LENGTH / 2) {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

/// Read a file once, returning its fingerprint together with its content
pub fn fingerprint_file(path: &Path) -> Result<(Fingerprint, Vec<u8>)> {
    let bytes = fs::read(path)?;
    let metadata = fs::metadata(path)?;
    let mtime = metadata.modified().map(system_time_millis).unwrap_or(0);
    Ok((
        Fingerprint {
            hash: content_hash(&bytes),
            mtime,
            size: metadata.len(),
        },
        bytes,
    ))
}

/// What a file decoded to the last time it was processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Session(SessionRecord),
    Message(MessageSummary),
    /// Unparseable or invalid; remembered so it is skipped without re-reading
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableEntry {
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
    pub processed_at: Millis,
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintTable {
    pub version: String,
    pub entries: HashMap<PathBuf, TableEntry>,
    pub last_processed: Millis,
}

impl Default for FingerprintTable {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            entries: HashMap::new(),
            last_processed: 0,
        }
    }
}

impl FingerprintTable {
    pub fn path_in(cache_dir: &Path) -> PathBuf {
        cache_dir.join(TABLE_FILE)
    }

    /// Load the whole table. Anything unusable, including a table written
    /// by another format version, yields an empty table and a full rescan.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "Failed to read cache: {}", e);
                }
                return Self::default();
            }
        };

        match serde_json::from_slice::<FingerprintTable>(&content) {
            Ok(table) if table.version == CACHE_VERSION => {
                debug!(entries = table.entries.len(), "Loaded cache");
                table
            }
            Ok(table) => {
                info!(
                    found = %table.version,
                    expected = CACHE_VERSION,
                    "Cache version changed, rescanning everything"
                );
                Self::default()
            }
            Err(e) => {
                // pre-versioned or corrupt documents land here too
                warn!(path = %path.display(), "Ignoring unreadable cache: {}", e);
                Self::default()
            }
        }
    }

    /// Write the whole table back
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(self)
            .map_err(|e| OcsightError::cache(format!("Failed to encode cache: {}", e)))?;
        fs::write(path, body)?;
        Ok(())
    }

    /// The recorded payload, if `fingerprint` still matches
    pub fn lookup(&self, path: &Path, fingerprint: &Fingerprint) -> Option<&Payload> {
        self.entries
            .get(path)
            .filter(|entry| entry.fingerprint == *fingerprint)
            .map(|entry| &entry.payload)
    }

    pub fn record(&mut self, path: PathBuf, fingerprint: Fingerprint, payload: Payload, now: Millis) {
        self.entries.insert(
            path,
            TableEntry {
                fingerprint,
                processed_at: now,
                payload,
            },
        );
    }

    /// Forget files that no longer exist
    pub fn retain_paths<'a, I>(&mut self, live: I)
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let live: std::collections::HashSet<&PathBuf> = live.into_iter().collect();
        self.entries.retain(|path, _| live.contains(path));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use crate::test_support::set_mtime;
    use tempfile::tempdir;

    #[test]
    fn test_content_hash_is_truncated_sha256() {
        let hash = content_hash(b"hello");
        assert_eq!(hash.len(), HASH_LENGTH);
        assert_eq!(hash, "2cf24dba5fb0a30e");
        assert_ne!(content_hash(b"hello "), hash);
    }

    #[test]
    fn test_fingerprint_tracks_mtime_and_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("msg_1.json");
        fs::write(&path, "{}").unwrap();
        set_mtime(&path, 1_000);
        let (first, bytes) = fingerprint_file(&path).unwrap();
        assert_eq!(bytes, b"{}");
        assert_eq!(first.mtime, 1_000);
        assert_eq!(first.size, 2);

        set_mtime(&path, 2_000);
        let (second, _) = fingerprint_file(&path).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn test_save_load_and_lookup() {
        let dir = tempdir().unwrap();
        let table_path = FingerprintTable::path_in(&dir.path().join(".cache"));
        let fp = Fingerprint {
            hash: "abc".into(),
            mtime: 5,
            size: 10,
        };
        let file = PathBuf::from("/data/msg_1.json");

        let mut table = FingerprintTable::default();
        table.record(
            file.clone(),
            fp.clone(),
            Payload::Message(fixtures::user(7)),
            99,
        );
        table.last_processed = 99;
        table.save(&table_path).unwrap();

        let loaded = FingerprintTable::load(&table_path);
        assert_eq!(loaded.len(), 1);
        assert!(matches!(loaded.lookup(&file, &fp), Some(Payload::Message(m)) if m.created == 7));

        let changed = Fingerprint { size: 11, ..fp };
        assert!(loaded.lookup(&file, &changed).is_none());
    }

    #[test]
    fn test_version_mismatch_discards_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TABLE_FILE);
        fs::write(
            &path,
            r#"{"version":"3.0","entries":{},"lastProcessed":1}"#,
        )
        .unwrap();
        let table = FingerprintTable::load(&path);
        assert_eq!(table.version, CACHE_VERSION);
        assert_eq!(table.last_processed, 0);

        fs::write(&path, "not json").unwrap();
        assert!(FingerprintTable::load(&path).is_empty());
    }

    #[test]
    fn test_retain_paths() {
        let mut table = FingerprintTable::default();
        let fp = Fingerprint {
            hash: "h".into(),
            mtime: 0,
            size: 0,
        };
        let a = PathBuf::from("a");
        let b = PathBuf::from("b");
        table.record(a.clone(), fp.clone(), Payload::Invalid, 0);
        table.record(b, fp, Payload::Invalid, 0);
        table.retain_paths([&a]);
        assert_eq!(table.len(), 1);
        assert!(table.entries.contains_key(&a));
    }
}
