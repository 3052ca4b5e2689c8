//! Bounded result cache for aggregation output
//!
//! Entries are whole `SessionData` lists keyed by the query that produced
//! them, together with the file hashes they were built from. Two limits are
//! enforced after every insert: an entry count (least recently used goes
//! first) and a total byte size (largest goes first). Sizes are measured on
//! the zstd-compressed JSON when that is smaller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{OcsightError, Result};
use crate::helpers::now_millis;
use crate::models::{Millis, SessionData};
use crate::runtime::Runtime;

pub const CACHE_FILE: &str = "cache.json";
pub const CACHE_FORMAT: &str = "1.0";
pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_MAX_SIZE_MB: u64 = 500;
/// Entries smaller than this are never compressed
pub const COMPRESSION_THRESHOLD: usize = 1024;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Vec<SessionData>,
    pub timestamp: Millis,
    pub file_hashes: HashMap<String, String>,
    pub access_count: u64,
    pub last_accessed: Millis,
    pub compressed: bool,
    pub original_size: u64,
    pub compressed_size: u64,
}

impl CacheEntry {
    /// Bytes charged against the size limit
    pub fn accounted_size(&self) -> u64 {
        if self.compressed {
            self.compressed_size
        } else {
            self.original_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHealth {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub entry_count: usize,
    pub total_size_mb: f64,
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_size_mb: u64,
    pub compression: bool,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            compression: true,
        }
    }
}

impl CacheLimits {
    fn max_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    version: String,
    entries: HashMap<String, CacheEntry>,
}

pub struct CacheManager {
    file: Option<PathBuf>,
    limits: CacheLimits,
    entries: HashMap<String, CacheEntry>,
    runtime: Runtime,
    load_error: Option<String>,
}

impl CacheManager {
    /// Open the cache stored in `cache_dir`; a missing or unreadable
    /// document starts empty
    pub fn open(cache_dir: &Path, limits: CacheLimits, runtime: Runtime) -> Self {
        let file = cache_dir.join(CACHE_FILE);
        let (entries, load_error) = match load_document(&file) {
            Ok(entries) => (entries, None),
            Err(e) => {
                warn!(path = %file.display(), "Starting with empty cache: {}", e);
                (HashMap::new(), Some(e.to_string()))
            }
        };
        Self {
            file: Some(file),
            limits,
            entries,
            runtime,
            load_error,
        }
    }

    /// Cache that is never written to disk
    #[cfg(test)]
    pub fn in_memory(limits: CacheLimits, runtime: Runtime) -> Self {
        Self {
            file: None,
            limits,
            entries: HashMap::new(),
            runtime,
            load_error: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(CacheEntry::accounted_size).sum()
    }

    pub fn get(&mut self, key: &str, current: &HashMap<String, String>) -> Option<Vec<SessionData>> {
        self.get_at(key, current, now_millis())
    }

    /// Hit only when the entry was built from exactly the `current` file
    /// set and hashes; a stale entry is dropped. Access stats are saved on
    /// a hit so eviction order carries over to later runs.
    pub fn get_at(
        &mut self,
        key: &str,
        current: &HashMap<String, String>,
        now: Millis,
    ) -> Option<Vec<SessionData>> {
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;

        if entry.file_hashes != *current {
            debug!(key, "cache entry stale");
            self.entries.remove(key);
            self.persist();
            return None;
        }

        let data = entry.data.clone();
        self.persist();
        Some(data)
    }

    pub fn set(&mut self, key: &str, data: Vec<SessionData>, file_hashes: HashMap<String, String>) {
        self.set_at(key, data, file_hashes, now_millis());
    }

    pub fn set_at(
        &mut self,
        key: &str,
        data: Vec<SessionData>,
        file_hashes: HashMap<String, String>,
        now: Millis,
    ) {
        let encoded = match serde_json::to_vec(&data) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key, "Not caching unencodable result: {}", e);
                return;
            }
        };
        let original_size = encoded.len() as u64;
        let (compressed, compressed_size) = if self.limits.compression {
            compressed_size(&encoded)
                .map(|size| (true, size))
                .unwrap_or((false, original_size))
        } else {
            (false, original_size)
        };

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                timestamp: now,
                file_hashes,
                access_count: 0,
                last_accessed: now,
                compressed,
                original_size,
                compressed_size,
            },
        );

        self.evict_if_needed();
        self.persist();
    }

    pub fn invalidate(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.persist();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.load_error = None;
        self.persist();
    }

    pub fn health(&self) -> CacheHealth {
        let original: u64 = self.entries.values().map(|e| e.original_size).sum();
        let accounted = self.total_size();
        CacheHealth {
            is_valid: self.load_error.is_none(),
            reason: self.load_error.clone(),
            entry_count: self.entries.len(),
            total_size_mb: accounted as f64 / (1024.0 * 1024.0),
            compression_ratio: if original > 0 {
                accounted as f64 / original as f64
            } else {
                1.0
            },
        }
    }

    fn evict_if_needed(&mut self) {
        if self.entries.len() > self.limits.max_entries {
            let excess = self.entries.len() - self.limits.max_entries;
            self.evict_lru(excess);
        }

        let max_bytes = self.limits.max_bytes();
        let total = self.total_size();
        if total > max_bytes {
            self.evict_by_size(total - max_bytes);
        }
    }

    /// Oldest access first; among equals, the least used
    fn evict_lru(&mut self, count: usize) {
        let mut order: Vec<(String, Millis, u64)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed, e.access_count))
            .collect();
        order.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));

        for (key, _, _) in order.into_iter().take(count) {
            self.entries.remove(&key);
        }
        debug!(evicted = count, "LRU eviction");
        self.runtime.release_hint();
    }

    /// Largest first; among equals, the least recently used
    fn evict_by_size(&mut self, target: u64) {
        let mut order: Vec<(String, u64, Millis)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.accounted_size(), e.last_accessed))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));

        let mut removed = 0;
        for (key, size, _) in order {
            if removed >= target {
                break;
            }
            self.entries.remove(&key);
            removed += size;
        }
        debug!(bytes = removed, "size eviction");
        self.runtime.release_hint();
    }

    fn persist(&self) {
        let Some(file) = &self.file else {
            return;
        };
        if let Err(e) = save_document(file, &self.entries) {
            warn!(path = %file.display(), "Failed to save cache: {}", e);
        }
    }
}

/// zstd size of `bytes`, or `None` when below the threshold or on failure
fn compressed_size(bytes: &[u8]) -> Option<u64> {
    if bytes.len() <= COMPRESSION_THRESHOLD {
        return None;
    }
    match zstd::encode_all(bytes, ZSTD_LEVEL) {
        Ok(out) => Some(out.len() as u64),
        Err(e) => {
            debug!("compression failed, storing uncompressed: {}", e);
            None
        }
    }
}

fn load_document(file: &Path) -> Result<HashMap<String, CacheEntry>> {
    let content = match fs::read(file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let document: CacheDocument = serde_json::from_slice(&content)
        .map_err(|e| OcsightError::cache(format!("unreadable cache document: {}", e)))?;
    if document.version != CACHE_FORMAT {
        debug!(found = %document.version, "discarding cache with other format");
        return Ok(HashMap::new());
    }
    Ok(document.entries)
}

fn save_document(file: &Path, entries: &HashMap<String, CacheEntry>) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    let document = CacheDocument {
        version: CACHE_FORMAT.to_string(),
        entries: entries.clone(),
    };
    let body = serde_json::to_vec(&document)
        .map_err(|e| OcsightError::cache(format!("Failed to encode cache: {}", e)))?;
    fs::write(file, body)?;
    Ok(())
}
