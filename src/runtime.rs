//! Host capability probing
//!
//! Memory headroom decides how many parse workers the aggregation pool gets.
//! The gauge is chosen once at startup: `/proc/meminfo` where it exists,
//! otherwise a portable gauge that only knows the CPU count.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

use crate::error::{OcsightError, Result};

/// Rough working set of one parse batch
pub const MB_PER_BATCH: u64 = 10;

pub trait MemoryGauge: Send + Sync {
    fn name(&self) -> &'static str;

    /// Memory the process may still use, in MiB, if the host reports it
    fn available_mb(&self) -> Option<u64>;

    /// Called after large evictions; a gauge may release memory back to the OS
    fn release_hint(&self) {
        trace!(gauge = self.name(), "release hint");
    }
}

/// Linux gauge backed by `MemAvailable` in `/proc/meminfo`
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryGauge for ProcMeminfo {
    fn name(&self) -> &'static str {
        "meminfo"
    }

    fn available_mb(&self) -> Option<u64> {
        let content = fs::read_to_string(&self.path).ok()?;
        parse_mem_available_kb(&content).map(|kb| kb / 1024)
    }
}

/// Fallback when no memory figure is available
pub struct Portable;

impl MemoryGauge for Portable {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn available_mb(&self) -> Option<u64> {
        None
    }
}

fn parse_mem_available_kb(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

#[derive(Clone)]
pub struct Runtime {
    gauge: Arc<dyn MemoryGauge>,
    cpus: usize,
    memory_budget_mb: u64,
}

impl Runtime {
    /// Pick the gauge for this host
    pub fn detect(memory_budget_mb: u64) -> Self {
        let meminfo = Path::new("/proc/meminfo");
        let gauge: Arc<dyn MemoryGauge> = if meminfo.is_file() {
            Arc::new(ProcMeminfo::at(meminfo))
        } else {
            Arc::new(Portable)
        };
        Self::with_gauge(gauge, memory_budget_mb)
    }

    pub fn with_gauge(gauge: Arc<dyn MemoryGauge>, memory_budget_mb: u64) -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        debug!(gauge = gauge.name(), cpus, "runtime detected");
        Self {
            gauge,
            cpus,
            memory_budget_mb,
        }
    }

    pub fn gauge_name(&self) -> &'static str {
        self.gauge.name()
    }

    /// Worker count bounded by CPUs and by memory headroom
    pub fn optimal_concurrency(&self) -> usize {
        let headroom = self
            .gauge
            .available_mb()
            .map(|mb| mb.min(self.memory_budget_mb))
            .unwrap_or(self.memory_budget_mb);
        let by_memory = (headroom / MB_PER_BATCH).max(1) as usize;
        self.cpus.min(by_memory).max(1)
    }

    pub fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.optimal_concurrency())
            .thread_name(|i| format!("ocsight-parse-{}", i))
            .build()
            .map_err(|e| OcsightError::other(format!("Failed to create thread pool: {}", e)))
    }

    pub fn release_hint(&self) {
        self.gauge.release_hint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<u64>);

    impl MemoryGauge for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn available_mb(&self) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn test_parse_meminfo() {
        let sample = "MemTotal:       16314080 kB\nMemFree:         1200000 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_mem_available_kb(sample), Some(8_192_000));
        assert_eq!(parse_mem_available_kb("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_concurrency_bounded_by_memory() {
        let tight = Runtime::with_gauge(Arc::new(Fixed(Some(15))), 512);
        assert_eq!(tight.optimal_concurrency(), 1);

        let roomy = Runtime::with_gauge(Arc::new(Fixed(Some(64_000))), 512);
        assert!(roomy.optimal_concurrency() >= 1);
        assert!(roomy.optimal_concurrency() <= roomy.cpus);
    }

    #[test]
    fn test_portable_uses_budget() {
        let runtime = Runtime::with_gauge(Arc::new(Portable), 0);
        assert_eq!(runtime.optimal_concurrency(), 1);
        assert_eq!(runtime.gauge_name(), "portable");
        assert!(runtime.thread_pool().is_ok());
    }
}
