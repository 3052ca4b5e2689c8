use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::budget::BudgetConfig;
use crate::cache::{CacheLimits, DEFAULT_MAX_ENTRIES, DEFAULT_MAX_SIZE_MB};
use crate::error::OcsightError;
use crate::export::ExportFormat;
use crate::live::{DEFAULT_REFRESH_SECS, MAX_REFRESH_SECS, MIN_REFRESH_SECS};
use crate::pricing::{DEFAULT_CATALOG_URL, DEFAULT_TIMEOUT, DEFAULT_TTL};

pub const DATA_DIR_ENV: &str = "OCSIGHT_DATA_DIR";

/// Configuration settings for ocsight
///
/// Persisted as YAML at `~/.config/ocsight/config.yaml`. Every section is
/// optional in the file; missing keys take their defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub ui: UiConfig,
    pub export: ExportConfig,
    pub cache: CacheConfig,
    pub pricing: PricingConfig,
    pub budget: BudgetConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// OpenCode data root (default: $OCSIGHT_DATA_DIR or ~/.local/share/opencode)
    pub data_dir: Option<PathBuf>,
    /// Where exports land (default: current directory)
    pub export_dir: Option<PathBuf>,
    /// Result cache and fingerprint table (default: ~/.cache/ocsight)
    pub cache_dir: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub colors: bool,
    /// Seconds between live dashboard refreshes
    pub live_refresh_interval: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            colors: true,
            live_refresh_interval: DEFAULT_REFRESH_SECS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    pub default_format: ExportFormat,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_size_mb: u64,
    pub compression: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            compression: true,
        }
    }
}

impl CacheConfig {
    pub fn limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.max_entries,
            max_size_mb: self.max_size_mb,
            compression: self.compression,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub ttl_hours: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            ttl_hours: DEFAULT_TTL.as_secs() / 3600,
        }
    }
}

impl PricingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 60 * 60)
    }
}

/// Outcome of one `config doctor` check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoctorCheck {
    pub level: CheckLevel,
    pub message: String,
}

impl DoctorCheck {
    fn new(level: CheckLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_with(path, dirs::home_dir().as_deref())
}

fn expand_tilde_with(path: &Path, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return path.to_path_buf();
    };
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Configured path, else the environment override, else the OpenCode default
fn resolve_data_dir(
    configured: Option<&Path>,
    env: Option<PathBuf>,
    home: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = configured {
        return Some(expand_tilde_with(path, home));
    }
    if let Some(path) = env.filter(|p| !p.as_os_str().is_empty()) {
        return Some(expand_tilde_with(&path, home));
    }
    home.map(|h| h.join(".local").join("share").join("opencode"))
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("ocsight").join("config.yaml"))
    }

    /// Missing file gives defaults; an unreadable or invalid one is reported
    /// and also gives defaults.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "Failed to read config: {}", e);
                }
                return Self::default();
            }
        };
        match serde_yaml::from_str::<Config>(&content) {
            Ok(config) => {
                debug!(path = %path.display(), "config loaded");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), "Invalid config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        resolve_data_dir(
            self.paths.data_dir.as_deref(),
            std::env::var_os(DATA_DIR_ENV).map(PathBuf::from),
            dirs::home_dir().as_deref(),
        )
        .context("Could not determine the OpenCode data directory")
    }

    pub fn set_data_dir(&mut self, path: PathBuf) {
        self.paths.data_dir = Some(path);
    }

    pub fn export_dir(&self) -> PathBuf {
        self.paths
            .export_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn cache_dir(&self) -> PathBuf {
        if let Some(path) = &self.paths.cache_dir {
            return expand_tilde(path);
        }
        dirs::cache_dir()
            .map(|d| d.join("ocsight"))
            .unwrap_or_else(|| std::env::temp_dir().join("ocsight-cache"))
    }

    /// Reject values the rest of the program cannot work with
    pub fn validate(&self) -> crate::error::Result<()> {
        let refresh = self.ui.live_refresh_interval;
        if !(MIN_REFRESH_SECS..=MAX_REFRESH_SECS).contains(&refresh) {
            return Err(OcsightError::validation(
                "ui.live_refresh_interval",
                format!(
                    "must be between {} and {} seconds (got {})",
                    MIN_REFRESH_SECS, MAX_REFRESH_SECS, refresh
                ),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(OcsightError::validation("cache.max_entries", "must be positive"));
        }
        if self.pricing.timeout_secs == 0 {
            return Err(OcsightError::validation("pricing.timeout_secs", "must be positive"));
        }

        let thresholds = &self.budget.alert_thresholds;
        if !(0.0 < thresholds.warning
            && thresholds.warning < thresholds.critical
            && thresholds.critical <= 100.0)
        {
            return Err(OcsightError::validation(
                "budget.alert_thresholds",
                "need 0 < warning < critical <= 100",
            ));
        }
        if let Some(limit) = self.budget.global_monthly_limit {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(OcsightError::validation(
                    "budget.global_monthly_limit",
                    "must be a positive amount",
                ));
            }
        }
        for (id, provider) in &self.budget.providers {
            if !(provider.monthly_limit.is_finite() && provider.monthly_limit > 0.0) {
                return Err(OcsightError::validation(
                    &format!("budget.providers.{}.monthly_limit", id),
                    "must be a positive amount",
                ));
            }
        }
        Ok(())
    }

    /// Check paths and settings without changing anything on disk except
    /// creating the export and cache directories
    pub fn doctor(&self) -> Vec<DoctorCheck> {
        let mut checks = Vec::new();

        match self.data_dir() {
            Ok(dir) if dir.is_dir() => checks.push(DoctorCheck::new(
                CheckLevel::Ok,
                format!("Data directory exists: {}", dir.display()),
            )),
            Ok(dir) => checks.push(DoctorCheck::new(
                CheckLevel::Warning,
                format!("Data directory not found: {}", dir.display()),
            )),
            Err(e) => checks.push(DoctorCheck::new(CheckLevel::Error, e.to_string())),
        }

        for (label, dir, failure) in [
            ("Export", self.export_dir(), CheckLevel::Error),
            ("Cache", self.cache_dir(), CheckLevel::Warning),
        ] {
            match fs::create_dir_all(&dir) {
                Ok(()) => checks.push(DoctorCheck::new(
                    CheckLevel::Ok,
                    format!("{} directory ready: {}", label, dir.display()),
                )),
                Err(e) => checks.push(DoctorCheck::new(
                    failure,
                    format!("Cannot create {} directory {}: {}", label.to_lowercase(), dir.display(), e),
                )),
            }
        }

        match self.validate() {
            Ok(()) => checks.push(DoctorCheck::new(CheckLevel::Ok, "Settings are valid")),
            Err(e) => checks.push(DoctorCheck::new(CheckLevel::Warning, e.to_string())),
        }
        checks
    }
}
