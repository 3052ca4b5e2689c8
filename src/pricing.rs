//! Model pricing catalog
//!
//! Wraps the models.dev database (`{provider: {name, models: {id: {...}}}}`)
//! behind an injected service. One fetch per TTL window; on failure the last
//! good snapshot is served, or an empty catalog if there never was one, and
//! no new attempt is made until the retry backoff has passed.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{OcsightError, Result};
use crate::models::{TokenCounts, UNKNOWN};

pub const DEFAULT_CATALOG_URL: &str = "https://models.dev/api.json";
pub const DEFAULT_TTL: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RETRY_BACKOFF: Duration = Duration::from_secs(60);
const USER_AGENT: &str = "ocsight-cli/1.0";
const PER_MILLION: f64 = 1_000_000.0;

/// USD per million tokens
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    #[serde(default)]
    pub input: Option<f64>,
    #[serde(default)]
    pub output: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<f64>,
    #[serde(default)]
    pub cache_read: Option<f64>,
    #[serde(default)]
    pub cache_write: Option<f64>,
}

/// Per-category prices after fallbacks are applied
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolvedPrices {
    pub input: f64,
    pub output: f64,
    pub reasoning: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelCost {
    /// Reasoning and cache categories bill at the input price when the
    /// catalog has no specific entry for them.
    pub fn resolve(&self) -> ResolvedPrices {
        let clean = |p: Option<f64>| p.filter(|v| v.is_finite() && *v >= 0.0);
        let input = clean(self.input).unwrap_or(0.0);
        ResolvedPrices {
            input,
            output: clean(self.output).unwrap_or(0.0),
            reasoning: clean(self.reasoning).unwrap_or(input),
            cache_read: clean(self.cache_read).unwrap_or(input),
            cache_write: clean(self.cache_write).unwrap_or(input),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelLimit {
    #[serde(default)]
    pub context: Option<u64>,
    #[serde(default)]
    pub output: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weights {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub name: String,
    pub provider_id: String,
    pub model_id: String,
    pub cost: Option<ModelCost>,
    pub limit: Option<ModelLimit>,
    pub reasoning: Option<bool>,
    pub tool_call: Option<bool>,
    pub attachment: Option<bool>,
    pub release_date: Option<String>,
    pub weights: Weights,
}

impl ModelData {
    pub fn qualified_id(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }

    pub fn context_limit(&self) -> Option<u64> {
        self.limit.as_ref().and_then(|l| l.context)
    }

    /// Total USD for a token bundle, 0 when the model has no pricing
    pub fn cost_for(&self, tokens: &TokenCounts) -> f64 {
        let Some(cost) = &self.cost else {
            return 0.0;
        };
        let prices = cost.resolve();
        let total = tokens.input as f64 / PER_MILLION * prices.input
            + tokens.output as f64 / PER_MILLION * prices.output
            + tokens.reasoning as f64 / PER_MILLION * prices.reasoning
            + tokens.cache.read as f64 / PER_MILLION * prices.cache_read
            + tokens.cache.write as f64 / PER_MILLION * prices.cache_write;
        if total.is_finite() { total } else { 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub npm: Option<String>,
    pub env: Vec<String>,
    pub doc: Option<String>,
    pub api: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub models: Vec<ModelData>,
    pub providers: Vec<ProviderInfo>,
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    npm: Option<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    doc: Option<String>,
    #[serde(default)]
    api: Option<String>,
    #[serde(default)]
    models: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cost: Option<ModelCost>,
    #[serde(default)]
    limit: Option<ModelLimit>,
    #[serde(default)]
    reasoning: Option<bool>,
    #[serde(default)]
    tool_call: Option<bool>,
    #[serde(default)]
    attachment: Option<bool>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    open_weights: bool,
}

impl Catalog {
    /// Decode the provider-keyed catalog document. Malformed providers or
    /// models are skipped individually.
    pub fn from_json(raw: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(root) = raw else {
            return Err(OcsightError::pricing("catalog root is not an object"));
        };

        let mut catalog = Catalog::default();
        for (provider_id, value) in root {
            let provider: RawProvider = match serde_json::from_value(value) {
                Ok(p) => p,
                Err(e) => {
                    debug!(provider = %provider_id, "skipping malformed provider: {}", e);
                    continue;
                }
            };

            for (model_id, model_value) in provider.models {
                match serde_json::from_value::<RawModel>(model_value) {
                    Ok(raw) => catalog.models.push(ModelData {
                        name: raw.name.unwrap_or_else(|| model_id.clone()),
                        provider_id: provider_id.clone(),
                        model_id,
                        cost: raw.cost,
                        limit: raw.limit,
                        reasoning: raw.reasoning,
                        tool_call: raw.tool_call,
                        attachment: raw.attachment,
                        release_date: raw.release_date,
                        weights: if raw.open_weights {
                            Weights::Open
                        } else {
                            Weights::Closed
                        },
                    }),
                    Err(e) => debug!(model = %model_id, "skipping malformed model: {}", e),
                }
            }

            catalog.providers.push(ProviderInfo {
                name: provider.name.unwrap_or_else(|| provider_id.clone()),
                id: provider_id,
                npm: provider.npm,
                env: provider.env,
                doc: provider.doc,
                api: provider.api,
            });
        }

        Ok(catalog)
    }

    /// Exact `provider/model` or bare model id first, then a
    /// case-insensitive substring match on model name or id.
    pub fn find(&self, id: &str) -> Option<&ModelData> {
        let id = id.trim();
        if id.is_empty() || id == UNKNOWN || id == format!("{UNKNOWN}/{UNKNOWN}") {
            return None;
        }

        if let Some(model) = self
            .models
            .iter()
            .find(|m| m.qualified_id() == id || m.model_id == id)
        {
            return Some(model);
        }

        let bare = id.rsplit('/').next().unwrap_or(id);
        if let Some(model) = self.models.iter().find(|m| m.model_id == bare) {
            return Some(model);
        }

        let needle = bare.to_lowercase();
        self.models.iter().find(|m| {
            m.name.to_lowercase().contains(&needle) || m.model_id.to_lowercase().contains(&needle)
        })
    }

    pub fn search(&self, query: &ModelQuery) -> Vec<ModelData> {
        let mut results: Vec<ModelData> = self
            .models
            .iter()
            .filter(|m| {
                query.provider.as_ref().is_none_or(|p| {
                    m.provider_id.to_lowercase().contains(&p.to_lowercase())
                })
            })
            .filter(|m| query.reasoning.is_none_or(|r| m.reasoning.unwrap_or(false) == r))
            .filter(|m| query.tool_call.is_none_or(|t| m.tool_call.unwrap_or(false) == t))
            .filter(|m| {
                query
                    .min_context
                    .is_none_or(|min| m.context_limit().is_some_and(|c| c >= min))
            })
            .filter(|m| {
                query.max_input_cost.is_none_or(|max| {
                    m.cost
                        .as_ref()
                        .and_then(|c| c.input)
                        .is_some_and(|input| input <= max)
                })
            })
            .filter(|m| {
                query.text.as_ref().is_none_or(|t| {
                    let t = t.to_lowercase();
                    m.name.to_lowercase().contains(&t) || m.model_id.to_lowercase().contains(&t)
                })
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.provider_id.cmp(&b.provider_id)));
        results
    }
}

/// Filters for [`Catalog::search`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct ModelQuery {
    pub provider: Option<String>,
    pub reasoning: Option<bool>,
    pub tool_call: Option<bool>,
    pub min_context: Option<u64>,
    pub max_input_cost: Option<f64>,
    pub text: Option<String>,
}

/// Where catalog snapshots come from
pub trait CatalogSource: Send + Sync {
    fn fetch(&self) -> Result<Catalog>;
}

pub struct HttpCatalogSource {
    url: String,
    timeout: Duration,
}

impl HttpCatalogSource {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
        }
    }
}

impl CatalogSource for HttpCatalogSource {
    fn fetch(&self) -> Result<Catalog> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        let response = client.get(&self.url).send()?.error_for_status()?;
        let raw: serde_json::Value = response.json()?;
        Catalog::from_json(raw)
    }
}

struct Snapshot {
    catalog: Arc<Catalog>,
    fetched_at: Instant,
}

#[derive(Default)]
struct FetchState {
    snapshot: Option<Snapshot>,
    failed_at: Option<Instant>,
}

impl FetchState {
    fn current(&self) -> Arc<Catalog> {
        self.snapshot
            .as_ref()
            .map(|s| Arc::clone(&s.catalog))
            .unwrap_or_default()
    }
}

/// Process-wide pricing service, constructed once and passed by reference
pub struct ModelCatalog {
    source: Box<dyn CatalogSource>,
    ttl: Duration,
    retry_backoff: Duration,
    state: Mutex<FetchState>,
}

impl ModelCatalog {
    pub fn new(source: Box<dyn CatalogSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            retry_backoff: RETRY_BACKOFF,
            state: Mutex::new(FetchState::default()),
        }
    }

    #[cfg(test)]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn http(url: &str, timeout: Duration, ttl: Duration) -> Self {
        Self::new(Box::new(HttpCatalogSource::new(url, timeout)), ttl)
    }

    /// Current catalog; refetches only when the snapshot is older than the
    /// TTL and the last failed attempt is older than the retry backoff
    pub fn catalog(&self) -> Arc<Catalog> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(snapshot) = state.snapshot.as_ref() {
            if snapshot.fetched_at.elapsed() < self.ttl {
                return Arc::clone(&snapshot.catalog);
            }
        }
        if let Some(failed_at) = state.failed_at {
            if failed_at.elapsed() < self.retry_backoff {
                debug!("pricing fetch backing off");
                return state.current();
            }
        }

        match self.source.fetch() {
            Ok(catalog) => {
                info!(models = catalog.models.len(), "pricing catalog refreshed");
                let catalog = Arc::new(catalog);
                state.snapshot = Some(Snapshot {
                    catalog: Arc::clone(&catalog),
                    fetched_at: Instant::now(),
                });
                state.failed_at = None;
                catalog
            }
            Err(e) => {
                warn!("Failed to fetch models database, using cached or empty data: {}", e);
                state.failed_at = Some(Instant::now());
                state.current()
            }
        }
    }

    pub fn find_model(&self, id: &str) -> Option<ModelData> {
        self.catalog().find(id).cloned()
    }

    pub fn search_models(&self, query: &ModelQuery) -> Vec<ModelData> {
        self.catalog().search(query)
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        let mut providers = self.catalog().providers.clone();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        providers
    }

    /// USD for a token bundle under the given model id; 0 for unknown models
    pub fn model_cost(&self, model_id: &str, tokens: &TokenCounts) -> f64 {
        self.find_model(model_id)
            .map(|m| m.cost_for(tokens))
            .unwrap_or(0.0)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::CacheTokens;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_catalog() {
        let catalog = sample_catalog();
        assert_eq!(catalog.models.len(), 3);
        assert_eq!(catalog.providers.len(), 2);
        let oss = catalog.find("gpt-oss").unwrap();
        assert_eq!(oss.weights, Weights::Open);
        assert!(oss.cost.is_none());
    }

    #[test]
    fn test_find_model_matching_order() {
        let catalog = sample_catalog();
        assert_eq!(catalog.find("anthropic/claude-sonnet-4").unwrap().model_id, "claude-sonnet-4");
        assert_eq!(catalog.find("gpt-4o-mini").unwrap().provider_id, "openai");
        assert_eq!(catalog.find("sonnet").unwrap().model_id, "claude-sonnet-4");
        assert_eq!(catalog.find("openrouter/gpt-4o-mini").unwrap().provider_id, "openai");
        assert!(catalog.find("unknown/unknown").is_none());
        assert!(catalog.find("llama-9000").is_none());
    }

    #[test]
    fn test_search_filters_and_sorting() {
        let catalog = sample_catalog();
        let tools = catalog.search(&ModelQuery {
            tool_call: Some(true),
            ..Default::default()
        });
        let names: Vec<&str> = tools.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Claude Sonnet 4", "GPT-4o mini"]);

        let cheap = catalog.search(&ModelQuery {
            max_input_cost: Some(1.0),
            min_context: Some(100_000),
            ..Default::default()
        });
        assert_eq!(cheap.len(), 1);
        assert_eq!(cheap[0].model_id, "gpt-4o-mini");
    }

    #[test]
    fn test_cost_falls_back_to_input_price() {
        let catalog = sample_catalog();
        let mini = catalog.find("gpt-4o-mini").unwrap();
        let tokens = TokenCounts {
            input: 1_000_000,
            output: 1_000_000,
            reasoning: 1_000_000,
            cache: CacheTokens {
                write: 1_000_000,
                read: 1_000_000,
            },
        };
        // input, reasoning, cache read and cache write all at 0.15
        assert!((mini.cost_for(&tokens) - (0.15 * 4.0 + 0.6)).abs() < 1e-9);
    }

    #[test]
    fn test_single_fetch_per_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = ModelCatalog::new(
            Box::new(CountingSource {
                calls: Arc::clone(&calls),
                fail_after: usize::MAX,
            }),
            DEFAULT_TTL,
        );
        service.catalog();
        service.find_model("sonnet");
        service.search_models(&ModelQuery::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_serves_stale_then_empty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stale = ModelCatalog::new(
            Box::new(CountingSource {
                calls: Arc::clone(&calls),
                fail_after: 1,
            }),
            Duration::ZERO,
        )
        .with_retry_backoff(Duration::ZERO);
        assert_eq!(stale.catalog().models.len(), 3);
        assert_eq!(stale.catalog().models.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let never = ModelCatalog::new(
            Box::new(CountingSource {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_after: 0,
            }),
            DEFAULT_TTL,
        );
        assert!(never.catalog().models.is_empty());
        assert_eq!(never.model_cost("anthropic/claude-sonnet-4", &TokenCounts::default()), 0.0);
    }

    #[test]
    fn test_offline_lookups_fetch_once_per_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let offline = ModelCatalog::new(
            Box::new(CountingSource {
                calls: Arc::clone(&calls),
                fail_after: 0,
            }),
            DEFAULT_TTL,
        );
        for _ in 0..50 {
            assert!(offline.find_model("anthropic/claude-sonnet-4").is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_keeps_stale_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = ModelCatalog::new(
            Box::new(CountingSource {
                calls: Arc::clone(&calls),
                fail_after: 1,
            }),
            Duration::ZERO,
        );
        assert_eq!(service.catalog().models.len(), 3);
        for _ in 0..10 {
            assert_eq!(service.catalog().models.len(), 3);
        }
        // one good fetch, one failure, then backoff
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
