//! Monthly budget tracking
//!
//! Spend is repriced from the model catalog rather than taken from the
//! per-message cost field, so it follows catalog price changes.

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::helpers::{MS_PER_DAY, days_in_month, local_month_bounds, safe_ratio, to_local};
use crate::models::{Millis, SessionData};
use crate::pricing::ModelCatalog;
use crate::session_index::DEFAULT_RANGE_LIMIT;
use crate::session_loader::SessionLoader;

const SPEND_TTL: Duration = Duration::from_secs(5 * 60);
const BURN_WINDOW_DAYS: Millis = 7;
const EARLY_MONTH_DAYS: u32 = 3;
const EARLY_MONTH_FACTOR: f64 = 0.7;
const RUNWAY_ALERT_DAYS: f64 = 7.0;
const PROVIDER_THRESHOLDS: AlertThresholds = AlertThresholds {
    warning: 70.0,
    critical: 90.0,
};

/// Percentages of the limit at which the status escalates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        PROVIDER_THRESHOLDS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderBudget {
    pub name: String,
    pub monthly_limit: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub global_monthly_limit: Option<f64>,
    pub alert_thresholds: AlertThresholds,
    pub providers: BTreeMap<String, ProviderBudget>,
}

impl BudgetConfig {
    pub fn is_configured(&self) -> bool {
        self.global_monthly_limit.is_some() || self.providers.values().any(|p| p.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Healthy,
    Warning,
    Critical,
    Exceeded,
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BudgetStatus::Healthy => "healthy",
            BudgetStatus::Warning => "warning",
            BudgetStatus::Critical => "critical",
            BudgetStatus::Exceeded => "exceeded",
        };
        f.write_str(label)
    }
}

/// Spent versus limit. Reaching the limit exactly counts as exceeded.
pub fn classify(spent: f64, limit: f64, thresholds: &AlertThresholds) -> BudgetStatus {
    if limit <= 0.0 {
        return if spent > 0.0 {
            BudgetStatus::Exceeded
        } else {
            BudgetStatus::Healthy
        };
    }
    let percentage = spent / limit * 100.0;
    if spent >= limit {
        BudgetStatus::Exceeded
    } else if percentage >= thresholds.critical {
        BudgetStatus::Critical
    } else if percentage >= thresholds.warning {
        BudgetStatus::Warning
    } else {
        BudgetStatus::Healthy
    }
}

/// Spend for one calendar month (`month` is 1-based)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonthlySpend {
    pub year: i32,
    pub month: u32,
    pub total: f64,
    pub by_provider: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetHealth {
    pub spent: f64,
    pub limit: f64,
    pub percentage: f64,
    pub remaining: f64,
    pub status: BudgetStatus,
    /// Days until the limit at the recent daily burn, if there is one
    pub days_remaining: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderBudgetStatus {
    pub provider: String,
    pub name: String,
    pub spent: f64,
    pub limit: f64,
    pub percentage: f64,
    pub status: BudgetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub level: AlertLevel,
    pub message: String,
    pub provider: Option<String>,
}

/// Month-end estimate from the spend so far
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub year: i32,
    pub month: u32,
    pub spent: f64,
    pub active_days: usize,
    pub day_of_month: u32,
    pub days_in_month: u32,
    pub daily_average: f64,
    pub projected_total: f64,
    /// Early-month discount applied
    pub adjusted: bool,
    pub limit: Option<f64>,
    pub projected_status: Option<BudgetStatus>,
}

/// Extrapolate `spent` over a full month. In the first three days the
/// observed average is discounted by 30% before extrapolating.
pub fn project_month_end(
    spent: f64,
    active_days: usize,
    day_of_month: u32,
    days_in_month: u32,
) -> (f64, f64, bool) {
    let observed = safe_ratio(spent, active_days as f64);
    let adjusted = day_of_month <= EARLY_MONTH_DAYS;
    let daily = if adjusted {
        observed * EARLY_MONTH_FACTOR
    } else {
        observed
    };
    (daily, daily * days_in_month as f64, adjusted)
}

/// Provider family from a model id such as `anthropic/claude-sonnet-4`
pub fn extract_provider(model_id: &str) -> &'static str {
    let id = model_id.to_lowercase();
    if id.contains("claude") || id.contains("anthropic") {
        "anthropic"
    } else if id.contains("gpt") || id.contains("openai") {
        "openai"
    } else if id.contains("openrouter") || id.starts_with("or/") {
        "openrouter"
    } else if id.contains("gemini") || id.contains("google") {
        "google"
    } else if id.contains("azure") {
        "azure"
    } else if id.contains("bedrock") || id.contains("aws") {
        "aws"
    } else if id.contains("cohere") {
        "cohere"
    } else if id.contains("mistral") {
        "mistral"
    } else {
        "other"
    }
}

/// Where the tracker gets sessions from
pub trait SessionSource {
    /// Sessions with activity between `start` and `end`, both inclusive
    fn sessions_in_range(&self, start: Millis, end: Millis) -> Vec<SessionData>;
}

impl SessionSource for SessionLoader {
    fn sessions_in_range(&self, start: Millis, end: Millis) -> Vec<SessionData> {
        self.index()
            .sessions_by_date_range(start, end, DEFAULT_RANGE_LIMIT)
            .iter()
            .filter_map(|entry| self.read_session(&entry.id))
            .collect()
    }
}

impl SessionSource for Vec<SessionData> {
    fn sessions_in_range(&self, start: Millis, end: Millis) -> Vec<SessionData> {
        self.iter()
            .filter(|s| {
                s.messages
                    .iter()
                    .any(|m| m.created >= start && m.created <= end)
            })
            .cloned()
            .collect()
    }
}

struct CachedSpend {
    year: i32,
    month: u32,
    at: Instant,
    spend: MonthlySpend,
}

struct CachedBurn {
    computed_for: Millis,
    at: Instant,
    burn: f64,
}

pub struct BudgetTracker {
    source: Arc<dyn SessionSource>,
    catalog: Arc<ModelCatalog>,
    config: BudgetConfig,
    cached: Mutex<Option<CachedSpend>>,
    burn: Mutex<Option<CachedBurn>>,
}

impl BudgetTracker {
    pub fn new(
        source: Arc<dyn SessionSource>,
        catalog: Arc<ModelCatalog>,
        config: BudgetConfig,
    ) -> Self {
        Self {
            source,
            catalog,
            config,
            cached: Mutex::new(None),
            burn: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Assistant spend inside the month, repriced from the catalog and
    /// grouped by provider family. Cached for a few minutes.
    pub fn monthly_spend(&self, year: i32, month: u32) -> MonthlySpend {
        if let Ok(guard) = self.cached.lock() {
            if let Some(hit) = guard.as_ref() {
                if hit.year == year && hit.month == month && hit.at.elapsed() < SPEND_TTL {
                    return hit.spend.clone();
                }
            }
        }

        let spend = self.compute_spend(year, month);
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(CachedSpend {
                year,
                month,
                at: Instant::now(),
                spend: spend.clone(),
            });
        }
        spend
    }

    fn compute_spend(&self, year: i32, month: u32) -> MonthlySpend {
        let (start, end) = local_month_bounds(year, month);
        let mut spend = MonthlySpend {
            year,
            month,
            ..Default::default()
        };

        for session in self.source.sessions_in_range(start, end - 1) {
            if session.model.is_unknown() {
                continue;
            }
            let model_id = session.model.qualified();
            let Some(model) = self.catalog.find_model(&model_id) else {
                continue;
            };
            let provider = extract_provider(&model_id);
            for message in session
                .messages
                .iter()
                .filter(|m| m.is_assistant() && m.created >= start && m.created < end)
            {
                let cost = model.cost_for(&message.tokens);
                if cost > 0.0 {
                    spend.total += cost;
                    *spend.by_provider.entry(provider.to_string()).or_insert(0.0) += cost;
                }
            }
        }
        debug!(year, month, total = spend.total, "monthly spend computed");
        spend
    }

    /// Distinct local days in the month with at least one assistant message
    pub fn active_days_in_month(&self, year: i32, month: u32) -> usize {
        let (start, end) = local_month_bounds(year, month);
        let mut days = BTreeSet::new();
        for session in self.source.sessions_in_range(start, end - 1) {
            for message in &session.messages {
                if message.is_assistant() && message.created >= start && message.created < end {
                    days.insert(to_local(message.created).day());
                }
            }
        }
        days.len()
    }

    /// Average daily cost over the last week, counting only days with
    /// sessions. Cached like the monthly spend.
    fn recent_daily_burn(&self, now: Millis) -> f64 {
        let ttl_ms = SPEND_TTL.as_millis() as Millis;
        if let Ok(guard) = self.burn.lock() {
            if let Some(hit) = guard.as_ref() {
                if hit.at.elapsed() < SPEND_TTL && (now - hit.computed_for).abs() < ttl_ms {
                    return hit.burn;
                }
            }
        }

        let burn = self.compute_daily_burn(now);
        if let Ok(mut guard) = self.burn.lock() {
            *guard = Some(CachedBurn {
                computed_for: now,
                at: Instant::now(),
                burn,
            });
        }
        burn
    }

    fn compute_daily_burn(&self, now: Millis) -> f64 {
        let cutoff = now - BURN_WINDOW_DAYS * MS_PER_DAY;
        let mut cost = 0.0;
        let mut days = BTreeSet::new();
        for session in self.source.sessions_in_range(cutoff, now) {
            if session.time.created >= cutoff {
                cost += session.cost_usd;
                days.insert(to_local(session.time.created).date_naive());
            }
        }
        safe_ratio(cost, days.len() as f64)
    }

    /// `None` when no global limit is configured
    pub fn budget_health_at(&self, now: Millis) -> Option<BudgetHealth> {
        let limit = self.config.global_monthly_limit?;
        let today = to_local(now);
        let spent = self.monthly_spend(today.year(), today.month()).total;
        let remaining = limit - spent;

        let days_remaining = if remaining <= 0.0 {
            Some(0.0)
        } else {
            let burn = self.recent_daily_burn(now);
            (burn > 0.0).then(|| remaining / burn)
        };

        Some(BudgetHealth {
            spent,
            limit,
            percentage: safe_ratio(spent, limit) * 100.0,
            remaining,
            status: classify(spent, limit, &self.config.alert_thresholds),
            days_remaining,
        })
    }

    pub fn provider_statuses(&self, spend: &MonthlySpend) -> Vec<ProviderBudgetStatus> {
        self.config
            .providers
            .iter()
            .filter(|(_, budget)| budget.enabled)
            .map(|(id, budget)| {
                let spent = spend.by_provider.get(id).copied().unwrap_or(0.0);
                ProviderBudgetStatus {
                    provider: id.clone(),
                    name: budget.name.clone(),
                    spent,
                    limit: budget.monthly_limit,
                    percentage: safe_ratio(spent, budget.monthly_limit) * 100.0,
                    status: classify(spent, budget.monthly_limit, &PROVIDER_THRESHOLDS),
                }
            })
            .collect()
    }

    pub fn alerts_at(&self, now: Millis) -> Vec<BudgetAlert> {
        self.alerts_with(self.budget_health_at(now).as_ref(), now)
    }

    /// Alerts for a health snapshot the caller already computed
    pub fn alerts_with(&self, health: Option<&BudgetHealth>, now: Millis) -> Vec<BudgetAlert> {
        if !self.config.is_configured() {
            return vec![BudgetAlert {
                level: AlertLevel::Info,
                message: "No budget limits configured".to_string(),
                provider: None,
            }];
        }

        let mut alerts = Vec::new();
        if let Some(health) = health {
            if let Some(alert) = status_alert(
                health.status,
                health.spent,
                health.limit,
                health.percentage,
                None,
            ) {
                alerts.push(alert);
            }
            if let Some(days) = health.days_remaining {
                if days > 0.0 && days < RUNWAY_ALERT_DAYS {
                    alerts.push(BudgetAlert {
                        level: AlertLevel::Warning,
                        message: format!(
                            "Budget will run out in {:.1} days at the current pace",
                            days
                        ),
                        provider: None,
                    });
                }
            }
        }

        let today = to_local(now);
        let spend = self.monthly_spend(today.year(), today.month());
        for status in self.provider_statuses(&spend) {
            if let Some(alert) = status_alert(
                status.status,
                status.spent,
                status.limit,
                status.percentage,
                Some(&status.name),
            ) {
                alerts.push(BudgetAlert {
                    provider: Some(status.provider.clone()),
                    ..alert
                });
            }
        }
        alerts
    }

    /// Spend for the current month and the `months - 1` before it, newest first
    pub fn history_at(&self, months: u32, now: Millis) -> Vec<MonthlySpend> {
        let today = to_local(now);
        let (mut year, mut month) = (today.year(), today.month());
        let mut out = Vec::with_capacity(months as usize);
        for _ in 0..months {
            out.push(self.monthly_spend(year, month));
            if month == 1 {
                year -= 1;
                month = 12;
            } else {
                month -= 1;
            }
        }
        out
    }

    pub fn forecast_at(&self, now: Millis) -> Forecast {
        let today = to_local(now);
        let (year, month) = (today.year(), today.month());
        let spent = self.monthly_spend(year, month).total;
        let active_days = self.active_days_in_month(year, month);
        let total_days = days_in_month(year, month);
        let (daily_average, projected_total, adjusted) =
            project_month_end(spent, active_days, today.day(), total_days);
        let limit = self.config.global_monthly_limit;

        Forecast {
            year,
            month,
            spent,
            active_days,
            day_of_month: today.day(),
            days_in_month: total_days,
            daily_average,
            projected_total,
            adjusted,
            limit,
            projected_status: limit
                .map(|l| classify(projected_total, l, &self.config.alert_thresholds)),
        }
    }
}

fn status_alert(
    status: BudgetStatus,
    spent: f64,
    limit: f64,
    percentage: f64,
    provider: Option<&str>,
) -> Option<BudgetAlert> {
    let scope = provider
        .map(|p| format!("{} budget", p))
        .unwrap_or_else(|| "Monthly budget".to_string());
    let (level, message) = match status {
        BudgetStatus::Healthy => return None,
        BudgetStatus::Exceeded => (
            AlertLevel::Critical,
            format!("{} exceeded: ${:.2} of ${:.2}", scope, spent, limit),
        ),
        BudgetStatus::Critical => (
            AlertLevel::Critical,
            format!("{} at {:.0}% (${:.2} of ${:.2})", scope, percentage, spent, limit),
        ),
        BudgetStatus::Warning => (
            AlertLevel::Warning,
            format!("{} at {:.0}% (${:.2} of ${:.2})", scope, percentage, spent, limit),
        ),
    };
    Some(BudgetAlert {
        level,
        message,
        provider: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{assistant, session, tokens, user};
    use crate::pricing::testing::sample_service;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MILLION: u64 = 1_000_000;

    /// Counts how often the tracker goes back to disk
    struct CountingSessions {
        sessions: Vec<SessionData>,
        scans: AtomicUsize,
    }

    impl SessionSource for CountingSessions {
        fn sessions_in_range(&self, start: Millis, end: Millis) -> Vec<SessionData> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.sessions.sessions_in_range(start, end)
        }
    }

    fn tracker(sessions: Vec<SessionData>, config: BudgetConfig) -> BudgetTracker {
        BudgetTracker::new(Arc::new(sessions), Arc::new(sample_service()), config)
    }

    fn with_limit(limit: f64) -> BudgetConfig {
        BudgetConfig {
            global_monthly_limit: Some(limit),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_transition() {
        let thresholds = AlertThresholds::default();
        assert_eq!(classify(50.0, 100.0, &thresholds), BudgetStatus::Healthy);
        assert_eq!(classify(70.0, 100.0, &thresholds), BudgetStatus::Warning);
        assert_eq!(classify(95.0, 100.0, &thresholds), BudgetStatus::Critical);
        assert_eq!(classify(100.0, 100.0, &thresholds), BudgetStatus::Exceeded);
        assert_eq!(BudgetStatus::Critical.to_string(), "critical");
    }

    #[test]
    fn test_projection_discounts_first_days() {
        let (daily, total, adjusted) = project_month_end(10.0, 2, 2, 30);
        assert!(adjusted);
        assert!((daily - 3.5).abs() < 1e-9);
        assert!((total - 105.0).abs() < 1e-9);

        let (daily, total, adjusted) = project_month_end(10.0, 2, 4, 30);
        assert!(!adjusted);
        assert!((daily - 5.0).abs() < 1e-9);
        assert!((total - 150.0).abs() < 1e-9);

        assert_eq!(project_month_end(0.0, 0, 10, 31), (0.0, 0.0, false));
    }

    #[test]
    fn test_extract_provider() {
        assert_eq!(extract_provider("anthropic/claude-sonnet-4"), "anthropic");
        assert_eq!(extract_provider("openai/gpt-4o-mini"), "openai");
        assert_eq!(extract_provider("or/llama"), "openrouter");
        assert_eq!(extract_provider("google/gemini-2.5-pro"), "google");
        assert_eq!(extract_provider("amazon-bedrock/nova"), "aws");
        assert_eq!(extract_provider("local/qwen"), "other");
    }

    #[test]
    fn test_monthly_spend_prices_assistant_messages_in_month() {
        let (start, end) = local_month_bounds(2026, 3);
        let sessions = vec![
            session(
                "ses_a",
                start + MS_PER_DAY,
                vec![
                    user(start + MS_PER_DAY),
                    // 1M input tokens at $3 per million
                    assistant(start + MS_PER_DAY, "anthropic", "claude-sonnet-4", tokens(MILLION, 0, 0, 0, 0), 99.0),
                    // next month, ignored
                    assistant(end + 1, "anthropic", "claude-sonnet-4", tokens(MILLION, 0, 0, 0, 0), 0.0),
                ],
            ),
            session(
                "ses_b",
                start + 2 * MS_PER_DAY,
                vec![assistant(start + 2 * MS_PER_DAY, "openai", "gpt-4o-mini", tokens(0, MILLION, 0, 0, 0), 0.0)],
            ),
        ];
        let tracker = tracker(sessions, BudgetConfig::default());
        let spend = tracker.monthly_spend(2026, 3);
        assert!((spend.total - 3.6).abs() < 1e-9);
        assert!((spend.by_provider["anthropic"] - 3.0).abs() < 1e-9);
        assert!((spend.by_provider["openai"] - 0.6).abs() < 1e-9);
        assert_eq!(tracker.active_days_in_month(2026, 3), 2);
        assert!((tracker.monthly_spend(2026, 4).total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_and_alerts() {
        let (start, _) = local_month_bounds(2026, 3);
        let now = start + 10 * MS_PER_DAY;
        let sessions = vec![session(
            "ses_a",
            now - MS_PER_DAY,
            vec![assistant(now - MS_PER_DAY, "anthropic", "claude-sonnet-4", tokens(MILLION, 0, 0, 0, 0), 3.0)],
        )];
        let tracker = tracker(sessions, with_limit(3.2));
        let health = tracker.budget_health_at(now).unwrap();
        assert_eq!(health.status, BudgetStatus::Critical);
        assert!((health.remaining - 0.2).abs() < 1e-9);
        // $3/day over one active day leaves well under a day of runway
        let days = health.days_remaining.unwrap();
        assert!(days > 0.0 && days < 1.0);

        let alerts = tracker.alerts_at(now);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[1].level, AlertLevel::Warning);
    }

    #[test]
    fn test_provider_statuses_use_fixed_thresholds() {
        let mut config = BudgetConfig {
            alert_thresholds: AlertThresholds {
                warning: 10.0,
                critical: 20.0,
            },
            ..Default::default()
        };
        config.providers.insert(
            "anthropic".into(),
            ProviderBudget {
                name: "Anthropic".into(),
                monthly_limit: 4.0,
                enabled: true,
            },
        );
        config.providers.insert(
            "openai".into(),
            ProviderBudget {
                name: "OpenAI".into(),
                monthly_limit: 1.0,
                enabled: false,
            },
        );
        let tracker = tracker(Vec::new(), config);
        let spend = MonthlySpend {
            year: 2026,
            month: 3,
            total: 3.0,
            by_provider: BTreeMap::from([("anthropic".to_string(), 3.0)]),
        };
        let statuses = tracker.provider_statuses(&spend);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, BudgetStatus::Warning);
        assert!((statuses[0].percentage - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_unconfigured_budget() {
        let tracker = tracker(Vec::new(), BudgetConfig::default());
        assert!(tracker.budget_health_at(0).is_none());
        let alerts = tracker.alerts_at(0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Info);
    }

    #[test]
    fn test_forecast_and_history() {
        let (start, _) = local_month_bounds(2026, 4);
        let now = start + 9 * MS_PER_DAY + 12 * 60 * 60 * 1000;
        let sessions = vec![session(
            "ses_a",
            start + MS_PER_DAY,
            vec![assistant(start + MS_PER_DAY, "anthropic", "claude-sonnet-4", tokens(MILLION, 0, 0, 0, 0), 0.0)],
        )];
        let tracker = tracker(sessions, with_limit(50.0));
        let forecast = tracker.forecast_at(now);
        assert_eq!(forecast.month, 4);
        assert_eq!(forecast.day_of_month, 10);
        assert_eq!(forecast.active_days, 1);
        assert!(!forecast.adjusted);
        assert!((forecast.projected_total - 90.0).abs() < 1e-9);
        assert_eq!(forecast.projected_status, Some(BudgetStatus::Exceeded));

        let history = tracker.history_at(3, now);
        let months: Vec<(i32, u32)> = history.iter().map(|h| (h.year, h.month)).collect();
        assert_eq!(months, vec![(2026, 4), (2026, 3), (2026, 2)]);
        assert!((history[0].total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_live_ticks_reuse_cached_spend_and_burn() {
        let (start, _) = local_month_bounds(2026, 3);
        let now = start + 10 * MS_PER_DAY;
        let source = Arc::new(CountingSessions {
            sessions: vec![session(
                "ses_a",
                now - MS_PER_DAY,
                vec![assistant(now - MS_PER_DAY, "anthropic", "claude-sonnet-4", tokens(MILLION, 0, 0, 0, 0), 3.0)],
            )],
            scans: AtomicUsize::new(0),
        });
        let tracker = BudgetTracker::new(source.clone(), Arc::new(sample_service()), with_limit(100.0));

        for tick in 0..10 {
            let at = now + tick * 5_000;
            let health = tracker.budget_health_at(at);
            assert!(health.as_ref().unwrap().days_remaining.is_some());
            tracker.alerts_with(health.as_ref(), at);
        }
        // one month scan and one burn scan
        assert_eq!(source.scans.load(Ordering::SeqCst), 2);

        // a clock far from the cached one recomputes the burn
        tracker.budget_health_at(now + MS_PER_DAY);
        assert_eq!(source.scans.load(Ordering::SeqCst), 3);
    }
}
