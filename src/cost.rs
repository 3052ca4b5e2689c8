use serde::Serialize;
use std::collections::HashSet;
use std::sync::{LazyLock, Mutex};
use tracing::warn;

use crate::models::TokenCounts;
use crate::pricing::ModelCatalog;

const PER_MILLION: f64 = 1_000_000.0;

static WARNED_MODELS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub reasoning: f64,
    pub cache_write: f64,
    pub cache_read: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub fn is_finite(&self) -> bool {
        [
            self.input,
            self.output,
            self.reasoning,
            self.cache_write,
            self.cache_read,
            self.total,
        ]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub tokens: TokenCounts,
    pub cost: CostBreakdown,
    pub model_id: String,
    pub cache_hit_rate: f64,
    pub efficiency_score: f64,
}

fn warn_unknown_model(model_id: &str) {
    let first = match WARNED_MODELS.lock() {
        Ok(mut seen) => seen.insert(model_id.to_string()),
        Err(_) => true,
    };
    if first {
        warn!("Unknown model '{}' or no cost data, using zero cost", model_id);
    }
}

/// Price a token bundle. Never fails: unknown models cost zero.
pub fn calculate_cost(catalog: &ModelCatalog, tokens: &TokenCounts, model_id: &str) -> CostBreakdown {
    let Some(prices) = catalog
        .find_model(model_id)
        .and_then(|m| m.cost)
        .map(|c| c.resolve())
    else {
        warn_unknown_model(model_id);
        return CostBreakdown::default();
    };

    let input = tokens.input as f64 / PER_MILLION * prices.input;
    let output = tokens.output as f64 / PER_MILLION * prices.output;
    let reasoning = tokens.reasoning as f64 / PER_MILLION * prices.reasoning;
    let cache_write = tokens.cache.write as f64 / PER_MILLION * prices.cache_write;
    let cache_read = tokens.cache.read as f64 / PER_MILLION * prices.cache_read;

    let breakdown = CostBreakdown {
        input,
        output,
        reasoning,
        cache_write,
        cache_read,
        total: input + output + reasoning + cache_write + cache_read,
    };

    if breakdown.is_finite() {
        breakdown
    } else {
        CostBreakdown::default()
    }
}

/// read / (read + write), 0 without cache activity
pub fn cache_hit_rate(tokens: &TokenCounts) -> f64 {
    let total = tokens.cache.read.saturating_add(tokens.cache.write);
    if total == 0 {
        return 0.0;
    }
    let rate = tokens.cache.read as f64 / total as f64;
    if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 }
}

/// Cache-read volume per dollar, scaled by 0.1
pub fn efficiency_score(tokens: &TokenCounts, cost: &CostBreakdown) -> f64 {
    if cost.total > 0.0 && cost.total.is_finite() && tokens.cache.read > 0 {
        let score = tokens.cache.read as f64 * 0.1 / cost.total;
        if score.is_finite() { score } else { 0.0 }
    } else {
        0.0
    }
}

pub fn calculate_session_metrics(
    catalog: &ModelCatalog,
    tokens: &TokenCounts,
    model_id: &str,
) -> SessionMetrics {
    let cost = calculate_cost(catalog, tokens, model_id);
    let model_id = catalog
        .find_model(model_id)
        .map(|m| m.qualified_id())
        .unwrap_or_else(|| model_id.to_string());

    SessionMetrics {
        tokens: *tokens,
        cache_hit_rate: cache_hit_rate(tokens),
        efficiency_score: efficiency_score(tokens, &cost),
        cost,
        model_id,
    }
}

pub fn format_cost(cost: f64) -> String {
    if !cost.is_finite() || cost < 0.0001 {
        return "$0.0000".to_string();
    }
    format!("${:.4}", cost)
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens < 1_000 {
        tokens.to_string()
    } else if tokens < 1_000_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::tokens;
    use crate::pricing::testing::sample_service;

    #[test]
    fn test_unknown_model_is_all_zero() {
        let catalog = sample_service();
        let cost = calculate_cost(&catalog, &tokens(5_000, 1_000, 10, 20, 30), "mystery/model-x");
        assert_eq!(cost, CostBreakdown::default());
        assert_eq!(cost.total, 0.0);
    }

    #[test]
    fn test_per_category_pricing() {
        let catalog = sample_service();
        let cost = calculate_cost(
            &catalog,
            &tokens(1_000_000, 100_000, 0, 1_000_000, 2_000_000),
            "anthropic/claude-sonnet-4",
        );
        assert!((cost.input - 3.0).abs() < 1e-9);
        assert!((cost.output - 1.5).abs() < 1e-9);
        assert!((cost.cache_write - 3.75).abs() < 1e-9);
        assert!((cost.cache_read - 0.6).abs() < 1e-9);
        assert!((cost.total - 8.85).abs() < 1e-9);
        assert!(cost.is_finite());
    }

    #[test]
    fn test_reasoning_uses_input_price() {
        let catalog = sample_service();
        let cost = calculate_cost(&catalog, &tokens(0, 0, 1_000_000, 0, 0), "claude-sonnet-4");
        assert!((cost.reasoning - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_hit_rate_bounds() {
        assert_eq!(cache_hit_rate(&tokens(100, 100, 0, 0, 0)), 0.0);
        assert_eq!(cache_hit_rate(&tokens(0, 0, 0, 0, 50)), 1.0);
        let rate = cache_hit_rate(&tokens(0, 0, 0, 25, 75));
        assert!((rate - 0.75).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&cache_hit_rate(&tokens(0, 0, 0, u64::MAX / 4, 1))));
    }

    #[test]
    fn test_session_metrics() {
        let catalog = sample_service();
        let metrics = calculate_session_metrics(&catalog, &tokens(1_000, 500, 0, 200, 800), "sonnet");
        assert_eq!(metrics.model_id, "anthropic/claude-sonnet-4");
        assert!((metrics.cache_hit_rate - 0.8).abs() < 1e-12);
        assert!(metrics.efficiency_score > 0.0);

        let unknown = calculate_session_metrics(&catalog, &tokens(1_000, 0, 0, 0, 800), "nope/nope");
        assert_eq!(unknown.model_id, "nope/nope");
        assert_eq!(unknown.efficiency_score, 0.0);
        assert_eq!(unknown.cost.total, 0.0);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_cost(0.00001), "$0.0000");
        assert_eq!(format_cost(f64::NAN), "$0.0000");
        assert_eq!(format_cost(1.23456), "$1.2346");
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(2_340_000), "2.3M");
    }
}
