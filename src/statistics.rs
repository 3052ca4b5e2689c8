//! Session filtering and cross-session statistics

use chrono::{Datelike, Timelike};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use crate::helpers::{MS_PER_DAY, compare_floats, now_millis, safe_ratio, to_local, to_utc};
use crate::models::{Millis, SessionData};

pub const GENERAL_PROJECT: &str = "general";
const TOP_TOOLS: usize = 10;
const PROJECT_TOP_TOOLS: usize = 5;
const PEAKS: usize = 3;

/// Independent predicates, combined with AND
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOptions {
    pub days: Option<u32>,
    pub start: Option<Millis>,
    pub end: Option<Millis>,
    pub provider: Option<String>,
    pub project: Option<String>,
    pub exclude_project: Option<String>,
}

impl FilterOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn matches(&self, session: &SessionData, now: Millis) -> bool {
        let created = session.time.created;
        if let Some(days) = self.days {
            if created < now - days as Millis * MS_PER_DAY {
                return false;
            }
        }
        if self.start.is_some_and(|start| created < start) {
            return false;
        }
        if self.end.is_some_and(|end| created > end) {
            return false;
        }
        if let Some(provider) = &self.provider {
            if !session.model.provider.eq_ignore_ascii_case(provider) {
                return false;
            }
        }
        let title = session.title.to_lowercase();
        if let Some(project) = &self.project {
            if !title.contains(&project.to_lowercase()) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_project {
            if title.contains(&excluded.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

pub fn filter_sessions(sessions: &[SessionData], options: &FilterOptions) -> Vec<SessionData> {
    filter_sessions_at(sessions, options, now_millis())
}

pub fn filter_sessions_at(
    sessions: &[SessionData],
    options: &FilterOptions,
    now: Millis,
) -> Vec<SessionData> {
    sessions
        .iter()
        .filter(|s| options.matches(s, now))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub sessions: usize,
    pub cost_cents: i64,
    pub cost_usd: f64,
    pub tokens: u64,
}

impl UsageTotals {
    fn add(&mut self, session: &SessionData) {
        self.sessions += 1;
        self.cost_cents += session.cost_cents;
        self.cost_usd += session.cost_usd;
        self.tokens = self.tokens.saturating_add(session.tokens_used);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeakHour {
    pub hour: u32,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeakDay {
    pub day: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimePatterns {
    /// Local hour of session start → sessions
    pub hourly: BTreeMap<u32, usize>,
    /// Local weekday name → sessions
    pub weekday: BTreeMap<String, usize>,
    /// ISO week (`2024-W07`) → sessions
    pub weekly: BTreeMap<String, usize>,
    pub peak_hours: Vec<PeakHour>,
    pub peak_days: Vec<PeakDay>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpensiveSession {
    pub id: String,
    pub title: String,
    pub cost_usd: f64,
    pub tokens: u64,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostOptimization {
    pub expensive_sessions: Vec<ExpensiveSession>,
    pub suggestions: Vec<String>,
    pub average_cost_per_session: f64,
    pub average_tokens_per_session: f64,
    pub most_expensive_provider: Option<String>,
    pub most_expensive_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStats {
    pub name: String,
    pub session_count: usize,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub average_session_cost: f64,
    pub top_tools: Vec<ToolCount>,
    pub preferred_providers: BTreeMap<String, usize>,
    pub preferred_models: BTreeMap<String, usize>,
}

impl ProjectStats {
    fn tool_total(&self) -> usize {
        self.top_tools.iter().map(|t| t.count).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectComparison {
    pub most_active: Option<String>,
    pub most_expensive: Option<String>,
    pub most_tool_intensive: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub total_sessions: usize,
    pub total_messages: usize,
    pub total_tools: usize,
    pub total_cost_cents: i64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub providers: BTreeMap<String, UsageTotals>,
    /// Keyed `provider/model`
    pub models: BTreeMap<String, UsageTotals>,
    /// Keyed by UTC date `YYYY-MM-DD`
    pub daily: BTreeMap<String, UsageTotals>,
    pub tool_usage: BTreeMap<String, usize>,
    pub top_tools: Vec<ToolCount>,
    pub time: TimePatterns,
    pub optimization: CostOptimization,
    pub projects: Vec<ProjectStats>,
    pub comparison: ProjectComparison,
}

pub fn calculate_statistics(sessions: &[SessionData]) -> Statistics {
    let mut stats = Statistics {
        total_sessions: sessions.len(),
        ..Statistics::default()
    };

    for session in sessions {
        stats.total_messages += session.message_count;
        stats.total_cost_cents += session.cost_cents;
        stats.total_cost_usd += session.cost_usd;
        stats.total_tokens = stats.total_tokens.saturating_add(session.tokens_used);

        stats
            .providers
            .entry(session.model.provider.clone())
            .or_default()
            .add(session);
        stats
            .models
            .entry(session.model.qualified())
            .or_default()
            .add(session);

        stats.total_tools += session.tool_count();
        for tool in session.messages.iter().flat_map(|m| &m.tools) {
            *stats.tool_usage.entry(tool.name.clone()).or_default() += 1;
        }

        let utc = to_utc(session.time.created);
        stats
            .daily
            .entry(utc.format("%Y-%m-%d").to_string())
            .or_default()
            .add(session);

        let local = to_local(session.time.created);
        *stats.time.hourly.entry(local.hour()).or_default() += 1;
        *stats
            .time
            .weekday
            .entry(local.format("%A").to_string())
            .or_default() += 1;
        let week = local.iso_week();
        *stats
            .time
            .weekly
            .entry(format!("{}-W{:02}", week.year(), week.week()))
            .or_default() += 1;
    }

    stats.top_tools = top_tools(&stats.tool_usage, TOP_TOOLS);
    stats.time.peak_hours = peaks(&stats.time.hourly, PEAKS)
        .into_iter()
        .map(|(hour, count)| PeakHour { hour, count })
        .collect();
    stats.time.peak_days = peaks(&stats.time.weekday, PEAKS)
        .into_iter()
        .map(|(day, count)| PeakDay { day, count })
        .collect();

    stats.optimization = cost_optimization(&stats, sessions);
    stats.projects = project_stats(sessions);
    stats.comparison = compare_projects(&stats.projects);
    stats
}

/// Highest counts first; ties keep key order
fn peaks<K: Clone + Ord>(counts: &BTreeMap<K, usize>, limit: usize) -> Vec<(K, usize)> {
    let mut entries: Vec<(K, usize)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.truncate(limit);
    entries
}

pub fn top_tools(usage: &BTreeMap<String, usize>, limit: usize) -> Vec<ToolCount> {
    peaks(usage, limit)
        .into_iter()
        .map(|(name, count)| ToolCount { name, count })
        .collect()
}

/// Key with the strictly largest positive cost; the first such key wins ties
fn most_expensive(totals: &BTreeMap<String, UsageTotals>) -> Option<String> {
    let mut best: Option<(&String, f64)> = None;
    for (key, total) in totals {
        if total.cost_usd > best.map(|(_, c)| c).unwrap_or(0.0) {
            best = Some((key, total.cost_usd));
        }
    }
    best.map(|(k, _)| k.clone())
}

fn cost_optimization(stats: &Statistics, sessions: &[SessionData]) -> CostOptimization {
    let count = sessions.len() as f64;
    let average_cost = safe_ratio(stats.total_cost_usd, count);
    let average_tokens = safe_ratio(stats.total_tokens as f64, count);

    let mut costly: Vec<&SessionData> = sessions.iter().filter(|s| s.cost_usd > 0.0).collect();
    costly.sort_by(|a, b| compare_floats(b.cost_usd, a.cost_usd).then_with(|| a.id.cmp(&b.id)));
    let take = ((costly.len() as f64 * 0.1).floor() as usize).max(1);
    let expensive_sessions = costly
        .into_iter()
        .take(take)
        .map(|s| ExpensiveSession {
            id: s.id.clone(),
            title: s.title.clone(),
            cost_usd: s.cost_usd,
            tokens: s.tokens_used,
            provider: s.model.provider.clone(),
            model: s.model.model.clone(),
        })
        .collect();

    let mut suggestions = Vec::new();
    if average_cost > 1.0 {
        suggestions.push("Consider using more cost-effective models for routine tasks".to_string());
    }
    if stats.total_tokens > 1_000_000 {
        suggestions
            .push("Implement token optimization strategies like prompt compression".to_string());
    }
    let high_cost = sessions
        .iter()
        .filter(|s| s.cost_usd > average_cost * 2.0)
        .count();
    if high_cost as f64 > count * 0.2 {
        suggestions.push(
            "Review sessions with unusually high costs for optimization opportunities".to_string(),
        );
    }
    if stats.providers.len() > 1 {
        suggestions.push("Consider consolidating to the most cost-effective provider".to_string());
    }

    CostOptimization {
        expensive_sessions,
        suggestions,
        average_cost_per_session: average_cost,
        average_tokens_per_session: average_tokens,
        most_expensive_provider: most_expensive(&stats.providers),
        most_expensive_model: most_expensive(&stats.models),
    }
}

static PROJECT_FAMILIES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b(?:react|next|vue|angular)\b",
        r"\b(?:node|express|nest|fastify)\b",
        r"\b(?:python|django|flask|fastapi)\b",
        r"\b(?:rust|go|java|kotlin)\b",
        r"\b(?:typescript|javascript|coffeescript)\b",
        r"\b(?:mongodb|postgres|mysql|sqlite)\b",
        r"\b(?:aws|azure|gcp|firebase)\b",
        r"\b(?:docker|kubernetes|terraform)\b",
        r"\b(?:mobile|ios|android|flutter)\b",
        r"\b(?:machine|learning|ml|ai|data)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static PATH_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[/\\]([a-z0-9_-]+)[/\\]").expect("valid regex"));

/// Manifest or tool mentions and the bucket they imply
const PROJECT_MARKERS: &[(&[&str], &str)] = &[
    (&["package.json", "npm", "yarn"], "nodejs-project"),
    (&["cargo.toml", "rust"], "rust-project"),
    (&["pom.xml", "maven", "gradle"], "java-project"),
    (&["requirements.txt", "pip", "python"], "python-project"),
    (&["go.mod", "golang"], "go-project"),
];

/// Heuristic bucket for a session from its title and message text
pub fn detect_project(session: &SessionData) -> String {
    let mut text = session.title.to_lowercase();
    for message in &session.messages {
        if !message.text.is_empty() {
            text.push(' ');
            text.push_str(&message.text.to_lowercase());
        }
    }

    for family in PROJECT_FAMILIES.iter() {
        if let Some(m) = family.find(&text) {
            return m.as_str().to_string();
        }
    }

    if let Some(segment) = PATH_SEGMENT
        .captures_iter(&text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|s| s.len() > 2 && s.len() < 30)
    {
        return segment.to_string();
    }

    for (needles, bucket) in PROJECT_MARKERS {
        if needles.iter().any(|n| text.contains(n)) {
            return bucket.to_string();
        }
    }

    GENERAL_PROJECT.to_string()
}

fn project_stats(sessions: &[SessionData]) -> Vec<ProjectStats> {
    let mut groups: HashMap<String, Vec<&SessionData>> = HashMap::new();
    for session in sessions {
        groups.entry(detect_project(session)).or_default().push(session);
    }

    let mut projects: Vec<ProjectStats> = groups
        .into_iter()
        .map(|(name, members)| {
            let mut tools: BTreeMap<String, usize> = BTreeMap::new();
            let mut providers: BTreeMap<String, usize> = BTreeMap::new();
            let mut models: BTreeMap<String, usize> = BTreeMap::new();
            for session in &members {
                for tool in session.messages.iter().flat_map(|m| &m.tools) {
                    *tools.entry(tool.name.clone()).or_default() += 1;
                }
                *providers.entry(session.model.provider.clone()).or_default() += 1;
                *models.entry(session.model.qualified()).or_default() += 1;
            }
            let total_cost: f64 = members.iter().map(|s| s.cost_usd).sum();
            ProjectStats {
                session_count: members.len(),
                total_cost_usd: total_cost,
                total_tokens: members
                    .iter()
                    .fold(0u64, |acc, s| acc.saturating_add(s.tokens_used)),
                average_session_cost: safe_ratio(total_cost, members.len() as f64),
                top_tools: top_tools(&tools, PROJECT_TOP_TOOLS),
                preferred_providers: providers,
                preferred_models: models,
                name,
            }
        })
        .collect();

    projects.sort_by(|a, b| {
        b.session_count
            .cmp(&a.session_count)
            .then_with(|| a.name.cmp(&b.name))
    });
    projects
}

/// Projects arrive sorted, so the first maximum is deterministic
fn compare_projects(projects: &[ProjectStats]) -> ProjectComparison {
    fn first_max<F: Fn(&ProjectStats) -> f64>(projects: &[ProjectStats], key: F) -> Option<String> {
        let mut best: Option<&ProjectStats> = None;
        for project in projects {
            if best.is_none_or(|b| key(project) > key(b)) {
                best = Some(project);
            }
        }
        best.map(|p| p.name.clone())
    }

    ProjectComparison {
        most_active: first_max(projects, |p| p.session_count as f64),
        most_expensive: first_max(projects, |p| p.total_cost_usd),
        most_tool_intensive: first_max(projects, |p| p.tool_total() as f64),
    }
}

/// Cost per UTC day for the `days` days ending on `today`, oldest first,
/// including days without sessions
pub fn daily_costs(stats: &Statistics, days: u32, today: Millis) -> Vec<(String, f64)> {
    (0..days as Millis)
        .rev()
        .map(|offset| {
            let key = to_utc(today - offset * MS_PER_DAY)
                .format("%Y-%m-%d")
                .to_string();
            let cost = stats.daily.get(&key).map(|d| d.cost_usd).unwrap_or(0.0);
            (key, cost)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{assistant, session, tokens, user};
    use crate::models::{SessionData, ToolUsage};

    fn priced(id: &str, created: Millis, provider: &str, model: &str, cost: f64, tok: u64) -> SessionData {
        session(
            id,
            created,
            vec![user(created), assistant(created + 1, provider, model, tokens(tok, 0, 0, 0, 0), cost)],
        )
    }

    fn titled(mut s: SessionData, title: &str) -> SessionData {
        s.title = title.to_string();
        s
    }

    fn sample() -> Vec<SessionData> {
        let day = MS_PER_DAY;
        vec![
            titled(priced("ses_1", 10 * day, "anthropic", "claude-sonnet-4", 2.0, 500_000), "React dashboard"),
            titled(priced("ses_2", 11 * day, "openai", "gpt-4o", 0.5, 400_000), "Fix flaky test"),
            titled(priced("ses_3", 12 * day, "Anthropic", "claude-sonnet-4", 0.25, 200_000), "Terraform plan"),
            titled(priced("ses_4", 12 * day + 5, "openai", "gpt-4o", 0.0, 10), "chat"),
        ]
    }

    #[test]
    fn test_filters_compose() {
        let sessions = sample();
        let now = 13 * MS_PER_DAY;

        let by_provider = FilterOptions {
            provider: Some("ANTHROPIC".into()),
            ..FilterOptions::default()
        };
        let ids: Vec<String> = filter_sessions_at(&sessions, &by_provider, now)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["ses_1", "ses_3"]);

        let recent_non_terraform = FilterOptions {
            days: Some(2),
            exclude_project: Some("terraform".into()),
            ..FilterOptions::default()
        };
        let ids: Vec<String> = filter_sessions_at(&sessions, &recent_non_terraform, now)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["ses_2", "ses_4"]);

        let window = FilterOptions {
            start: Some(11 * MS_PER_DAY),
            end: Some(12 * MS_PER_DAY),
            project: Some("FIX".into()),
            ..FilterOptions::default()
        };
        assert_eq!(filter_sessions_at(&sessions, &window, now).len(), 1);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let sessions = sample();
        let now = 13 * MS_PER_DAY;
        let options = FilterOptions {
            days: Some(3),
            provider: Some("openai".into()),
            exclude_project: Some("chat".into()),
            ..FilterOptions::default()
        };
        let once = filter_sessions_at(&sessions, &options, now);
        let twice = filter_sessions_at(&once, &options, now);
        assert_eq!(once, twice);
        assert!(FilterOptions::default().is_empty());
    }

    #[test]
    fn test_totals_and_breakdowns() {
        let stats = calculate_statistics(&sample());
        assert_eq!(stats.total_sessions, 4);
        assert_eq!(stats.total_messages, 8);
        assert_eq!(stats.total_tokens, 1_100_010);
        assert!((stats.total_cost_usd - 2.75).abs() < 1e-9);
        assert_eq!(stats.providers["openai"].sessions, 2);
        assert_eq!(stats.providers["anthropic"].sessions, 1);
        assert_eq!(stats.models["openai/gpt-4o"].tokens, 400_010);

        let day = to_utc(12 * MS_PER_DAY).format("%Y-%m-%d").to_string();
        assert_eq!(stats.daily[&day].sessions, 2);
        assert_eq!(stats.time.hourly.values().sum::<usize>(), 4);
        assert_eq!(stats.time.weekday.values().sum::<usize>(), 4);
        assert!(stats.time.peak_hours.len() <= 3);
        assert_eq!(stats.time.peak_days[0].count, stats.time.weekday.values().max().copied().unwrap());
    }

    #[test]
    fn test_optimization_rules() {
        let stats = calculate_statistics(&sample());
        let opt = &stats.optimization;
        assert_eq!(opt.expensive_sessions.len(), 1);
        assert_eq!(opt.expensive_sessions[0].id, "ses_1");
        assert_eq!(opt.most_expensive_provider.as_deref(), Some("anthropic"));
        assert_eq!(opt.most_expensive_model.as_deref(), Some("anthropic/claude-sonnet-4"));
        // avg 0.6875: no cheap-model hint; 1.1M tokens; ses_1 above 2x avg is 25%; three providers
        assert_eq!(opt.suggestions.len(), 3);
        assert!(opt.suggestions[0].contains("token optimization"));
        assert!(opt.suggestions[1].contains("unusually high"));
        assert!(opt.suggestions[2].contains("consolidating"));
    }

    #[test]
    fn test_empty_input_has_no_nan() {
        let stats = calculate_statistics(&[]);
        assert_eq!(stats.optimization.average_cost_per_session, 0.0);
        assert!(stats.optimization.suggestions.is_empty());
        assert!(stats.optimization.expensive_sessions.is_empty());
        assert!(stats.comparison.most_active.is_none());
    }

    #[test]
    fn test_project_detection_families_paths_and_manifests() {
        let base = priced("ses_p", 0, "p", "m", 0.0, 1);
        assert_eq!(detect_project(&titled(base.clone(), "React dashboard")), "react");
        assert_eq!(detect_project(&titled(base.clone(), "maintain docs")), GENERAL_PROJECT);
        assert_eq!(detect_project(&titled(base.clone(), "edit /home/me/webshop/src")), "home");
        assert_eq!(detect_project(&titled(base.clone(), "bump yarn lockfile")), "nodejs-project");
        assert_eq!(detect_project(&titled(base.clone(), "update Cargo.toml")), "rust-project");

        let mut with_text = titled(base, "misc");
        with_text.messages[0].text = "set up golang workspace".into();
        assert_eq!(detect_project(&with_text), "go-project");
    }

    #[test]
    fn test_project_stats_and_comparison() {
        let mut sessions = sample();
        sessions[1].messages[1].tools = vec![
            ToolUsage { name: "bash".into(), duration_ms: 0, timestamp: 0 },
            ToolUsage { name: "bash".into(), duration_ms: 0, timestamp: 0 },
        ];
        let stats = calculate_statistics(&sessions);
        assert_eq!(stats.total_tools, 2);
        assert_eq!(stats.top_tools[0], ToolCount { name: "bash".into(), count: 2 });

        let names: Vec<&str> = stats.projects.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"react"));
        assert!(names.contains(&"terraform"));
        assert!(names.contains(&GENERAL_PROJECT));
        let general = stats.projects.iter().find(|p| p.name == GENERAL_PROJECT).unwrap();
        assert_eq!(general.session_count, 2);
        assert_eq!(stats.comparison.most_active.as_deref(), Some(GENERAL_PROJECT));
        assert_eq!(stats.comparison.most_expensive.as_deref(), Some("react"));
        assert_eq!(stats.comparison.most_tool_intensive.as_deref(), Some(GENERAL_PROJECT));
    }

    #[test]
    fn test_daily_costs_fill_gaps() {
        let stats = calculate_statistics(&sample());
        let series = daily_costs(&stats, 4, 12 * MS_PER_DAY);
        assert_eq!(series.len(), 4);
        assert_eq!(series[0].1, 0.0);
        assert!((series[1].1 - 2.0).abs() < 1e-9);
        assert!((series[3].1 - 0.25).abs() < 1e-9);
    }
}
