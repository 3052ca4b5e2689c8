use anyhow::Result;
use chrono::SecondsFormat;
use csv::Writer;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::display::{format_currency, format_number};
use crate::helpers::{MS_PER_MINUTE, compare_floats, to_utc};
use crate::models::{Millis, SessionData};
use crate::statistics::Statistics;

const JSON_DAILY_DAYS: usize = 30;
const MARKDOWN_DAILY_DAYS: usize = 7;
const MARKDOWN_TOP_SESSIONS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    #[default]
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "md",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub bytes: u64,
    pub records: usize,
}

/// `ocsight-export-<date>.<ext>` inside `dir`
pub fn default_output_path(dir: &Path, format: ExportFormat, now: Millis) -> PathBuf {
    dir.join(format!(
        "ocsight-export-{}.{}",
        to_utc(now).format("%Y-%m-%d"),
        format.extension()
    ))
}

pub fn export_sessions(
    sessions: &[SessionData],
    stats: &Statistics,
    format: ExportFormat,
    path: &Path,
    now: Millis,
) -> Result<ExportSummary> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    match format {
        ExportFormat::Csv => export_csv(sessions, path)?,
        ExportFormat::Json => fs::write(path, render_json(sessions, stats, now)?)?,
        ExportFormat::Markdown => fs::write(path, render_markdown(sessions, stats, now))?,
    }
    Ok(ExportSummary {
        path: path.to_path_buf(),
        bytes: fs::metadata(path)?.len(),
        records: sessions.len(),
    })
}

/// Minutes between creation and last update, 0 when never updated
fn duration_minutes(session: &SessionData) -> i64 {
    session
        .time
        .updated
        .map(|updated| ((updated - session.time.created) as f64 / MS_PER_MINUTE as f64).round() as i64)
        .unwrap_or(0)
}

fn iso(ms: Millis) -> String {
    to_utc(ms).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn export_csv(sessions: &[SessionData], path: &Path) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);

    wtr.write_record([
        "Date",
        "Session ID",
        "Title",
        "Provider",
        "Model",
        "Messages",
        "Tokens",
        "Cost ($)",
        "Duration (min)",
    ])?;

    for session in sessions {
        wtr.write_record(&[
            to_utc(session.time.created).format("%Y-%m-%d").to_string(),
            session.id.clone(),
            session.title.clone(),
            session.model.provider.clone(),
            session.model.model.clone(),
            session.message_count.to_string(),
            session.tokens_used.to_string(),
            format!("{:.2}", session.cost_cents as f64 / 100.0),
            duration_minutes(session).to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonExport<'a> {
    metadata: JsonMetadata,
    summary: JsonSummary<'a>,
    sessions: Vec<JsonSession<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonMetadata {
    exported_at: String,
    total_sessions: usize,
    total_messages: usize,
    total_cost: String,
    total_tokens: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSummary<'a> {
    by_provider: Vec<ProviderShare<'a>>,
    daily_costs: Vec<DailyCost<'a>>,
    insights: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderShare<'a> {
    provider: &'a str,
    sessions: usize,
    cost_cents: i64,
    tokens: u64,
    percentage: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DailyCost<'a> {
    date: &'a str,
    sessions: usize,
    cost_cents: i64,
    tokens: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSession<'a> {
    id: &'a str,
    title: &'a str,
    created: String,
    updated: Option<String>,
    provider: &'a str,
    model: &'a str,
    messages: usize,
    tokens_used: u64,
    cost_cents: i64,
    duration: i64,
}

fn provider_shares(stats: &Statistics) -> Vec<ProviderShare<'_>> {
    let mut shares: Vec<ProviderShare<'_>> = stats
        .providers
        .iter()
        .map(|(provider, totals)| ProviderShare {
            provider,
            sessions: totals.sessions,
            cost_cents: totals.cost_cents,
            tokens: totals.tokens,
            percentage: if stats.total_cost_cents > 0 {
                totals.cost_cents as f64 / stats.total_cost_cents as f64 * 100.0
            } else {
                0.0
            },
        })
        .collect();
    shares.sort_by(|a, b| b.cost_cents.cmp(&a.cost_cents));
    shares
}

/// Newest day first
fn daily_costs(stats: &Statistics, limit: usize) -> Vec<DailyCost<'_>> {
    stats
        .daily
        .iter()
        .rev()
        .take(limit)
        .map(|(date, totals)| DailyCost {
            date,
            sessions: totals.sessions,
            cost_cents: totals.cost_cents,
            tokens: totals.tokens,
        })
        .collect()
}

fn render_json(sessions: &[SessionData], stats: &Statistics, now: Millis) -> Result<String> {
    let export = JsonExport {
        metadata: JsonMetadata {
            exported_at: iso(now),
            total_sessions: sessions.len(),
            total_messages: sessions.iter().map(|s| s.message_count).sum(),
            total_cost: format!("{:.2}", stats.total_cost_cents as f64 / 100.0),
            total_tokens: stats.total_tokens,
        },
        summary: JsonSummary {
            by_provider: provider_shares(stats),
            daily_costs: daily_costs(stats, JSON_DAILY_DAYS),
            insights: &stats.optimization.suggestions,
        },
        sessions: sessions
            .iter()
            .map(|s| JsonSession {
                id: &s.id,
                title: &s.title,
                created: iso(s.time.created),
                updated: s.time.updated.map(iso),
                provider: &s.model.provider,
                model: &s.model.model,
                messages: s.message_count,
                tokens_used: s.tokens_used,
                cost_cents: s.cost_cents,
                duration: duration_minutes(s),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&export)?)
}

fn render_markdown(sessions: &[SessionData], stats: &Statistics, now: Millis) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# OCsight Export Report\n");
    let _ = writeln!(md, "**Generated:** {}", iso(now));
    let _ = writeln!(md, "**Sessions:** {}\n", sessions.len());

    let _ = writeln!(md, "## Summary\n");
    let _ = writeln!(md, "- **Total Cost:** {}", format_currency(stats.total_cost_usd));
    let _ = writeln!(md, "- **Total Tokens:** {}", format_number(stats.total_tokens));
    let _ = writeln!(
        md,
        "- **Average Cost/Session:** {}",
        format_currency(stats.optimization.average_cost_per_session)
    );
    let _ = writeln!(
        md,
        "- **Total Messages:** {}\n",
        format_number(stats.total_messages as u64)
    );

    let shares = provider_shares(stats);
    if !shares.is_empty() {
        let _ = writeln!(md, "## Providers\n");
        let _ = writeln!(md, "| Provider | Sessions | Cost | Tokens | % |");
        let _ = writeln!(md, "|----------|----------|------|--------|---|");
        for share in shares {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {:.1}% |",
                share.provider,
                share.sessions,
                format_currency(share.cost_cents as f64 / 100.0),
                format_number(share.tokens),
                share.percentage
            );
        }
        md.push('\n');
    }

    let daily = daily_costs(stats, MARKDOWN_DAILY_DAYS);
    if !daily.is_empty() {
        let _ = writeln!(md, "## Daily Activity (Last {} Days)\n", MARKDOWN_DAILY_DAYS);
        let _ = writeln!(md, "| Date | Sessions | Cost | Tokens |");
        let _ = writeln!(md, "|------|----------|------|--------|");
        for day in daily {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} |",
                day.date,
                day.sessions,
                format_currency(day.cost_cents as f64 / 100.0),
                format_number(day.tokens)
            );
        }
        md.push('\n');
    }

    let mut top: Vec<&SessionData> = sessions.iter().collect();
    top.sort_by(|a, b| compare_floats(b.cost_usd, a.cost_usd));
    if !top.is_empty() {
        let _ = writeln!(md, "## Top Sessions by Cost\n");
        let _ = writeln!(md, "| Session ID | Date | Provider | Cost | Tokens |");
        let _ = writeln!(md, "|------------|------|----------|------|--------|");
        for session in top.into_iter().take(MARKDOWN_TOP_SESSIONS) {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} |",
                session.id.chars().take(12).collect::<String>(),
                to_utc(session.time.created).format("%Y-%m-%d"),
                session.model.provider,
                format_currency(session.cost_usd),
                format_number(session.tokens_used)
            );
        }
        md.push('\n');
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionTime;
    use crate::models::fixtures::{assistant, session, tokens, user};
    use crate::statistics::calculate_statistics;
    use tempfile::tempdir;

    const DAY: Millis = 86_400_000;
    // 2026-03-01T00:00:00Z
    const MARCH_1: Millis = 1_772_323_200_000;

    fn sample() -> Vec<SessionData> {
        let mut first = session(
            "ses_alpha",
            MARCH_1,
            vec![
                user(MARCH_1),
                assistant(MARCH_1 + 1_000, "anthropic", "claude-sonnet-4", tokens(100, 50, 0, 0, 0), 1.25),
            ],
        );
        first.time = SessionTime {
            created: MARCH_1,
            updated: Some(MARCH_1 + 30 * 60_000),
        };
        let second = session(
            "ses_beta",
            MARCH_1 + DAY,
            vec![assistant(MARCH_1 + DAY, "openai", "gpt-4o-mini", tokens(10, 10, 0, 0, 0), 0.5)],
        );
        vec![first, second]
    }

    #[test]
    fn test_default_output_path() {
        let path = default_output_path(Path::new("out"), ExportFormat::Markdown, MARCH_1);
        assert_eq!(path, PathBuf::from("out/ocsight-export-2026-03-01.md"));
    }

    #[test]
    fn test_csv_export() {
        let dir = tempdir().unwrap();
        let sessions = sample();
        let stats = calculate_statistics(&sessions);
        let path = dir.path().join("export.csv");
        let summary = export_sessions(&sessions, &stats, ExportFormat::Csv, &path, MARCH_1).unwrap();
        assert_eq!(summary.records, 2);
        assert!(summary.bytes > 0);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "2026-03-01");
        assert_eq!(&rows[0][1], "ses_alpha");
        assert_eq!(&rows[0][7], "1.25");
        assert_eq!(&rows[0][8], "30");
        assert_eq!(&rows[1][8], "0");
    }

    #[test]
    fn test_json_export() {
        let dir = tempdir().unwrap();
        let sessions = sample();
        let stats = calculate_statistics(&sessions);
        let path = dir.path().join("nested/export.json");
        export_sessions(&sessions, &stats, ExportFormat::Json, &path, MARCH_1).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["metadata"]["totalSessions"], 2);
        assert_eq!(value["metadata"]["totalCost"], "1.75");
        assert_eq!(value["metadata"]["exportedAt"], "2026-03-01T00:00:00.000Z");
        assert_eq!(value["summary"]["byProvider"][0]["provider"], "anthropic");
        assert_eq!(value["summary"]["dailyCosts"][0]["date"], "2026-03-02");
        assert_eq!(value["sessions"][0]["costCents"], 125);
        assert!(value["sessions"][1]["updated"].is_null());
    }

    #[test]
    fn test_markdown_export() {
        let sessions = sample();
        let stats = calculate_statistics(&sessions);
        let md = render_markdown(&sessions, &stats, MARCH_1);
        assert!(md.starts_with("# OCsight Export Report"));
        assert!(md.contains("**Sessions:** 2"));
        assert!(md.contains("| anthropic | 1 |"));
        let top = md.split("## Top Sessions by Cost").nth(1).unwrap();
        assert!(top.find("ses_alpha").unwrap() < top.find("ses_beta").unwrap());
    }
}
