//! ocsight - OpenCode usage analytics
//!
//! A fast CLI for analyzing OpenCode usage: sessions, token consumption,
//! costs and budgets. Reads the session and message JSON records under
//! ~/.local/share/opencode/storage/ and prices them against the models.dev
//! catalog.

// Module declarations
mod aggregation;
mod budget;
mod cache;
mod config;
mod cost;
mod display;
mod error;
mod export;
mod fingerprint;
mod helpers;
mod live;
mod logging;
mod models;
mod pricing;
mod runtime;
mod scanner;
mod session_index;
mod session_loader;
mod statistics;
#[cfg(test)]
mod test_support;
mod tool_usage;
mod watcher;

// Core dependencies
use anyhow::{Context, Result};
use chrono::Datelike;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aggregation::{AggregateOptions, Aggregator, ensure_data_dir};
use budget::{BudgetTracker, ProviderBudget};
use cache::CacheManager;
use config::{CheckLevel, Config, expand_tilde};
use display::{
    display_budget, display_costs, display_forecast, display_models, display_sessions_table,
    display_summary, print_error, print_info, print_json, print_warning,
};
use error::OcsightError;
use export::{ExportFormat, default_output_path, export_sessions};
use helpers::{MS_PER_DAY, compare_floats, now_millis, parse_date, sort_with_order, to_local};
use models::SessionData;
use pricing::{ModelCatalog, ModelQuery};
use runtime::Runtime;
use statistics::{FilterOptions, calculate_statistics, daily_costs, filter_sessions};

/// Upper bound on memory the parse pool plans for
const MEMORY_BUDGET_MB: u64 = 512;

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Tables and summaries for the terminal
    #[default]
    Table,
    /// JSON for scripting and automation
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SortOrder {
    /// Sort in ascending order
    Asc,
    /// Sort in descending order
    Desc,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SortField {
    /// Sort by creation time
    Date,
    /// Sort by cost
    Cost,
    /// Sort by total tokens
    Tokens,
    /// Sort by message count
    Messages,
}

#[derive(Parser)]
#[command(name = "ocsight")]
#[command(about = "OpenCode usage analytics - Analyze token usage, costs, and budgets")]
#[command(version)]
#[command(
    long_about = "ocsight analyzes OpenCode usage by reading the session and message records under ~/.local/share/opencode/storage/.

EXAMPLES:
  ocsight                              # Usage summary for all sessions
  ocsight summary --days 7             # Last week's summary
  ocsight sessions --sort cost         # Most expensive sessions first
  ocsight costs --provider anthropic   # Cost breakdown for one provider
  ocsight export --format csv          # Export sessions to CSV
  ocsight live                         # Monitor the active session
  ocsight models --reasoning           # Reasoning-capable models with prices
  ocsight budget set --monthly 100     # Set a monthly budget

GLOBAL FLAGS:
  Filter flags work with any report command:
  ocsight --start 2026-03-01 --end 2026-03-31 costs
  ocsight --path /srv/opencode summary"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        long,
        global = true,
        value_name = "N",
        help = "Only sessions from the last N days"
    )]
    days: Option<u32>,

    #[arg(
        long,
        global = true,
        help = "Filter by provider (e.g. anthropic, openai)"
    )]
    provider: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "DATE",
        help = "Filter from date (YYYY-MM-DD)",
        long_help = "Only sessions created on or after this date. Format: YYYY-MM-DD or YYYYMMDD\nCombine with --end for date ranges"
    )]
    start: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "DATE",
        help = "Filter until date (YYYY-MM-DD), inclusive"
    )]
    end: Option<String>,

    #[arg(
        long,
        global = true,
        help = "Only sessions whose title mentions this project"
    )]
    project: Option<String>,

    #[arg(
        long,
        global = true,
        help = "Skip sessions whose title mentions this project"
    )]
    exclude_project: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "OpenCode data directory",
        long_help = "Path to the OpenCode data root (the directory containing storage/)\nDefault: config paths.data_dir, then $OCSIGHT_DATA_DIR, then ~/.local/share/opencode"
    )]
    path: Option<PathBuf>,

    #[arg(long, global = true, help = "Bypass the result cache")]
    no_cache: bool,

    #[arg(short, long, global = true, help = "Suppress progress output")]
    quiet: bool,

    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Increase log verbosity (-v info, -vv debug)"
    )]
    verbose: u8,

    #[arg(long, global = true, help = "Emit logs as JSON on stderr")]
    json_logs: bool,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Path to config file (default: ~/.config/ocsight/config.yaml)"
    )]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show usage summary")]
    #[command(
        long_about = "Overall usage: sessions, messages, tools, cost and tokens, broken down by provider, model, tool, time of day and project\n\nEXAMPLES:\n  ocsight summary\n  ocsight summary --days 30 --format json"
    )]
    Summary {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    #[command(about = "List sessions")]
    #[command(
        long_about = "List sessions with their model, message count, tokens and cost\n\nEXAMPLES:\n  ocsight sessions --limit 50\n  ocsight sessions --sort cost --order desc"
    )]
    Sessions {
        #[arg(long, default_value_t = 20, help = "Maximum sessions to show")]
        limit: usize,
        #[arg(long, value_enum, default_value_t = SortField::Date, help = "Field to sort by")]
        sort: SortField,
        #[arg(long, value_enum, default_value_t = SortOrder::Desc, help = "Sort order")]
        order: SortOrder,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    #[command(about = "Show cost analysis")]
    #[command(
        long_about = "Cost totals per provider and model, daily costs and optimization insights\n\nEXAMPLES:\n  ocsight costs\n  ocsight costs --daily 14"
    )]
    Costs {
        #[arg(long, default_value_t = 7, value_name = "N", help = "Days of daily costs to show")]
        daily: u32,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    #[command(about = "Export sessions to a file")]
    #[command(
        long_about = "Write the filtered sessions to CSV, JSON or Markdown\n\nThe default file name is ocsight-export-<date>.<ext> in the configured export directory.\n\nEXAMPLES:\n  ocsight export --format csv\n  ocsight export --format markdown --output report.md"
    )]
    Export {
        #[arg(long, value_enum, help = "Export format (default: config export.default_format)")]
        format: Option<ExportFormat>,
        #[arg(short, long, value_name = "FILE", help = "Output file")]
        output: Option<PathBuf>,
    },
    #[command(about = "Manage configuration")]
    #[command(
        long_about = "Manage ocsight configuration\n\nConfiguration is stored in YAML format and persists between runs.\n\nCONFIG LOCATION:\n  ~/.config/ocsight/config.yaml\n\nEXAMPLES:\n  ocsight config show\n  ocsight config init\n  ocsight config doctor\n  ocsight config set-path ~/opencode-data\n  ocsight config clear-cache --all"
    )]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    #[command(about = "Live dashboard for the active session")]
    #[command(
        long_about = "Monitor the most recently active session (or --session) in real time\n\nShows token and cost breakdown, context window fill, burn rate and budget health.\nPress Ctrl+C to stop.\n\nEXAMPLES:\n  ocsight live\n  ocsight live --refresh 10\n  ocsight live --session ses_1234"
    )]
    Live {
        #[arg(long, value_name = "SECONDS", help = "Refresh interval, 1-60 seconds")]
        refresh: Option<u64>,
        #[arg(long, value_name = "ID", help = "Monitor a specific session")]
        session: Option<String>,
        #[arg(long, help = "Hide progress bars")]
        no_progress: bool,
    },
    #[command(about = "Browse the pricing catalog")]
    #[command(
        long_about = "List models from the models.dev catalog with their prices and capabilities\n\nEXAMPLES:\n  ocsight models --provider anthropic\n  ocsight models --reasoning --tools\n  ocsight models --search sonnet"
    )]
    Models {
        #[arg(long, help = "Only reasoning-capable models")]
        reasoning: bool,
        #[arg(long, help = "Only models with tool calling")]
        tools: bool,
        #[arg(long, help = "Match model name or id")]
        search: Option<String>,
        #[arg(long, value_name = "TOKENS", help = "Minimum context window")]
        min_context: Option<u64>,
        #[arg(long, value_name = "USD", help = "Maximum input price per million tokens")]
        max_input_cost: Option<f64>,
        #[arg(long, help = "List providers instead of models")]
        providers: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    #[command(about = "Track spending against budgets")]
    #[command(
        long_about = "Set monthly limits and check spend, alerts and the month-end forecast\n\nEXAMPLES:\n  ocsight budget set --monthly 100 --warning 60\n  ocsight budget add --provider anthropic --limit 50\n  ocsight budget show\n  ocsight budget forecast"
    )]
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write a default config file
    Init {
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
    /// Validate configuration and data paths
    Doctor,
    /// Set the OpenCode data directory
    SetPath {
        #[arg(value_name = "PATH")]
        dir: PathBuf,
    },
    /// Drop cached results for the current data directory
    ClearCache {
        #[arg(long, help = "Also drop file fingerprints and other directories' results")]
        all: bool,
    },
}

#[derive(Subcommand)]
enum BudgetAction {
    /// Set the global monthly limit
    Set {
        #[arg(long, value_name = "USD")]
        monthly: f64,
        #[arg(long, value_name = "PERCENT")]
        warning: Option<f64>,
        #[arg(long, value_name = "PERCENT")]
        critical: Option<f64>,
    },
    /// Add or replace a provider budget (takes the global --provider)
    Add {
        #[arg(long, value_name = "USD")]
        limit: f64,
        #[arg(long, help = "Display name (default: provider id)")]
        name: Option<String>,
    },
    /// Current month spend, health and alerts
    Show {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Month-end projection and spend history
    Forecast {
        #[arg(long, default_value_t = 3, help = "Months of history to include")]
        months: u32,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

/// Application entry point
fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet, cli.json_logs);

    if let Err(e) = run(cli) {
        match e.downcast_ref::<OcsightError>() {
            Some(err) => {
                print_error(&err.detailed_message());
                if err.is_fatal() {
                    print_info("Run 'ocsight config doctor' to check your setup");
                }
            }
            None => print_error(&format!("{:#}", e)),
        }
        std::process::exit(1);
    }
}

/// Main application logic
fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => expand_tilde(path),
        None => Config::default_path()?,
    };
    let mut config = Config::load_from(&config_path);
    if !config.ui.colors {
        colored::control::set_override(false);
    }

    match cli.command.as_ref().unwrap_or(&Commands::Summary {
        format: OutputFormat::Table,
    }) {
        Commands::Summary { format } => {
            let sessions = load_sessions(&cli, &config)?;
            handle_summary_command(&sessions, *format);
        }
        Commands::Sessions {
            limit,
            sort,
            order,
            format,
        } => {
            let sessions = load_sessions(&cli, &config)?;
            handle_sessions_command(sessions, *limit, *sort, *order, *format);
        }
        Commands::Costs { daily, format } => {
            let sessions = load_sessions(&cli, &config)?;
            handle_costs_command(&sessions, *daily, *format);
        }
        Commands::Export { format, output } => {
            let sessions = load_sessions(&cli, &config)?;
            handle_export_command(&sessions, &config, *format, output.as_deref())?;
        }
        Commands::Config { action } => {
            handle_config_command(&cli, &mut config, &config_path, action)?;
        }
        Commands::Live {
            refresh,
            session,
            no_progress,
        } => {
            let data_dir = data_dir(&cli, &config)?;
            ensure_data_dir(&data_dir)?;
            live::start(
                &data_dir,
                catalog(&config),
                config.budget.clone(),
                live::LiveOptions {
                    refresh_secs: refresh.unwrap_or(config.ui.live_refresh_interval),
                    session: session.clone(),
                    show_progress: !no_progress,
                },
            )?;
        }
        Commands::Models {
            reasoning,
            tools,
            search,
            min_context,
            max_input_cost,
            providers,
            format,
        } => {
            let query = ModelQuery {
                provider: cli.provider.clone(),
                reasoning: reasoning.then_some(true),
                tool_call: tools.then_some(true),
                min_context: *min_context,
                max_input_cost: *max_input_cost,
                text: search.clone(),
            };
            handle_models_command(&catalog(&config), &query, *providers, *format);
        }
        Commands::Budget { action } => {
            handle_budget_command(&cli, &mut config, &config_path, action)?;
        }
    }

    Ok(())
}

fn data_dir(cli: &Cli, config: &Config) -> Result<PathBuf> {
    match &cli.path {
        Some(path) => Ok(expand_tilde(path)),
        None => config.data_dir(),
    }
}

fn catalog(config: &Config) -> Arc<ModelCatalog> {
    Arc::new(ModelCatalog::http(
        &config.pricing.url,
        config.pricing.timeout(),
        config.pricing.ttl(),
    ))
}

fn aggregator(cli: &Cli, config: &Config) -> Result<Aggregator> {
    Ok(Aggregator::new(
        &data_dir(cli, config)?,
        &config.cache_dir(),
        Runtime::detect(MEMORY_BUDGET_MB),
        config.cache.limits(),
    ))
}

fn filter_options(cli: &Cli) -> Result<FilterOptions> {
    let date = |field: &str, value: &Option<String>| -> Result<Option<i64>> {
        match value {
            Some(text) => parse_date(text).map(Some).ok_or_else(|| {
                OcsightError::validation(field, format!("invalid date '{}', expected YYYY-MM-DD", text))
                    .into()
            }),
            None => Ok(None),
        }
    };
    Ok(FilterOptions {
        days: cli.days,
        start: date("start", &cli.start)?,
        // the end date counts as a whole day
        end: date("end", &cli.end)?.map(|ms| ms + MS_PER_DAY - 1),
        provider: cli.provider.clone(),
        project: cli.project.clone(),
        exclude_project: cli.exclude_project.clone(),
    })
}

/// All sessions that pass the global filters
fn load_sessions(cli: &Cli, config: &Config) -> Result<Vec<SessionData>> {
    let filters = filter_options(cli)?;
    let aggregate = aggregator(cli, config)?.run(&AggregateOptions {
        limit: None,
        days: cli.days,
        cache: config.cache.enabled && !cli.no_cache,
        quiet: cli.quiet,
    })?;
    Ok(filter_sessions(&aggregate.sessions, &filters))
}

fn handle_summary_command(sessions: &[SessionData], format: OutputFormat) {
    let stats = calculate_statistics(sessions);
    match format {
        OutputFormat::Json => print_json(&stats),
        OutputFormat::Table => display_summary(&stats),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionListing<'a> {
    id: &'a str,
    title: &'a str,
    provider: &'a str,
    model: &'a str,
    messages: usize,
    tokens_used: u64,
    cost_usd: f64,
    created: i64,
    updated: Option<i64>,
}

impl<'a> From<&'a SessionData> for SessionListing<'a> {
    fn from(session: &'a SessionData) -> Self {
        Self {
            id: &session.id,
            title: &session.title,
            provider: &session.model.provider,
            model: &session.model.model,
            messages: session.message_count,
            tokens_used: session.tokens_used,
            cost_usd: session.cost_usd,
            created: session.time.created,
            updated: session.time.updated,
        }
    }
}

fn handle_sessions_command(
    mut sessions: Vec<SessionData>,
    limit: usize,
    sort: SortField,
    order: SortOrder,
    format: OutputFormat,
) {
    let ascending = matches!(order, SortOrder::Asc);
    match sort {
        SortField::Date => {
            sort_with_order(&mut sessions, |a, b| a.time.created.cmp(&b.time.created), ascending)
        }
        SortField::Cost => {
            sort_with_order(&mut sessions, |a, b| compare_floats(a.cost_usd, b.cost_usd), ascending)
        }
        SortField::Tokens => {
            sort_with_order(&mut sessions, |a, b| a.tokens_used.cmp(&b.tokens_used), ascending)
        }
        SortField::Messages => sort_with_order(
            &mut sessions,
            |a, b| a.message_count.cmp(&b.message_count),
            ascending,
        ),
    }
    sessions.truncate(limit);

    match format {
        OutputFormat::Json => {
            let listing: Vec<SessionListing<'_>> = sessions.iter().map(SessionListing::from).collect();
            print_json(&listing);
        }
        OutputFormat::Table => display_sessions_table(&sessions),
    }
}

fn handle_costs_command(sessions: &[SessionData], daily: u32, format: OutputFormat) {
    let stats = calculate_statistics(sessions);
    let days = daily_costs(&stats, daily, now_millis());
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "totalCostUsd": stats.total_cost_usd,
            "totalCostCents": stats.total_cost_cents,
            "totalTokens": stats.total_tokens,
            "sessions": stats.total_sessions,
            "providers": stats.providers,
            "models": stats.models,
            "daily": days
                .iter()
                .map(|(date, cost)| serde_json::json!({ "date": date, "costUsd": cost }))
                .collect::<Vec<_>>(),
            "optimization": stats.optimization,
        })),
        OutputFormat::Table => display_costs(&stats, &days),
    }
}

fn handle_export_command(
    sessions: &[SessionData],
    config: &Config,
    format: Option<ExportFormat>,
    output: Option<&Path>,
) -> Result<()> {
    if sessions.is_empty() {
        print_warning("No sessions found with the specified filters");
        return Ok(());
    }

    let format = format.unwrap_or(config.export.default_format);
    let now = now_millis();
    let path = match output {
        Some(path) => expand_tilde(path),
        None => default_output_path(&config.export_dir(), format, now),
    };

    print_info(&format!(
        "Exporting {} sessions to {:?}...",
        sessions.len(),
        format
    ));
    let stats = calculate_statistics(sessions);
    let summary = export_sessions(sessions, &stats, format, &path, now)
        .with_context(|| format!("Export to {} failed", path.display()))?;

    println!("{} Export completed", "✓".green());
    println!("{}", format!("File: {}", summary.path.display()).cyan());
    println!(
        "{}",
        format!("   Size: {} bytes | Records: {}", summary.bytes, summary.records).dimmed()
    );
    Ok(())
}

/// Handle configuration management commands
fn handle_config_command(
    cli: &Cli,
    config: &mut Config,
    config_path: &Path,
    action: &ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Current Configuration:".bold());
            println!("{}", serde_yaml::to_string(config)?);
            println!("Config File: {}", config_path.display());
            match data_dir(cli, config) {
                Ok(dir) => println!("Data Directory: {}", dir.display()),
                Err(e) => print_warning(&e.to_string()),
            }
            println!("Cache Directory: {}", config.cache_dir().display());
        }
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                print_warning(&format!(
                    "Config already exists at {} (use --force to overwrite)",
                    config_path.display()
                ));
                return Ok(());
            }
            Config::default().save_to(config_path)?;
            print_info(&format!("Wrote default configuration to {}", config_path.display()));
        }
        ConfigAction::Doctor => {
            println!("{}", "Configuration Health Check".bold().blue());
            for check in config.doctor() {
                let marker = match check.level {
                    CheckLevel::Ok => "✓".green(),
                    CheckLevel::Warning => "!".yellow(),
                    CheckLevel::Error => "✗".red(),
                };
                println!("  {} {}", marker, check.message);
            }

            let runtime = Runtime::detect(MEMORY_BUDGET_MB);
            println!(
                "  {} Runtime: {} memory gauge, {} worker threads",
                "✓".green(),
                runtime.gauge_name(),
                runtime.optimal_concurrency()
            );
            let cache = CacheManager::open(&config.cache_dir(), config.cache.limits(), runtime);
            let health = cache.health();
            let marker = if health.is_valid { "✓".green() } else { "!".yellow() };
            println!(
                "  {} Result cache: {} entries, {:.2} MB, compression ratio {:.2}{}",
                marker,
                health.entry_count,
                health.total_size_mb,
                health.compression_ratio,
                health
                    .reason
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            );
        }
        ConfigAction::SetPath { dir } => {
            let path = expand_tilde(dir);
            if !path.is_dir() {
                print_warning(&format!("{} does not exist yet", path.display()));
            }
            config.set_data_dir(path.clone());
            config.save_to(config_path)?;
            print_info(&format!("Data directory set to {}", path.display()));
        }
        ConfigAction::ClearCache { all } => {
            let aggregator = aggregator(cli, config)?;
            if *all {
                aggregator.clear_cache()?;
                print_info(&format!("Cleared {}", aggregator.cache_dir().display()));
            } else {
                aggregator.invalidate(&AggregateOptions {
                    days: cli.days,
                    ..AggregateOptions::default()
                });
                print_info(&format!(
                    "Dropped cached results for {}",
                    aggregator.data_dir().display()
                ));
            }
        }
    }
    Ok(())
}

fn handle_models_command(
    catalog: &ModelCatalog,
    query: &ModelQuery,
    providers: bool,
    format: OutputFormat,
) {
    if providers {
        let providers = catalog.providers();
        match format {
            OutputFormat::Json => print_json(&providers),
            OutputFormat::Table => {
                for provider in &providers {
                    println!("{:<24} {}", provider.id.bright_white(), provider.name.dimmed());
                }
            }
        }
        return;
    }

    let models = catalog.search_models(query);
    match format {
        OutputFormat::Json => print_json(&models),
        OutputFormat::Table => display_models(&models),
    }
}

fn handle_budget_command(
    cli: &Cli,
    config: &mut Config,
    config_path: &Path,
    action: &BudgetAction,
) -> Result<()> {
    match action {
        BudgetAction::Set {
            monthly,
            warning,
            critical,
        } => {
            config.budget.global_monthly_limit = Some(*monthly);
            if let Some(warning) = warning {
                config.budget.alert_thresholds.warning = *warning;
            }
            if let Some(critical) = critical {
                config.budget.alert_thresholds.critical = *critical;
            }
            config.validate()?;
            config.save_to(config_path)?;
            print_info(&format!(
                "Monthly budget set to ${:.2} (warning {}%, critical {}%)",
                monthly,
                config.budget.alert_thresholds.warning,
                config.budget.alert_thresholds.critical
            ));
        }
        BudgetAction::Add { limit, name } => {
            let Some(provider) = cli.provider.as_ref() else {
                return Err(OcsightError::validation("provider", "budget add needs --provider <id>").into());
            };
            config.budget.providers.insert(
                provider.clone(),
                ProviderBudget {
                    name: name.clone().unwrap_or_else(|| provider.clone()),
                    monthly_limit: *limit,
                    enabled: true,
                },
            );
            config.validate()?;
            config.save_to(config_path)?;
            print_info(&format!("Budget for {} set to ${:.2}/month", provider, limit));
        }
        BudgetAction::Show { format } => {
            let tracker = budget_tracker(cli, config)?;
            let now = now_millis();
            let today = to_local(now);
            let spend = tracker.monthly_spend(today.year(), today.month());
            let health = tracker.budget_health_at(now);
            let providers = tracker.provider_statuses(&spend);
            let alerts = tracker.alerts_with(health.as_ref(), now);
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "spend": spend,
                    "health": health,
                    "providers": providers,
                    "alerts": alerts,
                })),
                OutputFormat::Table => {
                    display_budget(&spend, health.as_ref(), &providers);
                    for alert in &alerts {
                        match alert.level {
                            budget::AlertLevel::Critical => print_error(&alert.message),
                            budget::AlertLevel::Warning => print_warning(&alert.message),
                            budget::AlertLevel::Info => print_info(&alert.message),
                        }
                    }
                }
            }
        }
        BudgetAction::Forecast { months, format } => {
            let tracker = budget_tracker(cli, config)?;
            let now = now_millis();
            let forecast = tracker.forecast_at(now);
            let history = tracker.history_at(*months, now);
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "forecast": forecast,
                    "history": history,
                })),
                OutputFormat::Table => display_forecast(&forecast, &history),
            }
        }
    }
    Ok(())
}

/// Budgets look at whole months, so the global filters do not apply
fn budget_tracker(cli: &Cli, config: &Config) -> Result<BudgetTracker> {
    let aggregate = aggregator(cli, config)?.run(&AggregateOptions {
        limit: None,
        days: None,
        cache: config.cache.enabled && !cli.no_cache,
        quiet: cli.quiet,
    })?;
    Ok(BudgetTracker::new(
        Arc::new(aggregate.sessions),
        catalog(config),
        config.budget.clone(),
    ))
}
