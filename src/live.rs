//! Live monitoring of the most recent (or a chosen) session
//!
//! The dashboard shows:
//! - Token and cost breakdown of the monitored session
//! - Context window fill
//! - Burn rate over the trailing activity window
//! - Monthly budget health and alerts

use anyhow::{Result, bail};
use colored::Colorize;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use terminal_size::{Width, terminal_size};
use tracing::{debug, warn};

use crate::budget::{
    AlertLevel, BudgetAlert, BudgetConfig, BudgetHealth, BudgetStatus, BudgetTracker,
};
use crate::cost::{CostBreakdown, calculate_session_metrics, format_cost, format_tokens};
use crate::display::{format_number, print_info};
use crate::helpers::{MS_PER_MINUTE, now_millis, safe_ratio, to_local};
use crate::models::{Millis, RecentActivity, TokenCounts};
use crate::pricing::ModelCatalog;
use crate::session_index::SessionIndex;
use crate::session_loader::{ActiveSlot, SessionLoader};
use crate::watcher::SessionWatcher;

pub const MIN_REFRESH_SECS: u64 = 1;
pub const MAX_REFRESH_SECS: u64 = 60;
pub const DEFAULT_REFRESH_SECS: u64 = 5;
pub const ACTIVITY_WINDOW_MINUTES: u32 = 5;
pub const DEFAULT_CONTEXT_LIMIT: u64 = 128_000;
const RECENT_SESSIONS_SHOWN: usize = 5;
const SLEEP_SLICE: Duration = Duration::from_millis(100);
const BAR_WIDTH: usize = 30;

/// Refresh interval from user input, bounded to 1..=60 seconds
pub fn refresh_interval(secs: u64) -> Result<Duration> {
    if !(MIN_REFRESH_SECS..=MAX_REFRESH_SECS).contains(&secs) {
        bail!(
            "Refresh interval must be between {} and {} seconds",
            MIN_REFRESH_SECS,
            MAX_REFRESH_SECS
        );
    }
    Ok(Duration::from_secs(secs))
}

/// Session ids may be given without their `ses_` prefix
pub fn normalize_session_id(id: &str) -> String {
    if id.starts_with("ses_") {
        id.to_string()
    } else {
        format!("ses_{}", id)
    }
}

/// Tokens per minute over the trailing window. Zero once the last message
/// has fallen out of the window, whatever the history looks like.
pub fn burn_rate(activity: &RecentActivity, window_minutes: u32) -> f64 {
    let window = window_minutes as Millis * MS_PER_MINUTE;
    if activity.messages == 0 || activity.time_since_last > window {
        return 0.0;
    }
    activity.tokens_per_minute
}

/// Everything one dashboard frame shows
#[derive(Debug, Clone, PartialEq)]
pub struct LiveStatus {
    pub session_id: String,
    pub title: String,
    pub interactions: usize,
    pub total_tokens: u64,
    pub model_id: String,
    pub tokens: TokenCounts,
    pub cost: CostBreakdown,
    pub cache_hit_rate: f64,
    pub context_used: u64,
    pub context_limit: u64,
    pub burn_rate: f64,
    pub cost_per_hour: f64,
    pub recent: RecentActivity,
    pub budget: Option<BudgetHealth>,
    pub alerts: Vec<BudgetAlert>,
}

/// Assembles [`LiveStatus`] from the loader, catalog and budget tracker
pub struct StatusProvider {
    loader: Arc<SessionLoader>,
    catalog: Arc<ModelCatalog>,
    budget: BudgetTracker,
    session: Option<String>,
}

impl StatusProvider {
    pub fn new(
        loader: Arc<SessionLoader>,
        catalog: Arc<ModelCatalog>,
        budget: BudgetTracker,
        session: Option<&str>,
    ) -> Self {
        Self {
            loader,
            catalog,
            budget,
            session: session.map(normalize_session_id),
        }
    }

    pub fn status(&self) -> Result<Option<LiveStatus>> {
        self.status_at(now_millis())
    }

    /// `None` when there is no session to show yet
    pub fn status_at(&self, now: Millis) -> Result<Option<LiveStatus>> {
        let index = self.loader.index();
        if !index.data_dir().is_dir() {
            bail!("Data directory disappeared: {}", index.data_dir().display());
        }
        index.reload();

        let id = match &self.session {
            Some(id) => id.clone(),
            None => match index.most_recent() {
                Some(entry) => entry.id,
                None => return Ok(None),
            },
        };

        // loads into the active slot, which recent_activity reads from
        let Some(session) = self.loader.load_session(&id) else {
            return Ok(None);
        };

        let model_id = session.model.qualified();
        let metrics =
            calculate_session_metrics(&self.catalog, &session.token_breakdown(), &model_id);
        let context_limit = self
            .catalog
            .find_model(&model_id)
            .and_then(|m| m.context_limit())
            .unwrap_or(DEFAULT_CONTEXT_LIMIT);
        let recent = self
            .loader
            .recent_activity_at(&id, ACTIVITY_WINDOW_MINUTES, now);
        let burn = burn_rate(&recent, ACTIVITY_WINDOW_MINUTES);
        let budget = self.budget.budget_health_at(now);
        let alerts = self.budget.alerts_with(budget.as_ref(), now);

        Ok(Some(LiveStatus {
            session_id: session.id.clone(),
            title: session.title.clone(),
            interactions: session.message_count,
            total_tokens: session.tokens_used,
            model_id: metrics.model_id,
            tokens: metrics.tokens,
            cost: metrics.cost,
            cache_hit_rate: metrics.cache_hit_rate,
            context_used: session.context_used,
            context_limit,
            burn_rate: burn,
            cost_per_hour: if burn > 0.0 {
                recent.cost_per_minute * 60.0
            } else {
                0.0
            },
            recent,
            budget,
            alerts,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

/// What a single tick produced
pub enum Frame<'a> {
    Status(&'a LiveStatus),
    NoSession,
    Error(&'a str),
}

/// Poll, render, sleep until the running flag drops
pub struct LiveMonitor {
    refresh: Duration,
    state: MonitorState,
    running: Arc<AtomicBool>,
}

impl LiveMonitor {
    pub fn new(refresh_secs: u64) -> Result<Self> {
        Ok(Self::with_refresh(refresh_interval(refresh_secs)?))
    }

    fn with_refresh(refresh: Duration) -> Self {
        Self {
            refresh,
            state: MonitorState::Idle,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn refresh(&self) -> Duration {
        self.refresh
    }

    /// Flag to clear from a signal handler
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Render once right away, then every refresh interval. A failed fetch
    /// is rendered as an error frame and the loop carries on.
    pub fn run<F, R>(&mut self, mut fetch: F, mut render: R) -> Result<()>
    where
        F: FnMut() -> Result<Option<LiveStatus>>,
        R: FnMut(Frame<'_>) -> Result<()>,
    {
        if self.state != MonitorState::Idle {
            return Ok(());
        }
        self.state = MonitorState::Running;
        self.running.store(true, Ordering::SeqCst);

        loop {
            match fetch() {
                Ok(Some(status)) => render(Frame::Status(&status))?,
                Ok(None) => render(Frame::NoSession)?,
                Err(e) => {
                    debug!("live tick failed: {:#}", e);
                    render(Frame::Error(&format!("{:#}", e)))?;
                }
            }
            if !self.sleep() {
                break;
            }
        }

        self.state = MonitorState::Stopped;
        Ok(())
    }

    /// Sleep in short slices so an interrupt is noticed promptly
    fn sleep(&self) -> bool {
        let deadline = Instant::now() + self.refresh;
        while Instant::now() < deadline {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
        self.running.load(Ordering::SeqCst)
    }
}

pub struct LiveOptions {
    pub refresh_secs: u64,
    pub session: Option<String>,
    pub show_progress: bool,
}

/// Wire the loader, watcher and budget tracker together and monitor until
/// interrupted
pub fn start(
    data_dir: &Path,
    catalog: Arc<ModelCatalog>,
    budget: BudgetConfig,
    options: LiveOptions,
) -> Result<()> {
    let mut monitor = LiveMonitor::new(options.refresh_secs)?;
    let index = Arc::new(SessionIndex::init(data_dir));
    let loader = Arc::new(SessionLoader::new(Arc::clone(&index), Arc::clone(&catalog)));
    let tracker = BudgetTracker::new(loader.clone(), Arc::clone(&catalog), budget);
    let provider = StatusProvider::new(
        Arc::clone(&loader),
        catalog,
        tracker,
        options.session.as_deref(),
    );

    print_info("Starting live monitoring...");
    println!("{}", format!("Refresh interval: {}s", options.refresh_secs).dimmed());
    println!("{}", "Press Ctrl+C to stop".dimmed());
    if options.session.is_none() {
        let recent = index.recent_sessions(RECENT_SESSIONS_SHOWN);
        if !recent.is_empty() {
            println!(
                "{}",
                "Recent sessions (use --session <id> to monitor a specific one):".cyan()
            );
            for (i, entry) in recent.iter().enumerate() {
                let marker = if i == 0 { "[ACTIVE] " } else { "         " };
                println!(
                    "  {}{}: {}",
                    marker,
                    entry.id,
                    to_local(entry.mtime).format("%H:%M:%S")
                );
            }
        }
    }
    println!();

    let mut watcher = watch_sessions(data_dir, loader.active_slot());

    let running = monitor.running_flag();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })?;

    hide_cursor();
    let show_progress = options.show_progress;
    let refresh = monitor.refresh();
    let result = monitor.run(
        || provider.status(),
        |frame| {
            let width = terminal_size()
                .map(|(Width(w), _)| w as usize)
                .unwrap_or(80);
            clear_screen();
            print!("{}", render_frame(&frame, refresh, width, show_progress, now_millis()));
            io::stdout().flush()?;
            Ok(())
        },
    );

    if let Some(watcher) = watcher.as_mut() {
        watcher.stop();
    }
    show_cursor();
    println!();
    println!("{}", "Live monitoring stopped.".yellow());
    result
}

/// File watching only speeds up cache invalidation; the monitor still
/// polls without it, e.g. before the first message has been written
fn watch_sessions(data_dir: &Path, slot: ActiveSlot) -> Option<SessionWatcher> {
    match SessionWatcher::start(
        data_dir,
        slot,
        Box::new(|id| debug!(session_id = %id, "session changed, refreshing")),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Continuing without file watching: {}", e);
            None
        }
    }
}

/// The full text of one frame
pub fn render_frame(
    frame: &Frame<'_>,
    refresh: Duration,
    width: usize,
    show_progress: bool,
    now: Millis,
) -> String {
    let mut out = String::new();
    render_header(&mut out, width, now);
    match frame {
        Frame::Status(status) => {
            render_session(&mut out, status, width);
            if show_progress {
                render_context(&mut out, status, width);
            }
            render_activity(&mut out, status, width);
            if let Some(health) = &status.budget {
                render_budget(&mut out, health, width, show_progress);
            }
            render_alerts(&mut out, &status.alerts, width);
        }
        Frame::NoSession => {
            out.push_str(&format!("{}\n\n", "No active sessions found".red()));
        }
        Frame::Error(message) => render_error_box(&mut out, message, width),
    }
    render_footer(&mut out, width, refresh);
    out
}

fn section(out: &mut String, title: colored::ColoredString, width: usize) {
    out.push_str(&format!("{}\n", title));
    out.push_str(&format!("{}\n", "─".repeat(width).bright_black()));
}

fn render_header(out: &mut String, width: usize, now: Millis) {
    let title = " OCSIGHT LIVE ";
    let padding = width.saturating_sub(title.len()) / 2;
    out.push_str(&format!("{}\n", "═".repeat(width).bright_cyan()));
    out.push_str(&format!("{}{}\n", " ".repeat(padding), title.bright_white().bold()));
    out.push_str(&format!("{}\n", "═".repeat(width).bright_cyan()));
    out.push_str(&format!(
        "Updated: {}\n\n",
        to_local(now).format("%H:%M:%S").to_string().bright_yellow()
    ));
}

fn render_session(out: &mut String, status: &LiveStatus, width: usize) {
    section(out, "CURRENT SESSION".bright_green().bold(), width);
    out.push_str(&format!(
        "{} {}\n",
        status.session_id.bright_white().bold(),
        format!("({})", status.title).dimmed()
    ));
    out.push_str(&format!("Model: {}\n", status.model_id.yellow()));
    out.push_str(&format!(
        "Interactions: {} | Tokens: {} | Cost: {}\n",
        format_number(status.interactions as u64),
        format_tokens(status.total_tokens),
        format_cost(status.cost.total).bright_green()
    ));

    let rows = [
        ("Input", status.tokens.input, status.cost.input),
        ("Output", status.tokens.output, status.cost.output),
        ("Reasoning", status.tokens.reasoning, status.cost.reasoning),
        ("Cache writes", status.tokens.cache.write, status.cost.cache_write),
        ("Cache reads", status.tokens.cache.read, status.cost.cache_read),
    ];
    for (label, tokens, cost) in rows.iter().filter(|(_, tokens, _)| *tokens > 0) {
        out.push_str(&format!(
            "   {:<13}{} ({})\n",
            label,
            format_tokens(*tokens),
            format_cost(*cost)
        ));
    }

    let hit = format!("{:.1}%", status.cache_hit_rate * 100.0);
    let hit = if status.cache_hit_rate > 0.7 {
        hit.green()
    } else if status.cache_hit_rate > 0.3 {
        hit.yellow()
    } else {
        hit.red()
    };
    out.push_str(&format!("   Cache hit rate: {}\n\n", hit));
}

fn render_context(out: &mut String, status: &LiveStatus, width: usize) {
    section(out, "CONTEXT WINDOW".bright_cyan().bold(), width);
    let pct = safe_ratio(status.context_used as f64, status.context_limit as f64) * 100.0;
    out.push_str(&format!(
        "{} {} / {} tokens\n\n",
        threshold_color(progress_bar(pct, BAR_WIDTH), pct),
        format_number(status.context_used),
        format_number(status.context_limit)
    ));
}

fn render_activity(out: &mut String, status: &LiveStatus, width: usize) {
    section(out, "ACTIVITY".bright_yellow().bold(), width);
    if status.burn_rate > 0.0 {
        out.push_str(&format!(
            "Rate: {} tokens/min (${:.4}/hr)\n",
            format_number(status.burn_rate.round() as u64).bright_red(),
            status.cost_per_hour
        ));
    } else {
        out.push_str(&format!("Rate: {}\n", "IDLE".dimmed()));
    }
    if status.recent.last_message_time > 0 {
        out.push_str(&format!(
            "{}\n",
            format!(
                "Last activity: {} ({} tokens in the last {} min)",
                format_time_ago(status.recent.time_since_last),
                format_number(status.recent.tokens),
                ACTIVITY_WINDOW_MINUTES
            )
            .dimmed()
        ));
    }
    out.push('\n');
}

fn render_budget(out: &mut String, health: &BudgetHealth, width: usize, show_progress: bool) {
    section(out, "MONTHLY BUDGET".bright_magenta().bold(), width);
    let line = format!(
        "${:.2} / ${:.2} ({:.1}%) {}",
        health.spent,
        health.limit,
        health.percentage,
        status_label(health.status)
    );
    if show_progress {
        out.push_str(&format!(
            "{} {}\n",
            threshold_color(progress_bar(health.percentage, BAR_WIDTH), health.percentage),
            line
        ));
    } else {
        out.push_str(&format!("{}\n", line));
    }
    if let Some(days) = health.days_remaining {
        out.push_str(&format!("Runway: {:.1} days at the recent pace\n", days));
    }
    out.push('\n');
}

fn render_alerts(out: &mut String, alerts: &[BudgetAlert], width: usize) {
    let shown: Vec<&BudgetAlert> = alerts
        .iter()
        .filter(|a| a.level != AlertLevel::Info)
        .collect();
    if shown.is_empty() {
        return;
    }
    section(out, "ALERTS".bright_red().bold(), width);
    for alert in shown {
        let line = match alert.level {
            AlertLevel::Critical => alert.message.bright_red(),
            _ => alert.message.bright_yellow(),
        };
        out.push_str(&format!("{}\n", line));
    }
    out.push('\n');
}

fn render_error_box(out: &mut String, message: &str, width: usize) {
    let inner = width.saturating_sub(4).max(10);
    out.push_str(&format!("{}\n", format!("┌{}┐", "─".repeat(inner + 2)).red()));
    for line in wrap(&format!("Error updating live display: {}", message), inner) {
        out.push_str(&format!("{} {:<inner$} {}\n", "│".red(), line, "│".red()));
    }
    out.push_str(&format!("{}\n\n", format!("└{}┘", "─".repeat(inner + 2)).red()));
}

fn render_footer(out: &mut String, width: usize, refresh: Duration) {
    out.push_str(&format!("{}\n", "─".repeat(width).bright_black()));
    out.push_str(&format!(
        "{} | {}\n",
        "Ctrl+C to stop".dimmed(),
        format!("Refresh: {}s", refresh.as_secs()).dimmed()
    ));
}

fn status_label(status: BudgetStatus) -> colored::ColoredString {
    let label = status.to_string().to_uppercase();
    match status {
        BudgetStatus::Healthy => label.green(),
        BudgetStatus::Warning => label.yellow(),
        BudgetStatus::Critical => label.red(),
        BudgetStatus::Exceeded => label.bright_red().bold(),
    }
}

fn threshold_color(text: String, pct: f64) -> colored::ColoredString {
    if pct >= 90.0 {
        text.red()
    } else if pct >= 70.0 {
        text.yellow()
    } else {
        text.green()
    }
}

fn progress_bar(pct: f64, width: usize) -> String {
    let filled = ((pct.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(width.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn format_time_ago(ms: Millis) -> String {
    let seconds = ms.max(0) / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    if hours > 0 {
        format!("{}h {}m ago", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m {}s ago", minutes, seconds % 60)
    } else {
        format!("{}s ago", seconds)
    }
}

fn clear_screen() {
    print!("\x1B[2J\x1B[1;1H");
    let _ = io::stdout().flush();
}

fn hide_cursor() {
    print!("\x1B[?25l");
    let _ = io::stdout().flush();
}

fn show_cursor() {
    print!("\x1B[?25h");
    let _ = io::stdout().flush();
}
