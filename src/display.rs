use crate::budget::{BudgetHealth, BudgetStatus, Forecast, MonthlySpend, ProviderBudgetStatus};
use crate::models::SessionData;
use crate::pricing::ModelData;
use crate::statistics::{Statistics, UsageTotals};
use chrono::Local;
use colored::*;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::helpers::{compare_floats, to_local};

const TOP_MODELS: usize = 10;

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    table
}

fn print_banner(title: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    println!("{}", "═".repeat(80).bright_black());
    println!(
        "{}  {}",
        title.bright_blue().bold(),
        format!("Generated {}", timestamp).dimmed()
    );
    println!("{}", "═".repeat(80).bright_black());
    println!();
}

fn print_section(title: &str) {
    println!("{}", "─".repeat(80).bright_black());
    println!("{}", title.bright_green().bold());
    println!("{}", "─".repeat(80).bright_black());
}

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing report to JSON: {}", e),
    }
}

pub fn display_summary(stats: &Statistics) {
    print_banner("OpenCode Usage Summary");

    if stats.total_sessions == 0 {
        println!("{}", "No sessions found for the selected filters".dimmed());
        return;
    }

    let avg_cost = stats.optimization.average_cost_per_session;
    let avg_tokens = stats.optimization.average_tokens_per_session;

    println!("{}", "COST & USAGE SUMMARY".bright_yellow().bold());
    println!(
        "   Sessions: {}   Messages: {}   Tools: {}",
        format_number(stats.total_sessions as u64).bright_white().bold(),
        format_number(stats.total_messages as u64),
        format_number(stats.total_tools as u64)
    );
    println!(
        "   Total Cost: {}   Total Tokens: {}",
        format_currency(stats.total_cost_usd).bright_green().bold(),
        format_number(stats.total_tokens).bright_white()
    );
    println!(
        "   Avg per session: {} / {} tokens",
        format_currency(avg_cost),
        format_number(avg_tokens.round() as u64)
    );
    println!();

    print_section("Providers");
    display_usage_table("Provider", &stats.providers);
    println!();

    print_section("Top Models");
    display_usage_table("Model", &top_by_cost(&stats.models, TOP_MODELS));
    println!();

    if !stats.top_tools.is_empty() {
        print_section("Top Tools");
        let mut table = new_table(&["Tool", "Uses"]);
        for tool in &stats.top_tools {
            table.add_row(vec![Cell::new(&tool.name), Cell::new(format_number(tool.count as u64))]);
        }
        println!("{}", table);
        println!();
    }

    let peaks_hours: Vec<String> = stats
        .time
        .peak_hours
        .iter()
        .map(|p| format!("{:02}:00 ({})", p.hour, p.count))
        .collect();
    let peak_days: Vec<String> = stats
        .time
        .peak_days
        .iter()
        .map(|p| format!("{} ({})", p.day, p.count))
        .collect();
    if !peaks_hours.is_empty() {
        println!("{} {}", "Peak hours:".bright_cyan(), peaks_hours.join(", "));
    }
    if !peak_days.is_empty() {
        println!("{} {}", "Peak days:".bright_cyan(), peak_days.join(", "));
    }

    if !stats.projects.is_empty() {
        println!();
        print_section("Projects");
        let mut table = new_table(&["Project", "Sessions", "Tokens", "Cost", "Avg Cost"]);
        for project in &stats.projects {
            table.add_row(vec![
                Cell::new(&project.name),
                Cell::new(project.session_count),
                Cell::new(format_number(project.total_tokens)),
                Cell::new(format_currency(project.total_cost_usd)),
                Cell::new(format_currency(project.average_session_cost)),
            ]);
        }
        println!("{}", table);
        if let Some(active) = &stats.comparison.most_active {
            println!("{} {}", "Most active:".dimmed(), active);
        }
        if let Some(expensive) = &stats.comparison.most_expensive {
            println!("{} {}", "Most expensive:".dimmed(), expensive);
        }
    }

    println!();
    println!("{}", "═".repeat(80).bright_black());
}

fn top_by_cost(
    usage: &BTreeMap<String, UsageTotals>,
    limit: usize,
) -> BTreeMap<String, UsageTotals> {
    let mut entries: Vec<(&String, &UsageTotals)> = usage.iter().collect();
    entries.sort_by(|a, b| compare_floats(b.1.cost_usd, a.1.cost_usd));
    entries
        .into_iter()
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn display_usage_table(label: &str, usage: &BTreeMap<String, UsageTotals>) {
    let mut rows: Vec<(&String, &UsageTotals)> = usage.iter().collect();
    rows.sort_by(|a, b| compare_floats(b.1.cost_usd, a.1.cost_usd));

    let mut table = new_table(&[label, "Sessions", "Tokens", "Cost (USD)"]);
    for (name, totals) in &rows {
        table.add_row(vec![
            Cell::new(truncate_text(name, 40)),
            Cell::new(totals.sessions),
            Cell::new(format_number(totals.tokens)),
            Cell::new(format_currency(totals.cost_usd)),
        ]);
    }
    if rows.len() > 1 {
        let sessions: usize = rows.iter().map(|(_, t)| t.sessions).sum();
        let tokens: u64 = rows.iter().map(|(_, t)| t.tokens).sum();
        let cost: f64 = rows.iter().map(|(_, t)| t.cost_usd).sum();
        table.add_row(vec![
            Cell::new("Total").fg(Color::Yellow),
            Cell::new(sessions).fg(Color::Yellow),
            Cell::new(format_number(tokens)).fg(Color::Yellow),
            Cell::new(format_currency(cost)).fg(Color::Yellow),
        ]);
    }
    println!("{}", table);
}

pub fn display_sessions_table(sessions: &[SessionData]) {
    if sessions.is_empty() {
        println!("{}", "No sessions found".dimmed());
        return;
    }

    let mut table = new_table(&[
        "Session ID",
        "Title",
        "Model",
        "Messages",
        "Tokens",
        "Cost (USD)",
        "Created",
    ]);
    for session in sessions {
        table.add_row(vec![
            Cell::new(truncate_text(&session.id, 24)),
            Cell::new(truncate_text(&session.title, 36)),
            Cell::new(truncate_text(&session.model.qualified(), 32)),
            Cell::new(session.message_count),
            Cell::new(format_number(session.tokens_used)),
            Cell::new(format_currency(session.cost_usd)),
            Cell::new(to_local(session.time.created).format("%Y-%m-%d %H:%M")),
        ]);
    }

    let tokens = sessions
        .iter()
        .fold(0u64, |acc, s| acc.saturating_add(s.tokens_used));
    let cents: i64 = sessions.iter().map(|s| s.cost_cents).sum();
    let messages: usize = sessions.iter().map(|s| s.message_count).sum();
    table.add_row(vec![
        Cell::new("Total").fg(Color::Yellow),
        Cell::new(format!("{} sessions", sessions.len())).fg(Color::Yellow),
        Cell::new("").fg(Color::Yellow),
        Cell::new(messages).fg(Color::Yellow),
        Cell::new(format_number(tokens)).fg(Color::Yellow),
        Cell::new(format_currency(cents as f64 / 100.0)).fg(Color::Yellow),
        Cell::new("").fg(Color::Yellow),
    ]);

    println!("{}", table);
}

pub fn display_costs(stats: &Statistics, daily: &[(String, f64)]) {
    print_banner("OpenCode Cost Analysis");

    println!(
        "Total: {}  ({} sessions, {} tokens)",
        format_currency(stats.total_cost_usd).bright_green().bold(),
        stats.total_sessions,
        format_number(stats.total_tokens)
    );
    println!();

    print_section("By Provider");
    display_usage_table("Provider", &stats.providers);
    println!();

    print_section("By Model");
    display_usage_table("Model", &stats.models);
    println!();

    if !daily.is_empty() {
        print_section("Daily Costs");
        let mut table = new_table(&["Date", "Cost (USD)"]);
        for (date, cost) in daily {
            let cell = Cell::new(format_currency(*cost));
            table.add_row(vec![
                Cell::new(date),
                if *cost > 0.0 { cell } else { cell.fg(Color::DarkGrey) },
            ]);
        }
        let total: f64 = daily.iter().map(|(_, c)| c).sum();
        table.add_row(vec![
            Cell::new("Total").fg(Color::Yellow),
            Cell::new(format_currency(total)).fg(Color::Yellow),
        ]);
        println!("{}", table);
        println!();
    }

    let optimization = &stats.optimization;
    if !optimization.expensive_sessions.is_empty() {
        print_section("Most Expensive Sessions");
        let mut table = new_table(&["Session ID", "Title", "Model", "Tokens", "Cost (USD)"]);
        for session in &optimization.expensive_sessions {
            table.add_row(vec![
                Cell::new(truncate_text(&session.id, 24)),
                Cell::new(truncate_text(&session.title, 36)),
                Cell::new(format!("{}/{}", session.provider, session.model)),
                Cell::new(format_number(session.tokens)),
                Cell::new(format_currency(session.cost_usd)).fg(Color::Red),
            ]);
        }
        println!("{}", table);
        println!();
    }

    if !optimization.suggestions.is_empty() {
        println!("{}", "INSIGHTS".bright_yellow().bold());
        for suggestion in &optimization.suggestions {
            println!("  • {}", suggestion);
        }
    }
}

pub fn display_models(models: &[ModelData]) {
    if models.is_empty() {
        println!("{}", "No models match the given filters".dimmed());
        return;
    }

    let mut table = new_table(&[
        "Model",
        "Name",
        "Input $/M",
        "Output $/M",
        "Cache Read $/M",
        "Context",
        "Reasoning",
        "Tools",
    ]);
    let flag = |v: Option<bool>| if v.unwrap_or(false) { "yes" } else { "-" };
    for model in models {
        let prices = model.cost.as_ref().map(|c| c.resolve());
        let price = |p: Option<f64>| p.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".into());
        table.add_row(vec![
            Cell::new(model.qualified_id()),
            Cell::new(truncate_text(&model.name, 32)),
            Cell::new(price(prices.map(|p| p.input))),
            Cell::new(price(prices.map(|p| p.output))),
            Cell::new(price(prices.map(|p| p.cache_read))),
            Cell::new(
                model
                    .context_limit()
                    .map(format_number)
                    .unwrap_or_else(|| "-".into()),
            ),
            Cell::new(flag(model.reasoning)),
            Cell::new(flag(model.tool_call)),
        ]);
    }
    println!("{}", table);
    println!("{}", format!("{} models", models.len()).dimmed());
}

fn status_cell(status: BudgetStatus) -> Cell {
    let cell = Cell::new(status.to_string().to_uppercase());
    match status {
        BudgetStatus::Healthy => cell.fg(Color::Green),
        BudgetStatus::Warning => cell.fg(Color::Yellow),
        BudgetStatus::Critical => cell.fg(Color::Red),
        BudgetStatus::Exceeded => cell.fg(Color::DarkRed),
    }
}

pub fn display_budget(
    spend: &MonthlySpend,
    health: Option<&BudgetHealth>,
    providers: &[ProviderBudgetStatus],
) {
    print_banner(&format!("Budget {}-{:02}", spend.year, spend.month));

    match health {
        Some(health) => {
            let mut table = new_table(&["Spent", "Limit", "Used", "Remaining", "Status", "Runway"]);
            table.add_row(vec![
                Cell::new(format_currency(health.spent)),
                Cell::new(format_currency(health.limit)),
                Cell::new(format!("{:.1}%", health.percentage)),
                Cell::new(format_currency(health.remaining)),
                status_cell(health.status),
                Cell::new(
                    health
                        .days_remaining
                        .map(|d| format!("{:.1} days", d))
                        .unwrap_or_else(|| "-".into()),
                ),
            ]);
            println!("{}", table);
        }
        None => {
            println!(
                "Spent this month: {}",
                format_currency(spend.total).bright_green()
            );
            println!(
                "{}",
                "No monthly limit set. Use `ocsight budget set --monthly <usd>`.".dimmed()
            );
        }
    }

    if !providers.is_empty() {
        println!();
        print_section("Provider Budgets");
        let mut table = new_table(&["Provider", "Spent", "Limit", "Used", "Status"]);
        for provider in providers {
            table.add_row(vec![
                Cell::new(&provider.name),
                Cell::new(format_currency(provider.spent)),
                Cell::new(format_currency(provider.limit)),
                Cell::new(format!("{:.1}%", provider.percentage)),
                status_cell(provider.status),
            ]);
        }
        println!("{}", table);
    }

    if !spend.by_provider.is_empty() {
        println!();
        print_section("Spend by Provider");
        let mut table = new_table(&["Provider", "Cost (USD)"]);
        for (provider, cost) in &spend.by_provider {
            table.add_row(vec![Cell::new(provider), Cell::new(format_currency(*cost))]);
        }
        println!("{}", table);
    }
}

pub fn display_forecast(forecast: &Forecast, history: &[MonthlySpend]) {
    print_banner("Budget Forecast");

    println!(
        "Day {} of {} | Active days: {} | Spent: {}",
        forecast.day_of_month,
        forecast.days_in_month,
        forecast.active_days,
        format_currency(forecast.spent).bright_green()
    );
    println!(
        "Daily average: {}{}",
        format_currency(forecast.daily_average),
        if forecast.adjusted {
            " (early-month estimate, discounted 30%)".dimmed().to_string()
        } else {
            String::new()
        }
    );
    println!(
        "Projected month-end: {}",
        format_currency(forecast.projected_total).bright_yellow().bold()
    );
    if let (Some(limit), Some(status)) = (forecast.limit, forecast.projected_status) {
        let label = status.to_string().to_uppercase();
        let label = match status {
            BudgetStatus::Healthy => label.green(),
            BudgetStatus::Warning => label.yellow(),
            _ => label.red(),
        };
        println!("Against limit {}: {}", format_currency(limit), label);
    }

    if !history.is_empty() {
        println!();
        print_section("History");
        let mut table = new_table(&["Month", "Cost (USD)"]);
        for month in history {
            table.add_row(vec![
                Cell::new(format!("{}-{:02}", month.year, month.month)),
                Cell::new(format_currency(month.total)),
            ]);
        }
        println!("{}", table);
    }
}

pub(crate) fn format_number(num: u64) -> String {
    if num == 0 {
        "0".to_string()
    } else {
        let num_str = num.to_string();
        let chars: Vec<char> = num_str.chars().collect();
        let mut result = String::new();

        for (i, c) in chars.iter().enumerate() {
            if i > 0 && (chars.len() - i) % 3 == 0 {
                result.push(',');
            }
            result.push(*c);
        }

        result
    }
}

pub(crate) fn format_currency(amount: f64) -> String {
    if amount >= 100.0 {
        format!("${:.2}", amount)
    } else {
        format!("${:.4}", amount)
    }
}

/// Char-boundary safe; session titles are free text
pub(crate) fn truncate_text(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_length.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", "Warning:".yellow(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "Error:".red(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue(), message);
}
