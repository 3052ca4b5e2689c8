//! Tool invocation extraction from message records
//!
//! OpenCode does not record tool calls uniformly, so several sources are
//! combined: the explicit `tools` array, fenced shell blocks in the message
//! text, known tool names mentioned in the text, and `name(...)` call
//! patterns in system prompts.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::models::{MessageRecord, ToolUsage};

const KNOWN_TOOLS: &str = "bash|read|write|glob|grep|edit|list|task|todowrite|todoread|webfetch|patch";

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:bash|tool|sh|shell|command)[ \t]*\n(.*?)\n```").expect("valid regex")
});

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\b({})\b", KNOWN_TOOLS)).expect("valid regex"));

static CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\b({})\s*\(", KNOWN_TOOLS)).expect("valid regex"));

static COMMAND_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").expect("valid regex"));

/// All tool usages attributable to one message
pub fn extract(record: &MessageRecord) -> Vec<ToolUsage> {
    let at = record.time.created;
    let mut tools = Vec::new();

    if let Some(serde_json::Value::String(text)) = &record.content {
        for caps in CODE_BLOCK.captures_iter(text) {
            let command = caps[1].trim();
            if !command.is_empty() {
                let name = command_name(command).unwrap_or_else(|| "unknown".to_string());
                tools.push(usage(name, 0, at));
            }
        }

        let mentioned: BTreeSet<String> = MENTION
            .captures_iter(text)
            .map(|c| c[1].to_lowercase())
            .collect();
        tools.extend(mentioned.into_iter().map(|name| usage(name, 0, at)));
    }

    if let Some(system) = &record.system {
        let joined = system.join(" ");
        for caps in CALL.captures_iter(&joined) {
            tools.push(usage(caps[1].to_lowercase(), 0, at));
        }
    }

    if let Some(entries) = &record.tools {
        for entry in entries {
            match entry {
                serde_json::Value::String(name) if !name.is_empty() => {
                    tools.push(usage(name.to_lowercase(), 0, at));
                }
                serde_json::Value::Object(map) => {
                    if let Some(name) = map.get("name").and_then(|n| n.as_str()) {
                        let duration = map.get("duration_ms").and_then(|d| d.as_u64()).unwrap_or(0);
                        tools.push(usage(name.to_lowercase(), duration, at));
                    }
                }
                _ => {}
            }
        }
    }

    tools
}

/// First word of a shell command, without `sudo` or a leading path
pub fn command_name(command: &str) -> Option<String> {
    let trimmed = command
        .trim()
        .trim_start_matches(['\'', '"', '`'])
        .trim_end_matches(['\'', '"', '`']);
    let trimmed = trimmed
        .strip_prefix("sudo ")
        .or_else(|| trimmed.strip_prefix("doas "))
        .unwrap_or(trimmed)
        .trim_start();

    let first = trimmed.split(|c: char| c.is_whitespace() || c == '|').next()?;
    let base = first.rsplit('/').next().unwrap_or(first);

    if COMMAND_NAME.is_match(base) {
        Some(base.to_lowercase())
    } else {
        None
    }
}

fn usage(name: String, duration_ms: u64, timestamp: i64) -> ToolUsage {
    ToolUsage {
        name,
        duration_ms,
        timestamp,
    }
}
