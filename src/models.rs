use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{OcsightError, Result};
use crate::tool_usage;

/// Epoch milliseconds, as written by OpenCode
pub type Millis = i64;

pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    #[serde(default)]
    pub write: u64,
    #[serde(default)]
    pub read: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache: CacheTokens,
}

impl TokenCounts {
    /// Saturates instead of overflowing on corrupt counts
    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.reasoning)
            .saturating_add(self.cache.read)
            .saturating_add(self.cache.write)
    }

    pub fn add(&mut self, other: &TokenCounts) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.reasoning = self.reasoning.saturating_add(other.reasoning);
        self.cache.write = self.cache.write.saturating_add(other.cache.write);
        self.cache.read = self.cache.read.saturating_add(other.cache.read);
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<Millis>,
}

/// `storage/session/**/ses_*.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub time: SessionTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageTime {
    pub created: Millis,
}

/// `storage/message/<sessionId>/msg_*.json`
///
/// Required fields mirror what a usable record needs: a record missing
/// `id`, `role`, `sessionID` or a numeric `time.created` fails to parse
/// and is skipped by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub role: Role,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub time: MessageTime,
    #[serde(default)]
    pub tokens: Option<TokenCounts>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(rename = "providerID", default)]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub system: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub name: String,
    pub duration_ms: u64,
    pub timestamp: Millis,
}

/// One parsed message, reduced to what reporting needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub created: Millis,
    pub tokens: TokenCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolUsage>,
}

impl MessageSummary {
    /// Only assistant turns carry billable token and cost metadata; anything
    /// recorded on other roles is dropped here so every consumer sees the
    /// same totals.
    pub fn from_record(record: MessageRecord) -> Self {
        let tools = tool_usage::extract(&record);
        let text = match &record.content {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        let billable = record.role == Role::Assistant;
        let cost = record
            .cost
            .filter(|c| billable && c.is_finite() && *c >= 0.0);

        Self {
            id: record.id,
            session_id: record.session_id,
            role: record.role,
            created: record.time.created,
            tokens: if billable {
                record.tokens.unwrap_or_default()
            } else {
                TokenCounts::default()
            },
            cost,
            model_id: record.model_id,
            provider_id: record.provider_id,
            text,
            tools,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider: UNKNOWN.to_string(),
            model: UNKNOWN.to_string(),
        }
    }
}

impl ModelRef {
    /// `provider/model`, the key format of the pricing catalog
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    pub fn is_unknown(&self) -> bool {
        self.provider == UNKNOWN && self.model == UNKNOWN
    }
}

/// A fully materialized session. Every derived field is a function of
/// `messages`; build through [`SessionData::derive`] only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub title: String,
    pub time: SessionTime,
    pub messages: Vec<MessageSummary>,
    pub message_count: usize,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub cost_cents: i64,
    pub context_used: u64,
    pub model: ModelRef,
}

impl SessionData {
    pub fn derive(
        id: String,
        title: Option<String>,
        time: SessionTime,
        mut messages: Vec<MessageSummary>,
        default_title: &str,
    ) -> Self {
        // stable: equal timestamps keep file order
        messages.sort_by_key(|m| m.created);

        let tokens_used = messages
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.tokens.total()));
        let cost_usd: f64 = messages
            .iter()
            .filter(|m| m.is_assistant())
            .filter_map(|m| m.cost)
            .sum();
        let cost_usd = if cost_usd.is_finite() { cost_usd } else { 0.0 };

        let context_used = messages
            .iter()
            .rev()
            .find(|m| m.is_assistant() && m.tokens.cache.read > 0)
            .map(|m| m.tokens.cache.read)
            .unwrap_or(0);

        let model = messages
            .iter()
            .rev()
            .find_map(|m| match (&m.provider_id, &m.model_id) {
                (Some(p), Some(id)) if m.is_assistant() => Some(ModelRef {
                    provider: p.clone(),
                    model: id.clone(),
                }),
                _ => None,
            })
            .unwrap_or_default();

        Self {
            id,
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| default_title.to_string()),
            time,
            message_count: messages.len(),
            messages,
            tokens_used,
            cost_cents: (cost_usd * 100.0).round() as i64,
            cost_usd,
            context_used,
            model,
        }
    }

    /// Token totals split by category
    pub fn token_breakdown(&self) -> TokenCounts {
        let mut totals = TokenCounts::default();
        for message in &self.messages {
            totals.add(&message.tokens);
        }
        totals
    }

    pub fn last_message_time(&self) -> Option<Millis> {
        self.messages.last().map(|m| m.created)
    }

    pub fn tool_count(&self) -> usize {
        self.messages.iter().map(|m| m.tools.len()).sum()
    }
}

/// Lightweight index entry; no message bodies are read to build it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionIndexEntry {
    pub id: String,
    pub mtime: Millis,
    pub size: u64,
    pub file_path: PathBuf,
}

/// Trailing-window aggregate for the live view
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecentActivity {
    pub messages: usize,
    pub tokens: u64,
    pub cost: f64,
    pub tokens_per_minute: f64,
    pub cost_per_minute: f64,
    pub last_message_time: Millis,
    pub time_since_last: Millis,
}

/// Read and decode one JSON record file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| OcsightError::json(path, e))
}
