//! Agent `--output-format stream-json` protocol.
//!
//! The agent prints one JSON event per line. Two shapes matter here:
//! `assistant` events carry a message id and incremental usage, and a
//! terminal `result` event carries the answer, session id, cost and totals.

use std::collections::HashSet;

use serde::Deserialize;

use crate::types::TokenUsage;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamEvent {
    Assistant(AssistantEvent),
    Result(ResultEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantEvent {
    #[serde(default)]
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct ResultEvent {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

/// Usage object as emitted by the agent. Cache tokens count as input.
#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl RawUsage {
    fn totals(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.unwrap_or(0)
                + self.cache_creation_input_tokens.unwrap_or(0)
                + self.cache_read_input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
        }
    }
}

fn parse_event(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Running token totals for one supervised process.
///
/// Assistant events are deduplicated by message id, so an event the agent
/// re-emits is only counted once.
#[derive(Debug, Default, Clone)]
pub struct UsageAccumulator {
    usage: TokenUsage,
    seen: HashSet<String>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line. Returns true if it changed the totals or the
    /// set of seen messages.
    pub fn process_line(&mut self, line: &str) -> bool {
        let Some(StreamEvent::Assistant(event)) = parse_event(line) else {
            return false;
        };
        let Some(message) = event.message else {
            return false;
        };
        let id = match message.id {
            Some(id) if !id.is_empty() => id,
            _ => return false,
        };
        if !self.seen.insert(id) {
            return false;
        }
        if let Some(usage) = message.usage {
            self.usage = self.usage + usage.totals();
        }
        true
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn message_count(&self) -> usize {
        self.seen.len()
    }
}

/// Final outcome reported by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub result: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub usage: TokenUsage,
}

/// Extract the last `result` event from captured stdout.
pub fn parse_result(output: &str) -> Option<AgentResult> {
    output.lines().rev().find_map(|line| match parse_event(line)? {
        StreamEvent::Result(event) => Some(AgentResult {
            result: event.result.unwrap_or_default(),
            session_id: event.session_id.filter(|s| !s.is_empty()),
            cost_usd: event.total_cost_usd,
            usage: event.usage.unwrap_or_default().totals(),
        }),
        _ => None,
    })
}
