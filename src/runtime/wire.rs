//! Decoder for the agent CLI's `stream-json` output.
//!
//! Every stdout line is one JSON object tagged by `type`. An assistant
//! message may carry several content blocks; each block becomes its own
//! [`RawMessage`] so downstream ordering matches block order.

use serde::Deserialize;

use super::{RawMessage, RunSummary};
use crate::error::RuntimeError;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: WireAssistant,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireAssistant {
    #[serde(default)]
    content: Vec<WireBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Decode one stdout line into zero or more raw messages.
///
/// Blank lines and message types the relay does not translate (user echoes,
/// thinking blocks) decode to an empty list.
pub fn decode_line(line: &str) -> Result<Vec<RawMessage>, RuntimeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let message: WireMessage = serde_json::from_str(line)
        .map_err(|e| RuntimeError::Protocol(format!("undecodable line: {e}")))?;

    let decoded = match message {
        WireMessage::System {
            subtype,
            session_id,
            model,
        } => {
            if subtype == "init" {
                vec![RawMessage::Init { session_id, model }]
            } else {
                vec![RawMessage::System { subtype }]
            }
        }
        WireMessage::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(|block| match block {
                WireBlock::Text { text } => Some(RawMessage::AssistantText { text }),
                WireBlock::ToolUse { id, name, input } => {
                    Some(RawMessage::ToolInvocation { id, name, input })
                }
                WireBlock::Other => None,
            })
            .collect(),
        WireMessage::Result {
            subtype,
            is_error,
            duration_ms,
            num_turns,
            result,
            session_id,
            total_cost_usd,
        } => {
            tracing::debug!(subtype = %subtype, is_error, "Runtime result received");
            vec![RawMessage::Result(RunSummary {
                session_id,
                duration_ms,
                num_turns,
                is_error,
                result,
                total_cost_usd,
            })]
        }
        WireMessage::Error { error } => {
            let detail = match error {
                serde_json::Value::String(s) => s,
                serde_json::Value::Object(ref map) => map
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
                other => other.to_string(),
            };
            vec![RawMessage::Error {
                kind: "runtime_reported".to_string(),
                detail,
            }]
        }
        WireMessage::Other => Vec::new(),
    };

    Ok(decoded)
}
