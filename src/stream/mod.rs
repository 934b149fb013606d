//! Typed event protocol delivered to callers.
//!
//! Every invocation produces one ordered sequence of [`StreamEvent`]s:
//! `SessionCreated` (if any) comes first, exactly one terminal event
//! (`Result` or `Error`) closes it, and nothing follows the terminal event.

mod translator;

use axum::response::sse::Event;
use serde::{Deserialize, Serialize};

pub use translator::{EventStream, StreamTranslator, TranslatorOptions};

/// Tool whose input carries the agent's task list.
pub const TODO_TOOL: &str = "TodoWrite";
/// Tool the agent uses to ask the user a question and suspend the turn.
pub const QUESTION_TOOL: &str = "AskUserQuestion";

/// One entry of the agent's task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    #[serde(rename = "activeForm", default)]
    pub active_form: String,
}

/// How an invocation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Interrupted,
}

/// Aggregate statistics carried by the terminal `Result` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultStats {
    pub session_id: Option<String>,
    pub status: CompletionStatus,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

/// Events emitted for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Heartbeat,
    SessionCreated { session_id: String },
    Message { text: String },
    ToolUse { name: String, input: serde_json::Value },
    TodosUpdate { todos: Vec<TodoItem> },
    AskQuestion { questions: serde_json::Value },
    Result(ResultStats),
    Error { kind: String, detail: String },
}

impl StreamEvent {
    pub fn error(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    /// Whether this event ends the sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error { .. })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::SessionCreated { .. } => "session_created",
            Self::Message { .. } => "assistant_message",
            Self::ToolUse { .. } => "tool_use",
            Self::TodosUpdate { .. } => "todos_update",
            Self::AskQuestion { .. } => "ask_user_question",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
        }
    }

    /// JSON payload of the event, without the name.
    pub fn payload(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Self::Heartbeat => json!({}),
            Self::SessionCreated { session_id } => json!({ "session_id": session_id }),
            Self::Message { text } => json!({ "text": text }),
            Self::ToolUse { name, input } => json!({ "name": name, "input": input }),
            Self::TodosUpdate { todos } => json!({ "todos": todos }),
            Self::AskQuestion { questions } => json!({ "questions": questions }),
            Self::Result(stats) => serde_json::to_value(stats).unwrap_or_else(|_| json!({})),
            Self::Error { kind, detail } => json!({ "kind": kind, "detail": detail }),
        }
    }

    /// Render as a server-sent event.
    pub fn to_sse(&self) -> Event {
        Event::default()
            .event(self.name())
            .json_data(self.payload())
            .unwrap_or_else(|_| Event::default().event(self.name()).data("{}"))
    }
}

/// Decode the task list from a `TodoWrite` tool input.
///
/// Returns `None` when the input does not have the expected shape.
pub fn parse_todos(input: &serde_json::Value) -> Option<Vec<TodoItem>> {
    let todos = input.get("todos")?;
    serde_json::from_value(todos.clone()).ok()
}

/// Extract a non-empty `questions` list from an `AskUserQuestion` input.
pub fn parse_questions(input: &serde_json::Value) -> Option<serde_json::Value> {
    input
        .get("questions")
        .filter(|q| q.as_array().is_some_and(|a| !a.is_empty()))
        .cloned()
}
