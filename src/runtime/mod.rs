//! Agent runtime capability.
//!
//! The reasoning runtime is opaque to the relay. It is driven through two
//! small traits: [`AgentRuntime`] starts one invocation and hands back a
//! [`RuntimeStream`], which yields raw runtime messages in order and exposes
//! a [`CancelHandle`] that the session registry can signal from elsewhere.
//!
//! ```text
//! AgentService ──start()──▶ AgentRuntime ──▶ RuntimeStream ──produce_next()──▶ StreamTranslator
//!                                                 │
//!                                          cancel_handle()
//!                                                 ▼
//!                                          SessionRegistry ◀── interrupt(id)
//! ```
//!
//! Two implementations ship with the crate: [`ProcessRuntime`] drives the
//! agent CLI over newline-delimited JSON, and [`ScriptedRuntime`] replays
//! canned message sequences for tests.

mod process;
mod scripted;
pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::RuntimeError;
use crate::switchboard::ProviderConfig;

pub use process::ProcessRuntime;
pub use scripted::{ScriptStep, ScriptedRuntime};

/// Everything the runtime needs for one invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// The user prompt for this turn.
    pub prompt: String,
    /// Provider snapshot taken once at invocation start.
    pub provider: Arc<ProviderConfig>,
    /// Session to resume, if this is a follow-up turn.
    pub resume: Option<String>,
}

/// Aggregate statistics reported by the runtime's result message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub is_error: bool,
    pub result: Option<String>,
    pub total_cost_usd: Option<f64>,
}

/// One raw message produced by the runtime, before translation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    /// Session initialisation; carries the id the runtime assigned.
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// Any other system notice.
    System { subtype: String },
    /// A block of assistant text.
    AssistantText { text: String },
    /// A tool invocation requested by the assistant.
    ToolInvocation {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Final result of the invocation.
    Result(RunSummary),
    /// An error reported in-band by the runtime.
    Error { kind: String, detail: String },
}

/// Cooperative cancellation hook for one running invocation.
#[async_trait]
pub trait CancelHandle: Send + Sync {
    /// Ask the runtime to stop producing messages. Idempotent.
    async fn cancel(&self);

    /// Whether cancellation has been requested.
    fn is_cancelled(&self) -> bool;
}

/// Ordered, lazily produced message sequence for one invocation.
#[async_trait]
pub trait RuntimeStream: Send {
    /// Next raw message; `None` once the runtime has terminated.
    async fn produce_next(&mut self) -> Option<Result<RawMessage, RuntimeError>>;

    /// Handle that stops this stream when cancelled.
    fn cancel_handle(&self) -> Arc<dyn CancelHandle>;
}

/// Starts invocations against the external agent runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn start(
        &self,
        request: InvocationRequest,
    ) -> Result<Box<dyn RuntimeStream>, RuntimeError>;
}

/// Watch-backed cancellation flag shared between a stream and its handle.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Receiver that observes the cancellation flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CancelHandle for CancelSignal {
    async fn cancel(&self) {
        self.tx.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}
