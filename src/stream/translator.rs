//! Raw runtime messages to typed events.
//!
//! One translator task runs per invocation. It owns the runtime stream,
//! pushes events into a bounded channel, and registers/releases the session
//! in the registry. Release runs on every exit path: the terminal event,
//! the consumer going away, and task abort (through the drop guard).

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    CompletionStatus, QUESTION_TOOL, ResultStats, StreamEvent, TODO_TOOL, parse_questions,
    parse_todos,
};
use crate::error::{RuntimeError, SessionError};
use crate::runtime::{CancelHandle, RawMessage, RunSummary, RuntimeStream};
use crate::session::SessionRegistry;

/// Ordered event sequence for one invocation.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

const DEFAULT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct TranslatorOptions {
    /// Emit `Heartbeat` after this much runtime silence. `None` disables.
    pub heartbeat: Option<Duration>,
    /// Capacity of the event channel.
    pub buffer: usize,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            heartbeat: None,
            buffer: DEFAULT_BUFFER,
        }
    }
}

/// Turns runtime streams into [`EventStream`]s.
#[derive(Clone)]
pub struct StreamTranslator {
    registry: Arc<SessionRegistry>,
    options: TranslatorOptions,
}

impl StreamTranslator {
    pub fn new(registry: Arc<SessionRegistry>, options: TranslatorOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// A stream holding exactly one (terminal) event.
    pub fn single(event: StreamEvent) -> EventStream {
        futures::stream::iter([event]).boxed()
    }

    /// Translate `runtime` in a background task.
    ///
    /// With `resume` set, the session is moved back to `Active` before any
    /// message is read; an invalid resume cancels the runtime and yields a
    /// single error event.
    pub fn spawn(&self, runtime: Box<dyn RuntimeStream>, resume: Option<String>) -> EventStream {
        let cancel = runtime.cancel_handle();
        let mut guard = ReleaseGuard {
            registry: Arc::clone(&self.registry),
            id: None,
        };

        if let Some(id) = &resume {
            if let Err(e) = self.registry.begin_resume(id, Arc::clone(&cancel)) {
                tracing::warn!(session_id = %id, error = %e, "Rejected resume");
                tokio::spawn(async move { cancel.cancel().await });
                return Self::single(StreamEvent::error("invalid_resume", e.to_string()));
            }
            guard.id = Some(id.clone());
        }

        let (tx, rx) = mpsc::channel(self.options.buffer.max(1));
        let run = Translation {
            registry: Arc::clone(&self.registry),
            tx,
            cancel,
            heartbeat: self.options.heartbeat,
            fresh: resume.is_none(),
            session_id: resume,
            announced: false,
            emitted: false,
            suspended: false,
            started: Instant::now(),
            guard,
        };
        tokio::spawn(run.drive(runtime));

        ReceiverStream::new(rx).boxed()
    }
}

/// Releases the session from the registry when dropped.
struct ReleaseGuard {
    registry: Arc<SessionRegistry>,
    id: Option<String>,
}

impl ReleaseGuard {
    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.release(&id);
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}

enum Step {
    Raw(Option<Result<RawMessage, RuntimeError>>),
    ConsumerGone,
}

/// Whether translation continues after handling one message.
enum Flow {
    Continue,
    Done,
}

struct Translation {
    registry: Arc<SessionRegistry>,
    tx: mpsc::Sender<StreamEvent>,
    cancel: Arc<dyn CancelHandle>,
    heartbeat: Option<Duration>,
    /// No session id was supplied by the caller.
    fresh: bool,
    session_id: Option<String>,
    /// `SessionCreated` has been emitted.
    announced: bool,
    /// A non-heartbeat event has been emitted.
    emitted: bool,
    /// An `AskQuestion` suspended the turn.
    suspended: bool,
    started: Instant,
    guard: ReleaseGuard,
}

impl Translation {
    async fn drive(mut self, mut runtime: Box<dyn RuntimeStream>) {
        loop {
            let step = self.next_step(runtime.as_mut()).await;
            let flow = match step {
                Step::ConsumerGone => {
                    tracing::info!(
                        session_id = ?self.session_id,
                        "Event consumer went away, cancelling runtime"
                    );
                    self.cancel.cancel().await;
                    Flow::Done
                }
                Step::Raw(None) => self.on_end().await,
                Step::Raw(Some(Err(e))) => {
                    tracing::warn!(session_id = ?self.session_id, error = %e, "Runtime stream failed");
                    self.finish(StreamEvent::error(e.kind(), e.to_string()))
                        .await
                }
                Step::Raw(Some(Ok(message))) => {
                    tracing::debug!(session_id = ?self.session_id, message = ?message, "Runtime message");
                    self.on_message(message).await
                }
            };
            if matches!(flow, Flow::Done) {
                break;
            }
        }
        self.guard.release();
    }

    /// Wait for the next runtime message, emitting heartbeats meanwhile.
    async fn next_step(&self, runtime: &mut dyn RuntimeStream) -> Step {
        let next = runtime.produce_next();
        tokio::pin!(next);
        loop {
            let beat = async {
                match self.heartbeat {
                    Some(interval) if self.announced || !self.fresh => {
                        tokio::time::sleep(interval).await
                    }
                    _ => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                raw = &mut next => return Step::Raw(raw),
                _ = self.tx.closed() => return Step::ConsumerGone,
                _ = beat => {
                    if self.tx.send(StreamEvent::Heartbeat).await.is_err() {
                        return Step::ConsumerGone;
                    }
                }
            }
        }
    }

    async fn emit(&mut self, event: StreamEvent) -> Flow {
        self.emitted = true;
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel().await;
            return Flow::Done;
        }
        Flow::Continue
    }

    /// Release the session, then deliver the terminal event.
    async fn finish(&mut self, event: StreamEvent) -> Flow {
        debug_assert!(event.is_terminal());
        self.guard.release();
        if self.tx.send(event).await.is_err() {
            tracing::debug!(session_id = ?self.session_id, "Terminal event dropped, consumer gone");
        }
        Flow::Done
    }

    async fn announce(&mut self, id: &str) -> Flow {
        self.session_id = Some(id.to_string());
        self.announced = true;
        self.emit(StreamEvent::SessionCreated {
            session_id: id.to_string(),
        })
        .await
    }

    async fn on_message(&mut self, message: RawMessage) -> Flow {
        match message {
            RawMessage::Init { session_id, model } => {
                if !self.fresh || self.announced {
                    return Flow::Continue;
                }
                let Some(id) = session_id else {
                    tracing::warn!("Init message without a session id");
                    return Flow::Continue;
                };
                tracing::info!(session_id = %id, model = ?model, "Session created");
                if let Flow::Done = self.announce(&id).await {
                    return Flow::Done;
                }
                match self.registry.register(&id, Arc::clone(&self.cancel)) {
                    Ok(()) => {
                        self.guard.id = Some(id);
                        Flow::Continue
                    }
                    Err(e @ SessionError::DuplicateSession { .. }) => {
                        tracing::error!(session_id = %id, "Runtime reused a live session id");
                        self.cancel.cancel().await;
                        self.finish(StreamEvent::error("duplicate_session", e.to_string()))
                            .await
                    }
                    Err(e) => {
                        self.cancel.cancel().await;
                        self.finish(StreamEvent::error("session", e.to_string()))
                            .await
                    }
                }
            }
            RawMessage::System { subtype } => {
                tracing::debug!(subtype = %subtype, "System message");
                Flow::Continue
            }
            RawMessage::AssistantText { text } => {
                if self.suspended {
                    return Flow::Continue;
                }
                self.emit(StreamEvent::Message { text }).await
            }
            RawMessage::ToolInvocation { name, input, .. } => {
                if self.suspended {
                    return Flow::Continue;
                }
                self.on_tool(name, input).await
            }
            RawMessage::Result(summary) => self.on_result(summary).await,
            RawMessage::Error { kind, detail } => {
                self.finish(StreamEvent::Error { kind, detail }).await
            }
        }
    }

    async fn on_tool(&mut self, name: String, input: serde_json::Value) -> Flow {
        if name == TODO_TOOL {
            if let Some(todos) = parse_todos(&input) {
                tracing::info!(count = todos.len(), "Task list updated");
                return self.emit(StreamEvent::TodosUpdate { todos }).await;
            }
            tracing::warn!("Unparseable task list, forwarding as tool use");
        } else if name == QUESTION_TOOL
            && let Some(questions) = parse_questions(&input)
        {
            let flow = self.emit(StreamEvent::AskQuestion { questions }).await;
            self.suspended = true;
            match &self.session_id {
                Some(id) => {
                    if let Err(e) = self.registry.mark_awaiting_input(id) {
                        tracing::warn!(session_id = %id, error = %e, "Could not suspend session");
                    }
                }
                None => tracing::warn!("Question asked before the session id was known"),
            }
            return flow;
        }
        self.emit(StreamEvent::ToolUse { name, input }).await
    }

    /// `SessionCreated` must open the sequence, so a session first named by
    /// the result is only announced when nothing else has gone out yet.
    /// Otherwise the id travels in the result stats alone.
    async fn on_result(&mut self, summary: RunSummary) -> Flow {
        if self.fresh
            && !self.announced
            && !self.emitted
            && let Some(id) = summary.session_id.clone()
        {
            tracing::debug!(session_id = %id, "No init message, announcing session from result");
            if let Flow::Done = self.announce(&id).await {
                return Flow::Done;
            }
        }
        let status = if self.cancel.is_cancelled() {
            CompletionStatus::Interrupted
        } else {
            CompletionStatus::Completed
        };
        let stats = ResultStats {
            session_id: summary.session_id.or_else(|| self.session_id.clone()),
            status,
            duration_ms: summary.duration_ms,
            num_turns: summary.num_turns,
            is_error: summary.is_error,
            result: summary.result,
            total_cost_usd: summary.total_cost_usd,
        };
        tracing::info!(
            session_id = ?stats.session_id,
            status = ?stats.status,
            duration_ms = stats.duration_ms,
            num_turns = stats.num_turns,
            "Invocation finished"
        );
        self.finish(StreamEvent::Result(stats)).await
    }

    async fn on_end(&mut self) -> Flow {
        if self.cancel.is_cancelled() {
            let stats = ResultStats {
                session_id: self.session_id.clone(),
                status: CompletionStatus::Interrupted,
                duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                num_turns: 0,
                is_error: false,
                result: None,
                total_cost_usd: None,
            };
            tracing::info!(session_id = ?self.session_id, "Invocation interrupted");
            return self.finish(StreamEvent::Result(stats)).await;
        }
        tracing::warn!(session_id = ?self.session_id, "Runtime ended without a result");
        self.finish(StreamEvent::error(
            "incomplete_stream",
            "runtime ended without a result",
        ))
        .await
    }
}
