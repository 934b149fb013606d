//! Inbound message handling shared by every channel.
//!
//! A dispatched message either is a stop command, which interrupts the
//! conversation's session, or starts an invocation in the background. The
//! invocation's events are folded into one outbound reply per turn.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::channel::{
    ChannelBridge, ChannelPlugin, DispatchOutcome, InboundMessage, OutboundReply, ReplyKind,
};
use super::session_mapper::{ChannelSessionMapper, InvocationTicket};
use crate::agent::{AgentService, QueryRequest};
use crate::error::{ChannelError, SessionError};
use crate::stream::{CompletionStatus, StreamEvent};

/// Words that stop the running task when sent on their own.
pub const DEFAULT_STOP_KEYWORDS: &[&str] = &["stop", "cancel", "停止", "取消"];

/// Longest message (in characters, mentions removed) read as a stop command.
const MAX_STOP_COMMAND_CHARS: usize = 10;

const STOPPED_NOTICE: &str = "Stopped the current task.";
const ALREADY_ENDED_NOTICE: &str = "The task may have already finished.";
const NOTHING_TO_STOP_NOTICE: &str = "There is no running task to stop.";
const EMPTY_REPLY: &str = "The agent finished without a reply.";

/// Upper bound on one `ChannelPlugin::send`.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes channel messages through the mapper to the agent service.
pub struct ChannelDispatcher {
    agent: Arc<AgentService>,
    mapper: Arc<ChannelSessionMapper>,
    stop_keywords: Vec<String>,
}

impl ChannelDispatcher {
    pub fn new(agent: Arc<AgentService>, mapper: Arc<ChannelSessionMapper>) -> Self {
        Self {
            agent,
            mapper,
            stop_keywords: DEFAULT_STOP_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn mapper(&self) -> &Arc<ChannelSessionMapper> {
        &self.mapper
    }

    /// Short messages containing a stop keyword, ignoring `@mentions`.
    pub fn is_stop_command(&self, text: &str) -> bool {
        let stripped = text
            .split_whitespace()
            .filter(|token| !token.starts_with('@'))
            .collect::<Vec<_>>()
            .join(" ");
        if stripped.is_empty() || stripped.chars().count() > MAX_STOP_COMMAND_CHARS {
            return false;
        }
        let lowered = stripped.to_lowercase();
        self.stop_keywords.iter().any(|k| lowered.contains(k.as_str()))
    }

    async fn stop(
        &self,
        channel: &Arc<dyn ChannelPlugin>,
        message: &InboundMessage,
    ) -> DispatchOutcome {
        let external_id = &message.external_id;
        self.mapper.take_pending_questions(external_id);
        let target = self
            .mapper
            .active_session(external_id)
            .or_else(|| self.mapper.mapped_session(external_id));

        let Some(session_id) = target else {
            deliver(channel, OutboundReply::new(message, ReplyKind::Notice, NOTHING_TO_STOP_NOTICE))
                .await;
            return DispatchOutcome::NothingToStop;
        };

        match self.agent.interrupt(&session_id).await {
            Ok(()) => {
                tracing::info!(external_id = %external_id, session_id = %session_id, "Stop command interrupted session");
                let mut reply = OutboundReply::new(message, ReplyKind::Notice, STOPPED_NOTICE);
                reply.session_id = Some(session_id.clone());
                deliver(channel, reply).await;
                DispatchOutcome::Interrupted { session_id }
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Stop command found no running session");
                deliver(channel, OutboundReply::new(message, ReplyKind::Notice, ALREADY_ENDED_NOTICE))
                    .await;
                DispatchOutcome::NothingToStop
            }
        }
    }

    /// Claim the conversation and run the invocation in the background.
    ///
    /// The conversation is claimed before this returns, so messages
    /// dispatched in order preempt each other in that order.
    pub async fn spawn_invocation(
        &self,
        channel: Arc<dyn ChannelPlugin>,
        message: InboundMessage,
    ) -> JoinHandle<()> {
        let ticket = self.mapper.on_new_message(&message.external_id).await;
        let agent = Arc::clone(&self.agent);
        let mapper = Arc::clone(&self.mapper);
        tokio::spawn(run_invocation(agent, mapper, channel, message, ticket))
    }
}

#[async_trait]
impl ChannelBridge for ChannelDispatcher {
    async fn dispatch(
        &self,
        channel: Arc<dyn ChannelPlugin>,
        message: InboundMessage,
    ) -> Result<DispatchOutcome, ChannelError> {
        if message.text.trim().is_empty() {
            return Err(ChannelError::InvalidMessage("empty message text".to_string()));
        }
        if self.is_stop_command(&message.text) {
            return Ok(self.stop(&channel, &message).await);
        }
        self.spawn_invocation(channel, message).await;
        Ok(DispatchOutcome::Accepted)
    }
}

async fn run_invocation(
    agent: Arc<AgentService>,
    mapper: Arc<ChannelSessionMapper>,
    channel: Arc<dyn ChannelPlugin>,
    message: InboundMessage,
    mut ticket: InvocationTicket,
) {
    ticket.wait_for_prior().await;
    let external_id = message.external_id.as_str();
    if ticket.is_superseded() {
        tracing::debug!(external_id = %external_id, "Message superseded before it started");
        return;
    }

    let resume = mapper.resolve_or_create(external_id);
    if mapper.take_pending_questions(external_id).is_some() {
        tracing::debug!(external_id = %external_id, "Message answers a pending question");
    }

    let mut request = QueryRequest::new(message.text.clone());
    request.metadata = Some(BTreeMap::from([
        ("channel".to_string(), channel.meta().id.clone().into()),
        (
            "sender".to_string(),
            message.sender.clone().map_or(serde_json::Value::Null, Into::into),
        ),
    ]));
    if let Some(id) = &resume {
        request = request.resume(id.clone());
    }

    let mut stream = match agent.invoke(request).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(external_id = %external_id, error = %e, "Invocation rejected");
            if matches!(e, SessionError::InvalidResume { .. }) {
                mapper.reset(external_id);
            }
            ticket.release();
            deliver(&channel, OutboundReply::new(&message, ReplyKind::Error, e.to_string())).await;
            return;
        }
    };

    // A resumed session is not announced again, so claim it up front.
    if let Some(id) = &resume
        && !mapper.bind(&ticket, id)
    {
        let _ = agent.interrupt(id).await;
    }

    let mut session_id = resume;
    let mut text = String::new();
    let mut replied = false;

    while let Some(event) = stream.next().await {
        mapper.touch(external_id);
        match event {
            StreamEvent::SessionCreated { session_id: id } => {
                if !mapper.bind(&ticket, &id) {
                    tracing::debug!(session_id = %id, "Newer message arrived, stopping own session");
                    let _ = agent.interrupt(&id).await;
                }
                session_id = Some(id);
            }
            StreamEvent::Message { text: chunk } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&chunk);
            }
            StreamEvent::AskQuestion { questions } => {
                mapper.set_pending_questions(external_id, questions.clone());
                let mut body = std::mem::take(&mut text);
                if !body.is_empty() {
                    body.push_str("\n\n");
                }
                body.push_str(&format_questions(&questions));
                let mut reply = OutboundReply::new(&message, ReplyKind::Question, body);
                reply.session_id = session_id.clone();
                reply.questions = Some(questions);
                deliver(&channel, reply).await;
                replied = true;
            }
            StreamEvent::Result(stats) => {
                // The id may only arrive with the result when nothing else
                // announced it.
                if session_id.is_none()
                    && let Some(id) = &stats.session_id
                    && mapper.bind(&ticket, id)
                {
                    session_id = Some(id.clone());
                }
                // The turn is over; the next message need not wait for delivery.
                ticket.release();
                if stats.status == CompletionStatus::Interrupted {
                    tracing::info!(external_id = %external_id, "Invocation interrupted, no reply sent");
                    replied = true;
                } else if !replied {
                    let body = if !text.is_empty() {
                        std::mem::take(&mut text)
                    } else {
                        stats.result.clone().filter(|r| !r.is_empty()).unwrap_or_else(|| EMPTY_REPLY.to_string())
                    };
                    let mut reply = OutboundReply::new(&message, ReplyKind::Text, body);
                    reply.session_id = stats.session_id.clone().or_else(|| session_id.clone());
                    deliver(&channel, reply).await;
                    replied = true;
                }
            }
            StreamEvent::Error { kind, detail } => {
                tracing::warn!(external_id = %external_id, kind = %kind, detail = %detail, "Invocation failed");
                if kind == "invalid_resume" {
                    mapper.reset(external_id);
                }
                ticket.release();
                let mut reply = OutboundReply::new(
                    &message,
                    ReplyKind::Error,
                    format!("Something went wrong: {detail}"),
                );
                reply.session_id = session_id.clone();
                deliver(&channel, reply).await;
                replied = true;
            }
            StreamEvent::Heartbeat
            | StreamEvent::ToolUse { .. }
            | StreamEvent::TodosUpdate { .. } => {}
        }
    }

    ticket.release();
    if !replied {
        deliver(&channel, OutboundReply::new(&message, ReplyKind::Text, EMPTY_REPLY)).await;
    }
}

async fn deliver(channel: &Arc<dyn ChannelPlugin>, reply: OutboundReply) {
    let external_id = reply.external_id.clone();
    match tokio::time::timeout(DELIVERY_TIMEOUT, channel.send(reply)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(channel = %channel.meta().id, external_id = %external_id, error = %e, "Reply delivery failed");
        }
        Err(_) => {
            tracing::warn!(channel = %channel.meta().id, external_id = %external_id, "Reply delivery timed out");
        }
    }
}

/// Render question tool input as plain text.
pub fn format_questions(questions: &serde_json::Value) -> String {
    let mut lines = Vec::new();
    for question in questions.as_array().into_iter().flatten() {
        let prompt = question
            .get("question")
            .and_then(|q| q.as_str())
            .unwrap_or_default();
        lines.push(prompt.to_string());
        let options = question.get("options").and_then(|o| o.as_array());
        for (i, option) in options.into_iter().flatten().enumerate() {
            let label = option
                .get("label")
                .and_then(|l| l.as_str())
                .or_else(|| option.as_str())
                .unwrap_or_default();
            match option.get("description").and_then(|d| d.as_str()) {
                Some(desc) if !desc.is_empty() => lines.push(format!("  {}. {label} - {desc}", i + 1)),
                _ => lines.push(format!("  {}. {label}", i + 1)),
            }
        }
    }
    lines.join("\n")
}
