//! Channel capability contract.
//!
//! A channel plugin bridges one external chat platform. The host calls
//! [`ChannelPlugin::accept`] with each raw inbound request; the plugin parses
//! it into an [`InboundMessage`] (or answers directly), and the host routes
//! the message through the session mapper and the agent. Replies flow back
//! out through [`ChannelPlugin::send`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Static description of a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMeta {
    /// Plugin id the channel was built for.
    pub id: String,
    pub name: String,
    /// Path below `/channels` that delivers inbound requests.
    pub inbound_path: String,
    pub description: String,
}

/// What a channel can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelCapabilities {
    pub send_text: bool,
    pub send_images: bool,
    pub send_cards: bool,
    pub receive_webhook: bool,
    /// Questions can be answered in a follow-up message.
    pub session_management: bool,
}

impl Default for ChannelCapabilities {
    fn default() -> Self {
        Self {
            send_text: true,
            send_images: false,
            send_cards: false,
            receive_webhook: true,
            session_management: true,
        }
    }
}

/// Raw inbound request handed to a channel.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub path: String,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn json(path: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            path: path.into(),
            body: body.to_string().into_bytes(),
            ..Self::default()
        }
    }
}

/// A parsed message from an external conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Conversation id on the external platform.
    pub external_id: String,
    pub text: String,
    /// Sender on the external platform, if known.
    #[serde(default)]
    pub sender: Option<String>,
    /// Per-message reply address, if the platform provides one.
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// How a channel handled an inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundAck {
    /// Route this message to the agent.
    Dispatch(InboundMessage),
    /// Answer the request directly (verification handshakes and the like).
    Respond(serde_json::Value),
    /// Nothing to do.
    Ignore { reason: String },
}

/// Kind of outbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Text,
    Question,
    Notice,
    Error,
}

/// A reply for one external conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundReply {
    pub external_id: String,
    pub kind: ReplyKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questions: Option<serde_json::Value>,
    #[serde(skip)]
    pub reply_to: Option<String>,
}

impl OutboundReply {
    pub fn new(message: &InboundMessage, kind: ReplyKind, text: impl Into<String>) -> Self {
        Self {
            external_id: message.external_id.clone(),
            kind,
            text: text.into(),
            session_id: None,
            questions: None,
            reply_to: message.reply_to.clone(),
        }
    }
}

/// One external chat platform integration.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    fn meta(&self) -> &ChannelMeta;

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::default()
    }

    /// Parse one raw inbound request.
    async fn accept(&self, request: InboundRequest) -> Result<InboundAck, ChannelError>;

    /// Deliver one reply to the external platform.
    async fn send(&self, reply: OutboundReply) -> Result<(), ChannelError>;

    async fn start(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// An invocation was scheduled.
    Accepted,
    /// A stop command interrupted the running session.
    Interrupted { session_id: String },
    /// A stop command found nothing to interrupt.
    NothingToStop,
}

/// Host side of the contract: routes accepted messages to the agent.
#[async_trait]
pub trait ChannelBridge: Send + Sync {
    async fn dispatch(
        &self,
        channel: Arc<dyn ChannelPlugin>,
        message: InboundMessage,
    ) -> Result<DispatchOutcome, ChannelError>;
}

/// Everything a factory needs to build one plugin instance.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_id: String,
    /// Persisted per-plugin settings.
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Shared outbound HTTP client.
    pub http: reqwest::Client,
}

impl PluginContext {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

/// Compiled-in constructor for one kind of channel.
pub trait ChannelFactory: Send + Sync {
    /// Contract version the factory implements.
    fn contract(&self) -> &str;

    fn create(&self, context: PluginContext) -> Result<Arc<dyn ChannelPlugin>, ChannelError>;
}
