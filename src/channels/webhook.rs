//! Generic JSON webhook channel.
//!
//! Inbound: `POST /channels/<path>` with
//! `{"conversation_id": "...", "text": "...", "reply_url": "...", "sender": "..."}`.
//! Outbound: each reply is POSTed as JSON to the `reply_url` plugin setting.
//! A per-message `reply_url` is only honored when the request was
//! authenticated with the configured `secret`, or when its host is listed in
//! the `allowed_reply_hosts` setting; otherwise the message is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::channel::{
    ChannelCapabilities, ChannelFactory, ChannelMeta, ChannelPlugin, InboundAck, InboundMessage,
    InboundRequest, OutboundReply, PluginContext,
};
use crate::error::ChannelError;
use crate::extensions::CHANNEL_CONTRACT_VERSION;

/// Entry point name of the bundled webhook channel.
pub const WEBHOOK_ENTRY_POINT: &str = "webhook";

const DEFAULT_PATH: &str = "/webhook";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    conversation_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    reply_url: Option<String>,
    #[serde(default)]
    sender: Option<String>,
}

pub struct WebhookChannel {
    meta: ChannelMeta,
    reply_url: Option<String>,
    /// Shared secret expected in the `x-webhook-secret` header.
    secret: Option<String>,
    /// Hosts a per-message `reply_url` may point at without a secret.
    allowed_reply_hosts: Vec<String>,
    http: reqwest::Client,
}

impl WebhookChannel {
    pub fn from_context(context: PluginContext) -> Self {
        let path = context.setting_str("path").unwrap_or(DEFAULT_PATH).to_string();
        Self {
            meta: ChannelMeta {
                id: context.plugin_id.clone(),
                name: "Webhook".to_string(),
                inbound_path: path,
                description: "Generic JSON webhook".to_string(),
            },
            reply_url: context.setting_str("reply_url").map(str::to_string),
            secret: context.setting_str("secret").map(str::to_string),
            allowed_reply_hosts: context
                .settings
                .get("allowed_reply_hosts")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|h| h.as_str())
                .map(str::to_ascii_lowercase)
                .collect(),
            http: context.http,
        }
    }

    fn parse(&self, request: &InboundRequest) -> Result<InboundAck, ChannelError> {
        if let Some(secret) = &self.secret
            && request.headers.get("x-webhook-secret") != Some(secret)
        {
            return Err(ChannelError::InvalidMessage(
                "missing or wrong webhook secret".to_string(),
            ));
        }
        let payload: WebhookPayload = serde_json::from_slice(&request.body)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        if payload.conversation_id.trim().is_empty() {
            return Err(ChannelError::InvalidMessage(
                "conversation_id cannot be empty".to_string(),
            ));
        }
        if payload.text.trim().is_empty() {
            return Ok(InboundAck::Ignore {
                reason: "empty text".to_string(),
            });
        }
        let reply_to = match payload.reply_url {
            Some(url) => Some(self.check_reply_url(&url)?),
            None => None,
        };
        Ok(InboundAck::Dispatch(InboundMessage {
            external_id: payload.conversation_id,
            text: payload.text,
            sender: payload.sender,
            reply_to,
        }))
    }

    /// Per-message reply targets must be http(s) and trusted: either the
    /// sender proved the secret or the host is explicitly allowed.
    fn check_reply_url(&self, raw: &str) -> Result<String, ChannelError> {
        let url = url::Url::parse(raw)
            .map_err(|e| ChannelError::InvalidMessage(format!("invalid reply_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ChannelError::InvalidMessage(format!(
                "reply_url scheme '{}' is not allowed",
                url.scheme()
            )));
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if self.secret.is_none() && !self.allowed_reply_hosts.contains(&host) {
            tracing::warn!(channel = %self.meta.id, host = %host, "Rejected untrusted reply_url");
            return Err(ChannelError::InvalidMessage(format!(
                "reply_url host '{host}' is not allowed"
            )));
        }
        Ok(url.into())
    }
}

#[async_trait]
impl ChannelPlugin for WebhookChannel {
    fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::default()
    }

    async fn accept(&self, request: InboundRequest) -> Result<InboundAck, ChannelError> {
        self.parse(&request)
    }

    async fn send(&self, reply: OutboundReply) -> Result<(), ChannelError> {
        let url = reply
            .reply_to
            .clone()
            .or_else(|| self.reply_url.clone())
            .ok_or_else(|| ChannelError::SendFailed {
                name: self.meta.id.clone(),
                reason: "no reply_url for this conversation".to_string(),
            })?;

        let response = self
            .http
            .post(&url)
            .json(&reply)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChannelError::SendFailed {
                name: self.meta.id.clone(),
                reason: format!("reply endpoint returned {}", response.status()),
            });
        }
        tracing::debug!(external_id = %reply.external_id, kind = ?reply.kind, "Webhook reply delivered");
        Ok(())
    }

    async fn start(&self) -> Result<(), ChannelError> {
        tracing::info!(path = %self.meta.inbound_path, "Webhook channel ready");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        if let Some(url) = &self.reply_url {
            url::Url::parse(url).map_err(|e| ChannelError::HealthCheckFailed {
                name: self.meta.id.clone(),
                reason: format!("invalid reply_url: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Factory registered under [`WEBHOOK_ENTRY_POINT`].
pub struct WebhookFactory;

impl ChannelFactory for WebhookFactory {
    fn contract(&self) -> &str {
        CHANNEL_CONTRACT_VERSION
    }

    fn create(&self, context: PluginContext) -> Result<Arc<dyn ChannelPlugin>, ChannelError> {
        if let Some(url) = context.setting_str("reply_url") {
            url::Url::parse(url)
                .map_err(|e| ChannelError::InvalidMessage(format!("invalid reply_url: {e}")))?;
        }
        Ok(Arc::new(WebhookChannel::from_context(context)))
    }
}
