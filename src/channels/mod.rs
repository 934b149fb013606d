//! Channel plugins and their host-side plumbing.
//!
//! ```text
//!  POST /channels/<path>
//!        │
//!        ▼
//!  RouteTable ──▶ ChannelPlugin::accept ──▶ InboundAck::Dispatch
//!                                                 │
//!                                                 ▼
//!                      ChannelDispatcher ──▶ ChannelSessionMapper ──▶ AgentService
//!                                                 │
//!                                                 ▼
//!                                      ChannelPlugin::send(reply)
//! ```

mod channel;
mod dispatch;
mod session_mapper;
mod webhook;
mod webhook_server;

pub use channel::{
    ChannelBridge, ChannelCapabilities, ChannelFactory, ChannelMeta, ChannelPlugin,
    DispatchOutcome, InboundAck, InboundMessage, InboundRequest, OutboundReply, PluginContext,
    ReplyKind,
};
pub use dispatch::{ChannelDispatcher, DEFAULT_STOP_KEYWORDS, format_questions};
pub use session_mapper::{ChannelSessionMapper, InvocationTicket, MapperStats, MappingStats};
pub use webhook::{WEBHOOK_ENTRY_POINT, WebhookChannel, WebhookFactory};
pub use webhook_server::{RelayServer, RelayServerConfig};
