//! Invocation entry point shared by the HTTP surface and channel plugins.

mod service;

pub use service::{AgentService, QueryRequest};
