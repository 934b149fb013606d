//! IronRelay: session and channel-plugin orchestration for agent runtimes.
//!
//! The relay sits between callers (HTTP clients and messaging channels) and
//! an opaque agent runtime. It tracks in-flight sessions so they can be
//! interrupted, switches the provider configuration used by new
//! invocations, translates runtime output into a typed event stream, and
//! runs channel plugins whose conversations map onto agent sessions.

pub mod agent;
pub mod api;
pub mod channels;
pub mod cli;
pub mod config;
pub mod error;
pub mod extensions;
pub mod hot_reload;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod switchboard;

pub use config::Config;
pub use error::{Error, Result};
