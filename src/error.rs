//! Error types for IronRelay.

use std::path::PathBuf;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Configuration-related errors, including provider switching.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown provider config: {name}")]
    UnknownConfig { name: String },

    #[error("Invalid provider config {name}: {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session {id} is already registered")]
    DuplicateSession { id: String },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Session {id} cannot be resumed while {state}")]
    InvalidResume { id: String, state: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Failures raised while resolving a plugin's entry point.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Entry point '{entry_point}' not found")]
    EntryPointNotFound { entry_point: String },

    #[error("Contract mismatch: {reason}")]
    ContractMismatch { reason: String },

    #[error("Plugin construction failed: {0}")]
    Construction(#[from] ChannelError),
}

/// Failures raised while wiring a plugin into the routing surface.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Inbound path {path} already owned by plugin {owner}")]
    PathConflict { path: String, owner: String },

    #[error("Invalid inbound path: {0}")]
    InvalidPath(String),
}

/// Plugin orchestration errors. Always scoped to a single plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already installed: {0}")]
    AlreadyInstalled(String),

    #[error("Invalid manifest at {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("Plugin {id} failed to load: {source}")]
    Load {
        id: String,
        #[source]
        source: LoadError,
    },

    #[error("Plugin {id} failed to register: {source}")]
    Registration {
        id: String,
        #[source]
        source: RegistrationError,
    },

    #[error("Plugin {id} failed to start: {reason}")]
    Start { id: String, reason: String },

    #[error("Plugin {id} failed to stop: {reason}")]
    Stop { id: String, reason: String },

    #[error("Plugin configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Channel health check failed: {name}: {reason}")]
    HealthCheckFailed { name: String, reason: String },

    #[error("Channel {name} is not accepting messages")]
    NotAccepting { name: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Errors produced by the agent runtime while streaming.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to spawn runtime: {0}")]
    Spawn(String),

    #[error("Runtime IO error: {0}")]
    Io(String),

    #[error("Runtime protocol error: {0}")]
    Protocol(String),

    #[error("Runtime exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
}

impl RuntimeError {
    /// Short machine-readable kind used in terminal error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "runtime_spawn",
            Self::Io(_) => "runtime_io",
            Self::Protocol(_) => "runtime_protocol",
            Self::Exited { .. } => "runtime_exited",
        }
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
