//! In-flight session tracking.

mod registry;

use serde::Serialize;

pub use registry::{SessionRegistry, SessionSnapshot};

/// State of a registered session.
///
/// A session is pending until the runtime reports its id, and it ends as
/// completed or failed once released; both are expressed by the absence of
/// a registry entry and by the terminal stream event, not by this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    AwaitingInput,
    Interrupting,
}

impl SessionState {
    /// Whether an interrupt may be issued in this state.
    pub fn is_interruptible(self) -> bool {
        matches!(self, Self::Active | Self::AwaitingInput)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::AwaitingInput => write!(f, "awaiting_input"),
            Self::Interrupting => write!(f, "interrupting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_live_states_are_interruptible() {
        assert!(SessionState::Active.is_interruptible());
        assert!(SessionState::AwaitingInput.is_interruptible());
        assert!(!SessionState::Interrupting.is_interruptible());
        assert_eq!(SessionState::AwaitingInput.to_string(), "awaiting_input");
    }
}
