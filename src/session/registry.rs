//! Session registry.
//!
//! Tracks every in-flight session by id together with the runtime's
//! cancellation handle. The map sits behind a plain mutex that is only held
//! for map mutation; runtime cancellation always happens after the guard is
//! dropped, so a slow or re-entrant `cancel()` can never stall the registry.
//!
//! ```text
//! register(id)          --> Active
//! mark_awaiting_input   --> AwaitingInput
//! interrupt(id)         --> Interrupting  (cancel() called outside the lock)
//! release(id)           --> removed, or parked if AwaitingInput
//! begin_resume(id)      --> Active again (only from AwaitingInput)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::SessionState;
use crate::error::SessionError;
use crate::runtime::CancelHandle;

struct SessionEntry {
    state: SessionState,
    /// `None` while parked between turns.
    handle: Option<Arc<dyn CancelHandle>>,
    started_at: DateTime<Utc>,
    last_transition: Instant,
}

impl SessionEntry {
    fn active(handle: Arc<dyn CancelHandle>) -> Self {
        Self {
            state: SessionState::Active,
            handle: Some(handle),
            started_at: Utc::now(),
            last_transition: Instant::now(),
        }
    }

    fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.last_transition = Instant::now();
    }
}

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// True when the session is parked waiting for a follow-up turn.
    pub parked: bool,
}

/// Registry of in-flight sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new in-flight session as `Active`.
    pub fn register(&self, id: &str, handle: Arc<dyn CancelHandle>) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        if sessions.contains_key(id) {
            return Err(SessionError::DuplicateSession { id: id.to_string() });
        }
        sessions.insert(id.to_string(), SessionEntry::active(handle));
        drop(sessions);

        tracing::debug!(session_id = %id, "Session registered");
        Ok(())
    }

    /// Check whether `id` may be resumed right now without changing anything.
    pub fn check_resumable(&self, id: &str) -> Result<(), SessionError> {
        match self.lock().get(id) {
            None => Ok(()),
            Some(entry) if entry.state == SessionState::AwaitingInput && entry.handle.is_none() => {
                Ok(())
            }
            Some(entry) => Err(SessionError::InvalidResume {
                id: id.to_string(),
                state: entry.state.to_string(),
            }),
        }
    }

    /// Start a follow-up invocation for `id`.
    ///
    /// A parked session waiting for input becomes `Active` with the new
    /// handle. An unknown id is registered fresh. Anything else is still
    /// running and cannot be resumed concurrently.
    pub fn begin_resume(
        &self,
        id: &str,
        handle: Arc<dyn CancelHandle>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        match sessions.get_mut(id) {
            None => {
                sessions.insert(id.to_string(), SessionEntry::active(handle));
            }
            Some(entry)
                if entry.state == SessionState::AwaitingInput && entry.handle.is_none() =>
            {
                entry.handle = Some(handle);
                entry.transition(SessionState::Active);
            }
            Some(entry) => {
                return Err(SessionError::InvalidResume {
                    id: id.to_string(),
                    state: entry.state.to_string(),
                });
            }
        }
        drop(sessions);

        tracing::debug!(session_id = %id, "Session resumed");
        Ok(())
    }

    /// Suspend the current turn until a follow-up invocation resumes it.
    pub fn mark_awaiting_input(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::SessionNotFound { id: id.to_string() })?;
        match entry.state {
            SessionState::Active => {
                entry.transition(SessionState::AwaitingInput);
                Ok(())
            }
            SessionState::AwaitingInput => Ok(()),
            other => Err(SessionError::InvalidResume {
                id: id.to_string(),
                state: other.to_string(),
            }),
        }
    }

    /// Remove `id`. Absent ids are a no-op; returns whether an entry existed.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "Session unregistered");
        }
        removed
    }

    /// Exit-path cleanup for an invocation.
    ///
    /// Sessions waiting for input are parked (handle dropped, state kept) so
    /// the follow-up turn can be validated; everything else is removed.
    /// Returns the state the session was in, if it was registered.
    pub fn release(&self, id: &str) -> Option<SessionState> {
        let mut sessions = self.lock();
        let state = sessions.get(id)?.state;
        if state == SessionState::AwaitingInput {
            if let Some(entry) = sessions.get_mut(id) {
                entry.handle = None;
                entry.last_transition = Instant::now();
            }
            drop(sessions);
            tracing::debug!(session_id = %id, "Session parked awaiting input");
        } else {
            sessions.remove(id);
            drop(sessions);
            tracing::debug!(session_id = %id, state = %state, "Session released");
        }
        Some(state)
    }

    /// Forward cancellation to the session's runtime handle.
    ///
    /// Interrupting a session that is already being interrupted succeeds
    /// without signalling again. A parked session has nothing to signal and
    /// is simply dropped. A concurrent `unregister` that wins the race turns
    /// the call into a harmless cancel of a finished handle.
    pub async fn interrupt(&self, id: &str) -> Result<(), SessionError> {
        let handle = {
            let mut sessions = self.lock();
            let not_found = || SessionError::SessionNotFound { id: id.to_string() };
            let entry = sessions.get_mut(id).ok_or_else(not_found)?;
            match entry.state {
                SessionState::Interrupting => return Ok(()),
                state if !state.is_interruptible() => return Err(not_found()),
                _ => {}
            }
            match entry.handle.clone() {
                Some(handle) => {
                    entry.transition(SessionState::Interrupting);
                    handle
                }
                None => {
                    sessions.remove(id);
                    drop(sessions);
                    tracing::info!(session_id = %id, "Dropped parked session on interrupt");
                    return Ok(());
                }
            }
        };

        tracing::info!(session_id = %id, "Interrupting session");
        handle.cancel().await;
        Ok(())
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.lock().get(id).map(|e| e.state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Whether `id` currently has a running invocation.
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.lock().get(id).is_some_and(|e| e.handle.is_some())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of every registered session, oldest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, e)| SessionSnapshot {
                id: id.clone(),
                state: e.state,
                started_at: e.started_at,
                parked: e.handle.is_none(),
            })
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Drop parked sessions that have waited longer than `max_idle`.
    pub fn prune_parked(&self, max_idle: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, e| e.handle.is_some() || e.last_transition.elapsed() <= max_idle);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::runtime::CancelSignal;

    fn handle() -> Arc<dyn CancelHandle> {
        Arc::new(CancelSignal::new())
    }

    /// Handle that re-enters the registry from inside `cancel()`.
    struct ReentrantHandle {
        registry: Arc<SessionRegistry>,
        id: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CancelHandle for ReentrantHandle {
        async fn cancel(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Deadlocks if the registry lock were still held.
            self.registry.unregister(&self.id);
        }

        fn is_cancelled(&self) -> bool {
            self.calls.load(Ordering::SeqCst) > 0
        }
    }

    // --- Register / unregister ---

    #[test]
    fn test_register_then_unregister_leaves_no_entry() {
        let registry = SessionRegistry::new();
        registry.register("s1", handle()).unwrap();
        assert_eq!(registry.state("s1"), Some(SessionState::Active));

        assert!(registry.unregister("s1"));
        assert!(!registry.contains("s1"));
        assert!(!registry.unregister("s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let registry = SessionRegistry::new();
        registry.register("s1", handle()).unwrap();
        let err = registry.register("s1", handle()).unwrap_err();
        assert_eq!(
            err,
            SessionError::DuplicateSession {
                id: "s1".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_register_exactly_one_wins() {
        let registry = Arc::new(SessionRegistry::new());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.register("same", handle()) })
            })
            .collect();

        let mut ok = 0;
        let mut dup = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => ok += 1,
                Err(SessionError::DuplicateSession { .. }) => dup += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(dup, 15);
    }

    // --- Interrupt ---

    #[tokio::test]
    async fn test_interrupt_absent_is_not_found() {
        let registry = SessionRegistry::new();
        registry.register("other", handle()).unwrap();

        let err = registry.interrupt("ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound { ref id } if id == "ghost"));
        assert_eq!(registry.state("other"), Some(SessionState::Active));
    }

    #[tokio::test]
    async fn test_interrupt_signals_handle() {
        let registry = SessionRegistry::new();
        let signal = CancelSignal::new();
        registry.register("s1", Arc::new(signal.clone())).unwrap();

        registry.interrupt("s1").await.unwrap();
        assert!(signal.is_cancelled());
        assert_eq!(registry.state("s1"), Some(SessionState::Interrupting));

        // Second interrupt is idempotent.
        registry.interrupt("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_does_not_hold_lock_during_cancel() {
        let registry = Arc::new(SessionRegistry::new());
        let reentrant = Arc::new(ReentrantHandle {
            registry: Arc::clone(&registry),
            id: "s1".to_string(),
            calls: AtomicUsize::new(0),
        });
        registry.register("s1", reentrant.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), registry.interrupt("s1"))
            .await
            .expect("interrupt must not deadlock")
            .unwrap();
        assert_eq!(reentrant.calls.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("s1"));
    }

    #[tokio::test]
    async fn test_interrupt_races_unregister_without_fault() {
        for _ in 0..50 {
            let registry = Arc::new(SessionRegistry::new());
            registry.register("s1", handle()).unwrap();

            let r1 = Arc::clone(&registry);
            let r2 = Arc::clone(&registry);
            let interrupt = tokio::spawn(async move { r1.interrupt("s1").await });
            let unregister = tokio::spawn(async move { r2.unregister("s1") });

            let interrupted = interrupt.await.unwrap();
            unregister.await.unwrap();
            assert!(matches!(
                interrupted,
                Ok(()) | Err(SessionError::SessionNotFound { .. })
            ));
            registry.release("s1");
            assert!(!registry.contains("s1"));
        }
    }

    // --- Awaiting input / resume ---

    #[test]
    fn test_awaiting_input_parks_on_release() {
        let registry = SessionRegistry::new();
        registry.register("s1", handle()).unwrap();
        registry.mark_awaiting_input("s1").unwrap();

        assert_eq!(registry.release("s1"), Some(SessionState::AwaitingInput));
        assert_eq!(registry.state("s1"), Some(SessionState::AwaitingInput));
        assert!(!registry.is_in_flight("s1"));
        assert!(registry.list()[0].parked);
    }

    #[test]
    fn test_resume_parked_session() {
        let registry = SessionRegistry::new();
        registry.register("s1", handle()).unwrap();
        registry.mark_awaiting_input("s1").unwrap();
        registry.release("s1");

        registry.check_resumable("s1").unwrap();
        registry.begin_resume("s1", handle()).unwrap();
        assert_eq!(registry.state("s1"), Some(SessionState::Active));
        assert!(registry.is_in_flight("s1"));
    }

    #[test]
    fn test_resume_rejected_while_active() {
        let registry = SessionRegistry::new();
        registry.register("s1", handle()).unwrap();

        let err = registry.begin_resume("s1", handle()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidResume { ref state, .. } if state == "active"));
        assert!(registry.check_resumable("s1").is_err());
    }

    #[test]
    fn test_resume_unknown_registers_fresh() {
        let registry = SessionRegistry::new();
        registry.begin_resume("old", handle()).unwrap();
        assert_eq!(registry.state("old"), Some(SessionState::Active));
    }

    #[tokio::test]
    async fn test_interrupt_parked_session_drops_it() {
        let registry = SessionRegistry::new();
        registry.register("s1", handle()).unwrap();
        registry.mark_awaiting_input("s1").unwrap();
        registry.release("s1");

        registry.interrupt("s1").await.unwrap();
        assert!(!registry.contains("s1"));
    }

    #[tokio::test]
    async fn test_interrupted_session_is_removed_on_release() {
        let registry = SessionRegistry::new();
        registry.register("s1", handle()).unwrap();
        registry.mark_awaiting_input("s1").unwrap();
        registry.interrupt("s1").await.unwrap();

        assert_eq!(registry.release("s1"), Some(SessionState::Interrupting));
        assert!(!registry.contains("s1"));
    }

    #[test]
    fn test_mark_awaiting_input_unknown() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.mark_awaiting_input("ghost"),
            Err(SessionError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_prune_parked_only_touches_parked() {
        let registry = SessionRegistry::new();
        registry.register("running", handle()).unwrap();
        registry.register("parked", handle()).unwrap();
        registry.mark_awaiting_input("parked").unwrap();
        registry.release("parked");

        assert_eq!(registry.prune_parked(Duration::from_secs(3600)), 0);
        assert_eq!(registry.prune_parked(Duration::ZERO), 1);
        assert!(registry.contains("running"));
        assert!(!registry.contains("parked"));
    }
}
