//! External conversation to internal session mapping.
//!
//! Each external conversation id maps to at most one internal session id.
//! Only the latest inbound message of a conversation may run to completion:
//! [`ChannelSessionMapper::on_new_message`] hands out an [`InvocationTicket`]
//! and interrupts whatever invocation the previous ticket was running. The
//! new ticket must wait for the previous one to finish before it invokes the
//! agent, which gives "interrupt issued" a strict happens-before over "new
//! session created" for that conversation.
//!
//! Mappings expire after a TTL of inactivity. Expiry only forgets the
//! mapping; it never interrupts a running invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::SessionError;
use crate::session::SessionRegistry;

struct Mapping {
    internal_session_id: Option<String>,
    last_activity: Instant,
    created_at: DateTime<Utc>,
    pending_questions: Option<serde_json::Value>,
}

impl Mapping {
    fn new() -> Self {
        Self {
            internal_session_id: None,
            last_activity: Instant::now(),
            created_at: Utc::now(),
            pending_questions: None,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_activity.elapsed() > ttl
    }
}

/// The invocation currently allowed to run for one conversation.
struct InFlight {
    ticket: u64,
    session_id: Option<String>,
    superseded: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct MapperState {
    mappings: HashMap<String, Mapping>,
    in_flight: HashMap<String, InFlight>,
    next_ticket: u64,
}

/// Permission to run one invocation for an external conversation.
///
/// Dropping the ticket marks the invocation finished and unblocks the next
/// ticket for the same conversation.
pub struct InvocationTicket {
    external_id: String,
    ticket: u64,
    superseded: Arc<AtomicBool>,
    done: watch::Sender<bool>,
    prior: Option<watch::Receiver<bool>>,
    state: Arc<Mutex<MapperState>>,
}

impl InvocationTicket {
    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Wait until the previous invocation of this conversation has finished.
    pub async fn wait_for_prior(&mut self) {
        if let Some(mut prior) = self.prior.take() {
            // A closed channel means the prior ticket is gone as well.
            let _ = prior.wait_for(|done| *done).await;
        }
    }

    /// A newer message arrived for the same conversation.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    /// Mark the invocation finished and unblock the next ticket.
    ///
    /// Called once the terminal event is known, before the reply goes out,
    /// so a slow channel send never holds up the conversation. Idempotent;
    /// dropping the ticket releases it as well.
    pub fn release(&self) {
        if self.done.send_replace(true) {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .in_flight
            .get(&self.external_id)
            .is_some_and(|f| f.ticket == self.ticket)
        {
            state.in_flight.remove(&self.external_id);
        }
    }
}

impl Drop for InvocationTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-mapping view for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct MappingStats {
    pub external_id: String,
    pub internal_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub expires_in_secs: u64,
    pub pending_questions: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapperStats {
    pub ttl_secs: u64,
    pub in_flight: usize,
    pub mappings: Vec<MappingStats>,
}

/// Maps external conversation ids to internal session ids.
pub struct ChannelSessionMapper {
    registry: Arc<SessionRegistry>,
    ttl: Duration,
    state: Arc<Mutex<MapperState>>,
}

impl ChannelSessionMapper {
    pub fn new(registry: Arc<SessionRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            state: Arc::new(Mutex::new(MapperState::default())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, MapperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Internal session id for `external_id`, creating an empty mapping when
    /// none exists or the old one has expired.
    pub fn resolve_or_create(&self, external_id: &str) -> Option<String> {
        let mut state = self.lock();
        if state
            .mappings
            .get(external_id)
            .is_some_and(|m| m.is_expired(self.ttl))
        {
            state.mappings.remove(external_id);
            tracing::debug!(external_id = %external_id, "Mapping expired, starting fresh");
        }
        let mapping = state
            .mappings
            .entry(external_id.to_string())
            .or_insert_with(Mapping::new);
        mapping.last_activity = Instant::now();
        mapping.internal_session_id.clone()
    }

    /// Claim the conversation for a new inbound message.
    ///
    /// The previous invocation, if still running, is interrupted. When it has
    /// not been assigned a session id yet it is flagged as superseded and
    /// stops itself as soon as it learns its id.
    pub async fn on_new_message(&self, external_id: &str) -> InvocationTicket {
        let (done_tx, done_rx) = watch::channel(false);
        let superseded = Arc::new(AtomicBool::new(false));

        let (ticket, prior_done, prior_session) = {
            let mut state = self.lock();
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            if let Some(mapping) = state.mappings.get_mut(external_id) {
                mapping.last_activity = Instant::now();
            }
            let prior = state.in_flight.insert(
                external_id.to_string(),
                InFlight {
                    ticket,
                    session_id: None,
                    superseded: Arc::clone(&superseded),
                    done: done_rx,
                },
            );
            match prior {
                Some(prior) => {
                    prior.superseded.store(true, Ordering::SeqCst);
                    (ticket, Some(prior.done), prior.session_id)
                }
                None => (ticket, None, None),
            }
        };

        if let Some(session_id) = prior_session {
            match self.registry.interrupt(&session_id).await {
                Ok(()) => tracing::info!(
                    external_id = %external_id,
                    session_id = %session_id,
                    "Interrupted previous invocation for newer message"
                ),
                Err(SessionError::SessionNotFound { .. }) => {}
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Interrupt failed"),
            }
        }

        InvocationTicket {
            external_id: external_id.to_string(),
            ticket,
            superseded,
            done: done_tx,
            prior: prior_done,
            state: Arc::clone(&self.state),
        }
    }

    /// Record the session id the runtime assigned to `ticket`'s invocation.
    ///
    /// Returns `false` when a newer ticket has taken over the conversation;
    /// the caller must then stop its own session.
    pub fn bind(&self, ticket: &InvocationTicket, session_id: &str) -> bool {
        let mut state = self.lock();
        match state.in_flight.get_mut(&ticket.external_id) {
            Some(current) if current.ticket == ticket.ticket => {
                current.session_id = Some(session_id.to_string());
            }
            _ => return false,
        }
        let mapping = state
            .mappings
            .entry(ticket.external_id.clone())
            .or_insert_with(Mapping::new);
        mapping.internal_session_id = Some(session_id.to_string());
        mapping.last_activity = Instant::now();
        tracing::debug!(external_id = %ticket.external_id, session_id = %session_id, "Mapping bound");
        true
    }

    /// Refresh the mapping's activity clock.
    pub fn touch(&self, external_id: &str) {
        if let Some(mapping) = self.lock().mappings.get_mut(external_id) {
            mapping.last_activity = Instant::now();
        }
    }

    pub fn set_pending_questions(&self, external_id: &str, questions: serde_json::Value) {
        let mut state = self.lock();
        let mapping = state
            .mappings
            .entry(external_id.to_string())
            .or_insert_with(Mapping::new);
        mapping.pending_questions = Some(questions);
        mapping.last_activity = Instant::now();
    }

    pub fn take_pending_questions(&self, external_id: &str) -> Option<serde_json::Value> {
        self.lock()
            .mappings
            .get_mut(external_id)
            .and_then(|m| m.pending_questions.take())
    }

    /// Forget the mapping so the next message starts a fresh session.
    pub fn reset(&self, external_id: &str) -> bool {
        self.lock().mappings.remove(external_id).is_some()
    }

    /// Internal session id of the invocation currently running for
    /// `external_id`, if it has one.
    pub fn active_session(&self, external_id: &str) -> Option<String> {
        self.lock()
            .in_flight
            .get(external_id)
            .and_then(|f| f.session_id.clone())
    }

    /// Session the conversation is mapped to, running or not.
    pub fn mapped_session(&self, external_id: &str) -> Option<String> {
        self.lock()
            .mappings
            .get(external_id)
            .filter(|m| !m.is_expired(self.ttl))
            .and_then(|m| m.internal_session_id.clone())
    }

    /// Remove every expired mapping. Running invocations are untouched.
    pub fn evict_expired(&self) -> usize {
        let mut state = self.lock();
        let before = state.mappings.len();
        let ttl = self.ttl;
        state.mappings.retain(|_, m| !m.is_expired(ttl));
        before - state.mappings.len()
    }

    pub fn len(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MapperStats {
        let state = self.lock();
        let mut mappings: Vec<MappingStats> = state
            .mappings
            .iter()
            .map(|(external_id, m)| {
                let idle = m.last_activity.elapsed();
                MappingStats {
                    external_id: external_id.clone(),
                    internal_session_id: m.internal_session_id.clone(),
                    created_at: m.created_at,
                    idle_secs: idle.as_secs(),
                    expires_in_secs: self.ttl.saturating_sub(idle).as_secs(),
                    pending_questions: m.pending_questions.is_some(),
                }
            })
            .collect();
        mappings.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        MapperStats {
            ttl_secs: self.ttl.as_secs(),
            in_flight: state.in_flight.len(),
            mappings,
        }
    }

    /// Periodically evict expired mappings and prune parked sessions.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = interval.as_secs(),
                ttl_secs = self.ttl.as_secs(),
                "Mapping sweeper started"
            );
            let mut timer = tokio::time::interval(interval);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                let evicted = self.evict_expired();
                let pruned = self.registry.prune_parked(self.ttl);
                if evicted > 0 || pruned > 0 {
                    tracing::info!(evicted, pruned, "Swept idle mappings");
                }
            }
        })
    }
}
