//! Agent invocation service.
//!
//! Resolves the active provider once, starts the runtime, and hands the
//! runtime stream to the translator. Every path yields an event stream that
//! ends in exactly one terminal event.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::SessionError;
use crate::runtime::{AgentRuntime, InvocationRequest};
use crate::session::SessionRegistry;
use crate::stream::{EventStream, StreamEvent, StreamTranslator, TranslatorOptions};
use crate::switchboard::Switchboard;

/// One query against the agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub prompt: String,
    /// Resume this session instead of starting a new one.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Trim fields and reject requests that cannot be run.
    pub fn validate(mut self) -> Result<Self, SessionError> {
        self.prompt = self.prompt.trim().to_string();
        if self.prompt.is_empty() {
            return Err(SessionError::InvalidRequest(
                "prompt cannot be empty".to_string(),
            ));
        }
        self.session_id = self
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(tenant) = &self.tenant_id
            && tenant.trim().is_empty()
        {
            return Err(SessionError::InvalidRequest(
                "tenant_id cannot be empty".to_string(),
            ));
        }
        Ok(self)
    }

    /// Prompt text handed to the runtime.
    ///
    /// Follow-up turns pass the prompt through untouched; a new session gets
    /// its request context prepended.
    pub fn compose_prompt(&self) -> String {
        if self.session_id.is_some() {
            return self.prompt.clone();
        }
        let mut context = Vec::new();
        if let Some(skill) = &self.skill {
            context.push(format!("Skill: {skill}"));
        }
        if let Some(tenant) = &self.tenant_id {
            context.push(format!("Tenant: {}", tenant.trim()));
        }
        if let Some(language) = &self.language {
            context.push(format!("Response language: {language}"));
        }
        for (key, value) in self.metadata.iter().flatten() {
            match value {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) => context.push(format!("{key}: {s}")),
                other => context.push(format!("{key}: {other}")),
            }
        }
        if context.is_empty() {
            return self.prompt.clone();
        }
        format!("{}\n\n# Context\n{}", self.prompt, context.join("\n"))
    }
}

/// Runs queries against the agent runtime.
pub struct AgentService {
    switchboard: Arc<Switchboard>,
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn AgentRuntime>,
    translator: StreamTranslator,
}

impl AgentService {
    pub fn new(
        switchboard: Arc<Switchboard>,
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn AgentRuntime>,
        options: TranslatorOptions,
    ) -> Self {
        let translator = StreamTranslator::new(Arc::clone(&registry), options);
        Self {
            switchboard,
            registry,
            runtime,
            translator,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn switchboard(&self) -> &Arc<Switchboard> {
        &self.switchboard
    }

    /// Start one invocation.
    ///
    /// Request validation and resume conflicts are reported as errors before
    /// the runtime is touched. Once the runtime has been asked to start, all
    /// outcomes (including a failed start) arrive as stream events.
    pub async fn invoke(&self, request: QueryRequest) -> Result<EventStream, SessionError> {
        let request = request.validate()?;
        if let Some(id) = &request.session_id {
            self.registry.check_resumable(id)?;
        }

        let provider = self.switchboard.get_active();
        tracing::info!(
            provider = %provider.name,
            resume = ?request.session_id,
            skill = ?request.skill,
            "Starting invocation"
        );

        let invocation = InvocationRequest {
            prompt: request.compose_prompt(),
            provider,
            resume: request.session_id.clone(),
        };
        match self.runtime.start(invocation).await {
            Ok(stream) => Ok(self.translator.spawn(stream, request.session_id)),
            Err(e) => {
                tracing::error!(error = %e, "Runtime failed to start");
                Ok(StreamTranslator::single(StreamEvent::error(
                    "runtime_start",
                    e.to_string(),
                )))
            }
        }
    }

    /// Interrupt a running session.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), SessionError> {
        self.registry.interrupt(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::runtime::{CancelSignal, RawMessage, RunSummary, ScriptStep, ScriptedRuntime};
    use crate::switchboard::ProviderConfig;

    fn service(runtime: Arc<ScriptedRuntime>) -> AgentService {
        let switchboard = Switchboard::new(
            vec![ProviderConfig::new("p", "https://p.example", "IRONRELAY_SVC_TOKEN")],
            "p",
        )
        .unwrap();
        AgentService::new(
            Arc::new(switchboard),
            Arc::new(SessionRegistry::new()),
            runtime,
            TranslatorOptions::default(),
        )
    }

    fn script(id: &str) -> Vec<ScriptStep> {
        vec![
            ScriptStep::Emit(RawMessage::Init {
                session_id: Some(id.to_string()),
                model: None,
            }),
            ScriptStep::Emit(RawMessage::Result(RunSummary {
                session_id: Some(id.to_string()),
                ..RunSummary::default()
            })),
        ]
    }

    // --- Validation ---

    #[test]
    fn test_validate_rejects_blank_prompt() {
        assert!(matches!(
            QueryRequest::new("   ").validate(),
            Err(SessionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_validate_trims_and_drops_blank_session() {
        let mut request = QueryRequest::new("  hi  ");
        request.session_id = Some("  ".to_string());
        let request = request.validate().unwrap();
        assert_eq!(request.prompt, "hi");
        assert!(request.session_id.is_none());
    }

    #[test]
    fn test_compose_prompt_new_session_includes_context() {
        let mut request = QueryRequest::new("How many orders?");
        request.skill = Some("analytics".to_string());
        request.language = Some("English".to_string());
        request.metadata = Some(BTreeMap::from([
            ("region".to_string(), json!("eu")),
            ("skip".to_string(), serde_json::Value::Null),
        ]));
        let prompt = request.compose_prompt();
        assert!(prompt.starts_with("How many orders?"));
        assert!(prompt.contains("Skill: analytics"));
        assert!(prompt.contains("region: eu"));
        assert!(!prompt.contains("skip"));
    }

    #[test]
    fn test_compose_prompt_resume_is_verbatim() {
        let mut request = QueryRequest::new("yes").resume("s1");
        request.skill = Some("analytics".to_string());
        assert_eq!(request.compose_prompt(), "yes");
    }

    // --- Invocation ---

    #[tokio::test]
    async fn test_invoke_uses_active_provider_snapshot() {
        let runtime = Arc::new(ScriptedRuntime::with_script(script("s1")));
        let svc = service(Arc::clone(&runtime));
        let events: Vec<_> = svc.invoke(QueryRequest::new("hi")).await.unwrap().collect().await;

        assert_eq!(events.len(), 2);
        let requests = runtime.requests();
        assert_eq!(requests[0].provider.name, "p");
        assert!(requests[0].resume.is_none());
    }

    #[tokio::test]
    async fn test_runtime_start_failure_is_single_error_event() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let svc = service(runtime);
        let events: Vec<_> = svc.invoke(QueryRequest::new("hi")).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { kind, .. } if kind == "runtime_start"));
    }

    #[tokio::test]
    async fn test_resume_of_in_flight_session_rejected_before_start() {
        let runtime = Arc::new(ScriptedRuntime::with_script(script("s1")));
        let svc = service(Arc::clone(&runtime));
        svc.registry()
            .register("s1", Arc::new(CancelSignal::new()))
            .unwrap();

        let result = svc.invoke(QueryRequest::new("again").resume("s1")).await;
        assert!(matches!(result, Err(SessionError::InvalidResume { .. })));
        assert!(runtime.requests().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_unknown_session() {
        let svc = service(Arc::new(ScriptedRuntime::new()));
        assert!(matches!(
            svc.interrupt("ghost").await,
            Err(SessionError::SessionNotFound { .. })
        ));
    }
}
