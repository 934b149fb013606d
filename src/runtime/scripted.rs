//! Scripted runtime double.
//!
//! Replays queued message scripts, one per invocation, so translator and
//! orchestration behaviour can be tested without a live agent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AgentRuntime, CancelHandle, CancelSignal, InvocationRequest, RawMessage, RuntimeStream,
};
use crate::error::RuntimeError;

/// One step of a scripted invocation.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield this message.
    Emit(RawMessage),
    /// Yield this error; the rest of the script is dropped.
    Fail(RuntimeError),
    /// Stay silent until cancelled, then end the stream.
    WaitForCancel,
    /// Pause before the next step (cut short by cancellation).
    Delay(Duration),
}

/// Runtime that plays back queued scripts in FIFO order.
#[derive(Default)]
pub struct ScriptedRuntime {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<InvocationRequest>>,
    handles: Mutex<Vec<CancelSignal>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper for a runtime with a single script.
    pub fn with_script(steps: Vec<ScriptStep>) -> Self {
        let runtime = Self::new();
        runtime.push_script(steps);
        runtime
    }

    /// Queue the script for the next invocation.
    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(steps);
    }

    /// Every request this runtime has been started with, in order.
    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the n-th started invocation was cancelled.
    pub fn was_cancelled(&self, index: usize) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .is_some_and(|h| h.is_cancelled())
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn start(
        &self,
        request: InvocationRequest,
    ) -> Result<Box<dyn RuntimeStream>, RuntimeError> {
        let steps = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| RuntimeError::Spawn("no script queued".to_string()))?;
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let cancel = CancelSignal::new();
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cancel.clone());

        Ok(Box::new(ScriptedStream {
            steps: steps.into(),
            cancel,
        }))
    }
}

struct ScriptedStream {
    steps: VecDeque<ScriptStep>,
    cancel: CancelSignal,
}

#[async_trait]
impl RuntimeStream for ScriptedStream {
    async fn produce_next(&mut self) -> Option<Result<RawMessage, RuntimeError>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.steps.pop_front()? {
                ScriptStep::Emit(message) => return Some(Ok(message)),
                ScriptStep::Fail(error) => {
                    self.steps.clear();
                    return Some(Err(error));
                }
                ScriptStep::WaitForCancel => {
                    self.cancel.cancelled().await;
                    return None;
                }
                ScriptStep::Delay(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(self.cancel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switchboard::ProviderConfig;

    fn request() -> InvocationRequest {
        InvocationRequest {
            prompt: "hi".to_string(),
            provider: Arc::new(ProviderConfig::new("p", "https://x", "TOKEN")),
            resume: None,
        }
    }

    #[tokio::test]
    async fn test_replays_steps_in_order() {
        let runtime = ScriptedRuntime::with_script(vec![
            ScriptStep::Emit(RawMessage::AssistantText { text: "a".into() }),
            ScriptStep::Emit(RawMessage::AssistantText { text: "b".into() }),
        ]);
        let mut stream = runtime.start(request()).await.unwrap();
        let first = stream.produce_next().await.unwrap().unwrap();
        let second = stream.produce_next().await.unwrap().unwrap();
        assert_eq!(first, RawMessage::AssistantText { text: "a".into() });
        assert_eq!(second, RawMessage::AssistantText { text: "b".into() });
        assert!(stream.produce_next().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_drops_remaining_steps() {
        let runtime = ScriptedRuntime::with_script(vec![
            ScriptStep::Fail(RuntimeError::Io("pipe closed".into())),
            ScriptStep::Emit(RawMessage::AssistantText { text: "never".into() }),
        ]);
        let mut stream = runtime.start(request()).await.unwrap();
        assert!(stream.produce_next().await.unwrap().is_err());
        assert!(stream.produce_next().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_cancel_ends_on_cancel() {
        let runtime = ScriptedRuntime::with_script(vec![ScriptStep::WaitForCancel]);
        let mut stream = runtime.start(request()).await.unwrap();
        let handle = stream.cancel_handle();
        let next = tokio::spawn(async move { stream.produce_next().await.is_none() });
        handle.cancel().await;
        assert!(next.await.unwrap());
        assert!(runtime.was_cancelled(0));
    }

    #[tokio::test]
    async fn test_start_without_script_fails() {
        let runtime = ScriptedRuntime::new();
        assert!(matches!(
            runtime.start(request()).await,
            Err(RuntimeError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn test_records_requests() {
        let runtime = ScriptedRuntime::new();
        runtime.push_script(vec![]);
        runtime.push_script(vec![]);
        let _ = runtime.start(request()).await.unwrap();
        let mut second = request();
        second.resume = Some("s1".into());
        let _ = runtime.start(second).await.unwrap();

        let requests = runtime.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].resume.as_deref(), Some("s1"));
    }
}
