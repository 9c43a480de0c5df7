use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use remedy_core::agent::{AgentOutcome, AgentProvider, AgentRequest};
use remedy_core::watchdog::HeartbeatFn;
use tokio_util::sync::CancellationToken;

/// Scripted provider for dry runs and tests.
///
/// Plays back the configured outcomes in order, repeating the last one; each
/// call touches `marker_file` in the working copy (when set) so the pipeline
/// has a real change to commit, and fires one heartbeat per call.
pub struct MockProvider {
    outcomes: Mutex<Vec<AgentOutcome>>,
    calls: AtomicUsize,
    pub marker_file: Option<String>,
    available: bool,
}

impl MockProvider {
    pub fn new(outcomes: Vec<AgentOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            calls: AtomicUsize::new(0),
            marker_file: Some("AGENT_NOTES.md".to_string()),
            available: true,
        }
    }

    /// A provider that always succeeds with a small fixed cost.
    pub fn succeeding() -> Self {
        Self::new(vec![AgentOutcome {
            success: true,
            output: "done".into(),
            cost_delta_usd: 0.05,
            turns: 3,
            provider_session: Some("mock-session".into()),
            error: None,
        }])
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn without_marker(mut self) -> Self {
        self.marker_file = None;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentProvider for MockProvider {
    async fn query(
        &self,
        req: AgentRequest,
        heartbeat: HeartbeatFn,
        _cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        heartbeat();

        if let Some(marker) = &self.marker_file {
            let path = format!("{}/{marker}", req.cwd);
            let _ = std::fs::write(path, format!("mock agent call {}\n", call + 1));
        }

        let outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = outcomes
            .get(call)
            .or_else(|| outcomes.last())
            .cloned()
            .unwrap_or_else(|| AgentOutcome::failed("mock provider has no outcomes"));
        Ok(outcome)
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }
}
