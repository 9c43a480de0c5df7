use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::watchdog::HeartbeatFn;

/// One request to the external code-generation agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    /// Working copy the agent operates in.
    pub cwd: String,
    pub max_turns: u32,
    pub timeout_ms: u64,
    pub max_budget_usd: Option<f64>,
    /// Provider-side session to resume, if any.
    pub resume_session: Option<String>,
}

/// What one agent invocation produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: String,
    /// Spend for this call alone; added to the session before any further
    /// budget decision.
    pub cost_delta_usd: f64,
    pub turns: i64,
    pub provider_session: Option<String>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            cost_delta_usd: 0.0,
            turns: 0,
            provider_session: None,
            error: Some(error.into()),
        }
    }
}

/// The engine is authoritative; the provider is a tool it drives.
///
/// `query` must call `heartbeat` on every unit of progress (the engine's
/// watchdog feeds on it) and abort promptly when `cancel` fires.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn query(
        &self,
        req: AgentRequest,
        heartbeat: HeartbeatFn,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome>;

    async fn is_available(&self) -> bool;

    fn name(&self) -> &str;

    fn model(&self) -> &str;
}
