use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use remedy_core::agent::{AgentOutcome, AgentProvider, AgentRequest};
use remedy_core::watchdog::HeartbeatFn;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs the Claude Code CLI as a subprocess.
///
/// Every NDJSON line from the stream counts as progress and triggers the
/// engine's heartbeat; cancellation kills the child (`kill_on_drop`).
pub struct ClaudeProvider {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    pub model: String,
}

impl ClaudeProvider {
    pub fn new(claude_bin: impl Into<String>, model: impl Into<String>) -> Self {
        Self { claude_bin: claude_bin.into(), model: model.into() }
    }

    fn build_args(&self, req: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.model.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            req.max_turns.to_string(),
        ];
        if let Some(session) = &req.resume_session {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        args.push("--print".to_string());
        args.push(req.prompt.clone());
        args
    }
}

#[async_trait]
impl AgentProvider for ClaudeProvider {
    async fn query(
        &self,
        req: AgentRequest,
        heartbeat: HeartbeatFn,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let args = self.build_args(&req);
        info!(cwd = %req.cwd, max_turns = req.max_turns, "spawning claude subprocess");

        let mut child = Command::new(&self.claude_bin)
            .args(&args)
            .kill_on_drop(true)
            .current_dir(&req.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let mut raw_stream = String::new();
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line.context("error reading stdout")? {
                        Some(l) => {
                            heartbeat();
                            raw_stream.push_str(&l);
                            raw_stream.push('\n');
                        }
                        None => break,
                    }
                }
                line = stderr_reader.next_line() => {
                    if let Ok(Some(l)) = line {
                        if !l.is_empty() {
                            heartbeat();
                            warn!("claude stderr: {}", l);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    warn!("claude subprocess cancelled, killing");
                    let _ = child.kill().await;
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            return Ok(AgentOutcome::failed("cancelled"));
        }

        while let Ok(Some(l)) = stderr_reader.next_line().await {
            if !l.is_empty() {
                warn!("claude stderr: {}", l);
            }
        }

        let exit_status = child.wait().await.context("failed to wait for claude")?;
        let summary = crate::event::parse_stream(&raw_stream);
        let success = exit_status.success() && !summary.is_error;

        info!(
            success,
            cost_usd = summary.cost_usd,
            num_turns = summary.num_turns,
            session_id = ?summary.session_id,
            "claude subprocess finished"
        );

        Ok(AgentOutcome {
            success,
            output: summary.output,
            cost_delta_usd: summary.cost_usd,
            turns: summary.num_turns,
            provider_session: summary.session_id,
            error: if success { None } else { Some("agent exited with failure".into()) },
        })
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.claude_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn name(&self) -> &str {
        "claude"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
