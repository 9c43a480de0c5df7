use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    agent::{AgentProvider, AgentRequest},
    budget::{BudgetGate, RateGate},
    circuit::CircuitRegistry,
    cleanup::{CleanupKind, CleanupManager},
    config::Config,
    db::Store,
    error::Error,
    feedback::feedback_prompt,
    git::Git,
    host::{HostClient, IssueRef},
    locks::RepoLocks,
    retry::{retry, retry_with_rate_limit, RetryOptions},
    types::{EngineReport, FeedbackItem, Issue, IssueState, SessionStatus, WorkingCopyStatus},
    watchdog::{with_watchdog, TimeoutHook},
    worktrees::WorktreeManager,
};

/// Circuit labels, one per class of upstream I/O.
pub const CIRCUIT_AGENT: &str = "ai-provider";
pub const CIRCUIT_HOST: &str = "github-api";
pub const CIRCUIT_GIT: &str = "git-operations";

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Run everything except push and proposal creation.
    pub dry_run: bool,
    /// Per-issue spend cap; overrides the configured default.
    pub max_budget_usd: Option<f64>,
    /// Estimated cost handed to the budget gate at admission.
    pub estimated_cost_usd: Option<f64>,
}

/// Drives one issue end-to-end: admission, workspace prepare, agent drive,
/// verify, publish, cleanup. On return either a proposal exists upstream and
/// the session is completed, or the session is failed with a specific error —
/// and in both cases every resource is released.
pub struct Engine {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub provider: Arc<dyn AgentProvider>,
    pub host: Arc<dyn HostClient>,
    pub worktrees: Arc<WorktreeManager>,
    pub cleanup: Arc<CleanupManager>,
    pub circuits: Arc<CircuitRegistry>,
    pub repo_locks: Arc<RepoLocks>,
    budget_gate: BudgetGate,
    rate_gate: RateGate,
}

/// Per-session append-only log under `logs/sessions/`.
struct SessionLog {
    path: String,
}

impl SessionLog {
    fn new(logs_dir: &str, op: &str, session_id: i64) -> Self {
        let dir = format!("{logs_dir}/sessions");
        std::fs::create_dir_all(&dir).ok();
        let ts = Utc::now().format("%Y%m%dT%H%M%S");
        Self { path: format!("{dir}/{op}-{ts}-{session_id}.log") }
    }

    fn log(&self, stage: &str, msg: &str) {
        let line = format!("{} [{stage}] {msg}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        if let Ok(mut f) =
            std::fs::OpenOptions::new().create(true).append(true).open(&self.path)
        {
            let _ = f.write_all(line.as_bytes());
        }
    }
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        provider: Arc<dyn AgentProvider>,
        host: Arc<dyn HostClient>,
        worktrees: Arc<WorktreeManager>,
        cleanup: Arc<CleanupManager>,
        circuits: Arc<CircuitRegistry>,
        repo_locks: Arc<RepoLocks>,
    ) -> Self {
        let budget_gate =
            BudgetGate::new(Arc::clone(&store), config.daily_budget_usd, config.monthly_budget_usd);
        let rate_gate = RateGate::new(
            Arc::clone(&store),
            config.max_prs_per_day,
            config.max_prs_per_project_per_day,
        );
        Self {
            store,
            config,
            provider,
            host,
            worktrees,
            cleanup,
            circuits,
            repo_locks,
            budget_gate,
            rate_gate,
        }
    }

    fn retry_opts(&self) -> RetryOptions {
        RetryOptions::default()
    }

    /// Retry + circuit breaker around one class of upstream I/O.
    async fn guarded<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let breaker = self.circuits.get(label);
        let opts = self.retry_opts();
        let wrapped = || {
            let breaker = Arc::clone(&breaker);
            let fut = f();
            async move { breaker.call(|| fut).await }
        };
        // Host APIs send retry-after on rate limits; honor it there.
        if label == CIRCUIT_HOST {
            retry_with_rate_limit(label, &opts, cancel, wrapped).await
        } else {
            retry(label, &opts, cancel, wrapped).await
        }
    }

    fn branch_for(&self, number: i64) -> String {
        format!("remedy/issue-{number}")
    }

    /// Run a blocking git operation off the executor, bounded by the
    /// version-control timeout.
    async fn git_blocking<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let timeout = Duration::from_millis(self.config.git_timeout_ms);
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(anyhow::Error::new(Error::Unknown(format!(
                "{operation}: worker died: {join}"
            )))),
            Err(_) => Err(anyhow::Error::new(Error::Timeout {
                operation: operation.to_string(),
                elapsed_ms: self.config.git_timeout_ms,
            })),
        }
    }

    fn git_author(&self) -> Option<(&str, &str)> {
        if self.config.git_author_name.is_empty() {
            None
        } else {
            Some((self.config.git_author_name.as_str(), self.config.git_author_email.as_str()))
        }
    }

    // ── Admission ─────────────────────────────────────────────────────────

    /// Gate checks and issue registration. Runs before any session exists.
    async fn admit(
        &self,
        issue_url: &str,
        opts: &EngineOptions,
        cancel: &CancellationToken,
    ) -> Result<(Issue, IssueRef)> {
        let issue_ref = self.host.parse_issue_url(issue_url)?;
        let project = issue_ref.project();

        if !self.config.repo_allowed(&project) {
            return Err(anyhow::Error::new(Error::Configuration(format!(
                "repository {project} is not in the allowlist"
            ))));
        }

        let decision = self.budget_gate.can_proceed(opts.estimated_cost_usd)?;
        if !decision.can_proceed {
            return Err(anyhow::Error::new(Error::BudgetExceeded(
                decision.reason.unwrap_or_else(|| "budget exhausted".into()),
            )));
        }
        let decision = self.rate_gate.can_publish(&project)?;
        if !decision.can_proceed {
            return Err(anyhow::Error::new(Error::RateLimited {
                reason: decision.reason.unwrap_or_else(|| "publish rate exhausted".into()),
                retry_after_ms: decision.next_available.map(|at| {
                    (at - Utc::now()).num_milliseconds().max(0) as u64
                }),
            }));
        }

        let remote = self
            .guarded(CIRCUIT_HOST, cancel, || {
                let host = Arc::clone(&self.host);
                let issue_ref = issue_ref.clone();
                async move { host.get_issue(&issue_ref).await }
            })
            .await
            .context("fetch issue from host")?;

        let mut issue = match self.store.get_issue_by_url(issue_url)? {
            Some(existing) => existing,
            None => {
                let new = Issue {
                    id: 0,
                    host: "github".into(),
                    project: project.clone(),
                    number: issue_ref.number,
                    url: issue_url.to_string(),
                    title: remote.title.clone(),
                    body: remote.body.clone(),
                    labels: remote.labels.clone(),
                    author: remote.author.clone(),
                    assignee: remote.assignee.clone(),
                    state: IssueState::Discovered,
                    pr_url: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                let id = self.store.save_issue(&new)?;
                self.store.get_issue(id)?.ok_or_else(|| {
                    anyhow::Error::new(Error::Storage(format!("issue {id} not readable back")))
                })?
            }
        };
        // Refresh mutable fields on re-runs.
        issue.title = remote.title;
        issue.body = remote.body;
        issue.labels = remote.labels;
        self.store.save_issue(&issue)?;

        if issue.state == IssueState::Discovered {
            self.store.transition_issue(issue.id, IssueState::Queued, None, None)?;
            issue.state = IssueState::Queued;
        }
        if issue.state == IssueState::Queued {
            self.store.transition_issue(issue.id, IssueState::InProgress, None, None)?;
            issue.state = IssueState::InProgress;
        }
        if issue.state != IssueState::InProgress {
            return Err(anyhow::Error::new(Error::InvalidTransition {
                entity: "issue",
                from: issue.state.as_str().to_string(),
                to: IssueState::InProgress.as_str().to_string(),
            }));
        }

        Ok((issue, issue_ref))
    }

    // ── Workspace ─────────────────────────────────────────────────────────

    /// Mirror update + fresh working copy, under the repo lock. Registers the
    /// copy with the cleanup manager and returns (copy path, cleanup task id,
    /// base ref).
    async fn prepare_workspace(
        &self,
        issue: &Issue,
        issue_ref: &IssueRef,
        cancel: &CancellationToken,
        log: &SessionLog,
    ) -> Result<(String, u64, String)> {
        let project = issue_ref.project();
        let mirror = self.worktrees.mirror_path(&project);
        let remote_url = self.host.remote_url(&project);
        let branch = self.branch_for(issue.number);

        let base = self
            .repo_locks
            .with_repo_lock(&mirror, || async {
                self.guarded(CIRCUIT_GIT, cancel, || {
                    let mirror = mirror.clone();
                    let remote_url = remote_url.clone();
                    async move {
                        self.git_blocking("git-fetch", move || {
                            Git::new(mirror).ensure_mirror(&remote_url)
                        })
                        .await
                    }
                })
                .await?;

                let git = Git::new(mirror.clone());
                let base = format!("origin/{}", git.default_branch()?);
                let copy = self.worktrees.create(
                    &git,
                    &project,
                    &issue.url,
                    issue.number,
                    &branch,
                    &base,
                )?;
                log.log("prepare", &format!("working copy at {} (base {base})", copy.path));
                Ok::<String, anyhow::Error>(base)
            })
            .await?;

        let copy_path = self.worktrees.copy_path(&project, issue.number);
        let worktrees = Arc::clone(&self.worktrees);
        let mirror_for_cleanup = mirror.clone();
        let path_for_cleanup = copy_path.clone();
        let task_id = self.cleanup.register(
            CleanupKind::Worktree,
            format!("working copy {copy_path}"),
            10,
            move || {
                let git = Git::new(mirror_for_cleanup.clone());
                worktrees.remove(&git, &path_for_cleanup)
            },
        );

        Ok((copy_path, task_id, base))
    }

    // ── Agent drive ───────────────────────────────────────────────────────

    /// One watchdogged agent call. Adds the cost delta to the session and the
    /// ledger before returning, so later budget decisions see in-flight
    /// spend. `max_budget_usd` is the caller's per-issue override; the
    /// tighter of it and the configured cap bounds every call, fix-loop
    /// retries included.
    #[allow(clippy::too_many_arguments)]
    async fn drive_agent(
        &self,
        session_id: i64,
        prompt: String,
        cwd: String,
        max_budget_usd: Option<f64>,
        cancel: &CancellationToken,
        log: &SessionLog,
    ) -> Result<crate::agent::AgentOutcome> {
        let agent_cancel = cancel.child_token();
        let timeout_cancel = agent_cancel.clone();
        let on_timeout: TimeoutHook = Arc::new(move |ctx| {
            error!(
                "agent for session stalled (started {}, last beat {}), killing",
                ctx.started_at, ctx.last_heartbeat
            );
            timeout_cancel.cancel();
        });

        // A caller override tightens the configured cap, never widens it.
        let cap = match max_budget_usd {
            Some(requested) => requested.min(self.config.per_issue_budget_usd),
            None => self.config.per_issue_budget_usd,
        };

        let store = Arc::clone(&self.store);
        let provider = Arc::clone(&self.provider);
        let request = AgentRequest {
            prompt,
            cwd,
            max_turns: self.config.max_turns,
            timeout_ms: self.config.agent_timeout_ms,
            max_budget_usd: Some(cap),
            resume_session: None,
        };

        let started = std::time::Instant::now();
        let outcome = with_watchdog(
            CIRCUIT_AGENT,
            Duration::from_millis(self.config.agent_timeout_ms),
            on_timeout,
            Some(format!("session-{session_id}")),
            |beat| {
                let agent_cancel = agent_cancel.clone();
                let store = Arc::clone(&store);
                async move {
                    // Every provider heartbeat resets the watchdog and
                    // refreshes the session's last-activity timestamp.
                    let session_beat: crate::watchdog::HeartbeatFn = Arc::new(move || {
                        beat();
                        let _ = store.touch_session(session_id);
                    });
                    provider.query(request, session_beat, agent_cancel).await
                }
            },
        )
        .await;

        let timed_out = agent_cancel.is_cancelled() && !cancel.is_cancelled();
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                if timed_out || cancel.is_cancelled() {
                    return Err(anyhow::Error::new(Error::Timeout {
                        operation: CIRCUIT_AGENT.into(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }));
                }
                return Err(e.context("agent query"));
            }
        };

        self.store.update_session_metrics(session_id, outcome.cost_delta_usd, outcome.turns)?;
        self.store.record_cost(session_id, outcome.cost_delta_usd)?;
        log.log(
            "agent",
            &format!(
                "turns={} cost_delta={} success={}",
                outcome.turns, outcome.cost_delta_usd, outcome.success
            ),
        );

        if timed_out || cancel.is_cancelled() {
            return Err(anyhow::Error::new(Error::Timeout {
                operation: CIRCUIT_AGENT.into(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }));
        }
        if !outcome.success {
            return Err(anyhow::Error::new(Error::AgentProvider(
                outcome.error.clone().unwrap_or_else(|| "agent reported failure".into()),
            )));
        }

        // Per-issue budget, checked against in-flight spend.
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| anyhow::Error::new(Error::NotFound(format!("session {session_id}"))))?;
        if session.cost_usd > cap {
            return Err(anyhow::Error::new(Error::BudgetExceeded(format!(
                "session spend {} exceeds per-issue cap {cap}",
                session.cost_usd
            ))));
        }

        Ok(outcome)
    }

    // ── Verify ────────────────────────────────────────────────────────────

    /// Commit, bound the diff, and run local tests with a bounded fix loop.
    #[allow(clippy::too_many_arguments)]
    async fn verify(
        &self,
        issue: &Issue,
        session_id: i64,
        mirror: &str,
        copy_path: &str,
        base: &str,
        max_budget_usd: Option<f64>,
        cancel: &CancellationToken,
        log: &SessionLog,
    ) -> Result<()> {
        let git = Git::new(mirror);
        let commit_msg = format!("{} (#{})", issue.title, issue.number);
        let changed = git.commit_all(copy_path, &commit_msg, self.git_author())?;
        if !changed && git.diff_stat(copy_path, base)?.files == 0 {
            return Err(anyhow::Error::new(Error::AgentProvider(
                "agent made no changes".into(),
            )));
        }

        let stat = git.diff_stat(copy_path, base)?;
        log.log("verify", &format!("diff: {} files, {} lines", stat.files, stat.lines));
        if stat.files > self.config.max_diff_files {
            return Err(anyhow::Error::new(Error::Unknown(format!(
                "diff touches {} files (limit {})",
                stat.files, self.config.max_diff_files
            ))));
        }
        if stat.lines > self.config.max_diff_lines {
            return Err(anyhow::Error::new(Error::Unknown(format!(
                "diff spans {} lines (limit {})",
                stat.lines, self.config.max_diff_lines
            ))));
        }

        if self.config.test_cmd.is_empty() {
            return Ok(());
        }

        let mut last_failure = String::new();
        for attempt in 0..=self.config.max_test_fix_iterations {
            let output = run_shell(&self.config.test_cmd, copy_path).await?;
            if output.exit_code == 0 {
                log.log("verify", &format!("tests passed (attempt {})", attempt + 1));
                return Ok(());
            }
            last_failure = format!("{}\n{}", output.stdout, output.stderr);
            log.log("verify", &format!("tests failed (attempt {})", attempt + 1));
            if attempt == self.config.max_test_fix_iterations {
                break;
            }

            let fix_prompt = format!(
                "The test command `{}` fails in this working copy. Fix the \
                 failures with minimal changes; do not weaken or delete tests.\n\n\
                 Test output:\n```\n{}\n```",
                self.config.test_cmd,
                tail(&last_failure, 4_000),
            );
            self.drive_agent(session_id, fix_prompt, copy_path.to_string(), max_budget_usd, cancel, log)
                .await?;
            git.commit_all(copy_path, &format!("fix tests for #{}", issue.number), self.git_author())?;
        }

        Err(anyhow::Error::new(Error::AgentProvider(format!(
            "tests still failing after {} fix iteration(s): {}",
            self.config.max_test_fix_iterations,
            tail(&last_failure, 500),
        ))))
    }

    // ── Publish ───────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        issue: &Issue,
        issue_ref: &IssueRef,
        session_id: i64,
        mirror: &str,
        copy_path: &str,
        base_branch: &str,
        cancel: &CancellationToken,
        log: &SessionLog,
    ) -> Result<String> {
        let project = issue_ref.project();
        let branch = self.branch_for(issue.number);
        let title = format!("{} (#{})", issue.title, issue.number);
        let body = format!(
            "Automated change for {}.\n\nCloses #{}.",
            issue.url, issue.number
        );

        let pr = self
            .repo_locks
            .with_repo_lock(mirror, || async {
                self.guarded(CIRCUIT_GIT, cancel, || {
                    let mirror = mirror.to_string();
                    let copy_path = copy_path.to_string();
                    let branch = branch.clone();
                    async move {
                        self.git_blocking("git-push", move || {
                            Git::new(mirror).push_branch(&copy_path, &branch)
                        })
                        .await
                    }
                })
                .await?;

                self.guarded(CIRCUIT_HOST, cancel, || {
                    let host = Arc::clone(&self.host);
                    let project = project.clone();
                    let branch = branch.clone();
                    let base_branch = base_branch.to_string();
                    let title = title.clone();
                    let body = body.clone();
                    async move {
                        host.create_proposal(&project, &branch, &base_branch, &title, &body).await
                    }
                })
                .await
            })
            .await?;

        self.store.set_session_pr_url(session_id, &pr.url)?;
        self.store.set_issue_pr_url(issue.id, &pr.url)?;
        self.store
            .transition_issue(issue.id, IssueState::PrCreated, None, Some(session_id))?;
        self.store.record_proposal(&project, session_id, &pr.url)?;
        log.log("publish", &format!("proposal {}", pr.url));
        info!("issue {} published as {}", issue.url, pr.url);
        Ok(pr.url)
    }

    // ── Failure disposition ───────────────────────────────────────────────

    fn settle_failed_issue(&self, issue_id: i64, err: &anyhow::Error) {
        let retryable = crate::error::is_retryable(err);
        let target = if self.config.abandon_on_failure {
            IssueState::Abandoned
        } else if retryable
            || matches!(
                err.downcast_ref::<Error>(),
                Some(Error::CircuitOpen { .. }) | Some(Error::AgentProvider(_))
            )
        {
            IssueState::Queued
        } else {
            return; // leave the issue in its last legal state
        };
        if let Err(e) =
            self.store.transition_issue(issue_id, target, Some(&err.to_string()), None)
        {
            warn!("could not settle issue {issue_id} after failure: {e}");
        }
    }

    /// Release the working copy and its cleanup registration. Always runs.
    fn release_workspace(&self, mirror: &str, copy_path: &str, task_id: u64, ok: bool) {
        let status = if ok { WorkingCopyStatus::Completed } else { WorkingCopyStatus::Failed };
        self.worktrees.mark_status(copy_path, status);
        let git = Git::new(mirror);
        match self.worktrees.remove(&git, copy_path) {
            Ok(()) => {
                self.cleanup.unregister(task_id);
            }
            Err(e) => {
                // The registered cleanup task stays behind and retries later.
                warn!("failed to remove working copy {copy_path}: {e}");
            }
        }
    }

    // ── Entry points ──────────────────────────────────────────────────────

    /// Full pipeline for one issue.
    pub async fn run_on_issue(
        &self,
        issue_url: &str,
        opts: EngineOptions,
        cancel: CancellationToken,
    ) -> Result<EngineReport> {
        let (issue, issue_ref) = self.admit(issue_url, &opts, &cancel).await?;
        let project = issue_ref.project();
        let mirror = self.worktrees.mirror_path(&project);
        let copy_path = self.worktrees.copy_path(&project, issue.number);

        let session_id = self.store.create_session(
            issue.id,
            self.provider.name(),
            self.provider.model(),
            &copy_path,
        )?;
        let log = SessionLog::new(&self.config.logs_dir(), "work", session_id);
        log.log("admission", &format!("issue {} session {session_id}", issue.url));

        let result = self
            .run_pipeline(&issue, &issue_ref, session_id, &mirror, &opts, &cancel, &log)
            .await;

        match result {
            Ok(pr_url) => {
                self.store.transition_session(session_id, SessionStatus::Completed, None)?;
                let session = self.store.get_session(session_id)?.ok_or_else(|| {
                    anyhow::Error::new(Error::Storage(format!("session {session_id} lost")))
                })?;
                Ok(EngineReport {
                    issue_url: issue.url.clone(),
                    session_id,
                    pr_url,
                    cost_usd: session.cost_usd,
                    turns: session.turns,
                })
            }
            Err(err) => {
                let kind = err
                    .downcast_ref::<Error>()
                    .map(Error::kind)
                    .unwrap_or("unknown");
                log.log("failed", &format!("[{kind}] {err}"));
                if let Err(e) = self.store.transition_session(
                    session_id,
                    SessionStatus::Failed,
                    Some(&format!("[{kind}] {err}")),
                ) {
                    warn!("failed to fail session {session_id}: {e}");
                }
                self.settle_failed_issue(issue.id, &err);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        issue: &Issue,
        issue_ref: &IssueRef,
        session_id: i64,
        mirror: &str,
        opts: &EngineOptions,
        cancel: &CancellationToken,
        log: &SessionLog,
    ) -> Result<Option<String>> {
        let (copy_path, cleanup_id, base) =
            self.prepare_workspace(issue, issue_ref, cancel, log).await?;

        let inner: Result<Option<String>> = async {
            let prompt = build_issue_prompt(issue);
            let outcome = self
                .drive_agent(
                    session_id,
                    prompt,
                    copy_path.clone(),
                    opts.max_budget_usd,
                    cancel,
                    log,
                )
                .await?;
            log.log("agent", &tail(&outcome.output, 500));

            self.verify(
                issue,
                session_id,
                mirror,
                &copy_path,
                &base,
                opts.max_budget_usd,
                cancel,
                log,
            )
            .await?;

            if opts.dry_run {
                log.log("publish", "dry run, skipping push and proposal");
                self.store.transition_issue(
                    issue.id,
                    IssueState::Queued,
                    Some("dry run"),
                    Some(session_id),
                )?;
                return Ok(None);
            }

            let base_branch = base.strip_prefix("origin/").unwrap_or(&base).to_string();
            let pr_url = self
                .publish(issue, issue_ref, session_id, mirror, &copy_path, &base_branch, cancel, log)
                .await?;
            Ok(Some(pr_url))
        }
        .await;

        self.release_workspace(mirror, &copy_path, cleanup_id, inner.is_ok());
        inner
    }

    /// Feedback-driven iteration on an existing proposal.
    pub async fn iterate(
        &self,
        pr_url: &str,
        items: &[FeedbackItem],
        cancel: CancellationToken,
    ) -> Result<EngineReport> {
        let issue = self.store.get_issue_by_pr_url(pr_url)?.ok_or_else(|| {
            anyhow::Error::new(Error::NotFound(format!("no issue tracks proposal {pr_url}")))
        })?;
        let issue_ref = self.host.parse_issue_url(&issue.url)?;
        let project = issue_ref.project();
        let mirror = self.worktrees.mirror_path(&project);
        let branch = self.branch_for(issue.number);

        if issue.state == IssueState::PrCreated {
            self.store
                .transition_issue(issue.id, IssueState::AwaitingFeedback, None, None)?;
        }
        self.store.transition_issue(
            issue.id,
            IssueState::Iterating,
            Some("actionable feedback"),
            None,
        )?;

        let copy_path = self.worktrees.copy_path(&project, issue.number);
        let session_id = self.store.create_session(
            issue.id,
            self.provider.name(),
            self.provider.model(),
            &copy_path,
        )?;
        let log = SessionLog::new(&self.config.logs_dir(), "iterate", session_id);
        log.log("admission", &format!("iterating on {pr_url} with {} item(s)", items.len()));

        let result: Result<()> = async {
            let remote_url = self.host.remote_url(&project);
            self.repo_locks
                .with_repo_lock(&mirror, || async {
                    self.guarded(CIRCUIT_GIT, &cancel, || {
                        let mirror = mirror.clone();
                        let remote_url = remote_url.clone();
                        async move {
                            self.git_blocking("git-fetch", move || {
                                Git::new(mirror).ensure_mirror(&remote_url)
                            })
                            .await
                        }
                    })
                    .await?;
                    let git = Git::new(mirror.clone());
                    self.worktrees.create_on_branch(
                        &git,
                        &project,
                        &issue.url,
                        issue.number,
                        &branch,
                    )?;
                    Ok::<(), anyhow::Error>(())
                })
                .await?;

            let cleanup_id = {
                let worktrees = Arc::clone(&self.worktrees);
                let mirror = mirror.clone();
                let path = copy_path.clone();
                self.cleanup.register(
                    CleanupKind::Worktree,
                    format!("working copy {path}"),
                    10,
                    move || {
                        let git = Git::new(mirror.clone());
                        worktrees.remove(&git, &path)
                    },
                )
            };

            let inner: Result<()> = async {
                let prompt = feedback_prompt(pr_url, items);
                self.drive_agent(session_id, prompt, copy_path.clone(), None, &cancel, &log)
                    .await?;

                let git = Git::new(mirror.clone());
                git.commit_all(
                    &copy_path,
                    &format!("address review feedback (#{})", issue.number),
                    self.git_author(),
                )?;

                self.repo_locks
                    .with_repo_lock(&mirror, || async {
                        self.guarded(CIRCUIT_GIT, &cancel, || {
                            let mirror = mirror.clone();
                            let copy_path = copy_path.clone();
                            let branch = branch.clone();
                            async move {
                                self.git_blocking("git-push", move || {
                                    Git::new(mirror).push_branch(&copy_path, &branch)
                                })
                                .await
                            }
                        })
                        .await
                    })
                    .await?;
                log.log("publish", "pushed iteration");
                Ok(())
            }
            .await;

            self.release_workspace(&mirror, &copy_path, cleanup_id, inner.is_ok());
            inner
        }
        .await;

        match result {
            Ok(()) => {
                self.store
                    .transition_issue(issue.id, IssueState::PrCreated, None, Some(session_id))?;
                self.store.transition_session(session_id, SessionStatus::Completed, None)?;
                let session = self.store.get_session(session_id)?.ok_or_else(|| {
                    anyhow::Error::new(Error::Storage(format!("session {session_id} lost")))
                })?;
                Ok(EngineReport {
                    issue_url: issue.url,
                    session_id,
                    pr_url: Some(pr_url.to_string()),
                    cost_usd: session.cost_usd,
                    turns: session.turns,
                })
            }
            Err(err) => {
                let kind =
                    err.downcast_ref::<Error>().map(Error::kind).unwrap_or("unknown");
                if let Err(e) = self.store.transition_session(
                    session_id,
                    SessionStatus::Failed,
                    Some(&format!("[{kind}] {err}")),
                ) {
                    warn!("failed to fail session {session_id}: {e}");
                }
                if let Err(e) = self.store.transition_issue(
                    issue.id,
                    IssueState::AwaitingFeedback,
                    Some(&err.to_string()),
                    None,
                ) {
                    warn!("could not settle issue {} after iteration failure: {e}", issue.id);
                }
                Err(err)
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn build_issue_prompt(issue: &Issue) -> String {
    let labels = if issue.labels.is_empty() {
        String::new()
    } else {
        format!("\nLabels: {}", issue.labels.join(", "))
    };
    format!(
        "Resolve the following issue from {}.{labels}\n\n\
         # {}\n\n{}\n\n\
         Work only inside this checkout. Make the smallest change that fully \
         resolves the issue, keep the existing code style, and add or update \
         tests where the repository has them.",
        issue.url, issue.title, issue.body,
    )
}

struct ShellOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

async fn run_shell(cmd: &str, dir: &str) -> Result<ShellOutput> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .output()
        .await
        .context("run shell command")?;
    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(1),
    })
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let start = s.len() - max;
        let start = s.char_indices().map(|(i, _)| i).find(|&i| i >= start).unwrap_or(0);
        s[start..].to_string()
    }
}
