use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conflict::{predict_paths, sets_conflict};
use crate::engine::{Engine, EngineOptions};
use crate::health;
use crate::locks::FifoSemaphore;
use crate::types::{EngineReport, IssueState};

/// Outcome of one `work_parallel` run.
#[derive(Debug, Default)]
pub struct ParallelReport {
    pub completed: Vec<EngineReport>,
    /// (issue url, error line) per failed engine.
    pub failed: Vec<(String, String)>,
    /// Issues never admitted because the run was cancelled.
    pub skipped: Vec<String>,
}

struct QueuedIssue {
    url: String,
    project: String,
    predicted: BTreeSet<String>,
}

/// Schedules many engines under a global concurrency cap, a per-project cap,
/// and pre-flight file-conflict deferral. Admission is FIFO among eligible
/// issues; a blocked issue is re-evaluated whenever any engine completes.
pub struct Orchestrator {
    engine: Arc<Engine>,
    semaphore: Arc<FifoSemaphore>,
    max_per_project: usize,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>) -> Self {
        let max = engine.config.max_concurrent_agents;
        let max_per_project = engine.config.max_concurrent_per_project;
        Self { engine, semaphore: Arc::new(FifoSemaphore::new(max)), max_per_project }
    }

    /// URLs of every issue waiting in the store (discovered or queued), FIFO.
    pub fn drain_queue(&self) -> Result<Vec<String>> {
        let mut urls = Vec::new();
        for state in [IssueState::Queued, IssueState::Discovered] {
            for issue in self.engine.store.list_by_state(state)? {
                urls.push(issue.url);
            }
        }
        Ok(urls)
    }

    /// Fetch enough metadata to schedule each issue. Unfetchable issues are
    /// reported failed without ever being admitted.
    async fn prepare(
        &self,
        urls: Vec<String>,
        report: &mut ParallelReport,
    ) -> VecDeque<QueuedIssue> {
        let mut pending = VecDeque::new();
        for url in urls {
            let issue_ref = match self.engine.host.parse_issue_url(&url) {
                Ok(r) => r,
                Err(e) => {
                    warn!("work-parallel: bad issue url {url}: {e}");
                    report.failed.push((url, e.to_string()));
                    continue;
                }
            };
            // Prefer stored text; fall back to the host for fresh issues.
            let text = match self.engine.store.get_issue_by_url(&url) {
                Ok(Some(issue)) => format!("{}\n{}", issue.title, issue.body),
                _ => match self.engine.host.get_issue(&issue_ref).await {
                    Ok(remote) => format!("{}\n{}", remote.title, remote.body),
                    Err(e) => {
                        warn!("work-parallel: cannot fetch {url}: {e}");
                        report.failed.push((url, e.to_string()));
                        continue;
                    }
                },
            };
            pending.push_back(QueuedIssue {
                url,
                project: issue_ref.project(),
                predicted: predict_paths(&text),
            });
        }
        pending
    }

    fn eligible(
        &self,
        candidate: &QueuedIssue,
        per_project: &HashMap<String, usize>,
        in_flight_predictions: &HashMap<String, (String, BTreeSet<String>)>,
    ) -> bool {
        let running_in_project = per_project.get(&candidate.project).copied().unwrap_or(0);
        if running_in_project >= self.max_per_project {
            return false;
        }
        // Predictions are repo-relative paths; only same-project overlap is a
        // real conflict.
        !in_flight_predictions
            .values()
            .any(|(project, other)| {
                *project == candidate.project && sets_conflict(&candidate.predicted, other)
            })
    }

    /// Drive the given issues concurrently until all are done or the token is
    /// cancelled. Cancellation stops admission, cancels in-flight engines
    /// (which unwind their own cleanup) and resolves once all are done.
    pub async fn work_parallel(
        &self,
        urls: Vec<String>,
        opts: EngineOptions,
        cancel: CancellationToken,
    ) -> Result<ParallelReport> {
        let mut report = ParallelReport::default();
        let mut pending = self.prepare(urls, &mut report).await;
        info!("work-parallel: {} issue(s) queued", pending.len());

        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(String, String, Result<EngineReport>)>();
        let mut per_project: HashMap<String, usize> = HashMap::new();
        let mut in_flight_predictions: HashMap<String, (String, BTreeSet<String>)> =
            HashMap::new();
        let mut running = 0usize;

        loop {
            // Admit every currently eligible issue, FIFO. A degraded host
            // (provider down, disk low, worktrees full) pauses admission and
            // lets in-flight engines finish.
            let mut admission_open = !cancel.is_cancelled() && !pending.is_empty();
            if admission_open {
                let health_report = health::check(
                    &self.engine.config.data_dir,
                    &self.engine.worktrees,
                    self.engine.config.max_worktrees,
                    &self.engine.provider,
                    &self.engine.host,
                )
                .await;
                if let Some(reason) = health_report.degraded_reason() {
                    warn!("work-parallel: admission paused, {reason}");
                    admission_open = false;
                }
            }
            if admission_open {
                let mut deferred = VecDeque::new();
                while let Some(candidate) = pending.pop_front() {
                    if self.eligible(&candidate, &per_project, &in_flight_predictions) {
                        *per_project.entry(candidate.project.clone()).or_insert(0) += 1;
                        in_flight_predictions.insert(
                            candidate.url.clone(),
                            (candidate.project.clone(), candidate.predicted.clone()),
                        );
                        running += 1;

                        let engine = Arc::clone(&self.engine);
                        let semaphore = Arc::clone(&self.semaphore);
                        let opts = opts.clone();
                        let child_cancel = cancel.child_token();
                        let done_tx = done_tx.clone();
                        let url = candidate.url.clone();
                        let project = candidate.project.clone();
                        tokio::spawn(async move {
                            let _permit = semaphore.acquire().await;
                            let result =
                                engine.run_on_issue(&url, opts, child_cancel).await;
                            let _ = done_tx.send((url, project, result));
                        });
                    } else {
                        deferred.push_back(candidate);
                    }
                }
                pending = deferred;
            }

            if running == 0 {
                break;
            }

            let done = if cancel.is_cancelled() {
                // Admission has stopped; just drain in-flight engines.
                done_rx.recv().await
            } else {
                tokio::select! {
                    done = done_rx.recv() => done,
                    _ = cancel.cancelled() => {
                        info!("work-parallel: cancelled, waiting for {running} in-flight engine(s)");
                        continue;
                    }
                }
            };

            let Some((url, project, result)) = done else { break };
            running -= 1;
            in_flight_predictions.remove(&url);
            if let Some(n) = per_project.get_mut(&project) {
                *n = n.saturating_sub(1);
            }
            match result {
                Ok(engine_report) => {
                    info!("work-parallel: {url} done");
                    report.completed.push(engine_report);
                }
                Err(e) => {
                    warn!("work-parallel: {url} failed: {e}");
                    report.failed.push((url, e.to_string()));
                }
            }
            // Loop back: a completion may unblock a deferred issue.
        }

        for leftover in pending {
            report.skipped.push(leftover.url);
        }
        info!(
            "work-parallel: {} completed, {} failed, {} skipped",
            report.completed.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}
