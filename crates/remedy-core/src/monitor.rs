use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::feedback::parse_feedback;
use crate::host::{ConclusionMap, HostClient, ProposalState};
use crate::types::MonitorEvent;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub interval: Duration,
    /// Stop polling after this long without any observed change.
    pub inactivity_timeout: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(120 * 60),
        }
    }
}

/// Per-proposal change-detection state, opaque to callers.
#[derive(Default)]
pub struct Snapshot {
    item_keys: BTreeSet<String>,
    failing: BTreeSet<String>,
    terminal: bool,
}

/// Polls proposals for review activity and emits tagged events.
pub struct Monitor {
    host: Arc<dyn HostClient>,
    bot_authors: Vec<String>,
    conclusions: ConclusionMap,
    pub event_tx: broadcast::Sender<MonitorEvent>,
}

impl Monitor {
    pub fn new(
        host: Arc<dyn HostClient>,
        bot_authors: Vec<String>,
        conclusions: ConclusionMap,
    ) -> (Self, broadcast::Receiver<MonitorEvent>) {
        let (tx, rx) = broadcast::channel(256);
        (Self { host, bot_authors, conclusions, event_tx: tx }, rx)
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// One poll pass over one proposal. Returns true if anything changed.
    async fn poll_proposal(&self, pr_url: &str, snapshot: &mut Snapshot) -> bool {
        if snapshot.terminal {
            return false;
        }
        let feedback = match self.host.fetch_feedback(pr_url).await {
            Ok(f) => f,
            Err(e) => {
                warn!("monitor: fetch_feedback {pr_url}: {e}");
                self.emit(MonitorEvent::Error { pr_url: pr_url.to_string(), message: e.to_string() });
                return false;
            }
        };

        match feedback.proposal.state {
            ProposalState::Merged => {
                snapshot.terminal = true;
                self.emit(MonitorEvent::Merged { pr_url: pr_url.to_string() });
                return true;
            }
            ProposalState::Closed => {
                snapshot.terminal = true;
                self.emit(MonitorEvent::Closed { pr_url: pr_url.to_string() });
                return true;
            }
            ProposalState::Open => {}
        }

        let mut changed = false;

        let parsed = parse_feedback(&feedback, &self.bot_authors, &self.conclusions);
        let keys: BTreeSet<String> = parsed
            .items
            .iter()
            .map(|i| format!("{}|{}|{}", i.author, i.file.as_deref().unwrap_or(""), i.body))
            .collect();
        let fresh: Vec<_> = parsed
            .items
            .iter()
            .filter(|i| {
                let key = format!("{}|{}|{}", i.author, i.file.as_deref().unwrap_or(""), i.body);
                !snapshot.item_keys.contains(&key)
            })
            .cloned()
            .collect();
        if !fresh.is_empty() {
            info!("monitor: {} new feedback item(s) on {pr_url}", fresh.len());
            self.emit(MonitorEvent::Feedback {
                pr_url: pr_url.to_string(),
                items: fresh,
                summary: parsed.summary.clone(),
            });
            changed = true;
        }
        snapshot.item_keys = keys;

        let failing: BTreeSet<String> = feedback
            .check_runs
            .iter()
            .filter(|c| self.conclusions.is_failing(c))
            .map(|c| c.name.clone())
            .collect();
        if failing != snapshot.failing {
            self.emit(MonitorEvent::ChecksChanged {
                pr_url: pr_url.to_string(),
                failing: failing.iter().cloned().collect(),
            });
            snapshot.failing = failing;
            changed = true;
        }

        changed
    }

    /// Run one pass over every proposal. Returns true if anything changed.
    pub async fn poll_once(
        &self,
        urls: &[String],
        snapshots: &mut HashMap<String, Snapshot>,
    ) -> bool {
        let mut changed = false;
        for url in urls {
            let snapshot = snapshots.entry(url.clone()).or_default();
            if self.poll_proposal(url, snapshot).await {
                changed = true;
            }
        }
        changed
    }

    /// Poll until cancelled, every proposal reaches a terminal state, or the
    /// inactivity timeout passes without change.
    pub async fn run(
        &self,
        urls: Vec<String>,
        opts: MonitorOptions,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut snapshots: HashMap<String, Snapshot> = HashMap::new();
        let mut last_change = tokio::time::Instant::now();

        loop {
            if self.poll_once(&urls, &mut snapshots).await {
                last_change = tokio::time::Instant::now();
            }

            if urls.iter().all(|u| snapshots.get(u).map(|s| s.terminal).unwrap_or(false)) {
                info!("monitor: all proposals reached a terminal state");
                return Ok(());
            }
            if last_change.elapsed() >= opts.inactivity_timeout {
                info!(
                    "monitor: no activity for {} min, stopping",
                    opts.inactivity_timeout.as_secs() / 60
                );
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(opts.interval) => {}
                _ = cancel.cancelled() => {
                    info!("monitor: cancelled");
                    return Ok(());
                }
            }
        }
    }
}
