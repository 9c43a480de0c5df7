use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What a cleanup task releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupKind {
    Worktree,
    TempFile,
    Process,
    Custom,
}

impl CleanupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worktree => "worktree",
            Self::TempFile => "temp-file",
            Self::Process => "process",
            Self::Custom => "custom",
        }
    }
}

type CleanupFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

struct CleanupTask {
    kind: CleanupKind,
    description: String,
    priority: i32,
    created_at: DateTime<Utc>,
    run: CleanupFn,
}

/// Failure report for one task that survived a `run_all` pass.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub id: u64,
    pub kind: CleanupKind,
    pub description: String,
    pub error: String,
}

/// Registry of resource-release tasks, executed highest-priority first.
///
/// Tasks must be idempotent: a failing task stays registered and is retried
/// on the next pass. `run_all` never runs re-entrantly; an overlapping call
/// is a no-op.
pub struct CleanupManager {
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<u64, CleanupTask>>,
    running: AtomicBool,
}

impl CleanupManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn register<F>(
        &self,
        kind: CleanupKind,
        description: impl Into<String>,
        priority: i32,
        f: F,
    ) -> u64
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = CleanupTask {
            kind,
            description: description.into(),
            priority,
            created_at: Utc::now(),
            run: Box::new(f),
        };
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).insert(id, task);
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (id, kind, description, priority, created_at) for every pending task.
    pub fn pending(&self) -> Vec<(u64, CleanupKind, String, i32, DateTime<Utc>)> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .iter()
            .map(|(id, t)| (*id, t.kind, t.description.clone(), t.priority, t.created_at))
            .collect()
    }

    /// Run every registered task, highest priority first (ties unwind in
    /// reverse registration order). Successful tasks are removed; failures
    /// are collected and returned without stopping siblings.
    pub fn run_all(&self) -> Vec<CleanupFailure> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("cleanup: run_all already in progress, skipping");
            return Vec::new();
        }

        // Snapshot ids ordered by priority, ties in reverse registration
        // order; tasks registered mid-run wait for the next pass.
        let mut order: Vec<(i32, u64)> = {
            let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.iter().map(|(id, t)| (t.priority, *id)).collect()
        };
        order.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let mut failures = Vec::new();
        for (_, id) in order {
            let task = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            let Some(task) = task else { continue };
            match (task.run)() {
                Ok(()) => {
                    info!("cleanup: {} '{}' done", task.kind.as_str(), task.description);
                }
                Err(e) => {
                    warn!("cleanup: {} '{}' failed: {e}", task.kind.as_str(), task.description);
                    failures.push(CleanupFailure {
                        id,
                        kind: task.kind,
                        description: task.description.clone(),
                        error: e.to_string(),
                    });
                    // Failed tasks stay registered for a later retry.
                    self.tasks.lock().unwrap_or_else(|e| e.into_inner()).insert(id, task);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        failures
    }
}

impl Default for CleanupManager {
    fn default() -> Self {
        Self::new()
    }
}
