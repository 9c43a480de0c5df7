use std::sync::Arc;

use crate::agent::AgentProvider;
use crate::host::HostClient;
use crate::worktrees::WorktreeManager;

/// Point-in-time health snapshot consumed by `status` and by orchestrator
/// admission.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub disk_free_bytes: Option<u64>,
    pub rss_bytes: Option<u64>,
    pub worktree_count: usize,
    pub worktree_limit: usize,
    pub provider_available: bool,
    pub host_available: bool,
}

/// Refuse new admissions below this much free disk.
pub const MIN_FREE_DISK_BYTES: u64 = 1 << 30;

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.provider_available
            && self.host_available
            && self.worktree_count < self.worktree_limit
            && self.disk_free_bytes.map(|b| b >= MIN_FREE_DISK_BYTES).unwrap_or(true)
    }

    pub fn degraded_reason(&self) -> Option<String> {
        if !self.provider_available {
            return Some("agent provider unavailable".into());
        }
        if !self.host_available {
            return Some("host API unavailable".into());
        }
        if self.worktree_count >= self.worktree_limit {
            return Some(format!(
                "worktree count {} at limit {}",
                self.worktree_count, self.worktree_limit
            ));
        }
        if let Some(free) = self.disk_free_bytes {
            if free < MIN_FREE_DISK_BYTES {
                return Some(format!("low disk: {} MiB free", free >> 20));
            }
        }
        None
    }
}

/// Free bytes on the filesystem holding `dir`, via `df -k`.
fn disk_free_bytes(dir: &str) -> Option<u64> {
    let output = std::process::Command::new("df").args(["-k", dir]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().nth(1)?;
    let avail_kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(avail_kb * 1024)
}

/// Resident set size from /proc, where available.
fn rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

pub async fn check(
    data_dir: &str,
    worktrees: &WorktreeManager,
    worktree_limit: usize,
    provider: &Arc<dyn AgentProvider>,
    host: &Arc<dyn HostClient>,
) -> HealthReport {
    HealthReport {
        disk_free_bytes: disk_free_bytes(data_dir),
        rss_bytes: rss_bytes(),
        worktree_count: worktrees.count(),
        worktree_limit,
        provider_available: provider.is_available().await,
        host_available: host.is_available().await,
    }
}
