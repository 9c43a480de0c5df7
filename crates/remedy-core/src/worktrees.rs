use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::error::Error;
use crate::git::Git;
use crate::types::{WorkingCopy, WorkingCopyStatus};

/// Registry of isolated working copies.
///
/// A copy is registered *before* its directory is created and unregistered
/// only after removal succeeds or the path is proven missing, so a crash can
/// never leave an untracked checkout that `sync_with_disk` cannot find.
pub struct WorktreeManager {
    base_dir: String,
    mirrors_dir: String,
    max_total: usize,
    max_per_project: usize,
    registry: Mutex<HashMap<String, WorkingCopy>>,
}

/// `acme/app` → `acme-app` (directory-safe project name).
fn project_dirname(project: &str) -> String {
    project.replace('/', "-")
}

impl WorktreeManager {
    pub fn new(
        base_dir: impl Into<String>,
        mirrors_dir: impl Into<String>,
        max_total: usize,
        max_per_project: usize,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            mirrors_dir: mirrors_dir.into(),
            max_total,
            max_per_project,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Local mirror path for a project.
    pub fn mirror_path(&self, project: &str) -> String {
        format!("{}/{}", self.mirrors_dir, project_dirname(project))
    }

    /// Working-copy directory for an issue.
    pub fn copy_path(&self, project: &str, issue_number: i64) -> String {
        let repo = project.rsplit('/').next().unwrap_or(project);
        format!("{}/{repo}-issue-{issue_number}", self.base_dir)
    }

    /// Create and register a fresh working copy on `branch`, cut from `base`.
    ///
    /// Refuses with a specific reason when either worktree limit is hit.
    pub fn create(
        &self,
        git: &Git,
        project: &str,
        issue_url: &str,
        issue_number: i64,
        branch: &str,
        base: &str,
    ) -> Result<WorkingCopy> {
        let path = self.copy_path(project, issue_number);
        {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if reg.len() >= self.max_total {
                return Err(anyhow::Error::new(Error::RateLimited {
                    reason: format!("worktree limit reached ({} of {})", reg.len(), self.max_total),
                    retry_after_ms: None,
                }));
            }
            let per_project = reg.values().filter(|w| w.project == project).count();
            if per_project >= self.max_per_project {
                return Err(anyhow::Error::new(Error::RateLimited {
                    reason: format!(
                        "worktree limit for {project} reached ({per_project} of {})",
                        self.max_per_project
                    ),
                    retry_after_ms: None,
                }));
            }
            // Register before any file is written.
            reg.insert(
                path.clone(),
                WorkingCopy {
                    path: path.clone(),
                    branch: branch.to_string(),
                    issue_url: issue_url.to_string(),
                    project: project.to_string(),
                    status: WorkingCopyStatus::Active,
                    created_at: Utc::now(),
                },
            );
        }

        std::fs::create_dir_all(&self.base_dir).ok();
        // A stale directory or branch from a crashed run gets replaced.
        if Path::new(&path).exists() {
            let _ = git.remove_worktree(&path);
            let _ = std::fs::remove_dir_all(&path);
        }
        git.prune_worktrees();
        if git.branch_exists(branch) {
            let _ = git.delete_branch(branch);
        }

        if let Err(e) = git.create_worktree(&path, branch, base) {
            self.registry.lock().unwrap_or_else(|g| g.into_inner()).remove(&path);
            return Err(e);
        }

        info!("created working copy {path} (branch {branch})");
        self.get(&path)
            .ok_or_else(|| anyhow::Error::new(Error::Unknown(format!("copy {path} vanished"))))
    }

    /// Check out an existing branch into a registered copy (iteration path).
    pub fn create_on_branch(
        &self,
        git: &Git,
        project: &str,
        issue_url: &str,
        issue_number: i64,
        branch: &str,
    ) -> Result<WorkingCopy> {
        let path = self.copy_path(project, issue_number);
        {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if reg.len() >= self.max_total {
                return Err(anyhow::Error::new(Error::RateLimited {
                    reason: format!("worktree limit reached ({} of {})", reg.len(), self.max_total),
                    retry_after_ms: None,
                }));
            }
            reg.insert(
                path.clone(),
                WorkingCopy {
                    path: path.clone(),
                    branch: branch.to_string(),
                    issue_url: issue_url.to_string(),
                    project: project.to_string(),
                    status: WorkingCopyStatus::Active,
                    created_at: Utc::now(),
                },
            );
        }

        std::fs::create_dir_all(&self.base_dir).ok();
        if Path::new(&path).exists() {
            let _ = git.remove_worktree(&path);
            let _ = std::fs::remove_dir_all(&path);
        }
        git.prune_worktrees();

        if let Err(e) = git.create_worktree_on_branch(&path, branch) {
            self.registry.lock().unwrap_or_else(|g| g.into_inner()).remove(&path);
            return Err(e);
        }
        self.get(&path)
            .ok_or_else(|| anyhow::Error::new(Error::Unknown(format!("copy {path} vanished"))))
    }

    /// Remove a working copy from disk, then unregister it.
    ///
    /// A path already missing on disk counts as removed.
    pub fn remove(&self, git: &Git, path: &str) -> Result<()> {
        if Path::new(path).exists() {
            git.remove_worktree(path)?;
            let _ = std::fs::remove_dir_all(path);
            git.prune_worktrees();
        }
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
        Ok(())
    }

    pub fn mark_status(&self, path: &str, status: WorkingCopyStatus) -> bool {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        match reg.get_mut(path) {
            Some(copy) => {
                copy.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, path: &str) -> Option<WorkingCopy> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).get(path).cloned()
    }

    pub fn list(&self) -> Vec<WorkingCopy> {
        let mut copies: Vec<_> = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        copies.sort_by(|a, b| a.path.cmp(&b.path));
        copies
    }

    pub fn list_by_project(&self, project: &str) -> Vec<WorkingCopy> {
        self.list().into_iter().filter(|w| w.project == project).collect()
    }

    pub fn count(&self) -> usize {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remove every copy marked completed. Returns how many were removed.
    pub fn cleanup_completed(&self) -> usize {
        let completed: Vec<WorkingCopy> = self
            .list()
            .into_iter()
            .filter(|w| w.status == WorkingCopyStatus::Completed)
            .collect();
        let mut removed = 0;
        for copy in completed {
            let git = Git::new(self.mirror_path(&copy.project));
            match self.remove(&git, &copy.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("cleanup_completed: {}: {e}", copy.path),
            }
        }
        removed
    }

    /// Remove copies older than `hours`, whatever their status.
    pub fn cleanup_by_age(&self, hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let stale: Vec<WorkingCopy> =
            self.list().into_iter().filter(|w| w.created_at < cutoff).collect();
        let mut removed = 0;
        for copy in stale {
            let git = Git::new(self.mirror_path(&copy.project));
            match self.remove(&git, &copy.path) {
                Ok(()) => {
                    info!("cleanup_by_age: removed {} (older than {hours} h)", copy.path);
                    removed += 1;
                }
                Err(e) => warn!("cleanup_by_age: {}: {e}", copy.path),
            }
        }
        removed
    }

    /// Paths modified in more than one registered working copy.
    pub fn detect_file_conflicts(&self, base: &str) -> Vec<String> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        for copy in self.list() {
            let git = Git::new(self.mirror_path(&copy.project));
            let files = match git.modified_files(&copy.path, base) {
                Ok(f) => f,
                Err(e) => {
                    warn!("detect_file_conflicts: {}: {e}", copy.path);
                    continue;
                }
            };
            for f in files {
                *seen.entry(f).or_insert(0) += 1;
            }
        }
        let mut conflicts: Vec<String> =
            seen.into_iter().filter(|(_, n)| *n > 1).map(|(f, _)| f).collect();
        conflicts.sort();
        conflicts
    }

    /// Reconcile the registry with the directory layout after a crash.
    ///
    /// On-disk copies unknown to the registry are re-registered as active
    /// with an unknown (current) start time; registry entries whose path is
    /// gone are dropped.
    pub fn sync_with_disk(&self) -> Result<()> {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());

        reg.retain(|path, _| {
            let exists = Path::new(path).exists();
            if !exists {
                info!("sync_with_disk: dropping registry entry for missing {path}");
            }
            exists
        });

        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let path = entry.path().to_string_lossy().to_string();
            if reg.contains_key(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let (repo, number) = match name.split_once("-issue-") {
                Some((repo, n)) => (repo.to_string(), n.parse::<i64>().unwrap_or(0)),
                None => (name.clone(), 0),
            };
            warn!("sync_with_disk: adopting untracked working copy {path}");
            reg.insert(
                path.clone(),
                WorkingCopy {
                    path,
                    branch: format!("remedy/issue-{number}"),
                    issue_url: String::new(),
                    project: repo,
                    status: WorkingCopyStatus::Active,
                    created_at: Utc::now(),
                },
            );
        }
        Ok(())
    }
}
