use std::{path::Path, process::Command};

use anyhow::Result;

use crate::error::Error;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Summary of a diff between a working copy and its base branch.
#[derive(Debug, Clone, Default)]
pub struct DiffStat {
    /// Changed files. A rename counts once.
    pub files: usize,
    /// Added plus removed lines.
    pub lines: usize,
    pub changed_paths: Vec<String>,
}

pub struct Git {
    pub repo_path: String,
}

fn vcs(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Error::VersionControl(msg.into()))
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .map_err(|e| vcs(format!("failed to spawn git -C {dir} {}: {e}", args.join(" "))))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    // ── Mirror maintenance ────────────────────────────────────────────────

    /// Clone `remote_url` into `repo_path` if absent, else fetch.
    ///
    /// Network failures surface as `Error::Network` so the retry wrapper
    /// treats them as transient.
    pub fn ensure_mirror(&self, remote_url: &str) -> Result<()> {
        if Path::new(&self.repo_path).join(".git").exists() {
            return self.fetch_origin();
        }
        if let Some(parent) = Path::new(&self.repo_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| vcs(e.to_string()))?;
        }
        let output = Command::new("git")
            .args(["clone", remote_url, &self.repo_path])
            .output()
            .map_err(|e| vcs(format!("failed to spawn git clone: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(classify_network(&stderr, format!("git clone {remote_url} failed: {stderr}")));
        }
        Ok(())
    }

    pub fn fetch_origin(&self) -> Result<()> {
        let result = self.exec(&self.repo_path, &["fetch", "origin", "--prune"])?;
        if !result.success() {
            let out = result.combined_output();
            return Err(classify_network(&out, format!("git fetch origin failed: {out}")));
        }
        Ok(())
    }

    pub fn default_branch(&self) -> Result<String> {
        let result = self.exec(
            &self.repo_path,
            &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"],
        )?;
        if result.success() {
            // "origin/main" -> "main"
            let full = result.stdout.trim();
            return Ok(full.strip_prefix("origin/").unwrap_or(full).to_string());
        }
        Ok("main".to_string())
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.exec(&self.repo_path, &["rev-parse", refname])?;
        if !result.success() {
            return Err(vcs(format!("git rev-parse {refname} failed: {}", result.combined_output())));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.exec(&self.repo_path, &["rev-parse", "--verify", branch])
            .map(|r| r.success())
            .unwrap_or(false)
    }

    // ── Worktrees ─────────────────────────────────────────────────────────

    pub fn create_worktree(&self, wt_path: &str, branch: &str, base: &str) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["worktree", "add", wt_path, "-b", branch, base],
        )?;
        if !result.success() {
            return Err(vcs(format!(
                "git worktree add failed for branch={branch} base={base}: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }

    /// Check out an existing branch into a new worktree (iteration path).
    pub fn create_worktree_on_branch(&self, wt_path: &str, branch: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["worktree", "add", wt_path, branch])?;
        if !result.success() {
            return Err(vcs(format!(
                "git worktree add failed for existing branch={branch}: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }

    pub fn remove_worktree(&self, wt_path: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["worktree", "remove", "--force", wt_path])?;
        if !result.success() {
            return Err(vcs(format!(
                "git worktree remove failed for {wt_path}: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }

    pub fn prune_worktrees(&self) {
        let _ = self.exec(&self.repo_path, &["worktree", "prune"]);
    }

    /// Worktree paths registered in this repo, porcelain format.
    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let result = self.exec(&self.repo_path, &["worktree", "list", "--porcelain"])?;
        if !result.success() {
            return Err(vcs(format!("git worktree list failed: {}", result.combined_output())));
        }
        Ok(result
            .stdout
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(str::to_string)
            .collect())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["branch", "-D", branch])?;
        if !result.success() {
            return Err(vcs(format!("git branch -D {branch} failed: {}", result.combined_output())));
        }
        Ok(())
    }

    // ── Working-copy operations ───────────────────────────────────────────

    pub fn commit_all(
        &self,
        wt_path: &str,
        message: &str,
        author: Option<(&str, &str)>,
    ) -> Result<bool> {
        let add = self.exec(wt_path, &["add", "-A"])?;
        if !add.success() {
            return Err(vcs(format!("git add -A failed in {wt_path}: {}", add.combined_output())));
        }

        let status = self.exec(wt_path, &["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }

        let mut args: Vec<String> = Vec::new();
        if let Some((name, email)) = author {
            args.push("-c".into());
            args.push(format!("user.name={name}"));
            args.push("-c".into());
            args.push(format!("user.email={email}"));
        }
        args.extend(["commit".into(), "-m".into(), message.into()]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.exec(wt_path, &arg_refs)?;
        if !result.success() {
            return Err(vcs(format!("git commit failed in {wt_path}: {}", result.combined_output())));
        }
        Ok(true)
    }

    /// Diff the working copy's HEAD against `base` (e.g. `origin/main`).
    ///
    /// Uses `--numstat -M` so a rename shows up as one changed file.
    pub fn diff_stat(&self, wt_path: &str, base: &str) -> Result<DiffStat> {
        let result = self.exec(wt_path, &["diff", "--numstat", "-M", &format!("{base}...HEAD")])?;
        if !result.success() {
            return Err(vcs(format!(
                "git diff --numstat {base}...HEAD failed in {wt_path}: {}",
                result.combined_output()
            )));
        }
        let mut stat = DiffStat::default();
        for line in result.stdout.lines() {
            let mut parts = line.split_whitespace();
            let added = parts.next().unwrap_or("0");
            let removed = parts.next().unwrap_or("0");
            let path = parts.collect::<Vec<_>>().join(" ");
            if path.is_empty() {
                continue;
            }
            stat.files += 1;
            // Binary files report "-"; count them as zero lines.
            stat.lines += added.parse::<usize>().unwrap_or(0);
            stat.lines += removed.parse::<usize>().unwrap_or(0);
            stat.changed_paths.push(path);
        }
        Ok(stat)
    }

    /// Files modified (committed or not) in a working copy relative to `base`.
    pub fn modified_files(&self, wt_path: &str, base: &str) -> Result<Vec<String>> {
        let committed = self.exec(wt_path, &["diff", "--name-only", &format!("{base}...HEAD")])?;
        let dirty = self.exec(wt_path, &["status", "--porcelain"])?;
        let mut files: Vec<String> = committed
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect();
        for line in dirty.stdout.lines() {
            if line.len() > 3 {
                files.push(line[3..].to_string());
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    pub fn push_branch(&self, wt_path: &str, branch: &str) -> Result<()> {
        let result = self.exec(wt_path, &["push", "--force-with-lease", "origin", branch])?;
        if !result.success() {
            let out = result.combined_output();
            return Err(classify_network(&out, format!("git push origin {branch} failed: {out}")));
        }
        Ok(())
    }

    pub fn delete_remote_branch(&self, branch: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["push", "origin", "--delete", branch])?;
        if !result.success() {
            return Err(vcs(format!(
                "git push origin --delete {branch} failed: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }
}

/// Network-looking git failures become retryable `Error::Network`.
fn classify_network(output: &str, msg: String) -> anyhow::Error {
    let lower = output.to_lowercase();
    let transient = ["could not resolve host", "connection reset", "connection timed out", "early eof", "remote end hung up", "503", "operation timed out"]
        .iter()
        .any(|p| lower.contains(p));
    if transient {
        anyhow::Error::new(Error::Network(msg))
    } else {
        anyhow::Error::new(Error::VersionControl(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_classification() {
        let err = classify_network("fatal: Could not resolve host: github.com", "x".into());
        assert!(crate::error::is_retryable(&err));
        let err = classify_network("fatal: not a git repository", "x".into());
        assert!(!crate::error::is_retryable(&err));
    }
}
