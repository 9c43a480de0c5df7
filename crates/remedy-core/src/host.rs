use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A host-qualified issue identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub number: i64,
}

impl IssueRef {
    /// `owner/repo`, verbatim (project rate keys are case-sensitive).
    pub fn project(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// An issue as the host reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Open,
    Merged,
    Closed,
}

/// The change-proposal artifact (pull request) as the host reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalInfo {
    pub url: String,
    pub number: i64,
    pub state: ProposalState,
    pub head_branch: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub author: String,
    #[serde(default)]
    pub body: String,
    /// `approved` | `changes_requested` | `commented` | ...
    #[serde(default)]
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: i64,
    pub author: String,
    pub body: String,
    /// Inline comments carry a file path and line.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<i64>,
    /// Set when this comment is a direct reply to another.
    #[serde(default)]
    pub in_reply_to: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    /// `queued` | `in_progress` | `completed`
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

/// Everything the feedback parser consumes for one proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalFeedback {
    pub proposal: ProposalInfo,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub comments: Vec<ReviewComment>,
    #[serde(default)]
    pub check_runs: Vec<CheckRun>,
}

// ── Check conclusions ────────────────────────────────────────────────────

/// Which check-run conclusions count as failing.
///
/// Unknown conclusions map to `skipped` rather than `failure` so a new host
/// vocabulary never produces false negatives. The non-failing set is
/// configurable.
#[derive(Debug, Clone)]
pub struct ConclusionMap {
    non_failing: Vec<String>,
}

impl Default for ConclusionMap {
    fn default() -> Self {
        Self {
            non_failing: ["success", "neutral", "skipped", "action_required"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ConclusionMap {
    pub fn new(non_failing: Vec<String>) -> Self {
        Self { non_failing }
    }

    /// Normalise an arbitrary conclusion string; unknown values read as
    /// `skipped`.
    pub fn normalise<'a>(&self, conclusion: &'a str) -> &'a str {
        match conclusion {
            "success" | "failure" | "neutral" | "cancelled" | "skipped" | "timed_out"
            | "action_required" | "stale" => conclusion,
            _ => "skipped",
        }
    }

    pub fn is_failing(&self, check: &CheckRun) -> bool {
        if check.status != "completed" {
            return false;
        }
        match check.conclusion.as_deref() {
            Some(c) => {
                let c = self.normalise(c);
                !self.non_failing.iter().any(|nf| nf == c)
            }
            None => false,
        }
    }
}

// ── The host seam ────────────────────────────────────────────────────────

/// Repository-host adapter consumed by the engine and monitor.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Parse a canonical issue URL into its identity.
    fn parse_issue_url(&self, url: &str) -> Result<IssueRef>;

    /// Parse a proposal URL into (`owner/repo`, number).
    fn parse_proposal_url(&self, url: &str) -> Result<(String, i64)>;

    async fn get_issue(&self, issue: &IssueRef) -> Result<RemoteIssue>;

    /// Clone/fetch URL for the repository.
    fn remote_url(&self, project: &str) -> String;

    async fn create_proposal(
        &self,
        project: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<ProposalInfo>;

    async fn get_proposal(&self, pr_url: &str) -> Result<ProposalInfo>;

    async fn fetch_feedback(&self, pr_url: &str) -> Result<ProposalFeedback>;

    async fn post_comment(&self, pr_url: &str, body: &str) -> Result<()>;

    async fn delete_branch(&self, project: &str, branch: &str) -> Result<()>;

    async fn is_available(&self) -> bool;
}
