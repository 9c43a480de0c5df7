//! Wire-format DTOs for the GitHub REST API.
//!
//! Unknown fields are tolerated everywhere; only what the core consumes is
//! modelled.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UserWire {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelWire {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueWire {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<LabelWire>,
    #[serde(default)]
    pub user: UserWire,
    #[serde(default)]
    pub assignee: Option<UserWire>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BranchWire {
    #[serde(rename = "ref", default)]
    pub branch: String,
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullWire {
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub number: i64,
    /// `open` | `closed`
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub head: BranchWire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewWire {
    #[serde(default)]
    pub user: UserWire,
    #[serde(default)]
    pub body: Option<String>,
    /// `APPROVED` | `CHANGES_REQUESTED` | `COMMENTED` | ...
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewCommentWire {
    pub id: i64,
    #[serde(default)]
    pub user: UserWire,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub in_reply_to_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentWire {
    pub id: i64,
    #[serde(default)]
    pub user: UserWire,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRunWire {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CheckRunsWire {
    #[serde(default)]
    pub check_runs: Vec<CheckRunWire>,
}
