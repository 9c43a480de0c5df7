use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Issue lifecycle ──────────────────────────────────────────────────────

/// Lifecycle state of an issue, from discovery to a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Discovered,
    Queued,
    InProgress,
    PrCreated,
    AwaitingFeedback,
    Iterating,
    Merged,
    Closed,
    Abandoned,
}

impl IssueState {
    /// Terminal states are absorbing: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Closed | Self::Abandoned)
    }

    /// The allowed-transitions table. Everything not listed here is illegal.
    pub fn can_transition_to(self, to: IssueState) -> bool {
        use IssueState::*;
        matches!(
            (self, to),
            (Discovered, Queued)
                | (Discovered, Abandoned)
                | (Queued, InProgress)
                | (Queued, Abandoned)
                | (InProgress, PrCreated)
                | (InProgress, Abandoned)
                | (InProgress, Queued)
                | (PrCreated, AwaitingFeedback)
                | (PrCreated, Merged)
                | (PrCreated, Closed)
                | (AwaitingFeedback, Iterating)
                | (AwaitingFeedback, Merged)
                | (AwaitingFeedback, Closed)
                | (Iterating, AwaitingFeedback)
                | (Iterating, Abandoned)
                | (Iterating, PrCreated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::PrCreated => "pr_created",
            Self::AwaitingFeedback => "awaiting_feedback",
            Self::Iterating => "iterating",
            Self::Merged => "merged",
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "discovered" => Self::Discovered,
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "pr_created" => Self::PrCreated,
            "awaiting_feedback" => Self::AwaitingFeedback,
            "iterating" => Self::Iterating,
            "merged" => Self::Merged,
            "closed" => Self::Closed,
            "abandoned" => Self::Abandoned,
            _ => return None,
        })
    }
}

impl std::fmt::Display for IssueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Session lifecycle ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Paused,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Active, Completed) | (Active, Failed) | (Active, Paused) | (Paused, Active)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => Self::Active,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "paused" => Self::Paused,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Core entities ────────────────────────────────────────────────────────

/// An external issue as tracked in the store.
///
/// Identity is `host` + `project` + `number`; `url` is the canonical form and
/// unique across the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    /// Hosting provider, e.g. "github".
    pub host: String,
    /// `owner/repo`, exactly as the host spells it (no case folding).
    pub project: String,
    pub number: i64,
    pub url: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    pub assignee: Option<String>,
    pub state: IssueState,
    /// URL of the proposal created for this issue, if any.
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One end-to-end run of the execution engine against one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub issue_id: i64,
    pub status: SessionStatus,
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub turns: i64,
    /// Accumulated spend; monotonically non-decreasing.
    pub cost_usd: f64,
    pub pr_url: Option<String>,
    pub workdir: String,
    pub resumable: bool,
    pub error: Option<String>,
}

/// Which entity a transition record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEntity {
    Issue,
    Session,
}

impl TransitionEntity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Session => "session",
        }
    }
}

/// Immutable append-only history record for a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: i64,
    pub entity: TransitionEntity,
    pub entity_id: i64,
    pub from_state: String,
    pub to_state: String,
    /// Session that caused an issue transition, when applicable.
    pub session_id: Option<i64>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Working copies ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingCopyStatus {
    Active,
    Completed,
    Failed,
}

impl WorkingCopyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// An isolated checkout owned by one session while active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingCopy {
    pub path: String,
    pub branch: String,
    pub issue_url: String,
    pub project: String,
    pub status: WorkingCopyStatus,
    pub created_at: DateTime<Utc>,
}

// ── Feedback ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    CodeChange,
    BugFix,
    Style,
    Test,
    Documentation,
    Performance,
    Security,
    CiFailure,
    Question,
    Other,
}

impl FeedbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeChange => "code_change",
            Self::BugFix => "bug_fix",
            Self::Style => "style",
            Self::Test => "test",
            Self::Documentation => "documentation",
            Self::Performance => "performance",
            Self::Security => "security",
            Self::CiFailure => "ci_failure",
            Self::Question => "question",
            Self::Other => "other",
        }
    }
}

/// One actionable unit parsed from reviews, comments or failing checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub kind: FeedbackKind,
    /// 1 = highest. Security and CI failures are always 1.
    pub priority: u8,
    pub file: Option<String>,
    pub line: Option<i64>,
    pub body: String,
    pub author: String,
    pub addressed: bool,
}

// ── Budget ledger ────────────────────────────────────────────────────────

/// Append-only spend record. Rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    /// Local day, `YYYY-MM-DD`.
    pub day: String,
    /// Local month, `YYYY-MM`.
    pub month: String,
    pub session_id: i64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

// ── Engine output ────────────────────────────────────────────────────────

/// Result of one engine run, reported to callers and the orchestrator.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub issue_url: String,
    pub session_id: i64,
    pub pr_url: Option<String>,
    pub cost_usd: f64,
    pub turns: i64,
}

// ── Monitor events ───────────────────────────────────────────────────────

/// Events emitted by the feedback monitor over a broadcast channel.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// New actionable feedback appeared on a proposal.
    Feedback {
        pr_url: String,
        items: Vec<FeedbackItem>,
        summary: String,
    },
    /// The set of failing check-runs changed.
    ChecksChanged { pr_url: String, failing: Vec<String> },
    Merged { pr_url: String },
    Closed { pr_url: String },
    Error { pr_url: String, message: String },
}

// ── Gate decisions ───────────────────────────────────────────────────────

/// Outcome of a budget or rate admission check.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub can_proceed: bool,
    pub reason: Option<String>,
    /// When the gate reopens (rate gate: next local midnight).
    pub next_available: Option<DateTime<Utc>>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self { can_proceed: true, reason: None, next_available: None }
    }

    pub fn refuse(reason: impl Into<String>) -> Self {
        Self { can_proceed: false, reason: Some(reason.into()), next_available: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for term in [IssueState::Merged, IssueState::Closed, IssueState::Abandoned] {
            for to in [
                IssueState::Discovered,
                IssueState::Queued,
                IssueState::InProgress,
                IssueState::PrCreated,
                IssueState::AwaitingFeedback,
                IssueState::Iterating,
                IssueState::Merged,
                IssueState::Closed,
                IssueState::Abandoned,
            ] {
                assert!(!term.can_transition_to(to), "{term} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn retryable_failure_requeues() {
        assert!(IssueState::InProgress.can_transition_to(IssueState::Queued));
        assert!(!IssueState::Queued.can_transition_to(IssueState::PrCreated));
    }

    #[test]
    fn state_round_trips_through_str() {
        for s in [
            IssueState::Discovered,
            IssueState::Queued,
            IssueState::InProgress,
            IssueState::PrCreated,
            IssueState::AwaitingFeedback,
            IssueState::Iterating,
            IssueState::Merged,
            IssueState::Closed,
            IssueState::Abandoned,
        ] {
            assert_eq!(IssueState::parse(s.as_str()), Some(s));
        }
        assert_eq!(IssueState::parse("nope"), None);
    }

    #[test]
    fn session_transitions() {
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Paused));
        assert!(SessionStatus::Paused.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Active));
    }
}
