use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Error;
use crate::types::{
    Issue, IssueState, LedgerEntry, Session, SessionStatus, Transition, TransitionEntity,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS issues (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    host        TEXT NOT NULL,
    project     TEXT NOT NULL,
    number      INTEGER NOT NULL,
    url         TEXT NOT NULL UNIQUE,
    title       TEXT NOT NULL,
    body        TEXT NOT NULL DEFAULT '',
    labels      TEXT NOT NULL DEFAULT '[]',
    author      TEXT NOT NULL DEFAULT '',
    assignee    TEXT,
    state       TEXT NOT NULL,
    pr_url      TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id         INTEGER NOT NULL REFERENCES issues(id),
    status           TEXT NOT NULL,
    provider         TEXT NOT NULL DEFAULT '',
    model            TEXT NOT NULL DEFAULT '',
    started_at       TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    finished_at      TEXT,
    turns            INTEGER NOT NULL DEFAULT 0,
    cost_usd         REAL NOT NULL DEFAULT 0,
    pr_url           TEXT,
    workdir          TEXT NOT NULL DEFAULT '',
    resumable        INTEGER NOT NULL DEFAULT 0,
    error            TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
    ON sessions(issue_id) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS transitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity      TEXT NOT NULL,
    entity_id   INTEGER NOT NULL,
    from_state  TEXT NOT NULL,
    to_state    TEXT NOT NULL,
    session_id  INTEGER,
    reason      TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_entity ON transitions(entity, entity_id);

CREATE TABLE IF NOT EXISTS budget_ledger (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    day         TEXT NOT NULL,
    month       TEXT NOT NULL,
    session_id  INTEGER NOT NULL,
    cost_usd    REAL NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_day ON budget_ledger(day);
CREATE INDEX IF NOT EXISTS idx_ledger_month ON budget_ledger(month);

CREATE TABLE IF NOT EXISTS proposal_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    day         TEXT NOT NULL,
    project     TEXT NOT NULL,
    session_id  INTEGER NOT NULL,
    pr_url      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_proposal_log_day ON proposal_log(day, project);
"#;

/// Durable state store.
///
/// One `Connection` behind a mutex: every write serialises here, making the
/// store the single writer for durable state. Each public write method is one
/// logical transaction; readers see pre- or post-state, never a partial one.
pub struct Store {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

/// Local calendar day (`YYYY-MM-DD`); budget windows reset at local midnight.
pub fn local_day() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Local calendar month (`YYYY-MM`).
pub fn local_month() -> String {
    chrono::Local::now().format("%Y-%m").to_string()
}

fn storage(e: rusqlite::Error) -> anyhow::Error {
    anyhow::Error::new(Error::Storage(e.to_string()))
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_issue(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    let labels_json: String = row.get(7)?;
    let state_str: String = row.get(10)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    Ok(Issue {
        id: row.get(0)?,
        host: row.get(1)?,
        project: row.get(2)?,
        number: row.get(3)?,
        url: row.get(4)?,
        title: row.get(5)?,
        body: row.get(6)?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        author: row.get(8)?,
        assignee: row.get(9)?,
        state: IssueState::parse(&state_str).unwrap_or(IssueState::Discovered),
        pr_url: row.get(11)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const ISSUE_COLS: &str = "id, host, project, number, url, title, body, labels, author, \
     assignee, state, pr_url, created_at, updated_at";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status_str: String = row.get(2)?;
    let started_at: String = row.get(5)?;
    let last_activity_at: String = row.get(6)?;
    let finished_at: Option<String> = row.get(7)?;
    let resumable: i64 = row.get(12)?;
    Ok(Session {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Failed),
        provider: row.get(3)?,
        model: row.get(4)?,
        started_at: parse_ts(&started_at),
        last_activity_at: parse_ts(&last_activity_at),
        finished_at: finished_at.as_deref().map(parse_ts),
        turns: row.get(8)?,
        cost_usd: row.get(9)?,
        pr_url: row.get(10)?,
        workdir: row.get(11)?,
        resumable: resumable != 0,
        error: row.get(13)?,
    })
}

const SESSION_COLS: &str = "id, issue_id, status, provider, model, started_at, \
     last_activity_at, finished_at, turns, cost_usd, pr_url, workdir, resumable, error";

fn row_to_transition(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transition> {
    let entity_str: String = row.get(1)?;
    let created_at: String = row.get(7)?;
    Ok(Transition {
        id: row.get(0)?,
        entity: if entity_str == "session" {
            TransitionEntity::Session
        } else {
            TransitionEntity::Issue
        },
        entity_id: row.get(2)?,
        from_state: row.get(3)?,
        to_state: row.get(4)?,
        session_id: row.get(5)?,
        reason: row.get(6)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_ledger(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let created_at: String = row.get(5)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        day: row.get(1)?,
        month: row.get(2)?,
        session_id: row.get(3)?,
        cost_usd: row.get(4)?,
        created_at: parse_ts(&created_at),
    })
}

// ── Store impl ────────────────────────────────────────────────────────────

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        conn.execute_batch(SCHEMA_SQL).map_err(storage)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).map_err(storage)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(|e| e.into_inner());
        conn.close().map_err(|(_, e)| storage(e))
    }

    // ── Issues ────────────────────────────────────────────────────────────

    /// Insert or update an issue keyed by its URL. Returns the row id.
    ///
    /// Does not touch `state` on update; state changes go through
    /// [`Store::transition_issue`] only.
    pub fn save_issue(&self, issue: &Issue) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let labels = serde_json::to_string(&issue.labels).unwrap_or_else(|_| "[]".into());
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM issues WHERE url = ?1", params![issue.url], |r| r.get(0))
            .optional()
            .map_err(storage)?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE issues SET title = ?1, body = ?2, labels = ?3, author = ?4, \
                     assignee = ?5, updated_at = ?6 WHERE id = ?7",
                    params![issue.title, issue.body, labels, issue.author, issue.assignee, now_str(), id],
                )
                .map_err(storage)?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO issues (host, project, number, url, title, body, labels, \
                     author, assignee, state, pr_url, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        issue.host,
                        issue.project,
                        issue.number,
                        issue.url,
                        issue.title,
                        issue.body,
                        labels,
                        issue.author,
                        issue.assignee,
                        issue.state.as_str(),
                        issue.pr_url,
                        now_str(),
                        now_str(),
                    ],
                )
                .map_err(storage)?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {ISSUE_COLS} FROM issues WHERE id = ?1"),
            params![id],
            row_to_issue,
        )
        .optional()
        .map_err(storage)
    }

    pub fn get_issue_by_url(&self, url: &str) -> Result<Option<Issue>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {ISSUE_COLS} FROM issues WHERE url = ?1"),
            params![url],
            row_to_issue,
        )
        .optional()
        .map_err(storage)
    }

    pub fn list_by_state(&self, state: IssueState) -> Result<Vec<Issue>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ISSUE_COLS} FROM issues WHERE state = ?1 ORDER BY id ASC"
            ))
            .map_err(storage)?;
        let issues = stmt
            .query_map(params![state.as_str()], row_to_issue)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(issues)
    }

    /// Counts of issues per state, for `status` output.
    pub fn count_by_state(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM issues GROUP BY state ORDER BY state")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(rows)
    }

    /// Apply a validated state change to an issue and append its transition
    /// record, atomically.
    pub fn transition_issue(
        &self,
        id: i64,
        to: IssueState,
        reason: Option<&str>,
        session_id: Option<i64>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().map_err(storage)?;

        let state_str: Option<String> = tx
            .query_row("SELECT state FROM issues WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(storage)?;
        let from = state_str
            .as_deref()
            .and_then(IssueState::parse)
            .ok_or_else(|| anyhow::Error::new(Error::NotFound(format!("issue {id}"))))?;

        if !from.can_transition_to(to) {
            return Err(anyhow::Error::new(Error::InvalidTransition {
                entity: "issue",
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }));
        }

        tx.execute(
            "UPDATE issues SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![to.as_str(), now_str(), id],
        )
        .map_err(storage)?;
        tx.execute(
            "INSERT INTO transitions (entity, entity_id, from_state, to_state, session_id, reason, created_at) \
             VALUES ('issue', ?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, from.as_str(), to.as_str(), session_id, reason, now_str()],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        Ok(())
    }

    pub fn set_issue_pr_url(&self, id: i64, pr_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE issues SET pr_url = ?1, updated_at = ?2 WHERE id = ?3",
            params![pr_url, now_str(), id],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn get_issue_by_pr_url(&self, pr_url: &str) -> Result<Option<Issue>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {ISSUE_COLS} FROM issues WHERE pr_url = ?1"),
            params![pr_url],
            row_to_issue,
        )
        .optional()
        .map_err(storage)
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    /// Create a new `active` session for an issue.
    ///
    /// At most one active session may exist per issue; a second create fails
    /// with `InvalidTransition` (also enforced by a partial unique index).
    pub fn create_session(
        &self,
        issue_id: i64,
        provider: &str,
        model: &str,
        workdir: &str,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().map_err(storage)?;

        let active: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE issue_id = ?1 AND status = 'active'",
                params![issue_id],
                |r| r.get(0),
            )
            .map_err(storage)?;
        if active > 0 {
            return Err(anyhow::Error::new(Error::InvalidTransition {
                entity: "session",
                from: "active".into(),
                to: "active".into(),
            }));
        }

        tx.execute(
            "INSERT INTO sessions (issue_id, status, provider, model, started_at, \
             last_activity_at, workdir) VALUES (?1, 'active', ?2, ?3, ?4, ?5, ?6)",
            params![issue_id, provider, model, now_str(), now_str(), workdir],
        )
        .map_err(storage)?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO transitions (entity, entity_id, from_state, to_state, session_id, reason, created_at) \
             VALUES ('session', ?1, 'created', 'active', ?1, NULL, ?2)",
            params![id, now_str()],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        Ok(id)
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
            params![id],
            row_to_session,
        )
        .optional()
        .map_err(storage)
    }

    pub fn active_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLS} FROM sessions WHERE status = 'active' ORDER BY id ASC"
            ))
            .map_err(storage)?;
        let sessions = stmt
            .query_map([], row_to_session)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(sessions)
    }

    pub fn transition_session(
        &self,
        id: i64,
        to: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().map_err(storage)?;

        let status_str: Option<String> = tx
            .query_row("SELECT status FROM sessions WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(storage)?;
        let from = status_str
            .as_deref()
            .and_then(SessionStatus::parse)
            .ok_or_else(|| anyhow::Error::new(Error::NotFound(format!("session {id}"))))?;

        if !from.can_transition_to(to) {
            return Err(anyhow::Error::new(Error::InvalidTransition {
                entity: "session",
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }));
        }

        let finished = if to.is_terminal() { Some(now_str()) } else { None };
        tx.execute(
            "UPDATE sessions SET status = ?1, error = COALESCE(?2, error), \
             finished_at = COALESCE(?3, finished_at), last_activity_at = ?4 WHERE id = ?5",
            params![to.as_str(), error, finished, now_str(), id],
        )
        .map_err(storage)?;
        tx.execute(
            "INSERT INTO transitions (entity, entity_id, from_state, to_state, session_id, reason, created_at) \
             VALUES ('session', ?1, ?2, ?3, ?1, ?4, ?5)",
            params![id, from.as_str(), to.as_str(), error, now_str()],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        Ok(())
    }

    /// Add a cost delta and turn count to a session and refresh its activity
    /// timestamp. Cost only ever grows.
    pub fn update_session_metrics(
        &self,
        id: i64,
        cost_delta: f64,
        turns_delta: i64,
    ) -> Result<()> {
        if cost_delta < 0.0 {
            return Err(anyhow::Error::new(Error::Storage(format!(
                "negative cost delta {cost_delta} for session {id}"
            ))));
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn
            .execute(
                "UPDATE sessions SET cost_usd = cost_usd + ?1, turns = turns + ?2, \
                 last_activity_at = ?3 WHERE id = ?4",
                params![cost_delta, turns_delta, now_str(), id],
            )
            .map_err(storage)?;
        if updated == 0 {
            return Err(anyhow::Error::new(Error::NotFound(format!("session {id}"))));
        }
        Ok(())
    }

    pub fn touch_session(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn set_session_pr_url(&self, id: i64, pr_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE sessions SET pr_url = ?1, last_activity_at = ?2 WHERE id = ?3",
            params![pr_url, now_str(), id],
        )
        .map_err(storage)?;
        Ok(())
    }

    /// Crash recovery: fail every session left `active` by a previous run.
    /// Returns the number of sessions recovered.
    pub fn fail_orphaned_sessions(&self) -> Result<usize> {
        let ids: Vec<i64> = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare("SELECT id FROM sessions WHERE status = 'active'")
                .map_err(storage)?;
            let rows = stmt
                .query_map([], |r| r.get(0))
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            rows
        };
        for id in &ids {
            self.transition_session(*id, SessionStatus::Failed, Some("orphaned by restart"))?;
        }
        Ok(ids.len())
    }

    // ── Transitions ───────────────────────────────────────────────────────

    pub fn list_transitions(&self, issue_id: i64) -> Result<Vec<Transition>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT id, entity, entity_id, from_state, to_state, session_id, reason, created_at \
                 FROM transitions WHERE entity = 'issue' AND entity_id = ?1 ORDER BY id ASC",
            )
            .map_err(storage)?;
        let transitions = stmt
            .query_map(params![issue_id], row_to_transition)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(transitions)
    }

    // ── Budget ledger ─────────────────────────────────────────────────────

    /// Append a spend record. Ledger rows are never updated or deleted.
    pub fn record_cost(&self, session_id: i64, cost_usd: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO budget_ledger (day, month, session_id, cost_usd, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![local_day(), local_month(), session_id, cost_usd, now_str()],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn today_cost(&self) -> Result<f64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sum: Option<f64> = conn
            .query_row(
                "SELECT SUM(cost_usd) FROM budget_ledger WHERE day = ?1",
                params![local_day()],
                |r| r.get(0),
            )
            .map_err(storage)?;
        Ok(sum.unwrap_or(0.0))
    }

    pub fn month_cost(&self) -> Result<f64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sum: Option<f64> = conn
            .query_row(
                "SELECT SUM(cost_usd) FROM budget_ledger WHERE month = ?1",
                params![local_month()],
                |r| r.get(0),
            )
            .map_err(storage)?;
        Ok(sum.unwrap_or(0.0))
    }

    pub fn ledger_for_session(&self, session_id: i64) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT id, day, month, session_id, cost_usd, created_at \
                 FROM budget_ledger WHERE session_id = ?1 ORDER BY id ASC",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![session_id], row_to_ledger)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(rows)
    }

    // ── Proposal counters ─────────────────────────────────────────────────

    pub fn record_proposal(&self, project: &str, session_id: i64, pr_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO proposal_log (day, project, session_id, pr_url, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![local_day(), project, session_id, pr_url, now_str()],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn today_proposal_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*) FROM proposal_log WHERE day = ?1",
            params![local_day()],
            |r| r.get(0),
        )
        .map_err(storage)
    }

    /// Today's proposals grouped by project. Keys are `owner/repo` verbatim.
    pub fn today_proposal_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT project, COUNT(*) FROM proposal_log WHERE day = ?1 \
                 GROUP BY project ORDER BY project",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![local_day()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(rows)
    }

    pub fn today_proposal_count_for(&self, project: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*) FROM proposal_log WHERE day = ?1 AND project = ?2",
            params![local_day(), project],
            |r| r.get(0),
        )
        .map_err(storage)
    }
}
