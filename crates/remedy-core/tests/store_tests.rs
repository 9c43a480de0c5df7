use remedy_core::db::Store;
use remedy_core::types::{Issue, IssueState, SessionStatus};
use remedy_core::Error;

use chrono::Utc;

fn fresh_issue(url: &str) -> Issue {
    Issue {
        id: 0,
        host: "github".into(),
        project: "acme/app".into(),
        number: 42,
        url: url.into(),
        title: "Fix login".into(),
        body: "login is broken".into(),
        labels: vec!["bug".into()],
        author: "reporter".into(),
        assignee: None,
        state: IssueState::Discovered,
        pr_url: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn store_with_issue() -> (Store, i64) {
    let store = Store::open_in_memory().expect("open");
    let id = store.save_issue(&fresh_issue("https://github.com/acme/app/issues/42")).expect("save");
    (store, id)
}

#[test]
fn save_is_upsert_by_url() {
    let (store, id) = store_with_issue();
    let mut again = fresh_issue("https://github.com/acme/app/issues/42");
    again.title = "Fix login flow".into();
    let id2 = store.save_issue(&again).expect("update");
    assert_eq!(id, id2);
    let loaded = store.get_issue(id).expect("get").expect("present");
    assert_eq!(loaded.title, "Fix login flow");
    assert_eq!(loaded.labels, vec!["bug".to_string()]);
}

#[test]
fn upsert_does_not_touch_state() {
    let (store, id) = store_with_issue();
    store.transition_issue(id, IssueState::Queued, None, None).expect("queue");
    store.save_issue(&fresh_issue("https://github.com/acme/app/issues/42")).expect("resave");
    let loaded = store.get_issue(id).expect("get").expect("present");
    assert_eq!(loaded.state, IssueState::Queued);
}

#[test]
fn legal_transition_chain_records_history() {
    let (store, id) = store_with_issue();
    store.transition_issue(id, IssueState::Queued, None, None).expect("queued");
    store.transition_issue(id, IssueState::InProgress, None, None).expect("in_progress");
    store
        .transition_issue(id, IssueState::PrCreated, None, Some(7))
        .expect("pr_created");

    let history = store.list_transitions(id).expect("history");
    let pairs: Vec<(String, String)> = history
        .iter()
        .map(|t| (t.from_state.clone(), t.to_state.clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("discovered".to_string(), "queued".to_string()),
            ("queued".to_string(), "in_progress".to_string()),
            ("in_progress".to_string(), "pr_created".to_string()),
        ]
    );
    // History is totally ordered by id.
    let ids: Vec<i64> = history.iter().map(|t| t.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    assert_eq!(history.last().and_then(|t| t.session_id), Some(7));
}

#[test]
fn illegal_transition_is_rejected_and_unrecorded() {
    let (store, id) = store_with_issue();
    let err = store
        .transition_issue(id, IssueState::Merged, None, None)
        .expect_err("discovered -> merged must fail");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidTransition { .. })
    ));
    let issue = store.get_issue(id).expect("get").expect("present");
    assert_eq!(issue.state, IssueState::Discovered);
    assert!(store.list_transitions(id).expect("history").is_empty());
}

#[test]
fn terminal_states_absorb() {
    let (store, id) = store_with_issue();
    for to in [IssueState::Queued, IssueState::Abandoned] {
        if to == IssueState::Abandoned {
            store.transition_issue(id, to, Some("won't fix"), None).expect("abandon");
        } else {
            store.transition_issue(id, to, None, None).expect("queue");
        }
    }
    let err = store.transition_issue(id, IssueState::Queued, None, None).expect_err("terminal");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidTransition { .. })));
}

#[test]
fn transition_missing_issue_is_not_found() {
    let store = Store::open_in_memory().expect("open");
    let err = store.transition_issue(999, IssueState::Queued, None, None).expect_err("missing");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
}

#[test]
fn one_active_session_per_issue() {
    let (store, id) = store_with_issue();
    let s1 = store.create_session(id, "claude", "m", "/tmp/wc").expect("first");
    let err = store.create_session(id, "claude", "m", "/tmp/wc").expect_err("second");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidTransition { .. })));

    store.transition_session(s1, SessionStatus::Completed, None).expect("complete");
    // Once the first session is terminal a new one is allowed.
    store.create_session(id, "claude", "m", "/tmp/wc").expect("third");
    assert_eq!(store.active_sessions().expect("active").len(), 1);
}

#[test]
fn session_transitions_follow_the_table() {
    let (store, id) = store_with_issue();
    let s = store.create_session(id, "claude", "m", "/tmp/wc").expect("create");
    store.transition_session(s, SessionStatus::Paused, None).expect("pause");
    store.transition_session(s, SessionStatus::Active, None).expect("resume");
    store.transition_session(s, SessionStatus::Failed, Some("boom")).expect("fail");
    let err = store
        .transition_session(s, SessionStatus::Active, None)
        .expect_err("failed is terminal");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidTransition { .. })));

    let session = store.get_session(s).expect("get").expect("present");
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.error.as_deref(), Some("boom"));
    assert!(session.finished_at.is_some());
}

#[test]
fn session_cost_is_monotone_and_matches_ledger() {
    let (store, id) = store_with_issue();
    let s = store.create_session(id, "claude", "m", "/tmp/wc").expect("create");

    let deltas = [0.013, 0.002, 0.145, 0.0004];
    let mut last = 0.0;
    for d in deltas {
        store.update_session_metrics(s, d, 1).expect("metrics");
        store.record_cost(s, d).expect("ledger");
        let cost = store.get_session(s).expect("get").expect("present").cost_usd;
        assert!(cost >= last, "cost must never decrease");
        last = cost;
    }

    let session = store.get_session(s).expect("get").expect("present");
    let ledger_sum: f64 =
        store.ledger_for_session(s).expect("ledger").iter().map(|e| e.cost_usd).sum();
    assert!((ledger_sum - session.cost_usd).abs() < 1e-9);
    assert_eq!(session.turns, 4);
}

#[test]
fn negative_cost_delta_is_rejected() {
    let (store, id) = store_with_issue();
    let s = store.create_session(id, "claude", "m", "/tmp/wc").expect("create");
    assert!(store.update_session_metrics(s, -0.5, 0).is_err());
}

#[test]
fn cost_queries_cover_today_and_month() {
    let (store, id) = store_with_issue();
    let s = store.create_session(id, "claude", "m", "/tmp/wc").expect("create");
    store.record_cost(s, 1.25).expect("a");
    store.record_cost(s, 0.75).expect("b");
    assert!((store.today_cost().expect("today") - 2.0).abs() < 1e-9);
    assert!((store.month_cost().expect("month") - 2.0).abs() < 1e-9);
}

#[test]
fn proposal_counts_group_by_verbatim_project() {
    let (store, id) = store_with_issue();
    let s = store.create_session(id, "claude", "m", "/tmp/wc").expect("create");
    store.record_proposal("acme/app", s, "https://github.com/acme/app/pull/1").expect("p1");
    store.record_proposal("acme/app", s, "https://github.com/acme/app/pull/2").expect("p2");
    store.record_proposal("Acme/app", s, "https://github.com/Acme/app/pull/3").expect("p3");

    assert_eq!(store.today_proposal_count().expect("total"), 3);
    assert_eq!(store.today_proposal_count_for("acme/app").expect("per"), 2);
    // No case folding: Acme/app is a distinct key.
    assert_eq!(store.today_proposal_count_for("Acme/app").expect("per"), 1);
}

#[test]
fn orphaned_sessions_fail_on_recovery() {
    let (store, id) = store_with_issue();
    store.create_session(id, "claude", "m", "/tmp/wc").expect("create");
    let recovered = store.fail_orphaned_sessions().expect("recover");
    assert_eq!(recovered, 1);
    assert!(store.active_sessions().expect("active").is_empty());

    let issue2 = {
        let mut i = fresh_issue("https://github.com/acme/app/issues/43");
        i.number = 43;
        store.save_issue(&i).expect("save")
    };
    let s = store.create_session(issue2, "claude", "m", "/tmp").expect("create");
    let session = store.get_session(s).expect("get").expect("present");
    assert_eq!(session.status, SessionStatus::Active);
}

#[test]
fn pr_url_lookup() {
    let (store, id) = store_with_issue();
    store.set_issue_pr_url(id, "https://github.com/acme/app/pull/9").expect("set");
    let found = store
        .get_issue_by_pr_url("https://github.com/acme/app/pull/9")
        .expect("lookup")
        .expect("present");
    assert_eq!(found.id, id);
}
