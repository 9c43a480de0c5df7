mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::MockHost;
use remedy_core::host::{
    CheckRun, ConclusionMap, ProposalFeedback, ProposalInfo, ProposalState, ReviewComment,
};
use remedy_core::monitor::Monitor;
use remedy_core::types::MonitorEvent;

fn proposal(url: &str, state: ProposalState) -> ProposalInfo {
    ProposalInfo {
        url: url.into(),
        number: 7,
        state,
        head_branch: "remedy/issue-42".into(),
        title: "Fix login".into(),
    }
}

fn comment(id: i64, author: &str, body: &str) -> ReviewComment {
    ReviewComment {
        id,
        author: author.into(),
        body: body.into(),
        path: None,
        line: None,
        in_reply_to: None,
        created_at: None,
    }
}

#[tokio::test]
async fn new_feedback_is_emitted_once() {
    let host = Arc::new(MockHost::new());
    let url = "https://github.com/acme/app/pull/7".to_string();
    host.feedback.lock().unwrap().insert(
        url.clone(),
        ProposalFeedback {
            proposal: proposal(&url, ProposalState::Open),
            reviews: vec![],
            comments: vec![comment(1, "alice", "this crashes on empty input")],
            check_runs: vec![],
        },
    );

    let (monitor, mut rx) =
        Monitor::new(host.clone(), vec![], ConclusionMap::default());
    let urls = vec![url.clone()];
    let mut snapshots = HashMap::new();

    assert!(monitor.poll_once(&urls, &mut snapshots).await);
    match rx.try_recv().expect("feedback event") {
        MonitorEvent::Feedback { pr_url, items, .. } => {
            assert_eq!(pr_url, url);
            assert_eq!(items.len(), 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Unchanged feedback: second poll is quiet.
    assert!(!monitor.poll_once(&urls, &mut snapshots).await);
    assert!(rx.try_recv().is_err());

    // A new comment produces exactly the fresh item.
    host.feedback
        .lock()
        .unwrap()
        .get_mut(&url)
        .expect("entry")
        .comments
        .push(comment(2, "bob", "please add a test"));
    assert!(monitor.poll_once(&urls, &mut snapshots).await);
    match rx.try_recv().expect("second feedback event") {
        MonitorEvent::Feedback { items, .. } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].author, "bob");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn check_transitions_emit_checks_changed() {
    let host = Arc::new(MockHost::new());
    let url = "https://github.com/acme/app/pull/7".to_string();
    host.feedback.lock().unwrap().insert(
        url.clone(),
        ProposalFeedback {
            proposal: proposal(&url, ProposalState::Open),
            reviews: vec![],
            comments: vec![],
            check_runs: vec![CheckRun {
                name: "ci/build".into(),
                status: "completed".into(),
                conclusion: Some("failure".into()),
            }],
        },
    );

    let (monitor, mut rx) = Monitor::new(host.clone(), vec![], ConclusionMap::default());
    let urls = vec![url.clone()];
    let mut snapshots = HashMap::new();

    assert!(monitor.poll_once(&urls, &mut snapshots).await);
    // Failing check shows up both as a feedback item and a checks event.
    let mut saw_checks = false;
    while let Ok(event) = rx.try_recv() {
        if let MonitorEvent::ChecksChanged { failing, .. } = event {
            assert_eq!(failing, vec!["ci/build".to_string()]);
            saw_checks = true;
        }
    }
    assert!(saw_checks);

    // The check going green changes the failing set again.
    host.feedback.lock().unwrap().get_mut(&url).expect("entry").check_runs[0].conclusion =
        Some("success".into());
    assert!(monitor.poll_once(&urls, &mut snapshots).await);
    let mut saw_green = false;
    while let Ok(event) = rx.try_recv() {
        if let MonitorEvent::ChecksChanged { failing, .. } = event {
            assert!(failing.is_empty());
            saw_green = true;
        }
    }
    assert!(saw_green);
}

#[tokio::test]
async fn merged_proposal_emits_once_and_goes_quiet() {
    let host = Arc::new(MockHost::new());
    let url = "https://github.com/acme/app/pull/7".to_string();
    host.feedback.lock().unwrap().insert(
        url.clone(),
        ProposalFeedback {
            proposal: proposal(&url, ProposalState::Merged),
            reviews: vec![],
            comments: vec![],
            check_runs: vec![],
        },
    );

    let (monitor, mut rx) = Monitor::new(host.clone(), vec![], ConclusionMap::default());
    let urls = vec![url.clone()];
    let mut snapshots = HashMap::new();

    assert!(monitor.poll_once(&urls, &mut snapshots).await);
    assert!(matches!(rx.try_recv(), Ok(MonitorEvent::Merged { .. })));

    // Terminal proposals are not polled again.
    assert!(!monitor.poll_once(&urls, &mut snapshots).await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn fetch_errors_surface_as_error_events() {
    let host = Arc::new(MockHost::new());
    let url = "https://github.com/acme/app/pull/404".to_string();

    let (monitor, mut rx) = Monitor::new(host, vec![], ConclusionMap::default());
    let mut snapshots = HashMap::new();
    assert!(!monitor.poll_once(&[url.clone()], &mut snapshots).await);
    match rx.try_recv().expect("error event") {
        MonitorEvent::Error { pr_url, .. } => assert_eq!(pr_url, url),
        other => panic!("unexpected event {other:?}"),
    }
}
