use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use remedy_core::{
    engine::Engine,
    feedback::parse_feedback,
    host::ConclusionMap,
    types::IssueState,
};

type HmacSha256 = Hmac<Sha256>;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub secret: String,
    pub allowed_repos: Vec<String>,
    pub auto_iterate: bool,
    pub delete_branch_on_merge: bool,
    pub bot_authors: Vec<String>,
}

impl AppState {
    fn repo_allowed(&self, project: &str) -> bool {
        self.allowed_repos.is_empty() || self.allowed_repos.iter().any(|r| r == project)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(webhook))
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `X-Hub-Signature-256: sha256=<hex(HMAC-SHA256(secret, body))>`, compared
/// in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else { return false };
    let Some(hex_sig) = header.strip_prefix("sha256=") else { return false };
    let Ok(sig) = hex::decode(hex_sig) else { return false };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let signature = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok());
    if !verify_signature(&state.secret, &body, signature) {
        warn!("webhook: signature verification failed");
        return (StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::OK, "Ignored"),
    };

    let project = payload
        .pointer("/repository/full_name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if event != "ping" && !state.repo_allowed(&project) {
        info!("webhook: ignoring event for {project} (not in allowlist)");
        return (StatusCode::OK, "Ignored");
    }

    match event.as_str() {
        "ping" => (StatusCode::OK, "OK"),
        "pull_request" => handle_pull_request(&state, &payload).await,
        "pull_request_review" | "pull_request_review_comment" | "issue_comment" => {
            handle_feedback_event(&state, &event, &payload)
        }
        "check_run" | "check_suite" => handle_check_event(&state, &payload),
        _ => (StatusCode::OK, "Ignored"),
    }
}

async fn handle_pull_request(state: &Arc<AppState>, payload: &Value) -> (StatusCode, &'static str) {
    let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
    if action != "closed" {
        return (StatusCode::OK, "Ignored");
    }
    let Some(pr_url) = payload.pointer("/pull_request/html_url").and_then(Value::as_str) else {
        return (StatusCode::OK, "Ignored");
    };
    let merged = payload
        .pointer("/pull_request/merged")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let target = if merged { IssueState::Merged } else { IssueState::Closed };

    match state.engine.store.get_issue_by_pr_url(pr_url) {
        Ok(Some(issue)) => {
            if let Err(e) = state.engine.store.transition_issue(issue.id, target, None, None) {
                warn!("webhook: settle {pr_url} as {target}: {e}");
            } else {
                info!("webhook: {pr_url} {target}");
            }
        }
        Ok(None) => info!("webhook: untracked proposal {pr_url} {target}"),
        Err(e) => warn!("webhook: lookup {pr_url}: {e}"),
    }

    if merged && state.delete_branch_on_merge {
        let project = payload
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let branch = payload
            .pointer("/pull_request/head/ref")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if !branch.is_empty() {
            let host = Arc::clone(&state.engine.host);
            tokio::spawn(async move {
                if let Err(e) = host.delete_branch(&project, &branch).await {
                    warn!("webhook: delete branch {branch}: {e}");
                }
            });
        }
    }
    (StatusCode::OK, "OK")
}

fn handle_feedback_event(
    state: &Arc<AppState>,
    event: &str,
    payload: &Value,
) -> (StatusCode, &'static str) {
    // issue_comment fires for plain issues too; only PR comments matter here.
    let pr_url = payload
        .pointer("/pull_request/html_url")
        .or_else(|| payload.pointer("/issue/pull_request/html_url"))
        .and_then(Value::as_str);
    let Some(pr_url) = pr_url else {
        return (StatusCode::OK, "Ignored");
    };
    let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
    if !matches!(action, "submitted" | "created") {
        return (StatusCode::OK, "Ignored");
    }

    info!("webhook: {event} on {pr_url}");
    if state.auto_iterate {
        spawn_iteration(state, pr_url.to_string());
    }
    (StatusCode::OK, "OK")
}

fn handle_check_event(state: &Arc<AppState>, payload: &Value) -> (StatusCode, &'static str) {
    let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
    let conclusion = payload
        .pointer("/check_run/conclusion")
        .or_else(|| payload.pointer("/check_suite/conclusion"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if action != "completed" || conclusion != "failure" {
        return (StatusCode::OK, "Ignored");
    }
    let pr_url = payload
        .pointer("/check_run/pull_requests/0/html_url")
        .or_else(|| payload.pointer("/check_suite/pull_requests/0/html_url"))
        .and_then(Value::as_str);
    let Some(pr_url) = pr_url else {
        return (StatusCode::OK, "Ignored");
    };

    info!("webhook: failing check on {pr_url}");
    if state.auto_iterate {
        spawn_iteration(state, pr_url.to_string());
    }
    (StatusCode::OK, "OK")
}

/// Fetch fresh feedback and drive one iteration if anything is actionable.
pub(crate) fn spawn_iteration(state: &Arc<AppState>, pr_url: String) {
    let engine = Arc::clone(&state.engine);
    let bots = state.bot_authors.clone();
    tokio::spawn(async move {
        let feedback = match engine.host.fetch_feedback(&pr_url).await {
            Ok(f) => f,
            Err(e) => {
                warn!("webhook iteration: fetch feedback {pr_url}: {e}");
                return;
            }
        };
        let parsed = parse_feedback(&feedback, &bots, &ConclusionMap::default());
        if parsed.items.is_empty() {
            info!("webhook iteration: nothing actionable on {pr_url}");
            return;
        }
        info!("webhook iteration: {} on {pr_url}", parsed.summary);
        if let Err(e) = engine.iterate(&pr_url, &parsed.items, CancellationToken::new()).await {
            warn!("webhook iteration on {pr_url} failed: {e}");
        }
    });
}
