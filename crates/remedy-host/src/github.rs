use anyhow::{Context, Result};
use async_trait::async_trait;
use remedy_core::host::{
    CheckRun, HostClient, IssueRef, ProposalFeedback, ProposalInfo, ProposalState, RemoteIssue,
    Review, ReviewComment,
};
use remedy_core::retry::parse_retry_after;
use remedy_core::Error;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::types::{
    CheckRunsWire, IssueCommentWire, IssueWire, PullWire, ReviewCommentWire, ReviewWire,
};
use crate::url::{parse_url, Provider, ResourceKind};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "remedy";

/// GitHub REST implementation of the host seam.
pub struct GithubClient {
    client: Client,
    token: String,
    api_base: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>, http_timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_millis(http_timeout_ms))
            .build()
            .context("build http client")?;
        Ok(Self { client, token: token.into(), api_base: API_BASE.to_string() })
    }

    /// Point the client at a different API root (tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(self.client.get(format!("{}{path}", self.api_base)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(self.client.post(format!("{}{path}", self.api_base)))
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(self.client.delete(format!("{}{path}", self.api_base)))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Accept", "application/vnd.github+json");
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    /// Map HTTP failures onto the error taxonomy: 429/secondary limits to
    /// `RateLimited` (carrying `retry-after`), 404 to `NotFound`, 5xx to
    /// retryable `Network`.
    async fn checked(&self, resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, 30_000));
        let body = resp.text().await.unwrap_or_default();
        let detail = format!("{what}: {status} {}", truncate(&body, 200));

        let err = match status {
            StatusCode::NOT_FOUND => Error::NotFound(detail),
            StatusCode::TOO_MANY_REQUESTS => {
                Error::RateLimited { reason: detail, retry_after_ms: retry_after }
            }
            StatusCode::FORBIDDEN if retry_after.is_some() || body.contains("rate limit") => {
                Error::RateLimited { reason: detail, retry_after_ms: retry_after }
            }
            s if s.is_server_error() => Error::Network(detail),
            _ => Error::Unknown(detail),
        };
        Err(anyhow::Error::new(err))
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<Response> {
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                anyhow::Error::new(Error::Network(format!("{what}: {e}")))
            } else {
                anyhow::Error::new(Error::Unknown(format!("{what}: {e}")))
            }
        })?;
        self.checked(resp, what).await
    }

    fn pull_path(&self, pr_url: &str) -> Result<(String, i64)> {
        let r = parse_url(pr_url)?;
        if r.kind != ResourceKind::Proposal || r.provider != Provider::GitHub {
            return Err(anyhow::Error::new(Error::Configuration(format!(
                "not a GitHub proposal URL: {pr_url}"
            ))));
        }
        Ok((r.project(), r.number))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn to_proposal(pull: &PullWire) -> ProposalInfo {
    let state = if pull.merged_at.is_some() {
        ProposalState::Merged
    } else if pull.state == "closed" {
        ProposalState::Closed
    } else {
        ProposalState::Open
    };
    ProposalInfo {
        url: pull.html_url.clone(),
        number: pull.number,
        state,
        head_branch: pull.head.branch.clone(),
        title: pull.title.clone(),
    }
}

#[async_trait]
impl HostClient for GithubClient {
    fn parse_issue_url(&self, url: &str) -> Result<IssueRef> {
        let r = parse_url(url)?;
        if r.kind != ResourceKind::Issue {
            return Err(anyhow::Error::new(Error::Configuration(format!(
                "not an issue URL: {url}"
            ))));
        }
        Ok(IssueRef { owner: r.owner, repo: r.repo, number: r.number })
    }

    fn parse_proposal_url(&self, url: &str) -> Result<(String, i64)> {
        self.pull_path(url)
    }

    async fn get_issue(&self, issue: &IssueRef) -> Result<RemoteIssue> {
        let path = format!("/repos/{}/{}/issues/{}", issue.owner, issue.repo, issue.number);
        let wire: IssueWire = self
            .send(self.get(&path), "get issue")
            .await?
            .json()
            .await
            .map_err(|e| anyhow::Error::new(Error::Unknown(format!("decode issue: {e}"))))?;
        Ok(RemoteIssue {
            title: wire.title,
            body: wire.body.unwrap_or_default(),
            labels: wire.labels.into_iter().map(|l| l.name).collect(),
            author: wire.user.login,
            assignee: wire.assignee.map(|u| u.login),
        })
    }

    fn remote_url(&self, project: &str) -> String {
        if self.token.is_empty() {
            format!("https://github.com/{project}.git")
        } else {
            format!("https://x-access-token:{}@github.com/{project}.git", self.token)
        }
    }

    async fn create_proposal(
        &self,
        project: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<ProposalInfo> {
        let path = format!("/repos/{project}/pulls");
        let payload = json!({
            "title": title,
            "head": head_branch,
            "base": base_branch,
            "body": body,
        });
        let wire: PullWire = self
            .send(self.post(&path).json(&payload), "create proposal")
            .await?
            .json()
            .await
            .map_err(|e| anyhow::Error::new(Error::Unknown(format!("decode pull: {e}"))))?;
        debug!("created proposal {}", wire.html_url);
        Ok(to_proposal(&wire))
    }

    async fn get_proposal(&self, pr_url: &str) -> Result<ProposalInfo> {
        let (project, number) = self.pull_path(pr_url)?;
        let path = format!("/repos/{project}/pulls/{number}");
        let wire: PullWire = self
            .send(self.get(&path), "get proposal")
            .await?
            .json()
            .await
            .map_err(|e| anyhow::Error::new(Error::Unknown(format!("decode pull: {e}"))))?;
        Ok(to_proposal(&wire))
    }

    async fn fetch_feedback(&self, pr_url: &str) -> Result<ProposalFeedback> {
        let (project, number) = self.pull_path(pr_url)?;

        let pull: PullWire = self
            .send(self.get(&format!("/repos/{project}/pulls/{number}")), "get proposal")
            .await?
            .json()
            .await
            .map_err(|e| anyhow::Error::new(Error::Unknown(format!("decode pull: {e}"))))?;

        let reviews: Vec<ReviewWire> = self
            .send(
                self.get(&format!("/repos/{project}/pulls/{number}/reviews")),
                "list reviews",
            )
            .await?
            .json()
            .await
            .unwrap_or_default();

        let review_comments: Vec<ReviewCommentWire> = self
            .send(
                self.get(&format!("/repos/{project}/pulls/{number}/comments")),
                "list review comments",
            )
            .await?
            .json()
            .await
            .unwrap_or_default();

        let issue_comments: Vec<IssueCommentWire> = self
            .send(
                self.get(&format!("/repos/{project}/issues/{number}/comments")),
                "list issue comments",
            )
            .await?
            .json()
            .await
            .unwrap_or_default();

        let check_runs: CheckRunsWire = if pull.head.sha.is_empty() {
            CheckRunsWire::default()
        } else {
            self.send(
                self.get(&format!("/repos/{project}/commits/{}/check-runs", pull.head.sha)),
                "list check runs",
            )
            .await?
            .json()
            .await
            .unwrap_or_default()
        };

        let mut comments: Vec<ReviewComment> = review_comments
            .into_iter()
            .map(|c| ReviewComment {
                id: c.id,
                author: c.user.login,
                body: c.body,
                path: c.path,
                line: c.line,
                in_reply_to: c.in_reply_to_id,
                created_at: c.created_at,
            })
            .collect();
        comments.extend(issue_comments.into_iter().map(|c| ReviewComment {
            id: c.id,
            author: c.user.login,
            body: c.body.unwrap_or_default(),
            path: None,
            line: None,
            in_reply_to: None,
            created_at: c.created_at,
        }));

        Ok(ProposalFeedback {
            proposal: to_proposal(&pull),
            reviews: reviews
                .into_iter()
                .map(|r| Review {
                    author: r.user.login,
                    body: r.body.unwrap_or_default(),
                    state: r.state.to_lowercase(),
                    submitted_at: r.submitted_at,
                })
                .collect(),
            comments,
            check_runs: check_runs
                .check_runs
                .into_iter()
                .map(|c| CheckRun { name: c.name, status: c.status, conclusion: c.conclusion })
                .collect(),
        })
    }

    async fn post_comment(&self, pr_url: &str, body: &str) -> Result<()> {
        let (project, number) = self.pull_path(pr_url)?;
        let path = format!("/repos/{project}/issues/{number}/comments");
        self.send(self.post(&path).json(&json!({ "body": body })), "post comment").await?;
        Ok(())
    }

    async fn delete_branch(&self, project: &str, branch: &str) -> Result<()> {
        let path = format!("/repos/{project}/git/refs/heads/{branch}");
        match self.send(self.delete(&path), "delete branch").await {
            Ok(_) => Ok(()),
            // Already gone is fine.
            Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn is_available(&self) -> bool {
        self.send(self.get("/rate_limit"), "rate limit probe").await.is_ok()
    }
}
