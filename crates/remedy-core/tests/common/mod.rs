#![allow(dead_code)]

use std::process::Command;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use remedy_core::{
    agent::{AgentOutcome, AgentProvider, AgentRequest},
    circuit::CircuitRegistry,
    cleanup::CleanupManager,
    config::Config,
    db::Store,
    engine::Engine,
    host::{
        HostClient, IssueRef, ProposalFeedback, ProposalInfo, ProposalState, RemoteIssue,
    },
    locks::RepoLocks,
    watchdog::HeartbeatFn,
    worktrees::WorktreeManager,
    Error,
};

// ── Git fixtures ─────────────────────────────────────────────────────────

pub fn git(dir: &str, args: &[&str]) {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("spawn git {args:?}: {e}"));
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Bare upstream with one commit on `main`; returns its path.
pub fn make_upstream(root: &std::path::Path, name: &str) -> String {
    let bare = root.join(format!("{name}.git"));
    let seed = root.join(format!("{name}-seed"));
    std::fs::create_dir_all(&bare).unwrap();
    let bare_s = bare.to_string_lossy().to_string();
    let seed_s = seed.to_string_lossy().to_string();

    let out = Command::new("git")
        .args(["init", "--bare", "-b", "main", &bare_s])
        .output()
        .expect("git init --bare");
    assert!(out.status.success());

    let out = Command::new("git").args(["clone", &bare_s, &seed_s]).output().expect("git clone");
    assert!(out.status.success());
    git(&seed_s, &["config", "user.email", "test@example.com"]);
    git(&seed_s, &["config", "user.name", "Test"]);
    std::fs::write(seed.join("README.md"), "seed\n").unwrap();
    git(&seed_s, &["add", "-A"]);
    git(&seed_s, &["commit", "-m", "seed"]);
    git(&seed_s, &["push", "origin", "main"]);

    bare_s
}

// ── Mock host ────────────────────────────────────────────────────────────

pub struct MockHost {
    /// project → upstream path (used as the clone URL).
    pub remotes: Mutex<std::collections::HashMap<String, String>>,
    /// Canned issue text per URL.
    pub issues: Mutex<std::collections::HashMap<String, RemoteIssue>>,
    pub feedback: Mutex<std::collections::HashMap<String, ProposalFeedback>>,
    pub issue_fetch_failures: AtomicI64,
    next_pr: AtomicI64,
    pub created_proposals: Mutex<Vec<ProposalInfo>>,
    pub deleted_branches: Mutex<Vec<String>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            remotes: Mutex::new(std::collections::HashMap::new()),
            issues: Mutex::new(std::collections::HashMap::new()),
            feedback: Mutex::new(std::collections::HashMap::new()),
            issue_fetch_failures: AtomicI64::new(0),
            next_pr: AtomicI64::new(1),
            created_proposals: Mutex::new(Vec::new()),
            deleted_branches: Mutex::new(Vec::new()),
        }
    }

    pub fn add_repo(&self, project: &str, upstream_path: &str) {
        self.remotes
            .lock()
            .unwrap()
            .insert(project.to_string(), upstream_path.to_string());
    }

    pub fn add_issue(&self, url: &str, title: &str, body: &str) {
        self.issues.lock().unwrap().insert(
            url.to_string(),
            RemoteIssue {
                title: title.to_string(),
                body: body.to_string(),
                labels: vec!["bug".to_string()],
                author: "reporter".to_string(),
                assignee: None,
            },
        );
    }

    /// Make the next `n` get_issue calls fail with a network error.
    pub fn fail_issue_fetches(&self, n: i64) {
        self.issue_fetch_failures.store(n, Ordering::SeqCst);
    }
}

fn parse_github(url: &str) -> Result<(String, String, &'static str, i64)> {
    let rest = url
        .strip_prefix("https://github.com/")
        .ok_or_else(|| anyhow::Error::new(Error::Configuration(format!("bad url {url}"))))?;
    let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    match parts.as_slice() {
        [owner, repo, "issues", n] => {
            Ok((owner.to_string(), repo.to_string(), "issues", n.parse()?))
        }
        [owner, repo, "pull", n] => Ok((owner.to_string(), repo.to_string(), "pull", n.parse()?)),
        _ => Err(anyhow::Error::new(Error::Configuration(format!("bad url {url}")))),
    }
}

#[async_trait]
impl HostClient for MockHost {
    fn parse_issue_url(&self, url: &str) -> Result<IssueRef> {
        let (owner, repo, kind, number) = parse_github(url)?;
        if kind != "issues" {
            return Err(anyhow::Error::new(Error::Configuration(format!("not an issue: {url}"))));
        }
        Ok(IssueRef { owner, repo, number })
    }

    fn parse_proposal_url(&self, url: &str) -> Result<(String, i64)> {
        let (owner, repo, _, number) = parse_github(url)?;
        Ok((format!("{owner}/{repo}"), number))
    }

    async fn get_issue(&self, issue: &IssueRef) -> Result<RemoteIssue> {
        if self.issue_fetch_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(anyhow::Error::new(Error::Network("mock host down".into())));
        }
        self.issue_fetch_failures.store(0, Ordering::SeqCst);
        let url = format!(
            "https://github.com/{}/{}/issues/{}",
            issue.owner, issue.repo, issue.number
        );
        self.issues
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| anyhow::Error::new(Error::NotFound(url)))
    }

    fn remote_url(&self, project: &str) -> String {
        self.remotes
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .unwrap_or_else(|| format!("https://github.com/{project}.git"))
    }

    async fn create_proposal(
        &self,
        project: &str,
        head_branch: &str,
        _base_branch: &str,
        title: &str,
        _body: &str,
    ) -> Result<ProposalInfo> {
        let number = self.next_pr.fetch_add(1, Ordering::SeqCst);
        let info = ProposalInfo {
            url: format!("https://github.com/{project}/pull/{number}"),
            number,
            state: ProposalState::Open,
            head_branch: head_branch.to_string(),
            title: title.to_string(),
        };
        self.created_proposals.lock().unwrap().push(info.clone());
        Ok(info)
    }

    async fn get_proposal(&self, pr_url: &str) -> Result<ProposalInfo> {
        if let Some(fb) = self.feedback.lock().unwrap().get(pr_url) {
            return Ok(fb.proposal.clone());
        }
        self.created_proposals
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.url == pr_url)
            .cloned()
            .ok_or_else(|| anyhow::Error::new(Error::NotFound(pr_url.to_string())))
    }

    async fn fetch_feedback(&self, pr_url: &str) -> Result<ProposalFeedback> {
        if let Some(fb) = self.feedback.lock().unwrap().get(pr_url) {
            return Ok(fb.clone());
        }
        let proposal = self.get_proposal(pr_url).await?;
        Ok(ProposalFeedback { proposal, reviews: vec![], comments: vec![], check_runs: vec![] })
    }

    async fn post_comment(&self, _pr_url: &str, _body: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_branch(&self, _project: &str, branch: &str) -> Result<()> {
        self.deleted_branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }
}

// ── Scripted agent ───────────────────────────────────────────────────────

pub enum AgentScript {
    /// Write a file, heartbeat, succeed with the given cost.
    Succeed { cost: f64 },
    /// Never heartbeat; block until cancelled.
    Stall,
    /// Fail with an agent error.
    Fail,
}

pub struct ScriptedAgent {
    pub script: AgentScript,
    pub calls: Mutex<Vec<(std::time::Instant, String)>>,
    /// Issue markers currently inside a query call, for overlap assertions.
    pub in_flight: Mutex<Vec<String>>,
    pub overlaps: Mutex<Vec<(String, String)>>,
}

impl ScriptedAgent {
    pub fn new(script: AgentScript) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            overlaps: Mutex::new(Vec::new()),
        }
    }

    fn marker(prompt: &str) -> String {
        // Prompts embed the issue URL; keep it as the call marker.
        prompt
            .lines()
            .find_map(|l| l.split_whitespace().find(|w| w.contains("github.com")))
            .unwrap_or("unknown")
            .trim_end_matches('.')
            .to_string()
    }
}

#[async_trait]
impl AgentProvider for ScriptedAgent {
    async fn query(
        &self,
        req: AgentRequest,
        heartbeat: HeartbeatFn,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let marker = Self::marker(&req.prompt);
        self.calls.lock().unwrap().push((std::time::Instant::now(), marker.clone()));
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for other in in_flight.iter() {
                self.overlaps.lock().unwrap().push((other.clone(), marker.clone()));
            }
            in_flight.push(marker.clone());
        }

        let outcome = match self.script {
            AgentScript::Succeed { cost } => {
                heartbeat();
                let path = format!("{}/agent_change.txt", req.cwd);
                std::fs::write(path, format!("change for {marker}\n")).ok();
                // Long enough that genuinely-concurrent calls are observable.
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                heartbeat();
                AgentOutcome {
                    success: true,
                    output: format!("resolved {marker}"),
                    cost_delta_usd: cost,
                    turns: 2,
                    provider_session: Some("scripted".into()),
                    error: None,
                }
            }
            AgentScript::Stall => {
                cancel.cancelled().await;
                AgentOutcome::failed("cancelled")
            }
            AgentScript::Fail => AgentOutcome::failed("scripted failure"),
        };

        self.in_flight.lock().unwrap().retain(|m| m != &marker);
        Ok(outcome)
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }
}

// ── Engine fixture ───────────────────────────────────────────────────────

pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub host: Arc<MockHost>,
    pub agent: Arc<ScriptedAgent>,
    pub worktrees: Arc<WorktreeManager>,
    pub cleanup: Arc<CleanupManager>,
    pub circuits: Arc<CircuitRegistry>,
    pub engine: Arc<Engine>,
}

pub fn make_env(script: AgentScript, tweak: impl FnOnce(&mut Config)) -> TestEnv {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data_dir = tmp.path().join("agent-home").to_string_lossy().to_string();

    let mut config = Config {
        data_dir: data_dir.clone(),
        test_cmd: String::new(),
        agent_timeout_ms: 5_000,
        ..Config::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);

    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::create_dir_all(config.worktrees_dir()).unwrap();
    std::fs::create_dir_all(config.mirrors_dir()).unwrap();

    let store = Arc::new(Store::open(&config.db_path()).expect("open store"));
    let host = Arc::new(MockHost::new());
    let agent = Arc::new(ScriptedAgent::new(script));
    let worktrees = Arc::new(WorktreeManager::new(
        config.worktrees_dir(),
        config.mirrors_dir(),
        config.max_worktrees,
        config.max_worktrees_per_project,
    ));
    let cleanup = Arc::new(CleanupManager::new());
    let circuits = Arc::new(CircuitRegistry::default());
    let repo_locks = Arc::new(RepoLocks::new());

    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&agent) as Arc<dyn AgentProvider>,
        Arc::clone(&host) as Arc<dyn HostClient>,
        Arc::clone(&worktrees),
        Arc::clone(&cleanup),
        Arc::clone(&circuits),
        repo_locks,
    ));

    TestEnv { tmp, store, config, host, agent, worktrees, cleanup, circuits, engine }
}

/// One upstream repo + one issue, ready to work.
pub fn seed_issue(env: &TestEnv, project: &str, number: i64, title: &str, body: &str) -> String {
    let name = project.replace('/', "-");
    let upstream = make_upstream(env.tmp.path(), &name);
    env.host.add_repo(project, &upstream);
    let url = format!("https://github.com/{project}/issues/{number}");
    env.host.add_issue(&url, title, body);
    url
}
