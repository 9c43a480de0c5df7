use std::collections::HashMap;

use anyhow::Result;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of persisted state (`state.db`, `logs/`, `worktrees/`).
    pub data_dir: String,
    pub github_token: String,
    /// Fork owner to push working branches to; empty = push to origin.
    pub fork_owner: String,
    pub provider: String,
    pub model: String,

    // Concurrency
    pub max_concurrent_agents: usize,
    pub max_concurrent_per_project: usize,
    pub max_worktrees: usize,
    pub max_worktrees_per_project: usize,

    // Budgets
    pub daily_budget_usd: f64,
    pub monthly_budget_usd: f64,
    pub per_issue_budget_usd: f64,
    pub max_prs_per_day: u32,
    pub max_prs_per_project_per_day: u32,

    // Engine limits
    pub max_turns: u32,
    pub max_diff_files: usize,
    pub max_diff_lines: usize,
    pub max_test_fix_iterations: u32,
    pub test_cmd: String,

    // Watchdog timeouts (ms)
    pub agent_timeout_ms: u64,
    pub git_timeout_ms: u64,
    pub http_timeout_ms: u64,

    // Orchestrator
    /// On engine failure: abandon the issue instead of leaving its last state.
    pub abandon_on_failure: bool,

    // Monitor
    pub poll_interval_s: u64,
    pub poll_inactivity_timeout_min: u64,
    pub auto_iterate: bool,

    // Webhook
    pub webhook_port: u16,
    pub webhook_secret: String,
    /// Comma-separated `owner/repo` allowlist; empty = all.
    pub allowed_repos: Vec<String>,
    pub delete_branch_on_merge: bool,

    /// Accounts whose feedback is ignored by the parser.
    pub bot_authors: Vec<String>,
    pub cleanup_age_hours: i64,

    // Git attribution
    pub git_author_name: String,
    pub git_author_email: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_f64(key: &str, dotenv: &HashMap<String, String>, default: f64) -> f64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, &path[2..]);
        }
    }
    path.to_string()
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let data_dir = resolve_tilde(&get_str("DATA_DIR", &dotenv, "~/.agent"));

        Ok(Config {
            data_dir,
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            fork_owner: get_str("FORK_OWNER", &dotenv, ""),
            provider: get_str("PROVIDER", &dotenv, "claude"),
            model: get_str("MODEL", &dotenv, "claude-sonnet-4-6"),

            max_concurrent_agents: get_usize("MAX_CONCURRENT_AGENTS", &dotenv, 3),
            max_concurrent_per_project: get_usize("MAX_CONCURRENT_PER_PROJECT", &dotenv, 1),
            max_worktrees: get_usize("MAX_WORKTREES", &dotenv, 10),
            max_worktrees_per_project: get_usize("MAX_WORKTREES_PER_PROJECT", &dotenv, 3),

            daily_budget_usd: get_f64("DAILY_BUDGET_USD", &dotenv, 50.0),
            monthly_budget_usd: get_f64("MONTHLY_BUDGET_USD", &dotenv, 500.0),
            per_issue_budget_usd: get_f64("PER_ISSUE_BUDGET_USD", &dotenv, 5.0),
            max_prs_per_day: get_u32("MAX_PRS_PER_DAY", &dotenv, 10),
            max_prs_per_project_per_day: get_u32("MAX_PRS_PER_PROJECT_PER_DAY", &dotenv, 3),

            max_turns: get_u32("MAX_TURNS", &dotenv, 50),
            max_diff_files: get_usize("MAX_DIFF_FILES", &dotenv, 30),
            max_diff_lines: get_usize("MAX_DIFF_LINES", &dotenv, 2000),
            max_test_fix_iterations: get_u32("MAX_TEST_FIX_ITERATIONS", &dotenv, 2),
            test_cmd: get_str("TEST_CMD", &dotenv, ""),

            agent_timeout_ms: get_u64("AGENT_TIMEOUT_S", &dotenv, 300) * 1000,
            git_timeout_ms: get_u64("GIT_TIMEOUT_S", &dotenv, 60) * 1000,
            http_timeout_ms: get_u64("HTTP_TIMEOUT_S", &dotenv, 30) * 1000,

            abandon_on_failure: get_bool("ABANDON_ON_FAILURE", &dotenv, false),

            poll_interval_s: get_u64("POLL_INTERVAL_S", &dotenv, 60),
            poll_inactivity_timeout_min: get_u64("POLL_INACTIVITY_TIMEOUT_MIN", &dotenv, 120),
            auto_iterate: get_bool("AUTO_ITERATE", &dotenv, false),

            webhook_port: get_u16("PORT", &dotenv, 8080),
            webhook_secret: get_str("WEBHOOK_SECRET", &dotenv, ""),
            allowed_repos: parse_list(&get_str("ALLOWED_REPOS", &dotenv, "")),
            delete_branch_on_merge: get_bool("DELETE_BRANCH_ON_MERGE", &dotenv, false),

            bot_authors: parse_list(&get_str(
                "BOT_AUTHORS",
                &dotenv,
                "github-actions[bot],dependabot[bot],codecov[bot]",
            )),
            cleanup_age_hours: get_i64("CLEANUP_AGE_HOURS", &dotenv, 24),
            git_author_name: get_str("GIT_AUTHOR_NAME", &dotenv, "remedy-agent"),
            git_author_email: get_str("GIT_AUTHOR_EMAIL", &dotenv, "agent@remedy.invalid"),
        })
    }

    pub fn db_path(&self) -> String {
        format!("{}/state.db", self.data_dir)
    }

    pub fn logs_dir(&self) -> String {
        format!("{}/logs", self.data_dir)
    }

    pub fn worktrees_dir(&self) -> String {
        format!("{}/worktrees", self.data_dir)
    }

    /// Mirror clones live next to worktrees, one per project.
    pub fn mirrors_dir(&self) -> String {
        format!("{}/mirrors", self.data_dir)
    }

    pub fn repo_allowed(&self, project: &str) -> bool {
        self.allowed_repos.is_empty() || self.allowed_repos.iter().any(|r| r == project)
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; from_env applies the same values with overrides.
        Self {
            data_dir: "/tmp/remedy".into(),
            github_token: String::new(),
            fork_owner: String::new(),
            provider: "claude".into(),
            model: "claude-sonnet-4-6".into(),
            max_concurrent_agents: 3,
            max_concurrent_per_project: 1,
            max_worktrees: 10,
            max_worktrees_per_project: 3,
            daily_budget_usd: 50.0,
            monthly_budget_usd: 500.0,
            per_issue_budget_usd: 5.0,
            max_prs_per_day: 10,
            max_prs_per_project_per_day: 3,
            max_turns: 50,
            max_diff_files: 30,
            max_diff_lines: 2000,
            max_test_fix_iterations: 2,
            test_cmd: String::new(),
            agent_timeout_ms: 300_000,
            git_timeout_ms: 60_000,
            http_timeout_ms: 30_000,
            abandon_on_failure: false,
            poll_interval_s: 60,
            poll_inactivity_timeout_min: 120,
            auto_iterate: false,
            webhook_port: 8080,
            webhook_secret: String::new(),
            allowed_repos: Vec::new(),
            delete_branch_on_merge: false,
            bot_authors: parse_list("github-actions[bot],dependabot[bot],codecov[bot]"),
            cleanup_age_hours: 24,
            git_author_name: "remedy-agent".into(),
            git_author_email: "agent@remedy.invalid".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expansion() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(resolve_tilde("~/.agent"), "/home/tester/.agent");
        assert_eq!(resolve_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn list_parsing() {
        assert_eq!(parse_list("a/b, c/d ,"), vec!["a/b".to_string(), "c/d".to_string()]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn allowlist_empty_means_all() {
        let cfg = Config::default();
        assert!(cfg.repo_allowed("acme/app"));
        let cfg = Config { allowed_repos: vec!["acme/app".into()], ..Config::default() };
        assert!(cfg.repo_allowed("acme/app"));
        assert!(!cfg.repo_allowed("acme/other"));
    }
}
