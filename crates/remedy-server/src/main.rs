mod logging;
mod routes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use remedy_agent::{ClaudeProvider, MockProvider};
use remedy_core::{
    agent::AgentProvider,
    budget::display_usd,
    circuit::CircuitRegistry,
    cleanup::CleanupManager,
    config::Config,
    db::Store,
    engine::{Engine, EngineOptions},
    feedback::parse_feedback,
    host::{ConclusionMap, HostClient},
    locks::RepoLocks,
    monitor::{Monitor, MonitorOptions},
    orchestrator::Orchestrator,
    types::{IssueState, MonitorEvent},
    worktrees::WorktreeManager,
};
use remedy_host::GithubClient;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

struct App {
    config: Arc<Config>,
    store: Arc<Store>,
    engine: Arc<Engine>,
    cleanup: Arc<CleanupManager>,
    worktrees: Arc<WorktreeManager>,
    circuits: Arc<CircuitRegistry>,
}

fn usage() {
    eprintln!(
        "usage: remedy <command> [args]\n\n\
         commands:\n\
           work <issue-url> [--dry-run] [--max-budget <usd>]\n\
           work-parallel <count> [<issue-urls...>]\n\
           iterate <pr-url>\n\
           watch [<pr-urls...>] [--interval <s>] [--once] [--auto-iterate]\n\
           webhook [--port <p>] [--secret <s>] [--repos <owner/repo,...>]\n\
                   [--auto-iterate|--no-auto-iterate] [--delete-branch-on-merge]\n\
           status\n\
           cleanup"
    );
}

fn build_app(config: Config) -> Result<App> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir))?;
    std::fs::create_dir_all(config.logs_dir()).ok();
    std::fs::create_dir_all(config.worktrees_dir()).ok();
    std::fs::create_dir_all(config.mirrors_dir()).ok();

    let config = Arc::new(config);
    let store = Arc::new(Store::open(&config.db_path())?);

    // Crash recovery: fail sessions orphaned by a previous run and reconcile
    // the working-copy registry with what is actually on disk.
    match store.fail_orphaned_sessions() {
        Ok(0) => {}
        Ok(n) => warn!("recovered {n} orphaned session(s) from a previous run"),
        Err(e) => error!("orphaned-session recovery failed: {e}"),
    }

    let worktrees = Arc::new(WorktreeManager::new(
        config.worktrees_dir(),
        config.mirrors_dir(),
        config.max_worktrees,
        config.max_worktrees_per_project,
    ));
    if let Err(e) = worktrees.sync_with_disk() {
        warn!("working-copy registry sync failed: {e}");
    }

    let provider: Arc<dyn AgentProvider> = match config.provider.as_str() {
        "mock" => Arc::new(MockProvider::succeeding()),
        _ => Arc::new(ClaudeProvider::new("claude", config.model.clone())),
    };
    let host: Arc<dyn HostClient> =
        Arc::new(GithubClient::new(config.github_token.clone(), config.http_timeout_ms)?);

    let cleanup = Arc::new(CleanupManager::new());
    let circuits = Arc::new(CircuitRegistry::default());
    let repo_locks = Arc::new(RepoLocks::new());

    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        Arc::clone(&config),
        provider,
        host,
        Arc::clone(&worktrees),
        Arc::clone(&cleanup),
        Arc::clone(&circuits),
        repo_locks,
    ));

    Ok(App { config, store, engine, cleanup, worktrees, circuits })
}

/// Cancel on Ctrl-C / SIGTERM; remembers whether the user asked to stop.
fn spawn_signal_handler(cancel: CancellationToken) -> Arc<AtomicBool> {
    let user_cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&user_cancelled);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {e}");
                    if ctrl_c.await.is_ok() {
                        flag.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received, cancelling");
        flag.store(true, Ordering::SeqCst);
        cancel.cancel();
    });
    user_cancelled
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|a| a == flag) {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    }
}

fn take_value(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let i = args.iter().position(|a| a == flag)?;
    if i + 1 >= args.len() {
        return None;
    }
    args.remove(i);
    Some(args.remove(i))
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "remedy_server=info,remedy_core=info,remedy_agent=info,remedy_host=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::DailyFileLayer::new(config.logs_dir()))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
        std::process::exit(EXIT_FAILURE);
    }
    let command = args.remove(0);

    let code = match run_command(&command, args, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{command}: {e:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run_command(command: &str, mut args: Vec<String>, config: Config) -> Result<i32> {
    match command {
        "work" => {
            let dry_run = take_flag(&mut args, "--dry-run");
            let max_budget = take_value(&mut args, "--max-budget")
                .map(|v| v.parse::<f64>().context("--max-budget must be a number"))
                .transpose()?;
            let Some(url) = args.first() else {
                usage();
                return Ok(EXIT_FAILURE);
            };
            let app = build_app(config)?;
            let cancel = CancellationToken::new();
            let user_cancelled = spawn_signal_handler(cancel.clone());

            let opts = EngineOptions { dry_run, max_budget_usd: max_budget, estimated_cost_usd: max_budget };
            let result = app.engine.run_on_issue(url, opts, cancel).await;
            run_cleanup(&app);

            match result {
                Ok(report) => {
                    println!(
                        "session {} finished: pr={} cost=${} turns={}",
                        report.session_id,
                        report.pr_url.as_deref().unwrap_or("(none)"),
                        display_usd(report.cost_usd),
                        report.turns
                    );
                    Ok(EXIT_OK)
                }
                Err(_) if user_cancelled.load(Ordering::SeqCst) => Ok(EXIT_CANCELLED),
                Err(e) => Err(e),
            }
        }

        "work-parallel" => {
            let Some(count_str) = args.first().cloned() else {
                usage();
                return Ok(EXIT_FAILURE);
            };
            let count: usize = count_str.parse().context("count must be a number")?;
            args.remove(0);

            let mut config = config;
            config.max_concurrent_agents = count.max(1);
            let app = build_app(config)?;
            let cancel = CancellationToken::new();
            let user_cancelled = spawn_signal_handler(cancel.clone());

            let orchestrator = Orchestrator::new(Arc::clone(&app.engine));
            let urls = if args.is_empty() { orchestrator.drain_queue()? } else { args };
            if urls.is_empty() {
                println!("nothing queued");
                return Ok(EXIT_OK);
            }

            let report = orchestrator
                .work_parallel(urls, EngineOptions::default(), cancel)
                .await?;
            run_cleanup(&app);

            println!(
                "{} completed, {} failed, {} skipped",
                report.completed.len(),
                report.failed.len(),
                report.skipped.len()
            );
            for (url, err) in &report.failed {
                println!("  failed {url}: {err}");
            }
            if user_cancelled.load(Ordering::SeqCst) {
                Ok(EXIT_CANCELLED)
            } else if report.completed.is_empty() && !report.failed.is_empty() {
                Ok(EXIT_FAILURE)
            } else {
                Ok(EXIT_OK)
            }
        }

        "iterate" => {
            let Some(pr_url) = args.first() else {
                usage();
                return Ok(EXIT_FAILURE);
            };
            let app = build_app(config)?;
            let cancel = CancellationToken::new();
            let user_cancelled = spawn_signal_handler(cancel.clone());

            let feedback = app.engine.host.fetch_feedback(pr_url).await?;
            let parsed = parse_feedback(
                &feedback,
                &app.config.bot_authors,
                &ConclusionMap::default(),
            );
            println!("{}", parsed.summary);
            if parsed.items.is_empty() {
                run_cleanup(&app);
                return Ok(EXIT_OK);
            }

            let result = app.engine.iterate(pr_url, &parsed.items, cancel).await;
            run_cleanup(&app);
            match result {
                Ok(report) => {
                    println!(
                        "iteration session {} pushed (cost=${})",
                        report.session_id,
                        display_usd(report.cost_usd)
                    );
                    Ok(EXIT_OK)
                }
                Err(_) if user_cancelled.load(Ordering::SeqCst) => Ok(EXIT_CANCELLED),
                Err(e) => Err(e),
            }
        }

        "watch" => {
            let interval_s = take_value(&mut args, "--interval")
                .and_then(|v| v.parse::<u64>().ok());
            let once = take_flag(&mut args, "--once");
            let auto_iterate = take_flag(&mut args, "--auto-iterate") || config.auto_iterate;

            let app = build_app(config)?;
            let cancel = CancellationToken::new();
            let user_cancelled = spawn_signal_handler(cancel.clone());

            let urls = if args.is_empty() { watched_urls(&app)? } else { args };
            if urls.is_empty() {
                println!("no proposals to watch");
                return Ok(EXIT_OK);
            }
            println!("watching {} proposal(s)", urls.len());

            let (monitor, events) = Monitor::new(
                Arc::clone(&app.engine.host),
                app.config.bot_authors.clone(),
                ConclusionMap::default(),
            );
            spawn_event_consumer(events, Arc::clone(&app.engine), auto_iterate);

            let opts = MonitorOptions {
                interval: std::time::Duration::from_secs(
                    interval_s.unwrap_or(app.config.poll_interval_s),
                ),
                inactivity_timeout: std::time::Duration::from_secs(
                    app.config.poll_inactivity_timeout_min * 60,
                ),
            };

            if once {
                let mut snapshots = std::collections::HashMap::new();
                monitor.poll_once(&urls, &mut snapshots).await;
            } else {
                monitor.run(urls, opts, cancel).await?;
            }
            run_cleanup(&app);
            if user_cancelled.load(Ordering::SeqCst) {
                Ok(EXIT_CANCELLED)
            } else {
                Ok(EXIT_OK)
            }
        }

        "webhook" => {
            let port = take_value(&mut args, "--port")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(config.webhook_port);
            let secret =
                take_value(&mut args, "--secret").unwrap_or_else(|| config.webhook_secret.clone());
            let repos = take_value(&mut args, "--repos")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_else(|| config.allowed_repos.clone());
            let no_auto = take_flag(&mut args, "--no-auto-iterate");
            let auto_iterate =
                (take_flag(&mut args, "--auto-iterate") || config.auto_iterate) && !no_auto;
            let delete_branch_on_merge =
                take_flag(&mut args, "--delete-branch-on-merge") || config.delete_branch_on_merge;

            if secret.is_empty() {
                anyhow::bail!("webhook requires a secret (--secret or WEBHOOK_SECRET)");
            }

            let app = build_app(config)?;
            let cancel = CancellationToken::new();
            let user_cancelled = spawn_signal_handler(cancel.clone());

            let state = Arc::new(routes::AppState {
                engine: Arc::clone(&app.engine),
                secret,
                allowed_repos: repos,
                auto_iterate,
                delete_branch_on_merge,
                bot_authors: app.config.bot_authors.clone(),
            });

            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("bind port {port}"))?;
            info!("webhook listening on :{port} (auto_iterate={auto_iterate})");

            let shutdown = cancel.clone();
            axum::serve(listener, routes::router(state))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .context("webhook server")?;

            run_cleanup(&app);
            if user_cancelled.load(Ordering::SeqCst) {
                Ok(EXIT_CANCELLED)
            } else {
                Ok(EXIT_OK)
            }
        }

        "status" => {
            let app = build_app(config)?;
            print_status(&app).await?;
            Ok(EXIT_OK)
        }

        "cleanup" => {
            let app = build_app(config)?;
            let completed = app.worktrees.cleanup_completed();
            let aged = app.worktrees.cleanup_by_age(app.config.cleanup_age_hours);
            let failures = app.cleanup.run_all();
            println!(
                "removed {completed} completed and {aged} aged working copies; {} cleanup failure(s)",
                failures.len()
            );
            for f in &failures {
                println!("  failed: {} ({})", f.description, f.error);
            }
            Ok(if failures.is_empty() { EXIT_OK } else { EXIT_FAILURE })
        }

        _ => {
            usage();
            Ok(EXIT_FAILURE)
        }
    }
}

/// Proposal URLs for every issue currently awaiting review activity.
fn watched_urls(app: &App) -> Result<Vec<String>> {
    let mut urls = Vec::new();
    for state in [IssueState::PrCreated, IssueState::AwaitingFeedback] {
        for issue in app.store.list_by_state(state)? {
            if let Some(pr_url) = issue.pr_url {
                urls.push(pr_url);
            }
        }
    }
    urls.sort();
    urls.dedup();
    Ok(urls)
}

fn spawn_event_consumer(
    mut events: tokio::sync::broadcast::Receiver<MonitorEvent>,
    engine: Arc<Engine>,
    auto_iterate: bool,
) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                MonitorEvent::Feedback { pr_url, items, summary } => {
                    println!("feedback on {pr_url}: {summary}");
                    if auto_iterate && !items.is_empty() {
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            if let Err(e) =
                                engine.iterate(&pr_url, &items, CancellationToken::new()).await
                            {
                                warn!("auto-iterate on {pr_url} failed: {e}");
                            }
                        });
                    }
                }
                MonitorEvent::ChecksChanged { pr_url, failing } => {
                    println!("checks changed on {pr_url}: failing={failing:?}");
                }
                MonitorEvent::Merged { pr_url } => {
                    println!("{pr_url} merged");
                    if let Ok(Some(issue)) = engine.store.get_issue_by_pr_url(&pr_url) {
                        if let Err(e) =
                            engine.store.transition_issue(issue.id, IssueState::Merged, None, None)
                        {
                            warn!("settle merged {pr_url}: {e}");
                        }
                    }
                }
                MonitorEvent::Closed { pr_url } => {
                    println!("{pr_url} closed");
                    if let Ok(Some(issue)) = engine.store.get_issue_by_pr_url(&pr_url) {
                        if let Err(e) =
                            engine.store.transition_issue(issue.id, IssueState::Closed, None, None)
                        {
                            warn!("settle closed {pr_url}: {e}");
                        }
                    }
                }
                MonitorEvent::Error { pr_url, message } => {
                    println!("monitor error on {pr_url}: {message}");
                }
            }
        }
    });
}

fn run_cleanup(app: &App) {
    let failures = app.cleanup.run_all();
    for f in &failures {
        warn!("cleanup failure: {} ({})", f.description, f.error);
    }
}

async fn print_status(app: &App) -> Result<()> {
    println!("issues by state:");
    for (state, count) in app.store.count_by_state()? {
        println!("  {state:18} {count}");
    }

    let sessions = app.store.active_sessions()?;
    println!("active sessions: {}", sessions.len());
    for s in &sessions {
        println!(
            "  #{} issue={} provider={} cost=${} last_activity={}",
            s.id,
            s.issue_id,
            s.provider,
            display_usd(s.cost_usd),
            s.last_activity_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    println!(
        "spend: today=${} month=${} (limits {}/{})",
        display_usd(app.store.today_cost()?),
        display_usd(app.store.month_cost()?),
        app.config.daily_budget_usd,
        app.config.monthly_budget_usd,
    );

    let proposals = app.store.today_proposal_counts()?;
    let total: i64 = proposals.iter().map(|(_, n)| n).sum();
    println!("proposals today: {total} (limit {})", app.config.max_prs_per_day);
    for (project, count) in proposals {
        println!("  {project}: {count}");
    }

    let copies = app.worktrees.list();
    println!("working copies: {} (limit {})", copies.len(), app.config.max_worktrees);
    for c in &copies {
        println!("  {} [{}] {}", c.path, c.status.as_str(), c.branch);
    }

    let circuits = app.circuits.states();
    if !circuits.is_empty() {
        println!("circuits:");
        for (label, state) in circuits {
            println!("  {label}: {state}");
        }
    }

    let health = remedy_core::health::check(
        &app.config.data_dir,
        &app.worktrees,
        app.config.max_worktrees,
        &app.engine.provider,
        &app.engine.host,
    )
    .await;
    match health.degraded_reason() {
        None => println!("health: ok"),
        Some(reason) => println!("health: degraded ({reason})"),
    }
    if let Some(free) = health.disk_free_bytes {
        println!("  disk free: {} MiB", free >> 20);
    }
    if let Some(rss) = health.rss_bytes {
        println!("  rss: {} MiB", rss >> 20);
    }
    Ok(())
}
