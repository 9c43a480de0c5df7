use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::warn;

/// Snapshot handed to the timeout callback.
#[derive(Debug, Clone)]
pub struct WatchdogContext {
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub meta: Option<String>,
}

pub type TimeoutHook = Arc<dyn Fn(WatchdogContext) + Send + Sync>;
pub type HeartbeatFn = Arc<dyn Fn() + Send + Sync>;

struct WdState {
    started_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    meta: Option<String>,
}

/// Inactivity watchdog for a single operation.
///
/// The timer arms on [`Watchdog::start`]; every [`Watchdog::heartbeat`]
/// resets it. If it expires the timeout hook fires exactly once per start —
/// the watchdog itself takes no further action, the hook decides what dies.
pub struct Watchdog {
    operation: String,
    timeout: Duration,
    on_timeout: TimeoutHook,
    on_heartbeat: Option<Arc<dyn Fn() + Send + Sync>>,
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
    state: Arc<Mutex<WdState>>,
}

impl Watchdog {
    pub fn new(
        operation: impl Into<String>,
        timeout: Duration,
        on_timeout: TimeoutHook,
        on_heartbeat: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            operation: operation.into(),
            timeout,
            on_timeout,
            on_heartbeat,
            stopped: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
            state: Arc::new(Mutex::new(WdState {
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                meta: None,
            })),
        }
    }

    /// Arm the timer. Spawns the monitor task; a previous run must have been
    /// stopped first.
    pub fn start(&self, meta: Option<String>) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.started_at = Utc::now();
            st.last_heartbeat = Utc::now();
            st.meta = meta;
        }
        self.stopped.store(false, Ordering::SeqCst);

        let operation = self.operation.clone();
        let timeout = self.timeout;
        let on_timeout = Arc::clone(&self.on_timeout);
        let stopped = Arc::clone(&self.stopped);
        let notify = Arc::clone(&self.notify);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(timeout, notify.notified()).await {
                    // Heartbeat or stop: re-arm or exit.
                    Ok(()) => {
                        if stopped.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                    // Inactivity window elapsed.
                    Err(_) => {
                        if stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        let ctx = {
                            let st = state.lock().unwrap_or_else(|e| e.into_inner());
                            WatchdogContext {
                                operation: operation.clone(),
                                started_at: st.started_at,
                                last_heartbeat: st.last_heartbeat,
                                meta: st.meta.clone(),
                            }
                        };
                        warn!(
                            "watchdog '{}': no progress for {} ms",
                            ctx.operation,
                            timeout.as_millis()
                        );
                        on_timeout(ctx);
                        return;
                    }
                }
            }
        });
    }

    /// Record progress, resetting the inactivity timer.
    pub fn heartbeat(&self) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.last_heartbeat = Utc::now();
        }
        if let Some(hook) = &self.on_heartbeat {
            hook();
        }
        self.notify.notify_one();
    }

    /// Disarm the timer.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Scope guard: stops the watchdog when dropped, including on unwind.
struct StopGuard<'a>(&'a Watchdog);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Run `f` under a watchdog.
///
/// Starts on entry, hands `f` a heartbeat closure, and stops on every exit
/// path. The timeout hook still decides what to do when the timer fires —
/// typically cancelling the token `f` is racing against.
pub async fn with_watchdog<T, F, Fut>(
    operation: &str,
    timeout: Duration,
    on_timeout: TimeoutHook,
    meta: Option<String>,
    f: F,
) -> Result<T>
where
    F: FnOnce(HeartbeatFn) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let wd = Arc::new(Watchdog::new(operation, timeout, on_timeout, None));
    wd.start(meta);
    let _guard = StopGuard(&wd);

    let beat_wd = Arc::clone(&wd);
    let heartbeat: HeartbeatFn = Arc::new(move || beat_wd.heartbeat());

    f(heartbeat).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter_hook(fired: Arc<AtomicU32>) -> TimeoutHook {
        Arc::new(move |_ctx| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_without_heartbeats() {
        let fired = Arc::new(AtomicU32::new(0));
        let wd = Watchdog::new(
            "agent",
            Duration::from_millis(100),
            counter_hook(Arc::clone(&fired)),
            None,
        );
        wd.start(None);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_it_quiet() {
        let fired = Arc::new(AtomicU32::new(0));
        let wd = Watchdog::new(
            "agent",
            Duration::from_millis(100),
            counter_hook(Arc::clone(&fired)),
            None,
        );
        wd.start(None);
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            wd.heartbeat();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wd.stop();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disarms() {
        let fired = Arc::new(AtomicU32::new(0));
        let wd = Watchdog::new(
            "git",
            Duration::from_millis(100),
            counter_hook(Arc::clone(&fired)),
            None,
        );
        wd.start(None);
        wd.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scope_wrapper_stops_on_exit() {
        let fired = Arc::new(AtomicU32::new(0));
        let result = with_watchdog(
            "agent",
            Duration::from_millis(100),
            counter_hook(Arc::clone(&fired)),
            None,
            |beat| async move {
                beat();
                Ok::<_, anyhow::Error>(42)
            },
        )
        .await;
        assert_eq!(result.ok(), Some(42));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn context_carries_meta() {
        let seen: Arc<Mutex<Option<WatchdogContext>>> = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let hook: TimeoutHook = Arc::new(move |ctx| {
            *seen2.lock().unwrap_or_else(|e| e.into_inner()) = Some(ctx);
        });
        let wd = Watchdog::new("agent", Duration::from_millis(50), hook, None);
        wd.start(Some("issue-42".into()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ctx = seen.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let ctx = ctx.expect("timeout should have fired");
        assert_eq!(ctx.operation, "agent");
        assert_eq!(ctx.meta.as_deref(), Some("issue-42"));
    }
}
