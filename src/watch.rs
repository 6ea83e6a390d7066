//! `stk check` and `stk watch`: upstream change detection from the CLI.

use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use crate::config::Config;
use crate::models::LoadOutcome;
use crate::poller::{GithubContentsProbe, VersionProbe};
use crate::report::{load_selected, print_outcome, SourceSelection};
use crate::resolve::resolve_with_api;
use crate::state::Settings;
use crate::store::DatasetStore;

/// How often `watch` looks at the poller's state.
const STATUS_EVERY: Duration = Duration::from_secs(1);

/// First retry delay after a failed auto-refresh; doubles per failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Compare the persisted `lastVersion` with the live token, without
/// downloading the data. A failed probe is reported, not fatal.
pub async fn run_check(config: &Config) -> Result<()> {
    let settings = Settings::open(&config.state.dir)?;
    let source = settings
        .custom_source_url()
        .unwrap_or_else(|| config.source.default_url.clone());
    let resolved = resolve_with_api(&source, &config.poll.api_base);

    let Some(poll_url) = resolved.poll_url.as_deref() else {
        println!(
            "{} has no version endpoint; change checks are disabled",
            resolved.fetch_url
        );
        return Ok(());
    };

    let probe = GithubContentsProbe::new(config.fetch.timeout())?;
    let live = match probe.fetch_token(poll_url).await {
        Ok(token) => token,
        Err(e) => {
            eprintln!("version check failed: {}", e);
            println!("no update detected");
            return Ok(());
        }
    };

    match settings
        .last_version()
        .filter(|last| last.fetch_url == resolved.fetch_url)
    {
        Some(last) if last.token == live => println!("up to date ({})", live),
        Some(last) => {
            println!("update available: {} -> {}", last.token, live);
            println!("run `stk load --fresh` to reload");
        }
        None => {
            settings.set_last_version(&resolved.fetch_url, &live)?;
            println!("no recorded version; baseline set to {}", live);
        }
    }
    Ok(())
}

/// What one status tick of `stk watch` did.
#[derive(Debug, PartialEq)]
pub enum TickAction {
    /// No update pending, or it was already announced.
    Idle,
    /// Update detected; auto-refresh is off.
    Announced,
    Refreshed(LoadOutcome),
    RefreshFailed { error: String, retry_in: Duration },
    /// A failed refresh is backing off.
    Waiting,
}

/// Decides, per status tick, whether to announce a detected update or
/// reload it. A failed reload is retried with capped exponential backoff
/// until it succeeds.
pub struct AutoRefresh {
    enabled: bool,
    announced: bool,
    failures: u32,
    retry_at: Option<Instant>,
    backoff: Duration,
    max_backoff: Duration,
}

impl AutoRefresh {
    pub fn new(enabled: bool) -> Self {
        Self::with_backoff(enabled, RETRY_BACKOFF, RETRY_BACKOFF_MAX)
    }

    pub fn with_backoff(enabled: bool, backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            enabled,
            announced: false,
            failures: 0,
            retry_at: None,
            backoff,
            max_backoff,
        }
    }

    pub async fn on_tick(&mut self, store: &DatasetStore, selection: &SourceSelection) -> TickAction {
        if !store.sync_state().await.update_available {
            self.announced = false;
            self.failures = 0;
            self.retry_at = None;
            return TickAction::Idle;
        }

        if !self.enabled {
            if self.announced {
                return TickAction::Idle;
            }
            self.announced = true;
            return TickAction::Announced;
        }

        if self.retry_at.is_some_and(|at| Instant::now() < at) {
            return TickAction::Waiting;
        }

        match load_selected(store, selection, true).await {
            Ok(outcome) => {
                self.failures = 0;
                self.retry_at = None;
                TickAction::Refreshed(outcome)
            }
            Err(e) => {
                self.failures += 1;
                let retry_in = (self.backoff * (1u32 << (self.failures - 1).min(5))).min(self.max_backoff);
                self.retry_at = Some(Instant::now() + retry_in);
                tracing::warn!(error = %e, failures = self.failures, ?retry_in, "auto-refresh failed");
                TickAction::RefreshFailed {
                    error: format!("{:#}", e),
                    retry_in,
                }
            }
        }
    }
}

/// Load, then poll until Ctrl-C. With `auto_refresh` a detected change
/// triggers a fresh reload; otherwise it is only reported.
pub async fn run_watch(
    config: &Config,
    selection: &SourceSelection,
    interval_secs: Option<u64>,
    auto_refresh: bool,
) -> Result<()> {
    let mut config = config.clone();
    if let Some(secs) = interval_secs {
        config.poll.interval_secs = secs;
    }

    let store = DatasetStore::open(&config)?;
    let outcome = load_selected(&store, selection, true).await?;
    print_outcome(&outcome);

    if !store.poller().is_tracking().await {
        println!("source has no version endpoint; nothing to watch");
        return Ok(());
    }
    println!(
        "watching for changes every {}s (Ctrl-C to stop)",
        config.poll.interval_secs
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut status = tokio::time::interval(STATUS_EVERY);
    let mut refresher = AutoRefresh::new(auto_refresh);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("stopping");
                break;
            }
            _ = status.tick() => match refresher.on_tick(&store, selection).await {
                TickAction::Idle | TickAction::Waiting => {}
                TickAction::Announced => println!("update available upstream"),
                TickAction::Refreshed(outcome) => {
                    println!("update available upstream; reloaded");
                    print_outcome(&outcome);
                }
                TickAction::RefreshFailed { error, retry_in } => {
                    eprintln!("refresh failed: {} (retrying in {}s)", error, retry_in.as_secs_f64());
                }
            }
        }
    }

    store.poller().stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::{FetchError, PollError};
    use crate::fetch::{ContentFetcher, FetchOptions, FetchPipeline};
    use crate::poller::{ChangePoller, PollSettings};
    use crate::state::Settings;

    const BLOB_URL: &str = "https://github.com/acme/datos/blob/main/data/SPSA.csv";
    const INVENTORY: &str = "\
MARCA;COD;STOCK;VTA;FORMATO;TIENDA
ADMID;10011;5;10;TIENDA;TIENDA CENTRAL
";

    /// Answers HTTP 500 while `failing` is set.
    struct FlakyFetcher {
        failing: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ContentFetcher for FlakyFetcher {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self, url: &str, _opts: FetchOptions) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(FetchError::Http {
                    url: url.to_string(),
                    status: 500,
                });
            }
            Ok(INVENTORY.to_string())
        }
    }

    struct SettableProbe(Arc<Mutex<String>>);

    #[async_trait]
    impl VersionProbe for SettableProbe {
        async fn fetch_token(&self, _poll_url: &str) -> Result<String, PollError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct Harness {
        _tmp: TempDir,
        store: DatasetStore,
        failing: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
        token: Arc<Mutex<String>>,
    }

    /// A store tracking `BLOB_URL` with an update already detected.
    async fn store_with_pending_update() -> Harness {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::open(tmp.path().join("state")).unwrap();
        let failing = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let token = Arc::new(Mutex::new("abc123".to_string()));

        let mut pipeline = FetchPipeline::new();
        pipeline.register(Box::new(FlakyFetcher {
            failing: failing.clone(),
            calls: calls.clone(),
        }));
        let poller = ChangePoller::new(
            Arc::new(SettableProbe(token.clone())),
            PollSettings {
                interval: Duration::from_secs(3600),
                window: None,
            },
        );
        let store = DatasetStore::with_components(&Config::minimal(), settings, pipeline, poller);

        store.load_from_url(BLOB_URL, false).await.unwrap();
        store.wait_for_baseline(Duration::from_secs(5)).await;
        *token.lock().unwrap() = "def456".to_string();
        assert!(store.check_for_updates().await);

        Harness {
            _tmp: tmp,
            store,
            failing,
            calls,
            token,
        }
    }

    fn selection() -> SourceSelection {
        SourceSelection {
            url: Some(BLOB_URL.to_string()),
            file: None,
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_is_retried() {
        let h = store_with_pending_update().await;
        let mut refresher =
            AutoRefresh::with_backoff(true, Duration::from_millis(20), Duration::from_millis(100));

        h.failing.store(true, Ordering::SeqCst);
        let action = refresher.on_tick(&h.store, &selection()).await;
        assert!(matches!(
            action,
            TickAction::RefreshFailed { retry_in, .. } if retry_in == Duration::from_millis(20)
        ));
        assert!(h.store.sync_state().await.update_available);

        // Inside the backoff window nothing is fetched.
        let calls = h.calls.load(Ordering::SeqCst);
        assert_eq!(refresher.on_tick(&h.store, &selection()).await, TickAction::Waiting);
        assert_eq!(h.calls.load(Ordering::SeqCst), calls);

        // Second failure doubles the delay.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let action = refresher.on_tick(&h.store, &selection()).await;
        assert!(matches!(
            action,
            TickAction::RefreshFailed { retry_in, .. } if retry_in == Duration::from_millis(40)
        ));

        h.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let action = refresher.on_tick(&h.store, &selection()).await;
        assert!(matches!(action, TickAction::Refreshed(LoadOutcome::Applied(_))));

        h.store.wait_for_baseline(Duration::from_secs(5)).await;
        let sync = h.store.sync_state().await;
        assert!(!sync.update_available);
        assert_eq!(sync.version_token.as_deref(), Some("def456"));
        assert_eq!(refresher.on_tick(&h.store, &selection()).await, TickAction::Idle);
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let h = store_with_pending_update().await;
        let mut refresher =
            AutoRefresh::with_backoff(true, Duration::from_millis(5), Duration::from_millis(12));
        h.failing.store(true, Ordering::SeqCst);

        let mut delays = Vec::new();
        for _ in 0..4 {
            if let TickAction::RefreshFailed { retry_in, .. } =
                refresher.on_tick(&h.store, &selection()).await
            {
                delays.push(retry_in);
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(12),
                Duration::from_millis(12),
            ]
        );
    }

    #[tokio::test]
    async fn test_announce_once_without_auto_refresh() {
        let h = store_with_pending_update().await;
        let mut refresher = AutoRefresh::new(false);
        let calls = h.calls.load(Ordering::SeqCst);

        assert_eq!(refresher.on_tick(&h.store, &selection()).await, TickAction::Announced);
        assert_eq!(refresher.on_tick(&h.store, &selection()).await, TickAction::Idle);
        assert_eq!(h.calls.load(Ordering::SeqCst), calls);
        assert_eq!(*h.token.lock().unwrap(), "def456");
    }
}
