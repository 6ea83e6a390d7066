//! Upstream change detection.
//!
//! The [`ChangePoller`] tracks one remote source at a time. It keeps a
//! baseline version token (the GitHub blob `sha` for raw URLs) and, on
//! every eligible tick, asks a [`VersionProbe`] for the current token. A
//! token that differs from the baseline sets
//! [`SyncState::update_available`]. The poller never reloads data itself.
//!
//! # Generations
//!
//! Every [`start`](ChangePoller::start) and [`stop`](ChangePoller::stop)
//! bumps a generation counter. Ticks and probe results carry the
//! generation they were issued under and are dropped if it is no longer
//! current, so a slow probe for an old source can never flag an update on
//! a new one.
//!
//! # Eligibility window
//!
//! With a [`PollWindow`] configured, ticks outside the allowed days and
//! hours are skipped. [`check_now`](ChangePoller::check_now) ignores the
//! window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDateTime, Timelike, Utc, Weekday};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PollConfig;
use crate::error::PollError;
use crate::fetch::build_client;
use crate::models::SyncState;

/// Days and hours during which automatic polling runs.
///
/// `start_hour` is inclusive and `end_hour` exclusive. When `start_hour` is
/// greater than `end_hour` the window wraps past midnight. An empty `days`
/// list allows every day.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollWindow {
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default)]
    pub start_hour: u32,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
}

fn default_end_hour() -> u32 {
    24
}

impl PollWindow {
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }
        let hour = at.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Source of opaque version tokens for a poll URL.
#[async_trait]
pub trait VersionProbe: Send + Sync {
    async fn fetch_token(&self, poll_url: &str) -> Result<String, PollError>;
}

/// Reads the `sha` field of a GitHub contents-API response.
pub struct GithubContentsProbe {
    client: reqwest::Client,
}

impl GithubContentsProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct ContentsResponse {
    sha: Option<String>,
}

#[async_trait]
impl VersionProbe for GithubContentsProbe {
    async fn fetch_token(&self, poll_url: &str) -> Result<String, PollError> {
        let network = |e: reqwest::Error| PollError::Network {
            url: poll_url.to_string(),
            message: e.to_string(),
        };

        let resp = self
            .client
            .get(poll_url)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(network)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PollError::Http {
                url: poll_url.to_string(),
                status: status.as_u16(),
            });
        }

        let body: ContentsResponse = resp.json().await.map_err(|_| PollError::MissingToken {
            url: poll_url.to_string(),
        })?;

        match body.sha {
            Some(sha) if !sha.is_empty() => Ok(sha),
            _ => Err(PollError::MissingToken {
                url: poll_url.to_string(),
            }),
        }
    }
}

/// Shortest tick period. `tokio::time::interval` rejects zero.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub window: Option<PollWindow>,
}

impl PollSettings {
    /// The tick period actually used: `interval`, at least [`MIN_INTERVAL`].
    pub fn period(&self) -> Duration {
        self.interval.max(MIN_INTERVAL)
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self {
            interval: config.interval(),
            window: config.window.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct PollTarget {
    fetch_url: String,
    poll_url: String,
}

#[derive(Debug, Default)]
struct PollerShared {
    generation: u64,
    target: Option<PollTarget>,
    sync: SyncState,
}

/// Tick task handle; aborts the task when dropped.
struct PollTask(JoinHandle<()>);

impl Drop for PollTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct PollerInner {
    probe: Arc<dyn VersionProbe>,
    settings: PollSettings,
    shared: Arc<Mutex<PollerShared>>,
    task: std::sync::Mutex<Option<PollTask>>,
}

/// Generation-guarded version poller. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChangePoller {
    inner: Arc<PollerInner>,
}

impl ChangePoller {
    pub fn new(probe: Arc<dyn VersionProbe>, settings: PollSettings) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                probe,
                settings,
                shared: Arc::new(Mutex::new(PollerShared::default())),
                task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Track a new source, replacing any previous one. Resets [`SyncState`]
    /// to `initial_token` and returns the new generation.
    pub async fn start(
        &self,
        fetch_url: &str,
        poll_url: &str,
        initial_token: Option<String>,
    ) -> u64 {
        let generation = {
            let mut shared = self.inner.shared.lock().await;
            shared.generation += 1;
            shared.target = Some(PollTarget {
                fetch_url: fetch_url.to_string(),
                poll_url: poll_url.to_string(),
            });
            shared.sync = SyncState {
                version_token: initial_token,
                ..SyncState::default()
            };
            shared.generation
        };

        let handle = tokio::spawn(run_ticks(
            self.inner.shared.clone(),
            self.inner.probe.clone(),
            self.inner.settings.clone(),
            generation,
        ));
        self.replace_task(Some(PollTask(handle)));

        tracing::info!(
            generation,
            interval_secs = self.inner.settings.interval.as_secs(),
            "polling {} for changes",
            poll_url
        );
        generation
    }

    /// Stop tracking. Pending results from the previous generation are
    /// discarded and [`SyncState`] is cleared.
    pub async fn stop(&self) {
        let was_tracking = {
            let mut shared = self.inner.shared.lock().await;
            shared.generation += 1;
            shared.sync = SyncState::default();
            shared.target.take().is_some()
        };
        self.replace_task(None);
        if was_tracking {
            tracing::debug!("change polling stopped");
        }
    }

    /// Probe once to establish a baseline token when none is set.
    ///
    /// Returns the baseline in effect afterwards, or `None` if the
    /// generation moved on or no token could be obtained.
    pub async fn seed_baseline(&self, generation: u64) -> Option<String> {
        let poll_url = {
            let shared = self.inner.shared.lock().await;
            if shared.generation != generation {
                return None;
            }
            if let Some(token) = &shared.sync.version_token {
                return Some(token.clone());
            }
            shared.target.as_ref()?.poll_url.clone()
        };

        let result = self.inner.probe.fetch_token(&poll_url).await;

        let mut shared = self.inner.shared.lock().await;
        if shared.generation != generation {
            tracing::debug!(generation, "discarding stale baseline token");
            return None;
        }
        match result {
            Ok(token) => {
                if shared.sync.version_token.is_none() {
                    shared.sync.version_token = Some(token);
                }
                shared.sync.version_token.clone()
            }
            Err(error) => {
                tracing::debug!(%error, "could not seed version baseline");
                shared.sync.version_token.clone()
            }
        }
    }

    /// Query the probe now, outside the tick schedule and the window.
    /// Returns whether an update is available.
    pub async fn check_now(&self) -> bool {
        let generation = self.inner.shared.lock().await.generation;
        poll_once(&self.inner.shared, self.inner.probe.as_ref(), generation).await
    }

    pub async fn sync_state(&self) -> SyncState {
        self.inner.shared.lock().await.sync.clone()
    }

    pub async fn generation(&self) -> u64 {
        self.inner.shared.lock().await.generation
    }

    /// `(fetch_url, poll_url)` of the tracked source, if any.
    pub async fn target(&self) -> Option<(String, String)> {
        self.inner
            .shared
            .lock()
            .await
            .target
            .as_ref()
            .map(|t| (t.fetch_url.clone(), t.poll_url.clone()))
    }

    pub async fn is_tracking(&self) -> bool {
        self.inner.shared.lock().await.target.is_some()
    }

    pub fn settings(&self) -> &PollSettings {
        &self.inner.settings
    }

    fn replace_task(&self, task: Option<PollTask>) {
        let mut slot = match self.inner.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Dropping the previous guard aborts its task.
        *slot = task;
    }
}

async fn run_ticks(
    shared: Arc<Mutex<PollerShared>>,
    probe: Arc<dyn VersionProbe>,
    settings: PollSettings,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(settings.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        {
            let state = shared.lock().await;
            if state.generation != generation {
                break;
            }
            if state.sync.update_available {
                continue;
            }
        }

        if let Some(window) = &settings.window {
            if !window.contains(Local::now().naive_local()) {
                tracing::debug!("outside polling window; tick skipped");
                continue;
            }
        }

        poll_once(&shared, probe.as_ref(), generation).await;
    }
}

/// One probe round for `generation`. Returns whether an update is available.
async fn poll_once(
    shared: &Mutex<PollerShared>,
    probe: &dyn VersionProbe,
    generation: u64,
) -> bool {
    let poll_url = {
        let state = shared.lock().await;
        if state.generation != generation {
            return false;
        }
        if state.sync.update_available {
            return true;
        }
        match &state.target {
            Some(target) => target.poll_url.clone(),
            None => return false,
        }
    };

    let result = probe.fetch_token(&poll_url).await;

    let mut state = shared.lock().await;
    if state.generation != generation {
        tracing::debug!(generation, "discarding stale poll result");
        return false;
    }
    state.sync.last_checked_at = Some(Utc::now());

    match result {
        Ok(token) => match state.sync.version_token.as_deref() {
            None => {
                tracing::debug!(%token, "adopted version baseline");
                state.sync.version_token = Some(token);
                false
            }
            Some(baseline) if baseline != token => {
                tracing::info!(%baseline, %token, "upstream data changed");
                state.sync.update_available = true;
                true
            }
            Some(_) => false,
        },
        Err(error) => {
            tracing::warn!(%error, "version check failed");
            false
        }
    }
}
