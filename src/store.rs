//! Dataset store: load orchestration and the published dataset.
//!
//! ```text
//! source ──resolve──▶ fetch ──▶ decode ──▶ normalize ──▶ global filter ──▶ publish
//!                                                                          │
//!                                       ChangePoller ◀── start / stop ─────┘
//! ```
//!
//! A failed load records its error and leaves the published dataset as it
//! was. Each load takes a monotonically increasing request id; only the
//! most recent request may publish, and older ones report
//! [`LoadOutcome::Superseded`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::auth;
use crate::config::Config;
use crate::decode::{decode_str, text_from_bytes};
use crate::error::LoadError;
use crate::fetch::{FetchOptions, FetchPipeline};
use crate::models::{
    DatasetIndexes, LoadOutcome, LoadReport, LoadedSource, ProductRow, SyncState,
};
use crate::normalize::normalize;
use crate::poller::{ChangePoller, GithubContentsProbe, PollSettings};
use crate::resolve::{resolve_with_api, ResolvedSource};
use crate::state::Settings;

/// Formats dropped from every dataset before it is published.
pub const EXCLUDED_FORMATS: [&str; 2] = ["CD", "CP"];

/// Drop rows of excluded formats. Returns the kept rows and the number
/// dropped. Idempotent.
pub fn apply_global_filter(rows: Vec<ProductRow>) -> (Vec<ProductRow>, usize) {
    let before = rows.len();
    let kept: Vec<ProductRow> = rows
        .into_iter()
        .filter(|r| !EXCLUDED_FORMATS.contains(&r.format.as_str()))
        .collect();
    let excluded = before - kept.len();
    (kept, excluded)
}

/// SHA-256 of the raw text, hex encoded.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Point-in-time copy of the published dataset.
#[derive(Debug, Clone, Default)]
pub struct DatasetSnapshot {
    pub rows: Arc<Vec<ProductRow>>,
    pub indexes: DatasetIndexes,
    pub source: Option<LoadedSource>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct StoreState {
    rows: Arc<Vec<ProductRow>>,
    indexes: DatasetIndexes,
    source: Option<LoadedSource>,
    loaded_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Decrements the in-flight counter when a load ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DatasetStore {
    default_url: String,
    api_base: String,
    settings: Settings,
    pipeline: FetchPipeline,
    poller: ChangePoller,
    state: RwLock<StoreState>,
    latest_request: AtomicU64,
    in_flight: AtomicUsize,
    seed: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DatasetStore {
    /// Open the configured state directory and build a networked store.
    pub fn open(config: &Config) -> Result<Self> {
        let settings = Settings::open(&config.state.dir)?;
        Self::new(config, settings)
    }

    /// Store wired to the network: configured fetch chain and GitHub probe.
    pub fn new(config: &Config, settings: Settings) -> Result<Self> {
        let pipeline = FetchPipeline::from_config(&config.fetch)?;
        let probe = Arc::new(GithubContentsProbe::new(config.fetch.timeout())?);
        let poller = ChangePoller::new(probe, PollSettings::from_config(&config.poll));
        Ok(Self::with_components(config, settings, pipeline, poller))
    }

    pub fn with_components(
        config: &Config,
        settings: Settings,
        pipeline: FetchPipeline,
        poller: ChangePoller,
    ) -> Self {
        Self {
            default_url: config.source.default_url.clone(),
            api_base: config.poll.api_base.clone(),
            settings,
            pipeline,
            poller,
            state: RwLock::new(StoreState::default()),
            latest_request: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            seed: std::sync::Mutex::new(None),
        }
    }

    // ─── Loading ───

    /// Load a local file. Polling stops: local files have no version token.
    pub async fn load_from_file(&self, path: &Path) -> Result<LoadOutcome, LoadError> {
        let (request, _guard) = self.begin();
        tracing::info!(path = %path.display(), "loading dataset from file");

        let result = async {
            let bytes = tokio::fs::read(path).await.map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            parse_dataset(&text_from_bytes(&bytes))
        }
        .await;

        let source = LoadedSource::File(path.display().to_string());
        self.finish(request, source, result, None).await
    }

    /// Resolve, fetch, and publish a URL (or a local path given as a URL).
    ///
    /// On success polling restarts for pollable sources and stops for the
    /// rest; a baseline version token is then seeded in the background and
    /// persisted as `lastVersion`.
    pub async fn load_from_url(
        &self,
        url: &str,
        force_fresh: bool,
    ) -> Result<LoadOutcome, LoadError> {
        let (request, _guard) = self.begin();
        let resolved = resolve_with_api(url, &self.api_base);
        tracing::info!(
            url = %resolved.fetch_url,
            fresh = force_fresh,
            pollable = resolved.is_pollable(),
            "loading dataset"
        );

        let result = async {
            let text = self
                .pipeline
                .fetch_text(&resolved.fetch_url, FetchOptions { force_fresh })
                .await?;
            parse_dataset(&text)
        }
        .await;

        let source = LoadedSource::Url {
            fetch_url: resolved.fetch_url.clone(),
            poll_url: resolved.poll_url.clone(),
        };
        self.finish(request, source, result, Some(&resolved)).await
    }

    /// Reload the effective source, bypassing caches.
    pub async fn refresh(&self) -> Result<LoadOutcome, LoadError> {
        let url = self.effective_source();
        self.load_from_url(&url, true).await
    }

    /// Persist (or clear) the custom source, then reload.
    pub async fn set_source(&self, url: Option<&str>) -> Result<LoadOutcome> {
        self.settings.set_custom_source_url(url)?;
        Ok(self.refresh().await?)
    }

    /// Probe the tracked source now. Returns whether an update is available.
    pub async fn check_for_updates(&self) -> bool {
        self.poller.check_now().await
    }

    /// Drop the dataset and stop polling. In-flight loads are superseded.
    pub async fn reset(&self) {
        self.latest_request.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        *state = StoreState::default();
        self.poller.stop().await;
        tracing::debug!("dataset reset");
    }

    /// End the session: drop the dataset, stop polling, and forget the
    /// logged-in user.
    pub async fn logout(&self) -> Result<()> {
        self.reset().await;
        auth::logout(&self.settings)
    }

    fn begin(&self) -> (u64, InFlight<'_>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let request = self.latest_request.fetch_add(1, Ordering::SeqCst) + 1;
        (request, InFlight(&self.in_flight))
    }

    fn is_current(&self, request: u64) -> bool {
        self.latest_request.load(Ordering::SeqCst) == request
    }

    /// Publish a result if `request` is still the latest. The write lock is
    /// held through the poller update so two loads cannot interleave them.
    async fn finish(
        &self,
        request: u64,
        source: LoadedSource,
        result: Result<(Vec<ProductRow>, String), LoadError>,
        resolved: Option<&ResolvedSource>,
    ) -> Result<LoadOutcome, LoadError> {
        let mut state = self.state.write().await;
        if !self.is_current(request) {
            tracing::debug!(request, "load superseded; result discarded");
            return Ok(LoadOutcome::Superseded);
        }

        let (rows, content_hash) = match result {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "load failed; keeping previous dataset");
                state.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let (rows, excluded) = apply_global_filter(rows);
        if rows.is_empty() {
            tracing::warn!("loaded dataset is empty");
        }
        tracing::info!(rows = rows.len(), excluded, hash = %content_hash, "dataset published");

        let report = LoadReport {
            source: source.clone(),
            rows: rows.len(),
            excluded,
            content_hash,
        };
        *state = StoreState {
            indexes: DatasetIndexes::build(&rows),
            rows: Arc::new(rows),
            source: Some(source),
            loaded_at: Some(Utc::now()),
            last_error: None,
        };

        match resolved.and_then(|r| r.poll_url.as_deref().map(|p| (r.fetch_url.as_str(), p))) {
            Some((fetch_url, poll_url)) => {
                let generation = self.poller.start(fetch_url, poll_url, None).await;
                self.spawn_seed(generation, fetch_url.to_string());
            }
            None => self.poller.stop().await,
        }

        Ok(LoadOutcome::Applied(report))
    }

    fn spawn_seed(&self, generation: u64, fetch_url: String) {
        let poller = self.poller.clone();
        let settings = self.settings.clone();
        let handle = tokio::spawn(async move {
            if let Some(token) = poller.seed_baseline(generation).await {
                if let Err(e) = settings.set_last_version(&fetch_url, &token) {
                    tracing::warn!(error = %e, "could not persist last version");
                }
            }
        });
        if let Some(previous) = self.seed_slot().replace(handle) {
            previous.abort();
        }
    }

    /// Wait up to `timeout` for the background baseline probe of the last
    /// load. Short-lived callers use this so `lastVersion` is persisted
    /// before they exit.
    pub async fn wait_for_baseline(&self, timeout: Duration) {
        let handle = self.seed_slot().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::debug!("baseline probe still running; not waiting further");
            }
        }
    }

    fn seed_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.seed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ─── Accessors ───

    /// Persisted custom source, else the configured default.
    pub fn effective_source(&self) -> String {
        self.settings
            .custom_source_url()
            .unwrap_or_else(|| self.default_url.clone())
    }

    pub async fn rows(&self) -> Arc<Vec<ProductRow>> {
        self.state.read().await.rows.clone()
    }

    pub async fn indexes(&self) -> DatasetIndexes {
        self.state.read().await.indexes.clone()
    }

    pub async fn snapshot(&self) -> DatasetSnapshot {
        let state = self.state.read().await;
        DatasetSnapshot {
            rows: state.rows.clone(),
            indexes: state.indexes.clone(),
            source: state.source.clone(),
            loaded_at: state.loaded_at,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.poller.sync_state().await
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn poller(&self) -> &ChangePoller {
        &self.poller
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

fn parse_dataset(text: &str) -> Result<(Vec<ProductRow>, String), LoadError> {
    let hash = content_hash(text);
    let records = decode_str(text)?;
    Ok((normalize(&records), hash))
}
