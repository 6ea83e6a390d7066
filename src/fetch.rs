//! Layered content fetching.
//!
//! A [`FetchPipeline`] holds an ordered list of [`ContentFetcher`]s and
//! returns the text from the first one that succeeds. The built-in chain is:
//!
//! 1. [`DirectFetcher`]: a plain GET (or a filesystem read for local paths),
//!    retried with exponential backoff on network errors, 429, and 5xx.
//! 2. One [`RelayFetcher`] per configured relay template, tried once each.
//!
//! Every payload is checked before it is accepted. Text that starts like
//! an HTML document is an error page, not data, so the next strategy is
//! tried.
//!
//! # Cache busting
//!
//! With [`FetchOptions::force_fresh`] the target URL gets a `t=<unix-millis>`
//! query parameter and requests carry `Cache-Control: no-cache`.

use std::fmt::Write;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CACHE_CONTROL;
use reqwest::Url;

use crate::config::FetchConfig;
use crate::decode::text_from_bytes;
use crate::error::{FetchAttempt, FetchError};
use crate::resolve::is_remote;

const USER_AGENT: &str = concat!("stock-harness/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Bypass caches (cache-busting parameter plus `no-cache`).
    pub force_fresh: bool,
}

impl FetchOptions {
    pub fn fresh() -> Self {
        Self { force_fresh: true }
    }
}

/// One strategy for retrieving a URL's text.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Short label used in logs and error reports.
    fn name(&self) -> &str;

    async fn fetch(&self, url: &str, opts: FetchOptions) -> Result<String, FetchError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════

/// Ordered fallback chain of content fetchers.
pub struct FetchPipeline {
    fetchers: Vec<Box<dyn ContentFetcher>>,
}

impl FetchPipeline {
    /// An empty pipeline. Fetches fail until a fetcher is registered.
    pub fn new() -> Self {
        Self {
            fetchers: Vec::new(),
        }
    }

    /// The direct fetcher followed by every configured relay.
    pub fn from_config(config: &FetchConfig) -> Result<Self> {
        let client = build_client(config.timeout())?;
        let mut pipeline = Self::new();
        pipeline.register(Box::new(DirectFetcher::new(
            client.clone(),
            config.direct_retries,
            config.backoff(),
        )));
        for (i, template) in config.relays.iter().enumerate() {
            pipeline.register(Box::new(RelayFetcher::new(
                relay_name(template, i),
                template.clone(),
                client.clone(),
            )));
        }
        Ok(pipeline)
    }

    /// Append a fetcher to the end of the chain.
    pub fn register(&mut self, fetcher: Box<dyn ContentFetcher>) {
        self.fetchers.push(fetcher);
    }

    pub fn fetcher_names(&self) -> Vec<&str> {
        self.fetchers.iter().map(|f| f.name()).collect()
    }

    /// Fetch `url` with each strategy in order until one yields valid text.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidPayload`] if some strategy reached a server
    ///   that answered with HTML and no strategy succeeded.
    /// - [`FetchError::Exhausted`] otherwise, with every attempt's cause.
    pub async fn fetch_text(&self, url: &str, opts: FetchOptions) -> Result<String, FetchError> {
        let mut attempts: Vec<FetchAttempt> = Vec::new();

        for fetcher in &self.fetchers {
            let result = fetcher
                .fetch(url, opts)
                .await
                .and_then(|text| validate_payload(url, text));

            match result {
                Ok(text) => {
                    if !attempts.is_empty() {
                        tracing::info!(
                            fetcher = fetcher.name(),
                            failed = attempts.len(),
                            "fetched {} via fallback",
                            url
                        );
                    }
                    return Ok(text);
                }
                Err(error) => {
                    tracing::warn!(fetcher = fetcher.name(), %error, "fetch strategy failed");
                    attempts.push(FetchAttempt {
                        fetcher: fetcher.name().to_string(),
                        error,
                    });
                }
            }
        }

        if attempts
            .iter()
            .any(|a| matches!(a.error, FetchError::InvalidPayload { .. }))
        {
            return Err(FetchError::InvalidPayload {
                url: url.to_string(),
            });
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts,
        })
    }
}

impl Default for FetchPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject payloads that are HTML documents.
pub fn validate_payload(url: &str, text: String) -> Result<String, FetchError> {
    if looks_like_html(&text) {
        return Err(FetchError::InvalidPayload {
            url: url.to_string(),
        });
    }
    Ok(text)
}

/// `true` when the text opens with `<!DOCTYPE html` or `<html` (any case).
pub fn looks_like_html(text: &str) -> bool {
    let head: String = text
        .trim_start()
        .chars()
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

// ═══════════════════════════════════════════════════════════════════════
// Direct fetcher
// ═══════════════════════════════════════════════════════════════════════

/// GET the URL itself. Local paths and `file://` URLs are read from disk.
pub struct DirectFetcher {
    client: reqwest::Client,
    retries: u32,
    backoff: Duration,
}

impl DirectFetcher {
    pub fn new(client: reqwest::Client, retries: u32, backoff: Duration) -> Self {
        Self {
            client,
            retries,
            backoff,
        }
    }
}

#[async_trait]
impl ContentFetcher for DirectFetcher {
    fn name(&self) -> &str {
        "direct"
    }

    async fn fetch(&self, url: &str, opts: FetchOptions) -> Result<String, FetchError> {
        if !is_remote(url) {
            return read_local(url).await;
        }

        let target = if opts.force_fresh {
            cache_busted(url)
        } else {
            url.to_string()
        };

        let mut last_err = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                // Exponential backoff: base, 2×base, 4×base, ...
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, "retrying direct fetch of {}", url);
                tokio::time::sleep(delay).await;
            }

            match get_text(&self.client, &target, opts.force_fresh).await {
                Ok(text) => return Ok(text),
                Err(e) if is_retryable(&e) => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Network {
            url: url.to_string(),
            message: "no attempts were made".to_string(),
        }))
    }
}

fn is_retryable(err: &FetchError) -> bool {
    match err {
        FetchError::Network { .. } => true,
        FetchError::Http { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

async fn read_local(url: &str) -> Result<String, FetchError> {
    let path = std::path::PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| FetchError::Io { path, source })?;
    Ok(text_from_bytes(&bytes).into_owned())
}

// ═══════════════════════════════════════════════════════════════════════
// Relay fetcher
// ═══════════════════════════════════════════════════════════════════════

/// Fetch through a proxy whose template embeds the target as `{url}`.
pub struct RelayFetcher {
    name: String,
    template: String,
    client: reqwest::Client,
}

impl RelayFetcher {
    pub fn new(name: String, template: String, client: reqwest::Client) -> Self {
        Self {
            name,
            template,
            client,
        }
    }

    /// The relay URL for a target, with the target percent-encoded.
    pub fn relay_url(&self, target: &str) -> String {
        let encoded = encode_relay_target(target);
        if self.template.contains("{url}") {
            self.template.replace("{url}", &encoded)
        } else {
            format!("{}{}", self.template, encoded)
        }
    }
}

#[async_trait]
impl ContentFetcher for RelayFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, url: &str, opts: FetchOptions) -> Result<String, FetchError> {
        if !is_remote(url) {
            return Err(FetchError::Unsupported {
                fetcher: self.name.clone(),
                url: url.to_string(),
                reason: "relays only forward http(s) URLs".to_string(),
            });
        }
        let target = if opts.force_fresh {
            cache_busted(url)
        } else {
            url.to_string()
        };
        get_text(&self.client, &self.relay_url(&target), opts.force_fresh).await
    }
}

/// Label a relay by its host, falling back to its position.
fn relay_name(template: &str, index: usize) -> String {
    Url::parse(&template.replace("{url}", ""))
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| format!("relay-{}", index + 1))
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP helpers
// ═══════════════════════════════════════════════════════════════════════

/// Shared HTTP client with the configured timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

async fn get_text(client: &reqwest::Client, url: &str, no_cache: bool) -> Result<String, FetchError> {
    let mut req = client.get(url);
    if no_cache {
        req = req.header(CACHE_CONTROL, "no-cache");
    }

    let resp = req.send().await.map_err(|e| FetchError::Network {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = resp.bytes().await.map_err(|e| FetchError::Network {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    Ok(text_from_bytes(&bytes).into_owned())
}

/// Append `t=<unix-millis>` to the query string.
pub fn cache_busted(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let millis = chrono::Utc::now().timestamp_millis().to_string();
            parsed.query_pairs_mut().append_pair("t", &millis);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Encode a target URL as one query value for a relay template. Only the
/// RFC 3986 unreserved set (`A-Z a-z 0-9 - _ . ~`) passes through.
pub fn encode_relay_target(target: &str) -> String {
    target
        .bytes()
        .fold(String::with_capacity(target.len() * 3), |mut out, b| {
            if b.is_ascii_alphanumeric() || b"-_.~".contains(&b) {
                out.push(char::from(b));
            } else {
                let _ = write!(out, "%{:02X}", b);
            }
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    enum Script {
        Text(&'static str),
        Status(u16),
        Offline,
    }

    /// Fetcher that replays a fixed answer and logs each call.
    struct ScriptedFetcher {
        name: String,
        script: Script,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ContentFetcher for ScriptedFetcher {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self, url: &str, _opts: FetchOptions) -> Result<String, FetchError> {
            self.calls.lock().unwrap().push(self.name.clone());
            match &self.script {
                Script::Text(t) => Ok(t.to_string()),
                Script::Status(status) => Err(FetchError::Http {
                    url: url.to_string(),
                    status: *status,
                }),
                Script::Offline => Err(FetchError::Network {
                    url: url.to_string(),
                    message: "offline".to_string(),
                }),
            }
        }
    }

    fn pipeline(scripts: &[(&str, Script)]) -> (FetchPipeline, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut p = FetchPipeline::new();
        for (name, script) in scripts {
            p.register(Box::new(ScriptedFetcher {
                name: name.to_string(),
                script: script.clone(),
                calls: calls.clone(),
            }));
        }
        (p, calls)
    }

    #[tokio::test]
    async fn test_fallbacks_tried_in_order() {
        let (p, calls) = pipeline(&[
            ("direct", Script::Offline),
            ("relay-a", Script::Status(502)),
            ("relay-b", Script::Text("COD;STOCK\n1;2\n")),
            ("relay-c", Script::Text("never reached")),
        ]);
        let text = p
            .fetch_text("https://example.com/a.csv", FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "COD;STOCK\n1;2\n");
        assert_eq!(*calls.lock().unwrap(), vec!["direct", "relay-a", "relay-b"]);
    }

    #[tokio::test]
    async fn test_direct_success_skips_relays() {
        let (p, calls) = pipeline(&[
            ("direct", Script::Text("A,B\n1,2")),
            ("relay-a", Script::Text("other")),
        ]);
        let text = p.fetch_text("https://x/a.csv", FetchOptions::fresh()).await.unwrap();
        assert_eq!(text, "A,B\n1,2");
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_html_falls_back_to_relay() {
        let (p, _) = pipeline(&[
            ("direct", Script::Text("<!DOCTYPE html><html><body>login</body></html>")),
            ("relay-a", Script::Text("A;B\n1;2")),
        ]);
        let text = p.fetch_text("https://x/a.csv", FetchOptions::default()).await.unwrap();
        assert_eq!(text, "A;B\n1;2");
    }

    #[tokio::test]
    async fn test_html_everywhere_is_invalid_payload() {
        let (p, _) = pipeline(&[
            ("direct", Script::Text("<html><body>404</body></html>")),
            ("relay-a", Script::Offline),
        ]);
        let err = p
            .fetch_text("https://x/a.csv", FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn test_all_failures_exhausted_in_order() {
        let (p, _) = pipeline(&[
            ("direct", Script::Status(404)),
            ("relay-a", Script::Offline),
        ]);
        let err = p
            .fetch_text("https://x/a.csv", FetchOptions::default())
            .await
            .unwrap_err();
        match err {
            FetchError::Exhausted { attempts, .. } => {
                let names: Vec<_> = attempts.iter().map(|a| a.fetcher.as_str()).collect();
                assert_eq!(names, vec!["direct", "relay-a"]);
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_pipeline_fails() {
        let err = FetchPipeline::new()
            .fetch_text("https://x/a.csv", FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { ref attempts, .. } if attempts.is_empty()));
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("<!DOCTYPE html>\n<html>"));
        assert!(looks_like_html("  \n<!doctype HTML>"));
        assert!(looks_like_html("<html lang=\"es\">"));
        assert!(looks_like_html("<HTML>"));
        assert!(!looks_like_html("COD;DESCRIPCION\n1;<html> in a cell"));
        assert!(!looks_like_html(""));
    }

    #[test]
    fn test_encode_relay_target() {
        assert_eq!(encode_relay_target("abc-_.~"), "abc-_.~");
        assert_eq!(
            encode_relay_target("https://a.b/c.csv?t=1&x=a b"),
            "https%3A%2F%2Fa.b%2Fc.csv%3Ft%3D1%26x%3Da%20b"
        );
        assert_eq!(encode_relay_target("Ñ"), "%C3%91");
    }

    #[test]
    fn test_relay_url_substitutes_placeholder() {
        let relay = RelayFetcher::new(
            "allorigins".to_string(),
            "https://api.allorigins.win/raw?url={url}".to_string(),
            reqwest::Client::new(),
        );
        assert_eq!(
            relay.relay_url("https://x.io/a.csv"),
            "https://api.allorigins.win/raw?url=https%3A%2F%2Fx.io%2Fa.csv"
        );
    }

    #[test]
    fn test_relay_names_from_host() {
        assert_eq!(relay_name("https://corsproxy.io/?{url}", 0), "corsproxy.io");
        assert_eq!(relay_name("not a url {url}", 2), "relay-3");
    }

    #[test]
    fn test_cache_busted_keeps_existing_query() {
        let busted = cache_busted("https://example.com/a.csv?token=abc");
        assert!(busted.starts_with("https://example.com/a.csv?token=abc&t="));
        assert_eq!(cache_busted("./SPSA.csv"), "./SPSA.csv");
    }

    #[test]
    fn test_retry_classification() {
        let http = |status| FetchError::Http {
            url: String::new(),
            status,
        };
        assert!(is_retryable(&http(503)));
        assert!(is_retryable(&http(429)));
        assert!(!is_retryable(&http(404)));
        assert!(!is_retryable(&FetchError::InvalidPayload { url: String::new() }));
    }

    #[tokio::test]
    async fn test_direct_reads_local_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("inv.csv");
        std::fs::write(&path, "COD;STOCK\n1;2").unwrap();

        let fetcher = DirectFetcher::new(reqwest::Client::new(), 0, Duration::from_millis(1));
        let plain = fetcher
            .fetch(path.to_str().unwrap(), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(plain, "COD;STOCK\n1;2");

        let url = format!("file://{}", path.display());
        let via_scheme = fetcher.fetch(&url, FetchOptions::fresh()).await.unwrap();
        assert_eq!(via_scheme, plain);
    }

    #[tokio::test]
    async fn test_relays_refuse_local_paths() {
        let relay = RelayFetcher::new(
            "r".to_string(),
            "https://relay/?{url}".to_string(),
            reqwest::Client::new(),
        );
        let err = relay.fetch("./SPSA.csv", FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::Unsupported { .. }));
    }
}
