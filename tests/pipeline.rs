//! Integration tests for the ingestion pipeline.
//!
//! These tests drive the public library API end to end: real `reqwest`
//! fetchers and the GitHub contents probe talk to a small HTTP responder
//! bound to a local port, so fallback order, cache busting, and version
//! polling are exercised over actual sockets.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stock_harness::auth::{Role, UserDirectory};
use stock_harness::config::{Config, UsersConfig};
use stock_harness::error::{FetchError, LoadError};
use stock_harness::fetch::{ContentFetcher, FetchOptions, FetchPipeline};
use stock_harness::models::{LoadOutcome, LoadedSource};
use stock_harness::poller::{ChangePoller, GithubContentsProbe, PollSettings};
use stock_harness::state::Settings;
use stock_harness::store::DatasetStore;
use tempfile::TempDir;

const HEADER: &str =
    "CADENA;COD;DESCRIPCION;MARCA;COD LOCAL;DESCRIPCION LOCAL;FORMATO;VTA;STOCK;DESCRIPCION LOCAL2";
const ROW_TIENDA: &str = "CADENA A;10011;Polo Basico;ADMID;L01;CENTRAL;TIENDA;10;5;TIENDA CENTRAL";
const ROW_CD: &str = "CADENA A;10011;Polo Basico;ADMID;L01;CENTRAL;CD;10;5;TIENDA CENTRAL";

// ─── Test HTTP Server ───────────────────────────────────────────────

type Routes = Arc<Mutex<HashMap<String, (u16, String)>>>;

/// Answers `GET <path>` from a route table keyed by path (query ignored)
/// and records every request target it sees.
struct TestServer {
    port: u16,
    routes: Routes,
    hits: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let hits = Arc::new(Mutex::new(Vec::new()));

        let (r, h) = (routes.clone(), hits.clone());
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                handle(stream, &r, &h);
            }
        });

        Self { port, routes, hits }
    }

    fn route(&self, path: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string()));
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    fn hits_for(&self, path: &str) -> usize {
        self.hits()
            .iter()
            .filter(|h| h.split('?').next() == Some(path))
            .count()
    }
}

fn handle(stream: TcpStream, routes: &Routes, hits: &Arc<Mutex<Vec<String>>>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) if line == "\r\n" => break,
            Ok(_) => {}
        }
    }

    let target = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    hits.lock().unwrap().push(target.clone());

    let path = target.split('?').next().unwrap_or("/");
    let (status, body) = routes
        .lock()
        .unwrap()
        .get(path)
        .cloned()
        .unwrap_or((404, "not found".to_string()));

    let response = format!(
        "HTTP/1.1 {} X\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let mut stream = stream;
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

// ─── Helpers ────────────────────────────────────────────────────────

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::minimal();
    config.fetch.relays = vec![];
    config.fetch.timeout_secs = 5;
    config.fetch.direct_retries = 1;
    config.fetch.backoff_ms = 10;
    config.state.dir = tmp.path().join("state");
    config
}

fn csv(rows: &[&str]) -> String {
    let mut text = String::from(HEADER);
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    text.push('\n');
    text
}

/// Serves the same CSV text for every URL.
struct StaticFetcher(String);

#[async_trait]
impl ContentFetcher for StaticFetcher {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, _url: &str, _opts: FetchOptions) -> Result<String, FetchError> {
        Ok(self.0.clone())
    }
}

/// A store that fetches through `StaticFetcher` but polls the test server.
fn polling_store(tmp: &TempDir, server: &TestServer) -> DatasetStore {
    let mut config = test_config(tmp);
    config.poll.api_base = server.url("");
    let settings = Settings::open(&config.state.dir).unwrap();

    let mut pipeline = FetchPipeline::new();
    pipeline.register(Box::new(StaticFetcher(csv(&[ROW_TIENDA]))));
    let probe = Arc::new(GithubContentsProbe::new(Duration::from_secs(5)).unwrap());
    let poller = ChangePoller::new(
        probe,
        PollSettings {
            interval: Duration::from_secs(3600),
            window: None,
        },
    );
    DatasetStore::with_components(&config, settings, pipeline, poller)
}

const CONTENTS_PATH: &str = "/repos/acme/datos/contents/data/SPSA.csv";
const BLOB_URL: &str = "https://github.com/acme/datos/blob/main/data/SPSA.csv";

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_semicolon_csv_over_http() {
    let server = TestServer::start();
    server.route("/SPSA.csv", 200, &csv(&[ROW_TIENDA]));
    let tmp = TempDir::new().unwrap();
    let store = DatasetStore::open(&test_config(&tmp)).unwrap();

    let outcome = store
        .load_from_url(&server.url("/SPSA.csv"), false)
        .await
        .unwrap();
    assert!(matches!(outcome, LoadOutcome::Applied(ref r) if r.rows == 1));

    let rows = store.rows().await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.sku, "10011");
    assert_eq!(row.stock, 5.0);
    assert_eq!(row.sales_last_30_days, 10.0);
    assert_eq!(row.format, "TIENDA");
    assert_eq!(row.store_name, "TIENDA CENTRAL");
    assert_eq!(row.store_description, "CENTRAL");
    assert_eq!(row.store_code, "L01");
}

#[tokio::test]
async fn test_excluded_format_never_published() {
    let server = TestServer::start();
    server.route("/SPSA.csv", 200, &csv(&[ROW_CD, ROW_TIENDA]));
    let tmp = TempDir::new().unwrap();
    let store = DatasetStore::open(&test_config(&tmp)).unwrap();

    let outcome = store
        .load_from_url(&server.url("/SPSA.csv"), false)
        .await
        .unwrap();
    let LoadOutcome::Applied(report) = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(report.rows, 1);
    assert_eq!(report.excluded, 1);

    let rows = store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].format, "TIENDA");
    assert_eq!(store.indexes().await.unique_formats, vec!["TIENDA"]);
}

#[tokio::test]
async fn test_unreachable_source_records_error() {
    let tmp = TempDir::new().unwrap();
    let store = DatasetStore::open(&test_config(&tmp)).unwrap();
    let url = format!("http://127.0.0.1:{}/SPSA.csv", find_free_port());

    let err = store.load_from_url(&url, false).await.unwrap_err();
    assert!(matches!(
        err,
        LoadError::Fetch(FetchError::Exhausted { ref attempts, .. }) if attempts.len() == 1
    ));
    assert!(store.rows().await.is_empty());
    assert!(store.last_error().await.is_some());
    assert!(!store.is_loading());
}

// ─── Fetch chain ────────────────────────────────────────────────────

#[tokio::test]
async fn test_html_response_falls_back_to_relay() {
    let server = TestServer::start();
    server.route(
        "/SPSA.csv",
        200,
        "<!DOCTYPE html>\n<html><body>Sign in</body></html>",
    );
    server.route("/relay", 200, &csv(&[ROW_TIENDA]));

    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.fetch.relays = vec![server.url("/relay?u={url}")];
    let store = DatasetStore::open(&config).unwrap();

    let target = server.url("/SPSA.csv");
    store.load_from_url(&target, false).await.unwrap();
    assert_eq!(store.rows().await.len(), 1);

    let hits = server.hits();
    assert_eq!(hits[0], "/SPSA.csv");
    let relay_hit = hits.iter().find(|h| h.starts_with("/relay")).unwrap();
    assert!(relay_hit.contains("u=http%3A%2F%2F127.0.0.1%3A"));
}

#[tokio::test]
async fn test_html_everywhere_is_invalid_payload() {
    let server = TestServer::start();
    server.route("/SPSA.csv", 200, "<html><body>404</body></html>");

    let tmp = TempDir::new().unwrap();
    let store = DatasetStore::open(&test_config(&tmp)).unwrap();
    let err = store
        .load_from_url(&server.url("/SPSA.csv"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Fetch(FetchError::InvalidPayload { .. })));
}

#[tokio::test]
async fn test_direct_retries_server_errors_then_relays() {
    let server = TestServer::start();
    server.route("/SPSA.csv", 503, "busy");
    server.route("/first", 502, "bad gateway");
    server.route("/second", 200, &csv(&[ROW_TIENDA]));

    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.fetch.relays = vec![server.url("/first?u={url}"), server.url("/second?u={url}")];
    let store = DatasetStore::open(&config).unwrap();

    store
        .load_from_url(&server.url("/SPSA.csv"), false)
        .await
        .unwrap();

    // One retry for the direct fetch, relays tried once each, in order.
    assert_eq!(server.hits_for("/SPSA.csv"), 2);
    let order: Vec<String> = server
        .hits()
        .into_iter()
        .map(|h| h.split('?').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(order, vec!["/SPSA.csv", "/SPSA.csv", "/first", "/second"]);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = TestServer::start();
    server.route("/SPSA.csv", 403, "forbidden");

    let tmp = TempDir::new().unwrap();
    let store = DatasetStore::open(&test_config(&tmp)).unwrap();
    assert!(store
        .load_from_url(&server.url("/SPSA.csv"), false)
        .await
        .is_err());
    assert_eq!(server.hits_for("/SPSA.csv"), 1);
}

#[tokio::test]
async fn test_fresh_load_busts_cache() {
    let server = TestServer::start();
    server.route("/SPSA.csv", 200, &csv(&[ROW_TIENDA]));

    let tmp = TempDir::new().unwrap();
    let store = DatasetStore::open(&test_config(&tmp)).unwrap();

    store
        .load_from_url(&server.url("/SPSA.csv"), false)
        .await
        .unwrap();
    store
        .load_from_url(&server.url("/SPSA.csv"), true)
        .await
        .unwrap();

    let hits = server.hits();
    assert_eq!(hits[0], "/SPSA.csv");
    assert!(hits[1].starts_with("/SPSA.csv?t="), "got {}", hits[1]);
}

#[tokio::test]
async fn test_local_file_through_url_loader() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("SPSA.csv");
    std::fs::write(&path, csv(&[ROW_TIENDA, ROW_CD])).unwrap();

    let mut config = test_config(&tmp);
    config.source.default_url = path.display().to_string();
    let store = DatasetStore::open(&config).unwrap();

    let outcome = store.refresh().await.unwrap();
    let LoadOutcome::Applied(report) = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(report.rows, 1);
    assert!(matches!(report.source, LoadedSource::Url { poll_url: None, .. }));
    assert!(!store.poller().is_tracking().await);
}

// ─── Polling ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_poll_detects_upstream_change() {
    let server = TestServer::start();
    server.route(CONTENTS_PATH, 200, r#"{"name":"SPSA.csv","sha":"abc123"}"#);
    let tmp = TempDir::new().unwrap();
    let store = polling_store(&tmp, &server);

    store.load_from_url(BLOB_URL, false).await.unwrap();
    store.wait_for_baseline(Duration::from_secs(5)).await;

    let sync = store.sync_state().await;
    assert_eq!(sync.version_token.as_deref(), Some("abc123"));
    assert!(!sync.update_available);
    let last = store.settings().last_version().unwrap();
    assert_eq!(last.token, "abc123");
    assert_eq!(
        last.fetch_url,
        "https://raw.githubusercontent.com/acme/datos/main/data/SPSA.csv"
    );

    // Same token: no update.
    assert!(!store.check_for_updates().await);
    assert!(server.hits().iter().any(|h| h.ends_with("?ref=main")));

    server.route(CONTENTS_PATH, 200, r#"{"sha":"def456"}"#);
    assert!(store.check_for_updates().await);
    assert!(store.sync_state().await.update_available);

    // Reloading clears the flag and adopts the new baseline.
    store.load_from_url(BLOB_URL, true).await.unwrap();
    store.wait_for_baseline(Duration::from_secs(5)).await;
    let sync = store.sync_state().await;
    assert!(!sync.update_available);
    assert_eq!(sync.version_token.as_deref(), Some("def456"));
}

#[tokio::test]
async fn test_poll_failures_are_not_updates() {
    let server = TestServer::start();
    server.route(CONTENTS_PATH, 200, r#"{"sha":"abc123"}"#);
    let tmp = TempDir::new().unwrap();
    let store = polling_store(&tmp, &server);

    store.load_from_url(BLOB_URL, false).await.unwrap();
    store.wait_for_baseline(Duration::from_secs(5)).await;

    server.route(CONTENTS_PATH, 500, "oops");
    assert!(!store.check_for_updates().await);

    server.route(CONTENTS_PATH, 200, r#"{"message":"no sha here"}"#);
    assert!(!store.check_for_updates().await);

    let sync = store.sync_state().await;
    assert_eq!(sync.version_token.as_deref(), Some("abc123"));
    assert!(!sync.update_available);
}

// ─── Users ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_user_directory_fetch_and_cached_fallback() {
    let server = TestServer::start();
    server.route(
        "/users.json",
        200,
        r#"[{"username":"ANA","pass":"pw","role":"VISUALIZADOR"},
            {"username":"JEFE","pass":"secret","role":"ADMINISTRADOR"}]"#,
    );
    let tmp = TempDir::new().unwrap();
    let settings = Settings::open(tmp.path()).unwrap();
    let mut dir = UserDirectory::new(
        &UsersConfig {
            url: Some(server.url("/users.json")),
        },
        Duration::from_secs(5),
    )
    .unwrap();

    dir.refresh(&settings).await;
    assert!(dir.auth_error().is_none());
    assert_eq!(dir.users().len(), 2);
    assert_eq!(settings.cached_users().unwrap().len(), 2);
    assert!(server.hits()[0].starts_with("/users.json?t="));

    let session = dir.login(&settings, "JEFE", "secret", false).unwrap();
    assert_eq!(session.role, Role::Administrador);

    // Directory goes away: the cache keeps logins working.
    server.route("/users.json", 500, "down");
    dir.refresh(&settings).await;
    assert!(dir.auth_error().is_some());
    assert_eq!(dir.users().len(), 2);
    assert!(dir.login(&settings, "ANA", "pw", true).is_ok());

    // Malformed directory content is a fallback too.
    server.route("/users.json", 200, r#"{"users":[]}"#);
    dir.refresh(&settings).await;
    assert!(dir.auth_error().unwrap().contains("JSON array"));
}
