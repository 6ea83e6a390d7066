//! Source URL resolution.
//!
//! Turns a user-supplied or configured source into something fetchable:
//!
//! | Input | `fetch_url` |
//! |-------|-------------|
//! | `https://github.com/o/r/blob/main/data/x.csv` | `https://raw.githubusercontent.com/o/r/main/data/x.csv` |
//! | `https://raw.githubusercontent.com/o/r/refs/heads/main/x.csv` | `https://raw.githubusercontent.com/o/r/main/x.csv` |
//! | anything else | unchanged (trimmed) |
//!
//! When the result is a raw GitHub URL, a companion contents-API URL is
//! derived for version polling. It is never used to fetch content.
//!
//! Resolution is pure string work and idempotent.

use reqwest::Url;
use serde::Serialize;

/// Default GitHub REST API base used for poll URLs.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const RAW_HOST: &str = "raw.githubusercontent.com";

/// A source ready for the fetch pipeline and the change poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSource {
    pub fetch_url: String,
    /// Metadata URL for version polling; `None` disables polling.
    pub poll_url: Option<String>,
}

impl ResolvedSource {
    pub fn is_pollable(&self) -> bool {
        self.poll_url.is_some()
    }
}

/// Resolve a source against the public GitHub API.
pub fn resolve(url: &str) -> ResolvedSource {
    resolve_with_api(url, DEFAULT_API_BASE)
}

/// Resolve a source, deriving poll URLs against `api_base`.
pub fn resolve_with_api(url: &str, api_base: &str) -> ResolvedSource {
    let fetch_url = rewrite(url.trim());
    let poll_url = RawLocation::parse(&fetch_url).map(|loc| loc.contents_url(api_base));
    ResolvedSource {
        fetch_url,
        poll_url,
    }
}

/// Whether the target is an HTTP(S) URL rather than a local path.
pub fn is_remote(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn rewrite(input: &str) -> String {
    let Ok(mut url) = Url::parse(input) else {
        return input.to_string();
    };
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let mut segments: Vec<String> = match url.path_segments() {
        Some(s) => s.map(str::to_string).collect(),
        None => return input.to_string(),
    };

    let on_github = host == "github.com" || host == "www.github.com";
    if on_github && segments.len() > 3 && segments[2] == "blob" {
        segments.remove(2);
        if url.set_host(Some(RAW_HOST)).is_err() || url.set_scheme("https").is_err() {
            return input.to_string();
        }
    } else if host != RAW_HOST {
        return input.to_string();
    }

    // Branch refs break raw URLs on some hosts: /o/r/refs/heads/main/... → /o/r/main/...
    if segments.len() > 4 && segments[2] == "refs" && segments[3] == "heads" {
        segments.drain(2..4);
    }

    url.set_path(&format!("/{}", segments.join("/")));
    url.to_string()
}

/// `raw.githubusercontent.com/{owner}/{repo}/{branch}/{path}`
struct RawLocation {
    owner: String,
    repo: String,
    branch: String,
    path: String,
}

impl RawLocation {
    fn parse(fetch_url: &str) -> Option<Self> {
        let url = Url::parse(fetch_url).ok()?;
        if !url.host_str()?.eq_ignore_ascii_case(RAW_HOST) {
            return None;
        }
        let segments: Vec<&str> = url.path_segments()?.collect();
        if segments.len() < 4 || segments[..4].iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self {
            owner: segments[0].to_string(),
            repo: segments[1].to_string(),
            branch: segments[2].to_string(),
            path: segments[3..].join("/"),
        })
    }

    fn contents_url(&self, api_base: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            api_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.path,
            self.branch
        )
    }
}
