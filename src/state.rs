//! Persisted key/value settings.
//!
//! Two JSON object files under the configured state directory:
//!
//! | File | Scope | Keys |
//! |------|-------|------|
//! | `settings.json` | durable | `customSourceUrl`, `sessionUser` (remembered), `usersCache`, `lastVersion` |
//! | `session.json` | session | `sessionUser` |
//!
//! Reads never fail: a missing or corrupt file reads as empty (corruption
//! is logged). Writes replace the file through a temporary sibling.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::auth::{parse_users, SessionUser, UserRecord};

pub const CUSTOM_SOURCE_URL: &str = "customSourceUrl";
pub const SESSION_USER: &str = "sessionUser";
pub const USERS_CACHE: &str = "usersCache";
pub const LAST_VERSION: &str = "lastVersion";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Durable,
    Session,
}

impl Scope {
    fn file_name(self) -> &'static str {
        match self {
            Scope::Durable => "settings.json",
            Scope::Session => "session.json",
        }
    }
}

/// Version token last seen for a source, so a later run can tell whether
/// upstream moved without downloading the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastVersion {
    pub fetch_url: String,
    pub token: String,
    pub recorded_at: DateTime<Utc>,
}

/// Handle to the state directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Settings {
    dir: PathBuf,
}

impl Settings {
    /// Open (and create if needed) the state directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ─── Typed accessors ───

    pub fn custom_source_url(&self) -> Option<String> {
        self.get::<String>(Scope::Durable, CUSTOM_SOURCE_URL)
            .filter(|url| !url.trim().is_empty())
    }

    pub fn set_custom_source_url(&self, url: Option<&str>) -> Result<()> {
        match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => self.set(Scope::Durable, CUSTOM_SOURCE_URL, &url),
            None => self.remove(Scope::Durable, CUSTOM_SOURCE_URL),
        }
    }

    /// The remembered session first, then the session-scoped one.
    pub fn session_user(&self) -> Option<SessionUser> {
        self.get(Scope::Durable, SESSION_USER)
            .or_else(|| self.get(Scope::Session, SESSION_USER))
    }

    pub fn save_session_user(&self, user: &SessionUser, remember: bool) -> Result<()> {
        let scope = if remember {
            Scope::Durable
        } else {
            Scope::Session
        };
        self.set(scope, SESSION_USER, user)
    }

    /// Forget the session in both scopes.
    pub fn clear_session(&self) -> Result<()> {
        self.remove(Scope::Durable, SESSION_USER)?;
        self.remove(Scope::Session, SESSION_USER)
    }

    /// Cached user list. Entries that no longer parse are skipped.
    pub fn cached_users(&self) -> Option<Vec<UserRecord>> {
        self.get::<Vec<Value>>(Scope::Durable, USERS_CACHE)
            .map(parse_users)
    }

    pub fn cache_users(&self, users: &[UserRecord]) -> Result<()> {
        self.set(Scope::Durable, USERS_CACHE, &users)
    }

    pub fn last_version(&self) -> Option<LastVersion> {
        self.get(Scope::Durable, LAST_VERSION)
    }

    pub fn set_last_version(&self, fetch_url: &str, token: &str) -> Result<()> {
        let record = LastVersion {
            fetch_url: fetch_url.to_string(),
            token: token.to_string(),
            recorded_at: Utc::now(),
        };
        self.set(Scope::Durable, LAST_VERSION, &record)
    }

    // ─── Raw access ───

    /// Read and deserialize a key. Values of the wrong shape read as absent.
    pub fn get<T: DeserializeOwned>(&self, scope: Scope, key: &str) -> Option<T> {
        let value = self.read_map(scope).remove(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, error = %e, "ignoring malformed setting");
                None
            }
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, scope: Scope, key: &str, value: &T) -> Result<()> {
        let mut map = self.read_map(scope);
        map.insert(
            key.to_string(),
            serde_json::to_value(value).with_context(|| format!("Failed to encode {}", key))?,
        );
        self.write_map(scope, &map)
    }

    pub fn remove(&self, scope: Scope, key: &str) -> Result<()> {
        let mut map = self.read_map(scope);
        if map.remove(key).is_some() {
            self.write_map(scope, &map)?;
        }
        Ok(())
    }

    fn path(&self, scope: Scope) -> PathBuf {
        self.dir.join(scope.file_name())
    }

    fn read_map(&self, scope: Scope) -> Map<String, Value> {
        let path = self.path(scope);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read settings");
                return Map::new();
            }
        };
        match serde_json::from_str::<Map<String, Value>>(&content) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "settings file is corrupt; treating as empty");
                Map::new()
            }
        }
    }

    /// Replace the file through a uniquely named sibling, so concurrent
    /// writers never share a temporary file.
    fn write_map(&self, scope: Scope, map: &Map<String, Value>) -> Result<()> {
        let path = self.path(scope);
        let body = serde_json::to_string_pretty(map)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create a temporary file in {}", self.dir.display()))?;
        tmp.write_all(body.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.path().display()))?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
