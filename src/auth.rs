//! User directory and session handling.
//!
//! Users come from a JSON array of `{username, pass, role}` hosted next to
//! the data. The directory falls back to the last cached copy and then to
//! a single built-in administrator, so a fresh install can always log in.
//! New users are appended to the local list only; publishing them means
//! exporting the list and uploading it.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::UsersConfig;
use crate::error::AuthError;
use crate::fetch::{build_client, cache_busted};
use crate::resolve::resolve;
use crate::state::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// May manage users.
    Administrador,
    Visualizador,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Administrador => "ADMINISTRADOR",
            Role::Visualizador => "VISUALIZADOR",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMINISTRADOR" | "ADMIN" => Ok(Role::Administrador),
            "VISUALIZADOR" | "VIEWER" => Ok(Role::Visualizador),
            other => Err(format!(
                "unknown role '{}' (expected ADMINISTRADOR or VISUALIZADOR)",
                other
            )),
        }
    }
}

/// Directory entry. Passwords are stored as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub pass: String,
    pub role: Role,
}

/// The logged-in user, as persisted in settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub username: String,
    pub role: Role,
}

/// Keep the entries that parse as users. One malformed entry does not
/// discard the rest of the list.
pub fn parse_users(entries: Vec<serde_json::Value>) -> Vec<UserRecord> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| match serde_json::from_value::<UserRecord>(entry) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!(index = i, error = %e, "skipping malformed user entry");
                None
            }
        })
        .collect()
}

/// Seed list used when neither the remote directory nor a cache exists.
pub fn default_users() -> Vec<UserRecord> {
    vec![UserRecord {
        username: "ADMIN".to_string(),
        pass: "123456".to_string(),
        role: Role::Administrador,
    }]
}

pub struct UserDirectory {
    url: Option<String>,
    client: reqwest::Client,
    users: Vec<UserRecord>,
    auth_error: Option<String>,
}

impl UserDirectory {
    /// An empty directory. Call [`refresh`](Self::refresh) or
    /// [`load_cached`](Self::load_cached) to populate it.
    pub fn new(config: &UsersConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: config.url.clone(),
            client: build_client(timeout)?,
            users: Vec::new(),
            auth_error: None,
        })
    }

    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    /// Why the last refresh fell back, if it did.
    pub fn auth_error(&self) -> Option<&str> {
        self.auth_error.as_deref()
    }

    /// Fetch the remote list. On success it replaces the in-memory list and
    /// the cache. On failure the error is recorded and the cached list (or
    /// the seed) is used instead. Never fails.
    pub async fn refresh(&mut self, settings: &Settings) {
        self.auth_error = None;

        let Some(url) = self.url.clone() else {
            tracing::debug!("no users.url configured; using cached users");
            self.users = cached_or_default(settings);
            return;
        };

        match self.fetch_remote(&url).await {
            Ok(users) => {
                tracing::info!(count = users.len(), "loaded user directory");
                if let Err(e) = settings.cache_users(&users) {
                    tracing::warn!(error = %e, "could not cache user directory");
                }
                self.users = users;
            }
            Err(e) => {
                tracing::warn!(error = %e, "user directory unavailable; falling back");
                self.auth_error = Some(format!("{:#}", e));
                self.users = cached_or_default(settings);
            }
        }
    }

    /// Populate from the cache, refreshing only when nothing is cached.
    pub async fn load_cached(&mut self, settings: &Settings) {
        match settings.cached_users() {
            Some(users) => self.users = users,
            None => self.refresh(settings).await,
        }
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<UserRecord>> {
        let target = cache_busted(&resolve(url).fetch_url);
        let resp = self
            .client
            .get(&target)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} from {}", status.as_u16(), url);
        }

        let text = resp.text().await?;
        let entries = serde_json::from_str::<Vec<serde_json::Value>>(&text)
            .with_context(|| format!("{} is not a JSON array of users", url))?;
        Ok(parse_users(entries))
    }

    /// Check credentials and persist the session.
    ///
    /// The cached list is authoritative when present, then the in-memory
    /// list, then the seed. With `remember` the session survives
    /// [`Settings`] session resets.
    pub fn login(
        &self,
        settings: &Settings,
        username: &str,
        pass: &str,
        remember: bool,
    ) -> Result<SessionUser> {
        let mut candidates = settings
            .cached_users()
            .filter(|users| !users.is_empty())
            .unwrap_or_else(|| self.users.clone());
        if candidates.is_empty() {
            candidates = default_users();
        }

        let found = candidates
            .iter()
            .find(|u| u.username == username && u.pass == pass)
            .ok_or(AuthError::InvalidCredentials)?;

        let session = SessionUser {
            username: found.username.clone(),
            role: found.role,
        };
        settings.save_session_user(&session, remember)?;
        tracing::info!(user = %session.username, role = %session.role, remember, "logged in");
        Ok(session)
    }

    /// Add a user to the local list and the cache.
    pub fn create_user(
        &mut self,
        settings: &Settings,
        username: &str,
        pass: &str,
        role: Role,
    ) -> Result<()> {
        let username = username.trim();
        if username.is_empty() || pass.is_empty() {
            return Err(AuthError::Incomplete.into());
        }
        if self.users.iter().any(|u| u.username == username) {
            return Err(AuthError::UserExists(username.to_string()).into());
        }

        self.users.push(UserRecord {
            username: username.to_string(),
            pass: pass.to_string(),
            role,
        });
        settings.cache_users(&self.users)?;
        Ok(())
    }

    /// Write the list as pretty-printed JSON, ready to upload.
    pub fn export_users(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(&self.users)?;
        std::fs::write(path, body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Forget the current session.
pub fn logout(settings: &Settings) -> Result<()> {
    settings.clear_session()
}

/// The session if it belongs to an administrator.
pub fn require_admin(session: Option<&SessionUser>) -> Result<&SessionUser, AuthError> {
    match session {
        None => Err(AuthError::NotLoggedIn),
        Some(user) if user.role == Role::Administrador => Ok(user),
        Some(_) => Err(AuthError::Forbidden),
    }
}

fn cached_or_default(settings: &Settings) -> Vec<UserRecord> {
    settings.cached_users().unwrap_or_else(default_users)
}
