//! `stk login`, `stk logout`, `stk whoami`, and `stk users`.

use std::path::Path;

use anyhow::Result;

use crate::auth::{require_admin, Role, UserDirectory};
use crate::config::Config;
use crate::state::Settings;
use crate::store::DatasetStore;

fn directory(config: &Config) -> Result<UserDirectory> {
    UserDirectory::new(&config.users, config.fetch.timeout())
}

fn warn_fallback(dir: &UserDirectory) {
    if let Some(err) = dir.auth_error() {
        eprintln!("warning: user directory unavailable ({}); using cached users", err);
    }
}

pub async fn run_login(config: &Config, username: &str, pass: &str, remember: bool) -> Result<()> {
    let settings = Settings::open(&config.state.dir)?;
    let mut dir = directory(config)?;
    dir.refresh(&settings).await;
    warn_fallback(&dir);

    let session = dir.login(&settings, username, pass, remember)?;
    println!(
        "logged in as {} ({}){}",
        session.username,
        session.role,
        if remember { ", remembered" } else { "" }
    );
    Ok(())
}

pub async fn run_logout(config: &Config) -> Result<()> {
    let store = DatasetStore::open(config)?;
    store.logout().await?;
    println!("logged out");
    Ok(())
}

pub fn run_whoami(config: &Config) -> Result<()> {
    let settings = Settings::open(&config.state.dir)?;
    match settings.session_user() {
        Some(user) => println!("{} ({})", user.username, user.role),
        None => println!("not logged in"),
    }
    Ok(())
}

/// Open settings and check that the session belongs to an administrator.
fn admin_settings(config: &Config) -> Result<Settings> {
    let settings = Settings::open(&config.state.dir)?;
    require_admin(settings.session_user().as_ref())?;
    Ok(settings)
}

pub async fn run_users_list(config: &Config) -> Result<()> {
    let settings = admin_settings(config)?;
    let mut dir = directory(config)?;
    dir.load_cached(&settings).await;
    warn_fallback(&dir);

    println!("{:<20} ROLE", "USERNAME");
    for user in dir.users() {
        println!("{:<20} {}", user.username, user.role);
    }
    Ok(())
}

/// Re-fetch the remote directory, replacing the cached list.
pub async fn run_users_refresh(config: &Config) -> Result<()> {
    let settings = admin_settings(config)?;
    let mut dir = directory(config)?;
    dir.refresh(&settings).await;
    warn_fallback(&dir);
    println!("{} users loaded", dir.users().len());
    Ok(())
}

pub async fn run_users_add(config: &Config, username: &str, pass: &str, role: Role) -> Result<()> {
    let settings = admin_settings(config)?;
    let mut dir = directory(config)?;
    dir.load_cached(&settings).await;

    dir.create_user(&settings, username, pass, role)?;
    println!("user {} added to the local list; run `stk users export` to publish it", username.trim());
    Ok(())
}

pub async fn run_users_export(config: &Config, path: &Path) -> Result<()> {
    let settings = admin_settings(config)?;
    let mut dir = directory(config)?;
    dir.load_cached(&settings).await;

    dir.export_users(path)?;
    println!("exported {} users to {}", dir.users().len(), path.display());
    Ok(())
}
