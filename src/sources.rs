//! `stk source`: show or change the dataset source.

use anyhow::Result;

use crate::config::Config;
use crate::report::{print_outcome, BASELINE_WAIT};
use crate::resolve::{is_remote, resolve_with_api};
use crate::state::Settings;
use crate::store::DatasetStore;

pub fn show_source(config: &Config) -> Result<()> {
    let settings = Settings::open(&config.state.dir)?;
    let custom = settings.custom_source_url();
    let (effective, origin) = match &custom {
        Some(url) => (url.clone(), "custom"),
        None => (config.source.default_url.clone(), "default"),
    };
    let resolved = resolve_with_api(&effective, &config.poll.api_base);

    let kind = if is_remote(&resolved.fetch_url) {
        "remote"
    } else {
        "local"
    };
    let polling = match &config.poll.window {
        _ if !resolved.is_pollable() => "disabled (no version endpoint)".to_string(),
        Some(w) => format!(
            "every {}s, {:02}:00-{:02}:00{}",
            config.poll.interval_secs,
            w.start_hour,
            w.end_hour,
            if w.days.is_empty() {
                String::new()
            } else {
                format!(
                    " on {}",
                    w.days
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                )
            }
        ),
        None => format!("every {}s", config.poll.interval_secs),
    };

    println!("{:<16} {:<10} VALUE", "FIELD", "STATUS");
    println!("{:<16} {:<10} {}", "source", origin, effective);
    println!("{:<16} {:<10} {}", "fetch_url", kind, resolved.fetch_url);
    println!(
        "{:<16} {:<10} {}",
        "poll_url",
        if resolved.is_pollable() { "OK" } else { "NONE" },
        resolved.poll_url.as_deref().unwrap_or("-")
    );
    println!("{:<16} {:<10} {}", "polling", "", polling);

    match settings.last_version() {
        Some(last) if last.fetch_url == resolved.fetch_url => {
            println!("{:<16} {:<10} {}", "last_version", "", last.token);
        }
        Some(_) => {
            println!("{:<16} {:<10} recorded for another source", "last_version", "STALE");
        }
        None => println!("{:<16} {:<10} -", "last_version", "NONE"),
    }

    Ok(())
}

/// Persist a custom source (or clear it) and load from it.
pub async fn set_source(config: &Config, url: Option<&str>) -> Result<()> {
    let store = DatasetStore::open(config)?;
    let outcome = store.set_source(url).await;
    store.wait_for_baseline(BASELINE_WAIT).await;

    match url {
        Some(u) => println!("source set to {}", u.trim()),
        None => println!("source reset to default ({})", config.source.default_url),
    }
    print_outcome(&outcome?);
    Ok(())
}
