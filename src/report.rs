//! `stk load` and `stk report`: load a dataset and print it.
//!
//! Each invocation loads the selected source (an explicit `--file` or
//! `--url`, else the effective source) and prints a plain-text table.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::models::{LoadOutcome, LoadedSource, ProductRow, SyncState};
use crate::normalize::format_number;
use crate::store::{DatasetSnapshot, DatasetStore};
use crate::views::{
    self, InventoryFilter, InventorySort, SalesRanking, SegmentFilter,
};

/// How long a one-shot command waits for the baseline version token.
pub const BASELINE_WAIT: Duration = Duration::from_secs(5);

/// Which dataset a command should load.
#[derive(Debug, Clone, Default)]
pub struct SourceSelection {
    pub url: Option<String>,
    pub file: Option<PathBuf>,
}

/// Load the selected source into `store`.
pub async fn load_selected(
    store: &DatasetStore,
    selection: &SourceSelection,
    fresh: bool,
) -> Result<LoadOutcome> {
    let outcome = match (&selection.file, &selection.url) {
        (Some(path), _) => store
            .load_from_file(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        (None, Some(url)) => store
            .load_from_url(url, fresh)
            .await
            .with_context(|| format!("Failed to load {}", url))?,
        (None, None) => {
            let url = store.effective_source();
            store
                .load_from_url(&url, fresh)
                .await
                .with_context(|| format!("Failed to load {}", url))?
        }
    };
    Ok(outcome)
}

/// Run `stk load`: load and print a summary.
pub async fn run_load(config: &Config, selection: &SourceSelection, fresh: bool) -> Result<()> {
    let store = DatasetStore::open(config)?;
    let outcome = load_selected(&store, selection, fresh).await?;
    store.wait_for_baseline(BASELINE_WAIT).await;

    print_outcome(&outcome);
    print_sync(&store.sync_state().await);
    Ok(())
}

/// The views `stk report` can print.
#[derive(Debug, Clone)]
pub enum ReportKind {
    Inventory {
        filter: InventoryFilter,
        sort: InventorySort,
    },
    Negative {
        filter: SegmentFilter,
    },
    Overstock {
        filter: SegmentFilter,
        threshold: Option<f64>,
    },
    Ranking {
        filter: SegmentFilter,
        limit: Option<usize>,
    },
    Filters,
}

/// Run `stk report <view>`.
pub async fn run_report(
    config: &Config,
    selection: &SourceSelection,
    kind: &ReportKind,
) -> Result<()> {
    let store = DatasetStore::open(config)?;
    load_selected(&store, selection, false).await?;
    let snapshot = store.snapshot().await;

    match kind {
        ReportKind::Inventory { filter, sort } => {
            print_rows(&views::inventory_table(&snapshot.rows, filter, *sort));
        }
        ReportKind::Negative { filter } => {
            print_rows(&views::negative_stock(&snapshot.rows, filter));
        }
        ReportKind::Overstock { filter, threshold } => {
            let threshold = threshold.unwrap_or(config.views.overstock_threshold);
            print_rows(&views::overstock(&snapshot.rows, filter, threshold));
        }
        ReportKind::Ranking { filter, limit } => {
            let limit = limit.unwrap_or(config.views.ranking_limit);
            print_ranking(&views::sales_ranking(&snapshot.rows, filter, limit));
        }
        ReportKind::Filters => print_filters(&snapshot),
    }
    Ok(())
}

pub fn print_outcome(outcome: &LoadOutcome) {
    let report = match outcome {
        LoadOutcome::Applied(report) => report,
        LoadOutcome::Superseded => {
            println!("load superseded by a newer request");
            return;
        }
    };

    match &report.source {
        LoadedSource::File(path) => println!("load {}", path),
        LoadedSource::Url { fetch_url, .. } => println!("load {}", fetch_url),
    }
    println!("  rows:      {}", report.rows);
    println!("  excluded:  {} (formats CD/CP)", report.excluded);
    println!("  sha256:    {}", report.content_hash);
    if let LoadedSource::Url {
        poll_url: Some(poll_url),
        ..
    } = &report.source
    {
        println!("  polling:   {}", poll_url);
    }
}

pub fn print_sync(sync: &SyncState) {
    if let Some(token) = &sync.version_token {
        println!("  version:   {}", token);
    }
    if sync.update_available {
        println!("  update available upstream; run `stk load --fresh`");
    }
    if let Some(at) = sync.last_checked_at {
        println!("  checked:   {}", format_age(at, Utc::now()));
    }
}

fn print_rows(rows: &[ProductRow]) {
    if rows.is_empty() {
        println!("No rows.");
        return;
    }

    println!(
        "{:<12} {:<10} {:<32} {:<20} {:<8} {:>8} {:>8}  {}",
        "BRAND", "SKU", "DESCRIPTION", "STORE", "FORMAT", "VTA", "STOCK", "LEVEL"
    );
    println!("{}", "-".repeat(112));
    for r in rows {
        println!(
            "{:<12} {:<10} {:<32} {:<20} {:<8} {:>8} {:>8}  {}",
            clip(&r.brand, 12),
            clip(&r.sku, 10),
            clip(&r.description, 32),
            clip(&r.store_name, 20),
            clip(&r.format, 8),
            format_number(r.sales_last_30_days),
            format_number(r.stock),
            views::stock_level(r.stock).label()
        );
    }
    println!();
    println!("{} row{}", rows.len(), if rows.len() == 1 { "" } else { "s" });
}

fn print_ranking(ranking: &SalesRanking) {
    let sections = [
        ("Top stores by 30-day sales", &ranking.top_stores),
        ("Top products by 30-day sales", &ranking.top_products),
    ];
    for (title, entries) in sections {
        println!("{}", title);
        println!("  {:<4} {:<40} {:>10}", "#", "NAME", "VTA");
        println!("  {}", "-".repeat(56));
        for (i, e) in entries.iter().enumerate() {
            println!(
                "  {:<4} {:<40} {:>10}  {}",
                i + 1,
                clip(&e.name, 40),
                format_number(e.value),
                views::sales_level(e.value).label()
            );
        }
        println!();
    }
}

fn print_filters(snapshot: &DatasetSnapshot) {
    let groups = [
        ("Stores", &snapshot.indexes.unique_stores),
        ("Brands", &snapshot.indexes.unique_brands),
        ("Formats", &snapshot.indexes.unique_formats),
    ];
    for (title, values) in groups {
        println!("{} ({})", title, values.len());
        for v in values.iter() {
            println!("  {}", v);
        }
    }
}

/// Truncate to `width` characters, marking the cut with `…`.
fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Age units, largest first.
const AGE_UNITS: [(i64, &str); 3] = [(86_400, "day"), (3_600, "hour"), (60, "min")];

/// How long before `now` something happened ("3 hours ago"). Anything in
/// the future or older than 30 days is shown as an absolute UTC time.
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds();
    if !(0..86_400 * 30).contains(&secs) {
        return at.format("%Y-%m-%d %H:%M UTC").to_string();
    }
    AGE_UNITS
        .iter()
        .find(|(unit, _)| secs >= *unit)
        .map(|(unit, name)| {
            let n = secs / unit;
            format!("{} {}{} ago", n, name, if n == 1 { "" } else { "s" })
        })
        .unwrap_or_else(|| "just now".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_clip() {
        assert_eq!(clip("POLO", 8), "POLO");
        assert_eq!(clip("CAMISA MANGA LARGA", 8), "CAMISA …");
        assert_eq!(clip("ÑANDÚ ÑANDÚ", 5), "ÑAND…");
    }

    #[test]
    fn test_format_age() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let ago = |secs: i64| now - chrono::Duration::seconds(secs);
        assert_eq!(format_age(ago(0), now), "just now");
        assert_eq!(format_age(ago(59), now), "just now");
        assert_eq!(format_age(ago(60), now), "1 min ago");
        assert_eq!(format_age(ago(120), now), "2 mins ago");
        assert_eq!(format_age(ago(3600), now), "1 hour ago");
        assert_eq!(format_age(ago(86_400 * 3), now), "3 days ago");
        assert_eq!(format_age(ago(86_400 * 45), now), "2024-03-26 12:00 UTC");
        assert_eq!(format_age(ago(-30), now), "2024-05-10 12:00 UTC");
    }
}
