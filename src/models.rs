//! Core data models used throughout stock-harness.
//!
//! These types represent the records that flow through the ingestion
//! pipeline: loosely-typed decoder output, canonical inventory rows, and the
//! sync/load state reported back to callers.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single decoded cell before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Number(f64),
    Text(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

/// Raw record produced by the CSV decoder, keyed by trimmed, upper-cased header.
pub type RawRecord = HashMap<String, RawValue>;

/// Canonical inventory record: one SKU at one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProductRow {
    pub chain: String,
    pub sku: String,
    pub description: String,
    pub brand: String,
    pub store_code: String,
    pub store_description: String,
    /// Primary store label used for grouping and filtering.
    pub store_name: String,
    pub format: String,
    pub sales_last_30_days: f64,
    /// Signed; negative values mean backorder or oversell.
    pub stock: f64,
}

/// Sorted distinct non-empty values used by filter pickers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetIndexes {
    pub unique_stores: Vec<String>,
    pub unique_brands: Vec<String>,
    pub unique_formats: Vec<String>,
}

impl DatasetIndexes {
    pub fn build(rows: &[ProductRow]) -> Self {
        fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
            values
                .filter(|v| !v.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(str::to_string)
                .collect()
        }

        Self {
            unique_stores: distinct(rows.iter().map(|r| r.store_name.as_str())),
            unique_brands: distinct(rows.iter().map(|r| r.brand.as_str())),
            unique_formats: distinct(rows.iter().map(|r| r.format.as_str())),
        }
    }
}

/// Version tracking state for the active remote source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    pub version_token: Option<String>,
    pub update_available: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Where a published dataset came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LoadedSource {
    File(String),
    Url {
        fetch_url: String,
        poll_url: Option<String>,
    },
}

/// Summary of a load whose result was published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub source: LoadedSource,
    /// Rows published after the global filter.
    pub rows: usize,
    /// Rows dropped by the global filter.
    pub excluded: usize,
    /// SHA-256 of the raw text, hex encoded.
    pub content_hash: String,
}

/// Result of a load request that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Applied(LoadReport),
    /// A newer load was issued while this one was in flight; its result was dropped.
    Superseded,
}
