//! Read-only views over the published dataset.
//!
//! Every function here is pure: it takes rows and returns a new, ordered
//! vector. Filters match exactly; an unset filter field matches everything.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::models::ProductRow;

/// Store and brand filter for the inventory table.
#[derive(Debug, Clone, Default)]
pub struct InventoryFilter {
    pub store: Option<String>,
    pub brand: Option<String>,
}

/// Format and brand filter for the stock and sales views.
#[derive(Debug, Clone, Default)]
pub struct SegmentFilter {
    pub format: Option<String>,
    pub brand: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Stock,
    Sales,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    Desc,
    /// Keep dataset order within each brand.
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InventorySort {
    pub key: SortKey,
    pub direction: SortDirection,
}

fn matches(value: &str, wanted: &Option<String>) -> bool {
    wanted.as_deref().map_or(true, |w| value == w)
}

impl InventoryFilter {
    fn accepts(&self, row: &ProductRow) -> bool {
        matches(&row.store_name, &self.store) && matches(&row.brand, &self.brand)
    }
}

impl SegmentFilter {
    fn accepts(&self, row: &ProductRow) -> bool {
        matches(&row.format, &self.format) && matches(&row.brand, &self.brand)
    }
}

/// Filtered rows grouped by brand (A–Z), then ordered by the sort key.
pub fn inventory_table(
    rows: &[ProductRow],
    filter: &InventoryFilter,
    sort: InventorySort,
) -> Vec<ProductRow> {
    let mut out: Vec<ProductRow> = rows.iter().filter(|r| filter.accepts(r)).cloned().collect();
    out.sort_by(|a, b| {
        compare_names(&a.brand, &b.brand).then_with(|| {
            let (x, y) = match sort.key {
                SortKey::Stock => (a.stock, b.stock),
                SortKey::Sales => (a.sales_last_30_days, b.sales_last_30_days),
            };
            match sort.direction {
                SortDirection::Asc => x.total_cmp(&y),
                SortDirection::Desc => y.total_cmp(&x),
                SortDirection::None => Ordering::Equal,
            }
        })
    });
    out
}

/// Dictionary order for display names: case and Latin accents are ignored
/// first (`adidas` next to `ADMID`, `Éxito` among the E's), with a
/// byte-wise tie-break so the order stays total.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    fold(a).cmp(fold(b)).then_with(|| a.cmp(b))
}

fn fold(s: &str) -> impl Iterator<Item = char> + '_ {
    s.chars().flat_map(char::to_lowercase).map(|c| match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    })
}

/// Rows with negative stock, most negative first.
pub fn negative_stock(rows: &[ProductRow], filter: &SegmentFilter) -> Vec<ProductRow> {
    let mut out: Vec<ProductRow> = rows
        .iter()
        .filter(|r| r.stock < 0.0 && filter.accepts(r))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.stock.total_cmp(&b.stock));
    out
}

/// Rows with stock strictly above `threshold`, largest first.
pub fn overstock(rows: &[ProductRow], filter: &SegmentFilter, threshold: f64) -> Vec<ProductRow> {
    let mut out: Vec<ProductRow> = rows
        .iter()
        .filter(|r| r.stock > threshold && filter.accepts(r))
        .cloned()
        .collect();
    out.sort_by(|a, b| b.stock.total_cmp(&a.stock));
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SalesRanking {
    pub top_stores: Vec<RankedEntry>,
    pub top_products: Vec<RankedEntry>,
}

/// Top `limit` stores and products by summed 30-day sales.
///
/// Rows with an empty store name or description are left out of the
/// respective ranking. Ties keep first-seen order.
pub fn sales_ranking(rows: &[ProductRow], filter: &SegmentFilter, limit: usize) -> SalesRanking {
    let filtered: Vec<&ProductRow> = rows.iter().filter(|r| filter.accepts(r)).collect();
    SalesRanking {
        top_stores: rank(filtered.iter().map(|r| (r.store_name.as_str(), r.sales_last_30_days)), limit),
        top_products: rank(filtered.iter().map(|r| (r.description.as_str(), r.sales_last_30_days)), limit),
    }
}

fn rank<'a>(values: impl Iterator<Item = (&'a str, f64)>, limit: usize) -> Vec<RankedEntry> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut entries: Vec<RankedEntry> = Vec::new();
    for (name, value) in values {
        if name.is_empty() {
            continue;
        }
        match positions.get(name) {
            Some(&i) => entries[i].value += value,
            None => {
                positions.insert(name, entries.len());
                entries.push(RankedEntry {
                    name: name.to_string(),
                    value,
                });
            }
        }
    }
    entries.sort_by(|a, b| b.value.total_cmp(&a.value));
    entries.truncate(limit);
    entries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        }
    }
}

/// ≤5 low, ≤12 medium, above that high.
pub fn stock_level(stock: f64) -> Level {
    if stock <= 5.0 {
        Level::Low
    } else if stock <= 12.0 {
        Level::Medium
    } else {
        Level::High
    }
}

/// ≤8 low, ≤25 medium, above that high.
pub fn sales_level(sales: f64) -> Level {
    if sales <= 8.0 {
        Level::Low
    } else if sales <= 25.0 {
        Level::Medium
    } else {
        Level::High
    }
}
