//! Row normalization: raw decoder records → canonical [`ProductRow`]s.
//!
//! Header policy lives in a single static table ([`FIELD_ALIASES`]) mapping
//! each canonical field to an ordered list of acceptable source headers.
//! [`lookup`] is the only place the table is consulted. The first alias
//! present with a non-null value wins.
//!
//! Normalization is total: missing or malformed cells degrade to `""` or
//! `0`, never to an error.

use crate::models::{ProductRow, RawRecord, RawValue};

/// Canonical fields of a [`ProductRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Chain,
    Sku,
    Description,
    Brand,
    StoreCode,
    StoreDescription,
    StoreName,
    Format,
    SalesLast30Days,
    Stock,
}

/// Canonical field → ordered header aliases (already upper case).
pub const FIELD_ALIASES: &[(Field, &[&str])] = &[
    (Field::Chain, &["CADENA", "CHAIN"]),
    (Field::Sku, &["COD", "SKU", "ITEM", "CODIGO"]),
    (
        Field::Description,
        &["DESCRIPCION", "DESC", "NOMBRE", "PRODUCTO", "DESCRIPTION"],
    ),
    (Field::Brand, &["MARCA", "BRAND"]),
    (
        Field::StoreCode,
        &["COD LOCAL", "ID_LOCAL", "COD_TIENDA", "STORE_ID"],
    ),
    (
        Field::StoreDescription,
        &["DESCRIPCION LOCAL", "NOM_LOCAL", "NOMBRE_TIENDA", "STORE_NAME"],
    ),
    (
        Field::StoreName,
        &["DESCRIPCION LOCAL2", "TIENDA", "SUCURSAL", "LOCAL", "STORE"],
    ),
    (Field::Format, &["FORMATO", "CHANNEL", "CANAL"]),
    (
        Field::SalesLast30Days,
        &["VTA", "VENTA", "SALES", "VTA 30D", "VTA_30D"],
    ),
    (Field::Stock, &["STOCK", "INVENTARIO", "OH", "ON_HAND"]),
];

/// Ordered aliases for a canonical field.
pub fn aliases(field: Field) -> &'static [&'static str] {
    FIELD_ALIASES
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, a)| *a)
        .unwrap_or(&[])
}

/// First non-null value among the field's aliases.
pub fn lookup(record: &RawRecord, field: Field) -> Option<&RawValue> {
    aliases(field)
        .iter()
        .filter_map(|alias| record.get(*alias))
        .find(|value| !value.is_null())
}

/// Normalize a batch of raw records.
pub fn normalize(records: &[RawRecord]) -> Vec<ProductRow> {
    let rows: Vec<ProductRow> = records.iter().map(normalize_record).collect();

    if let Some(first) = rows.first() {
        if first.stock == 0.0 && first.sales_last_30_days == 0.0 && first.description.is_empty() {
            tracing::warn!(
                "first row has no stock, sales, or description; check that column headers match the known aliases"
            );
        }
    }

    rows
}

/// Normalize a single raw record. Never fails.
pub fn normalize_record(record: &RawRecord) -> ProductRow {
    let text = |field| lookup(record, field).map(value_to_string).unwrap_or_default();
    let number = |field| lookup(record, field).map(value_to_number).unwrap_or(0.0);

    ProductRow {
        chain: text(Field::Chain),
        sku: text(Field::Sku),
        description: text(Field::Description),
        brand: text(Field::Brand),
        store_code: text(Field::StoreCode),
        store_description: text(Field::StoreDescription),
        store_name: text(Field::StoreName),
        format: text(Field::Format),
        sales_last_30_days: number(Field::SalesLast30Days),
        stock: number(Field::Stock),
    }
}

fn value_to_string(value: &RawValue) -> String {
    match value {
        RawValue::Null => String::new(),
        RawValue::Text(s) => s.clone(),
        RawValue::Number(n) => format_number(*n),
    }
}

fn value_to_number(value: &RawValue) -> f64 {
    let n = match value {
        RawValue::Null => 0.0,
        RawValue::Number(n) => *n,
        RawValue::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// Render a number the way a code column expects: no `.0` on integers.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
