//! # Stock Harness
//!
//! Inventory dataset ingestion with change polling and stock views.
//!
//! Stock Harness loads a CSV export of store/SKU/stock/sales records from a
//! local file or a remote URL, normalizes the loosely named columns into a
//! fixed schema, drops excluded formats, and serves inventory, negative
//! stock, overstock, and sales-ranking views. Remote sources hosted on
//! GitHub are polled for new versions without re-downloading the data.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐   ┌───────────┐
//! │ Resolver │──▶│ Fetch chain  │──▶│ Decoder  │──▶│ Normalizer│
//! │ blob→raw │   │ direct+relay │   │ CSV sniff│   │ aliases   │
//! └──────────┘   └──────────────┘   └──────────┘   └─────┬─────┘
//!                                                        ▼
//!                ┌──────────────┐                  ┌───────────┐
//!                │ ChangePoller │◀── start/stop ───│  Dataset  │──▶ views
//!                │ version sha  │                  │   store   │
//!                └──────────────┘                  └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! stk load --url https://github.com/acme/datos/blob/main/data/SPSA.csv
//! stk report negative --format TIENDA
//! stk report ranking --limit 10
//! stk watch --auto-refresh
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed library errors |
//! | [`decode`] | CSV decoding and delimiter sniffing |
//! | [`normalize`] | Header aliases and type coercion |
//! | [`resolve`] | GitHub URL rewriting and poll URLs |
//! | [`fetch`] | Direct and relay content fetchers |
//! | [`poller`] | Version-token change detection |
//! | [`store`] | Load orchestration and the published dataset |
//! | [`state`] | Persisted settings and session |
//! | [`auth`] | User directory and login |
//! | [`views`] | Inventory, stock, and sales views |
//! | [`report`] | `stk load` / `stk report` output |
//! | [`sources`] | `stk source` |
//! | [`watch`] | `stk check` / `stk watch` |
//! | [`auth_cmd`] | `stk login` / `stk users` |

pub mod auth;
pub mod auth_cmd;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod models;
pub mod normalize;
pub mod poller;
pub mod report;
pub mod resolve;
pub mod sources;
pub mod state;
pub mod store;
pub mod views;
pub mod watch;
