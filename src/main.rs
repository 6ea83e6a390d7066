//! # Stock Harness CLI (`stk`)
//!
//! The `stk` binary loads inventory CSV exports, prints the stock and sales
//! views, watches remote sources for new versions, and manages the local
//! user directory.
//!
//! ## Usage
//!
//! ```bash
//! stk --config ./config/stk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `stk load` | Load the effective source (or `--url` / `--file`) and print a summary |
//! | `stk source show` | Show the effective source, fetch URL, and poll URL |
//! | `stk source set <url>` | Persist a custom source and load it |
//! | `stk source clear` | Revert to the configured default source |
//! | `stk check` | Compare the recorded version with the live one |
//! | `stk watch` | Load, then poll for upstream changes until Ctrl-C |
//! | `stk report <view>` | Print `inventory`, `negative`, `overstock`, `ranking`, or `filters` |
//! | `stk login <user> <pass>` | Start a session |
//! | `stk logout` / `stk whoami` | End or show the session |
//! | `stk users list\|add\|export\|refresh` | Manage the user directory (administrators) |
//!
//! ## Examples
//!
//! ```bash
//! # Load a GitHub-hosted export, bypassing caches
//! stk load --url https://github.com/acme/datos/blob/main/data/SPSA.csv --fresh
//!
//! # Negative stock for one brand
//! stk report negative --brand ADMID
//!
//! # Reload automatically whenever upstream changes
//! stk watch --interval 120 --auto-refresh
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use stock_harness::auth::Role;
use stock_harness::report::{ReportKind, SourceSelection};
use stock_harness::views::{InventoryFilter, InventorySort, SegmentFilter, SortDirection, SortKey};
use stock_harness::{auth_cmd, config, report, sources, watch};

/// Stock Harness CLI: inventory ingestion, change polling, and stock views.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/stk.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "stk",
    about = "Stock Harness: inventory ingestion, change polling, and stock views",
    version,
    long_about = "Stock Harness loads inventory CSV exports from local files or remote URLs \
    (GitHub blob and raw URLs included), normalizes their columns, drops excluded formats, \
    and prints inventory, negative-stock, overstock, and sales-ranking views. Remote GitHub \
    sources are polled for new versions without re-downloading the data."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/stk.toml`. When the file does not exist the
    /// built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/stk.toml")]
    config: PathBuf,

    /// Log filter (`error`, `warn`, `info`, `debug`, `trace`, or an
    /// `EnvFilter` directive). Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Dataset selection shared by loading commands.
#[derive(clap::Args, Clone, Default)]
struct SourceArgs {
    /// Load this URL instead of the effective source.
    #[arg(long, conflicts_with = "file")]
    url: Option<String>,

    /// Load this local CSV file instead of the effective source.
    #[arg(long)]
    file: Option<PathBuf>,
}

impl From<SourceArgs> for SourceSelection {
    fn from(args: SourceArgs) -> Self {
        Self {
            url: args.url,
            file: args.file,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Load a dataset and print a summary.
    ///
    /// Resolves the source, fetches it (direct first, then relays), decodes
    /// and normalizes it, and drops formats CD and CP. For GitHub sources
    /// the current version token is recorded for `stk check`.
    Load {
        #[command(flatten)]
        source: SourceArgs,

        /// Bypass caches (cache-busting parameter and `no-cache`).
        #[arg(long)]
        fresh: bool,
    },

    /// Show or change the dataset source.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Check whether the source changed since it was last loaded.
    ///
    /// Queries the version endpoint only; the data is not downloaded.
    Check,

    /// Load, then poll for upstream changes until Ctrl-C.
    Watch {
        #[command(flatten)]
        source: SourceArgs,

        /// Override `[poll].interval_secs`.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,

        /// Reload automatically when a change is detected.
        #[arg(long)]
        auto_refresh: bool,
    },

    /// Print a view of the dataset.
    Report {
        #[command(subcommand)]
        view: ReportView,
    },

    /// Log in against the user directory.
    Login {
        username: String,
        password: String,

        /// Keep the session in durable settings.
        #[arg(long)]
        remember: bool,
    },

    /// End the current session.
    Logout,

    /// Show the current session.
    Whoami,

    /// Manage the user directory (administrators only).
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Show the effective source and its polling status.
    Show,
    /// Persist a custom source URL and load it.
    Set { url: String },
    /// Forget the custom source and load the configured default.
    Clear,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Stock,
    Sales,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Asc,
    Desc,
}

/// Format and brand filters shared by the stock and sales views.
#[derive(clap::Args, Clone)]
struct SegmentArgs {
    #[arg(long)]
    format: Option<String>,
    #[arg(long)]
    brand: Option<String>,
}

impl From<SegmentArgs> for SegmentFilter {
    fn from(args: SegmentArgs) -> Self {
        Self {
            format: args.format,
            brand: args.brand,
        }
    }
}

#[derive(Subcommand)]
enum ReportView {
    /// Inventory grouped by brand.
    Inventory {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        store: Option<String>,
        #[arg(long)]
        brand: Option<String>,
        /// Order within each brand.
        #[arg(long, value_enum)]
        sort: Option<SortArg>,
        /// Sort direction (default: desc).
        #[arg(long, value_enum, requires = "sort")]
        dir: Option<DirectionArg>,
    },
    /// Rows with negative stock, most negative first.
    Negative {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        filter: SegmentArgs,
    },
    /// Rows above the overstock threshold, largest first.
    Overstock {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        filter: SegmentArgs,
        /// Override `[views].overstock_threshold`.
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Top stores and products by 30-day sales.
    Ranking {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        filter: SegmentArgs,
        /// Override `[views].ranking_limit`.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        limit: Option<u64>,
    },
    /// Distinct stores, brands, and formats.
    Filters {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Subcommand)]
enum UsersAction {
    /// List users in the local directory.
    List,
    /// Add a user to the local list (export to publish it).
    Add {
        username: String,
        password: String,
        /// ADMINISTRADOR or VISUALIZADOR.
        #[arg(long)]
        role: Role,
    },
    /// Write the local list as JSON, ready to upload.
    Export { path: PathBuf },
    /// Re-fetch the remote directory into the local cache.
    Refresh,
}

fn setup_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn report_kind(view: ReportView) -> (SourceSelection, ReportKind) {
    match view {
        ReportView::Inventory {
            source,
            store,
            brand,
            sort,
            dir,
        } => {
            let sort = match sort {
                None => InventorySort::default(),
                Some(key) => InventorySort {
                    key: match key {
                        SortArg::Stock => SortKey::Stock,
                        SortArg::Sales => SortKey::Sales,
                    },
                    direction: match dir {
                        Some(DirectionArg::Asc) => SortDirection::Asc,
                        Some(DirectionArg::Desc) | None => SortDirection::Desc,
                    },
                },
            };
            (
                source.into(),
                ReportKind::Inventory {
                    filter: InventoryFilter { store, brand },
                    sort,
                },
            )
        }
        ReportView::Negative { source, filter } => (
            source.into(),
            ReportKind::Negative {
                filter: filter.into(),
            },
        ),
        ReportView::Overstock {
            source,
            filter,
            threshold,
        } => (
            source.into(),
            ReportKind::Overstock {
                filter: filter.into(),
                threshold,
            },
        ),
        ReportView::Ranking {
            source,
            filter,
            limit,
        } => (
            source.into(),
            ReportKind::Ranking {
                filter: filter.into(),
                limit: limit.map(|l| l as usize),
            },
        ),
        ReportView::Filters { source } => (source.into(), ReportKind::Filters),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref());

    // A missing config file means built-in defaults; a broken one is an error.
    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::debug!(path = %cli.config.display(), "no config file; using defaults");
        config::Config::minimal()
    };

    match cli.command {
        Commands::Load { source, fresh } => {
            report::run_load(&cfg, &source.into(), fresh).await?;
        }
        Commands::Source { action } => match action {
            SourceAction::Show => sources::show_source(&cfg)?,
            SourceAction::Set { url } => sources::set_source(&cfg, Some(&url)).await?,
            SourceAction::Clear => sources::set_source(&cfg, None).await?,
        },
        Commands::Check => {
            watch::run_check(&cfg).await?;
        }
        Commands::Watch {
            source,
            interval,
            auto_refresh,
        } => {
            watch::run_watch(&cfg, &source.into(), interval, auto_refresh).await?;
        }
        Commands::Report { view } => {
            let (selection, kind) = report_kind(view);
            report::run_report(&cfg, &selection, &kind).await?;
        }
        Commands::Login {
            username,
            password,
            remember,
        } => {
            auth_cmd::run_login(&cfg, &username, &password, remember).await?;
        }
        Commands::Logout => auth_cmd::run_logout(&cfg).await?,
        Commands::Whoami => auth_cmd::run_whoami(&cfg)?,
        Commands::Users { action } => match action {
            UsersAction::List => auth_cmd::run_users_list(&cfg).await?,
            UsersAction::Add {
                username,
                password,
                role,
            } => auth_cmd::run_users_add(&cfg, &username, &password, role).await?,
            UsersAction::Export { path } => auth_cmd::run_users_export(&cfg, &path).await?,
            UsersAction::Refresh => auth_cmd::run_users_refresh(&cfg).await?,
        },
    }

    Ok(())
}
