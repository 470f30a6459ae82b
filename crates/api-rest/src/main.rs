//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the REST API server on its own, against the store named by `CDR_DATA_FILE`.
//!
//! ## Intended use
//! Useful during development when only the HTTP surface is wanted. The workspace's `cdr-run`
//! binary serves the same router.

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, AppState};
use cdr_core::config::{
    data_file_from_env_value, gc_batch_size_from_env_value, local_zone_from_env_value,
};
use cdr_core::constants::{
    DATA_FILE_ENV, DEFAULT_PROGRESS_INTERVAL_SECS, DEFAULT_REST_ADDR, GC_BATCH_SIZE_ENV,
    LOCAL_TIMEZONE_ENV, REST_ADDR_ENV,
};
use cdr_core::{CdrService, CoreConfig};

/// Main entry point for the CDR REST API server
///
/// # Environment Variables
/// - `CDR_REST_ADDR`: Server address (default: "0.0.0.0:3000")
/// - `CDR_DATA_FILE`: SQLite database (`.db`, `.sqlite`, `.sqlite3`) or JSON snapshot (unset: in-memory only)
/// - `CDR_LOCAL_TIMEZONE`: Zone for timestamps without an offset (default: host zone)
/// - `CDR_GC_BATCH_SIZE`: Rows per garbage-collection batch (default: 500)
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - a configuration value is invalid or the data file cannot be loaded,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?)
                .add_directive("cdr_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var(REST_ADDR_ENV).unwrap_or_else(|_| DEFAULT_REST_ADDR.into());

    let cfg = Arc::new(CoreConfig::new(
        local_zone_from_env_value(std::env::var(LOCAL_TIMEZONE_ENV).ok())?,
        data_file_from_env_value(std::env::var(DATA_FILE_ENV).ok()),
        gc_batch_size_from_env_value(std::env::var(GC_BATCH_SIZE_ENV).ok())?,
        Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
    )?);

    match cfg.data_file() {
        Some(path) => tracing::info!("-- Using data file {}", path.display()),
        None => tracing::info!("-- No {DATA_FILE_ENV} set, store is in-memory only"),
    }

    let service = CdrService::open(cfg)?;
    let app = router(AppState::new(service));

    tracing::info!("-- Starting CDR REST API on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
