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

/// Main entry point for the CDR application
///
/// Loads `.env`, resolves the core configuration once and serves the REST API
/// (with OpenAPI/Swagger UI) on `CDR_REST_ADDR`.
///
/// # Environment Variables
/// - `CDR_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `CDR_DATA_FILE`: SQLite database (`.db`, `.sqlite`, `.sqlite3`) or JSON snapshot (unset: in-memory only)
/// - `CDR_LOCAL_TIMEZONE`: Zone for timestamps without an offset (default: host zone)
/// - `CDR_GC_BATCH_SIZE`: Rows per garbage-collection batch (default: 500)
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If configuration, startup or serving fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("cdr=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var(REST_ADDR_ENV).unwrap_or_else(|_| DEFAULT_REST_ADDR.into());

    let cfg = Arc::new(CoreConfig::new(
        local_zone_from_env_value(std::env::var(LOCAL_TIMEZONE_ENV).ok())?,
        data_file_from_env_value(std::env::var(DATA_FILE_ENV).ok()),
        gc_batch_size_from_env_value(std::env::var(GC_BATCH_SIZE_ENV).ok())?,
        Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
    )?);

    tracing::info!(
        "++ Local zone {:?}, GC batch size {}",
        cfg.local_zone(),
        cfg.gc_batch_size()
    );

    let service = CdrService::open(cfg)?;
    let app = router(AppState::new(service));

    tracing::info!("++ Starting CDR REST on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
