//! Sync pipeline orchestration: watermark, entity sync, aggregate refresh, reports.

use std::sync::Arc;

use anyhow::{Context, Result};
use shopwh_client::ApiClient;
use shopwh_storage::PgWarehouse;

pub mod config;
pub mod engine;
pub mod pipeline;
pub mod refresh;
pub mod report;
pub mod watermark;

#[cfg(test)]
mod testing;

pub use config::{load_views, CredentialConfig, SyncConfig};
pub use engine::{EngineConfig, FatalCause, RunFatalError, SyncEngine};
pub use pipeline::{RunStages, SyncPipeline};
pub use refresh::{AggregateRefresher, RefreshError, RefreshSummary, ViewRefresh};
pub use report::{recent_runs_markdown, write_reports, RunStatus, RunSummary};
pub use watermark::WatermarkResolver;

pub const CRATE_NAME: &str = "shopwh-sync";

/// Connects to the warehouse and upstream API described by `config`.
pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline<PgWarehouse>> {
    let store = PgWarehouse::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to warehouse database")?;
    let credentials = config.credential_provider()?;
    let api = ApiClient::new(config.api_client_config(), credentials)
        .context("building upstream api client")?;
    let views = load_views(&config.workspace_root)?;

    Ok(SyncPipeline::new(
        Arc::new(api),
        Arc::new(store),
        config.sync_epoch,
        views,
        config.engine_config(),
        config.reports_dir.clone(),
    ))
}
