use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use shopwh_adapters::{OrderStrategy, ProductStrategy};
use shopwh_client::SourceApi;
use shopwh_core::{AggregateView, SyncReport, WindowResolution};
use shopwh_storage::{MaterializedViews, Warehouse};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::engine::{EngineConfig, RunFatalError, SyncEngine};
use crate::refresh::AggregateRefresher;
use crate::report::{write_reports, RunSummary};
use crate::watermark::WatermarkResolver;

/// Which pipeline stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStages {
    pub sync: bool,
    pub refresh: bool,
}

impl RunStages {
    pub const ALL: RunStages = RunStages {
        sync: true,
        refresh: true,
    };
    pub const SYNC_ONLY: RunStages = RunStages {
        sync: true,
        refresh: false,
    };
    pub const REFRESH_ONLY: RunStages = RunStages {
        sync: false,
        refresh: true,
    };
}

/// Sync, aggregate refresh, validation and reporting for one invocation.
pub struct SyncPipeline<W> {
    api: Arc<dyn SourceApi>,
    store: Arc<W>,
    watermark: WatermarkResolver,
    refresher: AggregateRefresher,
    engine_config: EngineConfig,
    reports_root: PathBuf,
}

impl<W> SyncPipeline<W>
where
    W: Warehouse + MaterializedViews + 'static,
{
    pub fn new(
        api: Arc<dyn SourceApi>,
        store: Arc<W>,
        epoch: NaiveDate,
        views: Vec<AggregateView>,
        engine_config: EngineConfig,
        reports_root: PathBuf,
    ) -> Self {
        Self {
            api,
            store,
            watermark: WatermarkResolver::new(epoch),
            refresher: AggregateRefresher::new(views),
            engine_config,
            reports_root,
        }
    }

    pub fn store(&self) -> &Arc<W> {
        &self.store
    }

    pub async fn run_once(&self, today: NaiveDate) -> Result<RunSummary> {
        self.run(RunStages::ALL, today).await
    }

    /// Executes `stages` and always writes the run report. A run-fatal condition is
    /// returned as an error after the report is on disk.
    pub async fn run(&self, stages: RunStages, today: NaiveDate) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::new(run_id, Utc::now());
        let span = info_span!("pipeline_run", run_id = %run_id);

        async {
            if stages.sync {
                self.sync_stage(run_id, today, &mut summary).await;
            }
            if stages.refresh && summary.fatal_errors.is_empty() {
                self.refresh_stage(&mut summary).await;
            }
            match self.store.table_counts().await {
                Ok(counts) => {
                    info!(?counts, "warehouse table counts");
                    summary.table_counts = counts;
                }
                Err(err) => error!(error = %err, "table count validation failed"),
            }
        }
        .instrument(span)
        .await;

        summary.finalize(Utc::now());
        let run_dir = write_reports(&self.reports_root, &summary)
            .await
            .with_context(|| format!("writing reports for run {run_id}"))?;
        summary.reports_dir = Some(run_dir.display().to_string());
        info!(status = ?summary.status, reports = %run_dir.display(), "run finished");

        if summary.is_fatal() {
            bail!(
                "run {run_id} failed: {}; report at {}",
                summary.fatal_errors.join("; "),
                run_dir.display()
            );
        }
        Ok(summary)
    }

    async fn sync_stage(&self, run_id: Uuid, today: NaiveDate, summary: &mut RunSummary) {
        let resolution = match self.watermark.resolve(self.store.as_ref(), today).await {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(error = %err, "watermark resolution failed");
                summary.fatal_errors.push(format!("watermark: {err}"));
                return;
            }
        };
        summary.order_window = Some(resolution);

        let store: Arc<dyn Warehouse> = self.store.clone();
        let orders = SyncEngine::new(
            OrderStrategy,
            self.api.clone(),
            store.clone(),
            self.engine_config,
        )
        .with_run_id(run_id);
        let products = SyncEngine::new(ProductStrategy, self.api.clone(), store, self.engine_config)
            .with_run_id(run_id);

        let orders_run = async {
            match resolution {
                WindowResolution::Sync(window) => orders.sync(Some(window)).await,
                WindowResolution::UpToDate { .. } => orders.replay_only().await,
            }
        };
        let (orders_result, products_result) = tokio::join!(orders_run, products.sync(None));

        summary.orders = Some(settle(orders_result, &mut summary.fatal_errors));
        summary.products = Some(settle(products_result, &mut summary.fatal_errors));
    }

    async fn refresh_stage(&self, summary: &mut RunSummary) {
        match self.refresher.refresh_all(self.store.as_ref()).await {
            Ok(refresh) => {
                info!(
                    refreshed = refresh.refreshed(),
                    views = self.refresher.views().len(),
                    "aggregate views refreshed"
                );
                summary.refresh = Some(refresh);
            }
            Err(err) => {
                error!(error = %err, "aggregate refresh failed");
                summary.fatal_errors.push(err.to_string());
            }
        }
    }
}

fn settle(result: Result<SyncReport, RunFatalError>, fatal_errors: &mut Vec<String>) -> SyncReport {
    match result {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "entity sync aborted");
            fatal_errors.push(err.to_string());
            *err.partial
        }
    }
}
