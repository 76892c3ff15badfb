//! Generic paginated sync engine.
//!
//! One engine drives every entity through `FETCH_PAGE -> PROCESS_RECORDS` until the
//! upstream page count is exhausted. Each record runs
//! `MAP -> UPSERT_PARENT -> FETCH_DETAIL -> UPSERT_CHILDREN`; a failure in any record
//! step is recorded and the loop moves on. Only listing failures and storage outages
//! stop the run.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use shopwh_adapters::{DetailError, EntitySyncStrategy, ListingPage};
use shopwh_client::{ApiError, SourceApi};
use shopwh_core::{EntityKind, FailureStage, RecordFailure, SyncReport, SyncWindow};
use shopwh_storage::{StorageError, Warehouse};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub detail_delay: Duration,
    pub page_delay: Duration,
    pub rate_limit_cooldown: Duration,
    pub max_rate_limit_cooldowns: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detail_delay: Duration::from_millis(500),
            page_delay: Duration::from_millis(1000),
            rate_limit_cooldown: Duration::from_secs(20),
            max_rate_limit_cooldowns: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum FatalCause {
    #[error("listing page {page} failed: {source}")]
    Listing {
        page: u32,
        #[source]
        source: ApiError,
    },
    #[error(transparent)]
    StorageUnavailable(StorageError),
}

/// Run-level failure. Everything committed before it stays committed; `partial`
/// carries the counters accumulated up to that point.
#[derive(Debug, Error)]
#[error("{entity} sync aborted: {cause}")]
pub struct RunFatalError {
    pub entity: EntityKind,
    pub cause: FatalCause,
    pub partial: Box<SyncReport>,
}

pub struct SyncEngine<S> {
    strategy: S,
    api: Arc<dyn SourceApi>,
    store: Arc<dyn Warehouse>,
    config: EngineConfig,
    run_id: Uuid,
}

impl<S: EntitySyncStrategy> SyncEngine<S> {
    pub fn new(
        strategy: S,
        api: Arc<dyn SourceApi>,
        store: Arc<dyn Warehouse>,
        config: EngineConfig,
    ) -> Self {
        Self {
            strategy,
            api,
            store,
            config,
            run_id: Uuid::new_v4(),
        }
    }

    /// Tags dead-letter entries written by this engine with the pipeline's run id.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Replays pending dead-letter records, then walks every listing page of `window`.
    pub async fn sync(&self, window: Option<SyncWindow>) -> Result<SyncReport, RunFatalError> {
        let entity = self.strategy.entity();
        let span = info_span!("entity_sync", entity = %entity, run_id = %self.run_id);
        async {
            let mut report = SyncReport::new(entity, window);
            let outcome = self.run(window.as_ref(), &mut report, true).await;
            self.finish(report, outcome).await
        }
        .instrument(span)
        .await
    }

    /// Dead-letter replay alone, for runs whose window is already covered.
    pub async fn replay_only(&self) -> Result<SyncReport, RunFatalError> {
        let entity = self.strategy.entity();
        let span = info_span!("entity_replay", entity = %entity, run_id = %self.run_id);
        async {
            let mut report = SyncReport::new(entity, None);
            let outcome = self.run(None, &mut report, false).await;
            self.finish(report, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        window: Option<&SyncWindow>,
        report: &mut SyncReport,
        walk_pages: bool,
    ) -> Result<(), FatalCause> {
        let mut pending = self.replay_pending(report).await?;
        if walk_pages {
            self.walk_pages(window, report, &mut pending).await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        report: SyncReport,
        outcome: Result<(), FatalCause>,
    ) -> Result<SyncReport, RunFatalError> {
        let storage_down = matches!(outcome, Err(FatalCause::StorageUnavailable(_)));
        if !storage_down {
            self.persist_failures(&report).await;
        }
        match outcome {
            Ok(()) => {
                info!(
                    pages = report.pages_processed,
                    records = report.records_upserted,
                    items = report.items_upserted,
                    replayed = report.records_replayed,
                    failures = report.record_failures.len(),
                    "entity sync finished"
                );
                Ok(report)
            }
            Err(cause) => Err(RunFatalError {
                entity: report.entity,
                cause,
                partial: Box::new(report),
            }),
        }
    }

    async fn walk_pages(
        &self,
        window: Option<&SyncWindow>,
        report: &mut SyncReport,
        pending: &mut HashSet<String>,
    ) -> Result<(), FatalCause> {
        let mut page = 1u32;
        loop {
            let listing = self.fetch_listing(window, page).await?;
            report.total_pages = listing.total_pages;

            for (index, raw) in listing.records.iter().enumerate() {
                self.process_record(raw, page, index, report, pending).await?;
            }
            report.pages_processed += 1;
            info!(
                page,
                total_pages = listing.total_pages,
                records = listing.records.len(),
                "page processed"
            );

            if page >= listing.total_pages {
                return Ok(());
            }
            tokio::time::sleep(self.config.page_delay).await;
            page += 1;
        }
    }

    async fn fetch_listing(
        &self,
        window: Option<&SyncWindow>,
        page: u32,
    ) -> Result<ListingPage, FatalCause> {
        self.with_cooldown(ApiError::is_rate_limited, || {
            self.strategy.list_page(self.api.as_ref(), window, page)
        })
        .await
        .map_err(|source| FatalCause::Listing { page, source })
    }

    async fn process_record(
        &self,
        raw: &JsonValue,
        page: u32,
        index: usize,
        report: &mut SyncReport,
        pending: &mut HashSet<String>,
    ) -> Result<(), FatalCause> {
        let record = match self.strategy.map_record(raw) {
            Ok(record) => record,
            Err(err) => {
                self.record_failure(
                    report,
                    format!("page {page} #{index}"),
                    FailureStage::Map,
                    err.to_string(),
                );
                return Ok(());
            }
        };
        let external_id = self.strategy.external_id(&record).to_string();

        if let Err(err) = self.strategy.upsert(self.store.as_ref(), &record).await {
            return self.storage_failure(report, external_id, FailureStage::UpsertParent, err);
        }
        report.records_upserted += 1;

        if self.write_detail(&record, &external_id, report).await? {
            self.resolve_if_pending(&external_id, pending, report).await?;
        }
        Ok(())
    }

    /// Best-effort detail step. Returns whether the record is now fully synced.
    async fn write_detail(
        &self,
        record: &S::Record,
        external_id: &str,
        report: &mut SyncReport,
    ) -> Result<bool, FatalCause> {
        let fetched = self
            .with_cooldown_opt(|| self.strategy.fetch_detail(self.api.as_ref(), record))
            .await;
        let Some(fetched) = fetched else {
            return Ok(true);
        };
        let result = match fetched {
            Ok(detail) => {
                self.write_children(record, &detail, external_id, report)
                    .await
            }
            Err(err) => {
                self.record_failure(
                    report,
                    external_id.to_string(),
                    FailureStage::FetchDetail,
                    err.to_string(),
                );
                Ok(false)
            }
        };
        tokio::time::sleep(self.config.detail_delay).await;
        result
    }

    async fn write_children(
        &self,
        record: &S::Record,
        detail: &S::Detail,
        external_id: &str,
        report: &mut SyncReport,
    ) -> Result<bool, FatalCause> {
        match self
            .strategy
            .upsert_children(self.store.as_ref(), record, detail)
            .await
        {
            Ok(written) => {
                report.items_upserted += written as u64;
                Ok(true)
            }
            Err(err) => self
                .storage_failure(
                    report,
                    external_id.to_string(),
                    FailureStage::ReplaceChildren,
                    err,
                )
                .map(|()| false),
        }
    }

    /// Re-fetches dead-lettered records by id before the page loop. Returns the ids that
    /// are still pending, including failed replays, so a successful listing pass can
    /// resolve them.
    async fn replay_pending(&self, report: &mut SyncReport) -> Result<HashSet<String>, FatalCause> {
        let pending = match self.store.pending_failures(self.strategy.entity()).await {
            Ok(pending) => pending,
            Err(err) if err.is_unavailable() => return Err(FatalCause::StorageUnavailable(err)),
            Err(err) => {
                warn!(error = %err, "could not read dead-letter entries; skipping replay");
                return Ok(HashSet::new());
            }
        };

        let mut still_pending = HashSet::new();
        for failure in pending {
            let external_id = failure.external_id;
            let fetched = self
                .with_cooldown_opt(|| {
                    self.strategy
                        .fetch_detail_by_id(self.api.as_ref(), &external_id)
                })
                .await;
            let Some(fetched) = fetched else {
                still_pending.insert(external_id);
                continue;
            };

            let detail = match fetched {
                Ok(detail) => detail,
                Err(err) => {
                    self.record_failure(
                        report,
                        external_id.clone(),
                        FailureStage::FetchDetail,
                        format!("replay: {err}"),
                    );
                    still_pending.insert(external_id);
                    continue;
                }
            };
            let Some(record) = self.strategy.record_from_detail(&detail) else {
                still_pending.insert(external_id);
                continue;
            };

            if let Err(err) = self.strategy.upsert(self.store.as_ref(), &record).await {
                self.storage_failure(report, external_id.clone(), FailureStage::UpsertParent, err)?;
                still_pending.insert(external_id);
                continue;
            }
            if self
                .write_children(&record, &detail, &external_id, report)
                .await?
            {
                report.records_replayed += 1;
                self.resolve(&external_id).await?;
                info!(external_id = %external_id, "dead-letter record replayed");
            } else {
                still_pending.insert(external_id);
            }
            tokio::time::sleep(self.config.detail_delay).await;
        }
        Ok(still_pending)
    }

    /// A pending record that the listing pass synced in full is healed: its dead-letter
    /// entry is resolved and failures from a replay earlier in this run are dropped.
    async fn resolve_if_pending(
        &self,
        external_id: &str,
        pending: &mut HashSet<String>,
        report: &mut SyncReport,
    ) -> Result<(), FatalCause> {
        if pending.remove(external_id) {
            report
                .record_failures
                .retain(|f| f.external_id != external_id);
            self.resolve(external_id).await?;
        }
        Ok(())
    }

    async fn resolve(&self, external_id: &str) -> Result<(), FatalCause> {
        match self
            .store
            .resolve_failure(self.strategy.entity(), external_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_unavailable() => Err(FatalCause::StorageUnavailable(err)),
            Err(err) => {
                warn!(external_id, error = %err, "could not resolve dead-letter entry");
                Ok(())
            }
        }
    }

    fn storage_failure(
        &self,
        report: &mut SyncReport,
        external_id: String,
        stage: FailureStage,
        err: StorageError,
    ) -> Result<(), FatalCause> {
        if err.is_unavailable() {
            return Err(FatalCause::StorageUnavailable(err));
        }
        self.record_failure(report, external_id, stage, err.to_string());
        Ok(())
    }

    fn record_failure(
        &self,
        report: &mut SyncReport,
        external_id: String,
        stage: FailureStage,
        message: String,
    ) {
        warn!(external_id = %external_id, stage = %stage, error = %message, "record failed");
        report.record_failures.push(RecordFailure {
            entity: self.strategy.entity(),
            external_id,
            stage,
            message,
        });
    }

    /// Dead-letters every failure that carries a real external id.
    async fn persist_failures(&self, report: &SyncReport) {
        let replayable: Vec<RecordFailure> = report
            .record_failures
            .iter()
            .filter(|f| f.stage != FailureStage::Map)
            .cloned()
            .collect();
        if replayable.is_empty() {
            return;
        }
        match self.store.record_failures(self.run_id, &replayable).await {
            Ok(written) => info!(written, "record failures dead-lettered"),
            Err(err) => warn!(error = %err, "could not persist record failures"),
        }
    }

    /// Retries `op` after a fixed cool-down while the upstream reports a rate limit.
    async fn with_cooldown<T, E, F, Fut>(&self, is_rate_limited: fn(&E) -> bool, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut cooldowns = 0u32;
        loop {
            match op().await {
                Err(err)
                    if is_rate_limited(&err) && cooldowns < self.config.max_rate_limit_cooldowns =>
                {
                    cooldowns += 1;
                    warn!(
                        cooldown_secs = self.config.rate_limit_cooldown.as_secs(),
                        cooldowns,
                        error = %err,
                        "upstream rate limit; cooling down"
                    );
                    tokio::time::sleep(self.config.rate_limit_cooldown).await;
                }
                other => return other,
            }
        }
    }

    async fn with_cooldown_opt<T, F, Fut>(&self, mut op: F) -> Option<Result<T, DetailError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<Result<T, DetailError>>>,
    {
        self.with_cooldown(DetailError::is_rate_limited, || {
            let fut = op();
            async move { fut.await.transpose() }
        })
        .await
        .transpose()
    }
}
