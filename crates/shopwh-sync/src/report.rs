use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shopwh_core::{SyncReport, SyncStatus, WindowResolution};
use tokio::fs;
use uuid::Uuid;

use crate::refresh::RefreshSummary;

pub const SUMMARY_JSON: &str = "run_summary.json";
pub const SUMMARY_MD: &str = "summary.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub order_window: Option<WindowResolution>,
    pub orders: Option<SyncReport>,
    pub products: Option<SyncReport>,
    pub refresh: Option<RefreshSummary>,
    pub table_counts: BTreeMap<String, i64>,
    pub fatal_errors: Vec<String>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            order_window: None,
            orders: None,
            products: None,
            refresh: None,
            table_counts: BTreeMap::new(),
            fatal_errors: Vec::new(),
            reports_dir: None,
        }
    }

    /// Derives the overall status from fatal errors and per-entity record failures.
    pub fn finalize(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        let record_failures = self
            .entity_reports()
            .any(|r| r.status() != SyncStatus::Success);
        self.status = if !self.fatal_errors.is_empty() {
            RunStatus::Failed
        } else if record_failures {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };
    }

    pub fn entity_reports(&self) -> impl Iterator<Item = &SyncReport> {
        self.orders.iter().chain(self.products.iter())
    }

    pub fn is_fatal(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

fn render_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Shop Warehouse Sync Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {:?}", summary.status),
    ];
    match &summary.order_window {
        Some(WindowResolution::Sync(window)) => lines.push(format!("- Order window: {window}")),
        Some(WindowResolution::UpToDate { next_start, today }) => lines.push(format!(
            "- Order window: up to date (next start {next_start}, today {today})"
        )),
        None => {}
    }

    lines.push(String::new());
    lines.push("## Entities".to_string());
    for report in summary.entity_reports() {
        lines.push(format!(
            "- {}: {} upserted, {} items, {} replayed, {}/{} pages, {} failures",
            report.entity,
            report.records_upserted,
            report.items_upserted,
            report.records_replayed,
            report.pages_processed,
            report.total_pages,
            report.record_failures.len()
        ));
    }

    let failures: Vec<String> = summary
        .entity_reports()
        .flat_map(|r| r.record_failures.iter())
        .map(|f| format!("- {} `{}` at {}: {}", f.entity, f.external_id, f.stage, f.message))
        .collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Record Failures".to_string());
        lines.extend(failures);
    }

    if let Some(refresh) = &summary.refresh {
        lines.push(String::new());
        lines.push("## Aggregate Views".to_string());
        for view in &refresh.views {
            let mode = view
                .mode
                .map(|m| format!("{m:?}").to_lowercase())
                .unwrap_or_else(|| "failed".to_string());
            let rows = view
                .row_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string());
            lines.push(format!("- {}: {rows} rows ({mode})", view.view));
            if let Some(reason) = &view.fallback_reason {
                lines.push(format!("  - {reason}"));
            }
        }
    }

    if !summary.table_counts.is_empty() {
        lines.push(String::new());
        lines.push("## Table Counts".to_string());
        for (table, count) in &summary.table_counts {
            lines.push(format!("- {table}: {count}"));
        }
    }

    if !summary.fatal_errors.is_empty() {
        lines.push(String::new());
        lines.push("## Fatal Errors".to_string());
        for err in &summary.fatal_errors {
            lines.push(format!("- {err}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_root>/<run_id>/{run_summary.json, summary.md}` and returns the run directory.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_JSON), json)
        .await
        .with_context(|| format!("writing {SUMMARY_JSON}"))?;
    fs::write(run_dir.join(SUMMARY_MD), render_markdown(summary))
        .await
        .with_context(|| format!("writing {SUMMARY_MD}"))?;

    Ok(run_dir)
}

/// Markdown digest of the most recent `runs` run reports, newest first.
pub fn recent_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(SUMMARY_JSON).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let path = dir.path().join(SUMMARY_JSON);
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;

        let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
        let finished = value
            .get("finished_at")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!("- status: {status}"));
        lines.push(format!("- finished: {finished}"));
        for entity in ["orders", "products"] {
            if let Some(report) = value.get(entity).filter(|v| !v.is_null()) {
                let upserted = report
                    .get("records_upserted")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let failures = report
                    .get("record_failures")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                lines.push(format!("- {entity}: {upserted} upserted, {failures} failures"));
            }
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shopwh_core::{EntityKind, FailureStage, RecordFailure};

    fn summary_with_failure() -> RunSummary {
        let started = Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).single().unwrap();
        let mut summary = RunSummary::new(Uuid::new_v4(), started);
        let mut orders = SyncReport::new(EntityKind::Orders, None);
        orders.pages_processed = 1;
        orders.records_upserted = 4;
        orders.record_failures.push(RecordFailure {
            entity: EntityKind::Orders,
            external_id: "900002".into(),
            stage: FailureStage::FetchDetail,
            message: "undecodable response".into(),
        });
        summary.orders = Some(orders);
        summary.products = Some(SyncReport::new(EntityKind::Products, None));
        summary.finalize(started + chrono::Duration::minutes(3));
        summary
    }

    #[test]
    fn status_reflects_record_and_fatal_failures() {
        let mut summary = summary_with_failure();
        assert_eq!(summary.status, RunStatus::CompletedWithFailures);
        summary.fatal_errors.push("orders sync aborted".into());
        summary.finalize(summary.finished_at);
        assert!(summary.is_fatal());
    }

    #[tokio::test]
    async fn reports_land_in_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary_with_failure();

        let run_dir = write_reports(dir.path(), &summary).await.unwrap();
        assert_eq!(run_dir, dir.path().join(summary.run_id.to_string()));

        let markdown = std::fs::read_to_string(run_dir.join(SUMMARY_MD)).unwrap();
        assert!(markdown.contains("orders: 4 upserted"));
        assert!(markdown.contains("`900002` at fetch_detail"));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join(SUMMARY_JSON)).unwrap())
                .unwrap();
        assert_eq!(json["status"], "completed_with_failures");

        let digest = recent_runs_markdown(5, dir.path()).unwrap();
        assert!(digest.contains("status: completed_with_failures"));
        assert!(digest.contains("orders: 4 upserted, 1 failures"));
    }
}
