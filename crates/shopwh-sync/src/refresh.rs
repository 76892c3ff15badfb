use std::collections::BTreeMap;

use serde::Serialize;
use shopwh_core::{AggregateView, RefreshMode};
use shopwh_storage::{MaterializedViews, QualifiedName};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no aggregate view could be refreshed ({failed} failed): {first_error}")]
    AllFailed { failed: usize, first_error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewRefresh {
    pub view: String,
    /// Mode that succeeded; `None` when both modes failed.
    pub mode: Option<RefreshMode>,
    pub row_count: Option<i64>,
    /// Why the concurrent refresh was skipped in favour of a blocking one.
    pub fallback_reason: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshSummary {
    pub views: Vec<ViewRefresh>,
}

impl RefreshSummary {
    pub fn row_counts(&self) -> BTreeMap<String, i64> {
        self.views
            .iter()
            .filter_map(|v| v.row_count.map(|n| (v.view.clone(), n)))
            .collect()
    }

    pub fn refreshed(&self) -> usize {
        self.views.iter().filter(|v| v.mode.is_some()).count()
    }
}

/// Recomputes every aggregate view, preferring a non-blocking refresh per view.
#[derive(Debug, Clone)]
pub struct AggregateRefresher {
    views: Vec<AggregateView>,
}

impl AggregateRefresher {
    pub fn new(views: Vec<AggregateView>) -> Self {
        Self { views }
    }

    pub fn views(&self) -> &[AggregateView] {
        &self.views
    }

    /// Refreshes then counts each view. Fails only when no view refreshed in either mode.
    pub async fn refresh_all(
        &self,
        store: &dyn MaterializedViews,
    ) -> Result<RefreshSummary, RefreshError> {
        let mut summary = RefreshSummary::default();
        for view in &self.views {
            summary.views.push(self.refresh_one(store, view).await);
        }

        let failed: Vec<&ViewRefresh> = summary.views.iter().filter(|v| v.mode.is_none()).collect();
        if !self.views.is_empty() && failed.len() == self.views.len() {
            return Err(RefreshError::AllFailed {
                failed: failed.len(),
                first_error: failed
                    .first()
                    .and_then(|v| v.error.clone())
                    .unwrap_or_default(),
            });
        }
        Ok(summary)
    }

    async fn refresh_one(&self, store: &dyn MaterializedViews, view: &AggregateView) -> ViewRefresh {
        let mut outcome = ViewRefresh {
            view: view.name.clone(),
            mode: None,
            row_count: None,
            fallback_reason: None,
            error: None,
        };
        if let Err(err) = QualifiedName::parse(&view.name) {
            error!(view = %view.name, error = %err, "skipping view with invalid name");
            outcome.error = Some(err.to_string());
            return outcome;
        }

        match store.refresh_view(view, RefreshMode::Concurrent).await {
            Ok(()) => outcome.mode = Some(RefreshMode::Concurrent),
            Err(concurrent_err) => {
                warn!(
                    view = %view.name,
                    unique_key = %view.unique_key,
                    error = %concurrent_err,
                    "concurrent refresh failed; falling back to blocking refresh"
                );
                outcome.fallback_reason = Some(format!(
                    "concurrent refresh needs a populated view with a unique index on `{}`: {concurrent_err}",
                    view.unique_key
                ));
                match store.refresh_view(view, RefreshMode::Blocking).await {
                    Ok(()) => outcome.mode = Some(RefreshMode::Blocking),
                    Err(err) => {
                        error!(view = %view.name, error = %err, "view refresh failed");
                        outcome.error = Some(err.to_string());
                        return outcome;
                    }
                }
            }
        }

        match store.count_rows(view).await {
            Ok(0) => {
                info!(view = %view.name, "view refreshed with no rows (empty period)");
                outcome.row_count = Some(0);
            }
            Ok(rows) => {
                info!(view = %view.name, rows, "view refreshed");
                outcome.row_count = Some(rows);
            }
            Err(err) => {
                error!(view = %view.name, error = %err, "view row count failed");
                outcome.error = Some(err.to_string());
            }
        }
        outcome
    }
}
