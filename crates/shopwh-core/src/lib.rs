//! Core domain model for the shopwh sync pipeline.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "shopwh-core";

/// Upstream record streams mirrored into the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Orders,
    Products,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Orders => "orders",
            EntityKind::Products => "products",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "orders" => Some(EntityKind::Orders),
            "products" => Some(EntityKind::Products),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive date range requested from the upstream listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl SyncWindow {
    /// Returns `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Outcome of watermark resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowResolution {
    Sync(SyncWindow),
    /// The store already covers everything up to `today`.
    UpToDate { next_start: NaiveDate, today: NaiveDate },
}

impl WindowResolution {
    pub fn window(&self) -> Option<SyncWindow> {
        match self {
            WindowResolution::Sync(window) => Some(*window),
            WindowResolution::UpToDate { .. } => None,
        }
    }
}

/// Listing-page view of one upstream order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteOrderSummary {
    pub external_id: String,
    pub number: Option<String>,
    pub date: Option<NaiveDate>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub channel: Option<String>,
    pub status: Option<String>,
    pub products_amount: Option<f64>,
    pub discount_amount: Option<f64>,
    pub shipping_amount: Option<f64>,
    pub total_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteLineItem {
    pub product_id: Option<String>,
    pub product_code: Option<String>,
    pub product_name: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub line_total: Option<f64>,
}

impl RemoteLineItem {
    /// Stated line total, else `quantity × unit_price` with missing factors as zero.
    pub fn effective_total(&self) -> f64 {
        self.line_total
            .unwrap_or_else(|| self.quantity.unwrap_or(0.0) * self.unit_price.unwrap_or(0.0))
    }
}

/// Order total derived from its items; `None` when there are no items.
pub fn items_total(items: &[RemoteLineItem]) -> Option<f64> {
    (!items.is_empty()).then(|| items.iter().map(RemoteLineItem::effective_total).sum())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOrderDetail {
    pub order: RemoteOrderSummary,
    pub line_items: Vec<RemoteLineItem>,
}

/// Order row as written to the warehouse: summary fields plus the raw upstream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub summary: RemoteOrderSummary,
    pub raw_payload: JsonValue,
}

impl OrderRecord {
    pub fn external_id(&self) -> &str {
        &self.summary.external_id
    }
}

/// Line item as read back from the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLineItem {
    pub order_id: String,
    pub item_seq: i32,
    pub item: RemoteLineItem,
}

/// Normalized catalog record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductRecord {
    pub external_id: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub promotional_price: Option<f64>,
    pub cost_price: Option<f64>,
    pub average_cost_price: Option<f64>,
    pub unit: Option<String>,
    pub gtin: Option<String>,
    pub variation_type: Option<String>,
    pub location: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub tags: Option<String>,
    pub raw_payload: JsonValue,
}

/// Step of the per-record flow at which a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Map,
    UpsertParent,
    FetchDetail,
    ReplaceChildren,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Map => "map",
            FailureStage::UpsertParent => "upsert_parent",
            FailureStage::FetchDetail => "fetch_detail",
            FailureStage::ReplaceChildren => "replace_children",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "map" => Some(FailureStage::Map),
            "upsert_parent" => Some(FailureStage::UpsertParent),
            "fetch_detail" => Some(FailureStage::FetchDetail),
            "replace_children" => Some(FailureStage::ReplaceChildren),
            _ => None,
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record that could not be fully synced; enough context to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub entity: EntityKind,
    pub external_id: String,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

/// Counters and failures accumulated by one entity sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub entity: EntityKind,
    pub window: Option<SyncWindow>,
    pub pages_processed: u32,
    pub total_pages: u32,
    pub records_upserted: u64,
    pub items_upserted: u64,
    pub records_replayed: u64,
    pub record_failures: Vec<RecordFailure>,
}

impl SyncReport {
    pub fn new(entity: EntityKind, window: Option<SyncWindow>) -> Self {
        Self {
            entity,
            window,
            pages_processed: 0,
            total_pages: 0,
            records_upserted: 0,
            items_upserted: 0,
            records_replayed: 0,
            record_failures: Vec::new(),
        }
    }

    pub fn status(&self) -> SyncStatus {
        if self.record_failures.is_empty() {
            SyncStatus::Success
        } else if self.records_upserted > 0 || self.pages_processed > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        }
    }

    pub fn failures_at(&self, stage: FailureStage) -> impl Iterator<Item = &RecordFailure> {
        self.record_failures.iter().filter(move |f| f.stage == stage)
    }
}

/// Materialized aggregate view and the unique key that allows a concurrent refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateView {
    pub name: String,
    pub unique_key: String,
}

impl AggregateView {
    pub fn new(name: impl Into<String>, unique_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_key: unique_key.into(),
        }
    }

    pub fn defaults() -> Vec<AggregateView> {
        vec![
            AggregateView::new("analytics.mv_orders_daily", "day"),
            AggregateView::new("analytics.mv_channels_30d", "channel"),
            AggregateView::new("analytics.mv_top_products_90d", "rank"),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Does not block readers; needs a populated view with a unique index.
    Concurrent,
    Blocking,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn window_rejects_inverted_range() {
        assert!(SyncWindow::new(date(2024, 3, 2), date(2024, 3, 1)).is_none());
        let same_day = SyncWindow::new(date(2024, 3, 1), date(2024, 3, 1)).expect("window");
        assert!(same_day.contains(date(2024, 3, 1)));
        assert!(!same_day.contains(date(2024, 3, 2)));
    }

    #[test]
    fn items_total_prefers_stated_line_totals() {
        let items = [
            RemoteLineItem {
                quantity: Some(3.0),
                unit_price: Some(10.0),
                line_total: Some(20.0),
                ..Default::default()
            },
            RemoteLineItem {
                quantity: Some(2.0),
                unit_price: Some(5.5),
                ..Default::default()
            },
            RemoteLineItem {
                quantity: Some(4.0),
                ..Default::default()
            },
        ];
        assert_eq!(items_total(&items), Some(31.0));
        assert_eq!(items_total(&[]), None);
    }

    #[test]
    fn report_status_reflects_failures() {
        let mut report = SyncReport::new(EntityKind::Orders, None);
        assert_eq!(report.status(), SyncStatus::Success);

        report.record_failures.push(RecordFailure {
            entity: EntityKind::Orders,
            external_id: "42".into(),
            stage: FailureStage::FetchDetail,
            message: "timeout".into(),
        });
        assert_eq!(report.status(), SyncStatus::Failed);

        report.pages_processed = 1;
        report.records_upserted = 3;
        assert_eq!(report.status(), SyncStatus::PartialFailure);
        assert_eq!(report.failures_at(FailureStage::FetchDetail).count(), 1);
        assert_eq!(report.failures_at(FailureStage::Map).count(), 0);
    }

    #[test]
    fn stage_and_entity_names_round_trip() {
        for stage in [
            FailureStage::Map,
            FailureStage::UpsertParent,
            FailureStage::FetchDetail,
            FailureStage::ReplaceChildren,
        ] {
            assert_eq!(FailureStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(EntityKind::parse("orders"), Some(EntityKind::Orders));
        assert_eq!(EntityKind::parse("invoices"), None);
    }
}
