//! In-process warehouse used by tests and dry runs.
//!
//! Mirrors the relational constraints the pipeline relies on: line items need a
//! parent order, product codes are unique, and materialized views must be populated
//! and uniquely indexed before they can be refreshed concurrently.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use shopwh_core::{
    items_total, AggregateView, EntityKind, OrderRecord, ProductRecord, RecordFailure,
    RefreshMode, RemoteLineItem, StoredLineItem,
};
use uuid::Uuid;

use crate::{latest_per_record, MaterializedViews, StorageError, Warehouse};

const NO_CHANNEL: &str = "(sem canal)";
const NO_SKU: &str = "(sem sku)";

/// How a registered view groups the base tables; its row count is the number of groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewGrouping {
    DailyOrders,
    Channels,
    TopProducts,
}

#[derive(Debug)]
struct ViewState {
    grouping: ViewGrouping,
    unique_index: bool,
    /// Row count captured by the last refresh; `None` until first populated.
    snapshot: Option<i64>,
}

#[derive(Debug)]
struct FailureEntry {
    run_id: Uuid,
    failure: RecordFailure,
    resolved: bool,
}

#[derive(Debug, Default)]
struct State {
    orders: BTreeMap<String, OrderRecord>,
    items: BTreeMap<String, Vec<StoredLineItem>>,
    products: BTreeMap<String, ProductRecord>,
    product_codes: BTreeMap<String, String>,
    failures: Vec<FailureEntry>,
    views: BTreeMap<String, ViewState>,
    unavailable: bool,
    failing_order_writes: HashSet<String>,
    failing_item_writes: HashSet<String>,
    concurrent_refreshes: u32,
    blocking_refreshes: u32,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warehouse with the three standard analytics views registered and uniquely indexed.
    pub fn with_default_views() -> Self {
        let store = Self::new();
        let groupings = [
            ViewGrouping::DailyOrders,
            ViewGrouping::Channels,
            ViewGrouping::TopProducts,
        ];
        for (view, grouping) in AggregateView::defaults().iter().zip(groupings) {
            store.register_view(&view.name, grouping, true);
        }
        store
    }

    pub fn register_view(&self, name: &str, grouping: ViewGrouping, unique_index: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.views.insert(
                name.to_string(),
                ViewState {
                    grouping,
                    unique_index,
                    snapshot: None,
                },
            );
        }
    }

    /// Makes every operation fail as if the connection pool were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Rejects parent upserts for `external_id` with a constraint-style error.
    pub fn fail_writes_for(&self, external_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_order_writes.insert(external_id.to_string());
        }
    }

    /// Rejects line-item replacement for `order_id`.
    pub fn fail_item_writes_for(&self, order_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_item_writes.insert(order_id.to_string());
        }
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().map(|s| s.orders.len()).unwrap_or_default()
    }

    pub fn product(&self, external_id: &str) -> Option<ProductRecord> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.products.get(external_id).cloned())
    }

    /// Every dead-letter entry with the run that recorded it, resolved or not.
    pub fn recorded_failures(&self) -> Vec<(Uuid, RecordFailure)> {
        self.state
            .lock()
            .map(|s| {
                s.failures
                    .iter()
                    .map(|e| (e.run_id, e.failure.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(concurrent, blocking)` refreshes that succeeded so far.
    pub fn refresh_counts(&self) -> (u32, u32) {
        self.state
            .lock()
            .map(|s| (s.concurrent_refreshes, s.blocking_refreshes))
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory warehouse lock poisoned".into()))?;
        if state.unavailable {
            return Err(StorageError::Unavailable(
                "memory warehouse marked unavailable".into(),
            ));
        }
        Ok(state)
    }
}

impl State {
    fn group_count(&self, grouping: ViewGrouping) -> i64 {
        let groups: BTreeSet<String> = match grouping {
            ViewGrouping::DailyOrders => self
                .orders
                .values()
                .filter_map(|o| o.summary.date)
                .map(|d| d.to_string())
                .collect(),
            ViewGrouping::Channels => self
                .orders
                .values()
                .map(|o| {
                    o.summary
                        .channel
                        .as_deref()
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .unwrap_or(NO_CHANNEL)
                        .to_string()
                })
                .collect(),
            ViewGrouping::TopProducts => self
                .items
                .values()
                .flatten()
                .map(|i| {
                    i.item
                        .product_code
                        .as_deref()
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .unwrap_or(NO_SKU)
                        .to_string()
                })
                .collect(),
        };
        groups.len() as i64
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn max_order_date(&self) -> Result<Option<NaiveDate>, StorageError> {
        let state = self.lock()?;
        Ok(state.orders.values().filter_map(|o| o.summary.date).max())
    }

    async fn upsert_order(&self, order: &OrderRecord) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.failing_order_writes.contains(order.external_id()) {
            return Err(StorageError::Database {
                code: Some("23514".into()),
                message: format!("check constraint rejected order {}", order.external_id()),
            });
        }
        state
            .orders
            .insert(order.external_id().to_string(), order.clone());
        Ok(())
    }

    async fn replace_line_items(
        &self,
        order_id: &str,
        items: &[RemoteLineItem],
    ) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        if !state.orders.contains_key(order_id) {
            return Err(StorageError::Database {
                code: Some("23503".into()),
                message: format!("order_items.order_id references missing order {order_id}"),
            });
        }
        if state.failing_item_writes.contains(order_id) {
            return Err(StorageError::database(format!(
                "item write rejected for order {order_id}"
            )));
        }
        let stored = items
            .iter()
            .enumerate()
            .map(|(idx, item)| StoredLineItem {
                order_id: order_id.to_string(),
                item_seq: idx as i32 + 1,
                item: item.clone(),
            })
            .collect();
        state.items.insert(order_id.to_string(), stored);
        if let (Some(total), Some(order)) = (items_total(items), state.orders.get_mut(order_id)) {
            if order.summary.total_amount.unwrap_or(0.0) == 0.0 {
                order.summary.total_amount = Some(total);
            }
        }
        Ok(items.len())
    }

    async fn upsert_product(&self, product: &ProductRecord) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if let Some(code) = product.code.as_deref() {
            if let Some(owner) = state.product_codes.get(code) {
                if owner != &product.external_id {
                    return Err(StorageError::Database {
                        code: Some("23505".into()),
                        message: format!("product code {code} already used by {owner}"),
                    });
                }
            }
        }
        let previous_code = state
            .products
            .get(&product.external_id)
            .and_then(|p| p.code.clone());
        if let Some(previous) = previous_code {
            state.product_codes.remove(&previous);
        }
        if let Some(code) = &product.code {
            state
                .product_codes
                .insert(code.clone(), product.external_id.clone());
        }
        state
            .products
            .insert(product.external_id.clone(), product.clone());
        Ok(())
    }

    async fn get_order(&self, external_id: &str) -> Result<Option<OrderRecord>, StorageError> {
        Ok(self.lock()?.orders.get(external_id).cloned())
    }

    async fn line_items(&self, order_id: &str) -> Result<Vec<StoredLineItem>, StorageError> {
        Ok(self.lock()?.items.get(order_id).cloned().unwrap_or_default())
    }

    async fn record_failures(
        &self,
        run_id: Uuid,
        failures: &[RecordFailure],
    ) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let latest = latest_per_record(failures);
        for failure in &latest {
            let pending = state.failures.iter_mut().find(|e| {
                !e.resolved
                    && e.failure.entity == failure.entity
                    && e.failure.external_id == failure.external_id
            });
            match pending {
                Some(entry) => {
                    entry.run_id = run_id;
                    entry.failure = (*failure).clone();
                }
                None => state.failures.push(FailureEntry {
                    run_id,
                    failure: (*failure).clone(),
                    resolved: false,
                }),
            }
        }
        Ok(latest.len())
    }

    async fn pending_failures(
        &self,
        entity: EntityKind,
    ) -> Result<Vec<RecordFailure>, StorageError> {
        let state = self.lock()?;
        let mut latest: BTreeMap<&str, &RecordFailure> = BTreeMap::new();
        for entry in state
            .failures
            .iter()
            .filter(|e| !e.resolved && e.failure.entity == entity)
        {
            latest.insert(&entry.failure.external_id, &entry.failure);
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn resolve_failure(
        &self,
        entity: EntityKind,
        external_id: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        for entry in state.failures.iter_mut() {
            if entry.failure.entity == entity && entry.failure.external_id == external_id {
                entry.resolved = true;
            }
        }
        Ok(())
    }

    async fn table_counts(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        let state = self.lock()?;
        let items: usize = state.items.values().map(Vec::len).sum();
        Ok(BTreeMap::from([
            ("orders".to_string(), state.orders.len() as i64),
            ("order_items".to_string(), items as i64),
            ("products".to_string(), state.products.len() as i64),
        ]))
    }
}

#[async_trait]
impl MaterializedViews for MemoryWarehouse {
    async fn refresh_view(
        &self,
        view: &AggregateView,
        mode: RefreshMode,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let (grouping, unique_index, populated) = match state.views.get(&view.name) {
            Some(v) => (v.grouping, v.unique_index, v.snapshot.is_some()),
            None => {
                return Err(StorageError::Database {
                    code: Some("42P01".into()),
                    message: format!("relation \"{}\" does not exist", view.name),
                })
            }
        };
        if mode == RefreshMode::Concurrent {
            if !populated {
                return Err(StorageError::Database {
                    code: Some("55000".into()),
                    message: "CONCURRENTLY cannot be used when the materialized view is not populated"
                        .into(),
                });
            }
            if !unique_index {
                return Err(StorageError::Database {
                    code: Some("55000".into()),
                    message: format!("cannot refresh materialized view \"{}\" concurrently", view.name),
                });
            }
        }

        let rows = state.group_count(grouping);
        if let Some(v) = state.views.get_mut(&view.name) {
            v.snapshot = Some(rows);
        }
        match mode {
            RefreshMode::Concurrent => state.concurrent_refreshes += 1,
            RefreshMode::Blocking => state.blocking_refreshes += 1,
        }
        Ok(())
    }

    async fn count_rows(&self, view: &AggregateView) -> Result<i64, StorageError> {
        let state = self.lock()?;
        match state.views.get(&view.name) {
            Some(ViewState {
                snapshot: Some(rows),
                ..
            }) => Ok(*rows),
            Some(_) => Err(StorageError::Database {
                code: Some("55000".into()),
                message: format!("materialized view \"{}\" has not been populated", view.name),
            }),
            None => Err(StorageError::Database {
                code: Some("42P01".into()),
                message: format!("relation \"{}\" does not exist", view.name),
            }),
        }
    }
}
