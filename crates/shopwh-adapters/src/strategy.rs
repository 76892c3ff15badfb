//! Per-entity sync strategies driven by the generic sync engine.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use shopwh_client::{ApiError, SourceApi};
use shopwh_core::{EntityKind, OrderRecord, ProductRecord, RemoteOrderDetail, SyncWindow};
use shopwh_storage::{StorageError, Warehouse};
use tracing::debug;

use crate::envelope::{check_envelope, total_pages, Envelope};
use crate::mapper::{detail_order_payload, map_order, map_order_detail, map_product, unwrap_wrapper};
use crate::{DetailError, MappingError};

pub const ORDERS_SEARCH: &str = "pedidos.pesquisa.php";
pub const ORDER_DETAIL: &str = "pedido.obter.php";
pub const PRODUCTS_SEARCH: &str = "produtos.pesquisa.php";

/// One listing page: raw records plus the total page count reported with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub records: Vec<JsonValue>,
    pub total_pages: u32,
}

impl ListingPage {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            total_pages: 0,
        }
    }
}

fn listing_page(endpoint: &str, body: &JsonValue, list_key: &str) -> Result<ListingPage, ApiError> {
    match check_envelope(endpoint, body)? {
        Envelope::Empty => Ok(ListingPage::empty()),
        Envelope::Ok(retorno) => Ok(ListingPage {
            records: retorno
                .get(list_key)
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default(),
            total_pages: total_pages(retorno),
        }),
    }
}

fn br_date(date: chrono::NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Entity-specific steps of `MAP -> UPSERT_PARENT -> FETCH_DETAIL -> UPSERT_CHILDREN`.
///
/// Detail-related hooks default to "not supported" so flat entities only implement
/// listing, mapping and the parent upsert.
#[async_trait]
pub trait EntitySyncStrategy: Send + Sync {
    type Record: Send + Sync;
    type Detail: Send + Sync;

    fn entity(&self) -> EntityKind;

    async fn list_page(
        &self,
        api: &dyn SourceApi,
        window: Option<&SyncWindow>,
        page: u32,
    ) -> Result<ListingPage, ApiError>;

    fn map_record(&self, raw: &JsonValue) -> Result<Self::Record, MappingError>;

    fn external_id<'r>(&self, record: &'r Self::Record) -> &'r str;

    async fn upsert(&self, store: &dyn Warehouse, record: &Self::Record)
        -> Result<(), StorageError>;

    /// `None` when the entity has no detail step.
    async fn fetch_detail(
        &self,
        _api: &dyn SourceApi,
        _record: &Self::Record,
    ) -> Option<Result<Self::Detail, DetailError>> {
        None
    }

    /// Detail lookup by external id alone; used to replay dead-lettered records.
    async fn fetch_detail_by_id(
        &self,
        _api: &dyn SourceApi,
        _external_id: &str,
    ) -> Option<Result<Self::Detail, DetailError>> {
        None
    }

    /// Parent record rebuilt from a detail payload, for replays.
    fn record_from_detail(&self, _detail: &Self::Detail) -> Option<Self::Record> {
        None
    }

    async fn upsert_children(
        &self,
        _store: &dyn Warehouse,
        _record: &Self::Record,
        _detail: &Self::Detail,
    ) -> Result<usize, StorageError> {
        Ok(0)
    }
}

/// Order detail plus the raw order object it was mapped from.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedOrderDetail {
    pub detail: RemoteOrderDetail,
    pub raw_order: JsonValue,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrderStrategy;

impl OrderStrategy {
    async fn detail_call(
        &self,
        api: &dyn SourceApi,
        key: &str,
        value: &str,
    ) -> Result<FetchedOrderDetail, DetailError> {
        let body = api
            .call(ORDER_DETAIL, &[(key, value.to_string())])
            .await?;
        match check_envelope(ORDER_DETAIL, &body)? {
            Envelope::Ok(_) => {}
            Envelope::Empty => {
                return Err(DetailError::Api(ApiError::Business {
                    endpoint: ORDER_DETAIL.to_string(),
                    message: format!("no order found for {key}={value}"),
                }))
            }
        }
        let detail = map_order_detail(&body)?;
        Ok(FetchedOrderDetail {
            detail,
            raw_order: detail_order_payload(&body).clone(),
        })
    }
}

#[async_trait]
impl EntitySyncStrategy for OrderStrategy {
    type Record = OrderRecord;
    type Detail = FetchedOrderDetail;

    fn entity(&self) -> EntityKind {
        EntityKind::Orders
    }

    async fn list_page(
        &self,
        api: &dyn SourceApi,
        window: Option<&SyncWindow>,
        page: u32,
    ) -> Result<ListingPage, ApiError> {
        let mut params = vec![("pagina", page.to_string())];
        if let Some(window) = window {
            params.push(("dataInicial", br_date(window.start())));
            params.push(("dataFinal", br_date(window.end())));
        }
        let body = api.call(ORDERS_SEARCH, &params).await?;
        listing_page(ORDERS_SEARCH, &body, "pedidos")
    }

    fn map_record(&self, raw: &JsonValue) -> Result<OrderRecord, MappingError> {
        Ok(OrderRecord {
            summary: map_order(raw)?,
            raw_payload: unwrap_wrapper(raw, "pedido").clone(),
        })
    }

    fn external_id<'r>(&self, record: &'r OrderRecord) -> &'r str {
        record.external_id()
    }

    async fn upsert(&self, store: &dyn Warehouse, record: &OrderRecord) -> Result<(), StorageError> {
        store.upsert_order(record).await
    }

    /// By id first; when that lookup is rejected and the order has a number, by number.
    async fn fetch_detail(
        &self,
        api: &dyn SourceApi,
        record: &OrderRecord,
    ) -> Option<Result<FetchedOrderDetail, DetailError>> {
        let by_id = self.detail_call(api, "id", record.external_id()).await;
        let result = match (by_id, record.summary.number.as_deref()) {
            (Err(err), Some(number)) if err.allows_fallback() => {
                debug!(external_id = record.external_id(), number, error = %err, "detail by id failed; trying order number");
                self.detail_call(api, "numero", number).await
            }
            (result, _) => result,
        };
        Some(result)
    }

    async fn fetch_detail_by_id(
        &self,
        api: &dyn SourceApi,
        external_id: &str,
    ) -> Option<Result<FetchedOrderDetail, DetailError>> {
        Some(self.detail_call(api, "id", external_id).await)
    }

    fn record_from_detail(&self, detail: &FetchedOrderDetail) -> Option<OrderRecord> {
        Some(OrderRecord {
            summary: detail.detail.order.clone(),
            raw_payload: detail.raw_order.clone(),
        })
    }

    async fn upsert_children(
        &self,
        store: &dyn Warehouse,
        record: &OrderRecord,
        detail: &FetchedOrderDetail,
    ) -> Result<usize, StorageError> {
        store
            .replace_line_items(record.external_id(), &detail.detail.line_items)
            .await
    }
}

/// Catalog stream. The upstream product search has no date filter, so the window is ignored
/// and every run walks the full catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductStrategy;

#[async_trait]
impl EntitySyncStrategy for ProductStrategy {
    type Record = ProductRecord;
    type Detail = ();

    fn entity(&self) -> EntityKind {
        EntityKind::Products
    }

    async fn list_page(
        &self,
        api: &dyn SourceApi,
        _window: Option<&SyncWindow>,
        page: u32,
    ) -> Result<ListingPage, ApiError> {
        let body = api
            .call(PRODUCTS_SEARCH, &[("pagina", page.to_string())])
            .await?;
        listing_page(PRODUCTS_SEARCH, &body, "produtos")
    }

    fn map_record(&self, raw: &JsonValue) -> Result<ProductRecord, MappingError> {
        map_product(raw)
    }

    fn external_id<'r>(&self, record: &'r ProductRecord) -> &'r str {
        &record.external_id
    }

    async fn upsert(
        &self,
        store: &dyn Warehouse,
        record: &ProductRecord,
    ) -> Result<(), StorageError> {
        store.upsert_product(record).await
    }
}
