//! Upstream entity adapters: tolerant mapping, envelope checks and sync strategies.

use shopwh_client::ApiError;
use thiserror::Error;

pub mod envelope;
pub mod mapper;
pub mod strategy;

pub use envelope::{check_envelope, total_pages, Envelope};
pub use strategy::{
    EntitySyncStrategy, FetchedOrderDetail, ListingPage, OrderStrategy, ProductStrategy,
};

pub const CRATE_NAME: &str = "shopwh-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("{entity} record has no external id")]
    MissingExternalId { entity: &'static str },
    #[error("response has no `{section}` object")]
    MissingSection { section: &'static str },
}

/// Failure of a best-effort detail fetch.
#[derive(Debug, Error)]
pub enum DetailError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("malformed detail: {0}")]
    Mapping(#[from] MappingError),
}

impl DetailError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DetailError::Api(err) if err.is_rate_limited())
    }

    /// Whether another lookup key is worth trying. Throttling, exhausted transport
    /// retries and credential failures would fail the same way.
    pub fn allows_fallback(&self) -> bool {
        match self {
            DetailError::Api(err) => matches!(
                err,
                ApiError::Business { .. } | ApiError::HttpStatus { .. } | ApiError::Decode { .. }
            ),
            DetailError::Mapping(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::Value as JsonValue;
    use shopwh_client::SourceApi;
    use shopwh_core::SyncWindow;
    use shopwh_storage::{MemoryWarehouse, Warehouse};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> JsonValue {
        let path = workspace_root().join("fixtures").join("tiny").join(name);
        let text = fs::read_to_string(&path).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    /// Serves fixtures keyed by `endpoint?param=value` and records every call.
    #[derive(Default)]
    struct FixtureApi {
        responses: HashMap<String, JsonValue>,
        calls: Mutex<Vec<String>>,
    }

    impl FixtureApi {
        fn with(mut self, key: &str, body: JsonValue) -> Self {
            self.responses.insert(key.to_string(), body);
            self
        }
    }

    #[async_trait]
    impl SourceApi for FixtureApi {
        async fn call(
            &self,
            endpoint: &str,
            params: &[(&str, String)],
        ) -> Result<JsonValue, ApiError> {
            let rendered = params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            self.calls
                .lock()
                .unwrap()
                .push(format!("{endpoint}?{rendered}"));
            params
                .iter()
                .find_map(|(k, v)| self.responses.get(&format!("{endpoint}?{k}={v}")))
                .cloned()
                .ok_or_else(|| ApiError::HttpStatus {
                    endpoint: endpoint.to_string(),
                    status: 404,
                })
        }
    }

    #[tokio::test]
    async fn order_listing_fixture_maps_summaries() {
        let api = FixtureApi::default().with(
            "pedidos.pesquisa.php?pagina=1",
            fixture("pedidos_pesquisa_p1.json"),
        );
        let window = SyncWindow::new(
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
        )
        .unwrap();

        let page = OrderStrategy
            .list_page(&api, Some(&window), 1)
            .await
            .unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.records.len(), 2);

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["pedidos.pesquisa.php?pagina=1&dataInicial=02/03/2024&dataFinal=10/03/2024"]
        );

        let first = OrderStrategy.map_record(&page.records[0]).unwrap();
        assert_eq!(first.external_id(), "900001");
        assert_eq!(first.summary.number.as_deref(), Some("1501"));
        assert_eq!(first.summary.customer_name.as_deref(), Some("Maria Souza"));
        assert_eq!(first.summary.total_amount, Some(150.9));
        assert_eq!(first.raw_payload["id"], "900001");
    }

    #[tokio::test]
    async fn last_order_page_reports_same_page_count() {
        let api = FixtureApi::default().with(
            "pedidos.pesquisa.php?pagina=2",
            fixture("pedidos_pesquisa_p2.json"),
        );

        let page = OrderStrategy.list_page(&api, None, 2).await.unwrap();
        assert_eq!(page.total_pages, 2);
        let only = OrderStrategy.map_record(&page.records[0]).unwrap();
        assert_eq!(only.external_id(), "900003");
        assert_eq!(only.summary.date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(only.summary.total_amount, Some(42.5));
    }

    #[tokio::test]
    async fn order_detail_falls_back_to_number() {
        let api = FixtureApi::default()
            .with(
                "pedido.obter.php?id=900001",
                fixture("erro_nao_encontrado.json"),
            )
            .with("pedido.obter.php?numero=1501", fixture("pedido_obter.json"));
        let record = OrderStrategy
            .map_record(&fixture("pedidos_pesquisa_p1.json")["retorno"]["pedidos"][0])
            .unwrap();

        let fetched = OrderStrategy
            .fetch_detail(&api, &record)
            .await
            .expect("orders have details")
            .expect("fallback succeeds");
        assert_eq!(fetched.detail.line_items.len(), 2);
        assert_eq!(fetched.detail.order.shipping_amount, Some(15.0));
        assert_eq!(api.calls.lock().unwrap().len(), 2);

        let store = MemoryWarehouse::new();
        OrderStrategy.upsert(&store, &record).await.unwrap();
        let written = OrderStrategy
            .upsert_children(&store, &record, &fetched)
            .await
            .unwrap();
        assert_eq!(written, 2);
        let items = store.line_items("900001").await.unwrap();
        assert_eq!(items[1].item.product_code.as_deref(), Some("CAM-P-AZ"));
        assert_eq!(items[1].item_seq, 2);
    }

    #[tokio::test]
    async fn rate_limited_detail_does_not_fall_back() {
        let api = FixtureApi::default()
            .with("pedido.obter.php?id=900001", fixture("erro_api_bloqueada.json"))
            .with("pedido.obter.php?numero=1501", fixture("pedido_obter.json"));
        let record = OrderStrategy
            .map_record(&fixture("pedidos_pesquisa_p1.json")["retorno"]["pedidos"][0])
            .unwrap();

        let err = OrderStrategy
            .fetch_detail(&api, &record)
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(api.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn product_listing_fixture_maps_catalog() {
        let api = FixtureApi::default().with(
            "produtos.pesquisa.php?pagina=1",
            fixture("produtos_pesquisa.json"),
        );
        let page = ProductStrategy.list_page(&api, None, 1).await.unwrap();
        assert_eq!(page.total_pages, 1);

        let products = page
            .records
            .iter()
            .map(|raw| ProductStrategy.map_record(raw))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(products.len(), 2);

        let mug = &products[0];
        assert_eq!(mug.external_id, "300100");
        assert_eq!(mug.code.as_deref(), Some("CAN-001"));
        assert_eq!(mug.price, Some(39.9));
        assert_eq!(mug.cost_price, Some(12.5));
        assert_eq!(mug.tags.as_deref(), Some("Canecas"));
        assert_eq!(
            mug.created_at,
            NaiveDate::from_ymd_opt(2023, 10, 31).and_then(|d| d.and_hms_opt(10, 24, 18))
        );
        assert_eq!(products[1].tags.as_deref(), Some("verao, promo"));
        assert_eq!(products[1].created_at, None);
    }

    #[tokio::test]
    async fn empty_listing_is_a_final_page() {
        let api = FixtureApi::default().with(
            "produtos.pesquisa.php?pagina=1",
            fixture("erro_sem_registros.json"),
        );
        let page = ProductStrategy.list_page(&api, None, 1).await.unwrap();
        assert_eq!(page, ListingPage::empty());
    }
}
