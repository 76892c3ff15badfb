//! `PostgreSQL` warehouse backed by a shared `sqlx` pool.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use shopwh_core::{
    items_total, AggregateView, EntityKind, FailureStage, OrderRecord, ProductRecord,
    RecordFailure, RefreshMode, RemoteLineItem, RemoteOrderSummary, StoredLineItem,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{latest_per_record, MaterializedViews, QualifiedName, StorageError, Warehouse};

/// Idempotent storage contract. Views are created `WITH NO DATA`; the first refresh
/// populates them.
const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS public.orders (
    external_id      TEXT PRIMARY KEY,
    number           TEXT,
    order_date       DATE,
    customer_id      TEXT,
    customer_name    TEXT,
    channel          TEXT,
    status           TEXT,
    products_amount  NUMERIC,
    discount_amount  NUMERIC,
    shipping_amount  NUMERIC,
    total_amount     NUMERIC,
    raw_payload      JSONB NOT NULL DEFAULT '{}'::jsonb,
    synced_at        TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_orders_order_date ON public.orders (order_date);

CREATE TABLE IF NOT EXISTS public.order_items (
    order_id      TEXT NOT NULL REFERENCES public.orders (external_id) ON DELETE CASCADE,
    item_seq      INTEGER NOT NULL,
    product_id    TEXT,
    product_code  TEXT,
    product_name  TEXT,
    quantity      NUMERIC,
    unit_price    NUMERIC,
    line_total    NUMERIC,
    PRIMARY KEY (order_id, item_seq)
);
CREATE INDEX IF NOT EXISTS idx_order_items_product_code ON public.order_items (product_code);

CREATE TABLE IF NOT EXISTS public.products (
    external_id         TEXT PRIMARY KEY,
    code                TEXT UNIQUE,
    name                TEXT,
    price               NUMERIC,
    promotional_price   NUMERIC,
    cost_price          NUMERIC,
    average_cost_price  NUMERIC,
    unit                TEXT,
    gtin                TEXT,
    variation_type      TEXT,
    location            TEXT,
    status              TEXT,
    created_at          TIMESTAMP,
    tags                TEXT,
    raw_payload         JSONB NOT NULL DEFAULT '{}'::jsonb,
    synced_at           TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS public.sync_failures (
    id           BIGSERIAL PRIMARY KEY,
    run_id       UUID NOT NULL,
    entity       TEXT NOT NULL,
    external_id  TEXT NOT NULL,
    stage        TEXT NOT NULL,
    message      TEXT NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 1,
    failed_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    resolved_at  TIMESTAMPTZ
);
ALTER TABLE public.sync_failures ADD COLUMN IF NOT EXISTS attempts INTEGER NOT NULL DEFAULT 1;
CREATE UNIQUE INDEX IF NOT EXISTS ux_sync_failures_pending
    ON public.sync_failures (entity, external_id) WHERE resolved_at IS NULL;

CREATE SCHEMA IF NOT EXISTS analytics;

CREATE MATERIALIZED VIEW IF NOT EXISTS analytics.mv_orders_daily AS
SELECT
    o.order_date                        AS day,
    COUNT(*)::INT                       AS orders,
    COALESCE(SUM(o.total_amount), 0)    AS revenue,
    COALESCE(SUM(i.qty), 0)             AS items
FROM public.orders o
LEFT JOIN LATERAL (
    SELECT COALESCE(SUM(quantity), 0) AS qty
    FROM public.order_items oi
    WHERE oi.order_id = o.external_id
) i ON TRUE
WHERE o.order_date >= (CURRENT_DATE - INTERVAL '90 days')
GROUP BY o.order_date
WITH NO DATA;
CREATE UNIQUE INDEX IF NOT EXISTS ux_mv_orders_daily_day ON analytics.mv_orders_daily (day);

CREATE MATERIALIZED VIEW IF NOT EXISTS analytics.mv_channels_30d AS
SELECT
    COALESCE(NULLIF(TRIM(channel), ''), '(sem canal)')  AS channel,
    COUNT(*)::INT                                       AS orders_count,
    COALESCE(SUM(total_amount), 0)                      AS revenue
FROM public.orders
WHERE order_date >= (CURRENT_DATE - INTERVAL '30 days')
GROUP BY 1
WITH NO DATA;
CREATE UNIQUE INDEX IF NOT EXISTS ux_mv_channels_30d_channel ON analytics.mv_channels_30d (channel);

CREATE MATERIALIZED VIEW IF NOT EXISTS analytics.mv_top_products_90d AS
WITH base AS (
    SELECT
        COALESCE(NULLIF(TRIM(i.product_code), ''), '(sem sku)')   AS sku,
        COALESCE(NULLIF(TRIM(i.product_name), ''), '(sem nome)')  AS product_name,
        COALESCE(SUM(i.line_total), 0)                            AS revenue,
        COALESCE(SUM(i.quantity), 0)                              AS qty
    FROM public.order_items i
    JOIN public.orders o ON o.external_id = i.order_id
    WHERE o.order_date >= (CURRENT_DATE - INTERVAL '90 days')
    GROUP BY 1, 2
)
SELECT
    ROW_NUMBER() OVER (ORDER BY revenue DESC NULLS LAST, sku) AS rank,
    sku, product_name, revenue, qty
FROM base
WITH NO DATA;
CREATE UNIQUE INDEX IF NOT EXISTS ux_mv_top_products_90d_rank ON analytics.mv_top_products_90d (rank);
";

const ORDER_COLUMNS: &str = "external_id, number, order_date, customer_id, customer_name, channel, \
     status, products_amount::float8 AS products_amount, discount_amount::float8 AS discount_amount, \
     shipping_amount::float8 AS shipping_amount, total_amount::float8 AS total_amount, raw_payload";

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates missing tables, views and unique indexes. Safe to run repeatedly.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

fn order_from_row(row: &PgRow) -> Result<OrderRecord, sqlx::Error> {
    Ok(OrderRecord {
        summary: RemoteOrderSummary {
            external_id: row.try_get("external_id")?,
            number: row.try_get("number")?,
            date: row.try_get::<Option<NaiveDate>, _>("order_date")?,
            customer_id: row.try_get("customer_id")?,
            customer_name: row.try_get("customer_name")?,
            channel: row.try_get("channel")?,
            status: row.try_get("status")?,
            products_amount: row.try_get("products_amount")?,
            discount_amount: row.try_get("discount_amount")?,
            shipping_amount: row.try_get("shipping_amount")?,
            total_amount: row.try_get("total_amount")?,
        },
        raw_payload: row.try_get::<JsonValue, _>("raw_payload")?,
    })
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn max_order_date(&self) -> Result<Option<NaiveDate>, StorageError> {
        let max: Option<NaiveDate> =
            sqlx::query_scalar("SELECT MAX(order_date) FROM public.orders")
                .fetch_one(&self.pool)
                .await?;
        Ok(max)
    }

    async fn upsert_order(&self, order: &OrderRecord) -> Result<(), StorageError> {
        let s = &order.summary;
        sqlx::query(
            r"
            INSERT INTO public.orders
                (external_id, number, order_date, customer_id, customer_name, channel, status,
                 products_amount, discount_amount, shipping_amount, total_amount, raw_payload, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
            ON CONFLICT (external_id) DO UPDATE SET
                number = EXCLUDED.number,
                order_date = EXCLUDED.order_date,
                customer_id = EXCLUDED.customer_id,
                customer_name = EXCLUDED.customer_name,
                channel = EXCLUDED.channel,
                status = EXCLUDED.status,
                products_amount = EXCLUDED.products_amount,
                discount_amount = EXCLUDED.discount_amount,
                shipping_amount = EXCLUDED.shipping_amount,
                total_amount = EXCLUDED.total_amount,
                raw_payload = EXCLUDED.raw_payload,
                synced_at = now()
            ",
        )
        .bind(&s.external_id)
        .bind(&s.number)
        .bind(s.date)
        .bind(&s.customer_id)
        .bind(&s.customer_name)
        .bind(&s.channel)
        .bind(&s.status)
        .bind(s.products_amount)
        .bind(s.discount_amount)
        .bind(s.shipping_amount)
        .bind(s.total_amount)
        .bind(&order.raw_payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_line_items(
        &self,
        order_id: &str,
        items: &[RemoteLineItem],
    ) -> Result<usize, StorageError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM public.order_items WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if !items.is_empty() {
            let mut insert: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO public.order_items \
                 (order_id, item_seq, product_id, product_code, product_name, quantity, unit_price, line_total) ",
            );
            insert.push_values(items.iter().enumerate(), |mut row, (idx, item)| {
                row.push_bind(order_id)
                    .push_bind(idx as i32 + 1)
                    .push_bind(item.product_id.clone())
                    .push_bind(item.product_code.clone())
                    .push_bind(item.product_name.clone())
                    .push_bind(item.quantity)
                    .push_bind(item.unit_price)
                    .push_bind(item.line_total);
            });
            insert.build().execute(&mut *tx).await?;
        }

        if let Some(total) = items_total(items) {
            let backfilled = sqlx::query(
                "UPDATE public.orders SET total_amount = $2 \
                 WHERE external_id = $1 AND COALESCE(total_amount, 0) = 0",
            )
            .bind(order_id)
            .bind(total)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if backfilled > 0 {
                debug!(order_id, total, "order total backfilled from items");
            }
        }

        tx.commit().await?;
        debug!(order_id, deleted, inserted = items.len(), "line items replaced");
        Ok(items.len())
    }

    async fn upsert_product(&self, product: &ProductRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO public.products
                (external_id, code, name, price, promotional_price, cost_price, average_cost_price,
                 unit, gtin, variation_type, location, status, created_at, tags, raw_payload, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now())
            ON CONFLICT (external_id) DO UPDATE SET
                code = EXCLUDED.code,
                name = EXCLUDED.name,
                price = EXCLUDED.price,
                promotional_price = EXCLUDED.promotional_price,
                cost_price = EXCLUDED.cost_price,
                average_cost_price = EXCLUDED.average_cost_price,
                unit = EXCLUDED.unit,
                gtin = EXCLUDED.gtin,
                variation_type = EXCLUDED.variation_type,
                location = EXCLUDED.location,
                status = EXCLUDED.status,
                created_at = EXCLUDED.created_at,
                tags = EXCLUDED.tags,
                raw_payload = EXCLUDED.raw_payload,
                synced_at = now()
            ",
        )
        .bind(&product.external_id)
        .bind(&product.code)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.promotional_price)
        .bind(product.cost_price)
        .bind(product.average_cost_price)
        .bind(&product.unit)
        .bind(&product.gtin)
        .bind(&product.variation_type)
        .bind(&product.location)
        .bind(&product.status)
        .bind(product.created_at)
        .bind(&product.tags)
        .bind(&product.raw_payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, external_id: &str) -> Result<Option<OrderRecord>, StorageError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM public.orders WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(order_from_row).transpose()?)
    }

    async fn line_items(&self, order_id: &str) -> Result<Vec<StoredLineItem>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT order_id, item_seq, product_id, product_code, product_name,
                   quantity::float8 AS quantity, unit_price::float8 AS unit_price,
                   line_total::float8 AS line_total
            FROM public.order_items
            WHERE order_id = $1
            ORDER BY item_seq
            ",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StoredLineItem {
                    order_id: row.try_get("order_id")?,
                    item_seq: row.try_get("item_seq")?,
                    item: RemoteLineItem {
                        product_id: row.try_get("product_id")?,
                        product_code: row.try_get("product_code")?,
                        product_name: row.try_get("product_name")?,
                        quantity: row.try_get("quantity")?,
                        unit_price: row.try_get("unit_price")?,
                        line_total: row.try_get("line_total")?,
                    },
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StorageError::from)
    }

    async fn record_failures(
        &self,
        run_id: Uuid,
        failures: &[RecordFailure],
    ) -> Result<usize, StorageError> {
        let failures = latest_per_record(failures);
        if failures.is_empty() {
            return Ok(0);
        }
        let mut insert: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO public.sync_failures (run_id, entity, external_id, stage, message) ",
        );
        insert.push_values(&failures, |mut row, failure| {
            row.push_bind(run_id)
                .push_bind(failure.entity.as_str())
                .push_bind(&failure.external_id)
                .push_bind(failure.stage.as_str())
                .push_bind(&failure.message);
        });
        // One pending row per record; a repeat failure refreshes it.
        insert.push(
            " ON CONFLICT (entity, external_id) WHERE resolved_at IS NULL DO UPDATE SET \
             run_id = EXCLUDED.run_id, stage = EXCLUDED.stage, message = EXCLUDED.message, \
             attempts = public.sync_failures.attempts + 1, failed_at = now()",
        );
        let inserted = insert.build().execute(&self.pool).await?.rows_affected();
        Ok(inserted as usize)
    }

    async fn pending_failures(
        &self,
        entity: EntityKind,
    ) -> Result<Vec<RecordFailure>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT ON (external_id) external_id, stage, message
            FROM public.sync_failures
            WHERE entity = $1 AND resolved_at IS NULL
            ORDER BY external_id, failed_at DESC
            ",
        )
        .bind(entity.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let stage: String = row.try_get("stage")?;
            out.push(RecordFailure {
                entity,
                external_id: row.try_get("external_id")?,
                stage: FailureStage::parse(&stage).unwrap_or(FailureStage::FetchDetail),
                message: row.try_get("message")?,
            });
        }
        Ok(out)
    }

    async fn resolve_failure(
        &self,
        entity: EntityKind,
        external_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE public.sync_failures SET resolved_at = now() \
             WHERE entity = $1 AND external_id = $2 AND resolved_at IS NULL",
        )
        .bind(entity.as_str())
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_counts(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT
                (SELECT COUNT(*) FROM public.orders)       AS orders,
                (SELECT COUNT(*) FROM public.order_items)  AS order_items,
                (SELECT COUNT(*) FROM public.products)     AS products
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for table in ["orders", "order_items", "products"] {
            counts.insert(table.to_string(), row.try_get::<i64, _>(table)?);
        }
        Ok(counts)
    }
}

#[async_trait]
impl MaterializedViews for PgWarehouse {
    async fn refresh_view(
        &self,
        view: &AggregateView,
        mode: RefreshMode,
    ) -> Result<(), StorageError> {
        let name = QualifiedName::parse(&view.name)?;
        let sql = match mode {
            RefreshMode::Concurrent => {
                format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {}", name.quoted())
            }
            RefreshMode::Blocking => format!("REFRESH MATERIALIZED VIEW {}", name.quoted()),
        };
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn count_rows(&self, view: &AggregateView) -> Result<i64, StorageError> {
        let name = QualifiedName::parse(&view.name)?;
        let sql = format!("SELECT COUNT(*)::bigint FROM {}", name.quoted());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}
