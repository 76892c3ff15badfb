//! Warehouse gateway: idempotent upserts, child replacement and aggregate views.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use shopwh_core::{
    AggregateView, EntityKind, OrderRecord, ProductRecord, RecordFailure, RefreshMode,
    RemoteLineItem, StoredLineItem,
};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryWarehouse, ViewGrouping};
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "shopwh-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection, pool or transport failure; nothing can be written until it clears.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Statement rejected by the database (constraint violation, missing relation, ...).
    #[error("database rejected statement{}: {message}", sqlstate_suffix(.code))]
    Database {
        code: Option<String>,
        message: String,
    },
    #[error("query failed: {0}")]
    Query(String),
    #[error("invalid sql identifier `{0}`")]
    InvalidIdentifier(String),
}

fn sqlstate_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" (sqlstate {c})"))
        .unwrap_or_default()
}

impl StorageError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    pub(crate) fn database(message: impl Into<String>) -> Self {
        StorageError::Database {
            code: None,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) => StorageError::Database {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            other => StorageError::Query(other.to_string()),
        }
    }
}

/// Base-table operations the sync pipeline depends on.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn max_order_date(&self) -> Result<Option<NaiveDate>, StorageError>;

    /// Insert-or-update keyed by external id; every mutable column takes the incoming value.
    async fn upsert_order(&self, order: &OrderRecord) -> Result<(), StorageError>;

    /// Atomically replaces the order's items with `items`, numbered 1..N in order. An
    /// order whose total is missing or zero takes the sum of the item totals.
    async fn replace_line_items(
        &self,
        order_id: &str,
        items: &[RemoteLineItem],
    ) -> Result<usize, StorageError>;

    async fn upsert_product(&self, product: &ProductRecord) -> Result<(), StorageError>;

    async fn get_order(&self, external_id: &str) -> Result<Option<OrderRecord>, StorageError>;

    async fn line_items(&self, order_id: &str) -> Result<Vec<StoredLineItem>, StorageError>;

    /// Dead-letters failures. A record keeps one pending entry; repeats overwrite it.
    async fn record_failures(
        &self,
        run_id: Uuid,
        failures: &[RecordFailure],
    ) -> Result<usize, StorageError>;

    /// Unresolved dead-letter entries, latest per external id.
    async fn pending_failures(&self, entity: EntityKind)
        -> Result<Vec<RecordFailure>, StorageError>;

    async fn resolve_failure(&self, entity: EntityKind, external_id: &str)
        -> Result<(), StorageError>;

    async fn table_counts(&self) -> Result<BTreeMap<String, i64>, StorageError>;
}

#[async_trait]
pub trait MaterializedViews: Send + Sync {
    async fn refresh_view(&self, view: &AggregateView, mode: RefreshMode)
        -> Result<(), StorageError>;

    async fn count_rows(&self, view: &AggregateView) -> Result<i64, StorageError>;
}

/// Keeps the last failure per `(entity, external_id)`, in first-seen order.
pub(crate) fn latest_per_record(failures: &[RecordFailure]) -> Vec<&RecordFailure> {
    let mut out: Vec<&RecordFailure> = Vec::with_capacity(failures.len());
    for failure in failures {
        match out
            .iter_mut()
            .find(|f| f.entity == failure.entity && f.external_id == failure.external_id)
        {
            Some(slot) => *slot = failure,
            None => out.push(failure),
        }
    }
    out
}

/// Schema-qualified relation name checked to be a plain SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    schema: Option<String>,
    name: String,
}

impl QualifiedName {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidIdentifier(raw.to_string());
        let mut parts = raw.split('.');
        let first = parts.next().ok_or_else(invalid)?;
        let second = parts.next();
        if parts.next().is_some() {
            return Err(invalid());
        }
        let (schema, name) = match second {
            Some(name) => (Some(first), name),
            None => (None, first),
        };
        for part in schema.iter().copied().chain(std::iter::once(name)) {
            if !is_plain_identifier(part) {
                return Err(invalid());
            }
        }
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_are_validated_and_quoted() {
        assert_eq!(
            QualifiedName::parse("analytics.mv_orders_daily")
                .unwrap()
                .quoted(),
            "\"analytics\".\"mv_orders_daily\""
        );
        assert_eq!(
            QualifiedName::parse("mv_channels_30d").unwrap().quoted(),
            "\"mv_channels_30d\""
        );

        for bad in [
            "",
            "a.b.c",
            "analytics.",
            "mv; DROP TABLE orders",
            "9lives",
            "analytics.\"quoted\"",
        ] {
            assert!(
                matches!(QualifiedName::parse(bad), Err(StorageError::InvalidIdentifier(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn database_errors_render_sqlstate() {
        let err = StorageError::Database {
            code: Some("23505".into()),
            message: "duplicate key value violates unique constraint".into(),
        };
        assert!(err.to_string().contains("sqlstate 23505"));
        assert!(!err.is_unavailable());
        assert!(StorageError::Unavailable("pool timed out".into()).is_unavailable());
    }
}
