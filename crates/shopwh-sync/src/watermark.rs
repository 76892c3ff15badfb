use chrono::{Days, NaiveDate};
use shopwh_core::{SyncWindow, WindowResolution};
use shopwh_storage::{StorageError, Warehouse};
use tracing::info;

/// Derives the next order window from the latest stored order date.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkResolver {
    epoch: NaiveDate,
}

impl WatermarkResolver {
    pub fn new(epoch: NaiveDate) -> Self {
        Self { epoch }
    }

    /// `[max stored date + 1, today]`, or `[epoch, today]` on an empty store.
    pub async fn resolve(
        &self,
        store: &dyn Warehouse,
        today: NaiveDate,
    ) -> Result<WindowResolution, StorageError> {
        let latest = store.max_order_date().await?;
        let start = match latest {
            Some(max) => max.checked_add_days(Days::new(1)).unwrap_or(max),
            None => self.epoch,
        };

        match SyncWindow::new(start, today) {
            Some(window) => {
                info!(%window, latest = ?latest, "resolved order sync window");
                Ok(WindowResolution::Sync(window))
            }
            None => {
                info!(next_start = %start, %today, "orders already up to date");
                Ok(WindowResolution::UpToDate {
                    next_start: start,
                    today,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shopwh_core::{OrderRecord, RemoteOrderSummary};
    use shopwh_storage::MemoryWarehouse;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn store_with_order_on(day: NaiveDate) -> MemoryWarehouse {
        let store = MemoryWarehouse::new();
        store
            .upsert_order(&OrderRecord {
                summary: RemoteOrderSummary {
                    external_id: "1".into(),
                    date: Some(day),
                    ..Default::default()
                },
                raw_payload: json!({}),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn empty_store_starts_at_epoch() {
        let resolver = WatermarkResolver::new(date(2020, 1, 1));
        let resolution = resolver
            .resolve(&MemoryWarehouse::new(), date(2024, 3, 10))
            .await
            .unwrap();
        let window = resolution.window().expect("window");
        assert_eq!(window.start(), date(2020, 1, 1));
        assert_eq!(window.end(), date(2024, 3, 10));
    }

    #[tokio::test]
    async fn resumes_the_day_after_latest_order() {
        let store = store_with_order_on(date(2024, 3, 1)).await;
        let resolver = WatermarkResolver::new(date(2020, 1, 1));
        let window = resolver
            .resolve(&store, date(2024, 3, 10))
            .await
            .unwrap()
            .window()
            .expect("window");
        assert_eq!(window.start(), date(2024, 3, 2));
        assert_eq!(window.end(), date(2024, 3, 10));
    }

    #[tokio::test]
    async fn caught_up_store_is_not_an_error() {
        let store = store_with_order_on(date(2024, 3, 10)).await;
        let resolver = WatermarkResolver::new(date(2020, 1, 1));
        let resolution = resolver.resolve(&store, date(2024, 3, 10)).await.unwrap();
        assert_eq!(
            resolution,
            WindowResolution::UpToDate {
                next_start: date(2024, 3, 11),
                today: date(2024, 3, 10),
            }
        );
    }

    #[tokio::test]
    async fn storage_outage_propagates() {
        let store = MemoryWarehouse::new();
        store.set_unavailable(true);
        let err = WatermarkResolver::new(date(2020, 1, 1))
            .resolve(&store, date(2024, 3, 10))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
