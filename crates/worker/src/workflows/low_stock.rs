//! Low-stock alert
//!
//! Classifies the product's current stock (not the figure in the event,
//! which may be stale by the time the run executes) and alerts the store.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use storefront_durable::workflow::DefinitionError;
use storefront_durable::{StepContext, StepError, StepExecutor, WorkflowDefinition};
use tracing::{debug, info};

use super::{events, WorkflowDeps};
use crate::datastore::StorefrontStore;
use crate::notify::{Notification, NotificationSink};

/// `app/product.stock_updated` payload
#[derive(Debug, Clone, Deserialize)]
pub struct StockUpdatedPayload {
    #[serde(rename = "productId")]
    pub product_id: String,
    pub stock: i64,
    #[serde(rename = "storeId")]
    pub store_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockLevel {
    OutOfStock,
    Low,
    Healthy,
}

impl StockLevel {
    /// `0` (or less) is out of stock, `1..threshold` is low
    pub fn classify(stock: i64, threshold: i64) -> Self {
        if stock <= 0 {
            Self::OutOfStock
        } else if stock < threshold {
            Self::Low
        } else {
            Self::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::Low => "low_stock",
            Self::Healthy => "none",
        }
    }
}

pub struct NotifySeller {
    store: Arc<dyn StorefrontStore>,
    notifier: Arc<dyn NotificationSink>,
    threshold: i64,
}

#[async_trait]
impl StepExecutor for NotifySeller {
    async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
        let payload: StockUpdatedPayload = ctx.payload()?;

        let Some(product) = self.store.get_product(&payload.product_id).await? else {
            debug!(product_id = %payload.product_id, "product gone, no alert");
            return Ok(json!({ "product_id": payload.product_id, "alert": "none", "reason": "product_missing" }));
        };

        let level = StockLevel::classify(product.stock, self.threshold);
        if level == StockLevel::Healthy {
            debug!(product_id = %product.id, stock = product.stock, "stock healthy");
            return Ok(json!({ "product_id": product.id, "alert": level.as_str(), "stock": product.stock }));
        }

        let store_id = if product.store_id.is_empty() {
            payload.store_id.as_str()
        } else {
            product.store_id.as_str()
        };
        let Some(store) = self.store.get_store(store_id).await? else {
            return Err(StepError::permanent(format!(
                "store {store_id} for product {} not found",
                product.id
            ))
            .with_type("STORE_NOT_FOUND")
            .with_details(json!({ "store_id": store_id, "product_id": product.id })));
        };

        let message = match level {
            StockLevel::OutOfStock => format!(
                "{} is OUT OF STOCK in store {}",
                product.name, store.name
            ),
            _ => format!(
                "Low stock ({}) for {} in store {}",
                product.stock, product.name, store.name
            ),
        };
        self.notifier
            .notify(&Notification::email(store.email.clone(), message))
            .await?;

        info!(
            product_id = %product.id,
            store_id = %store.id,
            stock = product.stock,
            alert = level.as_str(),
            "seller notified"
        );
        Ok(json!({ "product_id": product.id, "alert": level.as_str(), "stock": product.stock }))
    }
}

pub fn definition(deps: &WorkflowDeps) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder("low-stock-alert", events::PRODUCT_STOCK_UPDATED)
        .payload::<StockUpdatedPayload>()
        .run(
            "notify-seller",
            NotifySeller {
                store: Arc::clone(&deps.store),
                notifier: Arc::clone(&deps.notifier),
                threshold: deps.settings.low_stock_threshold,
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{Product, Store};
    use crate::workflows::test_support::{harness, Harness};
    use storefront_durable::Event;
    use uuid::Uuid;

    fn seed(h: &Harness, stock: i64) {
        h.store.put_store(Store {
            id: "s1".into(),
            user_id: "seller".into(),
            name: "Gadget Hub".into(),
            email: "seller@example.com".into(),
        });
        h.store.put_product(Product {
            id: "p1".into(),
            store_id: "s1".into(),
            name: "Wireless Mouse".into(),
            stock,
        });
    }

    fn step(h: &Harness) -> NotifySeller {
        NotifySeller {
            store: h.deps.store.clone(),
            notifier: h.deps.notifier.clone(),
            threshold: 5,
        }
    }

    fn ctx(stock: i64) -> StepContext {
        let event = Event::new(
            events::PRODUCT_STOCK_UPDATED,
            json!({ "productId": "p1", "stock": stock, "storeId": "s1" }),
        );
        StepContext::new(Uuid::now_v7(), "low-stock-alert", "notify-seller", event)
    }

    #[test]
    fn test_classify() {
        assert_eq!(StockLevel::classify(0, 5), StockLevel::OutOfStock);
        assert_eq!(StockLevel::classify(1, 5), StockLevel::Low);
        assert_eq!(StockLevel::classify(3, 5), StockLevel::Low);
        assert_eq!(StockLevel::classify(4, 5), StockLevel::Low);
        assert_eq!(StockLevel::classify(5, 5), StockLevel::Healthy);
        assert_eq!(StockLevel::classify(12, 5), StockLevel::Healthy);
    }

    #[tokio::test]
    async fn test_low_stock_alert() {
        let h = harness();
        seed(&h, 3);

        let result = step(&h).execute(&ctx(3)).await.unwrap();

        assert_eq!(result["alert"], "low_stock");
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "seller@example.com");
        assert!(sent[0].message.contains("Low stock (3)"));
    }

    #[tokio::test]
    async fn test_out_of_stock_alert() {
        let h = harness();
        seed(&h, 0);

        let result = step(&h).execute(&ctx(0)).await.unwrap();

        assert_eq!(result["alert"], "out_of_stock");
        assert!(h.notifier.sent()[0].message.contains("OUT OF STOCK"));
    }

    #[tokio::test]
    async fn test_healthy_stock_sends_nothing() {
        let h = harness();
        seed(&h, 12);

        let result = step(&h).execute(&ctx(12)).await.unwrap();

        assert_eq!(result["alert"], "none");
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_uses_current_stock_not_event_stock() {
        let h = harness();
        seed(&h, 20);

        let result = step(&h).execute(&ctx(2)).await.unwrap();

        assert_eq!(result["alert"], "none");
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_product_sends_nothing() {
        let h = harness();

        let result = step(&h).execute(&ctx(0)).await.unwrap();

        assert_eq!(result["reason"], "product_missing");
    }

    #[tokio::test]
    async fn test_missing_store_is_permanent() {
        let h = harness();
        h.store.put_product(Product {
            id: "p1".into(),
            store_id: "gone".into(),
            name: "Wireless Mouse".into(),
            stock: 1,
        });

        let err = step(&h).execute(&ctx(1)).await.unwrap_err();

        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("STORE_NOT_FOUND"));
    }
}
