//! Abandoned-cart recovery
//!
//! Waits out the configured delay after a cart update, then sends one
//! recovery notification if the cart is still sitting there: not empty, not
//! checked out, and not touched again since (a later update started its own
//! run, which owns that newer cart state).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use storefront_durable::workflow::DefinitionError;
use storefront_durable::{StepContext, StepError, StepExecutor, WorkflowDefinition};
use tracing::{debug, info};

use super::{events, WorkflowDeps};
use crate::datastore::{Account, StorefrontStore};
use crate::notify::{Notification, NotificationSink};

/// `app/cart.updated` payload
#[derive(Debug, Clone, Deserialize)]
pub struct CartUpdatedPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub cart: serde_json::Value,
}

pub struct SendRecoveryNotification {
    store: Arc<dyn StorefrontStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl SendRecoveryNotification {
    fn skipped(user_id: &str, reason: &str) -> serde_json::Value {
        debug!(%user_id, reason, "no recovery notification");
        json!({ "user_id": user_id, "sent": false, "reason": reason })
    }

    /// The account's cart changed after the event that started this run
    fn superseded(account: &Account, ctx: &StepContext, snapshot: &serde_json::Value) -> bool {
        match account.cart_updated_at {
            Some(updated_at) => updated_at > ctx.event.occurred_at,
            None => !snapshot.is_null() && account.cart != *snapshot,
        }
    }
}

#[async_trait]
impl StepExecutor for SendRecoveryNotification {
    async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
        let payload: CartUpdatedPayload = ctx.payload()?;
        let user_id = payload.user_id.as_str();

        let Some(account) = self.store.get_account(user_id).await? else {
            return Ok(Self::skipped(user_id, "account_missing"));
        };

        let items = account.cart_quantity();
        if items == 0 {
            return Ok(Self::skipped(user_id, "cart_empty"));
        }

        if Self::superseded(&account, ctx, &payload.cart) {
            return Ok(Self::skipped(user_id, "superseded"));
        }

        let orders = self
            .store
            .orders_for_account_since(user_id, ctx.event.occurred_at)
            .await?;
        if !orders.is_empty() {
            return Ok(Self::skipped(user_id, "ordered"));
        }

        let notification = Notification::email(
            account.email.clone(),
            format!(
                "Hi {}, you left {} item(s) in your cart. Complete your order before they sell out!",
                account.name, items
            ),
        );
        self.notifier.notify(&notification).await?;

        info!(%user_id, items, "abandoned cart recovery notification sent");
        Ok(json!({ "user_id": user_id, "sent": true, "items": items }))
    }
}

pub fn definition(deps: &WorkflowDeps) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder("abandoned-cart-recovery", events::CART_UPDATED)
        .payload::<CartUpdatedPayload>()
        .sleep_for("wait-24h", deps.settings.abandoned_cart_delay)
        .run(
            "send-recovery-notification",
            SendRecoveryNotification {
                store: Arc::clone(&deps.store),
                notifier: Arc::clone(&deps.notifier),
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{AccountProfile, Order};
    use crate::workflows::test_support::{harness, Harness};
    use chrono::{DateTime, Duration, Utc};
    use storefront_durable::Event;
    use uuid::Uuid;

    fn seed_account(h: &Harness, cart: serde_json::Value, updated_at: DateTime<Utc>) {
        let mut account = Account::from_profile(AccountProfile {
            id: "u1".into(),
            email: "ada@example.com".into(),
            name: "Ada".into(),
            image: None,
        });
        account.cart = cart;
        account.cart_updated_at = Some(updated_at);
        h.store.put_account(account);
    }

    fn step(h: &Harness) -> SendRecoveryNotification {
        SendRecoveryNotification {
            store: h.deps.store.clone(),
            notifier: h.deps.notifier.clone(),
        }
    }

    fn ctx(cart: serde_json::Value, occurred_at: DateTime<Utc>) -> StepContext {
        let event = Event::at(
            events::CART_UPDATED,
            json!({ "userId": "u1", "cart": cart }),
            occurred_at,
        );
        StepContext::new(
            Uuid::now_v7(),
            "abandoned-cart-recovery",
            "send-recovery-notification",
            event,
        )
    }

    #[tokio::test]
    async fn test_sends_one_notification_for_abandoned_cart() {
        let h = harness();
        let t0 = Utc::now() - Duration::hours(24);
        seed_account(&h, json!({ "productA": 2 }), t0);

        let result = step(&h).execute(&ctx(json!({ "productA": 2 }), t0)).await.unwrap();

        assert_eq!(result["sent"], true);
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ada@example.com");
        assert!(sent[0].message.contains("2 item(s)"));
    }

    #[tokio::test]
    async fn test_order_in_window_suppresses_notification() {
        let h = harness();
        let t0 = Utc::now() - Duration::hours(24);
        seed_account(&h, json!({ "productA": 2 }), t0);
        h.store.put_order(Order {
            id: "o1".into(),
            user_id: "u1".into(),
            created_at: t0 + Duration::hours(3),
        });

        let result = step(&h).execute(&ctx(json!({ "productA": 2 }), t0)).await.unwrap();

        assert_eq!(result["reason"], "ordered");
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_order_before_trigger_does_not_count() {
        let h = harness();
        let t0 = Utc::now() - Duration::hours(24);
        seed_account(&h, json!({ "productA": 1 }), t0);
        h.store.put_order(Order {
            id: "o0".into(),
            user_id: "u1".into(),
            created_at: t0 - Duration::days(3),
        });

        let result = step(&h).execute(&ctx(json!({ "productA": 1 }), t0)).await.unwrap();

        assert_eq!(result["sent"], true);
    }

    #[tokio::test]
    async fn test_empty_cart_skips() {
        let h = harness();
        let t0 = Utc::now() - Duration::hours(24);
        seed_account(&h, json!({}), t0);

        let result = step(&h).execute(&ctx(json!({}), t0)).await.unwrap();

        assert_eq!(result["reason"], "cart_empty");
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_later_cart_update_supersedes_run() {
        let h = harness();
        let t0 = Utc::now() - Duration::hours(24);
        seed_account(&h, json!({ "productA": 3 }), t0 + Duration::hours(1));

        let result = step(&h).execute(&ctx(json!({ "productA": 2 }), t0)).await.unwrap();

        assert_eq!(result["reason"], "superseded");
        assert!(h.notifier.sent().is_empty());
    }

    fn seed_untimestamped(h: &Harness, cart: serde_json::Value) {
        let mut account = Account::from_profile(AccountProfile {
            id: "u1".into(),
            email: "ada@example.com".into(),
            name: "Ada".into(),
            image: None,
        });
        account.cart = cart;
        h.store.put_account(account);
    }

    #[tokio::test]
    async fn test_untimestamped_cart_matching_snapshot_is_notified() {
        let h = harness();
        seed_untimestamped(&h, json!({ "productA": 2 }));

        let result = step(&h)
            .execute(&ctx(json!({ "productA": 2 }), Utc::now() - Duration::hours(24)))
            .await
            .unwrap();

        assert_eq!(result["sent"], true);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_untimestamped_cart_changed_since_event_is_superseded() {
        let h = harness();
        seed_untimestamped(&h, json!({ "productA": 2, "productB": 1 }));

        let result = step(&h)
            .execute(&ctx(json!({ "productA": 2 }), Utc::now() - Duration::hours(24)))
            .await
            .unwrap();

        assert_eq!(result["reason"], "superseded");
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_account_skips() {
        let h = harness();

        let result = step(&h)
            .execute(&ctx(json!({ "productA": 2 }), Utc::now()))
            .await
            .unwrap();

        assert_eq!(result["reason"], "account_missing");
    }

    #[tokio::test]
    async fn test_sink_failure_is_retryable() {
        let h = harness();
        let t0 = Utc::now() - Duration::hours(24);
        seed_account(&h, json!({ "productA": 2 }), t0);
        h.notifier.fail_next(1);

        let err = step(&h)
            .execute(&ctx(json!({ "productA": 2 }), t0))
            .await
            .unwrap_err();

        assert!(err.retryable);
    }
}
