//! Coupon expiry: sleep until a coupon expires, then delete it
//!
//! The coupon is re-read before deleting. If it was extended or re-issued
//! with a later expiry in the meantime, the delete is skipped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use storefront_durable::workflow::DefinitionError;
use storefront_durable::{Event, StepContext, StepError, StepExecutor, WorkflowDefinition};
use tracing::{debug, info};

use super::{events, WorkflowDeps};
use crate::datastore::StorefrontStore;

/// `app/coupon.expired` payload
#[derive(Debug, Clone, Deserialize)]
pub struct CouponExpiredPayload {
    pub code: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

pub struct DeleteExpiredCoupon {
    store: Arc<dyn StorefrontStore>,
}

#[async_trait]
impl StepExecutor for DeleteExpiredCoupon {
    async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
        let payload: CouponExpiredPayload = ctx.payload()?;
        let now = ctx.started_at;

        let Some(coupon) = self.store.get_coupon(&payload.code).await? else {
            debug!(code = %payload.code, "coupon already absent");
            return Ok(json!({ "code": payload.code, "deleted": false, "reason": "absent" }));
        };

        if coupon.expires_at > now {
            info!(
                code = %payload.code,
                expires_at = %coupon.expires_at,
                "coupon expiry was extended, keeping it"
            );
            return Ok(json!({ "code": payload.code, "deleted": false, "reason": "extended" }));
        }

        let deleted = self.store.delete_coupon(&payload.code).await?;
        info!(code = %payload.code, deleted, "expired coupon deleted");
        Ok(json!({ "code": payload.code, "deleted": deleted }))
    }
}

fn expiry_time(event: &Event) -> Result<DateTime<Utc>, StepError> {
    let payload: CouponExpiredPayload = event.payload_as()?;
    Ok(payload.expires_at)
}

pub fn definition(deps: &WorkflowDeps) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder("delete-coupon-on-expiry", events::COUPON_EXPIRED)
        .payload::<CouponExpiredPayload>()
        .sleep_until("wait-for-expiry", expiry_time)
        .run(
            "delete-coupon",
            DeleteExpiredCoupon {
                store: Arc::clone(&deps.store),
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Coupon;
    use crate::workflows::test_support::harness;
    use chrono::Duration;
    use uuid::Uuid;

    fn ctx(code: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> StepContext {
        let event = Event::at(
            events::COUPON_EXPIRED,
            json!({ "code": code, "expiresAt": expires_at }),
            expires_at - Duration::hours(2),
        );
        StepContext::new(Uuid::now_v7(), "delete-coupon-on-expiry", "delete-coupon", event)
            .with_started_at(now)
    }

    #[tokio::test]
    async fn test_deletes_expired_coupon_and_tolerates_repeat() {
        let h = harness();
        let expires_at = Utc::now();
        h.store.put_coupon(Coupon {
            code: "SAVE10".into(),
            expires_at,
        });
        let step = DeleteExpiredCoupon {
            store: h.deps.store.clone(),
        };
        let ctx = ctx("SAVE10", expires_at, expires_at + Duration::seconds(1));

        let first = step.execute(&ctx).await.unwrap();
        let second = step.execute(&ctx).await.unwrap();

        assert_eq!(first["deleted"], true);
        assert_eq!(second["reason"], "absent");
        assert!(h.store.coupon("SAVE10").is_none());
    }

    #[tokio::test]
    async fn test_extended_coupon_is_kept() {
        let h = harness();
        let original_expiry = Utc::now();
        h.store.put_coupon(Coupon {
            code: "SAVE10".into(),
            expires_at: original_expiry + Duration::days(7),
        });
        let step = DeleteExpiredCoupon {
            store: h.deps.store.clone(),
        };

        let result = step
            .execute(&ctx("SAVE10", original_expiry, original_expiry))
            .await
            .unwrap();

        assert_eq!(result["reason"], "extended");
        assert!(h.store.coupon("SAVE10").is_some());
    }

    #[test]
    fn test_wake_time_comes_from_payload() {
        let expires_at = Utc::now() + Duration::hours(2);
        let event = Event::new(
            events::COUPON_EXPIRED,
            json!({ "code": "SAVE10", "expiresAt": expires_at }),
        );

        assert_eq!(expiry_time(&event).unwrap(), expires_at);
    }

    #[test]
    fn test_payload_requires_expiry() {
        let h = harness();
        let definition = definition(&h.deps).unwrap();

        assert!(definition.validate_payload(&json!({ "code": "SAVE10" })).is_err());
        assert!(definition
            .validate_payload(&json!({ "code": "SAVE10", "expiresAt": "not-a-date" }))
            .is_err());
    }
}
