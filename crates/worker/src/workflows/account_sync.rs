//! Account sync: mirror identity-provider accounts into the storefront

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use storefront_durable::workflow::DefinitionError;
use storefront_durable::{StepContext, StepError, StepExecutor, WorkflowDefinition};
use tracing::{debug, info};

use super::{events, WorkflowDeps};
use crate::datastore::{AccountProfile, StorefrontStore};

/// `app/account.created` / `app/account.updated` payload
#[derive(Debug, Clone, Deserialize)]
pub struct AccountPayload {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl From<AccountPayload> for AccountProfile {
    fn from(payload: AccountPayload) -> Self {
        Self {
            id: payload.id,
            email: payload.email,
            name: payload.name,
            image: payload.image,
        }
    }
}

/// `app/account.deleted` payload
#[derive(Debug, Clone, Deserialize)]
pub struct AccountDeletedPayload {
    pub id: String,
}

pub struct UpsertAccount {
    store: Arc<dyn StorefrontStore>,
}

#[async_trait]
impl StepExecutor for UpsertAccount {
    async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
        let payload: AccountPayload = ctx.payload()?;
        let profile = AccountProfile::from(payload);

        self.store.upsert_account(&profile).await?;
        debug!(account_id = %profile.id, "account upserted");
        Ok(json!({ "account_id": profile.id }))
    }
}

pub struct DeleteAccount {
    store: Arc<dyn StorefrontStore>,
}

#[async_trait]
impl StepExecutor for DeleteAccount {
    async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
        let payload: AccountDeletedPayload = ctx.payload()?;

        let deleted = self.store.delete_account(&payload.id).await?;
        if deleted {
            info!(account_id = %payload.id, "account deleted");
        } else {
            debug!(account_id = %payload.id, "account already absent");
        }
        Ok(json!({ "account_id": payload.id, "deleted": deleted }))
    }
}

pub fn create_definition(deps: &WorkflowDeps) -> Result<WorkflowDefinition, DefinitionError> {
    upsert_definition("sync-account-create", events::ACCOUNT_CREATED, deps)
}

pub fn update_definition(deps: &WorkflowDeps) -> Result<WorkflowDefinition, DefinitionError> {
    upsert_definition("sync-account-update", events::ACCOUNT_UPDATED, deps)
}

fn upsert_definition(
    id: &str,
    trigger: &str,
    deps: &WorkflowDeps,
) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder(id, trigger)
        .payload::<AccountPayload>()
        .run(
            "upsert-account",
            UpsertAccount {
                store: Arc::clone(&deps.store),
            },
        )
        .build()
}

pub fn delete_definition(deps: &WorkflowDeps) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder("sync-account-delete", events::ACCOUNT_DELETED)
        .payload::<AccountDeletedPayload>()
        .run(
            "delete-account",
            DeleteAccount {
                store: Arc::clone(&deps.store),
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Account;
    use crate::workflows::test_support::harness;
    use storefront_durable::Event;
    use uuid::Uuid;

    fn ctx(event_type: &str, payload: serde_json::Value) -> StepContext {
        StepContext::new(
            Uuid::now_v7(),
            "sync-account",
            "step",
            Event::new(event_type, payload),
        )
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let h = harness();
        let step = UpsertAccount {
            store: h.deps.store.clone(),
        };

        step.execute(&ctx(
            events::ACCOUNT_CREATED,
            json!({ "id": "u1", "email": "ada@example.com", "name": "Ada", "image": null }),
        ))
        .await
        .unwrap();
        step.execute(&ctx(
            events::ACCOUNT_UPDATED,
            json!({ "id": "u1", "email": "ada@lovelace.dev", "name": "Ada L.", "image": "https://img/ada.png" }),
        ))
        .await
        .unwrap();

        let account = h.store.account("u1").unwrap();
        assert_eq!(account.email, "ada@lovelace.dev");
        assert_eq!(account.image.as_deref(), Some("https://img/ada.png"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let h = harness();
        h.store.put_account(Account::from_profile(AccountProfile {
            id: "u1".into(),
            email: "ada@example.com".into(),
            name: "Ada".into(),
            image: None,
        }));
        let step = DeleteAccount {
            store: h.deps.store.clone(),
        };
        let ctx = ctx(events::ACCOUNT_DELETED, json!({ "id": "u1" }));

        let first = step.execute(&ctx).await.unwrap();
        let second = step.execute(&ctx).await.unwrap();

        assert_eq!(first["deleted"], true);
        assert_eq!(second["deleted"], false);
        assert!(h.store.account("u1").is_none());
    }

    #[tokio::test]
    async fn test_data_store_outage_is_retryable() {
        let h = harness();
        h.store.fail_next(1);
        let step = DeleteAccount {
            store: h.deps.store.clone(),
        };

        let err = step
            .execute(&ctx(events::ACCOUNT_DELETED, json!({ "id": "u1" })))
            .await
            .unwrap_err();

        assert!(err.retryable);
    }

    #[test]
    fn test_payload_schema() {
        let h = harness();
        let definition = create_definition(&h.deps).unwrap();

        assert!(definition
            .validate_payload(&json!({ "id": "u1", "email": "a@example.com", "name": "A" }))
            .is_ok());
        assert!(definition.validate_payload(&json!({ "id": "u1" })).is_err());
    }
}
