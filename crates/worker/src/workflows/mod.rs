//! Storefront workflows
//!
//! | workflow | trigger | steps |
//! |---|---|---|
//! | `sync-account-create` | `app/account.created` | `upsert-account` |
//! | `sync-account-update` | `app/account.updated` | `upsert-account` |
//! | `sync-account-delete` | `app/account.deleted` | `delete-account` |
//! | `delete-coupon-on-expiry` | `app/coupon.expired` | `wait-for-expiry`, `delete-coupon` |
//! | `abandoned-cart-recovery` | `app/cart.updated` | `wait-24h`, `send-recovery-notification` |
//! | `low-stock-alert` | `app/product.stock_updated` | `notify-seller` |

pub mod abandoned_cart;
pub mod account_sync;
pub mod coupon_expiry;
pub mod low_stock;

use std::sync::Arc;
use std::time::Duration;

use storefront_durable::workflow::DefinitionError;
use storefront_durable::{RegistryError, WorkflowRegistry};

use crate::datastore::StorefrontStore;
use crate::notify::NotificationSink;

/// Event types the storefront publishes
pub mod events {
    pub const ACCOUNT_CREATED: &str = "app/account.created";
    pub const ACCOUNT_UPDATED: &str = "app/account.updated";
    pub const ACCOUNT_DELETED: &str = "app/account.deleted";
    pub const COUPON_EXPIRED: &str = "app/coupon.expired";
    pub const CART_UPDATED: &str = "app/cart.updated";
    pub const PRODUCT_STOCK_UPDATED: &str = "app/product.stock_updated";
}

/// Tunables for the storefront workflows
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSettings {
    /// How long a cart sits before the recovery notification
    pub abandoned_cart_delay: Duration,
    /// Stock below this (and above zero) is low
    pub low_stock_threshold: i64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            abandoned_cart_delay: Duration::from_secs(24 * 60 * 60),
            low_stock_threshold: 5,
        }
    }
}

/// What the workflow steps talk to
#[derive(Clone)]
pub struct WorkflowDeps {
    pub store: Arc<dyn StorefrontStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub settings: WorkflowSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Registry with every storefront workflow
pub fn registry(deps: &WorkflowDeps) -> Result<WorkflowRegistry, SetupError> {
    let mut registry = WorkflowRegistry::new();
    for definition in [
        account_sync::create_definition(deps)?,
        account_sync::update_definition(deps)?,
        account_sync::delete_definition(deps)?,
        coupon_expiry::definition(deps)?,
        abandoned_cart::definition(deps)?,
        low_stock::definition(deps)?,
    ] {
        registry.register(definition)?;
    }
    Ok(registry)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_wires_every_trigger() {
        let harness = test_support::harness();
        let registry = registry(&harness.deps).unwrap();

        assert_eq!(registry.len(), 6);
        for event_type in [
            events::ACCOUNT_CREATED,
            events::ACCOUNT_UPDATED,
            events::ACCOUNT_DELETED,
            events::COUPON_EXPIRED,
            events::CART_UPDATED,
            events::PRODUCT_STOCK_UPDATED,
        ] {
            assert_eq!(registry.matching(event_type).len(), 1, "{event_type}");
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = WorkflowSettings::default();
        assert_eq!(settings.abandoned_cart_delay, Duration::from_secs(86_400));
        assert_eq!(settings.low_stock_threshold, 5);
    }
}
