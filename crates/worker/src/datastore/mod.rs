//! Storefront data store contract
//!
//! The narrow read/write surface the workflows need from the storefront's
//! relational store. Steps read current state through it immediately before
//! acting, never trusting the trigger event alone.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storefront_durable::StepError;

pub use memory::InMemoryStorefrontStore;
pub use postgres::PgStorefrontStore;

/// Profile fields mirrored from the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub image: Option<String>,
}

/// A storefront account with its current cart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub name: String,
    pub image: Option<String>,
    /// Product id → quantity
    pub cart: serde_json::Value,
    /// Last cart change, when the backing store tracks one (the storefront's
    /// `"User"` table does not)
    pub cart_updated_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn from_profile(profile: AccountProfile) -> Self {
        Self {
            id: profile.id,
            email: profile.email,
            name: profile.name,
            image: profile.image,
            cart: serde_json::json!({}),
            cart_updated_at: None,
        }
    }

    /// Total quantity across cart lines
    pub fn cart_quantity(&self) -> u64 {
        cart_quantity(&self.cart)
    }
}

/// Total quantity in a `{ productId: quantity }` cart
///
/// Lines with a non-numeric quantity count as one item.
pub fn cart_quantity(cart: &serde_json::Value) -> u64 {
    match cart.as_object() {
        Some(lines) => lines
            .values()
            .map(|qty| match qty {
                serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
                serde_json::Value::Null => 0,
                _ => 1,
            })
            .sum(),
        None => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub store_id: String,
    pub name: String,
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Data store errors
///
/// All of these are assumed transient: the step that hit one is retried.
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("data store unavailable: {0}")]
    Unavailable(String),
}

impl From<DataStoreError> for StepError {
    fn from(err: DataStoreError) -> Self {
        StepError::retryable(err.to_string()).with_type("DATA_STORE")
    }
}

/// Read/write contract with the storefront's relational store
#[async_trait]
pub trait StorefrontStore: Send + Sync + 'static {
    // =========================================================================
    // Accounts
    // =========================================================================

    async fn get_account(&self, id: &str) -> Result<Option<Account>, DataStoreError>;

    /// Insert or update profile fields; the cart is left untouched
    async fn upsert_account(&self, profile: &AccountProfile) -> Result<(), DataStoreError>;

    /// Returns `false` if the account was already gone
    async fn delete_account(&self, id: &str) -> Result<bool, DataStoreError>;

    /// Orders placed by `user_id` at or after `since`
    async fn orders_for_account_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, DataStoreError>;

    // =========================================================================
    // Catalog
    // =========================================================================

    async fn get_store(&self, id: &str) -> Result<Option<Store>, DataStoreError>;

    async fn get_product(&self, id: &str) -> Result<Option<Product>, DataStoreError>;

    // =========================================================================
    // Coupons
    // =========================================================================

    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, DataStoreError>;

    /// Returns `false` if the coupon was already gone
    async fn delete_coupon(&self, code: &str) -> Result<bool, DataStoreError>;
}
