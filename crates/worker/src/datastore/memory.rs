//! In-memory storefront store for tests and local runs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    Account, AccountProfile, Coupon, DataStoreError, Order, Product, Store, StorefrontStore,
};

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    stores: HashMap<String, Store>,
    products: HashMap<String, Product>,
    coupons: HashMap<String, Coupon>,
    orders: Vec<Order>,
}

/// In-memory implementation of [`StorefrontStore`]
///
/// `fail_next` makes the next calls return `Unavailable`, for exercising
/// retries.
#[derive(Default)]
pub struct InMemoryStorefrontStore {
    tables: RwLock<Tables>,
    failures: RwLock<u32>,
}

impl InMemoryStorefrontStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_account(&self, account: Account) {
        self.tables
            .write()
            .accounts
            .insert(account.id.clone(), account);
    }

    /// Replace an account's cart
    pub fn set_cart(&self, user_id: &str, cart: serde_json::Value, at: DateTime<Utc>) {
        if let Some(account) = self.tables.write().accounts.get_mut(user_id) {
            account.cart = cart;
            account.cart_updated_at = Some(at);
        }
    }

    pub fn put_store(&self, store: Store) {
        self.tables.write().stores.insert(store.id.clone(), store);
    }

    pub fn put_product(&self, product: Product) {
        self.tables
            .write()
            .products
            .insert(product.id.clone(), product);
    }

    pub fn put_coupon(&self, coupon: Coupon) {
        self.tables
            .write()
            .coupons
            .insert(coupon.code.clone(), coupon);
    }

    pub fn put_order(&self, order: Order) {
        self.tables.write().orders.push(order);
    }

    pub fn account(&self, id: &str) -> Option<Account> {
        self.tables.read().accounts.get(id).cloned()
    }

    pub fn coupon(&self, code: &str) -> Option<Coupon> {
        self.tables.read().coupons.get(code).cloned()
    }

    /// Fail the next `count` calls
    pub fn fail_next(&self, count: u32) {
        *self.failures.write() = count;
    }

    fn check_available(&self) -> Result<(), DataStoreError> {
        let mut failures = self.failures.write();
        if *failures > 0 {
            *failures -= 1;
            return Err(DataStoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorefrontStore for InMemoryStorefrontStore {
    async fn get_account(&self, id: &str) -> Result<Option<Account>, DataStoreError> {
        self.check_available()?;
        Ok(self.tables.read().accounts.get(id).cloned())
    }

    async fn upsert_account(&self, profile: &AccountProfile) -> Result<(), DataStoreError> {
        self.check_available()?;
        let mut tables = self.tables.write();
        match tables.accounts.get_mut(&profile.id) {
            Some(account) => {
                account.email = profile.email.clone();
                account.name = profile.name.clone();
                account.image = profile.image.clone();
            }
            None => {
                tables
                    .accounts
                    .insert(profile.id.clone(), Account::from_profile(profile.clone()));
            }
        }
        Ok(())
    }

    async fn delete_account(&self, id: &str) -> Result<bool, DataStoreError> {
        self.check_available()?;
        Ok(self.tables.write().accounts.remove(id).is_some())
    }

    async fn orders_for_account_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, DataStoreError> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .orders
            .iter()
            .filter(|o| o.user_id == user_id && o.created_at >= since)
            .cloned()
            .collect())
    }

    async fn get_store(&self, id: &str) -> Result<Option<Store>, DataStoreError> {
        self.check_available()?;
        Ok(self.tables.read().stores.get(id).cloned())
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>, DataStoreError> {
        self.check_available()?;
        Ok(self.tables.read().products.get(id).cloned())
    }

    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, DataStoreError> {
        self.check_available()?;
        Ok(self.tables.read().coupons.get(code).cloned())
    }

    async fn delete_coupon(&self, code: &str) -> Result<bool, DataStoreError> {
        self.check_available()?;
        Ok(self.tables.write().coupons.remove(code).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, email: &str) -> AccountProfile {
        AccountProfile {
            id: id.into(),
            email: email.into(),
            name: "Ada Lovelace".into(),
            image: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_cart() {
        let store = InMemoryStorefrontStore::new();
        store.upsert_account(&profile("u1", "old@example.com")).await.unwrap();
        store.set_cart("u1", serde_json::json!({ "productA": 2 }), Utc::now());

        store.upsert_account(&profile("u1", "new@example.com")).await.unwrap();

        let account = store.account("u1").unwrap();
        assert_eq!(account.email, "new@example.com");
        assert_eq!(account.cart_quantity(), 2);
    }

    #[tokio::test]
    async fn test_delete_reports_absence() {
        let store = InMemoryStorefrontStore::new();
        store.upsert_account(&profile("u1", "a@example.com")).await.unwrap();

        assert!(store.delete_account("u1").await.unwrap());
        assert!(!store.delete_account("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_orders_since_filters_by_user_and_time() {
        let store = InMemoryStorefrontStore::new();
        let now = Utc::now();
        store.put_order(Order {
            id: "o1".into(),
            user_id: "u1".into(),
            created_at: now - chrono::Duration::hours(2),
        });
        store.put_order(Order {
            id: "o2".into(),
            user_id: "u1".into(),
            created_at: now,
        });
        store.put_order(Order {
            id: "o3".into(),
            user_id: "u2".into(),
            created_at: now,
        });

        let orders = store
            .orders_for_account_since("u1", now - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "o2");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryStorefrontStore::new();
        store.fail_next(1);

        assert!(store.get_coupon("SAVE10").await.is_err());
        assert!(store.get_coupon("SAVE10").await.unwrap().is_none());
    }
}
