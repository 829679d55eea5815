//! PostgreSQL storefront store
//!
//! Reads and writes the storefront's own tables (`"User"`, `"Store"`,
//! `"Product"`, `"Coupon"`, `"Order"`), whose quoted camel-case names come
//! from the storefront's ORM schema. Timestamps are stored without a time
//! zone, in UTC.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::instrument;

use super::{
    Account, AccountProfile, Coupon, DataStoreError, Order, Product, Store, StorefrontStore,
};

/// PostgreSQL implementation of [`StorefrontStore`]
#[derive(Clone)]
pub struct PgStorefrontStore {
    pool: PgPool,
}

impl PgStorefrontStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(err: sqlx::Error) -> DataStoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            DataStoreError::Unavailable(err.to_string())
        }
        other => DataStoreError::Database(other.to_string()),
    }
}

fn row_to_account(row: &PgRow) -> Result<Account, DataStoreError> {
    Ok(Account {
        id: row.try_get("id").map_err(db_error)?,
        email: row.try_get("email").map_err(db_error)?,
        name: row.try_get("name").map_err(db_error)?,
        image: row.try_get("image").map_err(db_error)?,
        cart: row
            .try_get::<Option<serde_json::Value>, _>("cart")
            .map_err(db_error)?
            .unwrap_or_else(|| serde_json::json!({})),
        // "User" keeps no cart timestamp; callers compare cart contents
        cart_updated_at: None,
    })
}

fn row_to_order(row: &PgRow) -> Result<Order, DataStoreError> {
    Ok(Order {
        id: row.try_get("id").map_err(db_error)?,
        user_id: row.try_get("userId").map_err(db_error)?,
        created_at: utc(row, "createdAt")?,
    })
}

fn row_to_store(row: &PgRow) -> Result<Store, DataStoreError> {
    Ok(Store {
        id: row.try_get("id").map_err(db_error)?,
        user_id: row.try_get("userId").map_err(db_error)?,
        name: row.try_get("name").map_err(db_error)?,
        email: row.try_get("email").map_err(db_error)?,
    })
}

fn row_to_product(row: &PgRow) -> Result<Product, DataStoreError> {
    Ok(Product {
        id: row.try_get("id").map_err(db_error)?,
        store_id: row.try_get("storeId").map_err(db_error)?,
        name: row.try_get("name").map_err(db_error)?,
        stock: row
            .try_get::<i32, _>("stock")
            .map(i64::from)
            .map_err(db_error)?,
    })
}

fn row_to_coupon(row: &PgRow) -> Result<Coupon, DataStoreError> {
    Ok(Coupon {
        code: row.try_get("code").map_err(db_error)?,
        expires_at: utc(row, "expiresAt")?,
    })
}

fn utc(row: &PgRow, column: &str) -> Result<DateTime<Utc>, DataStoreError> {
    row.try_get::<NaiveDateTime, _>(column)
        .map(|at| at.and_utc())
        .map_err(db_error)
}

#[async_trait]
impl StorefrontStore for PgStorefrontStore {
    #[instrument(skip(self))]
    async fn get_account(&self, id: &str) -> Result<Option<Account>, DataStoreError> {
        let row = sqlx::query(
            r#"SELECT id, email, name, image, cart FROM "User" WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(row_to_account).transpose()
    }

    #[instrument(skip(self, profile), fields(account_id = %profile.id))]
    async fn upsert_account(&self, profile: &AccountProfile) -> Result<(), DataStoreError> {
        sqlx::query(
            r#"
            INSERT INTO "User" (id, email, name, image, cart)
            VALUES ($1, $2, $3, $4, '{}'::jsonb)
            ON CONFLICT (id) DO UPDATE
            SET email = EXCLUDED.email, name = EXCLUDED.name, image = EXCLUDED.image
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.email)
        .bind(&profile.name)
        .bind(&profile.image)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_account(&self, id: &str) -> Result<bool, DataStoreError> {
        let result = sqlx::query(r#"DELETE FROM "User" WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn orders_for_account_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, DataStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, "userId", "createdAt" FROM "Order"
            WHERE "userId" = $1 AND "createdAt" >= $2
            ORDER BY "createdAt"
            "#,
        )
        .bind(user_id)
        .bind(since.naive_utc())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_order).collect()
    }

    #[instrument(skip(self))]
    async fn get_store(&self, id: &str) -> Result<Option<Store>, DataStoreError> {
        let row = sqlx::query(r#"SELECT id, "userId", name, email FROM "Store" WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(row_to_store).transpose()
    }

    #[instrument(skip(self))]
    async fn get_product(&self, id: &str) -> Result<Option<Product>, DataStoreError> {
        let row =
            sqlx::query(r#"SELECT id, "storeId", name, stock FROM "Product" WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.as_ref().map(row_to_product).transpose()
    }

    #[instrument(skip(self))]
    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, DataStoreError> {
        let row = sqlx::query(r#"SELECT code, "expiresAt" FROM "Coupon" WHERE code = $1"#)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(row_to_coupon).transpose()
    }

    #[instrument(skip(self))]
    async fn delete_coupon(&self, code: &str) -> Result<bool, DataStoreError> {
        let result = sqlx::query(r#"DELETE FROM "Coupon" WHERE code = $1"#)
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }
}
