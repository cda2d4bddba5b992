//! Local snapshot of previously synchronized subscribers.
//!
//! The store is a single shared handle per run: `acquire` once before the
//! first read, `release` once on every exit path.

pub mod migration;
pub mod postgres;

pub use migration::run_migrations;
pub use postgres::PgSubscriberStore;

use crate::models::UserRecord;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store connection was not acquired")]
    NotAcquired,
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Open and verify the connection.
    async fn acquire(&self) -> Result<(), StoreError>;

    /// Every cached record, ascending by email in byte order.
    async fn find_all(&self) -> Result<Vec<UserRecord>, StoreError>;

    /// Insert or replace the row keyed by `record.id`.
    async fn upsert(&self, record: &UserRecord) -> Result<(), StoreError>;

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;

    /// Remove every row, returning how many were removed.
    async fn delete_all(&self) -> Result<u64, StoreError>;

    /// Close the connection. Calling it more than once is harmless.
    async fn release(&self);
}
