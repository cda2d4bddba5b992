use super::{StoreError, SubscriberStore, run_migrations};
use crate::models::UserRecord;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicBool, Ordering};

/// PostgreSQL-backed subscriber cache.
pub struct PgSubscriberStore {
    pool: PgPool,
    acquired: AtomicBool,
}

impl PgSubscriberStore {
    /// Build a store without connecting; the first connection happens in `acquire`.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            acquired: AtomicBool::new(false),
        }
    }

    fn pool(&self) -> Result<&PgPool, StoreError> {
        if self.acquired.load(Ordering::Acquire) {
            Ok(&self.pool)
        } else {
            Err(StoreError::NotAcquired)
        }
    }
}

#[async_trait]
impl SubscriberStore for PgSubscriberStore {
    async fn acquire(&self) -> Result<(), StoreError> {
        run_migrations(&self.pool).await?;
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        self.acquired.store(true, Ordering::Release);
        log::info!("cache store connection acquired");
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        let records: Vec<UserRecord> = sqlx::query_as(
            r#"SELECT id, email, status, division, building, category
               FROM subscribers
               ORDER BY email COLLATE "C" ASC"#,
        )
        .fetch_all(self.pool()?)
        .await?;

        Ok(records)
    }

    async fn upsert(&self, record: &UserRecord) -> Result<(), StoreError> {
        let mut tx = self.pool()?.begin().await?;

        // A directory id change keeps the email; drop the stale row first.
        sqlx::query("DELETE FROM subscribers WHERE email = $1 AND id <> $2")
            .bind(&record.email)
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT INTO subscribers (id, email, status, division, building, category, synced_at)
               VALUES ($1, $2, $3, $4, $5, $6, NOW())
               ON CONFLICT (id) DO UPDATE SET
                   email = EXCLUDED.email,
                   status = EXCLUDED.status,
                   division = EXCLUDED.division,
                   building = EXCLUDED.building,
                   category = EXCLUDED.category,
                   synced_at = NOW()"#,
        )
        .bind(&record.id)
        .bind(&record.email)
        .bind(&record.status)
        .bind(&record.division)
        .bind(&record.building)
        .bind(&record.category)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM subscribers WHERE id = $1")
            .bind(id)
            .execute(self.pool()?)
            .await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM subscribers")
            .execute(self.pool()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn release(&self) {
        self.acquired.store(false, Ordering::Release);
        if !self.pool.is_closed() {
            self.pool.close().await;
            log::info!("cache store connection released");
        }
    }
}
