use log::LevelFilter;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use testcontainers::{GenericImage, ImageExt, core::WaitFor};
use testcontainers_modules::testcontainers::{
    ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
};
use thiserror::Error;
use tokio::runtime::Handle;
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum TestDatabaseError {
    #[error("TEST_DATABASE_URL not set")]
    MissingUrl,
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("container error: {0}")]
    Container(#[from] TestcontainersError),
}

impl TestDatabaseError {
    /// No database reachable in this environment; callers skip the test.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TestDatabaseError::MissingUrl | TestDatabaseError::Container(_)
        )
    }
}

/// Ephemeral, migrated database for cache store tests.
pub struct TestDatabase {
    pool: Option<PgPool>,
    admin_options: PgConnectOptions,
    database_name: String,
    container: Option<ContainerAsync<GenericImage>>,
}

impl TestDatabase {
    /// Use `TEST_DATABASE_URL` when set, otherwise start a disposable container.
    pub async fn new() -> Result<Self, TestDatabaseError> {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new_from_url(&url, None).await,
            _ => Self::new_from_container().await,
        }
    }

    /// Require `TEST_DATABASE_URL`.
    pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
        let url = std::env::var("TEST_DATABASE_URL").map_err(|_| TestDatabaseError::MissingUrl)?;
        Self::new_from_url(&url, None).await
    }

    async fn new_from_container() -> Result<Self, TestDatabaseError> {
        let image = GenericImage::new("postgres", "16-alpine")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ));

        let container = image
            .with_env_var("POSTGRES_DB", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;
        let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        Self::new_from_url(&admin_url, Some(container)).await
    }

    async fn new_from_url(
        url: &str,
        container: Option<ContainerAsync<GenericImage>>,
    ) -> Result<Self, TestDatabaseError> {
        let base_options: PgConnectOptions = url.parse()?;
        let base_options = base_options.log_statements(LevelFilter::Off);
        let base_name = base_options
            .get_database()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "postgres".to_string());

        let admin_options = base_options.clone().database("postgres");
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(admin_options.clone())
            .await?;

        let database_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
        sqlx::query(&format!(
            "CREATE DATABASE \"{}\" TEMPLATE template0",
            database_name
        ))
        .execute(&admin_pool)
        .await?;
        admin_pool.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(base_options.database(&database_name))
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool: Some(pool),
            admin_options,
            database_name,
            container,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.pool.as_ref().expect("test database pool is available")
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool().clone()
    }

    /// Close pool connections and drop the ephemeral database.
    pub async fn close(mut self) -> Result<(), TestDatabaseError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }

        drop_database(self.admin_options.clone(), &self.database_name).await?;

        if let Some(container) = self.container.take() {
            drop(container);
        }

        Ok(())
    }
}

async fn drop_database(
    admin_options: PgConnectOptions,
    database_name: &str,
) -> Result<(), sqlx::Error> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(admin_options)
        .await?;

    sqlx::query(&format!(
        "DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)",
        database_name
    ))
    .execute(&admin_pool)
    .await?;
    Ok(())
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let admin_options = self.admin_options.clone();
            let database_name = self.database_name.clone();
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    pool.close().await;
                    let _ = drop_database(admin_options, &database_name).await;
                });
            }
        }

        if let Some(container) = self.container.take() {
            drop(container);
        }
    }
}
