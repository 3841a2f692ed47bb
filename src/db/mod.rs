use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

use crate::error::{AppError, AppResult};

/// Database handle holding the primary pool and an optional read replica.
///
/// Writes always go to the primary. Reads that tolerate replica lag
/// (message history, search) use [`Db::reader`], which falls back to the
/// primary when no replica is configured.
#[derive(Clone)]
pub struct Db {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl Db {
    pub async fn connect(primary_url: &str, replica_url: Option<&str>) -> AppResult<Self> {
        info!("Connecting to primary database...");
        let primary = PgPoolOptions::new()
            .max_connections(100)
            .acquire_timeout(Duration::from_secs(5))
            .connect(primary_url)
            .await
            .map_err(|e| {
                tracing::error!(error = ?e, "Failed to connect to primary database");
                AppError::Database(e)
            })?;

        let replica = match replica_url {
            Some(url) => {
                info!("Connecting to replica database...");
                let pool = PgPoolOptions::new()
                    .max_connections(50)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(url)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = ?e, "Failed to connect to replica database");
                        AppError::Database(e)
                    })?;
                Some(pool)
            }
            None => None,
        };

        info!("Database connection pools created");
        Ok(Db { primary, replica })
    }

    /// Pool for writes and read-after-write consistency.
    pub fn writer(&self) -> &PgPool {
        &self.primary
    }

    /// Pool for lag-tolerant reads.
    pub fn reader(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    pub async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.primary)
            .await
            .map_err(AppError::Database)?;

        if let Some(replica) = &self.replica {
            sqlx::query("SELECT 1")
                .execute(replica)
                .await
                .map_err(AppError::Database)?;
        }

        Ok(())
    }

    /// Test constructor wrapping an existing pool as both writer and reader.
    pub fn from_pool(pool: PgPool) -> Self {
        Db {
            primary: pool,
            replica: None,
        }
    }
}
