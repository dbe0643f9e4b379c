//! Storage layer for the Unirep synchronizer.
//!
//! This module provides database operations for:
//! - Cursors (per-attester synchronization progress)
//! - Attesters and epochs
//! - Tree leaves (state, epoch and history trees)
//! - Records (sign ups, attestations, nullifiers)
//!
//! Mutations are associated functions taking a `&mut SqliteConnection` so
//! that every write for one event, and the cursor advance guarding it, run
//! on the same transaction.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod epoch;
pub mod leaves;
pub mod records;
pub mod sync;
pub mod types;

pub use types::*;

/// URL of the default, process-local store.
pub const MEMORY_URL: &str = "sqlite::memory:";

/// Database storage for the synchronizer.
///
/// Provides async access to SQLite database with connection pooling.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    ///
    /// This will create the database file if it doesn't exist. In-memory
    /// URLs always use a single, never-recycled connection so every handle
    /// sees the same database.
    ///
    /// # Example
    /// ```no_run
    /// # use unisync_indexer::storage::Storage;
    /// # async fn example() -> anyhow::Result<()> {
    /// let storage = Storage::new("sqlite://unirep.db", None, None).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true);

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(max_connections.unwrap_or(5))
                .min_connections(min_connections.unwrap_or(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Create a migrated in-memory store.
    pub async fn in_memory() -> Result<Self> {
        let storage = Self::new(MEMORY_URL, None, None).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create a new storage instance with a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let database_url = format!("sqlite://{}", path.display());
        Self::new(&database_url, None, None).await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Migrations completed successfully");

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a write transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(&pool)
                    .await
                    .with_context(|| format!("Failed to count {}", table))?;
                Ok::<u64, anyhow::Error>(n as u64)
            }
        };

        let cursors = self.list_cursors().await?;

        Ok(DatabaseStats {
            attester_count: count("attesters").await?,
            epoch_count: count("epochs").await?,
            state_tree_leaf_count: count("state_tree_leaves").await?,
            epoch_tree_leaf_count: count("epoch_tree_leaves").await?,
            user_signup_count: count("user_signups").await?,
            attestation_count: count("attestations").await?,
            nullifier_count: count("nullifiers").await?,
            history_tree_leaf_count: count("history_tree_leaves").await?,
            latest_complete_block: cursors
                .iter()
                .map(|c| c.latest_complete_block)
                .min()
                .flatten(),
        })
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        Ok(())
    }
}

/// Database statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Registered attesters
    pub attester_count: u64,

    /// Epoch rows (sealed and open)
    pub epoch_count: u64,

    /// State tree leaves
    pub state_tree_leaf_count: u64,

    /// Epoch tree leaves
    pub epoch_tree_leaf_count: u64,

    /// User sign ups
    pub user_signup_count: u64,

    /// Attestations
    pub attestation_count: u64,

    /// Consumed nullifiers
    pub nullifier_count: u64,

    /// History tree leaves
    pub history_tree_leaf_count: u64,

    /// Lowest complete block across cursors
    pub latest_complete_block: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_storage_creation() {
        let _temp_db = NamedTempFile::new().unwrap();
        let db_path = _temp_db.path();

        let storage = Storage::new_with_path(db_path).await.unwrap();
        storage.run_migrations().await.unwrap();

        storage.health_check().await.unwrap();

        storage.close().await;
    }

    #[tokio::test]
    async fn test_database_stats() {
        let storage = Storage::in_memory().await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats, DatabaseStats::default());

        storage.close().await;
    }

    #[tokio::test]
    async fn test_memory_store_is_shared_across_handles() {
        let storage = Storage::in_memory().await.unwrap();
        let clone = storage.clone();

        let mut tx = storage.begin().await.unwrap();
        Storage::upsert_attester(
            &mut tx,
            &AttesterRecord {
                attester_id: unisync_core::AttesterId::from(1u64),
                start_timestamp: 0,
                epoch_length: 10,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(clone.stats().await.unwrap().attester_count, 1);
    }
}
