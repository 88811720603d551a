//! Database access for the Conveyor service
//!
//! Handles the PostgreSQL connection pool and schema migrations. The
//! database is the single source of truth for job state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::config::DatabaseSettings;

/// Database wrapper providing connection pool management
#[derive(Clone)]
pub struct Database {
    /// PostgreSQL connection pool
    pool: Arc<PgPool>,
}

impl Database {
    /// Connect to the database with the given settings
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        // Don't log the database URL as it may contain credentials
        info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(3600))
            .test_before_acquire(true)
            .connect(&settings.url)
            .await
            // Don't include URL in error message to prevent credential exposure
            .context("Failed to connect to database - check DATABASE_URL configuration")?;

        // Test connection
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("Failed to execute test query")?;

        info!("Database connection established");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get an Arc reference to the pool for sharing
    pub fn pool_arc(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    /// Health check
    pub async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&*self.pool).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                Ok(false)
            }
        }
    }

    /// Close the database connection pool gracefully
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

impl Database {
    /// Create a Database from an existing pool (for testing)
    pub fn from_pool(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

