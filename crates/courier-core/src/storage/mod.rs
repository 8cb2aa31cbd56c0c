//! PostgreSQL persistence using the repository pattern.
//!
//! Each table has a repository owning its SQL. Code outside this module never
//! writes queries against these tables directly.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_attempts;
pub mod messages;
pub mod organizations;
pub mod schema;

use crate::error::Result;

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Message lifecycle rows.
    pub messages: Arc<messages::Repository>,

    /// Delivery attempt audit trail.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Organization secret lookups.
    pub organizations: Arc<organizations::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            messages: Arc::new(messages::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            organizations: Arc::new(organizations::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Shared pool, for components that manage their own tables.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}
