//! Read-only access to organization signing secrets.
//!
//! Organizations are managed elsewhere; the pipeline only looks up the
//! current secret at delivery time so rotations take effect immediately.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::OrgId,
};

/// Repository for organization lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the organization's current signing secret.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` when the organization does not exist or
    /// has no secret configured.
    pub async fn signing_secret(&self, org_id: OrgId) -> Result<String> {
        let secret: Option<Option<String>> =
            sqlx::query_scalar("SELECT signing_secret FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&*self.pool)
                .await?;

        match secret {
            Some(Some(secret)) if !secret.is_empty() => Ok(secret),
            Some(_) => Err(CoreError::NotFound(format!(
                "organization {org_id} has no signing secret"
            ))),
            None => Err(CoreError::NotFound(format!("organization {org_id} not found"))),
        }
    }
}
