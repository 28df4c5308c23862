pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{AuthState, Connection, EntityReference};

pub use memory::MemoryStore;

/// Persistence for connections, pending authorisations and entity references.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_connection(&self, connection: &Connection) -> Result<(), sqlx::Error>;

    async fn get_connection(&self, user_id: &str) -> Result<Option<Connection>, sqlx::Error>;

    /// Returns whether a connection was removed.
    async fn delete_connection(&self, user_id: &str) -> Result<bool, sqlx::Error>;

    async fn query_connections_expiring_before(
        &self,
        expiry_time: DateTime<Utc>,
    ) -> Result<Vec<Connection>, sqlx::Error>;

    async fn insert_auth_state(&self, auth_state: &AuthState) -> Result<(), sqlx::Error>;

    /// Removes and returns the state in one step so it can only be used once.
    async fn take_auth_state(&self, state: &str) -> Result<Option<AuthState>, sqlx::Error>;

    async fn delete_expired_auth_states(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error>;

    async fn upsert_entity_reference(&self, reference: &EntityReference)
    -> Result<(), sqlx::Error>;

    async fn get_entity_reference(
        &self,
        local_id: &str,
        local_type: &str,
    ) -> Result<Option<EntityReference>, sqlx::Error>;
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPool::connect(database_url).await?;
    sqlx::migrate!().run(&pool).await?;
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_connection(&self, connection: &Connection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "
                INSERT INTO qbo_connections (
                    user_id,
                    realm_id,
                    company_name,
                    token_type,
                    access_token,
                    refresh_token,
                    access_token_expires_at,
                    refresh_token_expires_at,
                    created_at,
                    updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (user_id)
                DO UPDATE SET
                    realm_id = EXCLUDED.realm_id,
                    company_name = EXCLUDED.company_name,
                    token_type = EXCLUDED.token_type,
                    access_token = EXCLUDED.access_token,
                    refresh_token = EXCLUDED.refresh_token,
                    access_token_expires_at = EXCLUDED.access_token_expires_at,
                    refresh_token_expires_at = EXCLUDED.refresh_token_expires_at,
                    updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&connection.user_id)
        .bind(&connection.realm_id)
        .bind(&connection.company_name)
        .bind(&connection.token_type)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(connection.access_token_expires_at)
        .bind(connection.refresh_token_expires_at)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .execute(&self.pool)
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Failed to upsert connection user_id={}: {}",
                &connection.user_id,
                err
            );
        })?;
        Ok(())
    }

    async fn get_connection(&self, user_id: &str) -> Result<Option<Connection>, sqlx::Error> {
        sqlx::query_as::<_, Connection>(
            "
                SELECT * FROM qbo_connections
                WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn delete_connection(&self, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "
                DELETE FROM qbo_connections
                WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_connections_expiring_before(
        &self,
        expiry_time: DateTime<Utc>,
    ) -> Result<Vec<Connection>, sqlx::Error> {
        sqlx::query_as::<_, Connection>(
            "
                SELECT * FROM qbo_connections
                WHERE access_token_expires_at < $1
            ",
        )
        .bind(expiry_time)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_auth_state(&self, auth_state: &AuthState) -> Result<(), sqlx::Error> {
        sqlx::query(
            "
                INSERT INTO qbo_auth_states (
                    state,
                    user_id,
                    created_at,
                    expires_at
                ) VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(&auth_state.state)
        .bind(&auth_state.user_id)
        .bind(auth_state.created_at)
        .bind(auth_state.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_auth_state(&self, state: &str) -> Result<Option<AuthState>, sqlx::Error> {
        sqlx::query_as::<_, AuthState>(
            "
                DELETE FROM qbo_auth_states
                WHERE state = $1
                RETURNING *
            ",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
    }

    async fn delete_expired_auth_states(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "
                DELETE FROM qbo_auth_states
                WHERE expires_at <= $1
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_entity_reference(
        &self,
        reference: &EntityReference,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "
                INSERT INTO qbo_entity_references (
                    local_id,
                    local_type,
                    realm_id,
                    qbo_entity,
                    qbo_id,
                    sync_token,
                    created_at,
                    updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (local_id, local_type)
                DO UPDATE SET
                    realm_id = EXCLUDED.realm_id,
                    qbo_entity = EXCLUDED.qbo_entity,
                    qbo_id = EXCLUDED.qbo_id,
                    sync_token = EXCLUDED.sync_token,
                    updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&reference.local_id)
        .bind(&reference.local_type)
        .bind(&reference.realm_id)
        .bind(&reference.qbo_entity)
        .bind(&reference.qbo_id)
        .bind(&reference.sync_token)
        .bind(reference.created_at)
        .bind(reference.updated_at)
        .execute(&self.pool)
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Failed to upsert entity reference local_id={} local_type={}: {}",
                &reference.local_id,
                &reference.local_type,
                err
            );
        })?;
        Ok(())
    }

    async fn get_entity_reference(
        &self,
        local_id: &str,
        local_type: &str,
    ) -> Result<Option<EntityReference>, sqlx::Error> {
        sqlx::query_as::<_, EntityReference>(
            "
                SELECT * FROM qbo_entity_references
                WHERE local_id = $1 AND local_type = $2
            ",
        )
        .bind(local_id)
        .bind(local_type)
        .fetch_optional(&self.pool)
        .await
    }
}
