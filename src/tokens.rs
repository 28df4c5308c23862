use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::{db::Store, domain::Connection, error::QboError, transport::TokenTransport};

/// Access tokens this close to expiry are refreshed before use.
pub const ACCESS_TOKEN_SKEW_MINUTES: i64 = 5;

/// Hands out usable access tokens, refreshing them when needed.
///
/// Refreshes for one user are serialised: a caller that waited on another
/// caller's refresh re-reads the store and reuses the new token instead of
/// refreshing again.
pub struct TokenManager {
    store: Arc<dyn Store>,
    transport: Arc<dyn TokenTransport>,
    skew: Duration,
    refresh_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn TokenTransport>) -> Self {
        TokenManager {
            store,
            transport,
            skew: Duration::minutes(ACCESS_TOKEN_SKEW_MINUTES),
            refresh_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn TokenTransport> {
        &self.transport
    }

    fn refresh_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the user's lock from the map once nobody else holds or waits on
    /// it, so the map only holds users with a refresh in flight.
    fn release_lock(&self, user_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(user_id);
        }
    }

    async fn stored_connection(&self, user_id: &str) -> Result<Connection, QboError> {
        self.store
            .get_connection(user_id)
            .await?
            .ok_or_else(|| QboError::NotConnected(user_id.to_string()))
    }

    /// Returns a connection whose access token is good for at least the skew
    /// window, refreshing it first if necessary.
    pub async fn valid_connection(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Connection, QboError> {
        let connection = self.stored_connection(user_id).await?;
        if !connection.access_token_needs_refresh(now, self.skew) {
            return Ok(connection);
        }

        let lock = self.refresh_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            self.refresh_if_stale(user_id, now).await
        };
        self.release_lock(user_id, lock);
        result
    }

    async fn refresh_if_stale(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Connection, QboError> {
        // Someone else may have refreshed while we waited.
        let connection = self.stored_connection(user_id).await?;
        if !connection.access_token_needs_refresh(now, self.skew) {
            tracing::debug!("Reusing token refreshed concurrently for user_id={}", user_id);
            return Ok(connection);
        }

        self.refresh(connection, now).await
    }

    /// Refreshes regardless of the stored expiry, e.g. after the API rejected
    /// the token. A token that changed since `stale_access_token` was read is
    /// returned without another refresh.
    pub async fn force_refresh(
        &self,
        user_id: &str,
        stale_access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Connection, QboError> {
        let lock = self.refresh_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            match self.stored_connection(user_id).await {
                Ok(connection) if connection.access_token != stale_access_token => Ok(connection),
                Ok(connection) => self.refresh(connection, now).await,
                Err(err) => Err(err),
            }
        };
        self.release_lock(user_id, lock);
        result
    }

    async fn refresh(
        &self,
        connection: Connection,
        now: DateTime<Utc>,
    ) -> Result<Connection, QboError> {
        let user_id = connection.user_id.clone();

        if connection.refresh_token_expired(now) {
            tracing::warn!(
                "Refresh token for user_id={} expired at {}, removing connection",
                &user_id,
                connection.refresh_token_expires_at
            );
            self.store.delete_connection(&user_id).await?;
            return Err(QboError::ReauthRequired);
        }

        tracing::info!("Refreshing token for user_id={}", &user_id);

        let tokens = match self.transport.refresh(&connection.refresh_token).await {
            Ok(tokens) => tokens,
            Err(err) if err.is_rejection() => {
                tracing::warn!(
                    "QuickBooks rejected refresh for user_id={}, removing connection: {}",
                    &user_id,
                    err
                );
                self.store.delete_connection(&user_id).await?;
                return Err(QboError::ReauthRequired);
            }
            Err(err) => {
                tracing::error!("Failed to refresh token for user_id={}: {}", &user_id, err);
                return Err(err);
            }
        };

        let connection = connection.with_refreshed_tokens(tokens, now);
        self.store.upsert_connection(&connection).await?;

        tracing::info!(
            "Successfully refreshed token for user_id={}, expires at {}",
            &user_id,
            connection.access_token_expires_at
        );

        Ok(connection)
    }
}
