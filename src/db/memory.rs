//! In-process [`Store`] used by the tests and when no database is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::Store;
use crate::domain::{AuthState, Connection, EntityReference};

#[derive(Default)]
pub struct MemoryStore {
    connections: Mutex<HashMap<String, Connection>>,
    auth_states: Mutex<HashMap<String, AuthState>>,
    references: Mutex<HashMap<(String, String), EntityReference>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_connection(&self, connection: &Connection) -> Result<(), sqlx::Error> {
        let mut connections = self.connections.lock().await;
        let created_at = connections
            .get(&connection.user_id)
            .map(|existing| existing.created_at)
            .unwrap_or(connection.created_at);
        let mut connection = connection.clone();
        connection.created_at = created_at;
        connections.insert(connection.user_id.clone(), connection);
        Ok(())
    }

    async fn get_connection(&self, user_id: &str) -> Result<Option<Connection>, sqlx::Error> {
        Ok(self.connections.lock().await.get(user_id).cloned())
    }

    async fn delete_connection(&self, user_id: &str) -> Result<bool, sqlx::Error> {
        Ok(self.connections.lock().await.remove(user_id).is_some())
    }

    async fn query_connections_expiring_before(
        &self,
        expiry_time: DateTime<Utc>,
    ) -> Result<Vec<Connection>, sqlx::Error> {
        Ok(self
            .connections
            .lock()
            .await
            .values()
            .filter(|connection| connection.access_token_expires_at < expiry_time)
            .cloned()
            .collect())
    }

    async fn insert_auth_state(&self, auth_state: &AuthState) -> Result<(), sqlx::Error> {
        self.auth_states
            .lock()
            .await
            .insert(auth_state.state.clone(), auth_state.clone());
        Ok(())
    }

    async fn take_auth_state(&self, state: &str) -> Result<Option<AuthState>, sqlx::Error> {
        Ok(self.auth_states.lock().await.remove(state))
    }

    async fn delete_expired_auth_states(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let mut auth_states = self.auth_states.lock().await;
        let before = auth_states.len();
        auth_states.retain(|_, auth_state| !auth_state.is_expired(now));
        Ok((before - auth_states.len()) as u64)
    }

    async fn upsert_entity_reference(
        &self,
        reference: &EntityReference,
    ) -> Result<(), sqlx::Error> {
        let key = (reference.local_id.clone(), reference.local_type.clone());
        let mut references = self.references.lock().await;
        let created_at = references
            .get(&key)
            .map(|existing| existing.created_at)
            .unwrap_or(reference.created_at);
        let mut reference = reference.clone();
        reference.created_at = created_at;
        references.insert(key, reference);
        Ok(())
    }

    async fn get_entity_reference(
        &self,
        local_id: &str,
        local_type: &str,
    ) -> Result<Option<EntityReference>, sqlx::Error> {
        Ok(self
            .references
            .lock()
            .await
            .get(&(local_id.to_string(), local_type.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_utils::connection;

    #[tokio::test]
    async fn upsert_then_get_round_trips_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_connection(&connection("user-1", now, 3600))
            .await
            .unwrap();

        let stored = store.get_connection("user-1").await.unwrap().unwrap();
        let drift = stored.access_token_expires_at - (Utc::now() + Duration::seconds(3600));
        assert!(drift.num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn upsert_keeps_one_connection_per_user() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_connection(&connection("user-1", now, 3600))
            .await
            .unwrap();

        let mut replacement = connection("user-1", now + Duration::minutes(30), 3600);
        replacement.access_token = "access-2".to_string();
        store.upsert_connection(&replacement).await.unwrap();

        let stored = store.get_connection("user-1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-2");
        assert_eq!(stored.created_at, now);
        assert_eq!(
            store
                .query_connections_expiring_before(now + Duration::days(1))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn delete_removes_connection() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_connection(&connection("user-1", now, 3600))
            .await
            .unwrap();

        assert!(store.delete_connection("user-1").await.unwrap());
        assert!(store.get_connection("user-1").await.unwrap().is_none());
        assert!(!store.delete_connection("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn auth_state_is_taken_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_auth_state(&AuthState::new("abc123".to_string(), "user-1", now))
            .await
            .unwrap();

        assert!(store.take_auth_state("abc123").await.unwrap().is_some());
        assert!(store.take_auth_state("abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_auth_states_are_purged() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_auth_state(&AuthState::new("old".to_string(), "user-1", now - Duration::minutes(20)))
            .await
            .unwrap();
        store
            .insert_auth_state(&AuthState::new("fresh".to_string(), "user-1", now))
            .await
            .unwrap();

        assert_eq!(store.delete_expired_auth_states(now).await.unwrap(), 1);
        assert!(store.take_auth_state("fresh").await.unwrap().is_some());
    }
}
