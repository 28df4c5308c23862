use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::QboConfig,
    csrf::{store_state, validate_state},
    db::Store,
    domain::{Connection, ConnectionStatus},
    error::QboError,
    quickbooks::{ApiClient, ApiResponse},
    tokens::TokenManager,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "realmId")]
    pub realm_id: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// The connection lifecycle: authorise, call back, use, refresh, disconnect.
pub struct QboService {
    pub config: Arc<QboConfig>,
    pub store: Arc<dyn Store>,
    pub tokens: Arc<TokenManager>,
    pub api: ApiClient,
}

impl QboService {
    pub async fn begin_authorization(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeResponse, QboError> {
        let auth_state = store_state(self.store.as_ref(), user_id, now).await?;
        let authorization_url = self.config.authorization_url(&auth_state.state);

        Ok(AuthorizeResponse {
            authorization_url: authorization_url.to_string(),
            state: auth_state.state,
        })
    }

    /// Handles the provider redirecting back. The state is validated before
    /// anything else, including a provider-reported error, so every callback
    /// burns its state.
    pub async fn complete_authorization(
        &self,
        params: CallbackParams,
        now: DateTime<Utc>,
    ) -> Result<Connection, QboError> {
        let auth_state = validate_state(self.store.as_ref(), params.state.as_deref(), now).await?;
        let user_id = auth_state.user_id;

        if let Some(error) = params.error {
            tracing::warn!(
                "Authorisation for user_id={} was refused: {} {:?}",
                &user_id,
                &error,
                &params.error_description
            );
            return Err(QboError::Provider {
                status: StatusCode::BAD_REQUEST.as_u16(),
                error: Some(error),
                description: params.error_description,
            });
        }

        let code = params
            .code
            .filter(|code| !code.is_empty())
            .ok_or(QboError::MissingCode)?;

        tracing::info!("Received authorisation code for user_id={}", &user_id);

        let tokens = self
            .tokens
            .transport()
            .exchange_code(&code, &self.config.redirect_uri)
            .await?;

        let realm_id = params
            .realm_id
            .filter(|realm_id| !realm_id.is_empty())
            .or_else(|| tokens.realm_id.clone())
            .ok_or(QboError::MissingRealmId)?;

        let mut connection = Connection::from_token_response(&user_id, &realm_id, None, tokens, now);

        match self.api.company_info(&connection).await {
            Ok(info) => connection.company_name = Some(info.company_name),
            Err(err) => tracing::warn!(
                "Could not fetch company info for realm_id={}, continuing without it: {}",
                &realm_id,
                err
            ),
        }

        self.store.upsert_connection(&connection).await?;

        tracing::info!(
            "Connected user_id={} to realm_id={}",
            &user_id,
            &connection.realm_id
        );

        Ok(connection)
    }

    pub async fn connection_status(&self, user_id: &str) -> Result<ConnectionStatus, QboError> {
        Ok(self
            .store
            .get_connection(user_id)
            .await?
            .as_ref()
            .map(ConnectionStatus::from)
            .unwrap_or_else(ConnectionStatus::disconnected))
    }

    /// Revokes the refresh token (best effort) and forgets the connection.
    pub async fn disconnect(&self, user_id: &str) -> Result<bool, QboError> {
        let Some(connection) = self.store.get_connection(user_id).await? else {
            return Ok(false);
        };

        if let Err(err) = self
            .tokens
            .transport()
            .revoke(&connection.refresh_token)
            .await
        {
            tracing::warn!("Failed to revoke token for user_id={}: {}", user_id, err);
        }

        let removed = self.store.delete_connection(user_id).await?;
        tracing::info!("Disconnected user_id={}", user_id);
        Ok(removed)
    }

    /// An authenticated accounting API call. A 401 triggers one forced
    /// refresh and one retry.
    pub async fn request(
        &self,
        user_id: &str,
        method: Method,
        endpoint: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<ApiResponse, QboError> {
        let connection = self.tokens.valid_connection(user_id, now).await?;
        let res = self
            .api
            .request(&connection, method.clone(), endpoint, query, body)
            .await?;

        if res.status != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        tracing::warn!(
            "QuickBooks rejected the access token for user_id={}, refreshing and retrying",
            user_id
        );

        let connection = self
            .tokens
            .force_refresh(user_id, &connection.access_token, now)
            .await?;
        self.api
            .request(&connection, method, endpoint, query, body)
            .await
    }
}
