//! Shared fixtures for the unit tests.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use url::Url;
use wiremock::MockServer;

use crate::{
    config::{ACCOUNTING_SCOPE, QboConfig, QboEnvironment},
    domain::Connection,
    retry::RetryPolicy,
    transport::{DirectTransport, TokenTransport},
};

pub const REALM_ID: &str = "9130355377388706";

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        initial_delay: StdDuration::from_millis(1),
        max_delay: StdDuration::from_millis(2),
        multiplier: 2,
    }
}

/// A sandbox config whose Intuit endpoints all point at `mock_server`.
pub fn config_for(mock_server: &MockServer) -> QboConfig {
    let base = Url::parse(&mock_server.uri()).unwrap();
    QboConfig {
        environment: QboEnvironment::Sandbox,
        client_id: "client-id".to_string(),
        client_secret: Some("client-secret".to_string()),
        redirect_uri: Url::parse("https://app.buildledger.com/callback").unwrap(),
        auth_endpoint: base.join("/connect/oauth2").unwrap(),
        token_endpoint: base.join("/oauth2/v1/tokens/bearer").unwrap(),
        revoke_endpoint: base.join("/v2/oauth2/tokens/revoke").unwrap(),
        api_base_url: base,
        scopes: vec![ACCOUNTING_SCOPE.to_string()],
    }
}

pub fn direct_transport(mock_server: &MockServer) -> Arc<dyn TokenTransport> {
    Arc::new(
        DirectTransport::new(reqwest::Client::new(), &config_for(mock_server), fast_retry())
            .unwrap(),
    )
}

/// A connection issued at `issued_at` whose access token lasts `expires_in`
/// seconds and whose refresh token lasts 100 days.
pub fn connection(user_id: &str, issued_at: DateTime<Utc>, expires_in: i64) -> Connection {
    Connection {
        user_id: user_id.to_string(),
        realm_id: REALM_ID.to_string(),
        company_name: Some("Acme Builders".to_string()),
        token_type: "bearer".to_string(),
        access_token: "access-1".to_string(),
        refresh_token: "refresh-1".to_string(),
        access_token_expires_at: issued_at + Duration::seconds(expires_in),
        refresh_token_expires_at: issued_at + Duration::days(100),
        created_at: issued_at,
        updated_at: issued_at,
    }
}
