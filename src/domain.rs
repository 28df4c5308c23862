use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::TokenResponse;

/// Lifetime of a CSRF state token between authorisation and callback.
pub const AUTH_STATE_TTL_MINUTES: i64 = 10;

/// A user's QuickBooks connection. At most one per user.
#[derive(sqlx::FromRow, Clone, Debug)]
pub struct Connection {
    pub user_id: String,
    pub realm_id: String,
    pub company_name: Option<String>,
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn from_token_response(
        user_id: &str,
        realm_id: &str,
        company_name: Option<String>,
        tokens: TokenResponse,
        now: DateTime<Utc>,
    ) -> Self {
        Connection {
            user_id: user_id.to_string(),
            realm_id: realm_id.to_string(),
            company_name,
            token_type: tokens.token_type,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_token_expires_at: future_datetime_from_seconds(now, tokens.expires_in),
            refresh_token_expires_at: future_datetime_from_seconds(
                now,
                tokens.refresh_token_expires_in,
            ),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrites both tokens and both expiries after a refresh.
    pub fn with_refreshed_tokens(mut self, tokens: TokenResponse, now: DateTime<Utc>) -> Self {
        self.token_type = tokens.token_type;
        self.access_token = tokens.access_token;
        self.refresh_token = tokens.refresh_token;
        self.access_token_expires_at = future_datetime_from_seconds(now, tokens.expires_in);
        self.refresh_token_expires_at =
            future_datetime_from_seconds(now, tokens.refresh_token_expires_in);
        self.updated_at = now;
        self
    }

    pub fn access_token_needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now >= self.access_token_expires_at - skew
    }

    pub fn refresh_token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_token_expires_at
    }
}

/// What the API exposes about a connection. Tokens never leave the service.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub realm_id: Option<String>,
    pub company_name: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        ConnectionStatus {
            connected: false,
            realm_id: None,
            company_name: None,
            access_token_expires_at: None,
            refresh_token_expires_at: None,
        }
    }
}

impl From<&Connection> for ConnectionStatus {
    fn from(connection: &Connection) -> Self {
        ConnectionStatus {
            connected: true,
            realm_id: Some(connection.realm_id.clone()),
            company_name: connection.company_name.clone(),
            access_token_expires_at: Some(connection.access_token_expires_at),
            refresh_token_expires_at: Some(connection.refresh_token_expires_at),
        }
    }
}

#[derive(sqlx::FromRow, Clone, Debug, PartialEq)]
pub struct AuthState {
    pub state: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthState {
    pub fn new(state: String, user_id: &str, now: DateTime<Utc>) -> Self {
        AuthState {
            state,
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(AUTH_STATE_TTL_MINUTES),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Local record types that can be mirrored into QuickBooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalEntityType {
    Expense,
    Client,
    Invoice,
    Vendor,
    Payment,
}

impl LocalEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalEntityType::Expense => "expense",
            LocalEntityType::Client => "client",
            LocalEntityType::Invoice => "invoice",
            LocalEntityType::Vendor => "vendor",
            LocalEntityType::Payment => "payment",
        }
    }
}

/// Maps a local record to its QuickBooks counterpart. Unique per
/// `(local_id, local_type)`.
#[derive(sqlx::FromRow, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntityReference {
    pub local_id: String,
    pub local_type: String,
    pub realm_id: String,
    pub qbo_entity: String,
    pub qbo_id: String,
    pub sync_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Token lifetimes beyond this are clamped so the arithmetic can't overflow.
const MAX_LIFETIME_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

pub fn future_datetime_from_seconds(now: DateTime<Utc>, duration_in_seconds: u64) -> DateTime<Utc> {
    let seconds = i64::try_from(duration_in_seconds)
        .unwrap_or(MAX_LIFETIME_SECONDS)
        .min(MAX_LIFETIME_SECONDS);
    now + Duration::seconds(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_in: u64, refresh_expires_in: u64) -> TokenResponse {
        TokenResponse {
            access_token: "at-secret-value".to_string(),
            refresh_token: "rt-secret-value".to_string(),
            token_type: "bearer".to_string(),
            expires_in,
            refresh_token_expires_in: refresh_expires_in,
            realm_id: None,
        }
    }

    #[test]
    fn expiries_are_absolute_from_now() {
        let now = Utc::now();
        let connection =
            Connection::from_token_response("user-1", "realm-1", None, tokens(3600, 8_726_400), now);

        assert_eq!(connection.access_token_expires_at, now + Duration::seconds(3600));
        assert_eq!(
            connection.refresh_token_expires_at,
            now + Duration::seconds(8_726_400)
        );
    }

    #[test]
    fn needs_refresh_within_skew() {
        let now = Utc::now();
        let connection =
            Connection::from_token_response("user-1", "realm-1", None, tokens(600, 86_400), now);
        let skew = Duration::minutes(5);

        assert!(!connection.access_token_needs_refresh(now, skew));
        assert!(!connection.access_token_needs_refresh(now + Duration::seconds(299), skew));
        assert!(connection.access_token_needs_refresh(now + Duration::seconds(300), skew));
        assert!(!connection.refresh_token_expired(now + Duration::seconds(86_399)));
        assert!(connection.refresh_token_expired(now + Duration::seconds(86_400)));
    }

    #[test]
    fn status_hides_tokens() {
        let now = Utc::now();
        let connection = Connection::from_token_response(
            "user-1",
            "realm-1",
            Some("Acme Builders".to_string()),
            tokens(3600, 86_400),
            now,
        );
        let json = serde_json::to_string(&ConnectionStatus::from(&connection)).unwrap();

        assert!(json.contains("Acme Builders"));
        assert!(!json.contains("at-secret-value"));
        assert!(!json.contains("rt-secret-value"));
    }

    #[test]
    fn auth_state_expires_after_ten_minutes() {
        let now = Utc::now();
        let state = AuthState::new("abc123".to_string(), "user-1", now);

        assert!(!state.is_expired(now + Duration::minutes(9)));
        assert!(state.is_expired(now + Duration::minutes(10)));
    }
}
