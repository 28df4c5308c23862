use crate::config::ConfigError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Why a callback's `state` parameter was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state parameter missing from callback")]
    Missing,

    /// Never issued, already consumed, or tampered with.
    #[error("state parameter does not match any pending authorisation")]
    Unknown,

    #[error("state parameter has expired")]
    Expired,
}

#[derive(Debug, thiserror::Error)]
pub enum QboError {
    #[error("request to QuickBooks failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-2xx status.
    #[error("QuickBooks returned HTTP {status}: {}", describe(.error, .description))]
    Provider {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },

    #[error("token response did not contain an access token")]
    MissingAccessToken,

    #[error("callback did not carry an authorisation code")]
    MissingCode,

    #[error("callback did not identify a QuickBooks company")]
    MissingRealmId,

    #[error("no QuickBooks connection for user_id={0}")]
    NotConnected(String),

    #[error("QuickBooks authorisation has expired, the user must reconnect")]
    ReauthRequired,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unexpected response from QuickBooks: {0}")]
    UnexpectedResponse(String),
}

fn describe(error: &Option<String>, description: &Option<String>) -> String {
    description
        .as_deref()
        .or(error.as_deref())
        .unwrap_or("no error description")
        .to_string()
}

impl QboError {
    /// A 4xx from the provider: retrying the same request won't help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, QboError::Provider { status, .. } if (400..500).contains(status))
    }
}

/// Anything that stops the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not prepare the database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("could not build the HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not serve: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Qbo(#[from] QboError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Qbo(QboError::Database(err))
    }
}

impl From<StateError> for AppError {
    fn from(err: StateError) -> Self {
        AppError::Qbo(QboError::State(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Qbo(err) => match err {
                QboError::State(_) | QboError::MissingCode | QboError::MissingRealmId => {
                    StatusCode::BAD_REQUEST
                }
                QboError::NotConnected(_) => StatusCode::NOT_FOUND,
                QboError::ReauthRequired => StatusCode::UNAUTHORIZED,
                QboError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
                QboError::Http(_)
                | QboError::Provider { .. }
                | QboError::MissingAccessToken
                | QboError::UnexpectedResponse(_) => StatusCode::BAD_GATEWAY,
            },
        };

        let message = match &self {
            AppError::Qbo(QboError::Database(err)) => {
                tracing::error!("Database error while handling request: {:#?}", err);
                String::from("Database error")
            }
            other => other.to_string(),
        };

        if status.is_client_error() {
            tracing::info!("Request rejected with status_code={}: {}", status, &message);
        } else {
            tracing::warn!("Request failed with status_code={}: {}", status, &message);
        }

        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}
