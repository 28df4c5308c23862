mod args;
mod config;
mod csrf;
mod db;
mod domain;
mod error;
mod handlers;
mod jobs;
mod logging;
mod payments;
mod quickbooks;
mod retry;
mod service;
mod sync;
mod tokens;
mod transport;

#[cfg(test)]
mod test_utils;

use std::{process::ExitCode, sync::Arc, time::Duration};

use args::{Args, parse_args};
use axum::{
    Router,
    routing::{get, post},
};
use config::QboConfig;
use db::{MemoryStore, PgStore, Store, create_pool};
use error::StartupError;
use handlers::{
    authorize, authorize_redirect, callback, delete_connection, get_connection, get_reference,
    health, payment_summary, proxy, refresh_connection, sync_local_entity,
};
use jobs::{state_cleanup_task, token_refresh_task};
use logging::setup_logging;
use quickbooks::ApiClient;
use retry::RetryPolicy;
use service::QboService;
use tokens::TokenManager;
use transport::build_transport;
use url::Url;

pub struct AppState {
    public_url: Url,
    service: Arc<QboService>,
    token_refresh_interval: u64,
    token_refresh_threshold: u64,
    state_cleanup_interval: u64,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/qbo/authorize", get(authorize_redirect))
        .route("/callback", get(callback))
        .route("/api/qbo/{user_id}/authorize", post(authorize))
        .route(
            "/api/qbo/{user_id}/connection",
            get(get_connection).delete(delete_connection),
        )
        .route("/api/qbo/{user_id}/refresh", post(refresh_connection))
        .route("/api/qbo/{user_id}/proxy/{*endpoint}", get(proxy).post(proxy))
        .route(
            "/api/qbo/{user_id}/sync/{local_type}/{local_id}",
            post(sync_local_entity),
        )
        .route(
            "/api/qbo/{user_id}/references/{local_type}/{local_id}",
            get(get_reference),
        )
        .route("/api/expenses/payment-summary", post(payment_summary))
        .route("/health", get(health))
        .with_state(state)
}

async fn build_state(args: Args) -> Result<Arc<AppState>, StartupError> {
    let config = QboConfig::resolve(&args.public_url, &args.host_settings())?;

    tracing::info!(
        "Using QuickBooks {} environment with redirect_uri={}",
        if config.is_production() { "production" } else { "sandbox" },
        &config.redirect_uri
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.http_timeout))
        .build()?;

    let store: Arc<dyn Store> = match &args.database_url {
        Some(database_url) => Arc::new(PgStore::new(create_pool(database_url).await?)),
        None => {
            tracing::warn!("No database URL configured, connections are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let transport = build_transport(
        http.clone(),
        &config,
        args.token_proxy_url.as_ref(),
        RetryPolicy::default(),
    )?;

    let api = ApiClient::new(
        http,
        config.api_base_url.clone(),
        args.minor_version,
        RetryPolicy::default(),
    );

    let service = QboService {
        config: Arc::new(config),
        store: store.clone(),
        tokens: Arc::new(TokenManager::new(store, transport)),
        api,
    };

    Ok(Arc::new(AppState {
        public_url: args.public_url,
        service: Arc::new(service),
        token_refresh_interval: args.token_refresh_interval,
        token_refresh_threshold: args.token_refresh_threshold,
        state_cleanup_interval: args.state_cleanup_interval,
    }))
}

async fn run(args: Args) -> Result<(), StartupError> {
    let port = args.port;
    let app_state = build_state(args).await?;

    tracing::info!("Spawning background tasks...");
    tokio::spawn(token_refresh_task(app_state.clone()));
    tokio::spawn(state_cleanup_task(app_state.clone()));

    let bind_address = format!("0.0.0.0:{}", port);
    tracing::info!("Server listening on {}...", bind_address);

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    axum::serve(listener, app(app_state)).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = parse_args();

    setup_logging(&args.base_log_dir);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("Failed to start: {}", err);
            ExitCode::FAILURE
        }
    }
}
