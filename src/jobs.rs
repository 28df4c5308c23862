use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};

use crate::{AppState, service::QboService};

const REFRESH_CONCURRENCY: usize = 4;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub refreshed: usize,
    pub failed: usize,
}

/// Refreshes every connection whose access token expires before
/// `now + threshold`. Each refresh goes through the token manager, so a
/// request refreshing the same user at the same time is not duplicated.
pub async fn refresh_expiring_connections(
    service: &QboService,
    threshold: Duration,
    now: DateTime<Utc>,
) -> Result<RefreshOutcome, sqlx::Error> {
    let connections = service
        .store
        .query_connections_expiring_before(now + threshold)
        .await?;

    tracing::info!("Found {} connections to refresh", connections.len());

    let results: Vec<_> = stream::iter(connections)
        .map(async |connection| {
            let result = service
                .tokens
                .force_refresh(&connection.user_id, &connection.access_token, now)
                .await;
            (connection.user_id, result)
        })
        .buffer_unordered(REFRESH_CONCURRENCY)
        .collect()
        .await;

    let mut outcome = RefreshOutcome::default();
    for (user_id, result) in results {
        match result {
            Ok(_) => {
                tracing::info!("Successfully refreshed token for user_id={}", &user_id);
                outcome.refreshed += 1;
            }
            Err(err) => {
                tracing::error!("Failed to refresh token for user_id={}: {}", &user_id, err);
                outcome.failed += 1;
            }
        }
    }

    Ok(outcome)
}

pub async fn token_refresh_task(state: Arc<AppState>) {
    // The first tick fires immediately.
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.token_refresh_interval));
    let threshold = Duration::seconds(state.token_refresh_threshold as i64);

    loop {
        interval.tick().await;
        tracing::info!("Running token_refresh_task...");

        match refresh_expiring_connections(&state.service, threshold, Utc::now()).await {
            Ok(outcome) => tracing::info!(
                "Finished running token_refresh_task, refreshed={} failed={}",
                outcome.refreshed,
                outcome.failed
            ),
            Err(err) => tracing::error!(
                "An error occurred while querying expiring connections: {:#?}",
                err
            ),
        }
    }
}

pub async fn state_cleanup_task(state: Arc<AppState>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.state_cleanup_interval));

    loop {
        interval.tick().await;

        match state
            .service
            .store
            .delete_expired_auth_states(Utc::now())
            .await
        {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Removed {} expired authorisation states", removed),
            Err(err) => tracing::error!(
                "An error occurred while removing expired authorisation states: {:#?}",
                err
            ),
        }
    }
}
