use chrono::{DateTime, Utc};
use rand::{Rng, distr::Alphanumeric};

use crate::{
    db::Store,
    domain::AuthState,
    error::{QboError, StateError},
};

const STATE_LENGTH: usize = 32;

pub fn generate_state() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LENGTH)
        .map(char::from)
        .collect()
}

/// Starts an authorisation for `user_id`. The user id travels with the state
/// so the callback doesn't depend on the browser session surviving the
/// redirect.
pub async fn store_state(
    store: &dyn Store,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<AuthState, QboError> {
    let auth_state = AuthState::new(generate_state(), user_id, now);
    store.insert_auth_state(&auth_state).await?;
    tracing::info!("Stored authorisation state for user_id={}", user_id);
    Ok(auth_state)
}

/// Consumes `candidate`. Whatever the outcome, the same state can't be
/// presented again.
pub async fn validate_state(
    store: &dyn Store,
    candidate: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AuthState, QboError> {
    let candidate = candidate
        .filter(|candidate| !candidate.is_empty())
        .ok_or(StateError::Missing)?;

    let auth_state = match store.take_auth_state(candidate).await? {
        Some(auth_state) => auth_state,
        None => {
            tracing::warn!("Rejected callback with unknown state");
            return Err(StateError::Unknown.into());
        }
    };

    if auth_state.is_expired(now) {
        tracing::warn!(
            "Rejected callback for user_id={} with state that expired at {}",
            &auth_state.user_id,
            auth_state.expires_at
        );
        return Err(StateError::Expired.into());
    }

    Ok(auth_state)
}
