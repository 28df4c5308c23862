use std::sync::Arc;

use crate::{
    AppState,
    domain::{ConnectionStatus, EntityReference, LocalEntityType},
    error::{AppError, QboError},
    payments::PaymentSummary,
    service::{AuthorizeResponse, CallbackParams},
    sync::{find_reference, is_syncable_entity, sync_entity},
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SyncRequest {
    pub entity: String,
    pub payload: Value,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PaymentSummaryRequest {
    pub amount: i64,
    #[serde(default)]
    pub payments: Vec<i64>,
}

pub async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn authorize_redirect(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
) -> Result<Redirect, AppError> {
    let user_id = params
        .user_id
        .filter(|user_id| !user_id.is_empty())
        .ok_or(AppError::BadRequest(String::from("No user_id received")))?;

    let response = state
        .service
        .begin_authorization(&user_id, Utc::now())
        .await?;

    tracing::info!("Redirecting user_id={} to QuickBooks authorisation", &user_id);

    Ok(Redirect::to(&response.authorization_url))
}

pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<AuthorizeResponse>, AppError> {
    let response = state
        .service
        .begin_authorization(&user_id, Utc::now())
        .await?;

    Ok(Json(response))
}

pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, AppError> {
    tracing::info!(
        "Received callback realm_id={:?} error={:?}",
        &params.realm_id,
        &params.error
    );

    state
        .service
        .complete_authorization(params, Utc::now())
        .await?;

    let redirect_url = format!("{}/", state.public_url.as_str().trim_end_matches('/'));

    tracing::info!("Redirecting to {}", &redirect_url);

    Ok(Redirect::to(&redirect_url))
}

pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<ConnectionStatus>, AppError> {
    Ok(Json(state.service.connection_status(&user_id).await?))
}

pub async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.service.disconnect(&user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(QboError::NotConnected(user_id).into())
    }
}

pub async fn refresh_connection(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<ConnectionStatus>, AppError> {
    let connection = state
        .service
        .tokens
        .valid_connection(&user_id, Utc::now())
        .await?;

    Ok(Json(ConnectionStatus::from(&connection)))
}

/// Relays a call to the accounting API with the user's token. QuickBooks'
/// status and body are returned as they are.
#[axum::debug_handler]
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Path((user_id, endpoint)): Path<(String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    method: Method,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice::<Value>(&body)
                .map_err(|err| AppError::BadRequest(format!("Invalid JSON body: {}", err)))?,
        )
    };

    let res = state
        .service
        .request(&user_id, method, &endpoint, &query, body.as_ref(), Utc::now())
        .await?;

    if res.body.is_null() {
        return Ok(res.status.into_response());
    }

    Ok((res.status, Json(res.body)).into_response())
}

pub async fn sync_local_entity(
    State(state): State<Arc<AppState>>,
    Path((user_id, local_type, local_id)): Path<(String, LocalEntityType, String)>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<EntityReference>, AppError> {
    if !is_syncable_entity(&request.entity) {
        return Err(AppError::BadRequest(format!(
            "Entity type {} cannot be synced",
            &request.entity
        )));
    }

    let reference = sync_entity(
        &state.service,
        &user_id,
        local_type,
        &local_id,
        &request.entity,
        &request.payload,
        Utc::now(),
    )
    .await?;

    Ok(Json(reference))
}

pub async fn get_reference(
    State(state): State<Arc<AppState>>,
    Path((_user_id, local_type, local_id)): Path<(String, LocalEntityType, String)>,
) -> Result<Json<EntityReference>, AppError> {
    find_reference(&state.service, local_type, &local_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "No QuickBooks reference for {} {}",
                local_type.as_str(),
                &local_id
            ))
        })
}

pub async fn payment_summary(
    Json(request): Json<PaymentSummaryRequest>,
) -> Result<Json<PaymentSummary>, AppError> {
    PaymentSummary::for_expense(request.amount, &request.payments)
        .map(Json)
        .map_err(|err| AppError::BadRequest(err.to_string()))
}
