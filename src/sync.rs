use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::Value;

use crate::{
    domain::{EntityReference, LocalEntityType},
    error::QboError,
    quickbooks::{created_entity, into_success},
    service::QboService,
};

/// QuickBooks entity types local records may be created as.
pub const SYNCABLE_ENTITIES: &[&str] = &[
    "Bill",
    "Customer",
    "Invoice",
    "Payment",
    "Purchase",
    "Vendor",
];

pub fn is_syncable_entity(entity: &str) -> bool {
    SYNCABLE_ENTITIES.contains(&entity)
}

pub async fn find_reference(
    service: &QboService,
    local_type: LocalEntityType,
    local_id: &str,
) -> Result<Option<EntityReference>, QboError> {
    Ok(service
        .store
        .get_entity_reference(local_id, local_type.as_str())
        .await?)
}

/// Mirrors a local record into QuickBooks the first time it is seen. Later
/// calls return the stored reference without contacting QuickBooks, unless
/// the user has since connected a different company: a reference from
/// another realm is replaced.
///
/// A failure here never touches the local record; the caller decides what a
/// failed sync means for it.
pub async fn sync_entity(
    service: &QboService,
    user_id: &str,
    local_type: LocalEntityType,
    local_id: &str,
    qbo_entity: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<EntityReference, QboError> {
    let realm_id = service
        .store
        .get_connection(user_id)
        .await?
        .map(|connection| connection.realm_id)
        .ok_or_else(|| QboError::NotConnected(user_id.to_string()))?;

    match find_reference(service, local_type, local_id).await? {
        Some(reference) if reference.realm_id == realm_id => {
            tracing::info!(
                "Existing reference found for local_id={} local_type={}, qbo_id={}",
                local_id,
                local_type.as_str(),
                &reference.qbo_id
            );
            return Ok(reference);
        }
        Some(reference) => tracing::warn!(
            "Reference for local_id={} local_type={} belongs to realm_id={}, recreating in realm_id={}",
            local_id,
            local_type.as_str(),
            &reference.realm_id,
            &realm_id
        ),
        None => {}
    }

    tracing::info!(
        "Creating {} in QuickBooks for local_id={} local_type={}",
        qbo_entity,
        local_id,
        local_type.as_str()
    );

    let res = service
        .request(
            user_id,
            Method::POST,
            &qbo_entity.to_ascii_lowercase(),
            &[],
            Some(payload),
            now,
        )
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Failed to sync local_id={} local_type={}: {}",
                local_id,
                local_type.as_str(),
                err
            )
        })?;

    let body = into_success(res).inspect_err(|err| {
        tracing::error!(
            "QuickBooks refused {} for local_id={}: {}",
            qbo_entity,
            local_id,
            err
        )
    })?;

    let created = created_entity(&body, qbo_entity)?;

    let reference = EntityReference {
        local_id: local_id.to_string(),
        local_type: local_type.as_str().to_string(),
        realm_id,
        qbo_entity: qbo_entity.to_string(),
        qbo_id: created.id,
        sync_token: created.sync_token,
        created_at: now,
        updated_at: now,
    };

    service.store.upsert_entity_reference(&reference).await?;

    tracing::info!(
        "Linked local_id={} local_type={} to {} qbo_id={}",
        local_id,
        local_type.as_str(),
        qbo_entity,
        &reference.qbo_id
    );

    Ok(reference)
}
