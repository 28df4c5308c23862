use rand::{Rng, distr::Alphanumeric};
use reqwest::{
    Method, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{domain::Connection, error::QboError, retry::RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct CompanyInfo {
    #[serde(rename = "Id")]
    pub id: Option<String>,
    #[serde(rename = "CompanyName")]
    pub company_name: String,
    #[serde(rename = "LegalName")]
    pub legal_name: Option<String>,
    #[serde(rename = "Country")]
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompanyInfoResponse {
    #[serde(rename = "CompanyInfo")]
    company_info: CompanyInfo,
}

/// Identity of an entity QuickBooks just created.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedEntity {
    pub id: String,
    pub sync_token: Option<String>,
}

/// Accounting API calls for an already-authorised connection.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_base_url: Url,
    minor_version: u32,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        api_base_url: Url,
        minor_version: u32,
        retry: RetryPolicy,
    ) -> Self {
        ApiClient {
            http,
            api_base_url,
            minor_version,
            retry,
        }
    }

    /// `{api_base}/v3/company/{realm}/{endpoint}`. Endpoints may span several
    /// segments (`bill/145`) but may not climb out of the company.
    pub fn endpoint_url(&self, realm_id: &str, endpoint: &str) -> Result<Url, QboError> {
        let segments: Vec<&str> = endpoint
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        if segments.is_empty() || segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(QboError::UnexpectedResponse(format!(
                "invalid endpoint {:?}",
                endpoint
            )));
        }

        let mut url = self.api_base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                QboError::UnexpectedResponse(format!(
                    "API base URL {} cannot be a base",
                    self.api_base_url
                ))
            })?;
            path.pop_if_empty()
                .extend(["v3", "company", realm_id])
                .extend(segments);
        }
        Ok(url)
    }

    /// Sends one request with the connection's access token. Non-2xx
    /// responses are returned, not turned into errors, so callers can pass
    /// them through.
    pub async fn request(
        &self,
        connection: &Connection,
        method: Method,
        endpoint: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<ApiResponse, QboError> {
        let mut url = self.endpoint_url(&connection.realm_id, endpoint)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if !query.iter().any(|(key, _)| key == "minorversion") {
                pairs.append_pair("minorversion", &self.minor_version.to_string());
            }
            // Makes retried writes idempotent on the QuickBooks side.
            if method != Method::GET && !query.iter().any(|(key, _)| key == "requestid") {
                pairs.append_pair("requestid", &request_id());
            }
        }

        tracing::info!(
            "Sending {} {} for user_id={}",
            &method,
            url.path(),
            &connection.user_id
        );

        let res = self
            .retry
            .send("QuickBooks accounting API", || {
                let builder = self
                    .http
                    .request(method.clone(), url.clone())
                    .bearer_auth(&connection.access_token)
                    .header(ACCEPT, "application/json");
                match body {
                    Some(body) => builder.header(CONTENT_TYPE, "application/json").json(body),
                    None => builder,
                }
            })
            .await
            .inspect_err(|err| {
                tracing::error!(
                    "Error occurred in request to QuickBooks accounting API: {:#?}",
                    err
                )
            })?;

        let status = res.status();
        let text = res.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::info!("Returned code: {}", status);

        Ok(ApiResponse { status, body })
    }

    pub async fn company_info(&self, connection: &Connection) -> Result<CompanyInfo, QboError> {
        let endpoint = format!("companyinfo/{}", connection.realm_id);
        let res = self
            .request(connection, Method::GET, &endpoint, &[], None)
            .await?;
        let body = into_success(res)?;

        serde_json::from_value::<CompanyInfoResponse>(body)
            .map(|res| res.company_info)
            .map_err(|err| {
                tracing::error!("Error occurred while deserialising company info: {:#?}", err);
                QboError::UnexpectedResponse(err.to_string())
            })
    }
}

fn request_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Reads the `Id` and `SyncToken` of the `entity` object in a create response.
pub fn created_entity(body: &Value, entity: &str) -> Result<CreatedEntity, QboError> {
    let created = body.get(entity).ok_or_else(|| {
        QboError::UnexpectedResponse(format!("response has no {} object", entity))
    })?;

    let id = created
        .get("Id")
        .and_then(Value::as_str)
        .ok_or_else(|| QboError::UnexpectedResponse(format!("created {} has no Id", entity)))?;

    Ok(CreatedEntity {
        id: id.to_string(),
        sync_token: created
            .get("SyncToken")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Maps a QuickBooks `Fault` body to [`QboError::Provider`].
pub fn into_success(res: ApiResponse) -> Result<Value, QboError> {
    if res.status.is_success() {
        return Ok(res.body);
    }

    let first_error = res
        .body
        .pointer("/Fault/Error/0")
        .or_else(|| res.body.pointer("/fault/error/0"));

    let error = first_error
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let description = first_error
        .and_then(|error| error.get("Detail").or_else(|| error.get("Message")))
        .and_then(Value::as_str)
        .map(str::to_string);

    Err(QboError::Provider {
        status: res.status.as_u16(),
        error,
        description,
    })
}
