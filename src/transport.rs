use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use url::Url;

use crate::{
    config::{ConfigError, QboConfig},
    error::QboError,
    retry::RetryPolicy,
};

/// QuickBooks refresh tokens live for 100 days unless told otherwise.
pub const DEFAULT_REFRESH_TOKEN_EXPIRES_IN: u64 = 8_640_000;
pub const DEFAULT_ACCESS_TOKEN_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token_expires_in: u64,
    /// Only intermediaries report the realm; Intuit sends it on the callback.
    pub realm_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<u64>,
    x_refresh_token_expires_in: Option<u64>,
    #[serde(alias = "realmId")]
    realm_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    #[serde(alias = "message")]
    error_description: Option<String>,
}

/// How authorisation codes and refresh tokens are traded for access tokens.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn exchange_code(&self, code: &str, redirect_uri: &Url)
    -> Result<TokenResponse, QboError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, QboError>;

    async fn revoke(&self, token: &str) -> Result<(), QboError>;
}

/// Talks to Intuit's token endpoint, authenticating with the client secret.
pub struct DirectTransport {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_endpoint: Url,
    revoke_endpoint: Url,
    retry: RetryPolicy,
}

impl DirectTransport {
    pub fn new(
        http: reqwest::Client,
        config: &QboConfig,
        retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        let client_secret = config
            .client_secret
            .clone()
            .ok_or(ConfigError::MissingClientSecret)?;

        Ok(DirectTransport {
            http,
            client_id: config.client_id.clone(),
            client_secret,
            token_endpoint: config.token_endpoint.clone(),
            revoke_endpoint: config.revoke_endpoint.clone(),
            retry,
        })
    }

    async fn token_request(
        &self,
        retry: &RetryPolicy,
        params: &[(&str, &str)],
        fallback_refresh_token: Option<&str>,
    ) -> Result<TokenResponse, QboError> {
        let res = retry
            .send("QuickBooks token endpoint", || {
                self.http
                    .post(self.token_endpoint.clone())
                    .basic_auth(&self.client_id, Some(&self.client_secret))
                    .header(ACCEPT, "application/json")
                    .form(params)
            })
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to QuickBooks token API: {:#?}", err);
            })?;

        read_token_response(res, fallback_refresh_token).await
    }
}

#[async_trait]
impl TokenTransport for DirectTransport {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &Url,
    ) -> Result<TokenResponse, QboError> {
        tracing::info!("Exchanging authorisation code at {}", &self.token_endpoint);
        // Codes are single-use: a repeat after a lost response would fail anyway.
        self.token_request(
            &RetryPolicy::single_attempt(),
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
            ],
            None,
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, QboError> {
        tracing::info!("Refreshing access token at {}", &self.token_endpoint);
        self.token_request(
            &self.retry,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
            Some(refresh_token),
        )
        .await
    }

    async fn revoke(&self, token: &str) -> Result<(), QboError> {
        let body = serde_json::json!({ "token": token });
        let res = self
            .retry
            .send("QuickBooks revoke endpoint", || {
                self.http
                    .post(self.revoke_endpoint.clone())
                    .basic_auth(&self.client_id, Some(&self.client_secret))
                    .header(ACCEPT, "application/json")
                    .json(&body)
            })
            .await?;

        ensure_success(res).await.map(|_| ())
    }
}

/// Delegates the secret-holding step to a trusted intermediary.
pub struct ProxiedTransport {
    http: reqwest::Client,
    token_url: Url,
    revoke_url: Url,
    retry: RetryPolicy,
}

impl ProxiedTransport {
    pub fn new(
        http: reqwest::Client,
        proxy_url: &Url,
        retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        Ok(ProxiedTransport {
            http,
            token_url: child_url(proxy_url, "token")?,
            revoke_url: child_url(proxy_url, "revoke")?,
            retry,
        })
    }

    async fn post(
        &self,
        retry: &RetryPolicy,
        url: &Url,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, QboError> {
        retry
            .send("QuickBooks token proxy", || {
                self.http
                    .post(url.clone())
                    .header(ACCEPT, "application/json")
                    .json(body)
            })
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to token proxy: {:#?}", err);
            })
            .map_err(QboError::from)
    }
}

#[async_trait]
impl TokenTransport for ProxiedTransport {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &Url,
    ) -> Result<TokenResponse, QboError> {
        tracing::info!("Exchanging authorisation code via {}", &self.token_url);
        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": redirect_uri.as_str(),
        });
        let res = self
            .post(&RetryPolicy::single_attempt(), &self.token_url, &body)
            .await?;
        read_token_response(res, None).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, QboError> {
        tracing::info!("Refreshing access token via {}", &self.token_url);
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        let res = self.post(&self.retry, &self.token_url, &body).await?;
        read_token_response(res, Some(refresh_token)).await
    }

    async fn revoke(&self, token: &str) -> Result<(), QboError> {
        let body = serde_json::json!({ "token": token });
        let res = self.post(&self.retry, &self.revoke_url, &body).await?;
        ensure_success(res).await.map(|_| ())
    }
}

/// Picks the transport once, at startup. A configured proxy always wins so a
/// stray secret in the environment is never used alongside it.
pub fn build_transport(
    http: reqwest::Client,
    config: &QboConfig,
    proxy_url: Option<&Url>,
    retry: RetryPolicy,
) -> Result<Arc<dyn TokenTransport>, ConfigError> {
    match proxy_url {
        Some(proxy_url) => {
            tracing::info!("Using token proxy at {}", proxy_url);
            Ok(Arc::new(ProxiedTransport::new(http, proxy_url, retry)?))
        }
        None => {
            tracing::info!("Using direct token exchange with {}", &config.token_endpoint);
            Ok(Arc::new(DirectTransport::new(http, config, retry)?))
        }
    }
}

fn child_url(base: &Url, segment: &str) -> Result<Url, ConfigError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ConfigError::CannotBeABase(base.clone()))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}

/// Turns a non-2xx response into [`QboError::Provider`], keeping the
/// provider's own error description when the body has one.
pub async fn ensure_success(res: reqwest::Response) -> Result<reqwest::Response, QboError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
    let (error, description) = match parsed {
        Some(ErrorBody {
            error,
            error_description,
        }) => (error, error_description),
        None => (None, None),
    };

    tracing::error!(
        "QuickBooks returned status_code={} error={:?} description={:?}",
        status,
        &error,
        &description
    );

    Err(QboError::Provider {
        status: status.as_u16(),
        error,
        description,
    })
}

async fn read_token_response(
    res: reqwest::Response,
    fallback_refresh_token: Option<&str>,
) -> Result<TokenResponse, QboError> {
    let res = ensure_success(res).await?;

    let raw = res.json::<RawTokenResponse>().await.inspect_err(|err| {
        tracing::error!("Error occurred while deserialising token response: {:#?}", err);
    })?;

    let access_token = raw
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or(QboError::MissingAccessToken)?;

    let refresh_token = raw
        .refresh_token
        .filter(|token| !token.is_empty())
        .or_else(|| fallback_refresh_token.map(str::to_string))
        .ok_or_else(|| {
            QboError::UnexpectedResponse(String::from("token response had no refresh_token"))
        })?;

    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: raw.token_type.unwrap_or_else(|| String::from("bearer")),
        expires_in: raw.expires_in.unwrap_or(DEFAULT_ACCESS_TOKEN_EXPIRES_IN),
        refresh_token_expires_in: raw
            .x_refresh_token_expires_in
            .unwrap_or(DEFAULT_REFRESH_TOKEN_EXPIRES_IN),
        realm_id: raw.realm_id.filter(|realm_id| !realm_id.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use wiremock::{
        Mock, MockServer, Request, ResponseTemplate,
        matchers::{body_json, header, method, path},
    };

    use super::*;
    use crate::test_utils::{config_for, fast_retry};

    const CLIENT_ID: &str = "client-id";
    const CLIENT_SECRET: &str = "client-secret";

    fn direct(mock_server: &MockServer) -> DirectTransport {
        let mut config = config_for(mock_server);
        config.client_id = CLIENT_ID.to_string();
        config.client_secret = Some(CLIENT_SECRET.to_string());
        DirectTransport::new(reqwest::Client::new(), &config, fast_retry()).unwrap()
    }

    #[tokio::test]
    async fn direct_exchange_uses_basic_auth_and_form() {
        let mock_server = MockServer::start().await;
        let redirect_uri = Url::parse("https://app.buildledger.com/callback").unwrap();

        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            // base64("client-id:client-secret")
            .and(header(
                "authorization",
                "Basic Y2xpZW50LWlkOmNsaWVudC1zZWNyZXQ=",
            ))
            .and(|req: &Request| {
                let pairs = url::form_urlencoded::parse(&req.body).collect::<HashMap<_, _>>();
                pairs.get("grant_type").is_some_and(|v| v == "authorization_code")
                    && pairs.get("code").is_some_and(|v| v == "auth-code")
                    && pairs
                        .get("redirect_uri")
                        .is_some_and(|v| v == "https://app.buildledger.com/callback")
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "token_type": "bearer",
                "expires_in": 3600,
                "x_refresh_token_expires_in": 8726400,
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tokens = direct(&mock_server)
            .exchange_code("auth-code", &redirect_uri)
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "access-1");
        assert_eq!(tokens.refresh_token, "refresh-1");
        assert_eq!(tokens.expires_in, 3600);
        assert_eq!(tokens.refresh_token_expires_in, 8_726_400);
        assert_eq!(tokens.realm_id, None);
    }

    #[tokio::test]
    async fn provider_error_description_is_surfaced() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Authorization code has expired",
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let redirect_uri = Url::parse("https://app.buildledger.com/callback").unwrap();
        let err = direct(&mock_server)
            .exchange_code("stale-code", &redirect_uri)
            .await
            .unwrap_err();

        assert_matches!(
            &err,
            QboError::Provider { status: 400, error: Some(error), description: Some(description) }
                if error == "invalid_grant" && description == "Authorization code has expired"
        );
        assert!(err.to_string().contains("Authorization code has expired"));
    }

    #[tokio::test]
    async fn missing_access_token_is_an_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "refresh_token": "refresh-1",
                "expires_in": 3600,
            })))
            .mount(&mock_server)
            .await;

        let err = direct(&mock_server).refresh("refresh-0").await.unwrap_err();
        assert_matches!(err, QboError::MissingAccessToken);
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_when_omitted() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-2",
                "expires_in": 3600,
            })))
            .mount(&mock_server)
            .await;

        let tokens = direct(&mock_server).refresh("refresh-0").await.unwrap();
        assert_eq!(tokens.access_token, "access-2");
        assert_eq!(tokens.refresh_token, "refresh-0");
        assert_eq!(tokens.refresh_token_expires_in, DEFAULT_REFRESH_TOKEN_EXPIRES_IN);
    }

    #[tokio::test]
    async fn proxied_exchange_never_sends_a_secret() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/qbo/token"))
            .and(body_json(serde_json::json!({
                "grant_type": "authorization_code",
                "code": "auth-code",
                "redirect_uri": "https://app.buildledger.com/callback",
            })))
            .and(|req: &Request| !req.headers.contains_key("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "expires_in": 3600,
                "x_refresh_token_expires_in": 8726400,
                "realmId": "9130",
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let proxy_url = Url::parse(&format!("{}/api/qbo", mock_server.uri())).unwrap();
        let transport =
            ProxiedTransport::new(reqwest::Client::new(), &proxy_url, fast_retry()).unwrap();
        let redirect_uri = Url::parse("https://app.buildledger.com/callback").unwrap();

        let tokens = transport.exchange_code("auth-code", &redirect_uri).await.unwrap();
        assert_eq!(tokens.realm_id.as_deref(), Some("9130"));
        assert_eq!(tokens.token_type, "bearer");
    }

    #[tokio::test]
    async fn proxied_revoke_posts_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/qbo/revoke"))
            .and(body_json(serde_json::json!({ "token": "refresh-1" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let proxy_url = Url::parse(&format!("{}/api/qbo/", mock_server.uri())).unwrap();
        let transport =
            ProxiedTransport::new(reqwest::Client::new(), &proxy_url, fast_retry()).unwrap();

        transport.revoke("refresh-1").await.unwrap();
    }

    #[tokio::test]
    async fn code_exchange_is_never_retried() {
        let mock_server = MockServer::start().await;
        let redirect_uri = Url::parse("https://app.buildledger.com/callback").unwrap();
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = direct(&mock_server)
            .exchange_code("auth-code", &redirect_uri)
            .await;

        assert_matches!(result, Err(QboError::Provider { status: 503, .. }));
    }

    #[tokio::test]
    async fn proxied_code_exchange_is_never_retried() {
        let mock_server = MockServer::start().await;
        let redirect_uri = Url::parse("https://app.buildledger.com/callback").unwrap();
        Mock::given(method("POST"))
            .and(path("/api/qbo/token"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&mock_server)
            .await;

        let proxy_url = Url::parse(&format!("{}/api/qbo", mock_server.uri())).unwrap();
        let transport =
            ProxiedTransport::new(reqwest::Client::new(), &proxy_url, fast_retry()).unwrap();
        let result = transport.exchange_code("auth-code", &redirect_uri).await;

        assert_matches!(result, Err(QboError::Provider { status: 502, .. }));
    }

    #[tokio::test]
    async fn refresh_is_retried_on_server_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tokens = direct(&mock_server).refresh("refresh-1").await.unwrap();
        assert_eq!(tokens.access_token, "access-2");
    }

    #[test]
    fn direct_transport_requires_a_secret() {
        let public_url = Url::parse("https://app.buildledger.com").unwrap();
        let config = QboConfig::resolve(&public_url, &Default::default()).unwrap();

        assert!(matches!(
            DirectTransport::new(reqwest::Client::new(), &config, fast_retry()),
            Err(ConfigError::MissingClientSecret)
        ));
        assert!(
            build_transport(
                reqwest::Client::new(),
                &config,
                Some(&Url::parse("https://app.buildledger.com/api/qbo").unwrap()),
                fast_retry(),
            )
            .is_ok()
        );
    }
}
