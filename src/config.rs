use std::collections::HashMap;

use url::Url;

pub const AUTH_ENDPOINT: &str = "https://appcenter.intuit.com/connect/oauth2";
pub const TOKEN_ENDPOINT: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
pub const REVOKE_ENDPOINT: &str = "https://developer.api.intuit.com/v2/oauth2/tokens/revoke";
pub const PRODUCTION_API_BASE_URL: &str = "https://quickbooks.api.intuit.com";
pub const SANDBOX_API_BASE_URL: &str = "https://sandbox-quickbooks.api.intuit.com";
pub const ACCOUNTING_SCOPE: &str = "com.intuit.quickbooks.accounting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QboEnvironment {
    Production,
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    /// Absent when a trusted intermediary holds the secret.
    pub client_secret: Option<String>,
}

/// Inputs to [`QboConfig::resolve`], usually taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct HostSettings {
    pub production_hosts: Vec<String>,
    /// Per-host redirect URIs that differ from `${origin}/callback`.
    pub redirect_overrides: HashMap<String, Url>,
    pub production_credentials: Option<ClientCredentials>,
    pub sandbox_credentials: Option<ClientCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QboConfig {
    pub environment: QboEnvironment,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Url,
    pub auth_endpoint: Url,
    pub token_endpoint: Url,
    pub revoke_endpoint: Url,
    pub api_base_url: Url,
    pub scopes: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL {0:?}: {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("public URL {0} has no host")]
    MissingHost(Url),

    #[error("direct token exchange needs a client secret, configure one or a token proxy")]
    MissingClientSecret,

    #[error("{0} cannot be used as a base URL")]
    CannotBeABase(Url),
}

fn parse_url(value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::InvalidUrl(value.to_string(), err))
}

impl QboConfig {
    /// Resolves the endpoint set and credentials for the host the service is
    /// reachable on. Unknown hosts get the sandbox.
    pub fn resolve(public_url: &Url, settings: &HostSettings) -> Result<Self, ConfigError> {
        let host = public_url
            .host_str()
            .ok_or_else(|| ConfigError::MissingHost(public_url.clone()))?
            .to_ascii_lowercase();

        let environment = if settings
            .production_hosts
            .iter()
            .any(|production_host| production_host.eq_ignore_ascii_case(&host))
        {
            QboEnvironment::Production
        } else {
            tracing::debug!("Host {} is not a production host, using sandbox", &host);
            QboEnvironment::Sandbox
        };

        let redirect_uri = match settings.redirect_overrides.get(&host) {
            Some(redirect_uri) => redirect_uri.clone(),
            None => parse_url(&format!(
                "{}/callback",
                public_url.origin().ascii_serialization()
            ))?,
        };

        let credentials = match environment {
            QboEnvironment::Production => settings.production_credentials.clone(),
            QboEnvironment::Sandbox => settings.sandbox_credentials.clone(),
        }
        .unwrap_or(ClientCredentials {
            client_id: String::new(),
            client_secret: None,
        });

        let api_base_url = match environment {
            QboEnvironment::Production => PRODUCTION_API_BASE_URL,
            QboEnvironment::Sandbox => SANDBOX_API_BASE_URL,
        };

        Ok(QboConfig {
            environment,
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            redirect_uri,
            auth_endpoint: parse_url(AUTH_ENDPOINT)?,
            token_endpoint: parse_url(TOKEN_ENDPOINT)?,
            revoke_endpoint: parse_url(REVOKE_ENDPOINT)?,
            api_base_url: parse_url(api_base_url)?,
            scopes: vec![ACCOUNTING_SCOPE.to_string()],
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == QboEnvironment::Production
    }

    pub fn authorization_url(&self, state: &str) -> Url {
        let mut url = self.auth_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("state", state);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> HostSettings {
        HostSettings {
            production_hosts: vec!["app.buildledger.com".to_string()],
            redirect_overrides: HashMap::from([(
                "preview.buildledger.com".to_string(),
                Url::parse("https://app.buildledger.com/callback").unwrap(),
            )]),
            production_credentials: Some(ClientCredentials {
                client_id: "prod-client".to_string(),
                client_secret: None,
            }),
            sandbox_credentials: Some(ClientCredentials {
                client_id: "sandbox-client".to_string(),
                client_secret: Some("sandbox-secret".to_string()),
            }),
        }
    }

    #[test]
    fn production_host() {
        let public_url = Url::parse("https://app.buildledger.com").unwrap();
        let config = QboConfig::resolve(&public_url, &settings()).unwrap();

        assert!(config.is_production());
        assert_eq!(config.client_id, "prod-client");
        assert_eq!(config.client_secret, None);
        assert_eq!(
            config.redirect_uri.as_str(),
            "https://app.buildledger.com/callback"
        );
        assert_eq!(config.api_base_url.as_str(), "https://quickbooks.api.intuit.com/");
    }

    #[test]
    fn unknown_host_defaults_to_sandbox() {
        let public_url = Url::parse("http://localhost:8080/some/path").unwrap();
        let config = QboConfig::resolve(&public_url, &settings()).unwrap();

        assert_eq!(config.environment, QboEnvironment::Sandbox);
        assert_eq!(config.client_id, "sandbox-client");
        assert_eq!(config.redirect_uri.as_str(), "http://localhost:8080/callback");
        assert_eq!(
            config.api_base_url.as_str(),
            "https://sandbox-quickbooks.api.intuit.com/"
        );
    }

    #[test]
    fn redirect_override() {
        let public_url = Url::parse("https://preview.buildledger.com").unwrap();
        let config = QboConfig::resolve(&public_url, &settings()).unwrap();

        assert_eq!(
            config.redirect_uri.as_str(),
            "https://app.buildledger.com/callback"
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let public_url = Url::parse("https://app.buildledger.com").unwrap();
        let first = QboConfig::resolve(&public_url, &settings()).unwrap();
        let second = QboConfig::resolve(&public_url, &settings()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn authorization_url_carries_state() {
        let public_url = Url::parse("https://app.buildledger.com").unwrap();
        let config = QboConfig::resolve(&public_url, &settings()).unwrap();
        let url = config.authorization_url("abc123");
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("appcenter.intuit.com"));
        assert_eq!(pairs["client_id"], "prod-client");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"], ACCOUNTING_SCOPE);
        assert_eq!(pairs["redirect_uri"], "https://app.buildledger.com/callback");
        assert_eq!(pairs["state"], "abc123");
    }
}
