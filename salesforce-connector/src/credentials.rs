//! Sources of OAuth credentials and their refresh paths.

use crate::config::{Configuration, Credentials, OAuthClientSettings, SecretStoreSettings, Settings};
use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicTokenType};
use oauth2::{ClientId, ClientSecret, EmptyExtraTokenFields, RefreshToken, TokenResponse, TokenUrl};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default OAuth2 token endpoint path.
const DEFAULT_TOKEN_PATH: &str = "/services/oauth2/token";

/// Type alias for Salesforce OAuth2 token response using standard fields.
pub type SalesforceTokenResponse =
    oauth2::StandardTokenResponse<EmptyExtraTokenFields, BasicTokenType>;

/// Errors that can occur while fetching or refreshing credentials.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The secret store could not be reached.
    #[error("Secret store request failed: {source}")]
    SecretStoreRequest {
        #[source]
        source: reqwest::Error,
    },
    /// The secret store answered with a non-success status.
    #[error("Secret store returned HTTP {status} for secret {secret_id}")]
    SecretStoreStatus {
        /// HTTP status code.
        status: u16,
        /// Secret that was requested.
        secret_id: String,
    },
    /// The secret did not contain usable OAuth credentials.
    #[error("Secret {secret_id} has no usable credentials: {message}")]
    MalformedSecret {
        /// Secret that was requested.
        secret_id: String,
        /// What was wrong with it.
        message: String,
    },
    /// Invalid URL format in settings or credentials.
    #[error("Invalid URL format: {source}")]
    ParseUrl {
        #[source]
        source: url::ParseError,
    },
    /// OAuth2 token exchange failed.
    #[error("OAuth2 token exchange failed: {0:?}")]
    TokenExchange(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to build the HTTP client.
    #[error("Failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },
    /// Token refresh is not available (no refresh token present).
    #[error("Token refresh not available: no refresh token in configuration")]
    NoRefreshToken,
    /// No credential source could be selected for the configuration.
    #[error("No credentials: configuration has neither secretId nor oauth")]
    NoCredentials,
    /// A secret id was given but no secret store is configured.
    #[error("Secret {0} requested but the secret store is not configured")]
    SecretStoreNotConfigured(String),
}

/// Obtains credentials for a call and rotates them on demand.
#[async_trait]
pub trait CredentialSource: Send + Sync + fmt::Debug {
    /// Reads the current credentials without side effects on the remote system.
    async fn fetch(&self) -> Result<Credentials, Error>;

    /// Forces rotation upstream and returns the new access token.
    ///
    /// The instance URL is assumed to stay the same.
    async fn refresh(&self) -> Result<String, Error>;

    /// Whether [`refresh`](Self::refresh) can yield new credential material.
    fn rotates(&self) -> bool {
        true
    }
}

/// Picks the credential source for `configuration`.
///
/// A `secretId` selects the secret store. Otherwise embedded `oauth`
/// credentials are used, refreshable when they carry a refresh token and a
/// Connected App is configured.
pub fn source_for(
    configuration: &Configuration,
    settings: &Settings,
) -> Result<Arc<dyn CredentialSource>, Error> {
    if let Some(secret_id) = configuration.secret_id.as_deref().filter(|s| !s.is_empty()) {
        let store = settings
            .secret_store
            .as_ref()
            .ok_or_else(|| Error::SecretStoreNotConfigured(secret_id.to_string()))?;
        return Ok(Arc::new(SecretStore::new(
            store.clone(),
            secret_id,
            settings.request_timeout,
        )?));
    }

    let oauth = configuration.oauth.as_ref().ok_or(Error::NoCredentials)?;
    match (&oauth.refresh_token, &settings.oauth_client) {
        (Some(_), Some(client)) => Ok(Arc::new(OAuthRefresh::new(
            client.clone(),
            Credentials::from(oauth),
            settings.request_timeout,
        )?)),
        _ => Ok(Arc::new(StaticCredentials::new(Credentials::from(oauth)))),
    }
}

/// Credentials embedded in the configuration, with no rotation path.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Wraps fixed credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn fetch(&self) -> Result<Credentials, Error> {
        Ok(self.credentials.clone())
    }

    async fn refresh(&self) -> Result<String, Error> {
        Ok(self.credentials.access_token.clone())
    }

    fn rotates(&self) -> bool {
        false
    }
}

/// The `credentials` object stored in a secret.
#[derive(Deserialize)]
struct SecretCredentials {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    instance_url: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct SecretAttributes {
    credentials: SecretCredentials,
}

#[derive(Deserialize)]
struct SecretData {
    attributes: SecretAttributes,
}

/// Either the bare `{credentials}` shape or a JSON:API `{data: {attributes}}` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum SecretResponse {
    Bare(SecretAttributes),
    Envelope { data: SecretData },
}

impl SecretResponse {
    fn into_credentials(self) -> SecretCredentials {
        match self {
            SecretResponse::Bare(attributes) => attributes.credentials,
            SecretResponse::Envelope { data } => data.attributes.credentials,
        }
    }
}

/// Credentials kept in the host's secret store.
#[derive(Clone)]
pub struct SecretStore {
    settings: SecretStoreSettings,
    secret_id: String,
    http: reqwest::Client,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("api_uri", &self.settings.api_uri)
            .field("workspace_id", &self.settings.workspace_id)
            .field("secret_id", &self.secret_id)
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Creates a source for `secret_id`.
    pub fn new(
        settings: SecretStoreSettings,
        secret_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| Error::HttpClientBuild { source })?;
        Ok(Self {
            settings,
            secret_id: secret_id.into(),
            http,
        })
    }

    /// `{api}/workspaces/{ws}/secrets/{secretId}[/refresh]`
    pub(crate) fn secret_url(&self, refresh: bool) -> Result<url::Url, Error> {
        let mut url = url::Url::parse(&self.settings.api_uri)
            .map_err(|source| Error::ParseUrl { source })?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::ParseUrl {
                    source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
                })?;
            path.pop_if_empty().extend([
                "workspaces",
                self.settings.workspace_id.as_str(),
                "secrets",
                self.secret_id.as_str(),
            ]);
            if refresh {
                path.push("refresh");
            }
        }
        Ok(url)
    }

    async fn request(&self, request: reqwest::RequestBuilder) -> Result<SecretCredentials, Error> {
        let response = request
            .basic_auth(&self.settings.username, Some(&self.settings.api_key))
            .send()
            .await
            .map_err(|source| Error::SecretStoreRequest { source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SecretStoreStatus {
                status: status.as_u16(),
                secret_id: self.secret_id.clone(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| Error::SecretStoreRequest { source })?;
        parse_secret(&self.secret_id, &body)
    }
}

fn parse_secret(secret_id: &str, body: &str) -> Result<SecretCredentials, Error> {
    serde_json::from_str::<SecretResponse>(body)
        .map(SecretResponse::into_credentials)
        .map_err(|e| Error::MalformedSecret {
            secret_id: secret_id.to_string(),
            message: e.to_string(),
        })
}

fn require(secret_id: &str, value: Option<String>, field: &str) -> Result<String, Error> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| Error::MalformedSecret {
        secret_id: secret_id.to_string(),
        message: format!("{field} is missing"),
    })
}

#[async_trait]
impl CredentialSource for SecretStore {
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn fetch(&self) -> Result<Credentials, Error> {
        debug!(secret_id = %self.secret_id, "fetching credentials from secret store");
        let secret = self.request(self.http.get(self.secret_url(false)?)).await?;
        Ok(Credentials {
            access_token: require(&self.secret_id, secret.access_token, "access_token")?,
            instance_url: require(&self.secret_id, secret.instance_url, "instance_url")?,
            refresh_token: secret.refresh_token,
        })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn refresh(&self) -> Result<String, Error> {
        info!(secret_id = %self.secret_id, "refreshing secret");
        let secret = self.request(self.http.post(self.secret_url(true)?)).await?;
        require(&self.secret_id, secret.access_token, "access_token")
    }
}

/// Refresh-token exchange directly against the Salesforce token endpoint.
pub struct OAuthRefresh {
    client: OAuthClientSettings,
    credentials: Credentials,
    http: reqwest::Client,
}

impl fmt::Debug for OAuthRefresh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthRefresh")
            .field("login_url", &self.client.login_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl OAuthRefresh {
    /// Creates a source starting from `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRefreshToken`] if `credentials` carries no refresh
    /// token, or [`Error::HttpClientBuild`] if the HTTP client fails to build.
    pub fn new(
        client: OAuthClientSettings,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, Error> {
        if credentials.refresh_token.is_none() {
            return Err(Error::NoRefreshToken);
        }

        // Token endpoints must not be followed through redirects.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|source| Error::HttpClientBuild { source })?;

        Ok(Self {
            client,
            credentials,
            http,
        })
    }

    pub(crate) fn token_url(&self) -> Result<TokenUrl, Error> {
        TokenUrl::new(format!(
            "{}{}",
            self.client.login_url.trim_end_matches('/'),
            DEFAULT_TOKEN_PATH
        ))
        .map_err(|source| Error::ParseUrl { source })
    }
}

#[async_trait]
impl CredentialSource for OAuthRefresh {
    async fn fetch(&self) -> Result<Credentials, Error> {
        Ok(self.credentials.clone())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn refresh(&self) -> Result<String, Error> {
        let refresh_token = self
            .credentials
            .refresh_token
            .clone()
            .map(RefreshToken::new)
            .ok_or(Error::NoRefreshToken)?;

        let oauth2_client = BasicClient::new(ClientId::new(self.client.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client.client_secret.clone()))
            .set_token_uri(self.token_url()?);

        info!(login_url = %self.client.login_url, "exchanging refresh token");
        let response: SalesforceTokenResponse = oauth2_client
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http)
            .await
            .map_err(|e| Error::TokenExchange(Box::new(e)))?;

        Ok(response.access_token().secret().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthConfig;

    fn store_settings() -> SecretStoreSettings {
        SecretStoreSettings {
            api_uri: "https://api.example.com/v2".to_string(),
            username: "user".to_string(),
            api_key: "key".to_string(),
            workspace_id: "ws1".to_string(),
        }
    }

    fn oauth_config(refresh_token: Option<&str>) -> OAuthConfig {
        OAuthConfig {
            access_token: "token".to_string(),
            instance_url: "https://acme.my.salesforce.com".to_string(),
            refresh_token: refresh_token.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_static_credentials_refresh_returns_same_token() {
        let source = StaticCredentials::new(Credentials::from(&oauth_config(None)));
        let fetched = source.fetch().await.unwrap();
        assert_eq!(fetched.access_token, "token");
        assert_eq!(source.refresh().await.unwrap(), "token");
        assert!(!source.rotates());
    }

    #[test]
    fn test_secret_url() {
        let store = SecretStore::new(store_settings(), "sec/1", Duration::from_secs(5)).unwrap();
        assert_eq!(
            store.secret_url(false).unwrap().as_str(),
            "https://api.example.com/v2/workspaces/ws1/secrets/sec%2F1"
        );
        assert_eq!(
            store.secret_url(true).unwrap().as_str(),
            "https://api.example.com/v2/workspaces/ws1/secrets/sec%2F1/refresh"
        );
    }

    #[test]
    fn test_parse_secret_bare_shape() {
        let body = r#"{"credentials": {"access_token": "a", "instance_url": "https://x", "refresh_token": "r"}}"#;
        let secret = parse_secret("s", body).unwrap();
        assert_eq!(secret.access_token.as_deref(), Some("a"));
        assert_eq!(secret.refresh_token.as_deref(), Some("r"));
    }

    #[test]
    fn test_parse_secret_envelope_shape() {
        let body = r#"{"data": {"id": "s", "type": "secret", "attributes": {"name": "sf",
            "credentials": {"access_token": "a", "instance_url": "https://x"}}}}"#;
        let secret = parse_secret("s", body).unwrap();
        assert_eq!(secret.instance_url.as_deref(), Some("https://x"));
        assert!(secret.refresh_token.is_none());
    }

    #[test]
    fn test_parse_secret_malformed() {
        let result = parse_secret("s", r#"{"unexpected": true}"#);
        assert!(matches!(result, Err(Error::MalformedSecret { .. })));
    }

    #[test]
    fn test_require_rejects_empty() {
        let result = require("s", Some(String::new()), "access_token");
        assert!(matches!(
            result,
            Err(Error::MalformedSecret { message, .. }) if message == "access_token is missing"
        ));
    }

    #[test]
    fn test_source_for_secret_without_store() {
        let configuration = Configuration {
            secret_id: Some("abc".to_string()),
            ..Default::default()
        };
        let result = source_for(&configuration, &Settings::default());
        assert!(matches!(result, Err(Error::SecretStoreNotConfigured(id)) if id == "abc"));
    }

    #[test]
    fn test_source_for_secret_store() {
        let settings = Settings {
            secret_store: Some(store_settings()),
            ..Default::default()
        };
        let configuration = Configuration {
            secret_id: Some("abc".to_string()),
            oauth: Some(oauth_config(None)),
            ..Default::default()
        };
        let source = source_for(&configuration, &settings).unwrap();
        assert!(format!("{source:?}").contains("SecretStore"));
        assert!(source.rotates());
    }

    #[test]
    fn test_source_for_oauth_refresh() {
        let settings = Settings {
            oauth_client: Some(OAuthClientSettings {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                login_url: "https://login.salesforce.com".to_string(),
            }),
            ..Default::default()
        };
        let configuration = Configuration {
            oauth: Some(oauth_config(Some("refresh"))),
            ..Default::default()
        };
        let source = source_for(&configuration, &settings).unwrap();
        assert!(format!("{source:?}").contains("OAuthRefresh"));
    }

    #[test]
    fn test_source_for_static_without_client_settings() {
        let configuration = Configuration {
            oauth: Some(oauth_config(Some("refresh"))),
            ..Default::default()
        };
        let source = source_for(&configuration, &Settings::default()).unwrap();
        assert!(!source.rotates());
    }

    #[test]
    fn test_source_for_nothing() {
        let result = source_for(&Configuration::default(), &Settings::default());
        assert!(matches!(result, Err(Error::NoCredentials)));
    }

    #[test]
    fn test_oauth_refresh_requires_refresh_token() {
        let client = OAuthClientSettings {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            login_url: "https://login.salesforce.com".to_string(),
        };
        let result = OAuthRefresh::new(
            client,
            Credentials::from(&oauth_config(None)),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(Error::NoRefreshToken)));
    }

    #[test]
    fn test_oauth_token_url() {
        let client = OAuthClientSettings {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            login_url: "https://test.salesforce.com/".to_string(),
        };
        let source = OAuthRefresh::new(
            client,
            Credentials::from(&oauth_config(Some("r"))),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            source.token_url().unwrap().as_str(),
            "https://test.salesforce.com/services/oauth2/token"
        );
    }

    #[test]
    fn test_oauth_refresh_debug_redacts_secrets() {
        let client = OAuthClientSettings {
            client_id: "id".to_string(),
            client_secret: "client-secret".to_string(),
            login_url: "https://login.salesforce.com".to_string(),
        };
        let source = OAuthRefresh::new(
            client,
            Credentials::from(&oauth_config(Some("refresh-secret"))),
            Duration::from_secs(5),
        )
        .unwrap();
        let debug_str = format!("{source:?}");
        assert!(!debug_str.contains("client-secret"));
        assert!(!debug_str.contains("refresh-secret"));
    }

    #[test]
    fn test_error_display_messages() {
        let error = Error::NoRefreshToken;
        assert_eq!(
            error.to_string(),
            "Token refresh not available: no refresh token in configuration"
        );
        let error = Error::SecretStoreStatus {
            status: 404,
            secret_id: "abc".to_string(),
        };
        assert_eq!(error.to_string(), "Secret store returned HTTP 404 for secret abc");
    }
}
