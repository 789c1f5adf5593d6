//! Process-wide settings and per-call configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Errors raised while loading [`Settings`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An environment variable held a value that could not be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Name of the offending variable.
        name: &'static str,
        /// The raw value as read from the environment.
        value: String,
    },
    /// Only part of a credential group was configured.
    #[error("Incomplete configuration: {name} requires {missing}")]
    Incomplete {
        /// The group that was partially configured.
        name: &'static str,
        /// The variable that is missing.
        missing: &'static str,
    },
}

/// Connected App credentials used to exchange refresh tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientSettings {
    /// Consumer key of the Connected App.
    pub client_id: String,
    /// Consumer secret of the Connected App.
    pub client_secret: String,
    /// Base URL of the OAuth2 server, e.g. `https://login.salesforce.com`.
    pub login_url: String,
}

/// Location of the host's secret store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretStoreSettings {
    /// Base URL of the host API, e.g. `https://api.example.com/v2`.
    pub api_uri: String,
    /// Username for basic authentication.
    pub username: String,
    /// API key for basic authentication.
    pub api_key: String,
    /// Workspace that owns the secrets.
    pub workspace_id: String,
}

/// Process-wide tunables, read once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Number of token refreshes the gate may perform for one call.
    pub retries: u32,
    /// Timeout applied to every remote request.
    pub request_timeout: Duration,
    /// Timeout for establishing connections.
    pub connect_timeout: Duration,
    /// Salesforce API version used when the configuration does not pin one.
    pub api_version: String,
    /// Enables refresh-token exchange when present.
    pub oauth_client: Option<OAuthClientSettings>,
    /// Enables secret-store backed credentials when present.
    pub secret_store: Option<SecretStoreSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retries: crate::DEFAULT_RETRIES,
            request_timeout: Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS),
            api_version: crate::DEFAULT_API_VERSION.to_string(),
            oauth_client: None,
            secret_store: None,
        }
    }
}

impl Settings {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unparsable numbers and
    /// [`Error::Incomplete`] when a credential group is only partially set.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads settings through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let retries = match non_empty("SALESFORCE_RETRIES") {
            Some(value) => value.trim().parse().map_err(|_| Error::InvalidValue {
                name: "SALESFORCE_RETRIES",
                value,
            })?,
            None => defaults.retries,
        };

        let request_timeout = parse_secs(
            "SALESFORCE_REQUEST_TIMEOUT_SECS",
            non_empty("SALESFORCE_REQUEST_TIMEOUT_SECS"),
            defaults.request_timeout,
        )?;
        let connect_timeout = parse_secs(
            "SALESFORCE_CONNECT_TIMEOUT_SECS",
            non_empty("SALESFORCE_CONNECT_TIMEOUT_SECS"),
            defaults.connect_timeout,
        )?;

        let api_version = non_empty("SALESFORCE_API_VERSION")
            .map(|v| v.trim().trim_start_matches('v').to_string())
            .unwrap_or(defaults.api_version);

        let oauth_client = match (non_empty("OAUTH_CLIENT_ID"), non_empty("OAUTH_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(OAuthClientSettings {
                client_id,
                client_secret,
                login_url: non_empty("SALESFORCE_LOGIN_URL")
                    .unwrap_or_else(|| crate::DEFAULT_LOGIN_URL.to_string()),
            }),
            (Some(_), None) => {
                return Err(Error::Incomplete {
                    name: "OAUTH_CLIENT_ID",
                    missing: "OAUTH_CLIENT_SECRET",
                })
            }
            (None, Some(_)) => {
                return Err(Error::Incomplete {
                    name: "OAUTH_CLIENT_SECRET",
                    missing: "OAUTH_CLIENT_ID",
                })
            }
            (None, None) => None,
        };

        let secret_store = match non_empty("HOST_API_URI") {
            Some(api_uri) => {
                let require = |missing: &'static str| {
                    non_empty(missing).ok_or(Error::Incomplete {
                        name: "HOST_API_URI",
                        missing,
                    })
                };
                Some(SecretStoreSettings {
                    api_uri: api_uri.trim_end_matches('/').to_string(),
                    username: require("HOST_API_USERNAME")?,
                    api_key: require("HOST_API_KEY")?,
                    workspace_id: require("HOST_WORKSPACE_ID")?,
                })
            }
            None => None,
        };

        Ok(Self {
            retries,
            request_timeout,
            connect_timeout,
            api_version,
            oauth_client,
            secret_store,
        })
    }
}

fn parse_secs(
    name: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, Error> {
    match value {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::InvalidValue { name, value }),
        None => Ok(default),
    }
}

/// Access token material embedded directly in a configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OAuthConfig {
    /// Current access token.
    pub access_token: String,
    /// Instance the token is bound to.
    pub instance_url: String,
    /// Refresh token, when the host obtained one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How a polling cycle hands records to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum EmitBehavior {
    /// One `data` event per record.
    #[default]
    EmitIndividually,
    /// A single `data` event carrying every record of the cycle.
    EmitAll,
}

/// Configuration supplied by the host for one invocation.
///
/// Read-only to the connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Salesforce object the action or trigger works on, e.g. `Account`.
    #[serde(default)]
    pub sobject: Option<String>,
    /// Secret-store identifier holding the OAuth credentials.
    #[serde(default)]
    pub secret_id: Option<String>,
    /// Credentials embedded directly in the configuration.
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
    /// API version override, e.g. `"58.0"`.
    #[serde(default)]
    pub api_version: Option<String>,
    /// Lower bound used when no snapshot exists yet.
    #[serde(default)]
    pub start_time: Option<String>,
    /// Exclusive upper bound on the modification timestamp.
    #[serde(default)]
    pub end_time: Option<String>,
    /// Polling emission mode.
    #[serde(default)]
    pub emit_behavior: EmitBehavior,
    /// Field matched by the lookup action.
    #[serde(default)]
    pub lookup_field: Option<String>,
    /// External id field used by the upsert action.
    #[serde(default)]
    pub external_id_field: Option<String>,
}

impl Configuration {
    /// Returns the configured object or [`crate::Error::MissingRequiredAttribute`].
    pub fn sobject(&self) -> Result<&str, crate::Error> {
        self.sobject
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| crate::Error::MissingRequiredAttribute("sobject".to_string()))
    }
}

/// Credentials resolved for a call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer token for the REST API.
    pub access_token: String,
    /// Instance base URL, e.g. `https://acme.my.salesforce.com`.
    pub instance_url: String,
    /// Refresh token, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .finish_non_exhaustive()
    }
}

impl From<&OAuthConfig> for Credentials {
    fn from(oauth: &OAuthConfig) -> Self {
        Self {
            access_token: oauth.access_token.clone(),
            instance_url: oauth.instance_url.clone(),
            refresh_token: oauth.refresh_token.clone(),
        }
    }
}

/// Everything needed to build a client for one remote-call attempt.
///
/// Built fresh for every attempt, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Credentials in force for this attempt.
    pub credentials: Credentials,
    /// API version resolved from configuration or settings.
    pub api_version: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl EffectiveConfig {
    /// Combines credentials with the version and timeouts in force.
    pub fn new(configuration: &Configuration, settings: &Settings, credentials: Credentials) -> Self {
        let api_version = configuration
            .api_version
            .as_deref()
            .map(|v| v.trim_start_matches('v').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| settings.api_version.clone());

        Self {
            credentials,
            api_version,
            request_timeout: settings.request_timeout,
            connect_timeout: settings.connect_timeout,
        }
    }
}
