//! Salesforce actions and incremental polling trigger for workflow-automation hosts.
//!
//! The host hands every invocation a [`host::Message`], a
//! [`config::Configuration`] and an [`host::Emitter`]. Remote calls run through
//! a [`gate::TokenRefreshGate`], which refreshes expired access tokens and
//! reports rotated credentials back to the host as `updateKeys` events.
//! Clients are shared across invocations through a [`cache::ClientCache`].
//!
//! # Examples
//!
//! ```no_run
//! use salesforce_connector::cache::ClientCache;
//! use salesforce_connector::config::{Configuration, Settings};
//! use salesforce_connector::host::{ChannelEmitter, Message};
//! use salesforce_connector::rest::RestClientFactory;
//! use salesforce_connector::trigger::PollingTrigger;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Arc::new(Settings::from_env()?);
//! let cache = Arc::new(ClientCache::new(Arc::new(RestClientFactory)));
//! let trigger = PollingTrigger::new(settings, cache);
//!
//! let configuration: Configuration = serde_json::from_str(
//!     r#"{"sobject": "Account", "secretId": "5f9b..."}"#,
//! )?;
//! let (emitter, _events) = ChannelEmitter::new();
//! trigger
//!     .process(&Message::default(), &configuration, None, Arc::new(emitter))
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Default Salesforce API version (Winter '26 - API version 65.0).
pub const DEFAULT_API_VERSION: &str = "65.0";

/// Default number of token refreshes per remote call.
pub const DEFAULT_RETRIES: u32 = 10;

/// Default request timeout for REST calls (10 seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default connection timeout for HTTP requests (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default OAuth2 server for refresh-token exchange.
pub const DEFAULT_LOGIN_URL: &str = "https://login.salesforce.com";

/// Record writes, lookup, raw query and object listing.
pub mod actions;

/// Per-connection client memoization.
pub mod cache;

/// Environment settings and per-call configuration.
pub mod config;

/// Credential sources and refresh paths.
pub mod credentials;

/// Polling watermark.
pub mod cursor;

/// Token refresh and retry around remote calls.
pub mod gate;

/// Host message envelope and lifecycle events.
pub mod host;

/// The remote capability consumed by actions and triggers.
pub mod remote;

/// Salesforce REST API client.
pub mod rest;

/// Incremental polling trigger.
pub mod trigger;

mod error;

pub use error::Error;

#[cfg(test)]
mod testing;
