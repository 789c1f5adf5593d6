//! Token-refresh-aware wrapper around remote calls.

use crate::cache::{ClientCache, ConnectionKey};
use crate::config::{Configuration, Credentials, EffectiveConfig, Settings};
use crate::credentials::CredentialSource;
use crate::host::{Emitter, Event};
use crate::remote::{RemoteApi, RemoteError};
use crate::Error;
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Runs remote operations, refreshing the access token when the session expires.
///
/// One gate serves one invocation. Credentials are fetched on first use and
/// replaced in place after each refresh, so later calls of the same invocation
/// start from the newest token. Every refresh of a rotating source is reported
/// to the host through an `updateKeys` event.
pub struct TokenRefreshGate {
    settings: Arc<Settings>,
    cache: Arc<ClientCache>,
    source: Arc<dyn CredentialSource>,
    emitter: Arc<dyn Emitter>,
    credentials: Mutex<Option<Credentials>>,
}

impl std::fmt::Debug for TokenRefreshGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefreshGate")
            .field("retries", &self.settings.retries)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl TokenRefreshGate {
    /// Creates a gate for one invocation.
    pub fn new(
        settings: Arc<Settings>,
        cache: Arc<ClientCache>,
        source: Arc<dyn CredentialSource>,
        emitter: Arc<dyn Emitter>,
    ) -> Self {
        Self {
            settings,
            cache,
            source,
            emitter,
            credentials: Mutex::new(None),
        }
    }

    /// Calls `operation` with a client for the current credentials.
    ///
    /// On an [`InvalidSession`](crate::remote::RemoteErrorKind::InvalidSession)
    /// failure the cached client is dropped, the token refreshed and the
    /// operation retried, at most `Settings::retries` times. Other failures are
    /// returned as [`Error::Remote`] without retrying.
    ///
    /// # Errors
    ///
    /// * [`Error::RetriesExceeded`] when the session is still invalid after the
    ///   last permitted refresh.
    /// * [`Error::Remote`] for any other remote failure.
    /// * [`Error::Credentials`] when fetching or refreshing credentials fails.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn call<T, F, Fut>(
        &self,
        configuration: &Configuration,
        mut operation: F,
    ) -> Result<T, Error>
    where
        F: FnMut(Arc<dyn RemoteApi>) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut credentials = self.current_credentials().await?;
        let mut refreshes = 0;

        loop {
            let effective = EffectiveConfig::new(configuration, &self.settings, credentials.clone());
            let client = self.cache.get(&effective)?;

            let error = match operation(client).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_invalid_session() => error,
                Err(error) => return Err(Error::Remote(error)),
            };

            if refreshes >= self.settings.retries {
                warn!(refreshes, "session still invalid, giving up");
                return Err(Error::RetriesExceeded {
                    refreshes,
                    source: error,
                });
            }

            self.cache.invalidate(&ConnectionKey::of(&effective))?;
            credentials.access_token = self.source.refresh().await?;
            refreshes += 1;
            self.store(&credentials)?;

            if self.source.rotates() {
                info!(refreshes, "access token refreshed");
                self.notify(&credentials).await;
            } else {
                warn!(
                    refreshes,
                    "session invalid and credentials cannot rotate, retrying with the same token"
                );
            }
        }
    }

    async fn current_credentials(&self) -> Result<Credentials, Error> {
        let cached = self.credentials.lock().map_err(|_| Error::LockError)?.clone();
        if let Some(credentials) = cached {
            return Ok(credentials);
        }
        debug!("fetching credentials");
        let credentials = self.source.fetch().await?;
        self.store(&credentials)?;
        Ok(credentials)
    }

    fn store(&self, credentials: &Credentials) -> Result<(), Error> {
        *self.credentials.lock().map_err(|_| Error::LockError)? = Some(credentials.clone());
        Ok(())
    }

    async fn notify(&self, credentials: &Credentials) {
        let keys = json!({ "oauth": credentials });
        if let Err(e) = self.emitter.emit(Event::UpdateKeys(keys)).await {
            warn!(error = %e, "host did not accept refreshed credentials");
        }
    }
}
