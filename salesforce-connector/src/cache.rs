//! Memoized remote clients keyed by connection parameters.

use crate::config::EffectiveConfig;
use crate::remote::{RemoteApi, RemoteError};
use crate::Error;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Structural identity of a client: two configs with equal keys can share one.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    access_token: String,
    instance_url: String,
    api_version: String,
}

impl ConnectionKey {
    /// Derives the key for the parameters a client would be built from.
    pub fn of(effective: &EffectiveConfig) -> Self {
        Self {
            access_token: effective.credentials.access_token.clone(),
            instance_url: effective.credentials.instance_url.clone(),
            api_version: effective.api_version.clone(),
        }
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionKey")
            .field("instance_url", &self.instance_url)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

/// Constructs clients on cache misses.
///
/// Construction must be cheap and idempotent.
pub trait ClientFactory: Send + Sync + fmt::Debug {
    /// Builds a client bound to `effective`.
    fn build(&self, effective: &EffectiveConfig) -> Result<Arc<dyn RemoteApi>, RemoteError>;
}

/// Holds one client per distinct [`ConnectionKey`].
///
/// Shared through an [`Arc`] by every invocation in the process. Invalidation
/// is per key, so invocations bound to different credentials never evict each
/// other's clients.
#[derive(Debug)]
pub struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    entries: Mutex<HashMap<ConnectionKey, Arc<dyn RemoteApi>>>,
}

impl ClientCache {
    /// Creates an empty cache backed by `factory`.
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached client for `effective`, building it on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the factory fails and [`Error::LockError`]
    /// if the cache lock is poisoned.
    pub fn get(&self, effective: &EffectiveConfig) -> Result<Arc<dyn RemoteApi>, Error> {
        let key = ConnectionKey::of(effective);
        let mut entries = self.entries.lock().map_err(|_| Error::LockError)?;

        if let Some(client) = entries.get(&key) {
            return Ok(Arc::clone(client));
        }

        debug!(instance_url = %effective.credentials.instance_url, "building Salesforce client");
        let client = self.factory.build(effective).map_err(Error::Remote)?;
        entries.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Drops the client cached for `key`; the next [`get`](Self::get) rebuilds it.
    pub fn invalidate(&self, key: &ConnectionKey) -> Result<(), Error> {
        let mut entries = self.entries.lock().map_err(|_| Error::LockError)?;
        entries.remove(key);
        Ok(())
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// True when no client is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
