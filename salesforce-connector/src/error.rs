use crate::remote::RemoteError;
use crate::{config, credentials, host};

/// Errors surfaced by actions and the polling trigger.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The session stayed invalid after every permitted token refresh.
    #[error("Session still invalid after {refreshes} token refreshes: {source}")]
    RetriesExceeded {
        /// Number of refreshes performed before giving up.
        refreshes: u32,
        /// The authentication failure of the final attempt.
        #[source]
        source: RemoteError,
    },
    /// Salesforce rejected the call for a reason other than authentication.
    #[error("Salesforce API error: {0}")]
    Remote(#[source] RemoteError),
    /// The object schema could not be described.
    #[error("Failed to describe {sobject}: {source}")]
    SchemaDescribeFailed {
        /// Object that was being described.
        sobject: String,
        #[source]
        source: Box<Error>,
    },
    /// The host failed to accept an emitted record mid-cycle.
    #[error("Emission failed after {emitted} records: {source}")]
    PartialEmission {
        /// Number of `data` events accepted before the failure.
        emitted: usize,
        #[source]
        source: host::EmitError,
    },
    /// The host refused a lifecycle event other than `data`.
    #[error("Failed to emit {event} event: {source}")]
    Emit {
        /// Name of the event that was refused.
        event: &'static str,
        #[source]
        source: host::EmitError,
    },
    /// Credentials could not be fetched or refreshed.
    #[error("Credential error: {0}")]
    Credentials(#[from] credentials::Error),
    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    /// Required configuration or message attribute was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
    /// A configured field name is not a field of the described object.
    #[error("{sobject} has no field named {field}")]
    UnknownField {
        /// Object that was described.
        sobject: String,
        /// The configured field name.
        field: String,
    },
    /// Message body was not usable for the operation.
    #[error("Invalid message body: {0}")]
    InvalidBody(String),
    /// Failed to acquire lock on the client cache.
    #[error("Failed to acquire lock on client cache")]
    LockError,
}

impl Error {
    /// Short machine-readable name used in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RetriesExceeded { .. } => "RetriesExceeded",
            Error::Remote(_) => "RemoteRejected",
            Error::SchemaDescribeFailed { .. } => "SchemaDescribeFailed",
            Error::PartialEmission { .. } => "PartialEmissionFailure",
            Error::Emit { .. } => "EmitFailed",
            Error::Credentials(_) => "CredentialsFailed",
            Error::Config(_) => "InvalidConfiguration",
            Error::MissingRequiredAttribute(_) => "MissingRequiredAttribute",
            Error::UnknownField { .. } => "UnknownField",
            Error::InvalidBody(_) => "InvalidBody",
            Error::LockError => "LockError",
        }
    }
}
