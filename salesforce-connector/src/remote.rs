//! The Salesforce capability consumed by actions and triggers.
//!
//! [`RemoteApi`] is what the gate hands to an operation. The production
//! implementation lives in [`crate::rest`]; tests substitute scripted fakes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A Salesforce record as returned by the REST API.
pub type Record = Map<String, Value>;

/// Finite, non-restartable sequence of query results.
///
/// Further pages are fetched lazily: the next page is requested only after
/// every record of the current one has been yielded.
pub type RecordStream = BoxStream<'static, Result<Record, RemoteError>>;

/// Discriminates remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteErrorKind {
    /// Access token expired or the session was revoked (`INVALID_SESSION_ID`).
    InvalidSession,
    /// The requested object or record does not exist.
    NotFound,
    /// Validation, permission, limit or any other API-level rejection.
    Rejected,
    /// The request never produced a response (timeout, DNS, TLS, ...).
    Transport,
    /// The response could not be decoded.
    Decode,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::InvalidSession => "InvalidSession",
            RemoteErrorKind::NotFound => "NotFound",
            RemoteErrorKind::Rejected => "Rejected",
            RemoteErrorKind::Transport => "Transport",
            RemoteErrorKind::Decode => "Decode",
        };
        f.write_str(name)
    }
}

/// Error raised by a [`RemoteApi`] call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}{}: {message}", code_suffix(.code))]
pub struct RemoteError {
    /// Failure class.
    pub kind: RemoteErrorKind,
    /// Salesforce `errorCode`, when one was returned.
    pub code: Option<String>,
    /// Description from Salesforce or the transport.
    pub message: String,
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl RemoteError {
    /// Creates an error without a Salesforce error code.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Attaches the Salesforce `errorCode`.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// True when a token refresh may fix the failure.
    pub fn is_invalid_session(&self) -> bool {
        self.kind == RemoteErrorKind::InvalidSession
    }
}

/// A field from an object describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescription {
    /// API name, e.g. `LastModifiedDate`.
    pub name: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Salesforce field type, e.g. `datetime`.
    #[serde(rename = "type")]
    pub field_type: String,
}

/// Result of describing one sObject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescription {
    /// API name of the object.
    pub name: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// All fields of the object.
    #[serde(default)]
    pub fields: Vec<FieldDescription>,
}

/// Field types Salesforce refuses in multi-record queries.
const UNQUERYABLE_TYPES: [&str; 1] = ["base64"];

impl ObjectDescription {
    /// Looks up a field by API name.
    pub fn field(&self, name: &str) -> Option<&FieldDescription> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names of the fields that can be selected in a multi-record query.
    pub fn projection(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| !UNQUERYABLE_TYPES.contains(&f.field_type.as_str()))
            .map(|f| f.name.as_str())
            .collect()
    }
}

/// One entry of the global describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    /// API name.
    pub name: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Whether the object can be queried.
    #[serde(default)]
    pub queryable: bool,
    /// Whether records can be created.
    #[serde(default)]
    pub createable: bool,
    /// Whether records can be updated.
    #[serde(default)]
    pub updateable: bool,
}

/// Outcome of a create, update, upsert or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    /// Id of the affected record.
    pub id: String,
    /// Whether the record was newly created.
    #[serde(default)]
    pub created: bool,
    /// Always true for results returned as `Ok`.
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

/// Salesforce operations used by the connector.
#[async_trait]
pub trait RemoteApi: Send + Sync + fmt::Debug {
    /// Describes the fields of `sobject`.
    async fn describe(&self, sobject: &str) -> Result<ObjectDescription, RemoteError>;

    /// Lists every sObject visible to the session.
    async fn describe_global(&self) -> Result<Vec<ObjectSummary>, RemoteError>;

    /// Runs a SOQL query.
    ///
    /// The first page is requested before returning so that authentication
    /// failures surface here.
    async fn query(&self, soql: &str) -> Result<RecordStream, RemoteError>;

    /// Inserts a record.
    async fn create(&self, sobject: &str, record: &Record) -> Result<SaveResult, RemoteError>;

    /// Updates the record `id`.
    async fn update(
        &self,
        sobject: &str,
        id: &str,
        record: &Record,
    ) -> Result<SaveResult, RemoteError>;

    /// Inserts or updates by external id.
    async fn upsert(
        &self,
        sobject: &str,
        external_id_field: &str,
        external_id: &str,
        record: &Record,
    ) -> Result<SaveResult, RemoteError>;

    /// Deletes the record `id`.
    async fn delete(&self, sobject: &str, id: &str) -> Result<SaveResult, RemoteError>;
}
