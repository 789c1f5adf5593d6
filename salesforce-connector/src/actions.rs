//! Single-call actions: record writes, lookup, raw query and object listing.
//!
//! Each action runs one gate-wrapped operation and reports it to the host as
//! one `data` event followed by `end`, or as a single `error` event.

use crate::cache::ClientCache;
use crate::config::{Configuration, Settings};
use crate::credentials;
use crate::gate::TokenRefreshGate;
use crate::host::{Emitter, ErrorPayload, Event, Message};
use crate::remote::{FieldDescription, Record, SaveResult};
use crate::Error;
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Runs actions against Salesforce on behalf of the host.
#[derive(Debug, Clone)]
pub struct Actions {
    settings: Arc<Settings>,
    cache: Arc<ClientCache>,
}

impl Actions {
    /// Creates the action set sharing `cache` with other invocations.
    pub fn new(settings: Arc<Settings>, cache: Arc<ClientCache>) -> Self {
        Self { settings, cache }
    }

    /// Inserts the message body as a new record of `configuration.sobject`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn create(
        &self,
        message: &Message,
        configuration: &Configuration,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        let result = async {
            let gate = self.gate(configuration, &emitter)?;
            let sobject = configuration.sobject()?;
            let record = &body_record(message)?;
            let saved = gate
                .call(configuration, |client| async move {
                    client.create(sobject, record).await
                })
                .await?;
            Ok::<_, Error>(save_result(&saved))
        }
        .await;
        finish(&*emitter, "create", result).await
    }

    /// Updates the record identified by the body's `Id`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn update(
        &self,
        message: &Message,
        configuration: &Configuration,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        let result = async {
            let gate = self.gate(configuration, &emitter)?;
            let sobject = configuration.sobject()?;
            let record = &body_record(message)?;
            let id = required_str(record, "Id")?;
            let saved = gate
                .call(configuration, |client| async move {
                    client.update(sobject, id, record).await
                })
                .await?;
            Ok::<_, Error>(save_result(&saved))
        }
        .await;
        finish(&*emitter, "update", result).await
    }

    /// Inserts or updates by `configuration.external_id_field`, whose value
    /// is taken from the body.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn upsert(
        &self,
        message: &Message,
        configuration: &Configuration,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        let result = async {
            let gate = self.gate(configuration, &emitter)?;
            let sobject = configuration.sobject()?;
            let field = configuration
                .external_id_field
                .as_deref()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| Error::MissingRequiredAttribute("externalIdField".to_string()))?;
            let record = &body_record(message)?;
            let external_id = &scalar(record, field)?;
            let saved = gate
                .call(configuration, |client| async move {
                    client.upsert(sobject, field, external_id, record).await
                })
                .await?;
            Ok::<_, Error>(save_result(&saved))
        }
        .await;
        finish(&*emitter, "upsert", result).await
    }

    /// Deletes the record identified by the body's `Id`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete(
        &self,
        message: &Message,
        configuration: &Configuration,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        let result = async {
            let gate = self.gate(configuration, &emitter)?;
            let sobject = configuration.sobject()?;
            let record = &body_record(message)?;
            let id = required_str(record, "Id")?;
            let saved = gate
                .call(configuration, |client| async move { client.delete(sobject, id).await })
                .await?;
            Ok::<_, Error>(save_result(&saved))
        }
        .await;
        finish(&*emitter, "delete", result).await
    }

    /// Finds records whose `configuration.lookup_field` equals the body's value
    /// for that field.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn lookup(
        &self,
        message: &Message,
        configuration: &Configuration,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        let result = async {
            let gate = self.gate(configuration, &emitter)?;
            let sobject = configuration.sobject()?;
            let field = configuration
                .lookup_field
                .as_deref()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| Error::MissingRequiredAttribute("lookupField".to_string()))?;
            let record = body_record(message)?;
            let value = scalar_value(&record, field)?;

            let description = gate
                .call(configuration, |client| async move {
                    client.describe(sobject).await
                })
                .await?;
            let described = description.field(field).ok_or_else(|| Error::UnknownField {
                sobject: description.name.clone(),
                field: field.to_string(),
            })?;
            let soql = format!(
                "SELECT {} FROM {} WHERE {} = {}",
                description.projection().join(","),
                description.name,
                described.name,
                soql_literal(described, value)?
            );
            let results = run_query(&gate, configuration, &soql).await?;
            Ok::<_, Error>(json!({ "results": results }))
        }
        .await;
        finish(&*emitter, "lookup", result).await
    }

    /// Runs the SOQL in the body's `query` attribute.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn query(
        &self,
        message: &Message,
        configuration: &Configuration,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        let result = async {
            let gate = self.gate(configuration, &emitter)?;
            let soql = message
                .body
                .get("query")
                .and_then(Value::as_str)
                .filter(|q| !q.trim().is_empty())
                .ok_or_else(|| Error::MissingRequiredAttribute("query".to_string()))?;
            let results = run_query(&gate, configuration, soql).await?;
            Ok::<_, Error>(json!({ "results": results }))
        }
        .await;
        finish(&*emitter, "query", result).await
    }

    /// Lists queryable objects as API name → label.
    ///
    /// Refreshed credentials are still reported through `emitter`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn object_types(
        &self,
        configuration: &Configuration,
        emitter: Arc<dyn Emitter>,
    ) -> Result<BTreeMap<String, String>, Error> {
        let gate = self.gate(configuration, &emitter)?;
        let objects = gate
            .call(configuration, |client| async move { client.describe_global().await })
            .await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.queryable)
            .map(|o| (o.name, o.label))
            .collect())
    }

    fn gate(
        &self,
        configuration: &Configuration,
        emitter: &Arc<dyn Emitter>,
    ) -> Result<TokenRefreshGate, Error> {
        let source = credentials::source_for(configuration, &self.settings)?;
        Ok(TokenRefreshGate::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.cache),
            source,
            Arc::clone(emitter),
        ))
    }
}

async fn run_query(
    gate: &TokenRefreshGate,
    configuration: &Configuration,
    soql: &str,
) -> Result<Vec<Value>, Error> {
    debug!(%soql, "querying");
    let records = gate
        .call(configuration, |client| async move { client.query(soql).await })
        .await?;
    let records: Vec<Record> = records.try_collect().await.map_err(Error::Remote)?;
    Ok(records.into_iter().map(Value::Object).collect())
}

async fn finish(
    emitter: &dyn Emitter,
    action: &str,
    result: Result<Value, Error>,
) -> Result<(), Error> {
    match result {
        Ok(body) => {
            emitter
                .emit(Event::Data(Message::with_body(body)))
                .await
                .map_err(|source| Error::Emit {
                    event: "data",
                    source,
                })?;
            emitter.emit(Event::End).await.map_err(|source| Error::Emit {
                event: "end",
                source,
            })
        }
        Err(e) => {
            error!(action, kind = e.kind(), error = %e, "action failed");
            if let Err(emit_error) = emitter.emit(Event::Error(ErrorPayload::from(&e))).await {
                warn!(error = %emit_error, "host did not accept error event");
            }
            Err(e)
        }
    }
}

fn save_result(saved: &SaveResult) -> Value {
    json!({ "id": saved.id, "success": saved.success, "created": saved.created })
}

fn body_record(message: &Message) -> Result<Record, Error> {
    match &message.body {
        Value::Object(record) => Ok(record.clone()),
        other => Err(Error::InvalidBody(format!(
            "expected a JSON object, got {}",
            type_name(other)
        ))),
    }
}

fn required_str<'a>(record: &'a Record, field: &str) -> Result<&'a str, Error> {
    record
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MissingRequiredAttribute(field.to_string()))
}

/// Reads `field` as a non-empty string, a number or a boolean.
fn scalar_value<'a>(record: &'a Record, field: &str) -> Result<&'a Value, Error> {
    match record.get(field) {
        Some(value @ (Value::Number(_) | Value::Bool(_))) => Ok(value),
        Some(value @ Value::String(s)) if !s.is_empty() => Ok(value),
        _ => Err(Error::MissingRequiredAttribute(field.to_string())),
    }
}

/// Reads `field` as text; numbers and booleans are rendered as written.
fn scalar(record: &Record, field: &str) -> Result<String, Error> {
    Ok(match scalar_value(record, field)? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Field types compared against quoted SOQL literals.
const QUOTED_TYPES: &[&str] = &[
    "string",
    "id",
    "reference",
    "picklist",
    "multipicklist",
    "combobox",
    "email",
    "phone",
    "url",
    "textarea",
    "encryptedstring",
];

/// Renders a scalar as the right-hand side of a comparison with `field`.
///
/// Text fields get an escaped, quoted literal. Numbers, booleans and
/// date/time values go in bare, so a string is only accepted there when it
/// holds nothing but a literal's characters.
fn soql_literal(field: &FieldDescription, value: &Value) -> Result<String, Error> {
    if QUOTED_TYPES.contains(&field.field_type.as_str()) {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(format!("'{}'", escape_soql(&text)));
    }
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::String(s) if is_bare_literal(s) => Ok(s.clone()),
        other => Err(Error::InvalidBody(format!(
            "{} is not a valid {} value for {}",
            other, field.field_type, field.name
        ))),
    }
}

fn is_bare_literal(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | ':' | '.'))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Escapes a value for use inside a single-quoted SOQL literal.
pub fn escape_soql(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            _ => escaped.push(c),
        }
    }
    escaped
}
