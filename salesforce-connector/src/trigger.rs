//! Incremental polling trigger.

use crate::cache::ClientCache;
use crate::config::{self, Configuration, EmitBehavior, Settings};
use crate::credentials::{self, CredentialSource};
use crate::cursor::{format_timestamp, parse_timestamp, PollingCursor, Watermark};
use crate::gate::TokenRefreshGate;
use crate::host::{Emitter, ErrorPayload, Event, Message};
use crate::remote::{ObjectDescription, Record, RemoteError, RemoteErrorKind};
use crate::Error;
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Polls one sObject for records modified since the last snapshot.
///
/// A cycle emits every new or changed record as `data`, in ascending
/// modification order, then exactly one `snapshot` holding the new watermark
/// and finally `end`. A cycle without records emits only `end`. A failed
/// cycle emits a single `error` and never a `snapshot`, so its records are
/// selected again by the next cycle.
#[derive(Debug, Clone)]
pub struct PollingTrigger {
    settings: Arc<Settings>,
    cache: Arc<ClientCache>,
}

impl PollingTrigger {
    /// Creates a trigger sharing `cache` with other invocations.
    pub fn new(settings: Arc<Settings>, cache: Arc<ClientCache>) -> Self {
        Self { settings, cache }
    }

    /// Runs one polling cycle with credentials chosen from `configuration`.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the cycle, after emitting it as an
    /// `error` event.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn process(
        &self,
        message: &Message,
        configuration: &Configuration,
        snapshot: Option<&Value>,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        match credentials::source_for(configuration, &self.settings) {
            Ok(source) => {
                self.process_with(source, message, configuration, snapshot, emitter)
                    .await
            }
            Err(e) => fail(&*emitter, Error::Credentials(e)).await,
        }
    }

    /// Runs one polling cycle with an explicit credential source.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn process_with(
        &self,
        source: Arc<dyn CredentialSource>,
        message: &Message,
        configuration: &Configuration,
        snapshot: Option<&Value>,
        emitter: Arc<dyn Emitter>,
    ) -> Result<(), Error> {
        let gate = TokenRefreshGate::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.cache),
            source,
            Arc::clone(&emitter),
        );

        match self.cycle(&gate, message, configuration, snapshot, &*emitter).await {
            Ok(()) => Ok(()),
            Err(e) => fail(&*emitter, e).await,
        }
    }

    async fn cycle(
        &self,
        gate: &TokenRefreshGate,
        message: &Message,
        configuration: &Configuration,
        snapshot: Option<&Value>,
        emitter: &dyn Emitter,
    ) -> Result<(), Error> {
        let sobject = configuration.sobject()?;
        let watermark = PollingCursor::parse(snapshot, configuration.start_time.as_deref());
        debug!(
            sobject,
            watermark = %watermark.to_literal(),
            message_id = ?message.id,
            "starting polling cycle"
        );

        let description = gate
            .call(configuration, |client| async move { client.describe(sobject).await })
            .await
            .map_err(|e| match e {
                Error::Remote(_) => Error::SchemaDescribeFailed {
                    sobject: sobject.to_string(),
                    source: Box::new(e),
                },
                other => other,
            })?;

        let cursor = PollingCursor::for_object(&description).ok_or_else(|| {
            Error::SchemaDescribeFailed {
                sobject: sobject.to_string(),
                source: Box::new(Error::Remote(RemoteError::new(
                    RemoteErrorKind::NotFound,
                    "object has no modification timestamp field",
                ))),
            }
        })?;

        let soql = build_query(&description, &cursor, &watermark, configuration)?;
        debug!(%soql, "querying");
        let soql = soql.as_str();
        let mut records = gate
            .call(configuration, |client| async move { client.query(soql).await })
            .await?;

        let mut emitted = 0;
        let next = match configuration.emit_behavior {
            EmitBehavior::EmitIndividually => {
                let mut last: Option<Record> = None;
                while let Some(record) = records.try_next().await.map_err(Error::Remote)? {
                    let data = Message {
                        id: record.get("Id").and_then(Value::as_str).map(str::to_string),
                        body: Value::Object(record.clone()),
                        ..Default::default()
                    };
                    emitter
                        .emit(Event::Data(data))
                        .await
                        .map_err(|source| Error::PartialEmission { emitted, source })?;
                    emitted += 1;
                    last = Some(record);
                }
                cursor.next_watermark(watermark, last.as_slice())
            }
            EmitBehavior::EmitAll => {
                let batch: Vec<Record> = records.try_collect().await.map_err(Error::Remote)?;
                if !batch.is_empty() {
                    let results: Vec<Value> = batch.iter().cloned().map(Value::Object).collect();
                    emitter
                        .emit(Event::Data(Message::with_body(json!({ "results": results }))))
                        .await
                        .map_err(|source| Error::PartialEmission { emitted, source })?;
                    emitted = batch.len();
                }
                cursor.next_watermark(watermark, &batch)
            }
        };

        if emitted > 0 {
            info!(sobject, emitted, watermark = %next.to_literal(), "advancing watermark");
            emit(emitter, Event::Snapshot(next.to_snapshot())).await?;
        } else {
            debug!(sobject, "no new records");
        }
        emit(emitter, Event::End).await
    }
}

async fn emit(emitter: &dyn Emitter, event: Event) -> Result<(), Error> {
    let name = event.name();
    emitter
        .emit(event)
        .await
        .map_err(|source| Error::Emit { event: name, source })
}

async fn fail(emitter: &dyn Emitter, e: Error) -> Result<(), Error> {
    error!(kind = e.kind(), error = %e, "polling cycle failed");
    if let Err(emit_error) = emitter.emit(Event::Error(ErrorPayload::from(&e))).await {
        warn!(error = %emit_error, "host did not accept error event");
    }
    Err(e)
}

/// Builds the cycle's SOQL:
/// `SELECT <fields> FROM <sobject> WHERE <lower bound> [AND <ts> < <endTime>] ORDER BY <ts> ASC`.
pub(crate) fn build_query(
    description: &ObjectDescription,
    cursor: &PollingCursor,
    watermark: &Watermark,
    configuration: &Configuration,
) -> Result<String, Error> {
    let mut soql = format!(
        "SELECT {} FROM {} WHERE {}",
        description.projection().join(","),
        description.name,
        cursor.lower_bound_clause(watermark)
    );

    if let Some(raw) = configuration.end_time.as_deref().filter(|s| !s.trim().is_empty()) {
        let end = parse_timestamp(raw).ok_or_else(|| config::Error::InvalidValue {
            name: "endTime",
            value: raw.to_string(),
        })?;
        soql.push_str(&format!(
            " AND {} < {}",
            cursor.timestamp_field(),
            format_timestamp(end)
        ));
    }

    soql.push_str(&format!(" ORDER BY {} ASC", cursor.timestamp_field()));
    Ok(soql)
}
