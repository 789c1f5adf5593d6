//! Scripted collaborators shared by the unit tests.

use crate::cache::ClientFactory;
use crate::config::{Configuration, Credentials, EffectiveConfig, OAuthConfig};
use crate::credentials::{self, CredentialSource};
use crate::host::{EmitError, Emitter, Event};
use crate::remote::{
    FieldDescription, ObjectDescription, ObjectSummary, Record, RecordStream, RemoteApi,
    RemoteError, RemoteErrorKind, SaveResult,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn invalid_session() -> RemoteError {
    RemoteError::new(RemoteErrorKind::InvalidSession, "Session expired or invalid")
        .with_code("INVALID_SESSION_ID")
}

pub fn rejected(message: &str) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Rejected, message).with_code("MALFORMED_QUERY")
}

pub fn record(id: &str, last_modified: &str) -> Record {
    let mut record = Record::new();
    record.insert("attributes".to_string(), json!({"type": "Account"}));
    record.insert("Id".to_string(), json!(id));
    record.insert("Name".to_string(), json!(format!("Account {id}")));
    record.insert("LastModifiedDate".to_string(), json!(last_modified));
    record
}

pub fn account_description() -> ObjectDescription {
    let field = |name: &str, field_type: &str| FieldDescription {
        name: name.to_string(),
        label: name.to_string(),
        field_type: field_type.to_string(),
    };
    ObjectDescription {
        name: "Account".to_string(),
        label: "Account".to_string(),
        fields: vec![
            field("Id", "id"),
            field("Name", "string"),
            field("Logo", "base64"),
            field("LastModifiedDate", "datetime"),
        ],
    }
}

/// Configuration with static credentials for `sobject`.
pub fn static_configuration(sobject: &str) -> Configuration {
    Configuration {
        sobject: Some(sobject.to_string()),
        oauth: Some(OAuthConfig {
            access_token: "token-0".to_string(),
            instance_url: "https://acme.my.salesforce.com".to_string(),
            refresh_token: None,
        }),
        ..Default::default()
    }
}

#[derive(Debug, Default)]
struct FakeState {
    description: Option<ObjectDescription>,
    objects: Vec<ObjectSummary>,
    records: Vec<Record>,
    stream_error: Option<RemoteError>,
    describe_error: Option<RemoteError>,
    query_error: Option<RemoteError>,
    failures: VecDeque<RemoteError>,
    always: Option<RemoteError>,
    calls: usize,
    tokens: Vec<String>,
    queries: Vec<String>,
    saved: Vec<(String, String, Record)>,
}

/// In-memory [`RemoteApi`]. Clones share their script and call log.
#[derive(Debug, Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
    token: Option<String>,
}

impl FakeRemote {
    pub fn with_description(self, description: ObjectDescription) -> Self {
        self.state.lock().unwrap().description = Some(description);
        self
    }

    pub fn with_records(self, records: Vec<Record>) -> Self {
        self.state.lock().unwrap().records = records;
        self
    }

    pub fn with_objects(self, objects: Vec<ObjectSummary>) -> Self {
        self.state.lock().unwrap().objects = objects;
        self
    }

    /// Ends the record stream with `error` after the scripted records.
    pub fn with_stream_error(self, error: RemoteError) -> Self {
        self.state.lock().unwrap().stream_error = Some(error);
        self
    }

    pub fn fail_describe(self, error: RemoteError) -> Self {
        self.state.lock().unwrap().describe_error = Some(error);
        self
    }

    pub fn fail_query(self, error: RemoteError) -> Self {
        self.state.lock().unwrap().query_error = Some(error);
        self
    }

    /// Fails the next call, whichever operation it is.
    pub fn fail_next(self, error: RemoteError) -> Self {
        self.state.lock().unwrap().failures.push_back(error);
        self
    }

    pub fn fail_always(self, error: RemoteError) -> Self {
        self.state.lock().unwrap().always = Some(error);
        self
    }

    /// Replaces the script of records returned by later queries.
    pub fn set_records(&self, records: Vec<Record>) {
        self.state.lock().unwrap().records = records;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    /// Access tokens of the clients that served each call.
    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().tokens.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    /// `(operation, sobject, record)` for every write.
    pub fn saved(&self) -> Vec<(String, String, Record)> {
        self.state.lock().unwrap().saved.clone()
    }

    fn bound_to(&self, token: &str) -> Self {
        Self {
            state: Arc::clone(&self.state),
            token: Some(token.to_string()),
        }
    }

    fn begin(&self) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.tokens.push(self.token.clone().unwrap_or_default());
        if let Some(error) = &state.always {
            return Err(error.clone());
        }
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn save(
        &self,
        operation: &str,
        sobject: &str,
        record: &Record,
        id: &str,
        created: bool,
    ) -> SaveResult {
        self.state.lock().unwrap().saved.push((
            operation.to_string(),
            sobject.to_string(),
            record.clone(),
        ));
        SaveResult {
            id: id.to_string(),
            created,
            success: true,
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn describe(&self, sobject: &str) -> Result<ObjectDescription, RemoteError> {
        self.begin()?;
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.describe_error {
            return Err(error.clone());
        }
        state.description.clone().ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("The requested resource does not exist: {sobject}"),
            )
            .with_code("NOT_FOUND")
        })
    }

    async fn describe_global(&self) -> Result<Vec<ObjectSummary>, RemoteError> {
        self.begin()?;
        Ok(self.state.lock().unwrap().objects.clone())
    }

    async fn query(&self, soql: &str) -> Result<RecordStream, RemoteError> {
        self.begin()?;
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.query_error {
            return Err(error.clone());
        }
        state.queries.push(soql.to_string());
        let mut items: Vec<Result<Record, RemoteError>> =
            state.records.iter().cloned().map(Ok).collect();
        if let Some(error) = &state.stream_error {
            items.push(Err(error.clone()));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn create(&self, sobject: &str, record: &Record) -> Result<SaveResult, RemoteError> {
        self.begin()?;
        Ok(self.save("create", sobject, record, "001000000000001AAA", true))
    }

    async fn update(
        &self,
        sobject: &str,
        id: &str,
        record: &Record,
    ) -> Result<SaveResult, RemoteError> {
        self.begin()?;
        Ok(self.save("update", sobject, record, id, false))
    }

    async fn upsert(
        &self,
        sobject: &str,
        _external_id_field: &str,
        _external_id: &str,
        record: &Record,
    ) -> Result<SaveResult, RemoteError> {
        self.begin()?;
        Ok(self.save("upsert", sobject, record, "001000000000002AAA", true))
    }

    async fn delete(&self, sobject: &str, id: &str) -> Result<SaveResult, RemoteError> {
        self.begin()?;
        Ok(self.save("delete", sobject, &Record::new(), id, false))
    }
}

/// [`ClientFactory`] handing out views of one [`FakeRemote`], counting builds.
#[derive(Debug)]
pub struct CountingFactory {
    remote: FakeRemote,
    builds: AtomicUsize,
}

impl CountingFactory {
    pub fn new(remote: FakeRemote) -> Self {
        Self {
            remote,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ClientFactory for CountingFactory {
    fn build(&self, effective: &EffectiveConfig) -> Result<Arc<dyn RemoteApi>, RemoteError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(
            self.remote.bound_to(&effective.credentials.access_token),
        ))
    }
}

/// [`CredentialSource`] issuing `token-N` on the N-th refresh.
#[derive(Debug)]
pub struct CountingSource {
    rotates: bool,
    fail_refresh: bool,
    fetches: AtomicU32,
    refreshes: AtomicU32,
}

impl CountingSource {
    pub fn rotating() -> Self {
        Self {
            rotates: true,
            fail_refresh: false,
            fetches: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
        }
    }

    pub fn fixed() -> Self {
        Self {
            rotates: false,
            ..Self::rotating()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_refresh: true,
            ..Self::rotating()
        }
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingSource {
    async fn fetch(&self) -> Result<Credentials, credentials::Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Credentials {
            access_token: "token-0".to_string(),
            instance_url: "https://acme.my.salesforce.com".to_string(),
            refresh_token: Some("refresh".to_string()),
        })
    }

    async fn refresh(&self) -> Result<String, credentials::Error> {
        if self.fail_refresh {
            return Err(credentials::Error::NoRefreshToken);
        }
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.rotates {
            Ok(format!("token-{n}"))
        } else {
            Ok("token-0".to_string())
        }
    }

    fn rotates(&self) -> bool {
        self.rotates
    }
}

/// [`Emitter`] that records every event it accepts.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<Event>>,
    reject_data_after: Option<usize>,
    reject_update_keys: bool,
}

impl RecordingEmitter {
    /// Rejects every `data` event once `accepted` have gone through.
    pub fn rejecting_data_after(accepted: usize) -> Self {
        Self {
            reject_data_after: Some(accepted),
            ..Default::default()
        }
    }

    pub fn rejecting_update_keys() -> Self {
        Self {
            reject_update_keys: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    pub fn data(&self) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Data(message) => Some(message.body),
                _ => None,
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Snapshot(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Emitter for RecordingEmitter {
    async fn emit(&self, event: Event) -> Result<(), EmitError> {
        let mut events = self.events.lock().unwrap();
        let rejected = match &event {
            Event::Data(_) => self.reject_data_after.is_some_and(|limit| {
                events.iter().filter(|e| matches!(e, Event::Data(_))).count() >= limit
            }),
            Event::UpdateKeys(_) => self.reject_update_keys,
            _ => false,
        };
        if rejected {
            return Err(EmitError::Rejected {
                event: event.name(),
                message: "host unavailable".to_string(),
            });
        }
        events.push(event);
        Ok(())
    }
}
