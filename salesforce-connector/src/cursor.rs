//! Snapshot watermark for incremental polling.
//!
//! A polling cycle selects records modified at or after the watermark, in
//! ascending timestamp order. The watermark only moves forward, and only once
//! every record of a cycle reached the host.

use crate::remote::{ObjectDescription, Record};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::warn;

/// Key of the watermark inside the persisted snapshot.
pub const SNAPSHOT_KEY: &str = "previousLastModified";

/// Watermark used when no usable snapshot exists.
pub const EPOCH: &str = "1970-01-01T00:00:00.000Z";

/// Modification timestamp fields, in order of preference.
pub const TIMESTAMP_FIELDS: [&str; 3] = ["LastModifiedDate", "SystemModstamp", "CreatedDate"];

/// Whether a watermark comes from a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// First cycle: the lower bound is inclusive.
    NoHistory,
    /// A non-empty cycle has completed: the lower bound is exclusive.
    HasHistory,
}

/// Point in time up to which records have been emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    at: DateTime<Utc>,
    state: CursorState,
}

impl Watermark {
    /// The default watermark, `1970-01-01T00:00:00.000Z` without history.
    pub fn epoch() -> Self {
        Self {
            at: DateTime::<Utc>::UNIX_EPOCH,
            state: CursorState::NoHistory,
        }
    }

    /// Timestamp of the watermark.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// History state of the watermark.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Millisecond ISO-8601 form, usable both in SOQL and in the snapshot.
    pub fn to_literal(&self) -> String {
        format_timestamp(self.at)
    }

    /// The snapshot payload to persist.
    pub fn to_snapshot(&self) -> Value {
        json!({ SNAPSHOT_KEY: self.to_literal() })
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::epoch()
    }
}

/// Formats `at` as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses ISO-8601 timestamps as Salesforce and hosts write them.
///
/// Accepts RFC 3339 (`2020-01-02T00:00:00.000Z`), the Salesforce offset form
/// (`2020-01-02T00:00:00.000+0000`) and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
}

/// Computes query bounds and next watermarks for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingCursor {
    timestamp_field: String,
}

impl PollingCursor {
    /// Creates a cursor ordering on `timestamp_field`.
    pub fn new(timestamp_field: impl Into<String>) -> Self {
        Self {
            timestamp_field: timestamp_field.into(),
        }
    }

    /// Picks the first field of [`TIMESTAMP_FIELDS`] present in `description`.
    pub fn for_object(description: &ObjectDescription) -> Option<Self> {
        TIMESTAMP_FIELDS
            .iter()
            .find(|name| description.field(name).is_some())
            .map(|name| Self::new(*name))
    }

    /// Field the cursor orders and filters on.
    pub fn timestamp_field(&self) -> &str {
        &self.timestamp_field
    }

    /// Reads the watermark from a persisted snapshot.
    ///
    /// Never fails: a missing, empty or malformed snapshot yields `start_time`
    /// when it parses, otherwise the epoch. A valid snapshot is returned
    /// unchanged with [`CursorState::HasHistory`] unless it is the epoch itself.
    pub fn parse(snapshot: Option<&Value>, start_time: Option<&str>) -> Watermark {
        if let Some(at) = snapshot.and_then(snapshot_timestamp) {
            let state = if at == DateTime::<Utc>::UNIX_EPOCH {
                CursorState::NoHistory
            } else {
                CursorState::HasHistory
            };
            return Watermark { at, state };
        }

        if let Some(snapshot) = snapshot.filter(|s| !is_blank(s)) {
            warn!(%snapshot, "ignoring malformed snapshot");
        }

        match start_time.filter(|s| !s.trim().is_empty()) {
            Some(raw) => match parse_timestamp(raw) {
                Some(at) => Watermark {
                    at,
                    state: CursorState::NoHistory,
                },
                None => {
                    warn!(start_time = raw, "ignoring unparsable startTime");
                    Watermark::epoch()
                }
            },
            None => Watermark::epoch(),
        }
    }

    /// The `WHERE` fragment selecting records after `watermark`.
    ///
    /// Inclusive without history so that records stamped exactly at the
    /// starting point are captured; exclusive afterwards so the boundary record
    /// of the previous cycle is not emitted again.
    pub fn lower_bound_clause(&self, watermark: &Watermark) -> String {
        let operator = match watermark.state {
            CursorState::NoHistory => ">=",
            CursorState::HasHistory => ">",
        };
        format!(
            "{} {} {}",
            self.timestamp_field,
            operator,
            watermark.to_literal()
        )
    }

    /// Watermark to persist after `records` were all emitted.
    ///
    /// `records` must be in ascending timestamp order. The result is the
    /// timestamp of the last record, never earlier than `previous`. An empty
    /// batch leaves `previous` unchanged.
    pub fn next_watermark(&self, previous: Watermark, records: &[Record]) -> Watermark {
        if records.is_empty() {
            return previous;
        }

        let last = records
            .iter()
            .rev()
            .find_map(|record| self.record_timestamp(record));
        if last.is_none() {
            warn!(field = %self.timestamp_field, "no record carried a parsable timestamp");
        }

        Watermark {
            at: last.map_or(previous.at, |at| at.max(previous.at)),
            state: CursorState::HasHistory,
        }
    }

    /// Timestamp of `record` in the cursor's field.
    pub fn record_timestamp(&self, record: &Record) -> Option<DateTime<Utc>> {
        record
            .get(&self.timestamp_field)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }
}

fn is_blank(snapshot: &Value) -> bool {
    match snapshot {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Extracts the watermark from `{"previousLastModified": ...}`, from that object
/// serialized as a string, or from a bare timestamp string.
fn snapshot_timestamp(snapshot: &Value) -> Option<DateTime<Utc>> {
    match snapshot {
        Value::Object(map) => map
            .get(SNAPSHOT_KEY)
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(inner @ Value::Object(_)) => snapshot_timestamp(&inner),
            _ => parse_timestamp(raw),
        },
        _ => None,
    }
}
