//! REST API client bound to one access token and instance.

use crate::cache::ClientFactory;
use crate::config::EffectiveConfig;
use crate::remote::{
    ObjectDescription, ObjectSummary, Record, RecordStream, RemoteApi, RemoteError,
    RemoteErrorKind, SaveResult,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Salesforce error code signalling an expired or revoked session.
const INVALID_SESSION_CODE: &str = "INVALID_SESSION_ID";

/// Error codes that mean the target does not exist.
const NOT_FOUND_CODES: &[&str] = &["NOT_FOUND", "INVALID_TYPE", "ENTITY_IS_DELETED"];

/// One element of a Salesforce error response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    error_code: String,
    #[serde(default)]
    message: String,
}

/// A page of query results.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlobalDescribe {
    #[serde(default)]
    sobjects: Vec<ObjectSummary>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    errors: Vec<ApiError>,
}

/// Client for the Salesforce REST API.
///
/// Bound to the access token, instance URL and API version of the
/// [`EffectiveConfig`] it was built from.
#[derive(Clone, Debug)]
pub struct RestClient {
    http: reqwest::Client,
    instance_url: Url,
    api_version: String,
}

impl RestClient {
    /// Builds a client with bearer authentication and the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteErrorKind::Transport`] error if the instance URL is
    /// malformed or the HTTP client cannot be built, and
    /// [`RemoteErrorKind::InvalidSession`] if the token is not a valid header value.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn new(effective: &EffectiveConfig) -> Result<Self, RemoteError> {
        let instance_url = Url::parse(&effective.credentials.instance_url).map_err(|e| {
            RemoteError::new(
                RemoteErrorKind::Transport,
                format!("Invalid instance URL: {e}"),
            )
        })?;

        let mut headers = reqwest::header::HeaderMap::new();
        let mut bearer = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            effective.credentials.access_token
        ))
        .map_err(|_| {
            RemoteError::new(
                RemoteErrorKind::InvalidSession,
                "Access token is not a valid header value",
            )
        })?;
        bearer.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(effective.connect_timeout)
            .timeout(effective.request_timeout)
            .build()
            .map_err(|e| RemoteError::new(RemoteErrorKind::Transport, e.to_string()))?;

        Ok(Self {
            http,
            instance_url,
            api_version: effective.api_version.clone(),
        })
    }

    /// Builds `{instance}/services/data/v{version}/{segments...}`.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let version = format!("v{}", self.api_version);
        let mut url = self.instance_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                RemoteError::new(RemoteErrorKind::Transport, "Instance URL cannot be a base")
            })?;
            path.pop_if_empty()
                .extend(["services", "data", version.as_str()])
                .extend(segments);
        }
        Ok(url)
    }

    /// Resolves a `nextRecordsUrl` path against the instance.
    fn next_page_url(&self, next: &str) -> Result<Url, RemoteError> {
        self.instance_url
            .join(next)
            .map_err(|e| RemoteError::new(RemoteErrorKind::Decode, e.to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status.as_u16(), &body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        debug!(path = url.path(), "GET");
        let response = self.send(self.http.get(url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::new(RemoteErrorKind::Decode, e.to_string()))
    }

    async fn fetch_page(&self, url: Url) -> Result<QueryPage, RemoteError> {
        self.get_json(url).await
    }
}

/// Where the record stream stands between pages.
enum Pending {
    Page(QueryPage),
    Next(String),
    Done,
}

/// Streams the records of `first` and of every page chained after it.
///
/// `fetch` resolves a `nextRecordsUrl`; it is called only once every record
/// before that page has been yielded.
fn paginate<F, Fut>(first: QueryPage, fetch: F) -> RecordStream
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<QueryPage, RemoteError>> + Send + 'static,
{
    let fetch = Arc::new(fetch);
    stream::try_unfold(Pending::Page(first), move |pending| {
        let fetch = Arc::clone(&fetch);
        async move {
            let page = match pending {
                Pending::Page(page) => page,
                Pending::Next(next) => fetch(next).await?,
                Pending::Done => return Ok(None),
            };
            let pending = match page.next_records_url {
                Some(next) => Pending::Next(next),
                None => Pending::Done,
            };
            Ok::<_, RemoteError>(Some((page.records, pending)))
        }
    })
    .map_ok(|records| stream::iter(records.into_iter().map(Ok::<Record, RemoteError>)))
    .try_flatten()
    .boxed()
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    let message = if error.is_timeout() {
        format!("Request timed out: {error}")
    } else {
        error.to_string()
    };
    RemoteError::new(RemoteErrorKind::Transport, message)
}

/// Maps a non-2xx response onto a [`RemoteError`].
pub(crate) fn classify_failure(status: u16, body: &str) -> RemoteError {
    let first = serde_json::from_str::<Vec<ApiError>>(body)
        .ok()
        .and_then(|errors| errors.into_iter().next());

    let (code, message) = match first {
        Some(e) => (Some(e.error_code), e.message),
        None if body.is_empty() => (None, format!("HTTP {status}")),
        None => (None, body.to_string()),
    };

    let kind = match (status, code.as_deref()) {
        (_, Some(INVALID_SESSION_CODE)) | (401, _) => RemoteErrorKind::InvalidSession,
        (_, Some(c)) if NOT_FOUND_CODES.contains(&c) => RemoteErrorKind::NotFound,
        (404, _) => RemoteErrorKind::NotFound,
        _ => RemoteErrorKind::Rejected,
    };

    let error = RemoteError::new(kind, message);
    match code {
        Some(code) => error.with_code(code),
        None => error,
    }
}

#[async_trait]
impl RemoteApi for RestClient {
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn describe(&self, sobject: &str) -> Result<ObjectDescription, RemoteError> {
        self.get_json(self.endpoint(&["sobjects", sobject, "describe"])?)
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn describe_global(&self) -> Result<Vec<ObjectSummary>, RemoteError> {
        let global: GlobalDescribe = self.get_json(self.endpoint(&["sobjects"])?).await?;
        Ok(global.sobjects)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn query(&self, soql: &str) -> Result<RecordStream, RemoteError> {
        let mut url = self.endpoint(&["query"])?;
        url.query_pairs_mut().append_pair("q", soql);

        let first = self.fetch_page(url).await?;

        let client = self.clone();
        Ok(paginate(first, move |next| {
            let client = client.clone();
            async move { client.fetch_page(client.next_page_url(&next)?).await }
        }))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn create(&self, sobject: &str, record: &Record) -> Result<SaveResult, RemoteError> {
        let url = self.endpoint(&["sobjects", sobject])?;
        let response = self.send(self.http.post(url).json(record)).await?;
        let created: CreateResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::new(RemoteErrorKind::Decode, e.to_string()))?;
        if let Some(error) = created.errors.into_iter().next() {
            return Err(
                RemoteError::new(RemoteErrorKind::Rejected, error.message).with_code(error.error_code)
            );
        }
        Ok(SaveResult {
            id: created.id,
            created: true,
            success: true,
        })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn update(
        &self,
        sobject: &str,
        id: &str,
        record: &Record,
    ) -> Result<SaveResult, RemoteError> {
        let url = self.endpoint(&["sobjects", sobject, id])?;
        self.send(self.http.patch(url).json(&without_id(record)))
            .await?;
        Ok(SaveResult {
            id: id.to_string(),
            created: false,
            success: true,
        })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn upsert(
        &self,
        sobject: &str,
        external_id_field: &str,
        external_id: &str,
        record: &Record,
    ) -> Result<SaveResult, RemoteError> {
        let url = self.endpoint(&["sobjects", sobject, external_id_field, external_id])?;
        let mut body = without_id(record);
        body.remove(external_id_field);

        let response = self.send(self.http.patch(url).json(&body)).await?;
        let created = response.status() == reqwest::StatusCode::CREATED;
        // 204 on update carries no body; the record id is then unknown.
        let id = match response.json::<Value>().await {
            Ok(value) => value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default(),
            Err(_) => String::new(),
        };
        Ok(SaveResult {
            id,
            created,
            success: true,
        })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn delete(&self, sobject: &str, id: &str) -> Result<SaveResult, RemoteError> {
        let url = self.endpoint(&["sobjects", sobject, id])?;
        self.send(self.http.delete(url)).await?;
        Ok(SaveResult {
            id: id.to_string(),
            created: false,
            success: true,
        })
    }
}

/// Salesforce refuses writes that carry `Id` or `attributes` in the body.
fn without_id(record: &Record) -> Record {
    record
        .iter()
        .filter(|(key, _)| key.as_str() != "Id" && key.as_str() != "attributes")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Builds [`RestClient`]s for the [`crate::cache::ClientCache`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RestClientFactory;

impl ClientFactory for RestClientFactory {
    fn build(&self, effective: &EffectiveConfig) -> Result<Arc<dyn RemoteApi>, RemoteError> {
        Ok(Arc::new(RestClient::new(effective)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn effective(instance_url: &str, token: &str) -> EffectiveConfig {
        EffectiveConfig {
            credentials: Credentials {
                access_token: token.to_string(),
                instance_url: instance_url.to_string(),
                refresh_token: None,
            },
            api_version: "58.0".to_string(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_endpoint_construction() {
        let client = RestClient::new(&effective("https://acme.my.salesforce.com", "t")).unwrap();
        let url = client.endpoint(&["sobjects", "Account", "describe"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://acme.my.salesforce.com/services/data/v58.0/sobjects/Account/describe"
        );
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let client = RestClient::new(&effective("https://acme.my.salesforce.com/", "t")).unwrap();
        let url = client
            .endpoint(&["sobjects", "Account", "Ext_Id__c", "a/b c"])
            .unwrap();
        assert!(url.as_str().ends_with("/Ext_Id__c/a%2Fb%20c"));
    }

    #[test]
    fn test_next_page_url() {
        let client = RestClient::new(&effective("https://acme.my.salesforce.com", "t")).unwrap();
        let url = client
            .next_page_url("/services/data/v58.0/query/01gD0000002HU6KIAW-2000")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://acme.my.salesforce.com/services/data/v58.0/query/01gD0000002HU6KIAW-2000"
        );
    }

    #[test]
    fn test_new_with_invalid_instance_url() {
        let result = RestClient::new(&effective("acme.my.salesforce.com", "t"));
        assert!(matches!(
            result,
            Err(RemoteError { kind: RemoteErrorKind::Transport, .. })
        ));
    }

    #[test]
    fn test_new_with_invalid_token_characters() {
        let result = RestClient::new(&effective("https://acme.my.salesforce.com", "tok\nen"));
        assert!(matches!(
            result,
            Err(RemoteError { kind: RemoteErrorKind::InvalidSession, .. })
        ));
    }

    #[test]
    fn test_classify_invalid_session() {
        let body = r#"[{"message":"Session expired or invalid","errorCode":"INVALID_SESSION_ID"}]"#;
        let error = classify_failure(401, body);
        assert_eq!(error.kind, RemoteErrorKind::InvalidSession);
        assert_eq!(error.code.as_deref(), Some("INVALID_SESSION_ID"));
        assert_eq!(error.message, "Session expired or invalid");
    }

    #[test]
    fn test_classify_unauthorized_without_body() {
        let error = classify_failure(401, "");
        assert_eq!(error.kind, RemoteErrorKind::InvalidSession);
        assert_eq!(error.message, "HTTP 401");
    }

    #[test]
    fn test_classify_not_found() {
        let body = r#"[{"errorCode":"NOT_FOUND","message":"The requested resource does not exist"}]"#;
        assert_eq!(classify_failure(404, body).kind, RemoteErrorKind::NotFound);
        assert_eq!(classify_failure(404, "gone").kind, RemoteErrorKind::NotFound);
    }

    #[test]
    fn test_classify_rejected() {
        let body = r#"[{"errorCode":"REQUEST_LIMIT_EXCEEDED","message":"TotalRequests Limit exceeded."}]"#;
        let error = classify_failure(403, body);
        assert_eq!(error.kind, RemoteErrorKind::Rejected);
        assert_eq!(error.code.as_deref(), Some("REQUEST_LIMIT_EXCEEDED"));

        let error = classify_failure(500, "<html>oops</html>");
        assert_eq!(error.kind, RemoteErrorKind::Rejected);
        assert_eq!(error.message, "<html>oops</html>");
    }

    #[test]
    fn test_without_id_strips_system_keys() {
        let record: Record = json!({
            "Id": "001",
            "attributes": {"type": "Account"},
            "Name": "Acme"
        })
        .as_object()
        .cloned()
        .unwrap();
        let body = without_id(&record);
        assert_eq!(body.len(), 1);
        assert_eq!(body["Name"], "Acme");
    }

    fn page(value: Value) -> QueryPage {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_paginate_follows_next_records_url() {
        let first = page(json!({"records": [{"Id": "1"}, {"Id": "2"}], "nextRecordsUrl": "/q-2000"}));
        let records: Vec<Record> = paginate(first, |next| async move {
            assert_eq!(next, "/q-2000");
            Ok::<_, RemoteError>(page(json!({"records": [{"Id": "3"}]})))
        })
        .try_collect()
        .await
        .unwrap();

        let ids: Vec<&str> = records.iter().filter_map(|r| r["Id"].as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_paginate_yields_page_before_fetching_next() {
        let fetched = Arc::new(AtomicUsize::new(0));
        let first = page(json!({"records": [{"Id": "1"}, {"Id": "2"}], "nextRecordsUrl": "/q-2000"}));
        let counter = Arc::clone(&fetched);
        let mut records = paginate(first, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<QueryPage, _>(RemoteError::new(RemoteErrorKind::Transport, "connection reset"))
            }
        });

        assert_eq!(records.try_next().await.unwrap().unwrap()["Id"], "1");
        assert_eq!(records.try_next().await.unwrap().unwrap()["Id"], "2");
        assert_eq!(fetched.load(Ordering::SeqCst), 0);

        let error = records.try_next().await.unwrap_err();
        assert_eq!(error.kind, RemoteErrorKind::Transport);
        assert_eq!(fetched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_query_page_deserialize() {
        let page: QueryPage = serde_json::from_str(
            r#"{"totalSize": 3, "done": false, "nextRecordsUrl": "/services/data/v58.0/query/01g-2000",
                "records": [{"Id": "1"}, {"Id": "2"}]}"#,
        )
        .unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(
            page.next_records_url.as_deref(),
            Some("/services/data/v58.0/query/01g-2000")
        );
    }
}
