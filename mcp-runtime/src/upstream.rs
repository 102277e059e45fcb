//! HTTP access to the Instantly REST API and the page-source seam used by the
//! pagination engine.

use std::future::Future;
use std::time::Duration;

use instantly_core::page::Cursor;
use reqwest::Method;
use reqwest::header::RETRY_AFTER;
use serde_json::{Map, Value};
use thiserror::Error;

/// Max characters of an upstream error body echoed back in diagnostics.
const ERROR_BODY_PREVIEW_MAX_CHARS: usize = 400;

/// Failure of a single upstream call, classified for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("failed to reach the Instantly API: {0}")]
    Network(String),
    #[error("rate limited by the Instantly API (status 429)")]
    RateLimited {
        retry_after: Option<Duration>,
        body: Value,
    },
    #[error("Instantly API server error (status {status})")]
    Server { status: u16, body: Value },
    #[error("Instantly API rejected the request (status {status})")]
    Rejected { status: u16, body: Value },
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),
}

impl UpstreamError {
    /// Network failures, 5xx and 429 may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::Network(_) | UpstreamError::RateLimited { .. } | UpstreamError::Server { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::RateLimited { .. } => Some(429),
            UpstreamError::Server { status, .. } | UpstreamError::Rejected { status, .. } => {
                Some(*status)
            }
            UpstreamError::Network(_) | UpstreamError::InvalidUrl(_) => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            UpstreamError::RateLimited { body, .. }
            | UpstreamError::Server { body, .. }
            | UpstreamError::Rejected { body, .. } => Some(body),
            UpstreamError::Network(_) | UpstreamError::InvalidUrl(_) => None,
        }
    }

    /// Classifies a non-success HTTP status. Returns `None` for 2xx.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: Value) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(UpstreamError::RateLimited { retry_after, body }),
            500..=599 => Some(UpstreamError::Server { status, body }),
            _ => Some(UpstreamError::Rejected { status, body }),
        }
    }
}

/// Renders an upstream body for error details, truncated.
pub fn body_preview(body: &Value) -> String {
    let rendered = match body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() <= ERROR_BODY_PREVIEW_MAX_CHARS {
        return rendered;
    }
    let mut preview: String = rendered.chars().take(ERROR_BODY_PREVIEW_MAX_CHARS).collect();
    preview.push('…');
    preview
}

#[derive(Debug)]
pub struct ApiCallResult {
    pub status: u16,
    pub body: Value,
    pub retry_after: Option<Duration>,
}

impl ApiCallResult {
    pub fn into_payload(self) -> Result<Value, UpstreamError> {
        match UpstreamError::from_status(self.status, self.retry_after, self.body.clone()) {
            None => Ok(self.body),
            Some(err) => Err(err),
        }
    }
}

/// Parameters for one page request. Filters are passed through verbatim.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageRequest {
    pub limit: u32,
    pub starting_after: Option<Cursor>,
    pub filters: Map<String, Value>,
}

impl PageRequest {
    pub fn new(limit: u32, starting_after: Option<Cursor>, filters: Map<String, Value>) -> Self {
        Self {
            limit,
            starting_after,
            filters,
        }
    }

    /// The request for the page after `cursor`, same filters.
    pub fn after(&self, cursor: Cursor) -> Self {
        Self {
            starting_after: Some(cursor),
            ..self.clone()
        }
    }

    /// Query-string encoding. Array filters become comma-separated lists.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("limit".to_string(), self.limit.to_string())];
        if let Some(cursor) = &self.starting_after {
            pairs.push(("starting_after".to_string(), cursor.to_string()));
        }
        for (key, value) in &self.filters {
            let rendered = match value {
                Value::Null => continue,
                Value::String(text) => text.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
                other => other.to_string(),
            };
            pairs.push((key.clone(), rendered));
        }
        pairs
    }

    /// JSON-body encoding for list endpoints that take POST.
    pub fn json_body(&self) -> Value {
        let mut body = self.filters.clone();
        body.insert("limit".to_string(), Value::from(self.limit));
        if let Some(cursor) = &self.starting_after {
            body.insert(
                "starting_after".to_string(),
                Value::String(cursor.to_string()),
            );
        }
        Value::Object(body)
    }
}

/// Anything that can produce the raw payload of one list page.
pub trait PageSource {
    fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> impl Future<Output = Result<Value, UpstreamError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMethod {
    Get,
    PostJson,
}

/// One upstream list endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub name: &'static str,
    pub path: &'static [&'static str],
    pub method: ListMethod,
}

pub const CAMPAIGNS: Collection = Collection {
    name: "campaigns",
    path: &["campaigns"],
    method: ListMethod::Get,
};

pub const ACCOUNTS: Collection = Collection {
    name: "accounts",
    path: &["accounts"],
    method: ListMethod::Get,
};

pub const LEADS: Collection = Collection {
    name: "leads",
    path: &["leads", "list"],
    method: ListMethod::PostJson,
};

pub const EMAILS: Collection = Collection {
    name: "emails",
    path: &["emails"],
    method: ListMethod::Get,
};

pub const LEAD_LISTS: Collection = Collection {
    name: "lead_lists",
    path: &["lead-lists"],
    method: ListMethod::Get,
};

/// Thin authenticated client for the Instantly REST API.
#[derive(Debug, Clone)]
pub struct InstantlyApi {
    http: reqwest::Client,
    base_url: String,
}

impl InstantlyApi {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds `<base_url>/<segments...>` with each segment percent-encoded.
    pub fn url_for(&self, segments: &[&str]) -> Result<reqwest::Url, UpstreamError> {
        let mut url = reqwest::Url::parse(self.base_url.trim_end_matches('/'))
            .map_err(|e| UpstreamError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::InvalidUrl(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(String, String)],
        body: Option<Value>,
        api_key: &str,
        timeout: Option<Duration>,
    ) -> Result<ApiCallResult, UpstreamError> {
        let mut url = self.url_for(segments)?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }

        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {api_key}"));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            UpstreamError::Network(format!("{} ({})", e, self.base_url))
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Network(format!("failed to read response body: {e}")))?;

        Ok(ApiCallResult {
            status,
            body: parse_response_body(&bytes),
            retry_after,
        })
    }

    /// GET returning the success payload or a classified error.
    pub async fn get_json(
        &self,
        segments: &[&str],
        query: &[(String, String)],
        api_key: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamError> {
        self.send(Method::GET, segments, query, None, api_key, timeout)
            .await?
            .into_payload()
    }
}

/// Page source over one collection of the live API.
pub struct CollectionSource<'a> {
    api: &'a InstantlyApi,
    collection: Collection,
    api_key: &'a str,
    request_timeout: Duration,
}

impl<'a> CollectionSource<'a> {
    pub fn new(
        api: &'a InstantlyApi,
        collection: Collection,
        api_key: &'a str,
        request_timeout: Duration,
    ) -> Self {
        Self {
            api,
            collection,
            api_key,
            request_timeout,
        }
    }
}

impl PageSource for CollectionSource<'_> {
    fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> impl Future<Output = Result<Value, UpstreamError>> + Send {
        async move {
            let (method, query, body) = match self.collection.method {
                ListMethod::Get => (Method::GET, request.query_pairs(), None),
                ListMethod::PostJson => (Method::POST, Vec::new(), Some(request.json_body())),
            };
            self.api
                .send(
                    method,
                    self.collection.path,
                    &query,
                    body,
                    self.api_key,
                    Some(self.request_timeout),
                )
                .await?
                .into_payload()
        }
    }
}

/// `Retry-After` as delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let seconds = raw.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

pub fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_classification() {
        assert!(UpstreamError::from_status(200, None, Value::Null).is_none());
        assert!(matches!(
            UpstreamError::from_status(429, Some(Duration::from_secs(2)), Value::Null),
            Some(UpstreamError::RateLimited { retry_after: Some(d), .. }) if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            UpstreamError::from_status(503, None, Value::Null),
            Some(UpstreamError::Server { status: 503, .. })
        ));
        assert!(matches!(
            UpstreamError::from_status(404, None, Value::Null),
            Some(UpstreamError::Rejected { status: 404, .. })
        ));
    }

    #[test]
    fn only_network_5xx_and_429_are_transient() {
        assert!(UpstreamError::Network("reset".into()).is_transient());
        assert!(UpstreamError::Server { status: 502, body: Value::Null }.is_transient());
        assert!(UpstreamError::RateLimited { retry_after: None, body: Value::Null }.is_transient());
        assert!(!UpstreamError::Rejected { status: 400, body: Value::Null }.is_transient());
        assert!(!UpstreamError::Rejected { status: 401, body: Value::Null }.is_transient());
        assert!(!UpstreamError::InvalidUrl("nope".into()).is_transient());
    }

    #[test]
    fn retry_after_accepts_delta_seconds_only() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn query_pairs_carry_limit_cursor_and_filters() {
        let mut filters = Map::new();
        filters.insert("search".to_string(), json!("acme"));
        filters.insert("tag_ids".to_string(), json!(["t1", "t2"]));
        filters.insert("status".to_string(), json!(1));
        filters.insert("ignored".to_string(), Value::Null);
        let request = PageRequest::new(100, Cursor::new("c1"), filters);

        let pairs = request.query_pairs();
        assert_eq!(pairs[0], ("limit".to_string(), "100".to_string()));
        assert_eq!(pairs[1], ("starting_after".to_string(), "c1".to_string()));
        assert!(pairs.contains(&("search".to_string(), "acme".to_string())));
        assert!(pairs.contains(&("tag_ids".to_string(), "t1,t2".to_string())));
        assert!(pairs.contains(&("status".to_string(), "1".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "ignored"));
    }

    #[test]
    fn next_request_keeps_filters() {
        let mut filters = Map::new();
        filters.insert("campaign".to_string(), json!("cmp-1"));
        let first = PageRequest::new(50, None, filters);
        let next = first.after(Cursor::new("lead-50").unwrap());
        assert_eq!(next.filters, first.filters);
        assert_eq!(next.limit, 50);

        let body = next.json_body();
        assert_eq!(body["campaign"], "cmp-1");
        assert_eq!(body["limit"], 50);
        assert_eq!(body["starting_after"], "lead-50");
    }

    #[test]
    fn url_for_encodes_segments() {
        let api = InstantlyApi::new(reqwest::Client::new(), "https://api.instantly.ai/api/v2/");
        let url = api.url_for(&["accounts", "ops@acme.io"]).unwrap();
        assert_eq!(url.as_str(), "https://api.instantly.ai/api/v2/accounts/ops@acme.io");

        let url = api.url_for(&["leads", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "https://api.instantly.ai/api/v2/leads/a%2Fb");
    }

    #[test]
    fn invalid_base_url_is_reported() {
        let api = InstantlyApi::new(reqwest::Client::new(), "not a url");
        assert!(matches!(api.url_for(&["campaigns"]), Err(UpstreamError::InvalidUrl(_))));
    }

    #[test]
    fn non_json_body_is_kept_as_text() {
        assert_eq!(parse_response_body(b""), Value::Null);
        assert_eq!(parse_response_body(b"{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_response_body(b"Bad Gateway"), json!("Bad Gateway"));
    }
}
