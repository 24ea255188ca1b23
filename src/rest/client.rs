use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rest::ratelimit::{now_ms, BucketStore, RateLimitBucket, RouteGuard, Throttle};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const AUDIT_LOG_REASON_HEADER: &str = "x-audit-log-reason";
pub const API_BASE_URL: &str = "https://discord.com/api/v10";
pub const DEFAULT_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_THROTTLE_RETRIES: usize = 3;
    pub const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(60);
    /// Wait applied when a 429 carries no usable retry hint.
    pub const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);
}

/// Bound on automatic retries of throttled (429) responses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThrottlePolicy {
    pub max_retries: usize,
    /// Cumulative `retry-after` budget across the retries of one call.
    pub max_total_wait: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_retries: RestDefaults::MAX_THROTTLE_RETRIES,
            max_total_wait: RestDefaults::MAX_THROTTLE_WAIT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RestClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub throttle: ThrottlePolicy,
    pub user_agent: String,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestDefaults::ATTEMPT_TIMEOUT,
            throttle: ThrottlePolicy::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Prefix of the `Authorization` header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AuthScheme {
    #[default]
    Bot,
    Bearer,
}

impl AuthScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthScheme::Bot => "Bot",
            AuthScheme::Bearer => "Bearer",
        }
    }
}

/// HTTP API client that honours per-route rate limits.
///
/// Clones share the same connection pool and bucket store.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    token: SecretString,
    scheme: AuthScheme,
    base_url: String,
    attempt_timeout: Duration,
    throttle: ThrottlePolicy,
    user_agent: String,
    buckets: Arc<BucketStore>,
}

impl RestClient {
    pub fn new(token: SecretString) -> Result<Self, RestError> {
        Self::with_options(token, RestClientOptions::default())
    }

    pub fn with_options(token: SecretString, options: RestClientOptions) -> Result<Self, RestError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RestError::Transport)?;

        Ok(Self {
            http,
            token,
            scheme: AuthScheme::default(),
            base_url: API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            throttle: options.throttle,
            user_agent: options.user_agent,
            buckets: Arc::new(BucketStore::new()),
        })
    }

    /// Sets an explicit API base URL, e.g. for a local mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn buckets(&self) -> &BucketStore {
        &self.buckets
    }

    /// Executes one logical API call and returns the parsed JSON body.
    ///
    /// The call waits out exhausted buckets before sending and retries 429
    /// responses within the configured [`ThrottlePolicy`]. Transport errors
    /// are returned as-is.
    pub async fn execute(&self, request: &RequestDescriptor) -> Result<Value, RestError> {
        let extra_headers = request.validate()?;
        let mut route = self.buckets.lock(&request.endpoint).await;
        let mut retries = 0usize;
        let mut waited = Duration::ZERO;

        loop {
            self.wait_for_allowance(&route).await;

            let response = self.send_attempt(request, &extra_headers).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await.map_err(RestError::Transport)?;

            if let Some(bucket) = RateLimitBucket::from_headers(&headers) {
                route.update(bucket);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let throttle = Throttle::from_response(&headers, &body);
                let retry_after = throttle
                    .retry_after
                    .unwrap_or(RestDefaults::FALLBACK_RETRY_AFTER);
                if throttle.global {
                    let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                    self.buckets
                        .set_global_until(now_ms().saturating_add(retry_after_ms));
                }

                if retries >= self.throttle.max_retries
                    || waited.saturating_add(retry_after) > self.throttle.max_total_wait
                {
                    return Err(RestError::RateLimited {
                        route: route.key().to_string(),
                        retry_after,
                        retries,
                    });
                }

                retries += 1;
                waited += retry_after;
                warn!(
                    event = "rest_throttled",
                    route = route.key(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    global = throttle.global,
                    retries
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if !status.is_success() {
                return Err(RestError::HttpStatus {
                    status,
                    body: summarize_error_body(&body),
                });
            }

            return parse_body(&body);
        }
    }

    /// Like [`RestClient::execute`], deserializing the body into `T`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: &RequestDescriptor,
    ) -> Result<T, RestError> {
        let value = self.execute(request).await?;
        serde_json::from_value(value).map_err(|err| RestError::Parse(err.to_string()))
    }

    async fn wait_for_allowance(&self, route: &RouteGuard) {
        let now = now_ms();
        let wait = [self.buckets.global_wait(now), route.wait_duration(now)]
            .into_iter()
            .flatten()
            .max();

        if let Some(wait) = wait {
            debug!(
                event = "rest_bucket_wait",
                route = route.key(),
                wait_ms = wait.as_millis() as u64
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn send_attempt(
        &self,
        request: &RequestDescriptor,
        extra_headers: &HeaderMap,
    ) -> Result<Response, RestError> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        let authorization = format!("{} {}", self.scheme.as_str(), self.token.expose_secret());

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .timeout(self.attempt_timeout)
            .header(AUTHORIZATION, authorization)
            .header(USER_AGENT, self.user_agent.as_str())
            .headers(extra_headers.clone());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        debug!(
            event = "rest_request",
            method = %request.method,
            endpoint = %request.endpoint
        );
        builder.send().await.map_err(RestError::Transport)
    }
}

/// One API call: method, endpoint path and optional query, body and headers.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the API base URL, starting with `/`.
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub audit_log_reason: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            audit_log_reason: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn audit_log_reason(mut self, reason: impl Into<String>) -> Self {
        self.audit_log_reason = Some(reason.into());
        self
    }

    /// Checks the descriptor and builds its caller-supplied headers.
    fn validate(&self) -> Result<HeaderMap, RestError> {
        if self.endpoint.trim().is_empty() {
            return Err(RestError::InvalidRequest("endpoint is required".to_string()));
        }
        if !self.endpoint.starts_with('/') {
            return Err(RestError::InvalidRequest(format!(
                "endpoint must start with '/': {}",
                self.endpoint
            )));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                RestError::InvalidRequest(format!("invalid header name: {name}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                RestError::InvalidRequest(format!("invalid value for header {name}"))
            })?;
            headers.insert(name, value);
        }

        if let Some(reason) = self.audit_log_reason.as_deref() {
            let value = HeaderValue::from_str(reason).map_err(|_| {
                RestError::InvalidRequest("audit log reason is not a valid header value".to_string())
            })?;
            headers.insert(AUDIT_LOG_REASON_HEADER, value);
        }

        Ok(headers)
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    /// The descriptor was rejected before any network I/O.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Throttling persisted past the configured retry bound.
    #[error("rate limited on {route} after {retries} retries (retry after {retry_after:?})")]
    RateLimited {
        route: String,
        retry_after: Duration,
        retries: usize,
    },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl RestError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            Self::Transport(err) => err.status(),
            Self::InvalidRequest(_) | Self::Parse(_) => None,
        }
    }
}

fn parse_body(body: &str) -> Result<Value, RestError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| RestError::Parse(err.to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<i64>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match (parsed.message, parsed.code) {
            (Some(message), Some(code)) => return format!("{message} (code {code})"),
            (Some(message), None) => return message,
            _ => {}
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::Method;
    use secrecy::SecretString;
    use serde_json::{json, Value};

    use super::{
        parse_body, summarize_error_body, AuthScheme, RequestDescriptor, RestClient,
        RestClientOptions, RestError, API_BASE_URL,
    };

    #[test]
    fn descriptor_builder_collects_parts() {
        let request = RequestDescriptor::post("/channels/1/messages")
            .query("wait", "true")
            .json(json!({"content": "hi"}))
            .header("x-trace", "abc")
            .audit_log_reason("cleanup");

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.query, vec![("wait".to_string(), "true".to_string())]);
        assert_eq!(request.body, Some(json!({"content": "hi"})));

        let headers = request.validate().expect("valid");
        assert_eq!(headers.get("x-trace").map(|v| v.as_bytes()), Some(&b"abc"[..]));
        assert_eq!(
            headers.get("x-audit-log-reason").map(|v| v.as_bytes()),
            Some(&b"cleanup"[..])
        );
    }

    #[test]
    fn descriptor_without_endpoint_is_rejected() {
        for endpoint in ["", "   ", "channels/1"] {
            let error = RequestDescriptor::get(endpoint)
                .validate()
                .expect_err("invalid endpoint");
            assert!(matches!(error, RestError::InvalidRequest(_)), "{endpoint:?}");
        }
    }

    #[test]
    fn descriptor_with_bad_header_is_rejected() {
        let error = RequestDescriptor::get("/users/@me")
            .header("bad header", "x")
            .validate()
            .expect_err("bad header name");
        assert!(matches!(error, RestError::InvalidRequest(_)));

        let error = RequestDescriptor::get("/users/@me")
            .audit_log_reason("line\nbreak")
            .validate()
            .expect_err("bad reason");
        assert!(matches!(error, RestError::InvalidRequest(_)));
    }

    #[test]
    fn empty_body_parses_as_null() {
        assert_eq!(parse_body("").expect("empty"), Value::Null);
        assert_eq!(parse_body(r#"{"id":"1"}"#).expect("json"), json!({"id": "1"}));
        assert!(matches!(parse_body("<html>"), Err(RestError::Parse(_))));
    }

    #[test]
    fn error_body_prefers_api_message() {
        assert_eq!(
            summarize_error_body(r#"{"message":"Missing Access","code":50001}"#),
            "Missing Access (code 50001)"
        );
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }

    #[test]
    fn client_defaults_and_overrides() {
        let client = RestClient::with_options(
            SecretString::new("token".to_string()),
            RestClientOptions::default(),
        )
        .expect("build client");
        assert_eq!(client.base_url, API_BASE_URL);
        assert_eq!(client.scheme, AuthScheme::Bot);

        let client = client
            .with_base_url(" http://127.0.0.1:8080/api/ ")
            .with_auth_scheme(AuthScheme::Bearer);
        assert_eq!(client.base_url, "http://127.0.0.1:8080/api");
        assert_eq!(client.scheme.as_str(), "Bearer");
    }
}
