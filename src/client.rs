use std::env;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::observability::{
    CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS, CLIENT_REQUEST_RETRIES, CLIENT_REQUESTS,
    CLIENT_RETRY_BACKOFF,
};
use crate::sse::decode_events;
use crate::types::{HealthStatus, QueryEvent, QueryRequest};

/// Backend used when neither an explicit URL nor the environment names one.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Environment variable consulted for the backend URL.
pub const API_URL_ENV: &str = "LECTERN_API_URL";

const HEALTH_ENDPOINT: &str = "/health";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Something that can answer a question as a stream of events.
///
/// [`Lectern`] is the HTTP implementation; the chat controller only depends on this
/// trait.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Starts answering `request`.  Cancelling `cancel` aborts the request and ends
    /// the returned stream without an error.
    async fn query(&self, request: QueryRequest, cancel: CancellationToken)
    -> Result<QueryStream>;
}

/// Client for the question-answering backend.
#[derive(Debug, Clone)]
pub struct Lectern {
    client: ReqwestClient,
    base_url: String,
    timeout: Duration,
}

impl Lectern {
    /// Create a new client.
    ///
    /// The base URL can be provided directly or read from the `LECTERN_API_URL`
    /// environment variable; failing both, `http://localhost:8000` is used.
    pub fn new(base_url: Option<String>) -> Result<Self> {
        Self::with_options(base_url, None)
    }

    /// Create a new client with custom settings.
    ///
    /// `timeout` bounds connecting and waiting for response headers.  An answer that
    /// has started streaming is not cut off by it.
    pub fn with_options(base_url: Option<String>, timeout: Option<Duration>) -> Result<Self> {
        let base_url = base_url
            .or_else(|| env::var(API_URL_ENV).ok())
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&base_url)?;

        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = ReqwestClient::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Returns the backend base URL, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn stream_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        headers
    }

    fn send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(response: Response) -> Error {
        let status = response.status();
        let retry_after = retry_after_header(&response);
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };
        error_from_parts(status, retry_after, &body)
    }

    /// Ask a question and stream the answer.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryStream> {
        self.query_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Ask a question and stream the answer, aborting when `cancel` fires.
    ///
    /// Cancellation before the response headers arrive yields [`Error::Abort`];
    /// afterwards it simply ends the stream.
    pub async fn query_with_cancel(
        &self,
        request: &QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryStream> {
        let url = self.url_for(request.endpoint());
        debug!(%url, session_id = %request.session_id, "sending query");
        CLIENT_REQUESTS.click();
        let start = Instant::now();

        let send = self
            .client
            .post(&url)
            .headers(Self::stream_headers())
            .json(request)
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("query aborted before response");
                return Err(Error::abort("request cancelled"));
            }
            response = tokio::time::timeout(self.timeout, send) => response,
        };
        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());

        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                CLIENT_REQUEST_ERRORS.click();
                return Err(self.send_error(e));
            }
            Err(_) => {
                CLIENT_REQUEST_ERRORS.click();
                return Err(Error::timeout(
                    format!("No response from {url}"),
                    Some(self.timeout.as_secs_f64()),
                ));
            }
        };

        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            return Err(Self::process_error_response(response).await);
        }

        let events = decode_events(response.bytes_stream(), cancel.clone());
        Ok(QueryStream::new(events, cancel))
    }

    /// Check backend health.
    pub async fn health(&self) -> Result<HealthStatus> {
        let url = self.url_for(HEALTH_ENDPOINT);
        CLIENT_REQUESTS.click();
        let start = Instant::now();
        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                CLIENT_REQUEST_ERRORS.click();
                self.send_error(e)
            })?;
        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            CLIENT_REQUEST_ERRORS.click();
            let retry_after = retry_after_header(&response);
            return Err(status_error(
                status.as_u16(),
                None,
                status_message(status),
                retry_after,
            ));
        }

        response.json::<HealthStatus>().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse health response: {e}"),
                Some(Box::new(e)),
            )
        })
    }
}

#[async_trait]
impl QueryBackend for Lectern {
    async fn query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryStream> {
        self.query_with_cancel(&request, cancel).await
    }
}

fn retry_after_header(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.trim().parse::<u64>().ok())
}

fn status_message(status: StatusCode) -> String {
    format!(
        "HTTP {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

/// Build an error from a failed response's parts.
///
/// Bodies shaped `{error, message, retry_after}` or `{detail: ...}` are understood;
/// anything else falls back to `HTTP <status>: <reason>`.
fn error_from_parts(status: StatusCode, retry_after: Option<u64>, body: &str) -> Error {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let detail = parsed.as_ref().map(|value| match value.get("detail") {
        Some(detail @ Value::Object(_)) => detail,
        _ => value,
    });
    let field = |name: &str| {
        detail
            .and_then(|d| d.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let message = field("message")
        .or_else(|| {
            parsed
                .as_ref()
                .and_then(|v| v.get("detail"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_message(status));
    let code = field("error");
    let retry_after = retry_after.or_else(|| {
        detail
            .and_then(|d| d.get("retry_after"))
            .and_then(Value::as_u64)
    });
    status_error(status.as_u16(), code, message, retry_after)
}

fn status_error(
    status_code: u16,
    code: Option<String>,
    message: String,
    retry_after: Option<u64>,
) -> Error {
    match status_code {
        400 | 422 => Error::bad_request(message, None),
        404 => Error::not_found(message),
        408 => Error::timeout(message, None),
        429 => Error::rate_limit(message, retry_after),
        500 => Error::internal_server(message),
        502..=504 => Error::service_unavailable(message, retry_after),
        _ => Error::api(status_code, code, message),
    }
}

/// A lazily decoded, non-restartable answer stream.
///
/// Yields chunk and citation events followed by one terminal `Done` or `Err`; see
/// [`decode_events`].
pub struct QueryStream {
    inner: Pin<Box<dyn Stream<Item = Result<QueryEvent>> + Send>>,
    cancel: CancellationToken,
}

impl QueryStream {
    /// Wraps an event stream together with the token that cancels it.
    pub fn new<S>(events: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<QueryEvent>> + Send + 'static,
    {
        Self {
            inner: Box::pin(events),
            cancel,
        }
    }

    /// Returns a handle that cancels this stream from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    /// Aborts the underlying request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for QueryStream {
    type Item = Result<QueryEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Cancels an in-flight query.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Aborts the query.  Calling this more than once is harmless.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true if the query has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Exponential backoff schedule for [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each further failure.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay after failed attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `op` until it succeeds, backing off exponentially between attempts.
///
/// Client errors (the 4xx family and local validation failures) and cancellations
/// are returned immediately.  After the last attempt the last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_client_error() || err.is_abort() => return Err(err),
            Err(err) if attempt + 1 >= attempts => return Err(err),
            Err(err) => {
                let delay = policy.delay_for(attempt);
                info!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                CLIENT_REQUEST_RETRIES.click();
                CLIENT_RETRY_BACKOFF.add(delay.as_secs_f64());
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
