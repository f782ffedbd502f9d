//! HTTP request dispatcher with admission control, cancellation and timeouts.
//!
//! Every request is admitted by a sliding-window [`RateLimiter`], given a
//! monotonically increasing id and tracked in an in-flight table until it
//! settles. Settling (success, error, timeout or cancel) always removes the
//! table entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use sitelift_core::error::AppError;
use sitelift_core::models::{FileUpload, ResponseBody};
use sitelift_core::rate_limit::{RateLimitConfig, RateLimiter};
use sitelift_core::traits::{ApiClient, TokenStore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Configuration for the request dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Endpoints are resolved against this; always ends with `/`.
    pub base_url: Url,
    pub default_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub user_agent: String,
}

impl DispatcherConfig {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid API base URL '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            default_timeout: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            user_agent: "Sitelift/0.1".to_string(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Request body.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Json(serde_json::Value),
    File(FileUpload),
}

/// One request/response exchange.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, e.g. `extractions/42/design`.
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub payload: Payload,
    /// Overrides the dispatcher's default timeout.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            payload: Payload::None,
            timeout: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, endpoint).with_json(body)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    pub fn with_file(mut self, file: FileUpload) -> Self {
        self.payload = Payload::File(file);
        self
    }

    /// Append the fields of a JSON object as query parameters. Nulls are
    /// skipped; non-string values use their JSON text.
    pub fn with_query(mut self, params: &serde_json::Value) -> Self {
        if let Some(map) = params.as_object() {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::Null => continue,
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.query.push((key.clone(), value));
            }
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn sends_body(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD
    }
}

/// A dispatched request. The id is known before the response arrives.
pub struct RequestHandle {
    id: u64,
    task: JoinHandle<Result<ResponseBody, AppError>>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn response(self) -> Result<ResponseBody, AppError> {
        self.task
            .await
            .map_err(|e| AppError::NetworkError(format!("Request task failed: {e}")))?
    }
}

struct InFlight {
    cancel: CancellationToken,
    created_at: Instant,
}

struct Inner<T> {
    client: Client,
    config: DispatcherConfig,
    tokens: T,
    limiter: RateLimiter,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, InFlight>>,
}

/// HTTP dispatcher using reqwest. Cheap to clone; clones share the rate
/// limit window and the in-flight table.
#[derive(Clone)]
pub struct RequestDispatcher<T: TokenStore> {
    inner: Arc<Inner<T>>,
}

impl<T: TokenStore> RequestDispatcher<T> {
    pub fn new(config: DispatcherConfig, tokens: T) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                limiter: RateLimiter::new(config.rate_limit.clone()),
                config,
                tokens,
                next_id: AtomicU64::new(1),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<u64, InFlight>> {
        self.inner.in_flight.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned in-flight table mutex");
            poisoned.into_inner()
        })
    }

    /// Admit and start a request. Fails synchronously with
    /// `RateLimitExceeded` when the window is full; nothing is sent then.
    pub fn begin(&self, request: ApiRequest) -> Result<RequestHandle, AppError> {
        let cancel = CancellationToken::new();
        let id = {
            let mut table = self.lock_table();
            self.inner.limiter.check()?;
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            table.insert(
                id,
                InFlight {
                    cancel: cancel.clone(),
                    created_at: Instant::now(),
                },
            );
            id
        };

        let timeout = request.timeout.unwrap_or(self.inner.config.default_timeout);
        tracing::debug!(
            id,
            method = %request.method,
            endpoint = %request.endpoint,
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching request"
        );

        let this = self.clone();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AppError::RequestAborted),
                _ = tokio::time::sleep(timeout) => Err(AppError::RequestTimeout(timeout)),
                result = this.perform(request, timeout) => result,
            };
            this.settle(id, result)
        });

        Ok(RequestHandle { id, task })
    }

    /// Dispatch and wait for the response.
    pub async fn send(&self, request: ApiRequest) -> Result<ResponseBody, AppError> {
        self.begin(request)?.response().await
    }

    pub async fn get(
        &self,
        endpoint: &str,
        params: &serde_json::Value,
    ) -> Result<ResponseBody, AppError> {
        self.send(ApiRequest::get(endpoint).with_query(params)).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ResponseBody, AppError> {
        self.send(ApiRequest::post(endpoint, body)).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ResponseBody, AppError> {
        self.send(ApiRequest::new(Method::PUT, endpoint).with_json(body))
            .await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ResponseBody, AppError> {
        self.send(ApiRequest::new(Method::PATCH, endpoint).with_json(body))
            .await
    }

    pub async fn delete(
        &self,
        endpoint: &str,
        params: &serde_json::Value,
    ) -> Result<ResponseBody, AppError> {
        self.send(ApiRequest::new(Method::DELETE, endpoint).with_query(params))
            .await
    }

    /// POST one file as `multipart/form-data`.
    pub async fn upload_file(
        &self,
        endpoint: &str,
        file: FileUpload,
    ) -> Result<ResponseBody, AppError> {
        self.send(ApiRequest::new(Method::POST, endpoint).with_file(file))
            .await
    }

    /// Abort one in-flight request. Returns false for unknown or settled ids.
    pub fn cancel_request(&self, id: u64) -> bool {
        let entry = self.lock_table().remove(&id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(
                    id,
                    age_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Request cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// Abort every in-flight request. Returns how many were cancelled.
    pub fn cancel_all_requests(&self) -> usize {
        let drained: Vec<_> = self.lock_table().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Cancelled all in-flight requests");
        }
        drained.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_table().len()
    }

    pub fn is_in_flight(&self, id: u64) -> bool {
        self.lock_table().contains_key(&id)
    }

    pub fn shutdown(&self) -> usize {
        self.cancel_all_requests()
    }

    /// Remove the table entry and decide the outcome. A request whose entry
    /// was already taken by a cancel is aborted, whatever it produced.
    fn settle(
        &self,
        id: u64,
        result: Result<ResponseBody, AppError>,
    ) -> Result<ResponseBody, AppError> {
        let removed = self.lock_table().remove(&id).is_some();
        let result = if removed {
            result
        } else {
            Err(AppError::RequestAborted)
        };
        match &result {
            Ok(_) => tracing::debug!(id, "Request settled"),
            Err(AppError::RequestAborted) => tracing::debug!(id, "Request aborted"),
            Err(e) => tracing::warn!(id, error = %e, "Request failed"),
        }
        result
    }

    fn url_for(&self, request: &ApiRequest) -> Result<Url, AppError> {
        let endpoint = request.endpoint.trim_start_matches('/');
        let mut url = self.inner.config.base_url.join(endpoint).map_err(|e| {
            AppError::ConfigError(format!("Invalid endpoint '{}': {e}", request.endpoint))
        })?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }

    async fn perform(
        &self,
        request: ApiRequest,
        timeout: Duration,
    ) -> Result<ResponseBody, AppError> {
        let url = self.url_for(&request)?;
        let sends_body = request.sends_body();
        let mut builder = self.inner.client.request(request.method, url);

        if let Some(token) = self.inner.tokens.token().await {
            builder = builder.bearer_auth(token);
        }

        if sends_body {
            builder = match request.payload {
                Payload::None => builder,
                Payload::Json(body) => builder.json(&body),
                Payload::File(file) => builder.multipart(multipart_form(file)?),
            };
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::RequestTimeout(timeout)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();
        let body = read_body(response).await?;
        if !status.is_success() {
            return Err(AppError::HttpError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

fn multipart_form(file: FileUpload) -> Result<Form, AppError> {
    let part = Part::bytes(file.bytes)
        .file_name(file.filename)
        .mime_str(&file.content_type)
        .map_err(|e| {
            AppError::ConfigError(format!("Invalid content type '{}': {e}", file.content_type))
        })?;
    let mut form = Form::new().part("file", part);
    for (key, value) in file.metadata {
        form = form.text(key, value);
    }
    Ok(form)
}

/// Parse a body by content type: JSON, text, else raw bytes.
async fn read_body(response: reqwest::Response) -> Result<ResponseBody, AppError> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;

    if bytes.is_empty() {
        return Ok(ResponseBody::Empty);
    }

    let mime = content_type.split(';').next().unwrap_or_default().trim();
    if mime == "application/json" || mime.ends_with("+json") {
        // A server that lies about JSON still gets its body surfaced as text.
        return Ok(match serde_json::from_slice(&bytes) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        });
    }
    if mime.starts_with("text/") {
        return Ok(ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()));
    }
    Ok(ResponseBody::Binary(bytes.to_vec()))
}

impl<T: TokenStore> ApiClient for RequestDispatcher<T> {
    async fn post_json(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<ResponseBody, AppError> {
        self.post(endpoint, body.clone()).await
    }

    async fn upload(&self, endpoint: &str, file: FileUpload) -> Result<ResponseBody, AppError> {
        self.upload_file(endpoint, file).await
    }
}
