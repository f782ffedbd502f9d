//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Asset, AssetKind, FileUpload, Notification, ResponseBody};
use crate::reporter::{JobEvent, JobReporter};
use crate::traits::{ApiClient, ExtractionSource, NotificationSink, TokenStore};

// ---------------------------------------------------------------------------
// MockApiClient
// ---------------------------------------------------------------------------

/// Mock API that records every call and answers `{}` (or `{"id": <uuid>}`
/// for the create call).
#[derive(Clone, Default)]
pub struct MockApiClient {
    calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    uploads: Arc<Mutex<Vec<(String, FileUpload)>>>,
    /// One-shot failures keyed by endpoint suffix.
    failures: Arc<Mutex<Vec<(String, AppError)>>>,
    /// One-shot upload failures keyed by filename.
    upload_failures: Arc<Mutex<HashMap<String, AppError>>>,
    create_response: Arc<Mutex<Option<serde_json::Value>>>,
}

impl MockApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the create call with `body` instead of a fresh id.
    pub fn with_create_response(self, body: serde_json::Value) -> Self {
        *self.create_response.lock().unwrap() = Some(body);
        self
    }

    /// Fail the next post whose endpoint ends with `suffix`.
    pub fn fail_on(&self, suffix: &str, error: AppError) {
        self.failures
            .lock()
            .unwrap()
            .push((suffix.to_string(), error));
    }

    /// Fail the upload of `filename`.
    pub fn fail_upload(&self, filename: &str, error: AppError) {
        self.upload_failures
            .lock()
            .unwrap()
            .insert(filename.to_string(), error);
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.calls().into_iter().map(|(endpoint, _)| endpoint).collect()
    }

    pub fn uploads(&self) -> Vec<(String, FileUpload)> {
        self.uploads.lock().unwrap().clone()
    }
}

impl ApiClient for MockApiClient {
    async fn post_json(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<ResponseBody, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), body.clone()));

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(pos) = failures.iter().position(|(s, _)| endpoint.ends_with(s.as_str())) {
                return Err(failures.remove(pos).1);
            }
        }

        if endpoint == "extractions" {
            let body = self
                .create_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "id": Uuid::new_v4().to_string() }));
            return Ok(ResponseBody::Json(body));
        }
        Ok(ResponseBody::Json(serde_json::json!({})))
    }

    async fn upload(&self, endpoint: &str, file: FileUpload) -> Result<ResponseBody, AppError> {
        if let Some(err) = self.upload_failures.lock().unwrap().remove(&file.filename) {
            return Err(err);
        }
        self.uploads
            .lock()
            .unwrap()
            .push((endpoint.to_string(), file));
        Ok(ResponseBody::Empty)
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

/// Mock scraper producing small JSON artifacts.
#[derive(Clone, Default)]
pub struct MockSource {
    assets: Vec<Asset>,
    fail_design: bool,
    fail_responsive: bool,
    fail_assets: bool,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(mut self, assets: Vec<Asset>) -> Self {
        self.assets = assets;
        self
    }

    pub fn failing_design(mut self) -> Self {
        self.fail_design = true;
        self
    }

    pub fn failing_assets(mut self) -> Self {
        self.fail_assets = true;
        self
    }

    pub fn failing_responsive(mut self) -> Self {
        self.fail_responsive = true;
        self
    }
}

impl ExtractionSource for MockSource {
    async fn structure(&self) -> Result<serde_json::Value, AppError> {
        Ok(serde_json::json!({ "tag": "body", "children": [] }))
    }

    async fn assets(&self) -> Result<Vec<Asset>, AppError> {
        if self.fail_assets {
            return Err(AppError::ArtifactError("asset collection failed".into()));
        }
        Ok(self.assets.clone())
    }

    async fn responsive(&self) -> Result<serde_json::Value, AppError> {
        if self.fail_responsive {
            return Err(AppError::ArtifactError("viewport resize failed".into()));
        }
        Ok(serde_json::json!({ "breakpoints": [640, 1024] }))
    }

    fn design(&self, _structure: &serde_json::Value) -> Result<serde_json::Value, AppError> {
        if self.fail_design {
            return Err(AppError::ArtifactError("design generation failed".into()));
        }
        Ok(serde_json::json!({ "frames": [] }))
    }

    fn source_code(&self, _structure: &serde_json::Value) -> Result<serde_json::Value, AppError> {
        Ok(serde_json::json!({ "files": {} }))
    }

    fn component_library(
        &self,
        _structure: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        Ok(serde_json::json!({ "components": [] }))
    }

    fn responsive_variants(
        &self,
        _design: &serde_json::Value,
        _responsive: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        Ok(serde_json::json!({ "variants": [] }))
    }

    fn responsive_css(
        &self,
        _responsive: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        Ok(serde_json::json!("@media (min-width: 640px) {}"))
    }
}

/// A small PNG-typed asset for upload tests.
pub fn test_asset(filename: &str) -> Asset {
    Asset {
        filename: filename.to_string(),
        kind: AssetKind::Image,
        content_type: "image/png".to_string(),
        bytes: vec![0x89, b'P', b'N', b'G'],
        width: Some(16),
        height: Some(16),
    }
}

// ---------------------------------------------------------------------------
// MockTokenStore
// ---------------------------------------------------------------------------

/// Token store whose token can be swapped mid-test.
#[derive(Clone, Default)]
pub struct MockTokenStore {
    token: Arc<Mutex<Option<String>>>,
    lookups: Arc<Mutex<usize>>,
}

impl MockTokenStore {
    pub fn new(token: &str) -> Self {
        let store = Self::default();
        store.set(Some(token));
        store
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<&str>) {
        *self.token.lock().unwrap() = token.map(str::to_string);
    }

    pub fn lookups(&self) -> usize {
        *self.lookups.lock().unwrap()
    }
}

impl TokenStore for MockTokenStore {
    async fn token(&self) -> Option<String> {
        *self.lookups.lock().unwrap() += 1;
        self.token.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// MockNotificationSink
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockNotificationSink {
    pub received: Arc<Mutex<Vec<Notification>>>,
}

impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().unwrap().clone()
    }
}

impl NotificationSink for MockNotificationSink {
    fn notify(&self, notification: Notification) {
        self.received.lock().unwrap().push(notification);
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that flattens events into short strings, e.g. `completed:design`.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl JobReporter for MockReporter {
    fn report(&self, event: JobEvent<'_>) {
        let line = match event {
            JobEvent::Created { .. } => "created".to_string(),
            JobEvent::StepCompleted { step, .. } => format!("completed:{step}"),
            JobEvent::StepSkipped { step, .. } => format!("skipped:{step}"),
            JobEvent::StepFailed { step, .. } => format!("step_failed:{step}"),
            JobEvent::AssetUploaded { filename, .. } => format!("uploaded:{filename}"),
            JobEvent::Completed { .. } => "job_completed".to_string(),
            JobEvent::Failed { step, .. } => format!("failed:{step}"),
        };
        self.events.lock().unwrap().push(line);
    }
}
