use std::future::Future;

use crate::error::AppError;
use crate::models::{Asset, FileUpload, Notification, ResponseBody};

/// Supplies the bearer credential for outbound calls.
///
/// Called once per request; must be cheap and side-effect free.
pub trait TokenStore: Send + Sync + Clone + 'static {
    fn token(&self) -> impl Future<Output = Option<String>> + Send;
}

/// A fixed (possibly absent) token.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenStore(Option<String>);

impl StaticTokenStore {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl TokenStore for StaticTokenStore {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Shows a user-facing notification.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

/// Request/response access to the remote extraction API.
pub trait ApiClient: Send + Sync + Clone {
    /// POST a JSON body to `endpoint`, relative to the API base.
    fn post_json(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> impl Future<Output = Result<ResponseBody, AppError>> + Send;

    /// POST one file as a multipart form.
    fn upload(
        &self,
        endpoint: &str,
        file: FileUpload,
    ) -> impl Future<Output = Result<ResponseBody, AppError>> + Send;
}

/// The page scraper and classifier that produces extraction artifacts.
///
/// Only the page-reading operations are async; the generators derive their
/// output from artifacts already in hand.
pub trait ExtractionSource: Send + Sync {
    /// DOM structure of the page.
    fn structure(&self) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;

    /// Binary assets (images, inline SVGs) referenced by the page.
    fn assets(&self) -> impl Future<Output = Result<Vec<Asset>, AppError>> + Send;

    /// Breakpoint analysis across viewport widths.
    fn responsive(&self) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;

    fn design(&self, structure: &serde_json::Value) -> Result<serde_json::Value, AppError>;

    fn source_code(&self, structure: &serde_json::Value) -> Result<serde_json::Value, AppError>;

    fn component_library(
        &self,
        structure: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;

    fn responsive_variants(
        &self,
        design: &serde_json::Value,
        responsive: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;

    fn responsive_css(&self, responsive: &serde_json::Value) -> Result<serde_json::Value, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_store_returns_token() {
        assert_eq!(
            StaticTokenStore::new("abc").token().await.as_deref(),
            Some("abc")
        );
        assert_eq!(StaticTokenStore::anonymous().token().await, None);
    }
}
