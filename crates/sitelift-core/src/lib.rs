pub mod backoff;
pub mod error;
pub mod events;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod reporter;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use backoff::ReconnectPolicy;
pub use error::AppError;
pub use events::{ConnectionError, ConnectionEvent, EventRegistry, HandlerId, RealtimeEvent, Topic};
pub use job::{ExtractionFlags, ExtractionJob, ExtractionRequest, JobStatus, JobStep};
pub use models::{Asset, AssetKind, Envelope, FileUpload, Notification, ResponseBody, compute_digest};
pub use orchestrator::ExtractionOrchestrator;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use reporter::{JobEvent, JobReporter, NullJobReporter, TracingJobReporter};
pub use traits::{ApiClient, ExtractionSource, NotificationSink, StaticTokenStore, TokenStore};
