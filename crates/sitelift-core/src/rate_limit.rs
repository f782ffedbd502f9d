//! Sliding-window admission control for outbound requests.
//!
//! Keeps the timestamps of admitted requests inside the trailing window and
//! rejects new work up front once the window is full. Pruning is lazy: old
//! entries are dropped on each check, nothing runs in the background.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use sitelift_core::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(
//!     RateLimitConfig::new(2).with_window(Duration::from_secs(1)),
//! );
//! assert!(limiter.check().is_ok());
//! assert!(limiter.check().is_ok());
//! assert!(limiter.check().is_err());
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

/// Configuration for the sliding-window limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum admissions inside one window.
    pub max_requests: usize,

    /// Length of the trailing window.
    pub window: Duration,
}

impl RateLimitConfig {
    /// Create a config with the given budget and the default 60s window.
    pub fn new(max_requests: usize) -> Self {
        Self {
            max_requests,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

impl Default for RateLimitConfig {
    /// 50 requests per 60 seconds.
    fn default() -> Self {
        Self {
            max_requests: 50,
            window: Duration::from_secs(60),
        }
    }
}

/// Thread-safe sliding-window rate limiter. Cheap to clone; clones share
/// the same window.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Arc<Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(config.max_requests))),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock_window(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.window.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limit mutex");
            poisoned.into_inner()
        })
    }

    /// Admit one request now, or fail with `RateLimitExceeded`.
    pub fn check(&self) -> Result<(), AppError> {
        self.check_at(Instant::now())
    }

    /// Admit one request at `now`.
    ///
    /// Prune, compare and record happen under one lock, so concurrent
    /// callers can never overshoot the budget.
    pub fn check_at(&self, now: Instant) -> Result<(), AppError> {
        let mut window = self.lock_window();

        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.config.max_requests {
            let retry_after = match window.front() {
                Some(&oldest) => self
                    .config
                    .window
                    .saturating_sub(now.saturating_duration_since(oldest)),
                None => self.config.window,
            };
            let retry_after_secs = retry_after.as_secs_f64().ceil() as u64;
            tracing::warn!(
                in_window = window.len(),
                max = self.config.max_requests,
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::RateLimitExceeded { retry_after_secs });
        }

        window.push_back(now);
        Ok(())
    }

    /// Admissions currently counted against the window (before pruning).
    pub fn len(&self) -> usize {
        self.lock_window().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every recorded admission.
    pub fn reset(&self) {
        self.lock_window().clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
