use std::time::Duration;

use sitelift_core::error::AppError;
use sitelift_core::rate_limit::RateLimitConfig;

use crate::dispatcher::DispatcherConfig;
use crate::realtime::RealtimeConfig;

/// Configuration for both client subsystems.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub dispatcher: DispatcherConfig,
    pub realtime: RealtimeConfig,
}

impl ClientConfig {
    /// Read configuration from environment variables.
    ///
    /// - `SITELIFT_API_URL` (required)
    /// - `SITELIFT_REALTIME_URL` (required)
    /// - `SITELIFT_REQUEST_TIMEOUT_SECS` (optional, defaults to 30)
    /// - `SITELIFT_RATE_LIMIT_MAX` (optional, defaults to 50)
    /// - `SITELIFT_RATE_LIMIT_WINDOW_SECS` (optional, defaults to 60)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("SITELIFT_API_URL").ok_or_else(|| {
            AppError::ConfigError("SITELIFT_API_URL not set. Required for API requests.".into())
        })?;
        let realtime_url = lookup("SITELIFT_REALTIME_URL").ok_or_else(|| {
            AppError::ConfigError(
                "SITELIFT_REALTIME_URL not set. Required for the realtime connection.".into(),
            )
        })?;

        let timeout_secs = positive(&lookup, "SITELIFT_REQUEST_TIMEOUT_SECS", 30)?;
        let max_requests = positive(&lookup, "SITELIFT_RATE_LIMIT_MAX", 50)?;
        let window_secs = positive(&lookup, "SITELIFT_RATE_LIMIT_WINDOW_SECS", 60)?;

        let rate_limit = RateLimitConfig::new(max_requests as usize)
            .with_window(Duration::from_secs(window_secs));
        let dispatcher = DispatcherConfig::new(&api_url)?
            .with_timeout(Duration::from_secs(timeout_secs))
            .with_rate_limit(rate_limit);

        Ok(Self {
            dispatcher,
            realtime: RealtimeConfig::new(realtime_url),
        })
    }
}

fn positive<F>(lookup: &F, key: &str, default: u64) -> Result<u64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => {
            let parsed: u64 = raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!(
                    "Invalid {key} '{raw}': must be a positive integer"
                ))
            })?;
            if parsed == 0 {
                return Err(AppError::ConfigError(format!("{key} must be at least 1")));
            }
            Ok(parsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ClientConfig, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("SITELIFT_API_URL", "https://api.sitelift.test/v1"),
        ("SITELIFT_REALTIME_URL", "wss://rt.sitelift.test/socket"),
    ];

    #[test]
    fn defaults_when_optional_vars_missing() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(
            config.dispatcher.base_url.as_str(),
            "https://api.sitelift.test/v1/"
        );
        assert_eq!(config.dispatcher.default_timeout, Duration::from_secs(30));
        assert_eq!(config.dispatcher.rate_limit.max_requests, 50);
        assert_eq!(config.dispatcher.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.realtime.endpoint, "wss://rt.sitelift.test/socket");
    }

    #[test]
    fn optional_vars_override_defaults() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SITELIFT_REQUEST_TIMEOUT_SECS", "5"));
        vars.push(("SITELIFT_RATE_LIMIT_MAX", "10"));
        vars.push(("SITELIFT_RATE_LIMIT_WINDOW_SECS", " 20 "));

        let config = load(&vars).unwrap();
        assert_eq!(config.dispatcher.default_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatcher.rate_limit.max_requests, 10);
        assert_eq!(config.dispatcher.rate_limit.window, Duration::from_secs(20));
    }

    #[test]
    fn missing_required_var_is_config_error() {
        let err = load(&REQUIRED[..1]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(msg) if msg.contains("SITELIFT_REALTIME_URL")));

        let err = load(&[]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(msg) if msg.contains("SITELIFT_API_URL")));
    }

    #[test]
    fn invalid_or_zero_values_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SITELIFT_RATE_LIMIT_MAX", "lots"));
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(msg) if msg.contains("positive integer")));

        let mut vars = REQUIRED.to_vec();
        vars.push(("SITELIFT_REQUEST_TIMEOUT_SECS", "0"));
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(msg) if msg.contains("at least 1")));
    }

    #[test]
    fn invalid_api_url_rejected() {
        let err = load(&[
            ("SITELIFT_API_URL", "::nope"),
            ("SITELIFT_REALTIME_URL", "wss://rt.sitelift.test/socket"),
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
