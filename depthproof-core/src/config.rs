//! Pipeline configuration.
//!
//! Handles loading configuration from `DEPTHPROOF_*` environment variables with
//! sensible defaults. Every timing constant the pipeline depends on lives here
//! so that deployments (and tests) can tune it without code changes.

use std::str::FromStr;
use std::time::Duration;

use crate::attestation::ChallengeRetryPolicy;
use crate::capture::LocationPolicy;
use crate::upload::RetryPolicy;

/// Default backend base URL.
pub const DEFAULT_API_URL: &str = "https://api.depthproof.dev/v1";

/// Maximum photo/depth timestamp difference accepted as one moment.
pub const DEFAULT_SYNC_WINDOW_MS: u32 = 100;

/// Pipeline configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Backend base URL (default: https://api.depthproof.dev/v1)
    pub api_url: String,
    /// Device model reported in capture metadata and registration
    pub device_model: String,
    /// Platform reported at registration (default: host OS)
    pub platform: String,
    /// Whether this device has a depth sensor (default: true)
    pub has_depth_sensor: bool,
    /// Sync window between photo and depth timestamps (default: 100ms)
    pub sync_window_ms: u32,
    /// Hardware key generation timeout (default: 5s)
    pub key_generation_timeout: Duration,
    /// Attestation provider call timeout (default: 5s)
    pub attestation_timeout: Duration,
    /// Challenge fetch retry schedule (default: 3 retries, 1s/2s/4s)
    pub challenge_retry: ChallengeRetryPolicy,
    /// Location acquisition policy (default: 2s timeout, 10s staleness)
    pub location: LocationPolicy,
    /// Upload retry policy (default: 5 attempts)
    pub upload_retry: RetryPolicy,
    /// Pause between consecutive uploads (default: 250ms)
    pub inter_item_delay: Duration,
    /// Network status debounce window (default: 300ms)
    pub network_debounce: Duration,
    /// HTTP request timeout (default: 60s)
    pub request_timeout: Duration,
    /// Allow plain-HTTP backends, for local development only (default: false)
    pub allow_insecure_http: bool,
    /// Attach a geohash of this precision to uploaded locations (default: none)
    pub location_geohash_precision: Option<usize>,
    /// Delete the cached photo once its upload completes (default: true)
    pub cleanup_after_upload: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            device_model: "unknown".to_string(),
            platform: std::env::consts::OS.to_string(),
            has_depth_sensor: true,
            sync_window_ms: DEFAULT_SYNC_WINDOW_MS,
            key_generation_timeout: Duration::from_secs(5),
            attestation_timeout: Duration::from_secs(5),
            challenge_retry: ChallengeRetryPolicy::default(),
            location: LocationPolicy::default(),
            upload_retry: RetryPolicy::default(),
            inter_item_delay: Duration::from_millis(250),
            network_debounce: Duration::from_millis(300),
            request_timeout: Duration::from_secs(60),
            allow_insecure_http: false,
            location_geohash_precision: None,
            cleanup_after_upload: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_url = std::env::var("DEPTHPROOF_API_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.api_url);

        let device_model = std::env::var("DEPTHPROOF_DEVICE_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.device_model);

        let allow_insecure_http = std::env::var("DEPTHPROOF_ALLOW_INSECURE_HTTP")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        let location_geohash_precision = env_parse::<usize>("DEPTHPROOF_GEOHASH_PRECISION")
            .filter(|p| (1..=12).contains(p));

        let upload_retry = RetryPolicy {
            max_attempts: env_parse("DEPTHPROOF_UPLOAD_MAX_ATTEMPTS")
                .filter(|v| (1..=100).contains(v))
                .unwrap_or(defaults.upload_retry.max_attempts),
            base_delay: env_millis("DEPTHPROOF_UPLOAD_BASE_DELAY_MS")
                .unwrap_or(defaults.upload_retry.base_delay),
            max_delay: env_millis("DEPTHPROOF_UPLOAD_MAX_DELAY_MS")
                .unwrap_or(defaults.upload_retry.max_delay),
            ..defaults.upload_retry
        };

        let location = LocationPolicy {
            timeout: env_millis("DEPTHPROOF_LOCATION_TIMEOUT_MS")
                .unwrap_or(defaults.location.timeout),
            max_age: env_millis("DEPTHPROOF_LOCATION_MAX_AGE_MS")
                .unwrap_or(defaults.location.max_age),
        };

        Self {
            api_url,
            device_model,
            platform: defaults.platform,
            has_depth_sensor: env_parse("DEPTHPROOF_HAS_DEPTH_SENSOR")
                .unwrap_or(defaults.has_depth_sensor),
            sync_window_ms: env_parse("DEPTHPROOF_SYNC_WINDOW_MS")
                .unwrap_or(defaults.sync_window_ms),
            key_generation_timeout: env_millis("DEPTHPROOF_KEY_TIMEOUT_MS")
                .unwrap_or(defaults.key_generation_timeout),
            attestation_timeout: env_millis("DEPTHPROOF_ATTEST_TIMEOUT_MS")
                .unwrap_or(defaults.attestation_timeout),
            challenge_retry: defaults.challenge_retry,
            location,
            upload_retry,
            inter_item_delay: defaults.inter_item_delay,
            network_debounce: defaults.network_debounce,
            request_timeout: env_parse::<u64>("DEPTHPROOF_REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            allow_insecure_http,
            location_geohash_precision,
            cleanup_after_upload: defaults.cleanup_after_upload,
        }
    }

    /// Host the device is registered against.
    ///
    /// Secure-storage entries are scoped by this value so that staging and
    /// production keep distinct device registrations.
    pub fn backend_host(&self) -> String {
        url::Url::parse(&self.api_url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| self.api_url.clone())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}
