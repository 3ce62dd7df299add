use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::CaptureLocation;
use crate::error::LocationError;

/// Platform location service.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn has_permission(&self) -> bool;

    /// Current fix. `fresh` asks the platform to bypass its cached fix.
    async fn current_location(&self, fresh: bool) -> Result<CaptureLocation, LocationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationPolicy {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Fixes older than this trigger one fresh re-fetch.
    pub max_age: Duration,
}

impl Default for LocationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_age: Duration::from_secs(10),
        }
    }
}

/// Best-effort location for a capture starting at `now_ms`.
///
/// Never fails: missing permission, timeouts and provider errors all yield
/// `None`. A stale fix is re-fetched once; if that fails the stale fix is kept.
pub async fn acquire_location(
    provider: &dyn LocationProvider,
    policy: &LocationPolicy,
    now_ms: i64,
) -> Option<CaptureLocation> {
    if !provider.has_permission().await {
        debug!("No location permission, capturing without location");
        return None;
    }

    let location = match fetch(provider, policy, false).await {
        Ok(location) => location,
        Err(e) => {
            warn!(error = %e, "Location unavailable for capture");
            return None;
        }
    };

    let age_ms = now_ms.saturating_sub(location.timestamp_ms);
    if age_ms <= policy.max_age.as_millis() as i64 {
        return Some(location);
    }

    debug!(age_ms, "Cached location is stale, requesting a fresh fix");
    match fetch(provider, policy, true).await {
        Ok(fresh) => Some(fresh),
        Err(e) => {
            warn!(error = %e, age_ms, "Fresh location failed, using stale fix");
            Some(location)
        }
    }
}

async fn fetch(
    provider: &dyn LocationProvider,
    policy: &LocationPolicy,
    fresh: bool,
) -> Result<CaptureLocation, LocationError> {
    tokio::time::timeout(policy.timeout, provider.current_location(fresh))
        .await
        .map_err(|_| LocationError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockLocationProvider;

    const NOW: i64 = 1_700_000_000_000;

    fn fix(timestamp_ms: i64, latitude: f64) -> CaptureLocation {
        CaptureLocation {
            latitude,
            longitude: 2.35,
            altitude: None,
            accuracy: Some(5.0),
            timestamp_ms,
            geohash: None,
        }
    }

    #[tokio::test]
    async fn test_fresh_fix_is_used_directly() {
        let provider = MockLocationProvider::new(fix(NOW - 1_000, 48.85));
        let location = acquire_location(&provider, &LocationPolicy::default(), NOW).await;

        assert_eq!(location, Some(fix(NOW - 1_000, 48.85)));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_fix_is_refetched_once() {
        let provider = MockLocationProvider::new(fix(NOW - 60_000, 48.85))
            .with_fresh(Ok(fix(NOW, 48.86)));
        let location = acquire_location(&provider, &LocationPolicy::default(), NOW).await;

        assert_eq!(location, Some(fix(NOW, 48.86)));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_fix_kept_when_refetch_fails() {
        let provider = MockLocationProvider::new(fix(NOW - 60_000, 48.85))
            .with_fresh(Err(LocationError::Unavailable("no satellites".into())));
        let location = acquire_location(&provider, &LocationPolicy::default(), NOW).await;

        assert_eq!(location, Some(fix(NOW - 60_000, 48.85)));
    }

    #[tokio::test]
    async fn test_denied_permission_skips_provider() {
        let provider = MockLocationProvider::denied();
        assert_eq!(
            acquire_location(&provider, &LocationPolicy::default(), NOW).await,
            None
        );
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let provider =
            MockLocationProvider::new(fix(NOW, 48.85)).with_delay(Duration::from_secs(10));
        assert_eq!(
            acquire_location(&provider, &LocationPolicy::default(), NOW).await,
            None
        );
    }
}
