// =============================================================================
// Rate Limiter — per-endpoint throttling and exponential backoff
// =============================================================================
//
// Single gate for ALL outbound HTTP. Each endpoint gets a rolling 60-second
// request window plus an optional minimum inter-request delay. Repeated
// failures trigger exponential backoff (2^failures seconds, capped).
//
// Callers follow the same three-step protocol everywhere:
//
//   limiter.wait_if_needed("fred").await;
//   let result = do_request().await;
//   limiter.record_request("fred", result.is_ok());
//   // on HTTP 429: limiter.trigger_backoff("fred");
//
// Thread-safe; share via Arc across all fetchers.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Length of the rolling request window.
const WINDOW: Duration = Duration::from_secs(60);

/// Default backoff ceiling when none is configured.
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

#[derive(Debug, Clone, Copy)]
struct EndpointConfig {
    requests_per_minute: u32,
    min_delay: Duration,
    max_backoff: Duration,
}

/// Mutable per-endpoint counters. In-memory only — backoff state does not
/// survive a restart.
#[derive(Debug)]
struct EndpointState {
    requests_made: u32,
    window_start: Instant,
    last_request: Option<Instant>,
    backoff_until: Option<Instant>,
    consecutive_failures: u32,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            requests_made: 0,
            window_start: Instant::now(),
            last_request: None,
            backoff_until: None,
            consecutive_failures: 0,
        }
    }
}

/// Serialisable snapshot of one endpoint's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub endpoint: String,
    pub requests_per_minute_limit: u32,
    pub requests_this_window: u32,
    pub window_resets_in_secs: f64,
    pub in_backoff: bool,
    pub backoff_ends_in_secs: f64,
    pub consecutive_failures: u32,
}

/// Manages rate limiting and exponential backoff for outbound API requests.
pub struct RateLimiter {
    inner: Mutex<HashMap<String, (EndpointConfig, EndpointState)>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register an endpoint. Unconfigured endpoints are never throttled.
    pub fn configure(
        &self,
        endpoint: &str,
        requests_per_minute: u32,
        min_delay_secs: f64,
        max_backoff_secs: Option<u64>,
    ) {
        let config = EndpointConfig {
            requests_per_minute: requests_per_minute.max(1),
            min_delay: Duration::from_secs_f64(min_delay_secs.max(0.0)),
            max_backoff: Duration::from_secs(
                max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
            ),
        };
        self.inner
            .lock()
            .insert(endpoint.to_string(), (config, EndpointState::new()));
        info!(endpoint, requests_per_minute, "rate limiter configured");
    }

    /// How long the caller must wait before its next request, or zero.
    ///
    /// Also rolls the window forward when it has elapsed. Does not sleep —
    /// `wait_if_needed` wraps this with the actual await.
    fn required_wait(&self, endpoint: &str) -> Duration {
        let mut inner = self.inner.lock();
        let Some((config, state)) = inner.get_mut(endpoint) else {
            return Duration::ZERO;
        };
        let now = Instant::now();

        // Still in a backoff period.
        if let Some(until) = state.backoff_until {
            if until > now {
                return until - now;
            }
            state.backoff_until = None;
        }

        // Minimum spacing between requests.
        if let Some(last) = state.last_request {
            let since = now - last;
            if since < config.min_delay {
                return config.min_delay - since;
            }
        }

        // Rolling window.
        if now.duration_since(state.window_start) >= WINDOW {
            state.window_start = now;
            state.requests_made = 0;
        }
        if state.requests_made >= config.requests_per_minute {
            return WINDOW - now.duration_since(state.window_start);
        }

        Duration::ZERO
    }

    /// Block (async) until the endpoint's limits allow another request.
    pub async fn wait_if_needed(&self, endpoint: &str) {
        loop {
            let wait = self.required_wait(endpoint);
            if wait.is_zero() {
                return;
            }
            warn!(
                endpoint,
                wait_secs = format!("{:.1}", wait.as_secs_f64()),
                "rate limit: waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Record that a request completed. Success resets the failure counter.
    pub fn record_request(&self, endpoint: &str, success: bool) {
        let mut inner = self.inner.lock();
        let Some((_, state)) = inner.get_mut(endpoint) else {
            return;
        };
        state.requests_made += 1;
        state.last_request = Some(Instant::now());
        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
        }
    }

    /// Enter exponential backoff after a rate-limit error (HTTP 429 or a
    /// provider-specific throttle response): 2^failures seconds, capped.
    pub fn trigger_backoff(&self, endpoint: &str) {
        let mut inner = self.inner.lock();
        let Some((config, state)) = inner.get_mut(endpoint) else {
            return;
        };

        let exp = state.consecutive_failures.min(31);
        let backoff = Duration::from_secs(1u64 << exp).min(config.max_backoff);
        state.backoff_until = Some(Instant::now() + backoff);
        state.consecutive_failures += 1;

        warn!(
            endpoint,
            backoff_secs = backoff.as_secs(),
            failure = state.consecutive_failures,
            "rate limit hit — backing off"
        );
    }

    /// Snapshot the current state of one endpoint (for `status` output).
    pub fn stats(&self, endpoint: &str) -> Option<RateLimitStats> {
        let inner = self.inner.lock();
        let (config, state) = inner.get(endpoint)?;
        let now = Instant::now();

        let window_elapsed = now.duration_since(state.window_start);
        let resets_in = WINDOW.saturating_sub(window_elapsed);
        let backoff_remaining = state
            .backoff_until
            .map(|u| u.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        debug!(endpoint, requests = state.requests_made, "rate limit stats read");

        Some(RateLimitStats {
            endpoint: endpoint.to_string(),
            requests_per_minute_limit: config.requests_per_minute,
            requests_this_window: state.requests_made,
            window_resets_in_secs: resets_in.as_secs_f64(),
            in_backoff: !backoff_remaining.is_zero(),
            backoff_ends_in_secs: backoff_remaining.as_secs_f64(),
            consecutive_failures: state.consecutive_failures,
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let endpoints = self.inner.lock().len();
        f.debug_struct("RateLimiter").field("endpoints", &endpoints).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_endpoint_never_waits() {
        let limiter = RateLimiter::new();
        assert!(limiter.required_wait("unknown").is_zero());
    }

    #[test]
    fn window_limit_forces_wait() {
        let limiter = RateLimiter::new();
        limiter.configure("api", 3, 0.0, None);

        for _ in 0..3 {
            assert!(limiter.required_wait("api").is_zero());
            limiter.record_request("api", true);
        }
        let wait = limiter.required_wait("api");
        assert!(!wait.is_zero());
        assert!(wait <= WINDOW);
    }

    #[test]
    fn min_delay_spaces_requests() {
        let limiter = RateLimiter::new();
        limiter.configure("api", 100, 5.0, None);

        limiter.record_request("api", true);
        let wait = limiter.required_wait("api");
        assert!(wait > Duration::from_secs(4));
        assert!(wait <= Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let limiter = RateLimiter::new();
        limiter.configure("api", 100, 0.0, Some(8));

        // failures 0, 1, 2 → 1s, 2s, 4s; failure 3 → 8s; failure 4 would be
        // 16s but is capped at 8s.
        for expected in [1u64, 2, 4, 8, 8] {
            limiter.trigger_backoff("api");
            let stats = limiter.stats("api").unwrap();
            assert!(stats.in_backoff);
            assert!(
                stats.backoff_ends_in_secs <= expected as f64 + 0.1,
                "backoff {} exceeds expected {}",
                stats.backoff_ends_in_secs,
                expected
            );
            // Clear the backoff window so the next trigger measures cleanly.
            let mut inner = limiter.inner.lock();
            inner.get_mut("api").unwrap().1.backoff_until = None;
        }
    }

    #[test]
    fn success_resets_failure_counter() {
        let limiter = RateLimiter::new();
        limiter.configure("api", 100, 0.0, None);

        limiter.record_request("api", false);
        limiter.record_request("api", false);
        assert_eq!(limiter.stats("api").unwrap().consecutive_failures, 2);

        limiter.record_request("api", true);
        assert_eq!(limiter.stats("api").unwrap().consecutive_failures, 0);
    }
}
