//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::clock::{Clock, MonotonicClock};
use super::key::ClientKey;
use super::store::WindowStore;
use super::window::{whole_millis, Window, WindowAlgorithm, WindowState, MAX_WINDOW};
use crate::error::{Result, WindgateError};

/// What to do with a request when the window store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through and log a warning.
    #[default]
    FailOpen,
    /// Reject the request as if it were over its limit.
    FailClosed,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::FailOpen => write!(f, "fail_open"),
            FailurePolicy::FailClosed => write!(f, "fail_closed"),
        }
    }
}

/// Immutable settings for one limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    max_requests: u64,
    window: Duration,
    failure_policy: FailurePolicy,
    algorithm: WindowAlgorithm,
    store_timeout: Option<Duration>,
}

impl LimiterConfig {
    /// Admit `max_requests` per `window` per key.
    ///
    /// Both values must be non-zero, and the window no longer than
    /// [`MAX_WINDOW`].
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(WindgateError::InvalidConfiguration(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window.as_millis() == 0 {
            return Err(WindgateError::InvalidConfiguration(
                "window must be at least one millisecond".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(WindgateError::InvalidConfiguration(format!(
                "window must be at most {} seconds",
                MAX_WINDOW.as_secs()
            )));
        }

        Ok(Self {
            max_requests,
            window,
            failure_policy: FailurePolicy::default(),
            algorithm: WindowAlgorithm::default(),
            store_timeout: None,
        })
    }

    /// Admit `max_requests` per `window_secs` seconds per key.
    pub fn per_seconds(max_requests: u64, window_secs: u64) -> Result<Self> {
        Self::new(max_requests, Duration::from_secs(window_secs))
    }

    /// Set the store failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the counting scheme.
    pub fn with_algorithm(mut self, algorithm: WindowAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Bound every store round-trip; an elapsed timeout counts as unavailable.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window_duration(&self) -> Duration {
        self.window
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn algorithm(&self) -> WindowAlgorithm {
        self.algorithm
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout
    }

    /// Store parameters for this limiter.
    pub fn window(&self) -> Window {
        Window::new(self.window, self.max_requests, self.algorithm)
    }
}

/// The limiter's answer for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests admitted per window.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// When the oldest counted attempt stops counting.
    pub reset_at: DateTime<Utc>,
    /// Time from the decision until `reset_at`.
    pub retry_after: Duration,
}

impl AdmitDecision {
    /// Build a decision from a window state observed at `now_ms`.
    pub fn from_state(state: WindowState, limit: u64, window: &Window, now_ms: u64) -> Self {
        let allowed = state.count <= limit;
        let remaining = if allowed {
            limit.saturating_sub(state.count)
        } else {
            0
        };
        let reset_ms = state.reset_at_ms(window);

        Self {
            allowed,
            limit,
            remaining,
            reset_at: millis_to_datetime(reset_ms),
            retry_after: Duration::from_millis(reset_ms.saturating_sub(now_ms)),
        }
    }

    /// Whole seconds until `reset_at`, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        whole_millis(self.retry_after).div_ceil(1000).max(1)
    }

    /// `reset_at` as epoch seconds, rounded up so the quota has freed by then.
    pub fn reset_at_secs(&self) -> i64 {
        let secs = self.reset_at.timestamp();
        if self.reset_at.timestamp_subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        }
    }
}

fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Sliding-window admission control over a shared [`WindowStore`].
///
/// The store is injected, so one store can back several limiters and the
/// limiter itself holds no per-key state.
pub struct RateLimiter {
    config: LimiterConfig,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter reading time from a [`MonotonicClock`].
    pub fn new(config: LimiterConfig, store: Arc<dyn WindowStore>) -> Self {
        Self::with_clock(config, store, Arc::new(MonotonicClock::new()))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(
        config: LimiterConfig,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Count an attempt for `key` and decide whether it is admitted.
    ///
    /// Denied attempts are counted too, so retrying faster than the window
    /// moves keeps a client out.
    pub async fn allow(&self, key: &ClientKey) -> Result<AdmitDecision> {
        let window = self.config.window();
        let now_ms = self.clock.now_millis();

        let state = self
            .bounded(self.store.record(key.as_str(), now_ms, &window))
            .await?;
        let decision = AdmitDecision::from_state(state, self.config.max_requests, &window, now_ms);

        trace!(
            key = %key,
            count = state.count,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Checked rate limit"
        );

        if !decision.allowed {
            debug!(
                key = %key,
                count = state.count,
                limit = self.config.max_requests,
                retry_after_secs = decision.retry_after_secs(),
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Report the quota for `key` without counting an attempt.
    ///
    /// `allowed` says whether the next attempt would be admitted.
    pub async fn peek(&self, key: &ClientKey) -> Result<AdmitDecision> {
        let window = self.config.window();
        let now_ms = self.clock.now_millis();

        let state = self
            .bounded(self.store.peek(key.as_str(), now_ms, &window))
            .await?;
        let next = WindowState {
            count: state.count.saturating_add(1),
            ..state
        };

        let mut decision =
            AdmitDecision::from_state(next, self.config.max_requests, &window, now_ms);
        decision.remaining = self.config.max_requests.saturating_sub(state.count);
        Ok(decision)
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.store_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                WindgateError::StoreUnavailable(format!(
                    "{} store did not answer within {:?}",
                    self.store.name(),
                    limit
                ))
            })?,
            None => call.await,
        }
    }
}
