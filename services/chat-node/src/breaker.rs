//! Per-endpoint circuit breaker for outbound calls.
//!
//! Each endpoint key (typically `METHOD:url`) gets its own state, created
//! lazily on first use:
//!
//! ```text
//! Closed   --(failures > threshold)-->  Open
//! Open     --(cooldown elapsed)------>  HalfOpen   (call admitted as a trial)
//! HalfOpen --(success)--------------->  Closed     (failures reset to 0)
//! HalfOpen --(failure)--------------->  Open       (fresh cooldown)
//! ```
//!
//! Trial calls are not single-flighted: once the cooldown has elapsed every
//! caller is admitted until one of them reports an outcome.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures tolerated before the circuit opens.
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls.
    pub cooldown: Duration,

    /// Deadline applied to every admitted call.
    pub request_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// Circuit position for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tracked state of one endpoint key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub failures: u32,
    pub circuit: CircuitState,
    pub next_retry_at: Option<Instant>,
}

impl EndpointState {
    fn fresh() -> Self {
        Self {
            failures: 0,
            circuit: CircuitState::Closed,
            next_retry_at: None,
        }
    }
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; no I/O was attempted.
    #[error("circuit open")]
    Open,

    /// The call did not finish within the request timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The call itself failed.
    #[error(transparent)]
    Inner(E),
}

/// Circuit breaker keyed by endpoint.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: Mutex<HashMap<String, EndpointState>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given tuning.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Build the endpoint key for a method/target pair.
    pub fn endpoint_key(method: &str, target: &str) -> String {
        format!("{}:{}", method.to_ascii_lowercase(), target)
    }

    /// Tuning in effect.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether a call to `key` may proceed right now.
    ///
    /// An open circuit whose cooldown has elapsed moves to `HalfOpen` and
    /// admits the call as a trial.
    pub async fn can_request(&self, key: &str) -> bool {
        let mut states = self.states.lock().await;
        let state = states
            .entry(key.to_string())
            .or_insert_with(EndpointState::fresh);

        if state.circuit == CircuitState::Closed {
            return true;
        }

        let now = Instant::now();
        match state.next_retry_at {
            Some(retry_at) if retry_at <= now => {
                if state.circuit == CircuitState::Open {
                    debug!(endpoint = %key, "Circuit half-open, admitting trial call");
                }
                state.circuit = CircuitState::HalfOpen;
                true
            }
            _ => false,
        }
    }

    /// Run `call` through the breaker for `key`.
    ///
    /// A denied call returns `BreakerError::Open` without invoking `call`.
    /// Timeouts count as failures.
    pub async fn call<T, E, F, Fut>(&self, key: &str, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_request(key).await {
            return Err(BreakerError::Open);
        }

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => {
                self.on_success(key).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(key).await;
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.on_failure(key).await;
                Err(BreakerError::Timeout(timeout))
            }
        }
    }

    /// Current state for `key`, if it has been seen.
    pub async fn state(&self, key: &str) -> Option<EndpointState> {
        self.states.lock().await.get(key).cloned()
    }

    async fn on_success(&self, key: &str) {
        self.states
            .lock()
            .await
            .insert(key.to_string(), EndpointState::fresh());
    }

    async fn on_failure(&self, key: &str) {
        let mut states = self.states.lock().await;
        let state = states
            .entry(key.to_string())
            .or_insert_with(EndpointState::fresh);

        state.failures += 1;
        if state.failures > self.config.failure_threshold {
            state.circuit = CircuitState::Open;
            state.next_retry_at = Some(Instant::now() + self.config.cooldown);
            warn!(
                endpoint = %key,
                failures = state.failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit open"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "put:http://lb-a/register";

    async fn fail(breaker: &CircuitBreaker) -> BreakerError<&'static str> {
        breaker
            .call(KEY, || async { Err::<(), _>("refused") })
            .await
            .unwrap_err()
    }

    #[test]
    fn test_default_config() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_endpoint_key() {
        assert_eq!(
            CircuitBreaker::endpoint_key("PUT", "http://lb/register"),
            "put:http://lb/register"
        );
    }

    #[tokio::test]
    async fn test_unknown_key_starts_closed() {
        let breaker = CircuitBreaker::default();
        assert!(breaker.state(KEY).await.is_none());
        assert!(breaker.can_request(KEY).await);
        assert_eq!(breaker.state(KEY).await, Some(EndpointState::fresh()));
    }

    #[tokio::test]
    async fn test_stays_closed_up_to_threshold() {
        let breaker = CircuitBreaker::default();
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, BreakerError::Inner("refused")));
        }
        let state = breaker.state(KEY).await.unwrap();
        assert_eq!(state.failures, 3);
        assert_eq!(state.circuit, CircuitState::Closed);
        assert!(breaker.can_request(KEY).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_failure_trips_until_cooldown() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(KEY).await.unwrap().circuit, CircuitState::Open);

        // Denied calls never run.
        let mut invoked = false;
        let result = breaker
            .call(KEY, || {
                invoked = true;
                async { Ok::<_, &str>(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(!invoked);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_request(KEY).await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_request(KEY).await);
        assert_eq!(
            breaker.state(KEY).await.unwrap().circuit,
            CircuitState::HalfOpen
        );

        breaker
            .call(KEY, || async { Ok::<_, &str>("ok") })
            .await
            .unwrap();
        let state = breaker.state(KEY).await.unwrap();
        assert_eq!(state.failures, 0);
        assert_eq!(state.circuit, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(matches!(fail(&breaker).await, BreakerError::Inner(_)));
        let state = breaker.state(KEY).await.unwrap();
        assert_eq!(state.circuit, CircuitState::Open);
        assert_eq!(state.failures, 5);
        assert_eq!(
            state.next_retry_at,
            Some(Instant::now() + Duration::from_secs(30))
        );
        assert!(!breaker.can_request(KEY).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_concurrent_trials() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.can_request(KEY).await);
        assert!(breaker.can_request(KEY).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::default();
        let result = breaker
            .call(KEY, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout(d)) if d == Duration::from_secs(1)));
        assert_eq!(breaker.state(KEY).await.unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert!(!breaker.can_request(KEY).await);
        assert!(breaker.can_request("put:http://lb-b/register").await);
    }
}
