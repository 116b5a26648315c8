//! Load balancer API client.
//!
//! Every outbound call goes through the circuit breaker, keyed by method and
//! URL, so an unreachable peer is skipped until its cooldown elapses.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use thiserror::Error;
use tracing::debug;

use crate::breaker::{BreakerConfig, BreakerError, CircuitBreaker};

/// Header carrying the shared registration key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// What this node advertises on each heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Externally reachable `{host}:{port}`.
    pub address: String,
    /// Room capacity (total slots).
    pub cpus: usize,
    /// Rooms currently hosted.
    pub rooms: usize,
    pub version: String,
}

impl Registration {
    /// `{base}/register/{address}/{cpus}/{rooms}/{version}`, each segment
    /// percent-encoded.
    pub fn url(&self, base: &Url) -> Result<Url, RegistrationFailure> {
        let url = format!(
            "{}/register/{}/{}/{}/{}",
            base.as_str().trim_end_matches('/'),
            urlencoding::encode(&self.address),
            self.cpus,
            self.rooms,
            urlencoding::encode(&self.version),
        );
        Url::parse(&url).map_err(|e| RegistrationFailure::Other(e.to_string()))
    }
}

/// Why a registration did not go through. Used for logging only.
#[derive(Debug, Error)]
pub enum RegistrationFailure {
    /// The peer's circuit is open; nothing was sent.
    #[error("circuit open")]
    CircuitOpen,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with an error status.
    #[error("peer responded with status {status}")]
    Remote { status: u16 },

    /// The request never got an answer.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Other(String),
}

impl RegistrationFailure {
    /// Short label for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            RegistrationFailure::CircuitOpen => "circuit_open",
            RegistrationFailure::Timeout(_) => "timeout",
            RegistrationFailure::Remote { .. } => "remote",
            RegistrationFailure::Unreachable(_) => "unreachable",
            RegistrationFailure::Other(_) => "other",
        }
    }
}

impl From<BreakerError<reqwest::Error>> for RegistrationFailure {
    fn from(err: BreakerError<reqwest::Error>) -> Self {
        match err {
            BreakerError::Open => RegistrationFailure::CircuitOpen,
            BreakerError::Timeout(after) => RegistrationFailure::Timeout(after),
            BreakerError::Inner(e) => {
                if let Some(status) = e.status() {
                    RegistrationFailure::Remote {
                        status: status.as_u16(),
                    }
                } else if e.is_connect() || e.is_timeout() || e.is_request() {
                    RegistrationFailure::Unreachable(e.to_string())
                } else {
                    RegistrationFailure::Other(e.to_string())
                }
            }
        }
    }
}

/// Load balancer API client.
pub struct LoadBalancerClient {
    client: reqwest::Client,
    key: String,
    breaker: CircuitBreaker,
}

impl LoadBalancerClient {
    /// Create a client sending `key` with every registration.
    ///
    /// Outside production, invalid TLS certificates are accepted.
    pub fn new(key: impl Into<String>, production: bool, breaker: BreakerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!production)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            key: key.into(),
            breaker: CircuitBreaker::new(breaker),
        })
    }

    /// Breaker guarding outbound calls.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Breaker key for registrations with `base`.
    ///
    /// Keyed by peer rather than full URL, so a changing room count does not
    /// reset a tripped circuit.
    pub fn registration_endpoint(base: &Url) -> String {
        let target = format!("{}/register", base.as_str().trim_end_matches('/'));
        CircuitBreaker::endpoint_key("PUT", &target)
    }

    /// Register with one peer. Returns the response body.
    pub async fn register(
        &self,
        base: &Url,
        registration: &Registration,
    ) -> Result<String, RegistrationFailure> {
        let url = registration.url(base)?;
        let endpoint = Self::registration_endpoint(base);
        debug!(endpoint = %endpoint, "Registering with load balancer");

        let body = self
            .breaker
            .call(&endpoint, || async {
                self.client
                    .put(url.clone())
                    .header(API_KEY_HEADER, &self.key)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await
            })
            .await?;

        Ok(body)
    }
}
