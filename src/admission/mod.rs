// Session Admission Client
// Courier for the server-side one-active-device-per-identity arbitration

pub mod arbiter;

pub use arbiter::InMemoryAdmission;

use crate::config::AdmissionConfig;
use crate::error::RemoteError;
use crate::model::DeviceSession;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Answer to a check-admission call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub can_proceed: bool,
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn granted() -> Self {
        Self { can_proceed: true, reason: None }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self { can_proceed: false, reason: Some(reason.into()) }
    }
}

/// Remote admission procedures
#[async_trait]
pub trait AdmissionBackend: Send + Sync + 'static {
    /// Whether `candidate` may become the active session for `identity`
    async fn check(&self, identity: &str, candidate: &DeviceSession) -> Result<AdmissionDecision, RemoteError>;

    /// Atomically make `candidate` the active session, displacing any other
    async fn confirm(&self, identity: &str, candidate: &DeviceSession) -> Result<(), RemoteError>;

    /// Release `session_id`; must succeed when it is already inactive
    async fn release(&self, identity: &str, session_id: &str) -> Result<(), RemoteError>;
}

/// Retry policy for the idempotent operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl From<&AdmissionConfig> for RetryPolicy {
    fn from(config: &AdmissionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&AdmissionConfig::default())
    }
}

impl RetryPolicy {
    /// Calculate exponential backoff delay
    fn calculate_backoff(attempt: u32, min_ms: u64, max_ms: u64) -> u64 {
        let delay = min_ms.saturating_mul(2u64.saturating_pow(attempt));
        delay.min(max_ms)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = Self::calculate_backoff(attempt, self.base_backoff_ms, self.max_backoff_ms);
        let jitter = if base > 1 { rand::thread_rng().gen_range(0..=base / 4) } else { 0 };
        Duration::from_millis(base + jitter)
    }
}

/// Admission client used by the Reconciler
///
/// The client performs no local arbitration: it forwards the descriptor and
/// reports the server's decision.
#[derive(Clone)]
pub struct AdmissionClient {
    backend: Arc<dyn AdmissionBackend>,
    retry: RetryPolicy,
}

impl AdmissionClient {
    pub fn new(backend: Arc<dyn AdmissionBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Check admission, retrying transient failures
    #[instrument(skip(self, candidate), fields(session_id = %candidate.session_id))]
    pub async fn check(&self, identity: &str, candidate: &DeviceSession) -> Result<AdmissionDecision, RemoteError> {
        let mut attempt = 0;
        loop {
            match self.backend.check(identity, candidate).await {
                Ok(decision) => {
                    debug!(can_proceed = decision.can_proceed, "Admission check answered");
                    return Ok(decision);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(error = %e, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Admission check failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Claim the device slot; called exactly once per login
    ///
    /// A blind retry could pre-empt the session this very call just granted.
    #[instrument(skip(self, candidate), fields(session_id = %candidate.session_id))]
    pub async fn confirm(&self, identity: &str, candidate: &DeviceSession) -> Result<(), RemoteError> {
        self.backend.confirm(identity, candidate).await?;
        info!("Device slot claimed");
        Ok(())
    }

    /// Release the device slot, retrying transient failures
    #[instrument(skip(self))]
    pub async fn release(&self, identity: &str, session_id: &str) -> Result<(), RemoteError> {
        let mut attempt = 0;
        loop {
            match self.backend.release(identity, session_id).await {
                Ok(()) => {
                    info!("Device slot released");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(error = %e, attempt = attempt + 1, "Admission release failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
