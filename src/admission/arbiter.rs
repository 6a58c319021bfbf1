// In-memory admission arbiter
// Server-side single-active-device bookkeeping, for development and tests

use super::{AdmissionBackend, AdmissionDecision};
use crate::error::RemoteError;
use crate::model::DeviceSession;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Holds the active-session pointer per identity
///
/// A candidate is admitted when no session is active, when it is the active
/// session, or when it comes from the device that holds the active session.
#[derive(Debug, Default)]
pub struct InMemoryAdmission {
    active: DashMap<String, DeviceSession>,
    confirms: AtomicU64,
    releases: AtomicU64,
}

impl InMemoryAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_session(&self, identity: &str) -> Option<DeviceSession> {
        self.active.get(identity).map(|entry| entry.value().clone())
    }

    pub fn confirm_count(&self) -> u64 {
        self.confirms.load(Ordering::Relaxed)
    }

    /// Releases that actually deactivated a session
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AdmissionBackend for InMemoryAdmission {
    async fn check(&self, identity: &str, candidate: &DeviceSession) -> Result<AdmissionDecision, RemoteError> {
        let decision = match self.active.get(identity) {
            None => AdmissionDecision::granted(),
            Some(active)
                if active.session_id == candidate.session_id
                    || active.device_fingerprint == candidate.device_fingerprint =>
            {
                AdmissionDecision::granted()
            }
            Some(_) => AdmissionDecision::denied("identity is active on another device"),
        };
        debug!(identity = identity, can_proceed = decision.can_proceed, "Admission checked");
        Ok(decision)
    }

    async fn confirm(&self, identity: &str, candidate: &DeviceSession) -> Result<(), RemoteError> {
        if let Some(previous) = self.active.insert(identity.to_string(), candidate.clone()) {
            if previous.session_id != candidate.session_id {
                info!(
                    identity = identity,
                    displaced = %previous.session_id,
                    "Active session displaced"
                );
            }
        }
        self.confirms.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn release(&self, identity: &str, session_id: &str) -> Result<(), RemoteError> {
        if self
            .active
            .remove_if(identity, |_, active| active.session_id == session_id)
            .is_some()
        {
            self.releases.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(identity = identity, session_id = session_id, "Release of inactive session ignored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_device_admitted() {
        let arbiter = InMemoryAdmission::new();
        let laptop = DeviceSession::generate("laptop");

        assert!(arbiter.check("kid", &laptop).await.unwrap().can_proceed);
        arbiter.confirm("kid", &laptop).await.unwrap();
        assert_eq!(arbiter.active_session("kid"), Some(laptop));
    }

    #[tokio::test]
    async fn test_other_device_denied_same_device_admitted() {
        let arbiter = InMemoryAdmission::new();
        arbiter.confirm("kid", &DeviceSession::generate("laptop")).await.unwrap();

        let tablet = DeviceSession::generate("tablet");
        let decision = arbiter.check("kid", &tablet).await.unwrap();
        assert!(!decision.can_proceed);
        assert!(decision.reason.is_some());

        let laptop_again = DeviceSession::generate("laptop");
        assert!(arbiter.check("kid", &laptop_again).await.unwrap().can_proceed);
    }

    #[tokio::test]
    async fn test_second_confirm_invalidates_first() {
        let arbiter = InMemoryAdmission::new();
        let laptop = DeviceSession::generate("laptop");
        let tablet = DeviceSession::generate("tablet");

        arbiter.confirm("kid", &laptop).await.unwrap();
        arbiter.confirm("kid", &tablet).await.unwrap();

        assert!(!arbiter.check("kid", &laptop).await.unwrap().can_proceed);
        assert!(arbiter.check("kid", &tablet).await.unwrap().can_proceed);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let arbiter = InMemoryAdmission::new();
        let laptop = DeviceSession::generate("laptop");
        arbiter.confirm("kid", &laptop).await.unwrap();

        arbiter.release("kid", &laptop.session_id).await.unwrap();
        arbiter.release("kid", &laptop.session_id).await.unwrap();
        arbiter.release("nobody", "s-0").await.unwrap();

        assert_eq!(arbiter.release_count(), 1);
        assert!(arbiter.active_session("kid").is_none());
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_session() {
        let arbiter = InMemoryAdmission::new();
        let laptop = DeviceSession::generate("laptop");
        let tablet = DeviceSession::generate("tablet");
        arbiter.confirm("kid", &laptop).await.unwrap();
        arbiter.confirm("kid", &tablet).await.unwrap();

        arbiter.release("kid", &laptop.session_id).await.unwrap();
        assert_eq!(arbiter.active_session("kid"), Some(tablet));
    }
}
