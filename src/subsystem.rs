// Subsystem assembly
// Wires store, reconciler, gate and presence from one configuration

use crate::config::SessionConfig;
use crate::gate::{AccessGate, AccessPolicyTable, GateDecision, RedirectMemory};
use crate::presence::{PresenceBroadcaster, RealtimeChannel};
use crate::reconciler::{AuthStateReconciler, Collaborators, InitOutcome, ReconcilerSettings};
use crate::error::AuthError;
use crate::store::{LocalSessionStore, StorageBackend, StorageKeys};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything the UI layer talks to
pub struct SessionSubsystem {
    reconciler: AuthStateReconciler,
    gate: Arc<AccessGate>,
    presence: Arc<PresenceBroadcaster>,
    presence_follower: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSubsystem {
    pub fn assemble(
        config: &SessionConfig,
        collaborators: Collaborators,
        storage: Arc<dyn StorageBackend>,
        realtime: Arc<dyn RealtimeChannel>,
        device_fingerprint: impl Into<String>,
    ) -> Self {
        let store = LocalSessionStore::new(storage, StorageKeys::from(&config.storage));
        info!("✓ Local session store ready");

        let redirects = RedirectMemory::new(config.access.login_path.clone());
        let profiles = collaborators.profiles.clone();

        let reconciler = AuthStateReconciler::new(
            collaborators,
            store.clone(),
            redirects.clone(),
            ReconcilerSettings::from_config(config, device_fingerprint),
        );
        info!(idle_timeout = config.watchdog.idle_timeout_enabled, "✓ Auth state reconciler created");

        let policy = Arc::new(AccessPolicyTable::from_config(&config.access));
        let gate = Arc::new(AccessGate::new(
            policy,
            store,
            profiles,
            redirects,
            config.access.login_path.clone(),
        ));
        info!(free_prefixes = config.access.free_tier_prefixes.len(), "✓ Access-control gate ready");

        let presence = Arc::new(PresenceBroadcaster::new(realtime, &config.presence));
        info!(topic = %config.presence.topic, "✓ Presence broadcaster ready");

        Self {
            reconciler,
            gate,
            presence,
            presence_follower: Mutex::new(None),
        }
    }

    /// Initialize the reconciler and let presence follow its view
    pub async fn start(&self) -> Result<InitOutcome, AuthError> {
        {
            let mut follower = self.presence_follower.lock();
            if follower.is_none() {
                let views = self.reconciler.subscribe_view();
                *follower = Some(self.presence.clone().follow(views));
            }
        }
        let outcome = self.reconciler.initialize().await?;
        info!(?outcome, "Session subsystem started");
        Ok(outcome)
    }

    pub fn reconciler(&self) -> &AuthStateReconciler {
        &self.reconciler
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn presence(&self) -> &PresenceBroadcaster {
        &self.presence
    }

    /// Gate decision for `path` against the current view
    pub async fn can_access(&self, path: &str) -> GateDecision {
        let mut views = self.reconciler.subscribe_view();
        self.gate.wait_and_evaluate(path, &mut views).await
    }

    /// Unmount: nothing published after this
    pub fn shutdown(&self) {
        self.reconciler.shutdown();
        if let Some(follower) = self.presence_follower.lock().take() {
            follower.abort();
        }
        self.presence.stop();
        info!("Session subsystem shut down");
    }
}
