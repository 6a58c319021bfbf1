// Access-Control Gate
// Route-boundary decision: allow, in-place upgrade prompt, wait, or redirect to login

pub mod policy;
pub mod redirect;

pub use policy::AccessPolicyTable;
pub use redirect::RedirectMemory;

use crate::backend::ProfileStore;
use crate::model::{AuthView, Tier, TierSource};
use crate::observability;
use crate::store::LocalSessionStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// What to render for a wrapped route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,

    /// Paywall rendered in place of the content
    UpgradePrompt { path: String, required: Tier },

    /// Reconciler still loading and no local session to go on
    Pending,

    RedirectToLogin { login_path: String, remembered: String },
}

impl GateDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Allow => "allow",
            GateDecision::UpgradePrompt { .. } => "upgrade_prompt",
            GateDecision::Pending => "pending",
            GateDecision::RedirectToLogin { .. } => "redirect_to_login",
        }
    }
}

/// Everything one decision depends on
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub path: &'a str,

    /// Local session flag, read synchronously
    pub local_session: bool,

    pub view: &'a AuthView,

    /// Tier fetched by the remembered identity handle, if any
    pub fetched_tier: Option<Tier>,
}

pub struct AccessGate {
    policy: Arc<AccessPolicyTable>,
    store: LocalSessionStore,
    profiles: Arc<dyn ProfileStore>,
    redirects: RedirectMemory,
    login_path: String,

    /// Tier by remembered identity handle
    fetched: DashMap<String, Tier>,
}

impl AccessGate {
    pub fn new(
        policy: Arc<AccessPolicyTable>,
        store: LocalSessionStore,
        profiles: Arc<dyn ProfileStore>,
        redirects: RedirectMemory,
        login_path: impl Into<String>,
    ) -> Self {
        Self {
            policy,
            store,
            profiles,
            redirects,
            login_path: login_path.into(),
            fetched: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &AccessPolicyTable {
        &self.policy
    }

    /// Decide from already-gathered inputs
    pub fn decide(&self, input: &GateInput<'_>) -> GateDecision {
        if input.local_session {
            let tier = Self::effective_tier(input.view, input.fetched_tier);
            return self.check_tier(input.path, Some(tier));
        }

        if input.view.is_loading {
            return GateDecision::Pending;
        }

        if !input.view.is_authenticated {
            self.redirects.remember(input.path);
            return GateDecision::RedirectToLogin {
                login_path: self.login_path.clone(),
                remembered: input.path.to_string(),
            };
        }

        self.check_tier(input.path, input.view.entitlement_tier)
    }

    /// Profile-sourced tier, then the tier fetched by identity, then basic
    pub fn effective_tier(view: &AuthView, fetched: Option<Tier>) -> Tier {
        match (view.tier_source, view.entitlement_tier) {
            (TierSource::Profile, Some(tier)) => tier,
            _ => fetched.unwrap_or_else(Tier::most_restrictive),
        }
    }

    /// Gather inputs and decide for the current view
    pub async fn evaluate(&self, path: &str, view: &AuthView) -> GateDecision {
        let local_session = self.store.has_logged_in_flag();
        let fetched_tier = if local_session && view.tier_source != TierSource::Profile {
            self.fetch_tier_by_identity().await
        } else {
            None
        };

        let decision = self.decide(&GateInput {
            path,
            local_session,
            view,
            fetched_tier,
        });
        observability::record_gate_decision(path, decision.label());
        decision
    }

    /// Like `evaluate`, but without a local session waits for loading to clear first
    pub async fn wait_and_evaluate(
        &self,
        path: &str,
        views: &mut watch::Receiver<AuthView>,
    ) -> GateDecision {
        if !self.store.has_logged_in_flag() {
            if let Err(e) = views.wait_for(|view| !view.is_loading).await {
                debug!(error = %e, "Auth view closed while waiting");
            }
        }
        let view = views.borrow().clone();
        self.evaluate(path, &view).await
    }

    pub fn clear_tier_cache(&self) {
        self.fetched.clear();
    }

    async fn fetch_tier_by_identity(&self) -> Option<Tier> {
        let identity = match self.store.remembered_identity() {
            Ok(Some(identity)) => identity,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Remembered identity unreadable");
                return None;
            }
        };

        if let Some(tier) = self.fetched.get(&identity) {
            return Some(*tier);
        }

        match self.profiles.fetch_approved_by_email(&identity).await {
            Ok(Some(profile)) => {
                self.fetched.insert(identity, profile.tier);
                Some(profile.tier)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Tier lookup by identity failed, using default");
                None
            }
        }
    }

    fn check_tier(&self, path: &str, tier: Option<Tier>) -> GateDecision {
        if self.policy.permits(path, tier) {
            GateDecision::Allow
        } else {
            GateDecision::UpgradePrompt {
                path: AccessPolicyTable::strip_query(path).to_string(),
                required: self.policy.required_tier(path),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryProfiles;
    use crate::model::{Profile, SessionRecord};
    use crate::store::{MemoryStorage, StorageKeys};

    struct Fixture {
        gate: AccessGate,
        store: LocalSessionStore,
        profiles: Arc<InMemoryProfiles>,
        redirects: RedirectMemory,
    }

    fn fixture() -> Fixture {
        let store = LocalSessionStore::new(Arc::new(MemoryStorage::new()), StorageKeys::default());
        let profiles = Arc::new(InMemoryProfiles::new());
        let redirects = RedirectMemory::new("/login");
        let gate = AccessGate::new(
            Arc::new(AccessPolicyTable::default()),
            store.clone(),
            profiles.clone(),
            redirects.clone(),
            "/login",
        );
        Fixture { gate, store, profiles, redirects }
    }

    fn authenticated(tier: Tier, source: TierSource) -> AuthView {
        AuthView {
            is_authenticated: true,
            display_name: Some("Mina".into()),
            entitlement_tier: Some(tier),
            tier_source: source,
            ..AuthView::signed_out()
        }
    }

    #[tokio::test]
    async fn test_local_session_fast_path_skips_loading() {
        let f = fixture();
        f.store.save_record(&SessionRecord::guest("Guest")).unwrap();

        let decision = f.gate.evaluate("/addition", &AuthView::loading()).await;
        assert_eq!(decision, GateDecision::Allow);
    }

    #[tokio::test]
    async fn test_basic_tier_query_strip_and_paywall() {
        let f = fixture();
        f.store.save_record(&SessionRecord::guest("Guest")).unwrap();
        let view = authenticated(Tier::Basic, TierSource::Default);

        assert_eq!(f.gate.evaluate("/addition?x=1", &view).await, GateDecision::Allow);
        assert_eq!(
            f.gate.evaluate("/money", &view).await,
            GateDecision::UpgradePrompt { path: "/money".into(), required: Tier::Premium }
        );
    }

    #[tokio::test]
    async fn test_premium_profile_allows_everything() {
        let f = fixture();
        f.store.save_record(&SessionRecord::password("Mina", None, None)).unwrap();
        let view = authenticated(Tier::Premium, TierSource::Profile);

        for prefix in f.gate.policy().free_prefixes().to_vec() {
            assert_eq!(f.gate.evaluate(&prefix, &view).await, GateDecision::Allow);
        }
        assert_eq!(f.gate.evaluate("/money", &view).await, GateDecision::Allow);
        assert_eq!(f.profiles.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_tier_fetched_by_remembered_identity() {
        let f = fixture();
        f.store.save_record(&SessionRecord::password("Mina", None, None)).unwrap();
        f.store.remember_identity("kid@example.com").unwrap();
        f.profiles.insert_for_email("kid@example.com", Profile::new("r-1", Tier::Premium));

        let view = authenticated(Tier::Basic, TierSource::Default);
        assert_eq!(f.gate.evaluate("/money", &view).await, GateDecision::Allow);
        assert_eq!(f.gate.evaluate("/clock", &view).await, GateDecision::Allow);
        assert_eq!(f.profiles.fetch_count(), 1);

        f.gate.clear_tier_cache();
        f.profiles.set_failing(true);
        assert!(matches!(
            f.gate.evaluate("/money", &view).await,
            GateDecision::UpgradePrompt { .. }
        ));
    }

    #[tokio::test]
    async fn test_no_local_session_waits_then_redirects() {
        let f = fixture();

        assert_eq!(f.gate.evaluate("/money", &AuthView::loading()).await, GateDecision::Pending);
        assert!(f.redirects.peek().is_none());

        let decision = f.gate.evaluate("/money?week=3", &AuthView::signed_out()).await;
        assert_eq!(
            decision,
            GateDecision::RedirectToLogin {
                login_path: "/login".into(),
                remembered: "/money?week=3".into()
            }
        );
        assert_eq!(f.redirects.take().as_deref(), Some("/money?week=3"));
    }

    #[tokio::test]
    async fn test_authoritative_view_without_local_flag() {
        let f = fixture();
        let view = authenticated(Tier::Basic, TierSource::Profile);
        assert!(matches!(
            f.gate.evaluate("/money", &view).await,
            GateDecision::UpgradePrompt { .. }
        ));

        let unknown_tier = AuthView { entitlement_tier: None, ..view };
        assert_eq!(f.gate.evaluate("/money", &unknown_tier).await, GateDecision::Allow);
    }

    #[tokio::test]
    async fn test_wait_and_evaluate_resumes_after_loading() {
        let f = fixture();
        let (tx, mut rx) = watch::channel(AuthView::loading());

        let waiter = async { f.gate.wait_and_evaluate("/division", &mut rx).await };
        let publisher = async {
            tokio::task::yield_now().await;
            tx.send_replace(AuthView::signed_out());
        };
        let (decision, _) = tokio::join!(waiter, publisher);

        assert!(matches!(decision, GateDecision::RedirectToLogin { .. }));
    }
}
