// Reconciliation state machine
// Precedence merge of provider session, local record and remote profile, plus attempt tokens

use crate::model::{AuthView, EntitlementSnapshot, Profile, ProviderSession, SessionRecord, Tier, TierSource};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Outcome of the remote profile fetch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProfileState {
    #[default]
    NotFetched,
    Loaded(Profile),

    /// Fetch succeeded but no approved registration exists
    Missing,

    /// Fetch failed; entitlement degrades to the most restrictive tier
    Failed,
}

/// The three sources of truth gathered for one commit
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub provider: Option<ProviderSession>,
    pub local: Option<SessionRecord>,
    pub profile: ProfileState,
}

impl Reconciliation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, session: ProviderSession) -> Self {
        self.provider = Some(session);
        self
    }

    pub fn with_local(mut self, record: SessionRecord) -> Self {
        self.local = Some(record);
        self
    }

    pub fn with_profile(mut self, profile: ProfileState) -> Self {
        self.profile = profile;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.provider.is_some() || self.local.as_ref().is_some_and(|r| r.logged_in)
    }

    /// Fold the sources into one view
    ///
    /// Identity comes from the local record, then the provider session.
    /// Display name prefers the profile nickname, then the local record, then
    /// the provider email. The tier is taken from a loaded profile only.
    pub fn resolve(&self) -> AuthView {
        if !self.is_authenticated() {
            return AuthView::signed_out();
        }

        let local = self.local.as_ref().filter(|r| r.logged_in);
        let profile = match &self.profile {
            ProfileState::Loaded(profile) => Some(profile),
            _ => None,
        };

        let identity_ref = local
            .and_then(|r| r.identity_ref.clone())
            .or_else(|| self.provider.as_ref().map(|s| s.user_id.clone()));

        let display_name = profile
            .and_then(|p| p.nickname.clone())
            .or_else(|| local.map(|r| r.display_name.clone()).filter(|n| !n.is_empty()))
            .or_else(|| self.provider.as_ref().and_then(|s| s.email.clone()));

        let (tier_source, entitlement) = match profile {
            Some(p) => (TierSource::Profile, p.entitlement()),
            None => (TierSource::Default, EntitlementSnapshot::restricted()),
        };

        AuthView {
            is_authenticated: true,
            display_name,
            entitlement_tier: Some(entitlement.tier),
            is_loading: false,
            registration_ref: profile.map(|p| p.registration_ref.clone()),
            identity_ref,
            is_guest: local.is_some_and(|r| r.is_guest_mode),
            tier_source,
            entitlement: Some(entitlement),
        }
    }

    pub fn tier(&self) -> Tier {
        match &self.profile {
            ProfileState::Loaded(profile) => profile.tier,
            _ => Tier::most_restrictive(),
        }
    }
}

/// Ticket for one initiated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt(u64);

impl Attempt {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Monotonic attempt counter; only the latest attempt may commit
#[derive(Debug, Default)]
pub struct AttemptCounter {
    latest: AtomicU64,
    closed: AtomicBool,
}

impl AttemptCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Attempt {
        Attempt(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, attempt: Attempt) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.latest.load(Ordering::SeqCst) == attempt.0
    }

    /// Invalidate every outstanding and future attempt
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
