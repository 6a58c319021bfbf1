// Data model shared across the subsystem
// Tiers, entitlements, profiles, provider sessions and the reconciled auth view

pub mod session;

pub use session::{DeviceSession, SessionRecord};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Subscription level controlling which routes a user may see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Basic,
    Premium,
}

impl Tier {
    /// Tier applied whenever entitlements are unknown
    pub fn most_restrictive() -> Self {
        Tier::Basic
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Entitlement data fetched from the remote profile store
///
/// Cached for the session's lifetime only; re-fetched on every (re)initialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub tier: Tier,
    pub ai_quota: Option<u32>,
    pub ai_usage_count: Option<u32>,
    pub quota_reset_date: Option<NaiveDate>,
}

impl EntitlementSnapshot {
    /// Snapshot used when the profile could not be loaded
    pub fn restricted() -> Self {
        Self {
            tier: Tier::most_restrictive(),
            ..Default::default()
        }
    }

    /// AI requests left in the current period
    pub fn ai_quota_remaining(&self) -> Option<u32> {
        self.ai_quota
            .map(|quota| quota.saturating_sub(self.ai_usage_count.unwrap_or(0)))
    }

    /// Whether the usage counter is due to be reset
    pub fn quota_needs_reset(&self, today: NaiveDate) -> bool {
        self.quota_reset_date.is_some_and(|reset| today >= reset)
    }
}

/// Registration/profile record held by the remote profile store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub registration_ref: String,
    pub nickname: Option<String>,
    pub email: Option<String>,
    pub tier: Tier,
    pub ai_quota: Option<u32>,
    pub ai_usage_count: Option<u32>,
    pub quota_reset_date: Option<NaiveDate>,
    pub approved: bool,
}

impl Profile {
    pub fn new(registration_ref: impl Into<String>, tier: Tier) -> Self {
        Self {
            registration_ref: registration_ref.into(),
            nickname: None,
            email: None,
            tier,
            ai_quota: None,
            ai_usage_count: None,
            quota_reset_date: None,
            approved: true,
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_ai_quota(mut self, quota: u32, used: u32) -> Self {
        self.ai_quota = Some(quota);
        self.ai_usage_count = Some(used);
        self
    }

    pub fn with_approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }

    pub fn entitlement(&self) -> EntitlementSnapshot {
        EntitlementSnapshot {
            tier: self.tier,
            ai_quota: self.ai_quota,
            ai_usage_count: self.ai_usage_count,
            quota_reset_date: self.quota_reset_date,
        }
    }
}

/// How a provider session was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginKind {
    Password,
    Federated,
}

/// Session issued by the external identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSession {
    /// Opaque provider-assigned user id
    pub user_id: String,

    /// Issuer tag from the session's app metadata, e.g. `google`
    pub provider: Option<String>,

    pub email: Option<String>,
}

impl ProviderSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            provider: None,
            email: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Classify by issuer metadata: anything other than the email issuer is federated
    pub fn kind(&self) -> LoginKind {
        match self.provider.as_deref() {
            Some(issuer) if !issuer.eq_ignore_ascii_case("email") => LoginKind::Federated,
            _ => LoginKind::Password,
        }
    }
}

/// Identity provider session-change event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Push notification from the identity provider session channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub kind: ProviderEventKind,
    pub session: Option<ProviderSession>,
}

/// Where the effective tier of a view came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierSource {
    Profile,
    #[default]
    Default,
}

/// Authoritative view published by the Reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthView {
    pub is_authenticated: bool,
    pub display_name: Option<String>,
    pub entitlement_tier: Option<Tier>,
    pub is_loading: bool,
    pub registration_ref: Option<String>,
    pub identity_ref: Option<String>,
    pub is_guest: bool,
    pub tier_source: TierSource,
    pub entitlement: Option<EntitlementSnapshot>,
}

impl AuthView {
    /// View before the first reconciliation commits
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::signed_out()
        }
    }

    pub fn signed_out() -> Self {
        Self {
            is_authenticated: false,
            display_name: None,
            entitlement_tier: None,
            is_loading: false,
            registration_ref: None,
            identity_ref: None,
            is_guest: false,
            tier_source: TierSource::Default,
            entitlement: None,
        }
    }
}
