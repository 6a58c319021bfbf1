// Remote collaborator contracts
// The identity provider, password RPC, profile store and warm-up jobs the subsystem depends on

pub mod memory;

pub use memory::{InMemoryIdentityProvider, InMemoryPasswords, InMemoryProfiles};

use crate::error::RemoteError;
use crate::model::{Profile, ProviderEvent, ProviderSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Result of the password-verification RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordVerification {
    pub is_valid: bool,
    pub display_user_ref: Option<String>,
    pub display_member_ref: Option<String>,
    pub nickname: Option<String>,
}

impl PasswordVerification {
    pub fn rejected() -> Self {
        Self {
            is_valid: false,
            display_user_ref: None,
            display_member_ref: None,
            nickname: None,
        }
    }
}

/// Result of a provider sign-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpReceipt {
    pub user_id: String,

    /// The provider wants the address confirmed before first sign-in
    pub needs_confirmation: bool,
}

/// External identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Push-style session-change channel
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    async fn current_session(&self) -> Result<Option<ProviderSession>, RemoteError>;

    async fn sign_up(&self, email: &str, secret: &str) -> Result<SignUpReceipt, RemoteError>;

    /// Start an OAuth round trip; returns the authorization URL to navigate to
    async fn begin_federated_sign_in(&self, return_to: &str) -> Result<String, RemoteError>;

    async fn sign_out(&self) -> Result<(), RemoteError>;
}

/// Custom password-verification RPC
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync + 'static {
    async fn verify(&self, identity: &str, secret: &str) -> Result<PasswordVerification, RemoteError>;
}

/// Remote registration/profile store
#[async_trait]
pub trait ProfileStore: Send + Sync + 'static {
    async fn fetch_by_provider_id(&self, user_id: &str) -> Result<Option<Profile>, RemoteError>;

    /// Lookup by remembered email, restricted to approved registrations
    async fn fetch_approved_by_email(&self, email: &str) -> Result<Option<Profile>, RemoteError>;
}

/// Background job kicked off after a successful login
#[async_trait]
pub trait WarmupJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, identity: &str) -> Result<(), RemoteError>;
}
