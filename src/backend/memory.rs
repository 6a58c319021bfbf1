// In-memory collaborators
// Stand-ins for the hosted backend, used in development and tests

use super::{IdentityProvider, PasswordAuthenticator, PasswordVerification, ProfileStore, SignUpReceipt};
use crate::error::RemoteError;
use crate::model::{Profile, ProviderEvent, ProviderEventKind, ProviderSession};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

fn unavailable(what: &str) -> RemoteError {
    RemoteError::Unavailable(format!("{what} is offline"))
}

/// Identity provider holding at most one session
pub struct InMemoryIdentityProvider {
    events: broadcast::Sender<ProviderEvent>,
    session: Mutex<Option<ProviderSession>>,
    users: DashMap<String, String>,
    offline: AtomicBool,
    sign_outs: AtomicU64,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            session: Mutex::new(None),
            users: DashMap::new(),
            offline: AtomicBool::new(false),
            sign_outs: AtomicU64::new(0),
        }
    }

    /// Seed a session that `current_session` reports without emitting an event
    pub fn with_session(self, session: ProviderSession) -> Self {
        *self.session.lock() = Some(session);
        self
    }

    /// Simulate the return leg of an OAuth round trip
    pub fn complete_sign_in(&self, session: ProviderSession) {
        *self.session.lock() = Some(session.clone());
        self.emit(ProviderEventKind::SignedIn, Some(session));
    }

    pub fn emit(&self, kind: ProviderEventKind, session: Option<ProviderSession>) {
        if self.events.send(ProviderEvent { kind, session }).is_err() {
            debug!(?kind, "Provider event emitted with no subscribers");
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn sign_out_count(&self) -> u64 {
        self.sign_outs.load(Ordering::Relaxed)
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::Relaxed) {
            Err(unavailable("identity provider"))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    async fn current_session(&self) -> Result<Option<ProviderSession>, RemoteError> {
        self.ensure_online()?;
        Ok(self.session.lock().clone())
    }

    async fn sign_up(&self, email: &str, _secret: &str) -> Result<SignUpReceipt, RemoteError> {
        self.ensure_online()?;
        if self.users.contains_key(email) {
            return Err(RemoteError::Rejected(format!("{email} is already registered")));
        }
        let user_id = uuid::Uuid::new_v4().to_string();
        self.users.insert(email.to_string(), user_id.clone());
        Ok(SignUpReceipt { user_id, needs_confirmation: true })
    }

    async fn begin_federated_sign_in(&self, return_to: &str) -> Result<String, RemoteError> {
        self.ensure_online()?;
        Ok(format!("https://id.example.invalid/authorize?provider=google&return_to={return_to}"))
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.sign_outs.fetch_add(1, Ordering::Relaxed);
        self.ensure_online()?;
        let previous = self.session.lock().take();
        if previous.is_some() {
            self.emit(ProviderEventKind::SignedOut, None);
        }
        Ok(())
    }
}

struct Account {
    secret: String,
    verification: PasswordVerification,
}

/// Password RPC backed by a map of accounts
#[derive(Default)]
pub struct InMemoryPasswords {
    accounts: DashMap<String, Account>,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryPasswords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        identity: &str,
        secret: &str,
        user_ref: &str,
        member_ref: &str,
        nickname: &str,
    ) {
        self.accounts.insert(
            identity.to_string(),
            Account {
                secret: secret.to_string(),
                verification: PasswordVerification {
                    is_valid: true,
                    display_user_ref: Some(user_ref.to_string()),
                    display_member_ref: Some(member_ref.to_string()),
                    nickname: Some(nickname.to_string()),
                },
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PasswordAuthenticator for InMemoryPasswords {
    async fn verify(&self, identity: &str, secret: &str) -> Result<PasswordVerification, RemoteError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.offline.load(Ordering::Relaxed) {
            return Err(unavailable("password service"));
        }
        Ok(match self.accounts.get(identity) {
            Some(account) if account.secret == secret => account.verification.clone(),
            _ => PasswordVerification::rejected(),
        })
    }
}

/// Profile store keyed by provider user id and by email
#[derive(Default)]
pub struct InMemoryProfiles {
    by_provider: DashMap<String, Profile>,
    by_email: DashMap<String, Profile>,
    delays: DashMap<String, Duration>,
    failing: AtomicBool,
    fetches: AtomicU64,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_for_provider(&self, user_id: &str, profile: Profile) {
        self.by_provider.insert(user_id.to_string(), profile);
    }

    pub fn insert_for_email(&self, email: &str, profile: Profile) {
        self.by_email.insert(email.to_string(), profile);
    }

    /// Make every fetch for `key` (user id or email) take `delay`
    pub fn set_delay(&self, key: &str, delay: Duration) {
        self.delays.insert(key.to_string(), delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn before_fetch(&self, key: &str) -> Result<(), RemoteError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let delay = self.delays.get(key).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(unavailable("profile store"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfiles {
    async fn fetch_by_provider_id(&self, user_id: &str) -> Result<Option<Profile>, RemoteError> {
        self.before_fetch(user_id).await?;
        Ok(self.by_provider.get(user_id).map(|p| p.value().clone()))
    }

    async fn fetch_approved_by_email(&self, email: &str) -> Result<Option<Profile>, RemoteError> {
        self.before_fetch(email).await?;
        Ok(self
            .by_email
            .get(email)
            .map(|p| p.value().clone())
            .filter(|p| p.approved))
    }
}
