// Auth State Reconciler
// Merges provider session, local record and remote profile into one view; drives login and logout

pub mod merge;

pub use merge::{Attempt, AttemptCounter, ProfileState, Reconciliation};

use crate::admission::{AdmissionBackend, AdmissionClient, RetryPolicy};
use crate::backend::{IdentityProvider, PasswordAuthenticator, ProfileStore, WarmupJob};
use crate::config::SessionConfig;
use crate::error::{AuthError, ErrorClass, RemoteError};
use crate::gate::RedirectMemory;
use crate::model::{AuthView, DeviceSession, LoginKind, Profile, ProviderEvent, ProviderEventKind, ProviderSession, SessionRecord};
use crate::observability;
use crate::store::LocalSessionStore;
use crate::watchdog::absence::absence_exceeded;
use crate::watchdog::{ActivityKind, IdleMode, InactivityWatchdog, WatchdogState};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// How `login` treats admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    Standard,

    /// No admission control and no device slot
    Guest,

    /// Skip check-admission and claim the slot from whichever device holds it
    TakeOver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub display_name: String,

    /// Route the visitor was bounced from before logging in
    pub redirect_to: Option<String>,

    pub device_session: Option<DeviceSession>,

    /// Profile fetch failed and the most restrictive tier applies
    pub entitlement_degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignupOutcome {
    pub user_id: String,
    pub needs_confirmation: bool,
}

/// Outcome of `logout`; individual steps fail independently
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutReport {
    /// Session id handed to release-admission, if there was one
    pub released_session: Option<String>,
    pub failed_steps: Vec<&'static str>,
}

impl LogoutReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// The absence check cleared the session
    ForcedLogout,
    Restored,
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedLogoutReason {
    Inactivity,
    Absence,
}

impl ForcedLogoutReason {
    fn notice(&self) -> &'static str {
        match self {
            ForcedLogoutReason::Inactivity => "You were logged out after a period of inactivity.",
            ForcedLogoutReason::Absence => "You have been away for a while. Please log in again.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Instruction for the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Notice { level: NoticeLevel, message: String },
    Navigate { path: String },
}

/// Remote collaborators the Reconciler talks to
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub passwords: Arc<dyn PasswordAuthenticator>,
    pub profiles: Arc<dyn ProfileStore>,
    pub admission: Arc<dyn AdmissionBackend>,
    pub warmups: Vec<Arc<dyn WarmupJob>>,
}

/// Construction-time settings
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Stable identifier of this device, sent with every descriptor
    pub device_fingerprint: String,
    pub idle_mode: IdleMode,
    pub absence_threshold: chrono::Duration,
    pub activity_write_interval: Duration,
    pub retry: RetryPolicy,
    pub login_path: String,

    /// Where the federated round trip returns to
    pub federated_return_path: String,
    pub guest_display_name: String,
}

impl ReconcilerSettings {
    pub fn from_config(config: &SessionConfig, device_fingerprint: impl Into<String>) -> Self {
        Self {
            device_fingerprint: device_fingerprint.into(),
            idle_mode: IdleMode::from_config(&config.watchdog),
            absence_threshold: config.watchdog.absence_threshold(),
            activity_write_interval: config.storage.activity_write_interval(),
            retry: RetryPolicy::from(&config.admission),
            login_path: config.access.login_path.clone(),
            federated_return_path: "/dashboard".to_string(),
            guest_display_name: "Guest".to_string(),
        }
    }
}

struct Inner {
    identity: Arc<dyn IdentityProvider>,
    passwords: Arc<dyn PasswordAuthenticator>,
    profiles: Arc<dyn ProfileStore>,
    admission: AdmissionClient,
    warmups: Vec<Arc<dyn WarmupJob>>,

    store: LocalSessionStore,
    watchdog: InactivityWatchdog,
    redirects: RedirectMemory,
    settings: ReconcilerSettings,

    view: watch::Sender<AuthView>,
    events: broadcast::Sender<UiEvent>,

    attempts: AttemptCounter,

    /// Serializes the currency check with the publish
    commit_lock: Mutex<()>,

    login_in_flight: AtomicBool,

    /// Provider session-change listener
    listener: Mutex<Option<CancellationToken>>,

    last_visit_written: Mutex<Option<Instant>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(token) = self.listener.get_mut().take() {
            token.cancel();
        }
    }
}

/// Clears the in-flight flag when a login finishes, however it finishes
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The single writer of session state
///
/// Every operation takes an attempt ticket; only the most recently initiated
/// operation may publish its result, so late completions are discarded.
#[derive(Clone)]
pub struct AuthStateReconciler {
    inner: Arc<Inner>,
}

impl AuthStateReconciler {
    pub fn new(
        collaborators: Collaborators,
        store: LocalSessionStore,
        redirects: RedirectMemory,
        settings: ReconcilerSettings,
    ) -> Self {
        let (view, _) = watch::channel(AuthView::loading());
        let (events, _) = broadcast::channel(64);
        let admission = AdmissionClient::new(collaborators.admission, settings.retry);

        Self {
            inner: Arc::new(Inner {
                identity: collaborators.identity,
                passwords: collaborators.passwords,
                profiles: collaborators.profiles,
                admission,
                warmups: collaborators.warmups,
                store,
                watchdog: InactivityWatchdog::new(settings.idle_mode),
                redirects,
                settings,
                view,
                events,
                attempts: AttemptCounter::new(),
                commit_lock: Mutex::new(()),
                login_in_flight: AtomicBool::new(false),
                listener: Mutex::new(None),
                last_visit_written: Mutex::new(None),
            }),
        }
    }

    /// Current authoritative view
    pub fn view(&self) -> AuthView {
        self.inner.view.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<AuthView> {
        self.inner.view.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &LocalSessionStore {
        &self.inner.store
    }

    pub fn redirects(&self) -> &RedirectMemory {
        &self.inner.redirects
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.inner.watchdog.state()
    }

    pub fn is_login_in_flight(&self) -> bool {
        self.inner.login_in_flight.load(Ordering::SeqCst)
    }

    /// Startup sequence: absence check, provider subscription, then local fallback
    pub async fn initialize(&self) -> Result<InitOutcome, AuthError> {
        let span = observability::auth_span("initialize", None);
        async {
            let attempt = self.inner.attempts.begin();
            let store = &self.inner.store;

            if store.has_logged_in_flag() {
                let last_visit = store.last_visit().unwrap_or_else(|e| {
                    warn!(error = %e, "Last-visit marker unreadable");
                    None
                });
                if absence_exceeded(last_visit, Utc::now(), self.inner.settings.absence_threshold) {
                    info!(last_visit = ?last_visit, "Absence threshold exceeded, clearing session");
                    let cleared = [store.clear_record(), store.clear_device_session(), store.clear_last_visit()];
                    for result in cleared {
                        if let Err(e) = result {
                            warn!(error = %e, "Failed to clear stale session key");
                        }
                    }
                    self.commit_or_discard(attempt, AuthView::signed_out());
                    self.announce_forced_logout(ForcedLogoutReason::Absence);
                    return Ok(InitOutcome::ForcedLogout);
                }
            }

            self.spawn_provider_listener();

            let provider = match self.inner.identity.current_session().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Provider session unavailable, falling back to local record");
                    None
                }
            };

            let view = match self.reconcile(attempt, provider).await {
                Ok(view) => view,
                // A newer operation committed first; report the state it left
                Err(AuthError::Superseded) => {
                    debug!(attempt = attempt.id(), "Initialization overtaken");
                    self.view()
                }
                Err(e) => return Err(e),
            };
            if view.is_authenticated {
                if let Err(e) = store.touch_last_visit(Utc::now()) {
                    debug!(error = %e, "Last-visit marker not written");
                }
                Ok(InitOutcome::Restored)
            } else {
                Ok(InitOutcome::Anonymous)
            }
        }
        .instrument(span)
        .await
    }

    /// Password or guest login
    pub async fn login(&self, identity: &str, secret: &str, mode: LoginMode) -> Result<LoginSuccess, AuthError> {
        let span = observability::auth_span("login", Some(identity));
        async {
            if self.inner.login_in_flight.swap(true, Ordering::SeqCst) {
                let err = AuthError::LoginInFlight;
                self.report_failure(&err);
                return Err(err);
            }
            let _guard = InFlightGuard(&self.inner.login_in_flight);
            let attempt = self.inner.attempts.begin();
            debug!(attempt = attempt.id(), ?mode, "Login started");

            let result = match mode {
                LoginMode::Guest => self.login_guest(attempt).await,
                LoginMode::Standard => self.login_member(attempt, identity, secret, false).await,
                LoginMode::TakeOver => self.login_member(attempt, identity, secret, true).await,
            };
            if let Err(e) = &result {
                self.report_failure(e);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn login_guest(&self, attempt: Attempt) -> Result<LoginSuccess, AuthError> {
        let record = SessionRecord::guest(self.inner.settings.guest_display_name.clone());
        self.ensure_current(attempt)?;
        self.release_replaced_slot(None).await;
        self.persist(&record, None, None)?;

        let view = Reconciliation::new().with_local(record.clone()).resolve();
        let display_name = view.display_name.clone().unwrap_or_default();
        if let Err(e) = self.commit(attempt, view) {
            self.roll_back_login(&record, None).await;
            return Err(e);
        }
        self.arm_watchdog();

        info!("Guest login succeeded");
        Ok(LoginSuccess {
            display_name,
            redirect_to: self.inner.redirects.take(),
            device_session: None,
            entitlement_degraded: false,
        })
    }

    async fn login_member(
        &self,
        attempt: Attempt,
        identity: &str,
        secret: &str,
        take_over: bool,
    ) -> Result<LoginSuccess, AuthError> {
        let inner = &self.inner;
        let candidate = DeviceSession::generate(inner.settings.device_fingerprint.clone());

        if take_over {
            info!(session_id = %candidate.session_id, "Take-over login, skipping admission check");
        } else {
            let decision = inner.admission.check(identity, &candidate).await?;
            if !decision.can_proceed {
                return Err(AuthError::AdmissionDenied {
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "another device holds the active session".to_string()),
                });
            }
        }

        let verification = inner.passwords.verify(identity, secret).await?;
        if !verification.is_valid {
            return Err(AuthError::InvalidCredentials);
        }

        inner
            .admission
            .confirm(identity, &candidate)
            .await
            .map_err(AuthError::AdmissionConfirmFailed)?;

        let display_name = verification
            .nickname
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| identity.to_string());
        let record = SessionRecord::password(
            display_name,
            verification.display_user_ref.clone(),
            verification.display_member_ref.clone(),
        );

        let persisted = match self.ensure_current(attempt) {
            Ok(()) => {
                self.release_replaced_slot(Some(&candidate)).await;
                self.persist(&record, Some(&candidate), Some(identity))
            }
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            // The slot was claimed for a login that will not complete
            self.roll_back_login(&record, Some((identity, &candidate))).await;
            return Err(e);
        }

        self.spawn_warmups(identity);

        let profile = Self::profile_state(inner.profiles.fetch_approved_by_email(identity).await);
        let entitlement_degraded = profile == ProfileState::Failed;

        let view = Reconciliation::new()
            .with_local(record.clone())
            .with_profile(profile)
            .resolve();
        let display_name = view.display_name.clone().unwrap_or_else(|| identity.to_string());
        if let Err(e) = self.commit(attempt, view) {
            self.roll_back_login(&record, Some((identity, &candidate))).await;
            return Err(e);
        }
        self.arm_watchdog();

        info!(session_id = %candidate.session_id, "Login succeeded");
        Ok(LoginSuccess {
            display_name,
            redirect_to: inner.redirects.take(),
            device_session: Some(candidate),
            entitlement_degraded,
        })
    }

    /// Register a new identity with the provider
    pub async fn signup(&self, identity: &str, secret: &str) -> Result<SignupOutcome, AuthError> {
        let span = observability::auth_span("signup", Some(identity));
        async {
            match self.inner.identity.sign_up(identity, secret).await {
                Ok(receipt) => {
                    info!(user_id = %receipt.user_id, "Sign-up accepted");
                    if receipt.needs_confirmation {
                        self.emit(UiEvent::Notice {
                            level: NoticeLevel::Info,
                            message: "Check your inbox to confirm your email address.".to_string(),
                        });
                    }
                    Ok(SignupOutcome {
                        user_id: receipt.user_id,
                        needs_confirmation: receipt.needs_confirmation,
                    })
                }
                Err(e) => {
                    let err = AuthError::from(e);
                    self.report_failure(&err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Begin the federated round trip; the session arrives later as a provider event
    pub async fn login_with_federated_provider(&self) -> Result<String, AuthError> {
        let span = observability::auth_span("federated_login", None);
        async {
            let return_to = self
                .inner
                .redirects
                .peek()
                .unwrap_or_else(|| self.inner.settings.federated_return_path.clone());
            match self.inner.identity.begin_federated_sign_in(&return_to).await {
                Ok(url) => {
                    self.emit(UiEvent::Navigate { path: url.clone() });
                    Ok(url)
                }
                Err(e) => {
                    let err = AuthError::from(e);
                    self.report_failure(&err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Best-effort teardown; always ends signed out on the login surface
    pub async fn logout(&self) -> LogoutReport {
        let span = observability::auth_span("logout", None);
        async {
            let report = self.teardown().await;
            self.emit(UiEvent::Navigate { path: self.inner.settings.login_path.clone() });
            report
        }
        .instrument(span)
        .await
    }

    /// Logout triggered by the subsystem rather than the user
    pub async fn force_logout(&self, reason: ForcedLogoutReason) -> LogoutReport {
        let span = observability::auth_span("force_logout", None);
        async {
            warn!(?reason, "Forcing logout");
            let report = self.teardown().await;
            self.announce_forced_logout(reason);
            report
        }
        .instrument(span)
        .await
    }

    async fn teardown(&self) -> LogoutReport {
        let inner = &self.inner;
        let attempt = inner.attempts.begin();
        let mut report = LogoutReport::default();

        let identity = inner.store.remembered_identity().unwrap_or_else(|e| {
            debug!(error = %e, "Remembered identity unreadable");
            None
        });
        let device = inner.store.load_device_session().unwrap_or_else(|e| {
            debug!(error = %e, "Device session unreadable");
            None
        });

        let release = async {
            match (identity.as_deref(), device.as_ref()) {
                (Some(identity), Some(device)) => {
                    Some(inner.admission.release(identity, &device.session_id).await)
                }
                _ => None,
            }
        };
        let (released, signed_out) = futures::join!(release, inner.identity.sign_out());

        match released {
            Some(Ok(())) => report.released_session = device.map(|d| d.session_id),
            Some(Err(e)) => {
                warn!(error = %e, "Release-admission failed during logout");
                report.released_session = device.map(|d| d.session_id);
                report.failed_steps.push("release_admission");
            }
            None => debug!("No device slot to release"),
        }

        if let Err(e) = signed_out {
            warn!(error = %e, "Provider sign-out failed during logout");
            report.failed_steps.push("provider_sign_out");
        }

        if let Err(e) = inner.store.clear_all() {
            warn!(error = %e, "Local session store not fully cleared");
            report.failed_steps.push("clear_store");
        }

        inner.watchdog.stop();
        *inner.last_visit_written.lock() = None;
        self.commit_or_discard(attempt, AuthView::signed_out());

        info!(
            released = report.released_session.is_some(),
            failures = report.failed_steps.len(),
            "Logout finished"
        );
        report
    }

    /// Re-fetch the entitlement snapshot, e.g. on a profile-dependent page
    pub async fn refresh_entitlement(&self) -> Result<AuthView, AuthError> {
        let span = observability::auth_span("refresh_entitlement", None);
        async {
            if self.is_login_in_flight() {
                debug!("Login in flight, keeping current view");
                return Ok(self.view());
            }
            let attempt = self.inner.attempts.begin();
            let provider = self.inner.identity.current_session().await.unwrap_or_else(|e| {
                debug!(error = %e, "Provider session unavailable during refresh");
                None
            });
            self.reconcile(attempt, provider).await
        }
        .instrument(span)
        .await
    }

    /// Feed a user interaction to the watchdog and keep the last-visit marker fresh
    pub fn record_activity(&self, kind: ActivityKind) {
        let inner = &self.inner;
        inner.watchdog.record_activity(kind);

        if !self.view().is_authenticated {
            return;
        }
        let mut written = inner.last_visit_written.lock();
        let due = written.map_or(true, |at| at.elapsed() >= inner.settings.activity_write_interval);
        if due {
            match inner.store.touch_last_visit(Utc::now()) {
                Ok(()) => *written = Some(Instant::now()),
                Err(e) => debug!(error = %e, "Last-visit marker not written"),
            }
        }
    }

    /// Detach from everything; late in-flight results are discarded
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.attempts.close();
        inner.watchdog.stop();
        if let Some(token) = inner.listener.lock().take() {
            token.cancel();
        }
        info!("Reconciler shut down");
    }

    /// Merge the three sources for `provider` and commit
    async fn reconcile(&self, attempt: Attempt, provider: Option<ProviderSession>) -> Result<AuthView, AuthError> {
        let inner = &self.inner;
        let local = inner.store.load_record().unwrap_or_else(|e| {
            warn!(error = %e, "Session record unreadable, ignoring it");
            None
        });

        let mut merge = Reconciliation::new();
        match provider {
            Some(session) if session.kind() == LoginKind::Federated => {
                let profile = Self::profile_state(inner.profiles.fetch_by_provider_id(&session.user_id).await);
                let display_name = match &profile {
                    ProfileState::Loaded(p) => p.nickname.clone(),
                    _ => None,
                }
                .or_else(|| session.email.clone())
                .unwrap_or_else(|| session.user_id.clone());
                let record = SessionRecord::federated(display_name, session.user_id.clone());

                // Populated so the gate's fast path works on the next load
                if inner.attempts.is_current(attempt) {
                    self.release_replaced_slot(None).await;
                    if let Err(e) = self.persist(&record, None, session.email.as_deref()) {
                        warn!(error = %e, "Federated session not written to local store");
                    }
                }
                merge = merge.with_provider(session).with_local(record).with_profile(profile);
            }
            provider => {
                let handle = inner
                    .store
                    .remembered_identity()
                    .unwrap_or_default()
                    .or_else(|| provider.as_ref().and_then(|s| s.email.clone()));
                let wants_profile = provider.is_some() || local.as_ref().is_some_and(|r| r.is_member_session());

                let profile = match handle {
                    Some(handle) if wants_profile => {
                        Self::profile_state(inner.profiles.fetch_approved_by_email(&handle).await)
                    }
                    _ => ProfileState::NotFetched,
                };

                if let Some(session) = provider {
                    merge = merge.with_provider(session);
                }
                if let Some(record) = local {
                    merge = merge.with_local(record);
                }
                merge = merge.with_profile(profile);
            }
        }

        let view = merge.resolve();
        self.commit(attempt, view.clone())?;
        if view.is_authenticated {
            if inner.watchdog.state() == WatchdogState::Stopped {
                self.arm_watchdog();
            }
        } else {
            inner.watchdog.stop();
        }
        Ok(view)
    }

    fn profile_state(result: Result<Option<Profile>, RemoteError>) -> ProfileState {
        match result {
            Ok(Some(profile)) => ProfileState::Loaded(profile),
            Ok(None) => ProfileState::Missing,
            Err(e) => {
                warn!(error = %AuthError::ProfileFetchFailed(e), "Entitlement degraded to most restrictive tier");
                ProfileState::Failed
            }
        }
    }

    /// Replace the stored session whole
    fn persist(
        &self,
        record: &SessionRecord,
        device: Option<&DeviceSession>,
        identity: Option<&str>,
    ) -> Result<(), AuthError> {
        let store = &self.inner.store;
        store.save_record(record)?;
        match device {
            Some(device) => store.save_device_session(device)?,
            None => store.clear_device_session()?,
        }
        match identity {
            Some(identity) => store.remember_identity(identity)?,
            None => store.forget_identity()?,
        }
        store.touch_last_visit(Utc::now())?;
        *self.inner.last_visit_written.lock() = Some(Instant::now());
        Ok(())
    }

    /// Release the slot of the stored session that a new one is about to overwrite
    async fn release_replaced_slot(&self, replacement: Option<&DeviceSession>) {
        let store = &self.inner.store;
        let device = match store.load_device_session() {
            Ok(Some(device)) => device,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Device session unreadable");
                return;
            }
        };
        if replacement.is_some_and(|r| r.session_id == device.session_id) {
            return;
        }
        let identity = match store.remembered_identity() {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                debug!(session_id = %device.session_id, "Replaced device slot has no identity");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Remembered identity unreadable");
                return;
            }
        };
        match self.inner.admission.release(&identity, &device.session_id).await {
            Ok(()) => info!(session_id = %device.session_id, "Released slot of replaced session"),
            Err(e) => warn!(error = %e, "Could not release slot of replaced session"),
        }
    }

    /// Undo a login that reached the store but will not be committed
    async fn roll_back_login(&self, record: &SessionRecord, claimed: Option<(&str, &DeviceSession)>) {
        let store = &self.inner.store;
        if let Some((identity, device)) = claimed {
            if let Err(e) = self.inner.admission.release(identity, &device.session_id).await {
                warn!(error = %e, "Could not release abandoned device slot");
            }
        }

        // Keys written by a newer operation are left alone
        let still_ours = match claimed {
            Some((_, device)) => {
                matches!(store.load_device_session(), Ok(Some(stored)) if stored.session_id == device.session_id)
            }
            None => matches!(store.load_record(), Ok(Some(stored)) if &stored == record),
        };
        if still_ours {
            if let Err(e) = store.clear_all() {
                warn!(error = %e, "Abandoned login not fully cleared");
            }
            *self.inner.last_visit_written.lock() = None;
        }
        info!(cleared = still_ours, "Abandoned login rolled back");
    }

    fn ensure_current(&self, attempt: Attempt) -> Result<(), AuthError> {
        if self.inner.attempts.is_current(attempt) {
            Ok(())
        } else {
            Err(AuthError::Superseded)
        }
    }

    /// Publish `view` if `attempt` is still the latest operation
    fn commit(&self, attempt: Attempt, view: AuthView) -> Result<(), AuthError> {
        let _lock = self.inner.commit_lock.lock();
        if !self.inner.attempts.is_current(attempt) {
            debug!(attempt = attempt.id(), "Discarding stale result");
            return Err(AuthError::Superseded);
        }
        debug!(
            attempt = attempt.id(),
            authenticated = view.is_authenticated,
            tier = ?view.entitlement_tier,
            "View committed"
        );
        self.inner.view.send_replace(view);
        Ok(())
    }

    fn commit_or_discard(&self, attempt: Attempt, view: AuthView) {
        if let Err(e) = self.commit(attempt, view) {
            debug!(error = %e, "Commit skipped");
        }
    }

    fn arm_watchdog(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.watchdog.start(move || {
            if let Some(inner) = weak.upgrade() {
                let reconciler = AuthStateReconciler { inner };
                tokio::spawn(async move {
                    reconciler.force_logout(ForcedLogoutReason::Inactivity).await;
                });
            }
        });
    }

    fn spawn_warmups(&self, identity: &str) {
        for job in &self.inner.warmups {
            let job = job.clone();
            let identity = identity.to_string();
            tokio::spawn(async move {
                match job.run(&identity).await {
                    Ok(()) => debug!(job = job.name(), "Warm-up finished"),
                    Err(e) => warn!(job = job.name(), error = %e, "Warm-up failed"),
                }
            });
        }
    }

    fn spawn_provider_listener(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let mut events = self.inner.identity.subscribe();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        AuthStateReconciler { inner }.on_provider_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Provider events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Provider listener stopped");
        });

        *listener = Some(token);
    }

    async fn on_provider_event(&self, event: ProviderEvent) {
        let span = observability::auth_span("provider_event", None);
        async {
            debug!(kind = ?event.kind, "Provider event");
            let result = match (event.kind, event.session) {
                (ProviderEventKind::SignedIn, Some(session)) => {
                    let attempt = self.inner.attempts.begin();
                    self.reconcile(attempt, Some(session)).await
                }
                (ProviderEventKind::SignedOut, _) => {
                    let attempt = self.inner.attempts.begin();
                    // A federated record has nothing left to stand on
                    if let Ok(Some(record)) = self.inner.store.load_record() {
                        if record.is_federated_login {
                            if let Err(e) = self.inner.store.clear_all() {
                                warn!(error = %e, "Federated session not fully cleared");
                            }
                        }
                    }
                    self.reconcile(attempt, None).await
                }
                (ProviderEventKind::UserUpdated, Some(_)) => self.refresh_entitlement().await,
                _ => return,
            };
            if let Err(e) = result {
                debug!(error = %e, "Provider event not applied");
            }
        }
        .instrument(span)
        .await
    }

    fn announce_forced_logout(&self, reason: ForcedLogoutReason) {
        self.emit(UiEvent::Notice {
            level: NoticeLevel::Warning,
            message: reason.notice().to_string(),
        });
        self.emit(UiEvent::Navigate { path: self.inner.settings.login_path.clone() });
    }

    fn report_failure(&self, err: &AuthError) {
        match err.class() {
            ErrorClass::UserRecoverable => info!(error = %err, "Login flow rejected"),
            ErrorClass::FatalToFlow => error!(error = %err, "Login flow failed"),
            ErrorClass::Degraded => warn!(error = %err, "Degraded"),
            ErrorClass::SilentBestEffort => debug!(error = %err, "Discarded"),
        }
        if let Some(message) = err.notice() {
            let level = match err.class() {
                ErrorClass::FatalToFlow => NoticeLevel::Error,
                _ => NoticeLevel::Warning,
            };
            self.emit(UiEvent::Notice { level, message: message.to_string() });
        }
    }

    fn emit(&self, event: UiEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("UI event dropped, no listeners");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::InMemoryAdmission;
    use crate::backend::{InMemoryIdentityProvider, InMemoryPasswords, InMemoryProfiles};
    use crate::model::Tier;
    use crate::store::{MemoryStorage, StorageBackend, StorageKeys};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        reconciler: AuthStateReconciler,
        identity: Arc<InMemoryIdentityProvider>,
        passwords: Arc<InMemoryPasswords>,
        profiles: Arc<InMemoryProfiles>,
        admission: Arc<InMemoryAdmission>,
        storage: Arc<MemoryStorage>,
    }

    fn harness_with(idle_mode: IdleMode, warmups: Vec<Arc<dyn WarmupJob>>) -> Harness {
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let passwords = Arc::new(InMemoryPasswords::new());
        let profiles = Arc::new(InMemoryProfiles::new());
        let admission = Arc::new(InMemoryAdmission::new());
        let storage = Arc::new(MemoryStorage::new());

        passwords.register("kid@example.com", "s3cret", "u-1", "m-1", "Mina");
        profiles.insert_for_email(
            "kid@example.com",
            Profile::new("r-1", Tier::Premium).with_nickname("Mina"),
        );

        let mut settings = ReconcilerSettings::from_config(&SessionConfig::default(), "laptop");
        settings.idle_mode = idle_mode;
        settings.retry = RetryPolicy { max_attempts: 1, base_backoff_ms: 1, max_backoff_ms: 1 };

        let reconciler = AuthStateReconciler::new(
            Collaborators {
                identity: identity.clone(),
                passwords: passwords.clone(),
                profiles: profiles.clone(),
                admission: admission.clone(),
                warmups,
            },
            LocalSessionStore::new(storage.clone(), StorageKeys::default()),
            RedirectMemory::new("/login"),
            settings,
        );

        Harness { reconciler, identity, passwords, profiles, admission, storage }
    }

    fn harness() -> Harness {
        harness_with(IdleMode::Disabled, Vec::new())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    struct FailingWarmup(AtomicUsize);

    #[async_trait]
    impl WarmupJob for FailingWarmup {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _identity: &str) -> Result<(), RemoteError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Unavailable("cold".into()))
        }
    }

    #[tokio::test]
    async fn test_login_persists_and_commits() {
        let h = harness();
        let success = h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();

        assert_eq!(success.display_name, "Mina");
        assert!(!success.entitlement_degraded);
        let device = success.device_session.unwrap();
        assert_eq!(h.admission.active_session("kid@example.com"), Some(device.clone()));

        let store = h.reconciler.store();
        assert!(store.has_logged_in_flag());
        assert_eq!(store.load_device_session().unwrap(), Some(device));
        assert_eq!(store.remembered_identity().unwrap().as_deref(), Some("kid@example.com"));

        let view = h.reconciler.view();
        assert!(view.is_authenticated);
        assert_eq!(view.entitlement_tier, Some(Tier::Premium));
        assert_eq!(view.identity_ref.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_wrong_secret_writes_nothing() {
        let h = harness();
        let mut events = h.reconciler.subscribe_events();

        let err = h
            .reconciler
            .login("kid@example.com", "nope", LoginMode::Standard)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials));
        assert!(h.storage.is_empty());
        assert!(h.admission.active_session("kid@example.com").is_none());
        assert!(matches!(events.try_recv(), Ok(UiEvent::Notice { .. })));
    }

    #[tokio::test]
    async fn test_admission_denied_skips_password_check() {
        let h = harness();
        h.admission
            .confirm("kid@example.com", &DeviceSession::generate("tablet"))
            .await
            .unwrap();

        let err = h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::AdmissionDenied { .. }));
        assert_eq!(h.passwords.call_count(), 0);
        assert!(!h.reconciler.store().has_logged_in_flag());
    }

    #[tokio::test]
    async fn test_take_over_claims_slot() {
        let h = harness();
        h.admission
            .confirm("kid@example.com", &DeviceSession::generate("tablet"))
            .await
            .unwrap();

        let success = h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::TakeOver)
            .await
            .unwrap();
        assert_eq!(h.admission.active_session("kid@example.com"), success.device_session);
    }

    #[tokio::test]
    async fn test_profile_failure_degrades() {
        let h = harness();
        h.profiles.set_failing(true);

        let success = h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();

        assert!(success.entitlement_degraded);
        let view = h.reconciler.view();
        assert!(view.is_authenticated);
        assert_eq!(view.entitlement_tier, Some(Tier::Basic));
    }

    #[tokio::test]
    async fn test_password_service_down_is_network_error() {
        let h = harness();
        h.passwords.set_offline(true);

        let err = h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NetworkUnavailable(_)));
    }

    #[tokio::test]
    async fn test_guest_login_has_no_device() {
        let h = harness();
        let success = h.reconciler.login("", "", LoginMode::Guest).await.unwrap();

        assert!(success.device_session.is_none());
        assert_eq!(h.admission.confirm_count(), 0);
        assert!(h.reconciler.store().load_device_session().unwrap().is_none());
        let view = h.reconciler.view();
        assert!(view.is_guest);
        assert_eq!(view.entitlement_tier, Some(Tier::Basic));
    }

    #[tokio::test]
    async fn test_second_login_rejected_while_in_flight() {
        let h = harness();
        h.profiles.set_delay("kid@example.com", Duration::from_millis(50));

        let first = h.reconciler.login("kid@example.com", "s3cret", LoginMode::Standard);
        let second = async {
            tokio::task::yield_now().await;
            h.reconciler.login("kid@example.com", "s3cret", LoginMode::Standard).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(AuthError::LoginInFlight)));
        assert!(!h.reconciler.is_login_in_flight());
    }

    #[tokio::test]
    async fn test_logout_releases_once_and_clears() {
        let h = harness();
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();

        let first = h.reconciler.logout().await;
        assert!(first.is_clean());
        assert!(first.released_session.is_some());
        assert!(h.storage.is_empty());
        assert!(!h.reconciler.view().is_authenticated);

        let second = h.reconciler.logout().await;
        assert!(second.is_clean());
        assert!(second.released_session.is_none());
        assert_eq!(h.admission.release_count(), 1);
    }

    #[tokio::test]
    async fn test_logout_survives_failing_steps() {
        let h = harness();
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        h.identity.set_offline(true);
        let mut events = h.reconciler.subscribe_events();

        let report = h.reconciler.logout().await;
        assert_eq!(report.failed_steps, vec!["provider_sign_out"]);
        assert!(h.storage.is_empty());
        assert_eq!(h.admission.release_count(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            UiEvent::Navigate { path: "/login".into() }
        );
    }

    #[tokio::test]
    async fn test_federated_session_populates_store() {
        let h = harness();
        h.identity.complete_sign_in(
            ProviderSession::new("g-7").with_provider("google").with_email("kid@example.com"),
        );
        h.profiles.insert_for_provider("g-7", Profile::new("r-7", Tier::Premium).with_nickname("Mina"));

        assert_eq!(h.reconciler.initialize().await.unwrap(), InitOutcome::Restored);
        let record = h.reconciler.store().load_record().unwrap().unwrap();
        assert!(record.is_federated_login);
        assert_eq!(record.identity_ref.as_deref(), Some("g-7"));
        assert_eq!(h.reconciler.view().registration_ref.as_deref(), Some("r-7"));
    }

    #[tokio::test]
    async fn test_provider_sign_in_event_after_initialize() {
        let h = harness();
        assert_eq!(h.reconciler.initialize().await.unwrap(), InitOutcome::Anonymous);

        h.profiles.set_failing(true);
        h.identity.complete_sign_in(ProviderSession::new("g-7").with_provider("google"));
        let mut views = h.reconciler.subscribe_view();
        views.wait_for(|v| v.is_authenticated).await.unwrap();

        assert_eq!(h.reconciler.view().entitlement_tier, Some(Tier::Basic));
    }

    #[tokio::test]
    async fn test_absence_clears_session() {
        let h = harness();
        h.reconciler.login("", "", LoginMode::Guest).await.unwrap();
        let stale = Utc::now() - chrono::Duration::hours(49);
        h.storage.set("last_visit", &stale.to_rfc3339()).unwrap();
        let mut events = h.reconciler.subscribe_events();

        assert_eq!(h.reconciler.initialize().await.unwrap(), InitOutcome::ForcedLogout);
        assert!(!h.reconciler.store().has_logged_in_flag());
        assert!(matches!(events.try_recv(), Ok(UiEvent::Notice { level: NoticeLevel::Warning, .. })));
        assert_eq!(h.identity.sign_out_count(), 0);
    }

    #[tokio::test]
    async fn test_local_fallback_uses_remembered_identity() {
        let h = harness();
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();

        let fresh = harness();
        for key in ["session", "device_session", "remembered_email", "last_visit"] {
            if let Some(value) = h.storage.get(key).unwrap() {
                fresh.storage.set(key, &value).unwrap();
            }
        }

        assert_eq!(fresh.reconciler.initialize().await.unwrap(), InitOutcome::Restored);
        let view = fresh.reconciler.view();
        assert_eq!(view.entitlement_tier, Some(Tier::Premium));
        assert_eq!(view.display_name.as_deref(), Some("Mina"));
    }

    #[tokio::test]
    async fn test_warmup_failure_does_not_fail_login() {
        let job = Arc::new(FailingWarmup(AtomicUsize::new(0)));
        let h = harness_with(IdleMode::Disabled, vec![job.clone() as Arc<dyn WarmupJob>]);

        assert!(h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .is_ok());
        settle().await;
        assert_eq!(job.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redirect_consumed_by_login() {
        let h = harness();
        h.reconciler.redirects().remember("/money");

        let success = h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        assert_eq!(success.redirect_to.as_deref(), Some("/money"));
        assert!(h.reconciler.redirects().peek().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_forces_logout() {
        let h = harness_with(
            IdleMode::Enabled {
                timeout: Duration::from_secs(60),
                poll_interval: Duration::from_secs(10),
            },
            Vec::new(),
        );
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.reconciler.watchdog_state(), WatchdogState::Armed);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        assert!(!h.reconciler.view().is_authenticated);
        assert!(h.storage.is_empty());
        assert_eq!(h.admission.release_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_discards_late_results() {
        let h = harness();
        h.profiles.set_delay("kid@example.com", Duration::from_millis(20));

        let login = h.reconciler.login("kid@example.com", "s3cret", LoginMode::Standard);
        let stop = async {
            tokio::task::yield_now().await;
            h.reconciler.shutdown();
        };
        let (result, _) = tokio::join!(login, stop);

        assert!(matches!(result, Err(AuthError::Superseded)));
        assert!(h.reconciler.view().is_loading);
        assert!(h.storage.is_empty());
        assert!(h.admission.active_session("kid@example.com").is_none());
        assert_eq!(h.admission.release_count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_overtaken_by_provider_event() {
        let h = harness();
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        h.profiles.set_delay("kid@example.com", Duration::from_millis(20));
        h.profiles.insert_for_provider("g-7", Profile::new("r-7", Tier::Premium).with_nickname("Mina"));

        let init = h.reconciler.initialize();
        let event = async {
            tokio::task::yield_now().await;
            h.identity.complete_sign_in(ProviderSession::new("g-7").with_provider("google"));
        };
        let (outcome, _) = tokio::join!(init, event);

        assert_eq!(outcome.unwrap(), InitOutcome::Restored);
        let view = h.reconciler.view();
        assert!(view.is_authenticated);
        assert_eq!(view.registration_ref.as_deref(), Some("r-7"));
        // The federated record replaced the password session and its slot
        assert!(h.admission.active_session("kid@example.com").is_none());
    }

    #[tokio::test]
    async fn test_guest_login_releases_member_slot() {
        let h = harness();
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        h.reconciler.login("", "", LoginMode::Guest).await.unwrap();
        assert!(h.admission.active_session("kid@example.com").is_none());

        let report = h.reconciler.logout().await;
        assert!(report.released_session.is_none());
        assert_eq!(h.admission.release_count(), 1);

        let tablet = DeviceSession::generate("tablet");
        let decision = h.admission.check("kid@example.com", &tablet).await.unwrap();
        assert!(decision.can_proceed);
    }

    #[tokio::test]
    async fn test_member_switch_releases_previous_slot() {
        let h = harness();
        h.passwords.register("sib@example.com", "pw", "u-2", "m-2", "Noa");

        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        let second = h
            .reconciler
            .login("sib@example.com", "pw", LoginMode::Standard)
            .await
            .unwrap();
        assert!(h.admission.active_session("kid@example.com").is_none());
        assert_eq!(h.admission.active_session("sib@example.com"), second.device_session);

        let report = h.reconciler.logout().await;
        assert!(report.is_clean());
        assert!(h.admission.active_session("sib@example.com").is_none());
        assert_eq!(h.admission.release_count(), 2);
    }

    #[tokio::test]
    async fn test_same_member_relogin_keeps_new_slot() {
        let h = harness();
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        let second = h
            .reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        assert_eq!(h.admission.active_session("kid@example.com"), second.device_session);

        h.reconciler.logout().await;
        assert!(h.admission.active_session("kid@example.com").is_none());
        assert_eq!(h.admission.release_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_upgrade() {
        let h = harness();
        h.profiles.insert_for_email("kid@example.com", Profile::new("r-1", Tier::Basic));
        h.reconciler
            .login("kid@example.com", "s3cret", LoginMode::Standard)
            .await
            .unwrap();
        assert_eq!(h.reconciler.view().entitlement_tier, Some(Tier::Basic));

        h.profiles.insert_for_email("kid@example.com", Profile::new("r-1", Tier::Premium));
        let view = h.reconciler.refresh_entitlement().await.unwrap();
        assert_eq!(view.entitlement_tier, Some(Tier::Premium));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_write_is_throttled() {
        let h = harness();
        h.reconciler.login("", "", LoginMode::Guest).await.unwrap();
        let first = h.storage.get("last_visit").unwrap();

        h.storage.remove("last_visit").unwrap();
        h.reconciler.record_activity(ActivityKind::Pointer);
        assert!(h.storage.get("last_visit").unwrap().is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        h.reconciler.record_activity(ActivityKind::Keyboard);
        assert!(h.storage.get("last_visit").unwrap().is_some());
        assert!(first.is_some());
    }
}
