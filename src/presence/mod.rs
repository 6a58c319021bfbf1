// Presence Broadcaster
// Periodic liveness heartbeats on a shared realtime topic; exports state, never changes it

pub mod hub;

pub use hub::{InMemoryPresenceHub, PresenceRecord, RealtimeChannel};

use crate::config::PresenceConfig;
use crate::model::AuthView;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ActiveBroadcast {
    identity_ref: String,
    display_name: watch::Sender<String>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One heartbeat loop per authenticated identity
pub struct PresenceBroadcaster {
    channel: Arc<dyn RealtimeChannel>,
    topic: String,
    status: String,
    heartbeat: Duration,
    active: Mutex<Option<ActiveBroadcast>>,
}

impl PresenceBroadcaster {
    pub fn new(channel: Arc<dyn RealtimeChannel>, config: &PresenceConfig) -> Self {
        Self {
            channel,
            topic: config.topic.clone(),
            status: config.status.clone(),
            heartbeat: config.heartbeat_interval(),
            active: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Begin heartbeating for `identity_ref`
    ///
    /// For the identity already being broadcast only a changed display name is
    /// passed on to the running loop.
    pub fn start(&self, identity_ref: &str, display_name: &str) {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            if current.identity_ref == identity_ref && !current.handle.is_finished() {
                current.display_name.send_if_modified(|name| {
                    if *name == display_name {
                        return false;
                    }
                    *name = display_name.to_string();
                    true
                });
                return;
            }
        }
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let (names, names_rx) = watch::channel(display_name.to_string());
        let record = PresenceRecord {
            identity_ref: identity_ref.to_string(),
            display_name: display_name.to_string(),
            status: self.status.clone(),
            timestamp: Utc::now(),
        };
        let handle = tokio::spawn(heartbeat_loop(
            self.channel.clone(),
            self.topic.clone(),
            record,
            names_rx,
            self.heartbeat,
            cancel.clone(),
        ));

        info!(identity = identity_ref, topic = %self.topic, "Presence broadcasting started");
        *active = Some(ActiveBroadcast {
            identity_ref: identity_ref.to_string(),
            display_name: names,
            cancel,
            handle,
        });
    }

    /// Tear down the subscription and the heartbeat; safe when idle
    pub fn stop(&self) {
        if let Some(active) = self.active.lock().take() {
            active.cancel.cancel();
            info!(identity = %active.identity_ref, "Presence broadcasting stopped");
        }
    }

    pub fn is_broadcasting(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished() && !a.cancel.is_cancelled())
    }

    pub fn broadcast_identity(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.identity_ref.clone())
    }

    /// Follow an auth view: authenticated identities broadcast, everything else stops
    pub fn apply(&self, view: &AuthView) {
        if view.is_loading {
            return;
        }
        match (view.is_authenticated, view.identity_ref.as_deref()) {
            (true, Some(identity)) => {
                let name = view.display_name.as_deref().unwrap_or(identity);
                self.start(identity, name);
            }
            _ => self.stop(),
        }
    }

    /// Track `views` until its sender goes away
    pub fn follow(self: Arc<Self>, mut views: watch::Receiver<AuthView>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let current = views.borrow_and_update().clone();
            self.apply(&current);
            while views.changed().await.is_ok() {
                let view = views.borrow_and_update().clone();
                self.apply(&view);
            }
            debug!("Auth view closed, presence follower exiting");
            self.stop();
        })
    }
}

impl Drop for PresenceBroadcaster {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

async fn heartbeat_loop(
    channel: Arc<dyn RealtimeChannel>,
    topic: String,
    mut record: PresenceRecord,
    mut names: watch::Receiver<String>,
    heartbeat: Duration,
    cancel: CancellationToken,
) {
    let subscribed = tokio::select! {
        _ = cancel.cancelled() => return,
        result = channel.subscribe(&topic) => result,
    };
    if let Err(e) = subscribed {
        warn!(error = %e, topic = %topic, "Presence subscription failed");
        return;
    }

    // First tick completes immediately and carries the initial publish
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = names.changed() => {
                if changed.is_err() {
                    break;
                }
                record.display_name = names.borrow_and_update().clone();
                record.timestamp = Utc::now();
                if let Err(e) = channel.publish(&topic, &record).await {
                    debug!(error = %e, "Presence rename not published");
                }
            }
            _ = ticker.tick() => {
                record.timestamp = Utc::now();
                if let Err(e) = channel.publish(&topic, &record).await {
                    debug!(error = %e, "Presence heartbeat missed");
                }
            }
        }
    }

    if let Err(e) = channel.unsubscribe(&topic, &record.identity_ref).await {
        debug!(error = %e, "Presence unsubscribe failed, record will expire");
    }
}
