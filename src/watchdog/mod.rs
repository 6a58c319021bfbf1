// Inactivity Watchdog Module
// Idle countdown plus a backup poll; the one-shot absence check lives in `absence`

pub mod absence;

use crate::config::WatchdogConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Idle-timeout behaviour, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleMode {
    /// No timer and no poll are ever armed
    Disabled,

    /// Countdown of `timeout`, backed by a poll every `poll_interval`
    Enabled {
        timeout: Duration,
        poll_interval: Duration,
    },
}

impl IdleMode {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        if config.idle_timeout_enabled {
            IdleMode::Enabled {
                timeout: config.idle_timeout(),
                poll_interval: config.poll_interval(),
            }
        } else {
            IdleMode::Disabled
        }
    }
}

/// Watchdog lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Stopped,
    Armed,
}

/// Qualifying user interactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Pointer,
    Keyboard,
    Scroll,
    Touch,
}

/// Which mechanism noticed the timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Countdown,
    Poll,
}

struct ArmedWatch {
    cancel: CancellationToken,
    generation: u64,
}

/// Inactivity watchdog owned by the Reconciler
///
/// `Stopped -> Armed` on `start`, back to `Stopped` on `stop` or when the
/// timeout fires. Re-starting an armed watchdog replaces the running watch.
pub struct InactivityWatchdog {
    mode: IdleMode,

    /// Rolling last-activity timestamp
    last_activity: Arc<Mutex<Instant>>,

    /// Wakes the watch loop so the countdown restarts
    activity: Arc<Notify>,

    armed: Mutex<Option<ArmedWatch>>,

    generation: AtomicU64,

    timeouts_fired: Arc<AtomicU64>,
}

impl InactivityWatchdog {
    pub fn new(mode: IdleMode) -> Self {
        Self {
            mode,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            activity: Arc::new(Notify::new()),
            armed: Mutex::new(None),
            generation: AtomicU64::new(0),
            timeouts_fired: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mode(&self) -> IdleMode {
        self.mode
    }

    /// Arm the watchdog; `on_timeout` runs at most once
    pub fn start<F>(&self, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let IdleMode::Enabled { timeout, poll_interval } = self.mode else {
            debug!("Idle timeout disabled - watchdog not armed");
            return;
        };

        let mut armed = self.armed.lock();
        if let Some(previous) = armed.take() {
            debug!(generation = previous.generation, "Re-arming watchdog, dropping previous watch");
            previous.cancel.cancel();
        }

        *self.last_activity.lock() = Instant::now();

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();

        tokio::spawn(watch_loop(
            timeout,
            poll_interval,
            self.last_activity.clone(),
            self.activity.clone(),
            cancel.clone(),
            self.timeouts_fired.clone(),
            generation,
            on_timeout,
        ));

        *armed = Some(ArmedWatch { cancel, generation });

        info!(
            generation = generation,
            timeout_secs = timeout.as_secs(),
            poll_secs = poll_interval.as_secs(),
            "Inactivity watchdog armed"
        );
    }

    /// Disarm; a no-op when already stopped
    pub fn stop(&self) {
        match self.armed.lock().take() {
            Some(watch) => {
                watch.cancel.cancel();
                info!(generation = watch.generation, "Inactivity watchdog stopped");
            }
            None => debug!("Watchdog already stopped"),
        }
    }

    /// Record a user interaction; harmless when the watchdog is stopped or disabled
    pub fn record_activity(&self, kind: ActivityKind) {
        *self.last_activity.lock() = Instant::now();
        self.activity.notify_one();
        trace!(?kind, "User activity recorded");
    }

    pub fn state(&self) -> WatchdogState {
        match self.armed.lock().as_ref() {
            Some(watch) if !watch.cancel.is_cancelled() => WatchdogState::Armed,
            _ => WatchdogState::Stopped,
        }
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn timeouts_fired(&self) -> u64 {
        self.timeouts_fired.load(Ordering::Relaxed)
    }
}

impl Drop for InactivityWatchdog {
    fn drop(&mut self) {
        if let Some(watch) = self.armed.get_mut().take() {
            watch.cancel.cancel();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_loop<F>(
    timeout: Duration,
    poll_interval: Duration,
    last_activity: Arc<Mutex<Instant>>,
    activity: Arc<Notify>,
    cancel: CancellationToken,
    timeouts_fired: Arc<AtomicU64>,
    generation: u64,
    on_timeout: F,
) where
    F: FnOnce() + Send + 'static,
{
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    poll.tick().await;

    let idle = |last: &Mutex<Instant>| last.lock().elapsed();

    let trigger = loop {
        let deadline = *last_activity.lock() + timeout;

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = activity.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {
                if idle(&last_activity) >= timeout {
                    break Trigger::Countdown;
                }
            }
            _ = poll.tick() => {
                if idle(&last_activity) >= timeout {
                    break Trigger::Poll;
                }
            }
        }
    };

    // Stopped before the callback runs, so the callback may restart the watchdog
    cancel.cancel();
    timeouts_fired.fetch_add(1, Ordering::Relaxed);
    warn!(
        generation = generation,
        trigger = ?trigger,
        idle_secs = idle(&last_activity).as_secs(),
        "Inactivity timeout reached - forcing logout"
    );
    on_timeout();
}
