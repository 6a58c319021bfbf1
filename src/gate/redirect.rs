// Post-login redirect memory
// The gate remembers where an anonymous visitor was bounced from; login consumes it

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Single-slot, shared between the gate and the Reconciler
#[derive(Debug, Clone)]
pub struct RedirectMemory {
    slot: Arc<Mutex<Option<String>>>,
    login_path: String,
}

impl RedirectMemory {
    pub fn new(login_path: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            login_path: login_path.into(),
        }
    }

    /// Remember `path`, unless it is the login surface itself
    pub fn remember(&self, path: &str) {
        let bare = path.split(['?', '#']).next().unwrap_or(path);
        if bare == self.login_path {
            return;
        }
        debug!(path = path, "Remembering path for post-login redirect");
        *self.slot.lock() = Some(path.to_string());
    }

    pub fn take(&self) -> Option<String> {
        self.slot.lock().take()
    }

    pub fn peek(&self) -> Option<String> {
        self.slot.lock().clone()
    }
}
