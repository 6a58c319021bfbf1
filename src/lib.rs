// Session Gate - identity, session and access-control reconciliation
// Library entry point; the UI layer consumes `SessionSubsystem`

// Leaf modules
pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod store;

// Remote contracts
pub mod admission;
pub mod backend;
pub mod presence;

// Background and decision components
pub mod watchdog;
pub mod reconciler;
pub mod gate;
pub mod subsystem;

pub use config::SessionConfig;
pub use error::{AuthError, ErrorClass, RemoteError, StoreError};
pub use gate::{AccessGate, AccessPolicyTable, GateDecision, RedirectMemory};
pub use model::{AuthView, DeviceSession, EntitlementSnapshot, Profile, SessionRecord, Tier};
pub use reconciler::{
    AuthStateReconciler, Collaborators, ForcedLogoutReason, InitOutcome, LoginMode, LoginSuccess,
    LogoutReport, ReconcilerSettings, UiEvent,
};
pub use subsystem::SessionSubsystem;
pub use watchdog::{ActivityKind, IdleMode, InactivityWatchdog};
