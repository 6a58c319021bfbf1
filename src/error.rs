// Error taxonomy for the session subsystem
// Every failure a caller can observe maps onto one of four handling classes

use thiserror::Error;

/// How a failure is surfaced to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient notice, the form stays interactive
    UserRecoverable,

    /// Authentication proceeds with the most restrictive tier
    Degraded,

    /// Logged at most, never blocks the primary action
    SilentBestEffort,

    /// The whole flow is reported as failed
    FatalToFlow,
}

/// Failure reported by a remote collaborator (identity provider, RPCs, realtime channel)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote rejected request: {0}")]
    Rejected(String),

    #[error("malformed remote response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Only connectivity failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// Local session store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored value is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors returned by Reconciler operations
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("another device holds the active session: {reason}")]
    AdmissionDenied { reason: String },

    #[error("device slot could not be secured: {0}")]
    AdmissionConfirmFailed(#[source] RemoteError),

    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(#[source] RemoteError),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("a login attempt is already in progress")]
    LoginInFlight,

    #[error("result superseded by a newer attempt")]
    Superseded,

    #[error("local session store error: {0}")]
    Storage(#[from] StoreError),

    #[error("identity provider error: {0}")]
    Provider(#[source] RemoteError),
}

impl AuthError {
    /// Handling class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            AuthError::InvalidCredentials
            | AuthError::AdmissionDenied { .. }
            | AuthError::NetworkUnavailable(_)
            | AuthError::LoginInFlight
            | AuthError::Provider(_) => ErrorClass::UserRecoverable,
            AuthError::ProfileFetchFailed(_) => ErrorClass::Degraded,
            AuthError::Superseded => ErrorClass::SilentBestEffort,
            AuthError::AdmissionConfirmFailed(_) | AuthError::Storage(_) => ErrorClass::FatalToFlow,
        }
    }

    /// Message shown in a transient notice, if the user should see one
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            AuthError::InvalidCredentials => Some("Incorrect email or password."),
            AuthError::AdmissionDenied { .. } => Some(
                "This account is already in use on another device. \
                 Log out there first, or sign in here to take over.",
            ),
            AuthError::AdmissionConfirmFailed(_) | AuthError::Storage(_) => {
                Some("Login failed. Please try again.")
            }
            AuthError::NetworkUnavailable(_) => {
                Some("Cannot reach the server. Check your connection.")
            }
            AuthError::LoginInFlight => Some("Login already in progress."),
            AuthError::Provider(_) => Some("Sign-in service error. Please try again."),
            AuthError::ProfileFetchFailed(_) | AuthError::Superseded => None,
        }
    }
}

impl From<RemoteError> for AuthError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unavailable(msg) => AuthError::NetworkUnavailable(msg),
            other => AuthError::Provider(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(AuthError::InvalidCredentials.class(), ErrorClass::UserRecoverable);
        assert_eq!(
            AuthError::AdmissionDenied { reason: "busy".into() }.class(),
            ErrorClass::UserRecoverable
        );
        assert_eq!(
            AuthError::ProfileFetchFailed(RemoteError::Unavailable("down".into())).class(),
            ErrorClass::Degraded
        );
        assert_eq!(
            AuthError::AdmissionConfirmFailed(RemoteError::Rejected("slot".into())).class(),
            ErrorClass::FatalToFlow
        );
        assert_eq!(AuthError::Superseded.class(), ErrorClass::SilentBestEffort);
    }

    #[test]
    fn test_remote_unavailable_maps_to_network() {
        let err: AuthError = RemoteError::Unavailable("timeout".into()).into();
        assert!(matches!(err, AuthError::NetworkUnavailable(_)));

        let err: AuthError = RemoteError::Rejected("bad request".into()).into();
        assert!(matches!(err, AuthError::Provider(_)));
    }

    #[test]
    fn test_degraded_errors_have_no_notice() {
        let err = AuthError::ProfileFetchFailed(RemoteError::Malformed("tier".into()));
        assert!(err.notice().is_none());
        assert!(AuthError::InvalidCredentials.notice().is_some());
    }
}
