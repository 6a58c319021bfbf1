// Session data structures persisted on the client
// The session record and the per-login device session descriptor

use serde::{Deserialize, Serialize};

/// Locally persisted session record
///
/// Replaced whole on every login and deleted on logout; never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Whether the visitor is logged in
    pub logged_in: bool,

    /// Name shown in the UI
    pub display_name: String,

    /// Guest sessions have no identity and no device slot
    #[serde(default)]
    pub is_guest_mode: bool,

    /// User reference returned by the password RPC or the provider user id
    #[serde(default)]
    pub identity_ref: Option<String>,

    /// Member reference returned by the password RPC
    #[serde(default)]
    pub member_ref: Option<String>,

    /// Whether the session came from a federated (OAuth) login
    #[serde(default)]
    pub is_federated_login: bool,
}

impl SessionRecord {
    /// Record written after a successful password login
    pub fn password(
        display_name: impl Into<String>,
        identity_ref: Option<String>,
        member_ref: Option<String>,
    ) -> Self {
        Self {
            logged_in: true,
            display_name: display_name.into(),
            is_guest_mode: false,
            identity_ref,
            member_ref,
            is_federated_login: false,
        }
    }

    /// Record written for a guest login
    pub fn guest(display_name: impl Into<String>) -> Self {
        Self {
            logged_in: true,
            display_name: display_name.into(),
            is_guest_mode: true,
            identity_ref: None,
            member_ref: None,
            is_federated_login: false,
        }
    }

    /// Record written as a side effect of a federated provider session
    pub fn federated(display_name: impl Into<String>, provider_user_id: impl Into<String>) -> Self {
        Self {
            logged_in: true,
            display_name: display_name.into(),
            is_guest_mode: false,
            identity_ref: Some(provider_user_id.into()),
            member_ref: None,
            is_federated_login: true,
        }
    }

    /// Logged in and not a guest
    pub fn is_member_session(&self) -> bool {
        self.logged_in && !self.is_guest_mode
    }
}

/// Device session descriptor sent to the admission service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    /// Random id, fresh for every login attempt
    pub session_id: String,

    /// Stable identifier of this device/browser
    pub device_fingerprint: String,
}

impl DeviceSession {
    /// Generate a descriptor for a new login attempt
    pub fn generate(device_fingerprint: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            device_fingerprint: device_fingerprint.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_camel_case() {
        let record = SessionRecord::password("Mina", Some("u-1".into()), Some("m-9".into()));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["loggedIn"], true);
        assert_eq!(json["displayName"], "Mina");
        assert_eq!(json["identityRef"], "u-1");
        assert_eq!(json["memberRef"], "m-9");
        assert_eq!(json["isFederatedLogin"], false);
    }

    #[test]
    fn test_record_tolerates_missing_optional_fields() {
        let record: SessionRecord =
            serde_json::from_str(r#"{"loggedIn":true,"displayName":"Old"}"#).unwrap();
        assert!(record.logged_in);
        assert!(!record.is_guest_mode);
        assert!(record.identity_ref.is_none());
    }

    #[test]
    fn test_guest_record() {
        let record = SessionRecord::guest("Guest");
        assert!(record.logged_in);
        assert!(record.is_guest_mode);
        assert!(record.identity_ref.is_none());
        assert!(!record.is_member_session());
    }

    #[test]
    fn test_device_sessions_are_unique() {
        let a = DeviceSession::generate("laptop");
        let b = DeviceSession::generate("laptop");
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.device_fingerprint, b.device_fingerprint);
    }
}
