//! Ephemeral session entry, authoritative for "is this session valid now"

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::SessionMetadata;

/// Device the session was opened from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// IOS, ANDROID or WEB
    pub device_type: Option<String>,
    pub device_id: Option<String>,
    pub app_version: Option<String>,
}

/// Session entry held in the ephemeral store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub device: DeviceInfo,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    /// The entry must be treated as gone at or after this instant
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the entry is past its absolute expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Remaining lifetime at `now`, `None` once expired
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = self.expires_at - now;
        (remaining > Duration::zero()).then_some(remaining)
    }
}

/// Session creation payload handed over by the authentication flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub session_id: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub device: DeviceInfo,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewSession {
    /// Split the payload into the entry for each store, both stamped `now`
    pub fn into_parts(self, now: DateTime<Utc>) -> (Session, SessionMetadata) {
        let metadata = SessionMetadata::new_active(
            self.session_id.clone(),
            self.user_id,
            self.device.clone(),
            self.ip_address,
            self.user_agent,
            now,
        );

        let session = Session {
            session_id: self.session_id,
            user_id: self.user_id,
            device: self.device,
            permissions: self.permissions,
            created_at: now,
            last_access_at: now,
            expires_at: self.expires_at,
        };

        (session, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;

    fn new_session(expires_in: Duration) -> (NewSession, DateTime<Utc>) {
        let now = Utc::now();
        let payload = NewSession {
            session_id: "s-1".to_string(),
            user_id: Uuid::new_v4(),
            device: DeviceInfo {
                device_type: Some("ANDROID".to_string()),
                device_id: Some("pixel-8".to_string()),
                app_version: Some("2.4.0".to_string()),
            },
            permissions: vec!["ride:request".to_string()],
            expires_at: now + expires_in,
            ip_address: Some("10.0.0.7".to_string()),
            user_agent: None,
        };
        (payload, now)
    }

    #[test]
    fn test_into_parts_shares_identity_and_device() {
        let (payload, now) = new_session(Duration::hours(1));
        let user_id = payload.user_id;

        let (session, metadata) = payload.into_parts(now);

        assert_eq!(session.session_id, metadata.session_id);
        assert_eq!(session.user_id, user_id);
        assert_eq!(metadata.user_id, user_id);
        assert_eq!(session.device, metadata.device);
        assert_eq!(metadata.status, SessionStatus::Active);
        assert_eq!(metadata.started_at, now);
        assert_eq!(metadata.last_activity_at, now);
        assert_eq!(metadata.ip_address.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let (payload, now) = new_session(Duration::hours(1));
        let (session, _) = payload.into_parts(now);

        assert!(!session.is_expired_at(now));
        assert!(session.is_expired_at(session.expires_at));
        assert_eq!(session.remaining_ttl(session.expires_at), None);
        assert_eq!(session.remaining_ttl(now), Some(Duration::hours(1)));
    }

    #[test]
    fn test_session_json_tolerates_missing_optional_fields() {
        let json = serde_json::json!({
            "session_id": "s-2",
            "user_id": Uuid::nil(),
            "created_at": "2026-01-01T00:00:00Z",
            "last_access_at": "2026-01-01T00:00:00Z",
            "expires_at": "2026-01-01T01:00:00Z",
        });

        let session: Session = serde_json::from_value(json).unwrap();
        assert_eq!(session.device, DeviceInfo::default());
        assert!(session.permissions.is_empty());
    }
}
