//! Durable session metadata, authoritative for history and audit

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::DeviceInfo;
use crate::error::SessionError;

/// Lifecycle status of a metadata row
///
/// Every status other than `Active` is terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    /// Actively expired by the expiry sweep
    Expired,
    /// No activity inside the inactivity window
    Inactive,
    /// Found already missing from the ephemeral store
    ExpiredInRedis,
    /// Explicitly terminated (logout, security event, device revocation)
    Revoked,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 5] = [
        SessionStatus::Active,
        SessionStatus::Expired,
        SessionStatus::Inactive,
        SessionStatus::ExpiredInRedis,
        SessionStatus::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Inactive => "INACTIVE",
            SessionStatus::ExpiredInRedis => "EXPIRED_IN_REDIS",
            SessionStatus::Revoked => "REVOKED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SessionError::Serialization(format!("unknown session status: {}", s)))
    }
}

/// Why a session was ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    Expired,
    Inactive,
    ExpiredInRedis,
    UserLogout,
    SecurityEvent,
    DeviceRevoked,
    /// The ephemeral write failed after the durable row was created
    AdmissionFailed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Expired => "EXPIRED",
            EndReason::Inactive => "INACTIVE",
            EndReason::ExpiredInRedis => "EXPIRED_IN_REDIS",
            EndReason::UserLogout => "USER_LOGOUT",
            EndReason::SecurityEvent => "SECURITY_EVENT",
            EndReason::DeviceRevoked => "DEVICE_REVOKED",
            EndReason::AdmissionFailed => "ADMISSION_FAILED",
        }
    }

    /// The terminal status this reason writes
    pub fn terminal_status(&self) -> SessionStatus {
        match self {
            EndReason::Expired => SessionStatus::Expired,
            EndReason::Inactive => SessionStatus::Inactive,
            EndReason::ExpiredInRedis => SessionStatus::ExpiredInRedis,
            EndReason::UserLogout
            | EndReason::SecurityEvent
            | EndReason::DeviceRevoked
            | EndReason::AdmissionFailed => SessionStatus::Revoked,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking a record store to end a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row moved from ACTIVE to a terminal status
    Ended,
    /// The row was already terminal; nothing was written
    AlreadyTerminal,
    /// No row with that session id
    Missing,
}

/// Durable metadata row for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub device: DeviceInfo,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl SessionMetadata {
    /// A fresh ACTIVE row started at `now`
    pub fn new_active(
        session_id: String,
        user_id: Uuid,
        device: DeviceInfo,
        ip_address: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            device,
            ip_address,
            user_agent,
            started_at: now,
            last_activity_at: now,
            status: SessionStatus::Active,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Apply the terminal transition in place
    ///
    /// Terminal rows are left untouched, so repeated calls are no-ops.
    pub fn end(&mut self, reason: EndReason, at: DateTime<Utc>) -> Transition {
        if self.status.is_terminal() {
            return Transition::AlreadyTerminal;
        }

        self.status = reason.terminal_status();
        self.ended_at = Some(at);
        self.end_reason = Some(reason.as_str().to_string());
        Transition::Ended
    }

    /// Record activity; ignored once the row is terminal
    pub fn touch(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active() || at <= self.last_activity_at {
            return false;
        }
        self.last_activity_at = at;
        true
    }
}

/// Closed time window `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SessionWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SessionError> {
        if start > end {
            return Err(SessionError::InvalidInput(format!(
                "window start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn active_row(now: DateTime<Utc>) -> SessionMetadata {
        SessionMetadata::new_active(
            "s-1".to_string(),
            Uuid::new_v4(),
            DeviceInfo::default(),
            None,
            None,
            now,
        )
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in SessionStatus::ALL {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("DELETED".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_only_active_is_non_terminal() {
        let terminal: Vec<_> = SessionStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![SessionStatus::Active]);
    }

    #[test]
    fn test_reasons_map_to_their_status() {
        assert_eq!(EndReason::Expired.terminal_status(), SessionStatus::Expired);
        assert_eq!(EndReason::Inactive.terminal_status(), SessionStatus::Inactive);
        assert_eq!(
            EndReason::ExpiredInRedis.terminal_status(),
            SessionStatus::ExpiredInRedis
        );
        assert_eq!(EndReason::UserLogout.terminal_status(), SessionStatus::Revoked);
        assert_eq!(
            EndReason::AdmissionFailed.terminal_status(),
            SessionStatus::Revoked
        );
    }

    #[test]
    fn test_end_is_sticky() {
        let now = Utc::now();
        let mut row = active_row(now);

        assert_eq!(row.end(EndReason::Expired, now), Transition::Ended);
        assert_eq!(row.status, SessionStatus::Expired);
        assert_eq!(row.ended_at, Some(now));
        assert_eq!(row.end_reason.as_deref(), Some("EXPIRED"));

        let later = now + Duration::hours(1);
        assert_eq!(row.end(EndReason::Inactive, later), Transition::AlreadyTerminal);
        assert_eq!(row.status, SessionStatus::Expired);
        assert_eq!(row.ended_at, Some(now));
    }

    #[test]
    fn test_touch_ignores_terminal_rows_and_stale_instants() {
        let now = Utc::now();
        let mut row = active_row(now);

        assert!(!row.touch(now - Duration::minutes(1)));
        assert!(row.touch(now + Duration::minutes(1)));

        row.end(EndReason::UserLogout, now + Duration::minutes(2));
        assert!(!row.touch(now + Duration::minutes(3)));
        assert_eq!(row.last_activity_at, now + Duration::minutes(1));
    }

    #[test]
    fn test_window_rejects_inverted_bounds() {
        let now = Utc::now();
        assert!(SessionWindow::new(now, now - Duration::seconds(1)).is_err());

        let window = SessionWindow::new(now - Duration::days(7), now).unwrap();
        assert!(window.contains(now));
        assert!(window.contains(now - Duration::days(7)));
        assert!(!window.contains(now + Duration::seconds(1)));
    }
}
