//! Service configuration
//!
//! Defaults are overlaid with environment variables prefixed `SESSIONS_`,
//! nested with `__`, e.g. `SESSIONS_RECONCILER__INACTIVITY_DAYS=30` or
//! `SESSIONS_SESSION__MAX_CONCURRENT_SESSIONS=3`.

use std::time::Duration;

use anyhow::{Result, bail};
use config::{Config, Environment};
use serde::Deserialize;

use crate::reconciler::Pass;

/// Session admission and store-call settings
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Maximum concurrent ACTIVE sessions per user (default: 5)
    pub max_concurrent_sessions: u32,
    /// Per-call store timeout on request paths, in seconds (default: 5)
    pub store_timeout_secs: u64,
}

impl SessionSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            store_timeout_secs: 5,
        }
    }
}

/// Reconciliation schedules and windows
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Cron expression (with seconds) for the expiry sweep
    pub expiry_schedule: String,
    /// Cron expression for the inactivity sweep
    pub inactivity_schedule: String,
    /// Cron expression for archival
    pub archival_schedule: String,
    /// Cron expression for cross-store synchronization
    pub sync_schedule: String,
    /// ACTIVE rows idle longer than this are ended as INACTIVE
    pub inactivity_days: i64,
    /// Terminal rows older than this (by `ended_at`) are deleted
    pub retention_days: i64,
    /// How far back the synchronization pass looks at `started_at`
    pub sync_window_days: i64,
    /// Per-call store timeout inside passes, in seconds
    pub store_timeout_secs: u64,
    /// Timeout for a full listing of the ephemeral store, in seconds
    pub scan_timeout_secs: u64,
}

impl ReconcilerConfig {
    pub fn inactivity_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.inactivity_days)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn sync_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.sync_window_days)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Cron expression driving `pass`
    pub fn schedule(&self, pass: Pass) -> &str {
        match pass {
            Pass::ExpirySweep => &self.expiry_schedule,
            Pass::InactivitySweep => &self.inactivity_schedule,
            Pass::Archival => &self.archival_schedule,
            Pass::CrossStoreSync => &self.sync_schedule,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            expiry_schedule: "0 0 * * * *".to_string(),     // hourly
            inactivity_schedule: "0 0 2 * * *".to_string(), // daily at 02:00
            archival_schedule: "0 0 3 * * Sun".to_string(), // weekly, Sunday 03:00
            sync_schedule: "0 0 */6 * * *".to_string(),     // every 6 hours
            inactivity_days: 30,
            retention_days: 90,
            sync_window_days: 7,
            store_timeout_secs: 5,
            scan_timeout_secs: 60,
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3002".to_string(),
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    pub session: SessionSettings,
    pub reconciler: ReconcilerConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load defaults overlaid with `SESSIONS_*` environment variables
    pub fn load() -> Result<Self> {
        let defaults = AppConfig::default();
        let session = &defaults.session;
        let reconciler = &defaults.reconciler;

        let settings = Config::builder()
            .set_default(
                "session.max_concurrent_sessions",
                i64::from(session.max_concurrent_sessions),
            )?
            .set_default("session.store_timeout_secs", session.store_timeout_secs as i64)?
            .set_default("reconciler.expiry_schedule", reconciler.expiry_schedule.as_str())?
            .set_default(
                "reconciler.inactivity_schedule",
                reconciler.inactivity_schedule.as_str(),
            )?
            .set_default("reconciler.archival_schedule", reconciler.archival_schedule.as_str())?
            .set_default("reconciler.sync_schedule", reconciler.sync_schedule.as_str())?
            .set_default("reconciler.inactivity_days", reconciler.inactivity_days)?
            .set_default("reconciler.retention_days", reconciler.retention_days)?
            .set_default("reconciler.sync_window_days", reconciler.sync_window_days)?
            .set_default(
                "reconciler.store_timeout_secs",
                reconciler.store_timeout_secs as i64,
            )?
            .set_default("reconciler.scan_timeout_secs", reconciler.scan_timeout_secs as i64)?
            .set_default("server.bind_address", defaults.server.bind_address.as_str())?
            .add_source(
                Environment::with_prefix("SESSIONS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a limit or a window
    pub fn validate(&self) -> Result<()> {
        if self.session.max_concurrent_sessions == 0 {
            bail!("session.max_concurrent_sessions must be at least 1");
        }
        if self.session.store_timeout_secs == 0 || self.reconciler.store_timeout_secs == 0 {
            bail!("store timeouts must be at least 1 second");
        }
        if self.reconciler.scan_timeout_secs < self.reconciler.store_timeout_secs {
            bail!("reconciler.scan_timeout_secs must not be shorter than reconciler.store_timeout_secs");
        }

        let windows = [
            ("reconciler.inactivity_days", self.reconciler.inactivity_days),
            ("reconciler.retention_days", self.reconciler.retention_days),
            ("reconciler.sync_window_days", self.reconciler.sync_window_days),
        ];
        for (name, days) in windows {
            if days <= 0 {
                bail!("{} must be positive, got {}", name, days);
            }
        }

        Ok(())
    }
}
