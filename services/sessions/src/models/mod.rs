//! Session lifecycle models

pub mod metadata;
pub mod session;

// Re-export for convenience
pub use metadata::{EndReason, SessionMetadata, SessionStatus, SessionWindow, Transition};
pub use session::{DeviceInfo, NewSession, Session};
