//! Application state shared across handlers

use crate::reconciler::Reconciler;
use crate::session::SessionManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub session_manager: SessionManager,
    pub reconciler: Reconciler,
}
