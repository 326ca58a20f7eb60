//! Session lifecycle core for the ride-sharing backend
//!
//! Sessions live in two stores that fail independently: a TTL-expiring
//! ephemeral store answers "is this session valid now", and a relational
//! record store keeps the lifecycle history used for auditing and for
//! per-user concurrency limits. The [`reconciler`] repairs divergence
//! between them on fixed schedules.

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod models;
pub mod reconciler;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;

pub use error::{SessionError, SessionResult};
pub use reconciler::{Pass, PassOutcome, PassReport, Reconciler};
pub use session::SessionManager;
