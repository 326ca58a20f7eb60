//! Store adapters for the two independently failing session stores
//!
//! The ephemeral store answers "is this session valid now"; the record store
//! holds the durable lifecycle history. The two share only the session id.

pub mod ephemeral;
pub mod memory;
pub mod record;

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{SessionError, SessionResult};

pub use ephemeral::{EphemeralSessionStore, RedisSessionStore};
pub use memory::{MemoryEphemeralStore, MemoryRecordStore};
pub use record::{PgSessionRecordStore, SessionRecordStore};

/// Bound a store call; a timeout surfaces as `StoreUnavailable`
pub async fn with_timeout<T, F>(limit: Duration, operation: &'static str, call: F) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(elapsed) => {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "Store call timed out");
            Err(SessionError::from(elapsed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_results_through() {
        let ok = with_timeout(Duration::from_secs(1), "noop", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: SessionResult<()> = with_timeout(Duration::from_secs(1), "noop", async {
            Err(SessionError::NotFound("s".to_string()))
        })
        .await;
        assert!(err.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_with_timeout_reports_store_unavailable() {
        let result: SessionResult<()> = with_timeout(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(SessionError::StoreUnavailable(_))));
    }
}
