//! Background cleanup: prune expired nonces and idle rate-limit buckets.

use crate::error::RelayError;
use crate::rate_limit::RateLimiter;
use crate::storage::RelayStorage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub fn spawn_cleanup_task(
    storage: RelayStorage,
    rate_limiter: RateLimiter,
    interval: Duration,
    nonce_retention_secs: i64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = run_cleanup(&storage, nonce_retention_secs) {
                tracing::error!("Cleanup error: {}", e);
            }
            let pruned = rate_limiter.prune_idle();
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned idle rate-limit buckets");
            }
        }
        tracing::debug!("Cleanup task stopped");
    })
}

fn run_cleanup(storage: &RelayStorage, nonce_retention_secs: i64) -> Result<usize, RelayError> {
    let now = chrono::Utc::now().timestamp();
    let pruned = storage.prune_nonces(now - nonce_retention_secs)?;

    tracing::debug!(pruned, "Cleanup completed");
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_old_nonces_are_pruned() {
        let storage = RelayStorage::in_memory().unwrap();
        let device = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();

        storage.record_nonce("stale", device, now - 3600).unwrap();
        storage.record_nonce("fresh", device, now).unwrap();

        assert_eq!(run_cleanup(&storage, 600).unwrap(), 1);
        assert!(!storage.record_nonce("fresh", device, now).unwrap());
        assert!(storage.record_nonce("stale", device, now).unwrap());
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = spawn_cleanup_task(
            RelayStorage::in_memory().unwrap(),
            RateLimiter::new(60),
            Duration::from_secs(3600),
            600,
            shutdown.clone(),
        );

        shutdown.cancel();
        time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cleanup task did not stop")
            .unwrap();
    }
}
