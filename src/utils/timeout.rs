//! Timeout defaults and helpers shared by transports, pools and the bridge.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

/// Default timeout for connect and send operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a worker may block waiting for a socket to become readable
pub const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause between two full registry scans of a polling worker
pub const SCAN_INTERVAL: Duration = Duration::from_millis(5);

/// Upper bound for joining workers when a component stops
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for bridge requests
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the bridge's pending-request sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Run a future with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Join a set of worker tasks, giving them `limit` in total to finish.
///
/// Tasks still running when the budget is spent are logged as leaked and
/// aborted. Returns the number of leaked tasks.
pub async fn join_all_with_timeout(
    component: &'static str,
    handles: Vec<JoinHandle<()>>,
    limit: Duration,
) -> usize {
    let deadline = tokio::time::Instant::now() + limit;
    let mut leaked = 0;

    for (index, mut handle) in handles.into_iter().enumerate() {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => debug!(component, worker = index, "Worker joined"),
            Ok(Err(e)) if e.is_cancelled() => debug!(component, worker = index, "Worker cancelled"),
            Ok(Err(e)) => warn!(component, worker = index, error = %e, "Worker terminated abnormally"),
            Err(_) => {
                leaked += 1;
                warn!(
                    component,
                    worker = index,
                    timeout_ms = limit.as_millis() as u64,
                    "Worker did not stop within shutdown timeout; leaking it"
                );
                handle.abort();
            }
        }
    }

    leaked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_error_expires() {
        let result = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_join_reports_leaked_workers() {
        let quick = tokio::spawn(async {});
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let leaked =
            join_all_with_timeout("test", vec![quick, stuck], Duration::from_millis(50)).await;
        assert_eq!(leaked, 1);
    }
}
