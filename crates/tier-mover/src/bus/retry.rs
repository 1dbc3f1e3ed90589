//! Unbounded reconnect loop for bus operations.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::error::{Result, TierError};

/// Run `op` until it succeeds or fails permanently.
///
/// Transient failures are retried every `delay` with no attempt cap. One
/// `BusConnectionLost` alert is raised per outage and one
/// `BusConnectionRestored` when the operation succeeds again. Cancellation
/// is only observed while waiting between attempts.
pub async fn with_reconnect<T, F, Fut>(
    what: &str,
    delay: Duration,
    alerts: &dyn AlertSink,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut outage: Option<(Instant, u32)> = None;

    loop {
        match op().await {
            Ok(value) => {
                if let Some((since, attempts)) = outage {
                    let down = since.elapsed();
                    info!("{} recovered after {} attempts ({:?})", what, attempts, down);
                    alerts
                        .raise(
                            Alert::new(
                                AlertKind::BusConnectionRestored,
                                format!("{} succeeded again", what),
                            )
                            .with("attempts", attempts)
                            .with("outage_ms", down.as_millis()),
                        )
                        .await;
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() => {
                match outage.as_mut() {
                    None => {
                        alerts
                            .raise(
                                Alert::new(
                                    AlertKind::BusConnectionLost,
                                    format!("{} failed: {}", what, e),
                                )
                                .with("retry_delay_ms", delay.as_millis()),
                            )
                            .await;
                        outage = Some((Instant::now(), 1));
                    }
                    Some((_, attempts)) => {
                        *attempts += 1;
                        debug!("{} still failing (attempt {}): {}", what, attempts, e);
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return Err(TierError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_one_alert_per_outage() {
        let alerts = RecordingAlertSink::new();
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let value = with_reconnect("publish", Duration::from_millis(1), &alerts, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 4 {
                    Err(TierError::bus("connection refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 4);
        assert_eq!(alerts.count(AlertKind::BusConnectionLost), 1);
        assert_eq!(alerts.count(AlertKind::BusConnectionRestored), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_returns_immediately() {
        let alerts = RecordingAlertSink::new();
        let cancel = CancellationToken::new();
        let result: Result<()> =
            with_reconnect("ack", Duration::from_millis(1), &alerts, &cancel, || async {
                Err(TierError::UnknownTable("Foo".into()))
            })
            .await;
        assert!(matches!(result, Err(TierError::UnknownTable(_))));
        assert!(alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_outage() {
        let alerts = RecordingAlertSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> =
            with_reconnect("consume", Duration::from_secs(60), &alerts, &cancel, || async {
                Err(TierError::bus("down"))
            })
            .await;
        assert!(matches!(result, Err(TierError::Cancelled)));
        assert_eq!(alerts.count(AlertKind::BusConnectionLost), 1);
    }

    #[tokio::test]
    async fn test_success_without_outage_raises_nothing() {
        let alerts = RecordingAlertSink::new();
        let cancel = CancellationToken::new();
        let v = with_reconnect("declare", Duration::from_millis(1), &alerts, &cancel, || async {
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(v, 7);
        assert!(alerts.alerts().is_empty());
    }
}
