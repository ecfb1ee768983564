//! Connection supervision: detects connection loss, flips the reconnection
//! gate, redials with capped exponential backoff, and re-establishes the
//! reply dispatcher and subscriptions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::events::ErrorEvent;
use crate::gate::GateState;
use crate::transport::AmqpTransport;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

fn reconnect_delay(attempts: usize) -> Duration {
    Duration::from_secs(std::cmp::min(
        MAX_RECONNECT_DELAY.as_secs(),
        2u64.saturating_pow(attempts as u32),
    ))
}

/// Spawns the supervisor task. It runs until transport shutdown, holding the
/// gate shut while a reconnect is in progress.
pub(crate) fn spawn(
    transport: Arc<AmqpTransport>,
    mut conn_errors: mpsc::UnboundedReceiver<String>,
) {
    tokio::spawn(async move {
        let mut shutdown = transport.shutdown_receiver();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                error = conn_errors.recv() => {
                    let Some(error) = error else { break };
                    warn!(error = %error, "AMQP connection lost, reconnecting");
                    transport.emit(ErrorEvent::ConnectionLost { error });
                    transport.gate.set(GateState::Reconnecting);
                    if !reconnect(&transport, &mut shutdown).await {
                        break;
                    }
                    transport.gate.set(GateState::Open);
                    // Notifications queued by the dead connection are stale.
                    while conn_errors.try_recv().is_ok() {}
                }
            }
        }
    });
}

/// Redials until the connection is re-established or shutdown begins.
/// Returns `false` when interrupted by shutdown.
async fn reconnect(transport: &AmqpTransport, shutdown: &mut watch::Receiver<bool>) -> bool {
    let mut attempts: usize = 0;
    loop {
        if *shutdown.borrow() {
            return false;
        }
        match transport.reestablish().await {
            Ok(()) => {
                info!(attempts, "AMQP connection re-established");
                return true;
            }
            Err(error) => {
                let delay = reconnect_delay(attempts);
                warn!(
                    error = %error,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "Reconnect attempt failed"
                );
                attempts += 1;
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return false;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_starts_at_one_second() {
        assert_eq!(reconnect_delay(0).as_secs(), 1);
    }

    #[test]
    fn reconnect_delay_exponential_backoff() {
        assert_eq!(reconnect_delay(1).as_secs(), 2);
        assert_eq!(reconnect_delay(2).as_secs(), 4);
        assert_eq!(reconnect_delay(3).as_secs(), 8);
        assert_eq!(reconnect_delay(4).as_secs(), 16);
    }

    #[test]
    fn reconnect_delay_caps_at_max() {
        assert_eq!(reconnect_delay(5).as_secs(), 30);
        assert_eq!(reconnect_delay(10).as_secs(), 30);
        assert_eq!(reconnect_delay(100).as_secs(), 30);
    }

    #[test]
    fn reconnect_delay_overflow_protection() {
        assert_eq!(reconnect_delay(usize::MAX).as_secs(), 30);
    }
}
