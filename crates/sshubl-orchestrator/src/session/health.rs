//! Keepalive health monitor
//!
//! Each connected session gets a task that runs `-O check` against its
//! master every `keepalive_interval`. A failed check hands the session to
//! the reconnection loop. The regular mux traffic also keeps an idle master
//! from reaching its `ControlPersist` deadline.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use sshubl_core::SessionState;

use super::Session;

/// Floor for the check period, a zero period would spin
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Run the health monitor of `session` until it is torn down or dropped
pub async fn run_health_monitor(
    session: Weak<Session>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let interval = interval.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(session) = session.upgrade() else {
                    break;
                };
                if !check(&session).await {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
    tracing::debug!("Health monitor stopped");
}

/// One keepalive round, returning whether monitoring should continue
async fn check(session: &Session) -> bool {
    match session.state() {
        SessionState::Connected => {}
        SessionState::Disconnecting | SessionState::Disconnected => return false,
        SessionState::Connecting | SessionState::Reconnecting => return true,
    }
    if session.is_alive().await {
        return true;
    }

    match session.handle_drop().await {
        None => true,
        Some(outcome) if outcome.is_reconnected() => {
            tracing::info!(
                "{} recovered after {} attempt(s)",
                session.target(),
                outcome.attempts()
            );
            true
        }
        Some(outcome) => {
            tracing::warn!("Stopped monitoring {}: {:?}", session.target(), outcome);
            false
        }
    }
}
