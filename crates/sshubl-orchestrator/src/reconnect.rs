//! Authentication and reconnection of a session's master connection

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sshubl_core::config::{BackoffConfig, ReconnectConfig, Settings};
use sshubl_core::error::{AuthError, ConnectError};
use sshubl_core::traits::{PromptCancelled, PromptHandler, PromptKind, PromptRequest, PromptResponse};
use sshubl_core::SessionState;

use crate::auth::LoginOptions;
use crate::channel::ControlChannel;
use crate::events::SessionEvent;
use crate::session::Session;

/// Exponential backoff with jitter for reconnection attempts
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        std::cmp::min(delay + Duration::from_secs_f64(jitter_amount), self.max)
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How a reconnection episode ended
#[derive(Debug)]
pub enum ReconnectOutcome {
    /// The master is back, resources were restored
    Reconnected { attempts: u32 },
    /// The user gave up, or the session is being torn down
    Cancelled { attempts: u32 },
    /// Every attempt failed on connectivity
    Exhausted { attempts: u32, last_error: Option<AuthError> },
    /// An attempt failed in a way retrying cannot fix
    Failed { attempts: u32, error: AuthError },
}

impl ReconnectOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ReconnectOutcome::Reconnected { attempts }
            | ReconnectOutcome::Cancelled { attempts }
            | ReconnectOutcome::Exhausted { attempts, .. }
            | ReconnectOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_reconnected(&self) -> bool {
        matches!(self, ReconnectOutcome::Reconnected { .. })
    }
}

enum AttemptResult {
    Connected,
    GaveUp,
    Failed(AuthError),
}

/// Drives authentication prompts and the retry loop after drops
pub struct ReconnectionController {
    config: ReconnectConfig,
    login_timeout: Duration,
    /// Password from the connection string, reused on every attempt
    password: Mutex<Option<String>>,
    /// Attempts made by the current or last reconnection episode
    attempts: AtomicU32,
}

impl ReconnectionController {
    pub fn new(settings: &Settings, password: Option<String>) -> Self {
        Self {
            config: settings.reconnect.clone(),
            login_timeout: settings.ssh_login_timeout,
            password: Mutex::new(password),
            attempts: AtomicU32::new(0),
        }
    }

    /// Attempts of the current or last reconnection episode
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn login_options(&self) -> LoginOptions {
        let password = self.password.lock().ok().and_then(|p| p.clone());
        LoginOptions {
            login_timeout: self.login_timeout,
            password,
        }
    }

    /// Bring the master of `channel` up, prompting through `prompt`
    ///
    /// Cancelling `cancel` kills the connection attempt and yields
    /// [`AuthError::Cancelled`].
    pub async fn authenticate(
        &self,
        channel: &ControlChannel,
        prompt: &dyn PromptHandler,
        cancel: &CancellationToken,
    ) -> Result<(), AuthError> {
        let options = self.login_options();
        match channel.connect(&options, prompt, cancel).await {
            Ok(()) => Ok(()),
            Err(ConnectError::Auth(e)) => Err(e),
            Err(ConnectError::Cancelled) => Err(AuthError::Cancelled),
            Err(ConnectError::Timeout(after)) => Err(AuthError::Timeout(after)),
            Err(ConnectError::Unreachable(reason)) => Err(AuthError::Unreachable(reason)),
            Err(ConnectError::Io(e)) => Err(AuthError::Io(e)),
            Err(other) => Err(AuthError::Unreachable(other.to_string())),
        }
    }

    /// Retry loop run after the master of `session` died unexpectedly
    ///
    /// Each attempt is accompanied by a cancel confirmation prompt; answering
    /// it with `Reject` or cancelling it aborts the attempt in flight and
    /// stops retrying. The session ends `Connected` with its resources
    /// restored, or `Disconnected` with its resources orphaned.
    pub async fn on_unexpected_drop(&self, session: &Session) -> ReconnectOutcome {
        let target = session.target().clone();
        let max = self.config.max_retries;
        self.attempts.store(0, Ordering::SeqCst);
        session.set_state(SessionState::Reconnecting);
        tracing::warn!("Connection to {} lost, reconnecting (max {} attempts)", target, max);

        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let mut last_error = None;

        for attempt in 1..=max {
            self.attempts.store(attempt, Ordering::SeqCst);
            session.emit(SessionEvent::ReconnectAttempt {
                target: target.clone(),
                attempt,
                max_attempts: max,
            });
            tracing::info!("Reconnection attempt {}/{} to {}", attempt, max, target);

            match self.attempt(session, attempt).await {
                AttemptResult::Connected => {
                    tracing::info!("Reconnected to {} after {} attempt(s)", target, attempt);
                    session.set_state(SessionState::Connected);
                    session.restore_resources().await;
                    return ReconnectOutcome::Reconnected { attempts: attempt };
                }
                AttemptResult::GaveUp => {
                    tracing::info!("Reconnection to {} cancelled at attempt {}", target, attempt);
                    session.abandon_resources();
                    return ReconnectOutcome::Cancelled { attempts: attempt };
                }
                AttemptResult::Failed(e) if !e.is_transient() => {
                    tracing::error!("Reconnection to {} failed: {}", target, e);
                    session.abandon_resources();
                    return ReconnectOutcome::Failed {
                        attempts: attempt,
                        error: e,
                    };
                }
                AttemptResult::Failed(e) => {
                    tracing::warn!("Reconnection attempt {} to {} failed: {}", attempt, target, e);
                    last_error = Some(e);
                }
            }

            if attempt < max {
                let delay = backoff.next_delay();
                tracing::debug!("Next reconnection attempt to {} in {:?}", target, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = session.shutdown_token().cancelled() => {
                        session.abandon_resources();
                        return ReconnectOutcome::Cancelled { attempts: attempt };
                    }
                }
            }
        }

        tracing::error!("Giving up on {} after {} attempt(s)", target, max);
        session.abandon_resources();
        ReconnectOutcome::Exhausted {
            attempts: self.attempts(),
            last_error,
        }
    }

    /// One authentication raced against the user's cancel confirmation
    async fn attempt(&self, session: &Session, attempt: u32) -> AttemptResult {
        let cancel = session.shutdown_token().child_token();
        let prompt = session.prompt_handler();

        let auth = self.authenticate(session.channel(), prompt.as_ref(), &cancel);
        tokio::pin!(auth);

        let confirmation = prompt.prompt(PromptRequest {
            kind: PromptKind::CancelConfirmation,
            target: session.target().clone(),
            message: format!(
                "Connection to {} lost, reconnecting (attempt {}/{})",
                session.target(),
                attempt,
                self.config.max_retries
            ),
        });
        tokio::pin!(confirmation);

        let result = tokio::select! {
            biased;
            result = &mut auth => result,
            answer = &mut confirmation => match answer {
                Ok(PromptResponse::Reject) | Err(PromptCancelled) => {
                    cancel.cancel();
                    // let the attempt kill its process and clean up
                    let _ = auth.await;
                    return AttemptResult::GaveUp;
                }
                Ok(_) => auth.await,
            },
        };

        match result {
            Ok(()) => AttemptResult::Connected,
            Err(AuthError::Cancelled) => AttemptResult::GaveUp,
            Err(e) => AttemptResult::Failed(e),
        }
    }
}

impl std::fmt::Debug for ReconnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionController")
            .field("config", &self.config)
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0,
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_capped_and_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60), 1.0, 0.5);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_outcome_attempts() {
        let outcome = ReconnectOutcome::Exhausted {
            attempts: 3,
            last_error: None,
        };
        assert_eq!(outcome.attempts(), 3);
        assert!(!outcome.is_reconnected());
        assert!(ReconnectOutcome::Reconnected { attempts: 1 }.is_reconnected());
    }
}
