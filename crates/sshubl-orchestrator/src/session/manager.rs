//! Session manager implementation

use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;

use sshubl_core::config::Settings;
use sshubl_core::error::ConnectError;
use sshubl_core::traits::PromptHandler;
use sshubl_core::{ConnectionString, SessionState, Target};

use super::{Session, TeardownReport};
use crate::backend::Backend;
use crate::events::{SessionEvent, EVENT_CHANNEL_CAPACITY};

/// Process-wide registry of sessions, at most one live session per target
pub struct SessionManager {
    settings: Arc<Settings>,
    backend: Backend,
    sessions: DashMap<Target, Arc<Session>>,
    /// Replaced sessions whose teardown left resources behind
    retired: Mutex<Vec<Arc<Session>>>,
    events: broadcast::Sender<SessionEvent>,
}

enum Slot {
    Existing(Arc<Session>),
    /// A new session, with the dead one it replaced
    Created(Arc<Session>, Option<Arc<Session>>),
}

impl SessionManager {
    /// Manager driving real processes
    pub fn new(settings: Settings) -> Self {
        Self::with_backend(settings, Backend::system())
    }

    pub fn with_backend(settings: Settings, backend: Backend) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings: Arc::new(settings),
            backend,
            sessions: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Connect to a target, reusing its live session if there is one
    ///
    /// Concurrent calls for the same target share one session; later
    /// callers wait for the first connection attempt to finish.
    pub async fn connect(
        &self,
        connection: impl Into<ConnectionString>,
        prompt: Arc<dyn PromptHandler>,
    ) -> Result<Arc<Session>, ConnectError> {
        let connection = connection.into();
        let target = connection.target.clone();

        let slot = match self.sessions.entry(target.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state().is_live() {
                    Slot::Existing(Arc::clone(entry.get()))
                } else {
                    let session = Arc::new(self.new_session(connection, prompt)?);
                    let stale = entry.insert(Arc::clone(&session));
                    Slot::Created(session, Some(stale))
                }
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(self.new_session(connection, prompt)?);
                entry.insert(Arc::clone(&session));
                Slot::Created(session, None)
            }
        };

        match slot {
            Slot::Existing(session) => {
                tracing::debug!("Reusing session for {}", target);
                wait_established(session).await
            }
            Slot::Created(session, stale) => {
                // the stale master is dead, so its socket can be cleared
                // before the new one binds it
                if let Some(stale) = stale {
                    self.retire(stale).await;
                }
                tracing::info!("Connecting to {}", target);
                if let Err(e) = session.establish().await {
                    self.sessions
                        .remove_if(&target, |_, s| Arc::ptr_eq(s, &session));
                    return Err(e);
                }
                Ok(session)
            }
        }
    }

    /// Release what a replaced session still holds
    ///
    /// Sessions whose teardown failed are kept and retried by
    /// [`disconnect`](Self::disconnect) and [`disconnect_all`](Self::disconnect_all).
    async fn retire(&self, stale: Arc<Session>) {
        tracing::info!("Releasing resources of the previous session to {}", stale.target());
        let report = stale.disconnect().await;
        if !report.is_clean() {
            tracing::warn!(
                "{} resource(s) of the previous session to {} are still held",
                report.failures.len(),
                stale.target()
            );
            self.retired_lock().push(stale);
        }
    }

    fn retired_lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Session>>> {
        self.retired.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the retired sessions matching `pred` out of the retry list
    fn take_retired(&self, pred: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        let mut retired = self.retired_lock();
        let (taken, kept): (Vec<_>, Vec<_>) = retired.drain(..).partition(|s| pred(s));
        *retired = kept;
        taken
    }

    fn new_session(
        &self,
        connection: ConnectionString,
        prompt: Arc<dyn PromptHandler>,
    ) -> Result<Session, ConnectError> {
        Session::new(
            connection,
            Arc::clone(&self.settings),
            &self.backend,
            prompt,
            self.events.clone(),
        )
    }

    /// Get the session of a target
    pub fn get(&self, target: &Target) -> Option<Arc<Session>> {
        self.sessions.get(target).map(|r| Arc::clone(&r))
    }

    /// All sessions, ordered by target
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        sessions.sort_by(|a, b| a.target().cmp(b.target()));
        sessions
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tear down the session of a target, `None` when there is none
    pub async fn disconnect(&self, target: &Target) -> Option<TeardownReport> {
        let mut sessions = self.take_retired(|s| s.target() == target);
        if let Some((_, session)) = self.sessions.remove(target) {
            sessions.push(session);
        }
        if sessions.is_empty() {
            return None;
        }
        Some(teardown(&sessions).await)
    }

    /// Tear every session down concurrently
    pub async fn disconnect_all(&self) -> TeardownReport {
        let targets: Vec<Target> = self.sessions.iter().map(|r| r.key().clone()).collect();
        let mut sessions = self.take_retired(|_| true);
        sessions.extend(
            targets
                .iter()
                .filter_map(|target| self.sessions.remove(target).map(|(_, s)| s)),
        );
        if !sessions.is_empty() {
            tracing::info!("Disconnecting {} session(s)", sessions.len());
        }
        teardown(&sessions).await
    }

    /// Receive events of every session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

async fn teardown(sessions: &[Arc<Session>]) -> TeardownReport {
    let mut report = TeardownReport::default();
    for partial in join_all(sessions.iter().map(|s| s.disconnect())).await {
        report.merge(partial);
    }
    report
}

/// Wait for a session still connecting to come up
async fn wait_established(session: Arc<Session>) -> Result<Arc<Session>, ConnectError> {
    let mut state = session.subscribe_state();
    let settled = state
        .wait_for(|s| *s != SessionState::Connecting)
        .await
        .map(|s| *s);

    match settled {
        Ok(SessionState::Connected) | Ok(SessionState::Reconnecting) => Ok(session),
        _ => Err(ConnectError::Unreachable(format!(
            "concurrent connection attempt to {} failed",
            session.target()
        ))),
    }
}
