//! Sessions: one master connection and the resources built on it

mod health;
mod manager;
mod teardown;

pub use health::run_health_monitor;
pub use manager::SessionManager;
pub use teardown::{TeardownFailure, TeardownReport, TeardownResource};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use sshubl_core::config::Settings;
use sshubl_core::error::{ChannelError, ConnectError, ForwardError, MountError};
use sshubl_core::paths;
use sshubl_core::time::current_time_millis;
use sshubl_core::traits::PromptHandler;
use sshubl_core::{
    ConnectionString, Endpoint, Forward, ForwardDirection, ForwardId, ForwardRequest, Mount,
    MountId, MountOptions, SessionState, Target, TerminalSize,
};

use crate::backend::Backend;
use crate::channel::{ControlChannel, TerminalHandle};
use crate::events::SessionEvent;
use crate::forward::ForwardRegistry;
use crate::mount::MountRegistry;
use crate::reconnect::{ReconnectOutcome, ReconnectionController};

/// A master connection to one target with its forwards and mounts
///
/// Resource mutations, reconnection and teardown are serialized per
/// session; different sessions never wait on each other.
pub struct Session {
    target: Target,
    settings: Arc<Settings>,
    channel: Arc<ControlChannel>,
    forwards: ForwardRegistry,
    mounts: MountRegistry,
    reconnect: ReconnectionController,
    prompt: Arc<dyn PromptHandler>,
    state: watch::Sender<SessionState>,
    ops: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    created_at: u64,
    /// Cancelled when the session is torn down
    shutdown: CancellationToken,
}

impl Session {
    /// Build a session in the `Connecting` state, without connecting
    pub fn new(
        connection: ConnectionString,
        settings: Arc<Settings>,
        backend: &Backend,
        prompt: Arc<dyn PromptHandler>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Self, ConnectError> {
        let ConnectionString { target, password } = connection;
        let channel = Arc::new(ControlChannel::new(target.clone(), &settings, backend)?);

        let forwards = ForwardRegistry::new(
            Arc::clone(&channel),
            Arc::clone(&backend.listeners),
            settings.forward_resolve_timeout,
        );
        let mounts = MountRegistry::new(
            Arc::clone(&channel),
            Arc::clone(&backend.runner),
            Arc::clone(&backend.mount_table),
            Arc::clone(&settings),
            paths::session_mounts_dir(&settings.mounts_path, &target),
        );
        let reconnect = ReconnectionController::new(&settings, password);
        let (state, _) = watch::channel(SessionState::Connecting);

        Ok(Self {
            target,
            settings,
            channel,
            forwards,
            mounts,
            reconnect,
            prompt,
            state,
            ops: Mutex::new(()),
            events,
            created_at: current_time_millis(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Authenticate the master and start watching it
    pub async fn establish(self: &Arc<Self>) -> Result<(), ConnectError> {
        let result = self
            .reconnect
            .authenticate(&self.channel, self.prompt.as_ref(), &self.shutdown)
            .await;

        match result {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                tokio::spawn(run_health_monitor(
                    Arc::downgrade(self),
                    self.settings.keepalive_interval,
                    self.shutdown.clone(),
                ));
                Ok(())
            }
            Err(e) => {
                tracing::error!("Could not connect to {}: {}", self.target, e);
                self.set_state(SessionState::Disconnected);
                Err(e.into())
            }
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn socket_path(&self) -> &Path {
        self.channel.socket_path()
    }

    /// Directory holding generated mount points
    pub fn mounts_dir(&self) -> PathBuf {
        self.mounts.base_dir().to_path_buf()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Attempts of the current or last reconnection episode
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts()
    }

    pub async fn is_alive(&self) -> bool {
        self.channel.is_alive().await
    }

    /// Open a forward from `listen` to `destination`
    pub async fn add_forward(
        &self,
        direction: ForwardDirection,
        listen: Endpoint,
        destination: Endpoint,
    ) -> Result<Forward, ForwardError> {
        self.add_forward_request(ForwardRequest::new(direction, listen, destination))
            .await
    }

    pub async fn add_forward_request(&self, request: ForwardRequest) -> Result<Forward, ForwardError> {
        let _guard = self.ops.lock().await;
        if self.state() != SessionState::Connected {
            return Err(ForwardError::ChannelDown);
        }

        let forward = self.forwards.add_request(request).await?;
        self.emit(SessionEvent::ForwardAdded {
            target: self.target.clone(),
            forward: forward.clone(),
        });
        Ok(forward)
    }

    pub async fn cancel_forward(&self, id: ForwardId) -> Result<(), ForwardError> {
        let _guard = self.ops.lock().await;
        self.forwards.cancel(id).await?;
        self.emit(SessionEvent::ForwardCancelled {
            target: self.target.clone(),
            id,
        });
        Ok(())
    }

    /// Forwards in creation order
    pub fn forwards(&self) -> Vec<Forward> {
        self.forwards.list()
    }

    pub fn forward(&self, id: ForwardId) -> Option<Forward> {
        self.forwards.get(id)
    }

    /// Mount `remote_path`, at a generated mount point unless `local_path` is given
    pub async fn mount(
        &self,
        remote_path: impl Into<PathBuf>,
        local_path: Option<PathBuf>,
        options: MountOptions,
    ) -> Result<Mount, MountError> {
        let _guard = self.ops.lock().await;
        if self.state() != SessionState::Connected {
            return Err(MountError::ChannelDown);
        }

        let mount = self.mounts.mount(remote_path, local_path, options).await?;
        self.emit(SessionEvent::MountAdded {
            target: self.target.clone(),
            mount: mount.clone(),
        });
        Ok(mount)
    }

    pub async fn unmount(&self, id: MountId) -> Result<(), MountError> {
        let _guard = self.ops.lock().await;
        self.mounts.unmount(id).await?;
        self.emit(SessionEvent::MountRemoved {
            target: self.target.clone(),
            id,
        });
        Ok(())
    }

    /// Mounts in creation order, reconciled against the OS
    pub fn mounts(&self) -> Vec<Mount> {
        self.mounts.list()
    }

    /// Mount options derived from settings
    pub fn default_mount_options(&self) -> MountOptions {
        MountOptions {
            follow_symlinks: self.settings.follow_symlinks,
            ..Default::default()
        }
    }

    /// Interactive shell over the master connection
    pub async fn open_terminal(&self, size: TerminalSize) -> Result<TerminalHandle, ChannelError> {
        if self.state() != SessionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        self.channel.open_terminal(size).await
    }

    /// Release every resource, then the master: mounts, forwards, channel
    pub async fn disconnect(&self) -> TeardownReport {
        self.shutdown.cancel();
        let _guard = self.ops.lock().await;
        self.set_state(SessionState::Disconnecting);
        tracing::info!("Disconnecting from {}", self.target);

        let mut report = TeardownReport {
            sessions: 1,
            failures: Vec::new(),
        };

        let ids = self.mounts.ids();
        let results = join_all(ids.iter().map(|id| self.mounts.unmount(*id))).await;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) => self.emit(SessionEvent::MountRemoved {
                    target: self.target.clone(),
                    id,
                }),
                Err(e) => report.record(&self.target, TeardownResource::Mount(id), e),
            }
        }

        if self.channel.is_alive().await {
            let ids: Vec<ForwardId> = self.forwards.list().iter().map(|f| f.id).collect();
            let results = join_all(ids.iter().map(|id| self.forwards.cancel(*id))).await;
            for (id, result) in ids.into_iter().zip(results) {
                match result {
                    Ok(()) => self.emit(SessionEvent::ForwardCancelled {
                        target: self.target.clone(),
                        id,
                    }),
                    Err(e) => report.record(&self.target, TeardownResource::Forward(id), e),
                }
            }
        }
        let discarded = self.forwards.discard_all().await;
        if !discarded.is_empty() {
            tracing::debug!("Discarded {} forward(s) of {}", discarded.len(), self.target);
        }

        if let Err(e) = self.channel.close().await {
            report.record(&self.target, TeardownResource::Channel, e);
        }
        self.mounts.remove_base_dir();

        self.set_state(SessionState::Disconnected);
        tracing::info!("Disconnected from {}", self.target);
        report
    }

    /// Run the reconnection loop after the health monitor saw the master die
    pub(crate) async fn handle_drop(&self) -> Option<ReconnectOutcome> {
        let _guard = self.ops.lock().await;
        // teardown or another check may have handled it meanwhile
        if self.shutdown.is_cancelled() || self.state() != SessionState::Connected {
            return None;
        }
        if self.channel.is_alive().await {
            return None;
        }
        Some(self.reconnect.on_unexpected_drop(self).await)
    }

    /// Move to `state`; `Disconnected` is terminal
    pub(crate) fn set_state(&self, state: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state || *current == SessionState::Disconnected {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::debug!("Session {} is now {}", self.target, state);
            self.emit(SessionEvent::StateChanged {
                target: self.target.clone(),
                state,
            });
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Re-issue forwards and mounts over a fresh master
    pub(crate) async fn restore_resources(&self) {
        let forwards = self.forwards.restore().await;
        let mounts = self.mounts.restore().await;
        if forwards + mounts > 0 {
            tracing::warn!(
                "{} forward(s) and {} mount(s) of {} could not be restored",
                forwards,
                mounts,
                self.target
            );
            self.emit(SessionEvent::ResourcesOrphaned {
                target: self.target.clone(),
                forwards,
                mounts,
            });
        }
    }

    /// Give up on the master, leaving every resource orphaned
    pub(crate) fn abandon_resources(&self) {
        let forwards = self.forwards.mark_orphaned();
        let mounts = self.mounts.mark_orphaned();
        if let Err(e) = self.channel.remove_socket_file() {
            tracing::warn!(
                "Could not remove control socket {}: {}",
                self.channel.socket_path().display(),
                e
            );
        }
        self.emit(SessionEvent::ResourcesOrphaned {
            target: self.target.clone(),
            forwards,
            mounts,
        });
        self.set_state(SessionState::Disconnected);
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn prompt_handler(&self) -> Arc<dyn PromptHandler> {
        Arc::clone(&self.prompt)
    }

    pub(crate) fn channel(&self) -> &ControlChannel {
        &self.channel
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("state", &self.state())
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
