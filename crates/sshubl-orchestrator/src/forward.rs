//! Forwards multiplexed over a control channel

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;

use sshubl_core::error::{ChannelError, ForwardError};
use sshubl_core::time::current_time_millis;
use sshubl_core::traits::ListenerQuery;
use sshubl_core::{Endpoint, Forward, ForwardDirection, ForwardId, ForwardRequest, ForwardStatus};

use crate::channel::ControlChannel;

/// Listener polling period while resolving an allocated local port
const RESOLVE_POLL: Duration = Duration::from_millis(50);

/// Tracks the forwards of one session
pub struct ForwardRegistry {
    channel: Arc<ControlChannel>,
    listeners: Arc<dyn ListenerQuery>,
    resolve_timeout: Duration,
    forwards: RwLock<BTreeMap<ForwardId, Forward>>,
    next_id: AtomicU64,
}

impl ForwardRegistry {
    pub fn new(
        channel: Arc<ControlChannel>,
        listeners: Arc<dyn ListenerQuery>,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            listeners,
            resolve_timeout,
            forwards: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ForwardId, Forward>> {
        self.forwards.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ForwardId, Forward>> {
        self.forwards.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a forward from `listen` to `destination`
    pub async fn add(
        &self,
        direction: ForwardDirection,
        listen: Endpoint,
        destination: Endpoint,
    ) -> Result<Forward, ForwardError> {
        self.add_request(ForwardRequest::new(direction, listen, destination))
            .await
    }

    /// Open a forward
    ///
    /// The forward is listed as `Pending` while the request is in flight
    /// and until an allocated (port 0) listen port is known.
    pub async fn add_request(&self, request: ForwardRequest) -> Result<Forward, ForwardError> {
        let id = ForwardId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.write().insert(
            id,
            Forward {
                id,
                request: request.clone(),
                resolved_listen: request.listen.clone(),
                status: ForwardStatus::Pending,
                created_at: current_time_millis(),
            },
        );

        match self.establish(&request).await {
            Ok(resolved) => {
                let mut forwards = self.write();
                let forward = forwards.get_mut(&id).ok_or_else(|| {
                    ForwardError::NotFound(id.to_string())
                })?;
                if let Some(resolved) = resolved {
                    forward.resolved_listen = resolved;
                }
                forward.status = ForwardStatus::Ready;
                tracing::info!("Forward {} ready: {}", id, forward);
                Ok(forward.clone())
            }
            Err(e) => {
                self.write().remove(&id);
                tracing::error!("Could not open forward {}: {}", request, e);
                Err(e)
            }
        }
    }

    /// Issue `-O forward` and learn the allocated port, if any
    async fn establish(&self, request: &ForwardRequest) -> Result<Option<Endpoint>, ForwardError> {
        let resolve_local =
            request.direction == ForwardDirection::Local && request.listen.is_allocated();
        let before = if resolve_local {
            self.current_listeners().await
        } else {
            Vec::new()
        };

        let args = [request.direction.flag().to_string(), request.spec()];
        let output = match self.channel.request("forward", &args).await {
            Ok(output) => output,
            Err(ChannelError::Timeout(after)) => {
                // the master may have bound the listener before the client stalled
                if let Err(e) = self.send_cancel(request).await {
                    tracing::warn!("Could not cancel stalled forward {}: {}", request, e);
                }
                return Err(ForwardError::Timeout(after));
            }
            Err(e) => return Err(e.into()),
        };

        if !request.listen.is_allocated() {
            return Ok(None);
        }

        match request.direction {
            ForwardDirection::Reverse => match output.stdout.trim().parse::<u16>() {
                Ok(port) => {
                    tracing::debug!("Remote allocated port {} for {}", port, request);
                    Ok(Some(request.listen.with_port(port)))
                }
                Err(_) => {
                    tracing::warn!(
                        "Could not read the port allocated for {} from {:?}",
                        request,
                        output.stdout.trim()
                    );
                    Ok(None)
                }
            },
            ForwardDirection::Local => match self.resolve_local(&request.listen, &before).await {
                Some(port) => {
                    tracing::debug!("Master bound port {} for {}", port, request);
                    Ok(Some(request.listen.with_port(port)))
                }
                None => {
                    if let Err(e) = self.send_cancel(request).await {
                        tracing::warn!("Could not cancel unresolved forward {}: {}", request, e);
                    }
                    Err(ForwardError::Timeout(self.resolve_timeout))
                }
            },
        }
    }

    async fn current_listeners(&self) -> Vec<SocketAddr> {
        let Some(pid) = self.master_pid().await else {
            return Vec::new();
        };
        self.listeners.listeners(pid).await.unwrap_or_else(|e| {
            tracing::debug!("Could not list listeners of master {}: {}", pid, e);
            Vec::new()
        })
    }

    async fn master_pid(&self) -> Option<u32> {
        if let Some(pid) = self.channel.master_pid() {
            return Some(pid);
        }
        self.channel.is_alive().await;
        self.channel.master_pid()
    }

    /// Poll the master's listeners for a new socket on the bind address
    async fn resolve_local(&self, listen: &Endpoint, before: &[SocketAddr]) -> Option<u16> {
        let deadline = Instant::now() + self.resolve_timeout;
        let claimed: Vec<u16> = self
            .read()
            .values()
            .filter_map(|f| f.resolved_port())
            .collect();

        loop {
            let found = self.current_listeners().await.into_iter().find(|addr| {
                !before.contains(addr)
                    && !claimed.contains(&addr.port())
                    && bind_matches(listen.host(), addr.ip())
            });
            if let Some(addr) = found {
                return Some(addr.port());
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(RESOLVE_POLL.min(deadline - now)).await;
        }
    }

    async fn send_cancel(&self, request: &ForwardRequest) -> Result<(), ForwardError> {
        let args = [request.direction.flag().to_string(), request.spec()];
        self.channel.request("cancel", &args).await?;
        Ok(())
    }

    /// Close a forward using the request it was opened with
    ///
    /// UNIX socket files left by the listener are removed afterwards.
    pub async fn cancel(&self, id: ForwardId) -> Result<(), ForwardError> {
        let forward = self
            .get(id)
            .ok_or_else(|| ForwardError::NotFound(id.to_string()))?;

        if forward.status == ForwardStatus::Orphaned {
            tracing::debug!("Discarding orphaned forward {}", id);
        } else {
            self.send_cancel(&forward.request).await?;
        }

        self.write().remove(&id);
        self.remove_listen_socket(&forward.request).await;
        tracing::info!("Forward {} closed: {}", id, forward.request);
        Ok(())
    }

    /// Remove the listen socket file of a UNIX socket forward
    async fn remove_listen_socket(&self, request: &ForwardRequest) {
        let Some(path) = request.listen.unix_path() else {
            return;
        };

        match request.direction {
            ForwardDirection::Local => match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed socket {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Couldn't remove socket {}: {}", path.display(), e),
            },
            ForwardDirection::Reverse => {
                let quoted = shell_quote(&path.to_string_lossy());
                if self.channel.exec(&["rm", "-f", quoted.as_str()]).await.is_err()
                    && self.channel.exec(&["del", "/q", quoted.as_str()]).await.is_err()
                {
                    tracing::warn!("Couldn't remove remote socket {}", path.display());
                }
            }
        }
    }

    pub fn get(&self, id: ForwardId) -> Option<Forward> {
        self.read().get(&id).cloned()
    }

    /// Snapshot in creation order
    pub fn list(&self) -> Vec<Forward> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Mark every forward orphaned, returning how many there were
    pub(crate) fn mark_orphaned(&self) -> usize {
        let mut forwards = self.write();
        for forward in forwards.values_mut() {
            forward.status = ForwardStatus::Orphaned;
        }
        forwards.len()
    }

    /// Re-issue every forward after the master came back
    ///
    /// Returns the number of forwards that could not be restored.
    pub(crate) async fn restore(&self) -> usize {
        let mut failed = 0;
        for forward in self.list() {
            if forward.request.direction == ForwardDirection::Local {
                // the dead master left its listen socket behind
                self.remove_listen_socket(&forward.request).await;
            }

            let result = self.establish(&forward.request).await;
            let mut forwards = self.write();
            let Some(entry) = forwards.get_mut(&forward.id) else {
                continue;
            };
            match result {
                Ok(resolved) => {
                    entry.resolved_listen = resolved.unwrap_or_else(|| forward.request.listen.clone());
                    entry.status = ForwardStatus::Ready;
                    tracing::info!("Restored forward {}: {}", entry.id, entry);
                }
                Err(e) => {
                    entry.status = ForwardStatus::Orphaned;
                    failed += 1;
                    tracing::warn!("Could not restore forward {}: {}", forward.request, e);
                }
            }
        }
        failed
    }

    /// Forget every forward without contacting the master
    pub(crate) async fn discard_all(&self) -> Vec<Forward> {
        let discarded: Vec<Forward> = std::mem::take(&mut *self.write()).into_values().collect();
        for forward in &discarded {
            if forward.request.direction == ForwardDirection::Local {
                self.remove_listen_socket(&forward.request).await;
            }
        }
        discarded
    }
}

/// Whether a listener on `ip` serves the requested bind host
fn bind_matches(host: Option<&str>, ip: IpAddr) -> bool {
    match host {
        None => ip.is_loopback(),
        Some(h) if h.eq_ignore_ascii_case("localhost") => ip.is_loopback(),
        Some("*") | Some("") => ip.is_unspecified(),
        Some(h) => match h.parse::<IpAddr>() {
            Ok(requested) => requested == ip,
            // names are resolved by the master
            Err(_) => true,
        },
    }
}

/// Single-quote `s` for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
