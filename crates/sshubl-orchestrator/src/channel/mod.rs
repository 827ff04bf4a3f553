//! Control channel: the OpenSSH master connection of one target
//!
//! All sub-requests (`-O check|forward|cancel|exit`, remote commands,
//! interactive shells, sshfs) reach the remote host through the master's
//! control socket, so authentication happens once per target.

mod terminal;

pub use terminal::TerminalHandle;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sshubl_core::config::Settings;
use sshubl_core::error::{ChannelError, CloseError, ConnectError};
use sshubl_core::paths;
use sshubl_core::traits::{CommandOutput, CommandRunner, Invocation, PromptHandler};
use sshubl_core::{Target, TerminalSize};

use crate::auth::{self, LoginOptions};
use crate::backend::Backend;

/// Placeholder destination required by the ssh command line; the proxy
/// command makes any attempt to actually reach it fail
pub const FAKE_DESTINATION: &str = "destination";

const NO_PROXY: &str = "-oProxyCommand=exit 1";

/// Stderr fragments of a mux client that found no master
const NOT_CONNECTED_MARKERS: &[&str] = &[
    "control socket connect",
    "no such file or directory",
    "connection refused",
    "master is not running",
    "no ControlPath specified",
];

/// Multiplexed master connection bound to a control socket
pub struct ControlChannel {
    target: Target,
    socket_path: PathBuf,
    ssh: PathBuf,
    master_args: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    /// Bound on every one-shot client run against the socket
    request_timeout: Duration,
    /// Master pid learned from `-O check`, 0 when unknown
    master_pid: AtomicU32,
    closed: AtomicBool,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("target", &self.target)
            .field("socket_path", &self.socket_path)
            .field("master_pid", &self.master_pid())
            .finish()
    }
}

impl ControlChannel {
    /// Prepare a channel for `target` without connecting
    ///
    /// Resolves the ssh binary and derives the control socket path.
    pub fn new(target: Target, settings: &Settings, backend: &Backend) -> Result<Self, ConnectError> {
        let ssh = settings.resolve_ssh()?;
        let socket_path = paths::control_socket_path(&settings.sockets_path, &target)?;
        let master_args = master_args(&target, &socket_path, settings);

        Ok(Self {
            target,
            socket_path,
            ssh,
            master_args,
            runner: Arc::clone(&backend.runner),
            request_timeout: settings.request_timeout,
            master_pid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a channel, adopting a live master or authenticating a new one
    pub async fn open(
        target: Target,
        settings: &Settings,
        backend: &Backend,
        prompt: &dyn PromptHandler,
        cancel: &CancellationToken,
    ) -> Result<Self, ConnectError> {
        let channel = Self::new(target, settings, backend)?;
        let options = LoginOptions::from_settings(settings);
        channel.connect(&options, prompt, cancel).await?;
        Ok(channel)
    }

    /// Bring the master up: adopt a live one, else clear a stale socket and
    /// run the login dialogue
    pub(crate) async fn connect(
        &self,
        options: &LoginOptions,
        prompt: &dyn PromptHandler,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        paths::ensure_private_dir(&self.sockets_dir())?;
        self.closed.store(false, Ordering::SeqCst);

        if self.socket_path.exists() {
            if self.is_alive().await {
                tracing::info!("Adopting running master for {}", self.target);
                return Ok(());
            }
            tracing::debug!("Removing stale control socket {}", self.socket_path.display());
            self.remove_socket_file().map_err(ConnectError::Io)?;
        }

        auth::login(self, options, prompt, cancel).await?;
        tracing::info!("Master connection to {} established", self.target);
        Ok(())
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn sockets_dir(&self) -> PathBuf {
        self.socket_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Master pid from the last successful check
    pub fn master_pid(&self) -> Option<u32> {
        match self.master_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Whether `close()` was requested
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Command line starting the master
    pub(crate) fn master_invocation(&self) -> Invocation {
        Invocation::new(&self.ssh).args(self.master_args.iter().cloned())
    }

    /// Options binding a client to the control socket
    pub(crate) fn socket_options(&self) -> [String; 2] {
        [
            format!("-oControlPath={}", self.socket_path.display()),
            NO_PROXY.to_string(),
        ]
    }

    fn client_invocation(&self) -> Invocation {
        Invocation::new(&self.ssh).args(self.socket_options())
    }

    /// Run a one-shot client, giving up after `request_timeout`
    async fn run_client(&self, invocation: &Invocation) -> Result<CommandOutput, ChannelError> {
        let timeout = self.request_timeout;
        let output = tokio::time::timeout(timeout, self.runner.run(invocation))
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;
        Ok(output)
    }

    /// Ask the master whether it is running (`-O check`)
    pub async fn is_alive(&self) -> bool {
        if !self.socket_path.exists() {
            return false;
        }

        let invocation = self
            .client_invocation()
            .args(["-O", "check", FAKE_DESTINATION]);
        match self.run_client(&invocation).await {
            Ok(output) if output.success() => {
                if let Some(pid) = parse_master_pid(&output.stderr) {
                    self.master_pid.store(pid, Ordering::SeqCst);
                }
                true
            }
            Ok(output) => {
                tracing::debug!(
                    "Master check for {} failed: {}",
                    self.target,
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                tracing::warn!("Could not run master check for {}: {}", self.target, e);
                false
            }
        }
    }

    /// Issue a one-shot multiplexed request (`-O <subcommand> [args]`)
    pub async fn request(&self, subcommand: &str, args: &[String]) -> Result<CommandOutput, ChannelError> {
        if !self.socket_path.exists() {
            return Err(ChannelError::NotConnected);
        }

        let invocation = self
            .client_invocation()
            .args(["-O", subcommand])
            .args(args.iter().cloned())
            .arg(FAKE_DESTINATION);
        tracing::debug!("Mux request: {}", invocation);

        let output = self.run_client(&invocation).await?;
        if output.success() {
            return Ok(output);
        }
        Err(classify_failure(&output))
    }

    /// Run a remote command with a forced pseudo-terminal
    ///
    /// Arguments are joined with spaces and not escaped.
    pub async fn exec(&self, command: &[&str]) -> Result<CommandOutput, ChannelError> {
        if !self.socket_path.exists() {
            return Err(ChannelError::NotConnected);
        }

        let invocation = self
            .client_invocation()
            .args(["-q", "-tt", FAKE_DESTINATION, "--"])
            .arg(command.join(" "));
        let output = self.run_client(&invocation).await?;
        if output.success() {
            tracing::debug!("Remote command {:?} succeeded", command);
            Ok(output)
        } else {
            tracing::debug!(
                "Remote command {:?} failed with {:?}: {}",
                command,
                output.status,
                output.stderr.trim()
            );
            Err(classify_failure(&output))
        }
    }

    /// Spawn an interactive remote shell over the channel
    pub async fn open_terminal(&self, size: TerminalSize) -> Result<TerminalHandle, ChannelError> {
        if !self.is_alive().await {
            return Err(ChannelError::NotConnected);
        }
        let invocation = self
            .client_invocation()
            .args(["-q", "-tt", FAKE_DESTINATION]);
        let pty = self.runner.spawn_pty(&invocation, size).await?;
        tracing::info!("Opened terminal on {}", self.target);
        Ok(TerminalHandle::new(pty))
    }

    /// Ask the master to exit and remove the control socket
    ///
    /// Safe to call repeatedly and on a dead master.
    pub async fn close(&self) -> Result<(), CloseError> {
        self.closed.store(true, Ordering::SeqCst);

        if self.socket_path.exists() {
            match self.request("exit", &[]).await {
                Ok(_) => tracing::info!("Master for {} exited", self.target),
                // the master is already gone
                Err(e) => tracing::debug!("Exit request for {} failed: {}", self.target, e),
            }
        }

        self.master_pid.store(0, Ordering::SeqCst);
        self.remove_socket_file()
            .map_err(|source| CloseError::SocketRemoval {
                path: self.socket_path.clone(),
                source,
            })
    }

    /// Remove the control socket file, succeeding when it is absent
    pub(crate) fn remove_socket_file(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Arguments of the backgrounded master connection
fn master_args(target: &Target, socket_path: &Path, settings: &Settings) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        "-N".to_string(),
        "-oControlMaster=yes".to_string(),
        format!("-oControlPath={}", socket_path.display()),
        format!("-oControlPersist={}", settings.control_persist.as_secs().max(1)),
        format!(
            "-oServerAliveInterval={}",
            settings.ssh_server_alive_interval.as_secs().max(1)
        ),
        format!("-oConnectTimeout={}", settings.ssh_login_timeout.as_secs().max(1)),
    ];

    for (key, value) in &settings.ssh_options {
        args.push(format!("-o{}={}", key, value));
    }

    if target.is_loopback() && !settings.ssh_host_authentication_for_localhost {
        args.push("-oStrictHostKeyChecking=no".to_string());
        args.push("-oUserKnownHostsFile=/dev/null".to_string());
    }

    args.extend([
        "-p".to_string(),
        target.port.to_string(),
        "-l".to_string(),
        target.user.clone(),
        target.host.clone(),
    ]);
    args
}

/// Extract N from `Master running (pid=N)`
fn parse_master_pid(stderr: &str) -> Option<u32> {
    let start = stderr.find("(pid=")? + "(pid=".len();
    let rest = &stderr[start..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

fn classify_failure(output: &CommandOutput) -> ChannelError {
    let stderr = output.stderr.trim();
    let lower = stderr.to_ascii_lowercase();
    if NOT_CONNECTED_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_ascii_lowercase()))
    {
        return ChannelError::NotConnected;
    }
    if stderr.is_empty() {
        return ChannelError::Rejected(format!("exit status {:?}", output.status));
    }
    ChannelError::Rejected(stderr.to_string())
}
