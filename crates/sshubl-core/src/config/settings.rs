//! Settings snapshot read at session creation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::{ConfigError, ConnectError, MountError};
use crate::paths;

/// Runtime settings for sessions and their resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Explicit `ssh` binary, searched on `PATH` when unset
    pub ssh_path: Option<PathBuf>,

    /// Explicit `sshfs` binary, searched on `PATH` when unset
    pub sshfs_path: Option<PathBuf>,

    /// Explicit unmount binary (`fusermount` on Linux, `umount` elsewhere)
    pub umount_path: Option<PathBuf>,

    /// Directory holding control sockets
    pub sockets_path: PathBuf,

    /// Directory holding generated mount points
    pub mounts_path: PathBuf,

    /// Extra `-o` options passed verbatim to the master connection
    pub ssh_options: BTreeMap<String, String>,

    /// Time allowed between two steps of the login dialogue
    #[serde(with = "duration_secs")]
    pub ssh_login_timeout: Duration,

    /// Keep host key checking enabled for loopback targets
    pub ssh_host_authentication_for_localhost: bool,

    /// `ServerAliveInterval` of the master connection
    #[serde(with = "duration_secs")]
    pub ssh_server_alive_interval: Duration,

    /// `ControlPersist` of the master connection
    #[serde(with = "duration_secs")]
    pub control_persist: Duration,

    /// Health check period, must stay below `control_persist`
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Window for learning the port of an allocated (port 0) forward
    #[serde(with = "duration_secs")]
    pub forward_resolve_timeout: Duration,

    /// Time allowed for the mount and unmount clients to finish
    #[serde(with = "duration_secs")]
    pub mount_timeout: Duration,

    /// Time allowed for a multiplexed request or remote command
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Default for the mount `follow_symlinks` option
    pub follow_symlinks: bool,

    /// Reconnection policy
    pub reconnect: ReconnectConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let cache = paths::default_cache_dir();
        Self {
            ssh_path: None,
            sshfs_path: None,
            umount_path: None,
            sockets_path: cache.join("sockets"),
            mounts_path: cache.join("mounts"),
            ssh_options: BTreeMap::new(),
            ssh_login_timeout: Duration::from_secs(10),
            ssh_host_authentication_for_localhost: true,
            ssh_server_alive_interval: Duration::from_secs(15),
            control_persist: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            forward_resolve_timeout: Duration::from_secs(5),
            mount_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            follow_symlinks: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Settings {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "keepalive_interval must be greater than zero".into(),
            ));
        }
        if self.keepalive_interval >= self.control_persist {
            return Err(ConfigError::Invalid(format!(
                "keepalive_interval ({:?}) must be shorter than control_persist ({:?})",
                self.keepalive_interval, self.control_persist
            )));
        }
        for (name, value) in [
            ("ssh_login_timeout", self.ssh_login_timeout),
            ("mount_timeout", self.mount_timeout),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        self.reconnect.backoff.validate()
    }

    /// Locate the `ssh` binary
    pub fn resolve_ssh(&self) -> Result<PathBuf, ConnectError> {
        resolve_binary(self.ssh_path.as_ref(), "ssh")
            .ok_or_else(|| ConnectError::BinaryNotFound("ssh".into()))
    }

    /// Locate the `sshfs` binary
    pub fn resolve_sshfs(&self) -> Result<PathBuf, MountError> {
        resolve_binary(self.sshfs_path.as_ref(), "sshfs")
            .ok_or_else(|| MountError::ClientNotFound("sshfs".into()))
    }

    /// Locate the unmount binary and the flags preceding the mount point
    pub fn resolve_umount(&self) -> Result<(PathBuf, Vec<String>), MountError> {
        let default = default_umount_program();
        let program = resolve_binary(self.umount_path.as_ref(), default)
            .ok_or_else(|| MountError::ClientNotFound(default.into()))?;

        let is_fusermount = program
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("fusermount"))
            .unwrap_or(false);
        let flags = if is_fusermount {
            vec!["-q".to_string(), "-u".to_string()]
        } else {
            vec!["-q".to_string()]
        };
        Ok((program, flags))
    }
}

fn resolve_binary(explicit: Option<&PathBuf>, name: &str) -> Option<PathBuf> {
    match explicit {
        Some(path) if path.components().count() > 1 => Some(path.clone()),
        Some(path) => paths::find_in_path(path),
        None => paths::find_in_path(name),
    }
}

#[cfg(target_os = "linux")]
fn default_umount_program() -> &'static str {
    "fusermount"
}

#[cfg(not(target_os = "linux"))]
fn default_umount_program() -> &'static str {
    "umount"
}

/// Reconnection policy after an unexpected drop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts before giving up
    pub max_retries: u32,

    /// Delay between attempts
    pub backoff: BackoffConfig,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Upper bound for a single delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Growth factor per retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be at least 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        if self.initial > self.max {
            return Err(ConfigError::Invalid(
                "backoff initial delay exceeds the maximum".into(),
            ));
        }
        Ok(())
    }
}
