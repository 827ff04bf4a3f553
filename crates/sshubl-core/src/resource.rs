//! Resources layered on a session: forwards and mounts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::endpoint::{Endpoint, ForwardRequest};

/// Forward identifier, unique within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForwardId(pub u64);

impl fmt::Display for ForwardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fwd-{}", self.0)
    }
}

/// Forward lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    /// Requested, allocated port not known yet
    Pending,
    /// Established
    Ready,
    /// The session backing it is gone
    Orphaned,
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardStatus::Pending => write!(f, "pending"),
            ForwardStatus::Ready => write!(f, "ready"),
            ForwardStatus::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// A forward tracked by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    pub id: ForwardId,
    /// The request exactly as issued, used for cancellation and restore
    pub request: ForwardRequest,
    /// Listen endpoint with the allocated port filled in once known
    pub resolved_listen: Endpoint,
    pub status: ForwardStatus,
    /// Creation time (Unix milliseconds)
    pub created_at: u64,
}

impl Forward {
    /// Whether the listen port was left to the listener
    pub fn is_allocated(&self) -> bool {
        self.request.listen.is_allocated()
    }

    /// Listen port, once resolved
    pub fn resolved_port(&self) -> Option<u16> {
        self.resolved_listen.port().filter(|port| *port != 0)
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.resolved_listen,
            self.request.direction.arrow(),
            self.request.destination
        )
    }
}

/// Mount identifier, unique within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountId(pub u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mnt-{}", self.0)
    }
}

/// Mount lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountStatus {
    Mounting,
    Mounted,
    Unmounting,
    /// The OS mount disappeared without an unmount request
    Detached,
    /// The session backing it is gone
    Orphaned,
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountStatus::Mounting => "mounting",
            MountStatus::Mounted => "mounted",
            MountStatus::Unmounting => "unmounting",
            MountStatus::Detached => "detached",
            MountStatus::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

/// Mount client options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Dereference symbolic links on the remote side
    pub follow_symlinks: bool,
    /// Extra `-o` options passed verbatim
    pub extra: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            follow_symlinks: true,
            extra: Vec::new(),
        }
    }
}

/// A remote filesystem mount tracked by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub id: MountId,
    pub remote_path: PathBuf,
    pub local_path: PathBuf,
    pub options: MountOptions,
    /// Mount client pid, when it was observed
    pub pid: Option<u32>,
    pub status: MountStatus,
    /// Whether the local directory was created by the registry
    pub created_dir: bool,
    /// Creation time (Unix milliseconds)
    pub created_at: u64,
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}",
            self.remote_path.display(),
            self.local_path.display()
        )
    }
}
