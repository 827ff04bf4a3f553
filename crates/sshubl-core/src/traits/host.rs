//! Host queries

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

/// Answers whether a directory is currently a mount point
pub trait MountTable: Send + Sync {
    fn is_mount_point(&self, path: &Path) -> bool;

    /// Pid of the mount client serving `mount_point`, when it can be found
    fn client_pid(&self, _mount_point: &Path) -> Option<u32> {
        None
    }
}

/// Lists the TCP sockets a process is listening on
#[async_trait]
pub trait ListenerQuery: Send + Sync {
    async fn listeners(&self, pid: u32) -> io::Result<Vec<SocketAddr>>;
}
