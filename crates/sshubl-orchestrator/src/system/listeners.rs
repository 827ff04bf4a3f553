//! Listening sockets of a process, read from procfs

use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use sshubl_core::traits::ListenerQuery;

/// `st` column value of a listening socket
const TCP_LISTEN: &str = "0A";

/// Queries `/proc/<pid>/fd` and `/proc/<pid>/net/tcp{,6}`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcListenerQuery;

#[async_trait]
impl ListenerQuery for ProcListenerQuery {
    async fn listeners(&self, pid: u32) -> io::Result<Vec<SocketAddr>> {
        tokio::task::spawn_blocking(move || read_listeners(pid))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

#[cfg(target_os = "linux")]
fn read_listeners(pid: u32) -> io::Result<Vec<SocketAddr>> {
    let proc_dir = std::path::PathBuf::from(format!("/proc/{}", pid));

    let mut inodes = HashSet::new();
    for entry in std::fs::read_dir(proc_dir.join("fd"))? {
        let Ok(target) = std::fs::read_link(entry?.path()) else {
            continue;
        };
        if let Some(inode) = socket_inode(&target.to_string_lossy()) {
            inodes.insert(inode);
        }
    }

    let mut addrs = Vec::new();
    for table in ["tcp", "tcp6"] {
        match std::fs::read_to_string(proc_dir.join("net").join(table)) {
            Ok(content) => addrs.extend(parse_tcp_table(&content, &inodes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(addrs)
}

#[cfg(not(target_os = "linux"))]
fn read_listeners(_pid: u32) -> io::Result<Vec<SocketAddr>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "listener lookup requires procfs",
    ))
}

/// Inode of a `socket:[12345]` fd link
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Listening addresses of a `/proc/net/tcp` style table owned by `inodes`
fn parse_tcp_table(content: &str, inodes: &HashSet<u64>) -> Vec<SocketAddr> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let inode: u64 = fields[9].parse().ok()?;
            if !inodes.contains(&inode) {
                return None;
            }
            parse_hex_addr(fields[1])
        })
        .collect()
}

/// Decode `0100007F:1F90` (IPv4) or a 32 digit IPv6 address with port
///
/// Addresses are stored as host-order 32-bit words.
fn parse_hex_addr(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            Some(SocketAddr::new(Ipv4Addr::from(word.to_ne_bytes()).into(), port))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            Some(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        _ => None,
    }
}
