//! Forward endpoints and `-L`/`-R` specifications
//!
//! Accepted endpoint forms follow OpenSSH:
//!
//! * `port`
//! * `host:port`, `bind_address:port`, `*:port`, `localhost:port`
//! * `[bind_address_v6]:port`
//! * a UNIX domain socket path
//!
//! A full forward specification joins a listen endpoint and a destination
//! endpoint with `:` (e.g. `127.0.0.1:0:remote:80`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ParseError;
use crate::types::format_host;

/// Forward direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardDirection {
    /// Listen locally, connect from the remote side (`-L`)
    Local,
    /// Listen remotely, connect from the local side (`-R`)
    Reverse,
}

impl ForwardDirection {
    /// OpenSSH command line flag
    pub fn flag(&self) -> &'static str {
        match self {
            ForwardDirection::Local => "-L",
            ForwardDirection::Reverse => "-R",
        }
    }

    /// Arrow pointing from listener to destination, for display
    pub fn arrow(&self) -> &'static str {
        match self {
            ForwardDirection::Local => "->",
            ForwardDirection::Reverse => "<-",
        }
    }
}

impl fmt::Display for ForwardDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardDirection::Local => write!(f, "local"),
            ForwardDirection::Reverse => write!(f, "reverse"),
        }
    }
}

/// One side of a forward
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// TCP endpoint, `host` absent for a bare port
    Tcp { host: Option<String>, port: u16 },
    /// UNIX domain socket
    Unix(PathBuf),
}

impl Endpoint {
    /// TCP endpoint with an explicit host
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: Some(host.into()),
            port,
        }
    }

    /// TCP port, `None` for sockets
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp { port, .. } => Some(*port),
            Endpoint::Unix(_) => None,
        }
    }

    /// Host of a TCP endpoint
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp { host, .. } => host.as_deref(),
            Endpoint::Unix(_) => None,
        }
    }

    /// Socket path of a UNIX endpoint
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp { .. } => None,
        }
    }

    /// Whether the port is to be allocated by the listener (port 0)
    pub fn is_allocated(&self) -> bool {
        self.port() == Some(0)
    }

    /// Same endpoint bound to `port`
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Endpoint::Tcp { host, .. } => Endpoint::Tcp {
                host: host.clone(),
                port,
            },
            Endpoint::Unix(path) => Endpoint::Unix(path.clone()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host: None, port } => write!(f, "{}", port),
            Endpoint::Tcp {
                host: Some(host),
                port,
            } => write!(f, "{}:{}", format_host(host), port),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::InvalidForward(s.to_string()));
        }
        if s.contains('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Endpoint::Tcp {
                host: None,
                port: parse_port(s)?,
            });
        }

        let Some((host, port)) = s.rsplit_once(':') else {
            // neither a port nor host:port, a relative socket path
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        };

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| ParseError::InvalidHost(host.to_string()))?,
            None => host,
        };
        validate_host(host)?;

        Ok(Endpoint::Tcp {
            host: Some(host.to_string()),
            port: parse_port(port)?,
        })
    }
}

fn parse_port(s: &str) -> Result<u16, ParseError> {
    s.parse::<u16>()
        .map_err(|_| ParseError::InvalidPort(s.to_string()))
}

/// Accept OpenSSH bind keywords, IP addresses and RFC 1123 host names
fn validate_host(host: &str) -> Result<(), ParseError> {
    if host == "*" || host.eq_ignore_ascii_case("localhost") || host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if is_valid_hostname(host) {
        Ok(())
    } else {
        Err(ParseError::InvalidHost(host.to_string()))
    }
}

fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

/// A forward exactly as requested by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub direction: ForwardDirection,
    /// Side that listens (local for `-L`, remote for `-R`)
    pub listen: Endpoint,
    /// Side connections are relayed to
    pub destination: Endpoint,
}

impl ForwardRequest {
    pub fn new(direction: ForwardDirection, listen: Endpoint, destination: Endpoint) -> Self {
        Self {
            direction,
            listen,
            destination,
        }
    }

    /// Parse a combined `listen:destination` specification
    pub fn parse(direction: ForwardDirection, spec: &str) -> Result<Self, ParseError> {
        let (listen, destination) = split_forward_spec(spec)?;
        Ok(Self::new(direction, listen.parse()?, destination.parse()?))
    }

    /// Argument following `-L`/`-R` in a mux request
    pub fn spec(&self) -> String {
        format!("{}:{}", self.listen, self.destination)
    }
}

impl fmt::Display for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.listen,
            self.direction.arrow(),
            self.destination
        )
    }
}

/// Split a forward specification on the `:` separating both endpoints
fn split_forward_spec(spec: &str) -> Result<(&str, &str), ParseError> {
    // byte offsets of ':' outside of square brackets
    let mut depth = 0usize;
    let mut separators = Vec::new();
    for (idx, ch) in spec.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => separators.push(idx),
            _ => {}
        }
    }

    let listen_tokens = match separators.len() {
        1 => 1,
        2 => {
            let last = &spec[separators[1] + 1..];
            if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) {
                1
            } else {
                2
            }
        }
        3 => 2,
        _ => return Err(ParseError::InvalidForward(spec.to_string())),
    };

    let split_at = separators[listen_tokens - 1];
    let (listen, destination) = (&spec[..split_at], &spec[split_at + 1..]);
    if listen.is_empty() || destination.is_empty() {
        return Err(ParseError::InvalidForward(spec.to_string()));
    }
    Ok((listen, destination))
}
