//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ParseError;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection target: the identity of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    /// Host name or IP address (IPv6 without brackets)
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub user: String,
}

impl Target {
    /// Create a new target
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// Host formatted for display (IPv6 enclosed in brackets and compressed)
    pub fn display_host(&self) -> String {
        format_host(&self.host)
    }

    /// Whether the host designates the local machine
    pub fn is_loopback(&self) -> bool {
        if self.host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.display_host(), self.port)
    }
}

impl FromStr for Target {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<ConnectionString>().map(|c| c.target)
    }
}

/// Enclose IPv6 addresses in square brackets, preferring their compressed form
pub fn format_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => host.to_string(),
    }
}

/// A parsed `[user[:password]@]host[:port]` connection string
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Connection target
    pub target: Target,
    /// Password embedded in the string, used to answer the first password prompt
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("target", &self.target)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FromStr for ConnectionString {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().trim_start_matches("ssh://");

        // user info ends at the last '@', passwords may contain '@'
        let (userinfo, hostport) = match raw.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, raw),
        };

        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (user.to_string(), Some(password.to_string())),
                None => (info.to_string(), None),
            },
            None => (String::new(), None),
        };
        let user = if user.is_empty() {
            whoami::username()
        } else {
            user
        };

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(ParseError::MissingHost(s.to_string()));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| ParseError::InvalidPort(p.to_string()))?,
            None => DEFAULT_SSH_PORT,
        };

        Ok(Self {
            target: Target::new(host, port, user),
            password,
        })
    }
}

impl From<Target> for ConnectionString {
    fn from(target: Target) -> Self {
        Self {
            target,
            password: None,
        }
    }
}

/// Split `host[:port]`, `[v6][:port]` or a bare IPv6 address
fn split_host_port(s: &str) -> Result<(&str, Option<&str>), ParseError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::InvalidHost(s.to_string()))?;
        return match after {
            "" => Ok((host, None)),
            _ => match after.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(ParseError::InvalidHost(s.to_string())),
            },
        };
    }

    match s.matches(':').count() {
        0 => Ok((s, None)),
        1 => {
            let (host, port) = s.split_once(':').unwrap_or((s, ""));
            Ok((host, Some(port)))
        }
        // bare IPv6 address without port
        _ => Ok((s, None)),
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// First connection attempt in progress
    Connecting,
    /// Master connection is up
    Connected,
    /// Master dropped, retry loop running
    Reconnecting,
    /// Teardown in progress
    Disconnecting,
    /// Terminal state
    Disconnected,
}

impl SessionState {
    /// Whether a session in this state counts as live for deduplication
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Disconnecting => write!(f, "disconnecting"),
            SessionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Terminal dimensions for pseudo-terminals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}
