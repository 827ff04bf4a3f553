//! Core error types for sshubl

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the sshubl ecosystem
#[derive(Error, Debug)]
pub enum SshublError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Control channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Control channel teardown error
    #[error("Close error: {0}")]
    Close(#[from] CloseError),

    /// Forward error
    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    /// Mount error
    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while establishing a master connection
#[derive(Error, Debug)]
pub enum ConnectError {
    /// A required program could not be located
    #[error("{0} has not been found")]
    BinaryNotFound(String),

    /// The derived control socket path does not fit in `sun_path`
    #[error("control socket path {path:?} is too long ({len} bytes, at most {max} allowed)")]
    SocketPathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Authentication ultimately failed
    #[error("Authentication failed: {0}")]
    Auth(AuthError),

    /// Connection attempt timed out
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Remote could not be reached
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// Connection attempt was cancelled
    #[error("Connection cancelled")]
    Cancelled,

    /// I/O error while spawning or supervising the master
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AuthError> for ConnectError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Cancelled => ConnectError::Cancelled,
            AuthError::Unreachable(reason) => ConnectError::Unreachable(reason),
            AuthError::Timeout(after) => ConnectError::Timeout(after),
            AuthError::Io(e) => ConnectError::Io(e),
            other => ConnectError::Auth(other),
        }
    }
}

/// Errors raised by authentication attempts
#[derive(Error, Debug)]
pub enum AuthError {
    /// The user cancelled a prompt or the attempt was aborted
    #[error("Authentication cancelled")]
    Cancelled,

    /// Server refused the supplied credentials
    #[error("Wrong credentials: {0}")]
    WrongCredentials(String),

    /// Host key was refused by the user or failed verification
    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    /// Remote could not be reached (transient)
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// No progress within the login timeout (transient)
    #[error("Authentication timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error on the connection process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    /// Whether this failure is a connectivity problem worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Unreachable(_) | AuthError::Timeout(_))
    }
}

/// Errors raised by multiplexed requests against a control socket
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The master connection is not alive
    #[error("Control channel is not connected")]
    NotConnected,

    /// The master declined the request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The request client did not finish in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The request process could not be spawned
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while closing a control channel
#[derive(Error, Debug)]
pub enum CloseError {
    /// The control socket file could not be removed
    #[error("Failed to remove control socket {path:?}: {source}")]
    SocketRemoval {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Forward-related errors
#[derive(Error, Debug)]
pub enum ForwardError {
    /// Listen address is already bound
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// Control channel is down
    #[error("Control channel is down")]
    ChannelDown,

    /// Request or port allocation did not finish in time
    #[error("Forward timed out after {0:?}")]
    Timeout(Duration),

    /// No such forward
    #[error("Forward not found: {0}")]
    NotFound(String),

    /// Master declined the request
    #[error("Forward rejected: {0}")]
    Rejected(String),

    /// Malformed forward endpoint
    #[error("Invalid forward endpoint: {0}")]
    InvalidEndpoint(#[from] ParseError),

    /// I/O error while issuing the request
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChannelError> for ForwardError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotConnected => ForwardError::ChannelDown,
            ChannelError::Rejected(reason) => {
                if reason.contains("already in use")
                    || reason.contains("remote port forwarding failed for listen")
                {
                    ForwardError::AddressInUse(reason)
                } else {
                    ForwardError::Rejected(reason)
                }
            }
            ChannelError::Timeout(after) => ForwardError::Timeout(after),
            ChannelError::Io(e) => ForwardError::Io(e),
        }
    }
}

/// Mount-related errors
#[derive(Error, Debug)]
pub enum MountError {
    /// Mount client exited unsuccessfully
    #[error("Mount client failed (status {status:?}): {stderr}")]
    ClientFailed { status: Option<i32>, stderr: String },

    /// Local path is already a mount point
    #[error("{0:?} is already a mount point")]
    AlreadyMounted(PathBuf),

    /// Mount point is in use
    #[error("{0:?} is busy")]
    Busy(PathBuf),

    /// No such mount
    #[error("Mount not found: {0}")]
    NotFound(String),

    /// Mount or unmount program could not be located
    #[error("{0} has not been found")]
    ClientNotFound(String),

    /// Control channel is down
    #[error("Control channel is down")]
    ChannelDown,

    /// Mount or unmount client did not finish in time
    #[error("Mount client timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse errors for targets and forward endpoints
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Host part missing
    #[error("missing host in {0:?}")]
    MissingHost(String),

    /// Port is not a valid number
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// Host is neither a hostname nor an IP address
    #[error("invalid host {0:?}")]
    InvalidHost(String),

    /// Forward specification could not be split into two endpoints
    #[error("invalid forward specification {0:?}")]
    InvalidForward(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
