//! sshubl-orchestrator: multiplexed SSH sessions and their resources
//!
//! A [`SessionManager`] keeps one [`Session`] per target. Each session owns
//! an OpenSSH control master ([`ControlChannel`]) and the port forwards,
//! sshfs mounts and interactive shells multiplexed over it. Sessions watch
//! their master, reconnect after unexpected drops and release every OS-level
//! artifact when torn down.

pub mod auth;
pub mod backend;
pub mod channel;
pub mod events;
pub mod forward;
pub mod mount;
pub mod reconnect;
pub mod session;
pub mod system;

pub use auth::LoginOptions;
pub use backend::Backend;
pub use channel::{ControlChannel, TerminalHandle};
pub use events::SessionEvent;
pub use forward::ForwardRegistry;
pub use mount::MountRegistry;
pub use reconnect::{ExponentialBackoff, ReconnectOutcome, ReconnectionController};
pub use session::{Session, SessionManager, TeardownFailure, TeardownReport, TeardownResource};
