//! sshubl-core: Core abstractions and configuration for sshubl
//!
//! This crate provides the domain types, error taxonomy, settings and the
//! collaborator traits used by the orchestrator and the CLI.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod paths;
pub mod resource;
pub mod time;
pub mod traits;
pub mod types;

pub use config::Settings;
pub use endpoint::{Endpoint, ForwardDirection, ForwardRequest};
pub use error::SshublError;
pub use resource::{Forward, ForwardId, ForwardStatus, Mount, MountId, MountOptions, MountStatus};
pub use types::{ConnectionString, SessionState, Target, TerminalSize};
