//! Collaborator traits
//!
//! The orchestrator reaches the operating system and the user only through
//! these traits, so every process invocation can be observed by test doubles.

mod host;
mod process;
mod prompt;

pub use host::{ListenerQuery, MountTable};
pub use process::{CommandOutput, CommandRunner, Invocation, PtyProcess};
pub use prompt::{NonInteractive, PromptCancelled, PromptHandler, PromptKind, PromptRequest, PromptResponse};
