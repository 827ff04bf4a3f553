//! User prompts

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::types::Target;

/// What the user is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    /// Account password
    Password,
    /// Private key passphrase
    Passphrase,
    /// Trust an unknown host key
    HostKeyConfirmation,
    /// Keep reconnecting; answering `Reject` or cancelling gives up
    CancelConfirmation,
}

/// A question for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub kind: PromptKind,
    pub target: Target,
    /// Text shown by the connection process, or a description of the attempt
    pub message: String,
}

/// The user's answer
#[derive(Clone, PartialEq, Eq)]
pub enum PromptResponse {
    Secret(String),
    Accept,
    Reject,
}

impl fmt::Debug for PromptResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptResponse::Secret(_) => write!(f, "Secret(<redacted>)"),
            PromptResponse::Accept => write!(f, "Accept"),
            PromptResponse::Reject => write!(f, "Reject"),
        }
    }
}

/// The user dismissed the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("prompt cancelled")]
pub struct PromptCancelled;

/// Surfaces prompts to the user
///
/// A pending `CancelConfirmation` prompt is dropped once the reconnection
/// attempt it accompanies finishes.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, PromptCancelled>;
}

/// Handler for unattended use: cancels every credential prompt and never
/// interrupts reconnection
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

#[async_trait]
impl PromptHandler for NonInteractive {
    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, PromptCancelled> {
        match request.kind {
            PromptKind::CancelConfirmation => std::future::pending().await,
            _ => Err(PromptCancelled),
        }
    }
}
