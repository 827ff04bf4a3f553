//! Session events broadcast to observers

use serde::Serialize;

use sshubl_core::{Forward, ForwardId, Mount, MountId, SessionState, Target};

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened to a session or one of its resources
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        target: Target,
        state: SessionState,
    },
    ForwardAdded {
        target: Target,
        forward: Forward,
    },
    ForwardCancelled {
        target: Target,
        id: ForwardId,
    },
    MountAdded {
        target: Target,
        mount: Mount,
    },
    MountRemoved {
        target: Target,
        id: MountId,
    },
    ReconnectAttempt {
        target: Target,
        attempt: u32,
        max_attempts: u32,
    },
    /// The session is gone, its resources were left in place
    ResourcesOrphaned {
        target: Target,
        forwards: usize,
        mounts: usize,
    },
}

impl SessionEvent {
    /// Target the event relates to
    pub fn target(&self) -> &Target {
        match self {
            SessionEvent::StateChanged { target, .. }
            | SessionEvent::ForwardAdded { target, .. }
            | SessionEvent::ForwardCancelled { target, .. }
            | SessionEvent::MountAdded { target, .. }
            | SessionEvent::MountRemoved { target, .. }
            | SessionEvent::ReconnectAttempt { target, .. }
            | SessionEvent::ResourcesOrphaned { target, .. } => target,
        }
    }
}
