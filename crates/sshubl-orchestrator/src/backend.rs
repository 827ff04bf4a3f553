//! Collaborators a session talks to

use std::sync::Arc;

use sshubl_core::traits::{CommandRunner, ListenerQuery, MountTable};

use crate::system::{ProcListenerQuery, SystemMountTable, SystemRunner};

/// Process runner and host queries shared by every session
#[derive(Clone)]
pub struct Backend {
    pub runner: Arc<dyn CommandRunner>,
    pub mount_table: Arc<dyn MountTable>,
    pub listeners: Arc<dyn ListenerQuery>,
}

impl Backend {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        mount_table: Arc<dyn MountTable>,
        listeners: Arc<dyn ListenerQuery>,
    ) -> Self {
        Self {
            runner,
            mount_table,
            listeners,
        }
    }

    /// Real processes, mount points and procfs
    pub fn system() -> Self {
        Self::new(
            Arc::new(SystemRunner),
            Arc::new(SystemMountTable),
            Arc::new(ProcListenerQuery),
        )
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
