//! Remote filesystems mounted through a control channel

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use sshubl_core::config::Settings;
use sshubl_core::error::MountError;
use sshubl_core::time::current_time_millis;
use sshubl_core::traits::{CommandRunner, Invocation, MountTable};
use sshubl_core::{Mount, MountId, MountOptions, MountStatus};

use crate::channel::{ControlChannel, FAKE_DESTINATION};

/// Tracks the sshfs mounts of one session
pub struct MountRegistry {
    channel: Arc<ControlChannel>,
    runner: Arc<dyn CommandRunner>,
    mount_table: Arc<dyn MountTable>,
    settings: Arc<Settings>,
    /// Parent of generated mount points
    base_dir: PathBuf,
    mounts: RwLock<BTreeMap<MountId, Mount>>,
    next_id: AtomicU64,
}

impl MountRegistry {
    pub fn new(
        channel: Arc<ControlChannel>,
        runner: Arc<dyn CommandRunner>,
        mount_table: Arc<dyn MountTable>,
        settings: Arc<Settings>,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            channel,
            runner,
            mount_table,
            settings,
            base_dir,
            mounts: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<MountId, Mount>> {
        self.mounts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<MountId, Mount>> {
        self.mounts.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Mount `remote_path` at `local_path`, or at a generated mount point
    pub async fn mount(
        &self,
        remote_path: impl Into<PathBuf>,
        local_path: Option<PathBuf>,
        options: MountOptions,
    ) -> Result<Mount, MountError> {
        let remote_path = remote_path.into();
        let sshfs = self.settings.resolve_sshfs()?;
        if !self.channel.is_alive().await {
            return Err(MountError::ChannelDown);
        }

        let local_path = local_path.unwrap_or_else(|| self.generated_mount_point(&remote_path));
        let taken = self.read().values().any(|m| {
            m.local_path == local_path
                && matches!(m.status, MountStatus::Mounting | MountStatus::Mounted)
        });
        if taken || self.mount_table.is_mount_point(&local_path) {
            return Err(MountError::AlreadyMounted(local_path));
        }

        let created_dir = !local_path.exists();
        std::fs::create_dir_all(&local_path)?;

        let id = MountId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.write().insert(
            id,
            Mount {
                id,
                remote_path: remote_path.clone(),
                local_path: local_path.clone(),
                options: options.clone(),
                pid: None,
                status: MountStatus::Mounting,
                created_dir,
                created_at: current_time_millis(),
            },
        );

        match self
            .run_client(&sshfs, &remote_path, &local_path, &options)
            .await
        {
            Ok(()) => {
                let pid = self.mount_table.client_pid(&local_path);
                let mut mounts = self.write();
                let mount = mounts
                    .get_mut(&id)
                    .ok_or_else(|| MountError::NotFound(id.to_string()))?;
                mount.status = MountStatus::Mounted;
                mount.pid = pid;
                tracing::info!("Mounted {}", mount);
                Ok(mount.clone())
            }
            Err(e) => {
                self.write().remove(&id);
                if created_dir {
                    remove_mount_dir(&local_path);
                }
                tracing::error!("Could not mount {}: {}", remote_path.display(), e);
                Err(e)
            }
        }
    }

    /// `<mounts_path>/<session>/<remote name>_<uuid>`
    fn generated_mount_point(&self, remote_path: &Path) -> PathBuf {
        let name = remote_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        self.base_dir.join(format!("{}_{}", name, Uuid::new_v4()))
    }

    async fn run_client(
        &self,
        sshfs: &Path,
        remote_path: &Path,
        local_path: &Path,
        options: &MountOptions,
    ) -> Result<(), MountError> {
        let (uid, gid) = current_ids();
        let mut invocation = Invocation::new(sshfs)
            .args(self.channel.socket_options())
            .arg("-odefault_permissions");
        if options.follow_symlinks {
            invocation = invocation.arg("-ofollow_symlinks");
        }
        invocation = invocation
            .args(["-oidmap=user".to_string(), format!("-ouid={}", uid), format!("-ogid={}", gid)])
            .args(options.extra.iter().map(|opt| format!("-o{}", opt)))
            .arg(format!("{}:{}", FAKE_DESTINATION, remote_path.display()))
            .arg(local_path.display().to_string());
        tracing::debug!("Mount client: {}", invocation);

        let timeout = self.settings.mount_timeout;
        let output = tokio::time::timeout(timeout, self.runner.run(&invocation))
            .await
            .map_err(|_| MountError::Timeout(timeout))??;

        if !output.success() {
            return Err(MountError::ClientFailed {
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        if !self.mount_table.is_mount_point(local_path) {
            return Err(MountError::ClientFailed {
                status: output.status,
                stderr: format!("{} is not a mount point after mounting", local_path.display()),
            });
        }
        Ok(())
    }

    /// Unmount and forget a mount, removing the directory it created
    pub async fn unmount(&self, id: MountId) -> Result<(), MountError> {
        let previous = {
            let mut mounts = self.write();
            let mount = mounts
                .get_mut(&id)
                .ok_or_else(|| MountError::NotFound(id.to_string()))?;
            let previous = mount.status;
            mount.status = MountStatus::Unmounting;
            (previous, mount.clone())
        };
        let (previous_status, mount) = previous;

        if let Err(e) = self.release(&mount.local_path).await {
            if let Some(entry) = self.write().get_mut(&id) {
                entry.status = previous_status;
            }
            tracing::error!("Could not unmount {}: {}", mount.local_path.display(), e);
            return Err(e);
        }

        self.write().remove(&id);
        if mount.created_dir {
            remove_mount_dir(&mount.local_path);
        }
        tracing::info!("Unmounted {}", mount);
        Ok(())
    }

    /// Run the unmount client against `local_path` if it is mounted
    async fn release(&self, local_path: &Path) -> Result<(), MountError> {
        if !self.mount_table.is_mount_point(local_path) {
            tracing::debug!("{} is not mounted anymore", local_path.display());
            return Ok(());
        }

        let (program, flags) = self.settings.resolve_umount()?;
        let invocation = Invocation::new(program)
            .args(flags)
            .arg(local_path.display().to_string());
        tracing::debug!("Unmount client: {}", invocation);

        let timeout = self.settings.mount_timeout;
        let output = tokio::time::timeout(timeout, self.runner.run(&invocation))
            .await
            .map_err(|_| MountError::Timeout(timeout))??;
        if output.success() {
            return Ok(());
        }

        if output.stderr.to_ascii_lowercase().contains("busy") {
            return Err(MountError::Busy(local_path.to_path_buf()));
        }
        if !self.mount_table.is_mount_point(local_path) {
            return Ok(());
        }
        Err(MountError::ClientFailed {
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }

    /// Downgrade mounts whose OS mount vanished, returning a snapshot
    pub fn reconcile(&self) -> Vec<Mount> {
        let mut mounts = self.write();
        for mount in mounts.values_mut() {
            if mount.status == MountStatus::Mounted
                && !self.mount_table.is_mount_point(&mount.local_path)
            {
                tracing::warn!("{} is no longer mounted", mount);
                mount.status = MountStatus::Detached;
                mount.pid = None;
            }
        }
        mounts.values().cloned().collect()
    }

    /// Reconciled snapshot in creation order
    pub fn list(&self) -> Vec<Mount> {
        self.reconcile()
    }

    pub fn get(&self, id: MountId) -> Option<Mount> {
        self.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Identifiers in creation order
    pub fn ids(&self) -> Vec<MountId> {
        self.read().keys().copied().collect()
    }

    /// Mark every mount orphaned, returning how many there were
    pub(crate) fn mark_orphaned(&self) -> usize {
        let mut mounts = self.write();
        for mount in mounts.values_mut() {
            mount.status = MountStatus::Orphaned;
        }
        mounts.len()
    }

    /// Mount everything again at its previous mount point
    ///
    /// Stale mounts left by the dead master are released first. Returns
    /// the number of mounts that could not be restored.
    pub(crate) async fn restore(&self) -> usize {
        let sshfs = match self.settings.resolve_sshfs() {
            Ok(sshfs) => sshfs,
            Err(e) => {
                tracing::warn!("Cannot restore mounts: {}", e);
                return self.mark_orphaned();
            }
        };

        let mut failed = 0;
        for mount in self.list() {
            if let Err(e) = self.release(&mount.local_path).await {
                tracing::debug!("Releasing stale mount {} failed: {}", mount, e);
            }
            let result = self
                .run_client(&sshfs, &mount.remote_path, &mount.local_path, &mount.options)
                .await;
            let pid = match result {
                Ok(()) => self.mount_table.client_pid(&mount.local_path),
                Err(_) => None,
            };

            let mut mounts = self.write();
            let Some(entry) = mounts.get_mut(&mount.id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    entry.status = MountStatus::Mounted;
                    entry.pid = pid;
                    tracing::info!("Restored mount {}", entry);
                }
                Err(e) => {
                    entry.status = MountStatus::Orphaned;
                    entry.pid = None;
                    failed += 1;
                    tracing::warn!("Could not restore mount {}: {}", mount, e);
                }
            }
        }
        failed
    }

    /// Remove the session's mount base directory when it is empty
    pub(crate) fn remove_base_dir(&self) {
        match std::fs::remove_dir(&self.base_dir) {
            Ok(()) => tracing::debug!("Removed {}", self.base_dir.display()),
            Err(e) => tracing::debug!("Keeping {}: {}", self.base_dir.display(), e),
        }
    }
}

fn remove_mount_dir(path: &Path) {
    match std::fs::remove_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Couldn't remove mount point {}: {}", path.display(), e),
    }
}

#[cfg(unix)]
fn current_ids() -> (u32, u32) {
    // SAFETY: getuid and getgid have no preconditions and cannot fail
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
fn current_ids() -> (u32, u32) {
    (0, 0)
}
