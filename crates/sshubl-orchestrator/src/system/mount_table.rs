//! Mount point detection

use std::path::Path;

use sshubl_core::traits::MountTable;

/// Detects mount points by comparing a directory's device with its parent's
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMountTable;

impl MountTable for SystemMountTable {
    #[cfg(unix)]
    fn is_mount_point(&self, path: &Path) -> bool {
        use std::os::unix::fs::MetadataExt;

        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            // a FUSE mount whose client died is still mounted
            Err(e) => return e.raw_os_error() == Some(libc::ENOTCONN),
        };
        if !meta.is_dir() {
            return false;
        }
        let parent = match std::fs::metadata(path.join("..")) {
            Ok(parent) => parent,
            Err(_) => return false,
        };
        meta.dev() != parent.dev() || meta.ino() == parent.ino()
    }

    #[cfg(not(unix))]
    fn is_mount_point(&self, _path: &Path) -> bool {
        false
    }

    /// Scans `/proc/*/cmdline` for the sshfs daemon of `mount_point`
    #[cfg(target_os = "linux")]
    fn client_pid(&self, mount_point: &Path) -> Option<u32> {
        use std::os::unix::ffi::OsStrExt;

        let wanted = mount_point.as_os_str().as_bytes();
        std::fs::read_dir("/proc").ok()?.flatten().find_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let cmdline = std::fs::read(entry.path().join("cmdline")).ok()?;
            is_mount_client(&cmdline, wanted).then_some(pid)
        })
    }
}

/// Whether a NUL-separated command line runs sshfs on `mount_point`
#[cfg(any(target_os = "linux", test))]
fn is_mount_client(cmdline: &[u8], mount_point: &[u8]) -> bool {
    let mut args = cmdline.split(|b| *b == 0).filter(|arg| !arg.is_empty());
    let Some(program) = args.next() else {
        return false;
    };
    let name = program.rsplit(|b| *b == b'/').next().unwrap_or(program);
    name.starts_with(b"sshfs") && args.any(|arg| arg == mount_point)
}
