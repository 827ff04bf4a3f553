//! Filesystem locations: cache directories, control sockets, binaries

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::ConnectError;
use crate::types::Target;

/// Bytes OpenSSH appends to a control path for its temporary socket
pub const CONTROL_PATH_TEMP_SUFFIX: usize = 17;

/// Size of `sockaddr_un.sun_path`, terminating NUL included
#[cfg(target_os = "linux")]
pub const SUN_PATH_MAX: usize = 108;

/// Size of `sockaddr_un.sun_path`, terminating NUL included
#[cfg(not(target_os = "linux"))]
pub const SUN_PATH_MAX: usize = 104;

/// Hex characters of the target digest used in file names (128 bits)
const DIGEST_LEN: usize = 32;

/// Default cache directory (`~/.cache/sshubl` on Linux)
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sshubl")
}

/// Stable, filesystem-safe digest of a target
///
/// Fields are NUL-separated so distinct targets never hash the same input.
pub fn target_digest(target: &Target) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.user.as_bytes());
    hasher.update([0u8]);
    hasher.update(target.host.as_bytes());
    hasher.update([0u8]);
    hasher.update(target.port.to_be_bytes());
    let digest = hasher.finalize();
    let mut hex = hex::encode(digest);
    hex.truncate(DIGEST_LEN);
    hex
}

/// Control socket path of `target` under `sockets_dir`
///
/// Fails instead of truncating when OpenSSH would be unable to bind the
/// socket (it binds `<path>.<random>` before renaming it into place).
pub fn control_socket_path(sockets_dir: &Path, target: &Target) -> Result<PathBuf, ConnectError> {
    let path = sockets_dir.join(target_digest(target));
    let len = path.as_os_str().len();
    let max = SUN_PATH_MAX - 1 - CONTROL_PATH_TEMP_SUFFIX;
    if len > max {
        return Err(ConnectError::SocketPathTooLong { path, len, max });
    }
    Ok(path)
}

/// Directory holding generated mount points of `target`
pub fn session_mounts_dir(mounts_dir: &Path, target: &Target) -> PathBuf {
    mounts_dir.join(target_digest(target))
}

/// Search `PATH` for an executable
///
/// Paths with more than one component are only checked for existence.
pub fn find_in_path(program: impl AsRef<Path>) -> Option<PathBuf> {
    let program = program.as_ref();
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Create a directory (and parents) restricted to the current user
pub fn ensure_private_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}
