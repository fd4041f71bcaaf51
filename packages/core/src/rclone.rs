//! rclone executable resolution and mount command construction.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::error::{RcloneNotFoundSnafu, Result};
use crate::target::MountTarget;

/// Default executable name looked up on PATH.
pub const DEFAULT_RCLONE_BINARY: &str = "rclone";

/// Cache mode passed to every mount.
pub const VFS_CACHE_MODE: &str = "writes";

/// Resolves the rclone executable.
///
/// `binary` may be a bare name (looked up on PATH) or a path. Resolution is
/// repeated on every call so a binary removed after startup is noticed.
pub fn locate(binary: &str) -> Result<PathBuf> {
    which::which(binary).context(RcloneNotFoundSnafu { name: binary })
}

/// Arguments for `rclone mount`, excluding the executable itself.
pub fn mount_args(remote: &str, target: &MountTarget, config_path: &Path) -> Vec<OsString> {
    vec![
        "mount".into(),
        remote.into(),
        target.as_arg().into(),
        "--config".into(),
        config_path.as_os_str().to_owned(),
        "--vfs-cache-mode".into(),
        VFS_CACHE_MODE.into(),
    ]
}

/// Executable file name used when stopping mounts by image name.
pub fn image_name(binary: &str) -> String {
    // Split on both separators so Windows paths work on any host.
    let name = binary
        .rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_RCLONE_BINARY)
        .to_string();

    if name.to_ascii_lowercase().ends_with(".exe") {
        name
    } else {
        format!("{}.exe", name)
    }
}
