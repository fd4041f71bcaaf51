//! Mount process control.
//!
//! Launching detached `rclone mount` processes, stopping them with a
//! graceful-then-forced escalation, and the best-effort OS commands used for
//! mounts this process did not launch.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use snafu::ResultExt;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, IoResultExt, MountSpawnSnafu, ProcessWaitSnafu, Result};
use crate::target::MountTarget;

/// How a process-owned mount ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after the polite request.
    Graceful,
    /// Had to be killed.
    Forced,
}

/// Spawns a process detached from our console and session.
///
/// All standard streams are discarded so a long-running mount never blocks
/// on a full pipe.
pub fn spawn_detached(program: &Path, args: &[OsString]) -> Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session: no controlling terminal, so neither terminal signals
        // nor a hangup when our session ends reach the mount.
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }

    let child = cmd.spawn().context(MountSpawnSnafu {
        command: program.display().to_string(),
    })?;

    debug!(pid = child.id(), program = %program.display(), "spawned detached process");
    Ok(child)
}

/// Stops a child: polite request, bounded wait, then kill.
pub fn terminate(child: &mut Child, grace: Duration) -> Result<Termination> {
    let pid = child.id();

    // Already gone?
    if child.try_wait().context(ProcessWaitSnafu { pid })?.is_some() {
        return Ok(Termination::Graceful);
    }

    match request_stop(child) {
        Ok(()) => {
            if child
                .wait_timeout(grace)
                .context(ProcessWaitSnafu { pid })?
                .is_some()
            {
                return Ok(Termination::Graceful);
            }
            debug!(pid, "process ignored stop request, killing");
        }
        Err(e) => warn!(pid, error = %e, "stop request failed, killing"),
    }

    child.kill().map_err(|e| Error::ProcessSignal {
        pid,
        message: e.to_string(),
    })?;
    child.wait().context(ProcessWaitSnafu { pid })?;

    Ok(Termination::Forced)
}

#[cfg(unix)]
fn request_stop(child: &Child) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = child.id();
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| Error::ProcessSignal {
        pid,
        message: e.to_string(),
    })
}

#[cfg(not(unix))]
fn request_stop(child: &Child) -> Result<()> {
    // A console-less process cannot receive Ctrl+Break; fall through to kill.
    Err(Error::ProcessSignal {
        pid: child.id(),
        message: "graceful stop is not supported on this platform".to_string(),
    })
}

/// Best-effort unmount of a mount we did not launch.
///
/// Drive letters: force-stops every process with the rclone image name.
/// Directories: `fusermount -u` on Linux, `umount` elsewhere.
pub fn unmount_external(target: &MountTarget, rclone_binary: &str) -> Result<()> {
    match target {
        MountTarget::Drive(_) => {
            let image = crate::rclone::image_name(rclone_binary);
            warn!(
                image = %image,
                "stopping detected drive mount by image name; this stops every {} process",
                image
            );
            run_checked("taskkill", &["/IM", &image, "/F"])
        }
        MountTarget::Directory(path) => {
            let path = path.to_string_lossy();
            if cfg!(target_os = "linux") {
                run_checked("fusermount", &["-u", &path])
            } else {
                run_checked("umount", &[&path])
            }
        }
    }
}

/// Refreshes the desktop shell so it drops stale drive listings.
///
/// Only meaningful on Windows, where Explorer caches drive letters.
pub fn refresh_shell_view() -> Result<()> {
    if !cfg!(windows) {
        return Ok(());
    }

    run_checked("taskkill", &["/IM", "explorer.exe", "/F"])?;
    Command::new("explorer.exe")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .command_context("explorer.exe")?;
    Ok(())
}

fn run_checked(cmd: &str, args: &[&str]) -> Result<()> {
    let command = format!("{} {}", cmd, args.join(" "));
    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .command_context(command.clone())?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::CommandExit {
            command,
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    Ok(())
}
