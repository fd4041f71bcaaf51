//! Mount supervision.
//!
//! The [`MountSupervisor`] owns every tracked mount: the ones it launched
//! (process-owned, can be terminated) and the ones it only detected by
//! looking at the filesystem (detection-only, best-effort unmount).
//!
//! ## Locking
//!
//! All tracked entries live behind one mutex shared by user start/stop
//! requests, [`MountSupervisor::reconcile`] and the per-mount watcher
//! threads. Nothing blocks while the lock is held: spawning, the graceful
//! stop wait and unmount commands all run after it is released.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use snafu::{ResultExt, ensure};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EmptyRemoteSnafu, Error, MountPointCreateSnafu, Result};
use crate::mapping::MappingRecord;
use crate::process::{self, Termination};
use crate::rclone::{self, DEFAULT_RCLONE_BINARY};
use crate::startup::StartupEntry;
use crate::target::{Addressing, DirectoryCheck, MountTarget};

/// Default wait between the polite stop request and the kill.
pub const DEFAULT_GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Default interval at which watcher threads poll their process.
pub const DEFAULT_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// rclone executable name or path.
    pub rclone_binary: String,
    pub addressing: Addressing,
    /// How directory targets are judged live.
    pub directory_check: DirectoryCheck,
    pub graceful_stop_timeout: Duration,
    pub exit_poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            rclone_binary: DEFAULT_RCLONE_BINARY.to_string(),
            addressing: Addressing::host(),
            directory_check: DirectoryCheck::host(),
            graceful_stop_timeout: DEFAULT_GRACEFUL_STOP_TIMEOUT,
            exit_poll_interval: DEFAULT_EXIT_POLL_INTERVAL,
        }
    }
}

/// Identity of a tracked mount. A re-detected mount gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MountId(Uuid);

impl MountId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a tracked mount.
///
/// Process-owned: `Starting -> Running -> Stopping`. Detection-only:
/// `Detected`. Leaving the tracked set is the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Starting,
    Running,
    Stopping,
    Detected,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountState::Starting => "starting",
            MountState::Running => "running",
            MountState::Stopping => "stopping",
            MountState::Detected => "detected",
        };
        f.write_str(s)
    }
}

/// Snapshot of a tracked mount.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedMount {
    pub id: MountId,
    /// `"<remote> -> <target>"`.
    pub key: String,
    pub remote: String,
    pub target: String,
    pub state: MountState,
    /// Present only for process-owned mounts.
    pub pid: Option<u32>,
    pub started_at: DateTime<Local>,
    /// Found by scanning rather than launched.
    pub detected: bool,
    /// Found through the startup manifest rather than a mapping.
    pub startup_origin: bool,
}

impl TrackedMount {
    pub fn is_process_owned(&self) -> bool {
        !self.detected
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Process-owned mount exited after the polite request.
    Terminated,
    /// Process-owned mount had to be killed.
    Killed,
    /// Control over the process was lost; the entry was dropped anyway.
    Abandoned { reason: String },
    /// Detection-only mount; the target is gone now.
    Unmounted,
    /// Detection-only mount; the target is still present after the attempt.
    StillLive { reason: Option<String> },
}

impl StopOutcome {
    /// True if the mount was not launched by this process, so success
    /// was never guaranteed.
    pub fn was_detection_only(&self) -> bool {
        matches!(self, StopOutcome::Unmounted | StopOutcome::StillLive { .. })
    }
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::Terminated => write!(f, "stopped"),
            StopOutcome::Killed => write!(f, "killed after timeout"),
            StopOutcome::Abandoned { reason } => write!(f, "lost control of process: {}", reason),
            StopOutcome::Unmounted => write!(f, "unmounted"),
            StopOutcome::StillLive { reason: None } => {
                write!(f, "stop attempted, target still live")
            }
            StopOutcome::StillLive {
                reason: Some(reason),
            } => write!(f, "stop attempted, target still live: {}", reason),
        }
    }
}

/// Result of [`MountSupervisor::stop_all`].
#[derive(Debug, Clone, Default)]
pub struct StopAllReport {
    /// Mount key and outcome, in tracked order.
    pub outcomes: Vec<(String, StopOutcome)>,
    /// Whether the caller should offer [`MountSupervisor::refresh_shell_view`].
    pub refresh_recommended: bool,
}

/// Changes made by one reconcile pass, as mount keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub detected: Vec<String>,
    pub vanished: Vec<String>,
    pub reaped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.detected.is_empty() && self.vanished.is_empty() && self.reaped.is_empty()
    }
}

struct MountEntry {
    info: TrackedMount,
    target: MountTarget,
    child: Option<Child>,
}

type MountTable = Arc<Mutex<Vec<MountEntry>>>;

fn lock(table: &MountTable) -> MutexGuard<'_, Vec<MountEntry>> {
    // Entries stay structurally valid even if a holder panicked.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds the `"<remote> -> <target>"` key used for display and matching.
pub fn mount_key(remote: &str, target: &MountTarget) -> String {
    format!("{} -> {}", remote, target)
}

/// Owns tracked mounts and the external rclone processes behind them.
pub struct MountSupervisor {
    settings: SupervisorSettings,
    mounts: MountTable,
}

impl MountSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            mounts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Resolves the rclone executable. Checked again on every start.
    pub fn locate_rclone(&self) -> Result<PathBuf> {
        rclone::locate(&self.settings.rclone_binary)
    }

    /// Returns true if `target` is valid for this platform and live: the
    /// drive root exists, or the directory passes the configured check.
    pub fn is_target_live(&self, target: &str) -> bool {
        MountTarget::parse(target, self.settings.addressing)
            .map(|t| t.is_live(self.settings.directory_check))
            .unwrap_or(false)
    }

    /// Snapshot of all tracked mounts.
    pub fn mounts(&self) -> Vec<TrackedMount> {
        lock(&self.mounts).iter().map(|e| e.info.clone()).collect()
    }

    /// Launches `rclone mount` for a mapping.
    ///
    /// The target is not checked for liveness here: callers confirm an
    /// override with the user before calling. A missing directory target is
    /// created first on Unix. Fails if the binary is missing, the remote is
    /// empty, the target is invalid, or another process-owned mount holds
    /// the target.
    pub fn start_mount(&self, record: &MappingRecord, config_path: &Path) -> Result<MountId> {
        let remote = record.remote.trim();
        ensure!(
            !remote.is_empty(),
            EmptyRemoteSnafu {
                label: record.label.clone()
            }
        );

        let target = MountTarget::parse(&record.target, self.settings.addressing)?;
        let program = self.locate_rclone()?;
        let key = mount_key(remote, &target);
        let id = MountId::new();

        {
            let mut table = lock(&self.mounts);
            if let Some(holder) = table
                .iter()
                .find(|e| e.target == target && e.info.is_process_owned())
            {
                return Err(Error::TargetInUse {
                    target: target.to_string(),
                    key: holder.info.key.clone(),
                });
            }

            table.push(MountEntry {
                info: TrackedMount {
                    id,
                    key: key.clone(),
                    remote: remote.to_string(),
                    target: target.to_string(),
                    state: MountState::Starting,
                    pid: None,
                    started_at: Local::now(),
                    detected: false,
                    startup_origin: false,
                },
                target: target.clone(),
                child: None,
            });
        }

        if let Err(e) = prepare_mount_point(&target) {
            lock(&self.mounts).retain(|entry| entry.info.id != id);
            warn!(key = %key, error = %e, "failed to prepare mount point");
            return Err(e);
        }

        let args = rclone::mount_args(remote, &target, config_path);
        let child = match process::spawn_detached(&program, &args) {
            Ok(child) => child,
            Err(e) => {
                lock(&self.mounts).retain(|entry| entry.info.id != id);
                warn!(key = %key, error = %e, "failed to start mount");
                return Err(e);
            }
        };
        let pid = child.id();

        {
            let mut table = lock(&self.mounts);
            // A launched mount supersedes a detection on the same target.
            table.retain(|e| !(e.info.detected && e.target == target));
            if let Some(entry) = table.iter_mut().find(|e| e.info.id == id) {
                entry.info.state = MountState::Running;
                entry.info.pid = Some(pid);
                entry.info.started_at = Local::now();
                entry.child = Some(child);
            }
        }

        let table = Arc::clone(&self.mounts);
        let poll = self.settings.exit_poll_interval;
        if let Err(e) = thread::Builder::new()
            .name(format!("ezmount-watch-{}", pid))
            .spawn(move || watch_exit(table, id, poll))
        {
            // Reconcile still reaps the entry when the process exits.
            warn!(key = %key, error = %e, "failed to spawn mount watcher thread");
        }

        info!(key = %key, pid, "mount started");
        Ok(id)
    }

    /// Stops the mount tracked on `target`.
    ///
    /// Process-owned mounts get a polite stop, a bounded wait and a kill.
    /// Detection-only mounts get a best-effort OS unmount. In both cases
    /// the entry is dropped; the outcome says what actually happened.
    pub fn stop_mount(&self, target: &str) -> Result<StopOutcome> {
        let target = MountTarget::parse(target, self.settings.addressing)?;

        let (info, child) = {
            let mut table = lock(&self.mounts);
            let entry = table
                .iter_mut()
                .find(|e| {
                    e.target == target
                        && matches!(e.info.state, MountState::Running | MountState::Detected)
                })
                .ok_or_else(|| Error::NotTracked {
                    target: target.to_string(),
                })?;

            if entry.info.detected {
                (entry.info.clone(), None)
            } else {
                entry.info.state = MountState::Stopping;
                (entry.info.clone(), entry.child.take())
            }
        };

        let outcome = if info.detected {
            self.stop_detected(&info, &target)
        } else {
            self.stop_owned(&info, child)
        };

        lock(&self.mounts).retain(|e| e.info.id != info.id);
        info!(key = %info.key, outcome = %outcome, "mount stopped");
        Ok(outcome)
    }

    fn stop_owned(&self, info: &TrackedMount, child: Option<Child>) -> StopOutcome {
        let Some(mut child) = child else {
            return StopOutcome::Abandoned {
                reason: "no process handle".to_string(),
            };
        };

        match process::terminate(&mut child, self.settings.graceful_stop_timeout) {
            Ok(Termination::Graceful) => StopOutcome::Terminated,
            Ok(Termination::Forced) => StopOutcome::Killed,
            Err(e) => {
                warn!(key = %info.key, error = %e, "could not stop mount process");
                StopOutcome::Abandoned {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn stop_detected(&self, info: &TrackedMount, target: &MountTarget) -> StopOutcome {
        warn!(
            key = %info.key,
            "mount was not launched by this process; unmount is best-effort"
        );

        let result = process::unmount_external(target, &self.settings.rclone_binary);
        if let Err(e) = &result {
            warn!(key = %info.key, error = %e, "unmount command failed");
        }

        if !target.is_live(self.settings.directory_check) {
            return StopOutcome::Unmounted;
        }
        StopOutcome::StillLive {
            reason: result.err().map(|e| e.to_string()),
        }
    }

    /// Stops every tracked mount.
    pub fn stop_all(&self) -> StopAllReport {
        let targets: Vec<(String, String)> = lock(&self.mounts)
            .iter()
            .filter(|e| matches!(e.info.state, MountState::Running | MountState::Detected))
            .map(|e| (e.info.key.clone(), e.info.target.clone()))
            .collect();

        let mut report = StopAllReport::default();
        for (key, target) in targets {
            match self.stop_mount(&target) {
                Ok(outcome) => report.outcomes.push((key, outcome)),
                // Already reaped or stopped by someone else.
                Err(Error::NotTracked { .. }) => {}
                Err(e) => warn!(target = %target, error = %e, "failed to stop mount"),
            }
        }

        report.refresh_recommended =
            self.settings.addressing == Addressing::DriveLetter && !report.outcomes.is_empty();
        report
    }

    /// Refreshes the desktop shell's drive listing (Windows only).
    pub fn refresh_shell_view(&self) -> Result<()> {
        process::refresh_shell_view()
    }

    /// Brings the tracked set in line with the filesystem.
    ///
    /// Live, untracked targets from `records` and `startup_entries` become
    /// `Detected` entries; detected entries whose key was not seen live are
    /// dropped; launched mounts whose process exited are reaped.
    pub fn reconcile(
        &self,
        records: &[MappingRecord],
        startup_entries: &[StartupEntry],
    ) -> ReconcileReport {
        let addressing = self.settings.addressing;
        let check = self.settings.directory_check;
        let candidates = records
            .iter()
            .map(|r| (r.remote.trim(), r.target.as_str(), false))
            .chain(
                startup_entries
                    .iter()
                    .map(|s| (s.remote.trim(), s.target.as_str(), true)),
            );

        // Check the filesystem before taking the lock.
        let mut live = Vec::new();
        for (remote, raw_target, startup_origin) in candidates {
            if remote.is_empty() {
                continue;
            }
            let Ok(target) = MountTarget::parse(raw_target, addressing) else {
                continue;
            };
            if target.is_live(check) {
                live.push((mount_key(remote, &target), remote.to_string(), target, startup_origin));
            }
        }
        let seen: HashSet<&str> = live.iter().map(|(key, ..)| key.as_str()).collect();

        let mut report = ReconcileReport::default();
        let mut table = lock(&self.mounts);

        table.retain_mut(|entry| {
            if entry.info.detected && !seen.contains(entry.info.key.as_str()) {
                report.vanished.push(entry.info.key.clone());
                return false;
            }

            if entry.info.state == MountState::Running
                && let Some(child) = entry.child.as_mut()
                && let Ok(Some(_)) = child.try_wait()
            {
                report.reaped.push(entry.info.key.clone());
                return false;
            }

            true
        });

        for (key, remote, target, startup_origin) in live {
            if table.iter().any(|e| e.target == target) {
                continue;
            }
            table.push(MountEntry {
                info: TrackedMount {
                    id: MountId::new(),
                    key: key.clone(),
                    remote,
                    target: target.to_string(),
                    state: MountState::Detected,
                    pid: None,
                    started_at: Local::now(),
                    detected: true,
                    startup_origin,
                },
                target,
                child: None,
            });
            report.detected.push(key);
        }

        if !report.is_empty() {
            debug!(
                detected = report.detected.len(),
                vanished = report.vanished.len(),
                reaped = report.reaped.len(),
                "reconciled tracked mounts"
            );
        }
        report
    }
}

/// FUSE needs an existing, empty directory to mount on.
fn prepare_mount_point(target: &MountTarget) -> Result<()> {
    let Some(path) = target.as_path() else {
        return Ok(());
    };
    if cfg!(unix) && !path.exists() {
        fs::create_dir_all(path).context(MountPointCreateSnafu { path })?;
        debug!(path = %path.display(), "created mount point");
    }
    Ok(())
}

/// Polls one launched process and drops its entry once it exits.
fn watch_exit(table: MountTable, id: MountId, poll: Duration) {
    loop {
        thread::sleep(poll);

        let mut guard = lock(&table);
        let Some(idx) = guard.iter().position(|e| e.info.id == id) else {
            return;
        };
        // A stop request took the handle and owns the shutdown now.
        let Some(child) = guard[idx].child.as_mut() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                let entry = guard.remove(idx);
                info!(key = %entry.info.key, %status, "mount process exited");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %guard[idx].info.key, error = %e, "failed to poll mount process");
            }
        }
    }
}
