//! Supervisor tests against real child processes.
//!
//! Small shell scripts stand in for rclone. They receive the same
//! arguments (`mount <remote> <target> --config ...`), so `$3` is the target.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use ezmount_core::mapping::{MappingStore, TargetNaming};
use ezmount_core::supervisor::SupervisorSettings;
use ezmount_core::{
    Addressing, DirectoryCheck, Error, MappingRecord, MountState, MountSupervisor, StopOutcome,
};
use tempfile::TempDir;

const SLEEPER: &str = "#!/bin/sh\nexec sleep 60\n";

const EXITER: &str = "#!/bin/sh\nexit 0\n";

const MOUNTER: &str = r#"#!/bin/sh
trap 'kill $! 2>/dev/null; rmdir "$3"; exit 0' TERM
mkdir -p "$3"
while :; do
    sleep 60 &
    wait $!
done
"#;

struct FakeRclone {
    _dir: TempDir,
    sleeper: PathBuf,
    exiter: PathBuf,
    mounter: PathBuf,
}

/// Writes every script once, before any test spawns a process, so no
/// script is executed while a writable handle to it is still open.
fn fake_rclone() -> &'static FakeRclone {
    static FAKE: OnceLock<FakeRclone> = OnceLock::new();
    FAKE.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        FakeRclone {
            sleeper: write("rclone-sleeper", SLEEPER),
            exiter: write("rclone-exiter", EXITER),
            mounter: write("rclone-mounter", MOUNTER),
            _dir: dir,
        }
    })
}

fn supervisor(binary: &Path, poll: Duration) -> MountSupervisor {
    MountSupervisor::new(SupervisorSettings {
        rclone_binary: binary.to_string_lossy().into_owned(),
        addressing: Addressing::Directory,
        // The scripts only create directories, never real mounts.
        directory_check: DirectoryCheck::Exists,
        graceful_stop_timeout: Duration::from_secs(3),
        exit_poll_interval: poll,
    })
}

fn record(store: &mut MappingStore, remote: &str, target: &Path) -> MappingRecord {
    let id = store.add(remote, None, target.to_string_lossy().into_owned(), false);
    store.get(id).unwrap().clone()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}

#[test]
fn test_start_then_stop_terminates_process() {
    let fake = fake_rclone();
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("gdrive");
    let sup = supervisor(&fake.sleeper, Duration::from_millis(100));
    let mut store = MappingStore::new(TargetNaming::DriveLetters);
    let rec = record(&mut store, "gdrive:", &target);

    sup.start_mount(&rec, &work.path().join("rclone.conf")).unwrap();

    let mounts = sup.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].state, MountState::Running);
    assert!(mounts[0].pid.is_some());
    assert!(mounts[0].is_process_owned());
    assert_eq!(
        mounts[0].key,
        format!("gdrive: -> {}", target.display())
    );

    let started = Instant::now();
    let outcome = sup.stop_mount(target.to_str().unwrap()).unwrap();

    assert_eq!(outcome, StopOutcome::Terminated);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(sup.mounts().is_empty());
}

#[test]
fn test_start_creates_missing_mount_point() {
    let fake = fake_rclone();
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("EZMount").join("gdrive");
    let sup = MountSupervisor::new(SupervisorSettings {
        rclone_binary: fake.sleeper.to_string_lossy().into_owned(),
        addressing: Addressing::Directory,
        directory_check: DirectoryCheck::MountPoint,
        graceful_stop_timeout: Duration::from_secs(3),
        exit_poll_interval: Duration::from_millis(100),
    });
    let mut store = MappingStore::new(TargetNaming::DriveLetters);
    let rec = record(&mut store, "gdrive:", &target);

    // Fresh mapping: nothing there yet, so a caller would not skip it.
    assert!(!sup.is_target_live(&rec.target));

    sup.start_mount(&rec, &work.path().join("rclone.conf")).unwrap();
    assert!(target.is_dir());

    // An empty directory is not a mount, so it is still not reported live.
    assert!(!sup.is_target_live(&rec.target));

    assert_eq!(sup.stop_mount(&rec.target).unwrap(), StopOutcome::Terminated);
}

#[test]
fn test_stopped_target_is_no_longer_live() {
    let fake = fake_rclone();
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("nas");
    let sup = supervisor(&fake.mounter, Duration::from_millis(100));
    let mut store = MappingStore::new(TargetNaming::DriveLetters);
    let rec = record(&mut store, "nas:", &target);

    sup.start_mount(&rec, &work.path().join("rclone.conf")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || target.is_dir()));
    assert!(sup.is_target_live(target.to_str().unwrap()));

    let outcome = sup.stop_mount(target.to_str().unwrap()).unwrap();

    assert!(matches!(outcome, StopOutcome::Terminated | StopOutcome::Killed));
    assert!(!outcome.was_detection_only());
    assert!(!sup.is_target_live(target.to_str().unwrap()));
    assert!(sup.mounts().is_empty());
}

#[test]
fn test_exited_process_is_dropped_by_watcher() {
    let fake = fake_rclone();
    let work = tempfile::tempdir().unwrap();
    let sup = supervisor(&fake.exiter, Duration::from_millis(50));
    let mut store = MappingStore::new(TargetNaming::DriveLetters);
    let rec = record(&mut store, "broken:", &work.path().join("broken"));

    sup.start_mount(&rec, &work.path().join("rclone.conf")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || sup.mounts().is_empty()));
}

#[test]
fn test_exited_process_is_reaped_by_reconcile() {
    let fake = fake_rclone();
    let work = tempfile::tempdir().unwrap();
    // Watcher effectively idle; reconcile has to notice the exit.
    let sup = supervisor(&fake.exiter, Duration::from_secs(600));
    let mut store = MappingStore::new(TargetNaming::DriveLetters);
    let rec = record(&mut store, "broken:", &work.path().join("broken"));

    sup.start_mount(&rec, &work.path().join("rclone.conf")).unwrap();

    let mut reaped = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        reaped.extend(sup.reconcile(store.records(), &[]).reaped);
        !reaped.is_empty()
    }));
    assert_eq!(reaped, vec![rec_key(&rec)]);
    assert!(sup.mounts().is_empty());
}

fn rec_key(rec: &MappingRecord) -> String {
    format!("{} -> {}", rec.remote, rec.target)
}

#[test]
fn test_second_start_on_same_target_is_rejected() {
    let fake = fake_rclone();
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("shared");
    let sup = supervisor(&fake.sleeper, Duration::from_millis(100));
    let mut store = MappingStore::new(TargetNaming::DriveLetters);
    let first = record(&mut store, "a:", &target);
    let second = record(&mut store, "b:", &target);
    let conf = work.path().join("rclone.conf");

    sup.start_mount(&first, &conf).unwrap();
    let err = sup.start_mount(&second, &conf).unwrap_err();
    assert!(matches!(err, Error::TargetInUse { .. }));
    assert_eq!(sup.mounts().len(), 1);

    let report = sup.stop_all();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].0, rec_key(&first));
    assert!(!report.refresh_recommended);
    assert!(sup.mounts().is_empty());
}

#[test]
fn test_start_does_not_check_liveness() {
    let fake = fake_rclone();
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("already");
    fs::create_dir(&target).unwrap();

    let sup = supervisor(&fake.sleeper, Duration::from_millis(100));
    let mut store = MappingStore::new(TargetNaming::DriveLetters);
    let rec = record(&mut store, "gdrive:", &target);

    // Detected first, then launched anyway: the launch supersedes it.
    sup.reconcile(store.records(), &[]);
    assert_eq!(sup.mounts()[0].state, MountState::Detected);

    sup.start_mount(&rec, &work.path().join("rclone.conf")).unwrap();

    let mounts = sup.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].state, MountState::Running);

    // Still live and already tracked: reconcile leaves it alone.
    assert!(sup.reconcile(store.records(), &[]).is_empty());

    assert_eq!(
        sup.stop_mount(target.to_str().unwrap()).unwrap(),
        StopOutcome::Terminated
    );
}
