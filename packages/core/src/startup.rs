//! Startup registration.
//!
//! Writes one autostart artifact per selected mapping into the OS autostart
//! directory and records what was written in a JSON manifest. The manifest
//! is replaced as a whole on every commit, so it always describes exactly
//! the latest commit.
//!
//! Artifact names are `EZMount_<label>.<ext>`, numbered when two labels
//! sanitize to the same name. A commit deletes the artifacts of the previous
//! commit that it did not rewrite; clearing removes everything with the
//! prefix.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, ManifestSerializeSnafu, Result};
use crate::mapping::MappingRecord;
use crate::rclone::VFS_CACHE_MODE;
use crate::target::Addressing;

/// File name prefix of every artifact this tool writes.
pub const STARTUP_PREFIX: &str = "EZMount_";

/// Per-user application directory name.
pub const APP_DIR_NAME: &str = "EZMount";

/// Manifest file name inside the application data directory.
pub const MANIFEST_FILE_NAME: &str = "startup_manifest.json";

/// Helper that can start a program without a visible window.
pub const HIDDEN_LAUNCHER: &str = "nircmd";

/// One persisted startup registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupEntry {
    pub label: String,
    pub remote: String,
    pub target: String,
    pub artifact_path: PathBuf,
    pub created_at: DateTime<Local>,
    /// Command line as written into the artifact.
    pub command: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<StartupEntry>,
}

/// Kind of autostart artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStyle {
    /// Batch file in the Windows Startup folder.
    CommandFile,
    /// XDG `.desktop` launcher in `~/.config/autostart`.
    DesktopEntry,
}

impl ArtifactStyle {
    pub fn for_addressing(addressing: Addressing) -> Self {
        match addressing {
            Addressing::DriveLetter => ArtifactStyle::CommandFile,
            Addressing::Directory => ArtifactStyle::DesktopEntry,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactStyle::CommandFile => "bat",
            ArtifactStyle::DesktopEntry => "desktop",
        }
    }
}

/// Where and how startup artifacts are written.
#[derive(Debug, Clone)]
pub struct StartupLayout {
    pub autostart_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub style: ArtifactStyle,
    /// Used by command files when present.
    pub hidden_launcher: Option<PathBuf>,
}

impl StartupLayout {
    /// Layout for the current platform and user.
    pub fn for_host() -> Result<Self> {
        let style = ArtifactStyle::for_addressing(Addressing::host());
        let hidden_launcher = match style {
            ArtifactStyle::CommandFile => which::which(HIDDEN_LAUNCHER).ok(),
            ArtifactStyle::DesktopEntry => None,
        };

        Ok(Self {
            autostart_dir: default_autostart_dir()?,
            manifest_path: default_manifest_path()?,
            style,
            hidden_launcher,
        })
    }
}

/// Returns the OS autostart directory for the current user.
pub fn default_autostart_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let roaming = dirs::data_dir().ok_or(Error::AutostartDirNotFound)?;
        Ok(roaming
            .join("Microsoft")
            .join("Windows")
            .join("Start Menu")
            .join("Programs")
            .join("Startup"))
    } else {
        let config = dirs::config_dir().ok_or(Error::AutostartDirNotFound)?;
        Ok(config.join("autostart"))
    }
}

/// Returns the default manifest location.
pub fn default_manifest_path() -> Result<PathBuf> {
    let data = dirs::data_dir().ok_or(Error::DataDirNotFound)?;
    Ok(data.join(APP_DIR_NAME).join(MANIFEST_FILE_NAME))
}

/// Outcome of [`StartupRegistrar::commit`].
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    /// Entries actually written, as recorded in the manifest.
    pub entries: Vec<StartupEntry>,
    /// Label and error for every mapping that could not be written.
    pub failures: Vec<(String, String)>,
    /// Artifacts of the previous commit that were deleted.
    pub removed: usize,
}

/// Outcome of [`StartupRegistrar::clear_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub removed: usize,
    pub failed: usize,
    pub manifest_removed: bool,
}

/// Writes, lists and removes startup registrations.
#[derive(Debug, Clone)]
pub struct StartupRegistrar {
    layout: StartupLayout,
}

impl StartupRegistrar {
    pub fn new(layout: StartupLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StartupLayout {
        &self.layout
    }

    /// Path of the artifact for a label.
    pub fn artifact_path(&self, label: &str) -> PathBuf {
        self.artifact_path_numbered(&sanitize_label(label), 1)
    }

    fn artifact_path_numbered(&self, stem: &str, n: usize) -> PathBuf {
        let stem = if n > 1 {
            format!("{}_{}", stem, n)
        } else {
            stem.to_string()
        };
        self.layout.autostart_dir.join(format!(
            "{}{}.{}",
            STARTUP_PREFIX,
            stem,
            self.layout.style.extension()
        ))
    }

    /// First artifact path for `label` not in `taken`, numbering from `_2`.
    fn unique_artifact_path(&self, label: &str, taken: &HashSet<PathBuf>) -> PathBuf {
        let stem = sanitize_label(label);
        (1..)
            .map(|n| self.artifact_path_numbered(&stem, n))
            .find(|path| !taken.contains(path))
            .unwrap_or_else(|| self.artifact_path(label))
    }

    /// Writes artifacts for every record with its startup flag set, removes
    /// artifacts recorded by the previous commit that were not rewritten,
    /// then replaces the manifest with the entries that were written.
    ///
    /// Labels that sanitize to the same file name get numbered names
    /// (`EZMount_label_2`). Individual artifact failures are logged and
    /// skipped. Errors are returned only when the autostart directory or
    /// the manifest cannot be written.
    pub fn commit(
        &self,
        records: &[MappingRecord],
        rclone_path: &Path,
        config_path: &Path,
    ) -> Result<CommitReport> {
        let dir = &self.layout.autostart_dir;
        fs::create_dir_all(dir).artifact_write_context(dir)?;

        let previous = self.load();
        let mut taken = HashSet::new();
        let mut report = CommitReport::default();
        for record in records.iter().filter(|r| r.startup) {
            let path = self.unique_artifact_path(&record.label, &taken);
            taken.insert(path.clone());
            let (content, command) = self.render(record, rclone_path, config_path);

            match fs::write(&path, content).artifact_write_context(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "wrote startup artifact");
                    report.entries.push(StartupEntry {
                        label: record.label.clone(),
                        remote: record.remote.trim().to_string(),
                        target: record.target.trim().to_string(),
                        artifact_path: path,
                        created_at: Local::now(),
                        command,
                    });
                }
                Err(e) => {
                    warn!(label = %record.label, error = %e, "skipping startup artifact");
                    report.failures.push((record.label.clone(), e.to_string()));
                }
            }
        }

        for stale in previous.iter().map(|e| &e.artifact_path) {
            if taken.contains(stale) || !self.is_own_artifact(stale) {
                continue;
            }
            match fs::remove_file(stale) {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %stale.display(), error = %e, "failed to remove stale startup artifact"),
            }
        }

        self.write_manifest(&report.entries)?;
        info!(
            written = report.entries.len(),
            failed = report.failures.len(),
            removed = report.removed,
            "committed startup entries"
        );
        Ok(report)
    }

    /// Deletes every prefixed artifact and the manifest.
    ///
    /// Never fails; per-file errors are logged and counted.
    pub fn clear_all(&self) -> ClearReport {
        let mut report = ClearReport::default();
        let dir = &self.layout.autostart_dir;

        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if !name.to_string_lossy().starts_with(STARTUP_PREFIX) {
                        continue;
                    }
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    match fs::remove_file(&path).artifact_remove_context(&path) {
                        Ok(()) => report.removed += 1,
                        Err(e) => {
                            warn!(error = %e, "failed to remove startup artifact");
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "cannot list autostart directory"),
        }

        let manifest = &self.layout.manifest_path;
        match fs::remove_file(manifest) {
            Ok(()) => report.manifest_removed = true,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %manifest.display(), error = %e, "failed to remove manifest"),
        }

        info!(
            removed = report.removed,
            failed = report.failed,
            "cleared startup entries"
        );
        report
    }

    /// Reads the manifest. Missing or unreadable manifests yield no entries.
    pub fn load(&self) -> Vec<StartupEntry> {
        let path = &self.layout.manifest_path;
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read startup manifest");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Manifest>(&text) {
            Ok(manifest) => manifest.entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed startup manifest");
                Vec::new()
            }
        }
    }

    /// True for prefixed files directly inside the autostart directory.
    fn is_own_artifact(&self, path: &Path) -> bool {
        path.parent() == Some(self.layout.autostart_dir.as_path())
            && path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(STARTUP_PREFIX))
    }

    fn write_manifest(&self, entries: &[StartupEntry]) -> Result<()> {
        let path = &self.layout.manifest_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).manifest_write_context(parent)?;
        }

        let manifest = Manifest {
            entries: entries.to_vec(),
        };
        let json = serde_json::to_string_pretty(&manifest).context(ManifestSerializeSnafu)?;

        // Write next to the manifest and rename over it.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).manifest_write_context(&tmp)?;
        fs::rename(&tmp, path).manifest_write_context(path)?;
        Ok(())
    }

    fn render(
        &self,
        record: &MappingRecord,
        rclone_path: &Path,
        config_path: &Path,
    ) -> (String, String) {
        let remote = record.remote.trim();
        let target = record.target.trim();

        match self.layout.style {
            ArtifactStyle::CommandFile => {
                let mount = format!(
                    "{} mount {} {} --config {} --vfs-cache-mode {}",
                    cmd_quote(&rclone_path.to_string_lossy()),
                    cmd_quote(remote),
                    cmd_quote(target),
                    cmd_quote(&config_path.to_string_lossy()),
                    VFS_CACHE_MODE
                );
                let command = match &self.layout.hidden_launcher {
                    Some(launcher) => format!(
                        "{} exec hide {}",
                        cmd_quote(&launcher.to_string_lossy()),
                        mount
                    ),
                    None => format!("start \"\" /min {}", mount),
                };
                (format!("{}\r\n", command), command)
            }
            ArtifactStyle::DesktopEntry => {
                let mount = format!(
                    "{} mount {} {} --config {} --vfs-cache-mode {}",
                    sh_quote(&rclone_path.to_string_lossy()),
                    sh_quote(remote),
                    sh_quote(target),
                    sh_quote(&config_path.to_string_lossy()),
                    VFS_CACHE_MODE
                );
                let command = format!(
                    "sh -c {}",
                    desktop_exec_quote(&format!("{} >/dev/null 2>&1 &", mount))
                );
                let content = format!(
                    "[Desktop Entry]\n\
                     Type=Application\n\
                     Name=EZMount {}\n\
                     Exec={}\n\
                     X-GNOME-Autostart-enabled=true\n",
                    single_line(&record.label),
                    command
                );
                (content, command)
            }
        }
    }
}

/// Keeps ASCII letters, digits, `-` and `_`.
pub fn sanitize_label(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if sanitized.is_empty() {
        "mount".to_string()
    } else {
        sanitized
    }
}

/// Quotes one argument for a batch file line.
///
/// `cmd.exe` has no escape for `"` inside quotes, so it is dropped.
fn cmd_quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', ""))
}

/// Quotes one argument for `sh`.
fn sh_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Quotes one `Exec=` argument per the desktop entry specification.
fn desktop_exec_quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        match c {
            '"' | '`' | '$' => {
                out.push('\\');
                out.push(c);
            }
            // Escaped once for the quoting rule, once for the string rule.
            '\\' => out.push_str(r"\\\\"),
            '%' => out.push_str("%%"),
            '\n' | '\r' => out.push(' '),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn single_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingStore, TargetNaming};

    fn registrar(dir: &Path, style: ArtifactStyle, launcher: Option<&str>) -> StartupRegistrar {
        StartupRegistrar::new(StartupLayout {
            autostart_dir: dir.join("autostart"),
            manifest_path: dir.join("data").join(MANIFEST_FILE_NAME),
            style,
            hidden_launcher: launcher.map(PathBuf::from),
        })
    }

    fn records() -> Vec<MappingRecord> {
        let mut store = MappingStore::new(TargetNaming::DriveLetters);
        store.add("gdrive:", Some("My Drive!".into()), "X:", true);
        store.add("s3:logs", Some("s3-logs".into()), "W:", true);
        store.add("skip:", Some("skip".into()), "V:", false);
        store.records().to_vec()
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("My Drive!"), "MyDrive");
        assert_eq!(sanitize_label("s3-logs_2"), "s3-logs_2");
        assert_eq!(sanitize_label("日本"), "mount");
    }

    #[test]
    fn test_commit_desktop_entries() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::DesktopEntry, None);

        let report = reg
            .commit(
                &records(),
                Path::new("/usr/bin/rclone"),
                Path::new("/home/u/rclone.conf"),
            )
            .unwrap();

        assert_eq!(report.entries.len(), 2);
        assert!(report.failures.is_empty());

        let path = dir.path().join("autostart").join("EZMount_MyDrive.desktop");
        assert_eq!(report.entries[0].artifact_path, path);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("[Desktop Entry]\n"));
        assert!(content.contains("Type=Application\n"));
        assert!(content.contains("Name=EZMount My Drive!\n"));
        assert!(content.contains("X-GNOME-Autostart-enabled=true"));
        assert!(content.contains(
            "Exec=sh -c \"'/usr/bin/rclone' mount 'gdrive:' 'X:' --config '/home/u/rclone.conf' --vfs-cache-mode writes >/dev/null 2>&1 &\""
        ));
        assert!(content.contains(&format!("Exec={}\n", report.entries[0].command)));
    }

    #[test]
    fn test_commit_command_files() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::CommandFile, None);
        let rclone = Path::new(r"C:\rclone\rclone.exe");
        let conf = Path::new(r"C:\Users\u\rclone.conf");

        let report = reg.commit(&records(), rclone, conf).unwrap();
        assert_eq!(
            report.entries[1].command,
            r#"start "" /min "C:\rclone\rclone.exe" mount "s3:logs" "W:" --config "C:\Users\u\rclone.conf" --vfs-cache-mode writes"#
        );
        let content =
            fs::read_to_string(dir.path().join("autostart").join("EZMount_s3-logs.bat")).unwrap();
        assert_eq!(content, format!("{}\r\n", report.entries[1].command));

        let hidden = registrar(dir.path(), ArtifactStyle::CommandFile, Some(r"C:\nircmd.exe"));
        let report = hidden.commit(&records(), rclone, conf).unwrap();
        assert!(
            report.entries[0]
                .command
                .starts_with(r#""C:\nircmd.exe" exec hide "C:\rclone\rclone.exe" mount"#)
        );
    }

    #[test]
    fn test_manifest_replaced_on_commit_and_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::DesktopEntry, None);
        let rclone = Path::new("/usr/bin/rclone");
        let conf = Path::new("/tmp/rclone.conf");

        reg.commit(&records(), rclone, conf).unwrap();
        assert_eq!(reg.load().len(), 2);

        let mut only_one = records();
        only_one[1].startup = false;
        reg.commit(&only_one, rclone, conf).unwrap();

        let loaded = reg.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].remote, "gdrive:");
        assert_eq!(loaded[0].target, "X:");
        assert!(!dir.path().join("data").join("startup_manifest.json.tmp").exists());
    }

    #[test]
    fn test_colliding_labels_get_distinct_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::DesktopEntry, None);
        let mut store = MappingStore::new(TargetNaming::DriveLetters);
        store.add("a:", Some("my drive".into()), "/mnt/a", true);
        store.add("b:", Some("mydrive".into()), "/mnt/b", true);

        let report = reg
            .commit(store.records(), Path::new("rclone"), Path::new("rclone.conf"))
            .unwrap();

        let autostart = dir.path().join("autostart");
        assert_eq!(report.entries.len(), 2);
        assert_eq!(
            report.entries[0].artifact_path,
            autostart.join("EZMount_mydrive.desktop")
        );
        assert_eq!(
            report.entries[1].artifact_path,
            autostart.join("EZMount_mydrive_2.desktop")
        );

        let first = fs::read_to_string(&report.entries[0].artifact_path).unwrap();
        let second = fs::read_to_string(&report.entries[1].artifact_path).unwrap();
        assert!(first.contains("'a:'"));
        assert!(second.contains("'b:'"));
        assert_eq!(fs::read_dir(&autostart).unwrap().count(), 2);
    }

    #[test]
    fn test_commit_removes_artifacts_of_previous_commit() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::DesktopEntry, None);
        let rclone = Path::new("rclone");
        let conf = Path::new("rclone.conf");
        let autostart = dir.path().join("autostart");

        reg.commit(&records(), rclone, conf).unwrap();
        assert!(autostart.join("EZMount_s3-logs.desktop").exists());

        let foreign = autostart.join("other.desktop");
        fs::write(&foreign, "[Desktop Entry]\n").unwrap();

        let mut only_one = records();
        only_one[1].startup = false;
        let report = reg.commit(&only_one, rclone, conf).unwrap();

        assert_eq!(report.removed, 1);
        assert!(autostart.join("EZMount_MyDrive.desktop").exists());
        assert!(!autostart.join("EZMount_s3-logs.desktop").exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_clear_all_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::DesktopEntry, None);

        assert_eq!(reg.clear_all(), ClearReport::default());
        assert!(reg.load().is_empty());
    }

    #[test]
    fn test_clear_all_removes_prefixed_only() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::DesktopEntry, None);
        reg.commit(&records(), Path::new("rclone"), Path::new("rclone.conf"))
            .unwrap();

        let foreign = dir.path().join("autostart").join("other.desktop");
        fs::write(&foreign, "[Desktop Entry]\n").unwrap();

        let report = reg.clear_all();
        assert_eq!(report.removed, 2);
        assert_eq!(report.failed, 0);
        assert!(report.manifest_removed);
        assert!(foreign.exists());
        assert!(reg.load().is_empty());
    }

    #[test]
    fn test_load_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registrar(dir.path(), ArtifactStyle::DesktopEntry, None);
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(&reg.layout().manifest_path, "{ not json").unwrap();

        assert!(reg.load().is_empty());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(desktop_exec_quote(r#"a"$b\c%"#), r#""a\"\$b\\\\c%%""#);
        assert_eq!(cmd_quote(r#"C:\a "b""#), r#""C:\a b""#);
    }
}
