//! Persisted per-user settings.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result, SettingsParseSnafu, SettingsSerializeSnafu};
use crate::mapping::{self, TargetNaming};
use crate::rclone::DEFAULT_RCLONE_BINARY;
use crate::startup::{APP_DIR_NAME, StartupLayout};
use crate::supervisor::{DEFAULT_EXIT_POLL_INTERVAL, SupervisorSettings};
use crate::target::{Addressing, DirectoryCheck};

/// Settings file name inside the per-user config directory.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Default reconcile interval (seconds).
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 3;

/// Default graceful stop timeout (seconds).
pub const DEFAULT_GRACEFUL_STOP_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// rclone executable name or path.
    pub rclone_binary: String,
    /// Last successfully loaded rclone config.
    pub last_config: Option<PathBuf>,
    pub reconcile_interval_secs: u64,
    pub graceful_stop_timeout_secs: u64,
    /// Base directory for path-addressed mounts. Defaults to `~/EZMount`.
    pub mount_base: Option<PathBuf>,
    /// Overrides the OS autostart directory.
    pub autostart_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rclone_binary: DEFAULT_RCLONE_BINARY.to_string(),
            last_config: None,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            graceful_stop_timeout_secs: DEFAULT_GRACEFUL_STOP_TIMEOUT_SECS,
            mount_base: None,
            autostart_dir: None,
        }
    }
}

impl Settings {
    /// `<config dir>/EZMount/settings.json`.
    pub fn default_path() -> Result<PathBuf> {
        let config = dirs::config_dir().ok_or(Error::ConfigDirNotFound)?;
        Ok(config.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
    }

    /// Loads settings. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::SettingsRead {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        serde_json::from_str(&text).context(SettingsParseSnafu { path })
    }

    /// Writes settings, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).settings_write_context(parent)?;
        }

        let json = serde_json::to_string_pretty(self).context(SettingsSerializeSnafu)?;
        fs::write(path, json).settings_write_context(path)?;
        debug!(path = %path.display(), "saved settings");
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            rclone_binary: self.rclone_binary.clone(),
            addressing: Addressing::host(),
            directory_check: DirectoryCheck::host(),
            graceful_stop_timeout: Duration::from_secs(self.graceful_stop_timeout_secs),
            exit_poll_interval: DEFAULT_EXIT_POLL_INTERVAL,
        }
    }

    /// Host startup layout with the autostart override applied.
    pub fn startup_layout(&self) -> Result<StartupLayout> {
        let mut layout = StartupLayout::for_host()?;
        if let Some(dir) = &self.autostart_dir {
            layout.autostart_dir = dir.clone();
        }
        Ok(layout)
    }

    pub fn target_naming(&self, addressing: Addressing) -> Result<TargetNaming> {
        let base = match &self.mount_base {
            Some(base) => base.clone(),
            None => mapping::default_mount_base()?,
        };
        Ok(TargetNaming::for_addressing(addressing, base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.reconcile_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = Settings {
            rclone_binary: "/opt/rclone".into(),
            last_config: Some("/home/u/rclone.conf".into()),
            graceful_stop_timeout_secs: 7,
            ..Settings::default()
        };
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), settings);
        assert_eq!(
            settings.supervisor_settings().graceful_stop_timeout,
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "rclone_binary": "rclone-beta" }"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.rclone_binary, "rclone-beta");
        assert_eq!(settings.reconcile_interval_secs, DEFAULT_RECONCILE_INTERVAL_SECS);
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1, 2").unwrap();

        assert!(matches!(
            Settings::load(&path).unwrap_err(),
            Error::SettingsParse { .. }
        ));
    }

    #[test]
    fn test_target_naming_uses_mount_base() {
        let settings = Settings {
            mount_base: Some("/mnt/ez".into()),
            ..Settings::default()
        };
        assert_eq!(
            settings.target_naming(Addressing::Directory).unwrap(),
            TargetNaming::Directories {
                base: "/mnt/ez".into()
            }
        );
        assert_eq!(
            settings.target_naming(Addressing::DriveLetter).unwrap(),
            TargetNaming::DriveLetters
        );
    }
}
