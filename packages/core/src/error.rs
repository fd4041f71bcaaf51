//! Unified error types for the ezmount-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// rclone configuration file could not be read.
    #[snafu(display("failed to read rclone config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// rclone configuration file is not valid UTF-8.
    #[snafu(display("rclone config at {} is not valid UTF-8", path.display()))]
    ConfigDecode {
        path: PathBuf,
        source: std::string::FromUtf8Error,
    },

    /// The mount executable could not be resolved on PATH.
    #[snafu(display("'{name}' executable not found on PATH"))]
    RcloneNotFound { name: String, source: which::Error },

    /// A mapping has no remote specification.
    #[snafu(display("mapping '{label}' has an empty remote"))]
    EmptyRemote { label: String },

    /// Target string does not match the platform addressing convention.
    #[snafu(display("invalid mount target '{target}': {reason}"))]
    InvalidTarget { target: String, reason: String },

    /// Another process-owned mount already holds the target.
    #[snafu(display("target {target} is already held by mount '{key}'"))]
    TargetInUse { target: String, key: String },

    /// No mapping with the given id.
    #[snafu(display("mapping {id} not found"))]
    MappingNotFound { id: String },

    /// No tracked mount for the given target.
    #[snafu(display("no tracked mount for target {target}"))]
    NotTracked { target: String },

    /// The mount executable could not be launched.
    #[snafu(display("failed to launch '{command}'"))]
    MountSpawn {
        command: String,
        source: std::io::Error,
    },

    /// The directory to mount on could not be created.
    #[snafu(display("failed to create mount point {}", path.display()))]
    MountPointCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Sending a signal to a mount process failed.
    #[snafu(display("failed to signal process {pid}: {message}"))]
    ProcessSignal { pid: u32, message: String },

    /// Waiting for a mount process failed.
    #[snafu(display("failed to wait for process {pid}"))]
    ProcessWait { pid: u32, source: std::io::Error },

    /// Home directory not found.
    #[snafu(display("Could not determine home directory"))]
    HomeDirNotFound,

    /// Per-user configuration directory not found.
    #[snafu(display("Could not determine the user configuration directory"))]
    ConfigDirNotFound,

    /// Per-user data directory not found.
    #[snafu(display("Could not determine the user data directory"))]
    DataDirNotFound,

    /// OS autostart directory could not be determined.
    #[snafu(display("Could not determine the autostart directory"))]
    AutostartDirNotFound,

    /// Failed to write a startup artifact.
    #[snafu(display("failed to write startup artifact at {}", path.display()))]
    ArtifactWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to remove a startup artifact.
    #[snafu(display("failed to remove startup artifact at {}", path.display()))]
    ArtifactRemove {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write the startup manifest.
    #[snafu(display("failed to write startup manifest at {}", path.display()))]
    ManifestWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize the startup manifest.
    #[snafu(display("failed to serialize startup manifest"))]
    ManifestSerialize { source: serde_json::Error },

    /// Failed to read the settings file.
    #[snafu(display("failed to read settings at {}", path.display()))]
    SettingsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write the settings file.
    #[snafu(display("failed to write settings at {}", path.display()))]
    SettingsWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Settings file is not valid JSON for the settings schema.
    #[snafu(display("failed to parse settings at {}", path.display()))]
    SettingsParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Failed to serialize settings.
    #[snafu(display("failed to serialize settings"))]
    SettingsSerialize { source: serde_json::Error },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for rclone config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for startup artifact write errors.
    fn artifact_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for startup artifact removal errors.
    fn artifact_remove_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for manifest write errors.
    fn manifest_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for settings write errors.
    fn settings_write_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn artifact_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ArtifactWriteSnafu { path: path.into() })
    }

    fn artifact_remove_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ArtifactRemoveSnafu { path: path.into() })
    }

    fn manifest_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ManifestWriteSnafu { path: path.into() })
    }

    fn settings_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(SettingsWriteSnafu { path: path.into() })
    }
}
