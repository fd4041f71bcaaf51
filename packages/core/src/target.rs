//! Mount targets and platform addressing.
//!
//! A mount target is either a drive letter token (`X:`) on letter-addressed
//! platforms or a directory path elsewhere. The addressing convention is a
//! runtime value so both kinds can be validated on any host.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// First letter handed out by [`DriveLetterAllocator`].
pub const FIRST_DRIVE_LETTER: char = 'X';

/// How the host names mount targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Addressing {
    /// Single drive letters (`X:`), as on Windows.
    DriveLetter,
    /// Directory paths, as on Linux and macOS.
    Directory,
}

impl Addressing {
    /// Returns the convention of the platform this binary was built for.
    pub fn host() -> Self {
        if cfg!(windows) {
            Addressing::DriveLetter
        } else {
            Addressing::Directory
        }
    }
}

impl fmt::Display for Addressing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addressing::DriveLetter => write!(f, "drive letter"),
            Addressing::Directory => write!(f, "directory"),
        }
    }
}

/// How a directory target is judged live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryCheck {
    /// The directory exists.
    Exists,
    /// The directory is the root of a mounted filesystem.
    MountPoint,
}

impl DirectoryCheck {
    /// Mount point detection where the platform supports it.
    pub fn host() -> Self {
        if cfg!(unix) {
            DirectoryCheck::MountPoint
        } else {
            DirectoryCheck::Exists
        }
    }
}

/// A validated mount target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MountTarget {
    /// Uppercase drive letter.
    Drive(char),
    Directory(PathBuf),
}

impl MountTarget {
    /// Parses a raw target string for the given addressing convention.
    ///
    /// Drive letters accept `X`, `X:`, `X:\` and `X:/` in either case.
    /// Directory targets reject drive tokens and empty strings.
    pub fn parse(raw: &str, addressing: Addressing) -> Result<Self> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| Error::InvalidTarget {
            target: raw.to_string(),
            reason: reason.to_string(),
        };

        match addressing {
            Addressing::DriveLetter => parse_drive_token(trimmed)
                .map(MountTarget::Drive)
                .ok_or_else(|| invalid("expected a drive letter such as X:")),
            Addressing::Directory => {
                if trimmed.is_empty() {
                    return Err(invalid("empty path"));
                }
                if trimmed.contains('\0') {
                    return Err(invalid("path contains a NUL byte"));
                }
                if parse_drive_token(trimmed).is_some() {
                    return Err(invalid("drive letters are not supported on this platform"));
                }
                Ok(MountTarget::Directory(PathBuf::from(trimmed)))
            }
        }
    }

    /// Filesystem path whose existence means the target is live.
    pub fn root_path(&self) -> PathBuf {
        match self {
            MountTarget::Drive(letter) => PathBuf::from(format!("{}:\\", letter)),
            MountTarget::Directory(path) => path.clone(),
        }
    }

    /// Returns true if the target is live.
    ///
    /// Drive letters are live when their root exists. Directories are judged
    /// by `check`.
    pub fn is_live(&self, check: DirectoryCheck) -> bool {
        match self {
            MountTarget::Drive(_) => self.root_path().exists(),
            MountTarget::Directory(path) => match check {
                DirectoryCheck::Exists => path.is_dir(),
                DirectoryCheck::MountPoint => is_mount_point(path),
            },
        }
    }

    /// The target as passed on the rclone command line.
    pub fn as_arg(&self) -> String {
        self.to_string()
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            MountTarget::Drive(_) => None,
            MountTarget::Directory(path) => Some(path),
        }
    }
}

impl fmt::Display for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountTarget::Drive(letter) => write!(f, "{}:", letter),
            MountTarget::Directory(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A directory is a mount point when it sits on another device than its
/// parent, or is its own parent (`/`). A FUSE mount whose process died fails
/// `stat` with `ENOTCONN` and counts as not mounted.
#[cfg(unix)]
fn is_mount_point(path: &Path) -> bool {
    use nix::sys::stat::stat;

    if !path.is_dir() {
        return false;
    }
    let (Ok(own), Ok(parent)) = (stat(path), stat(&path.join(".."))) else {
        return false;
    };
    own.st_dev != parent.st_dev || own.st_ino == parent.st_ino
}

#[cfg(not(unix))]
fn is_mount_point(path: &Path) -> bool {
    path.is_dir()
}

fn parse_drive_token(s: &str) -> Option<char> {
    let mut chars = s.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_alphabetic() {
        return None;
    }

    let rest: String = chars.collect();
    match rest.as_str() {
        "" | ":" | ":\\" | ":/" => Some(letter.to_ascii_uppercase()),
        _ => None,
    }
}

/// Cyclic drive letter allocator.
///
/// Letters descend from `X` to `A`, then wrap around to `Z`.
#[derive(Debug, Clone)]
pub struct DriveLetterAllocator {
    next: char,
}

impl DriveLetterAllocator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_DRIVE_LETTER)
    }

    /// Starts the cycle at another letter (uppercased). Anything that is not
    /// an ASCII letter starts at `X`.
    pub fn starting_at(letter: char) -> Self {
        let next = if letter.is_ascii_alphabetic() {
            letter.to_ascii_uppercase()
        } else {
            FIRST_DRIVE_LETTER
        };
        Self { next }
    }

    /// Returns the current letter and steps to the next one.
    pub fn next_letter(&mut self) -> char {
        let current = self.next;
        self.next = if current <= 'A' {
            'Z'
        } else {
            ((current as u8) - 1) as char
        };
        current
    }

    /// Returns the next target token, e.g. `X:`.
    pub fn next_token(&mut self) -> String {
        format!("{}:", self.next_letter())
    }
}

impl Default for DriveLetterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for DriveLetterAllocator {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        Some(self.next_letter())
    }
}
