//! rclone configuration parsing.
//!
//! This module turns the INI-like text of an `rclone.conf` into ordered
//! sections of key/value pairs. The file is only ever read, never written.

use std::fs;
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tracing::debug;

use crate::error::{ConfigDecodeSnafu, IoResultExt, Result};

/// Prefix rclone writes at the top of an encrypted configuration.
pub const ENCRYPTED_CONFIG_MARKER: &str = "RCLONE_ENCRYPT_V0:";

/// A named configuration section with its keys in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Section name as written between the brackets (trimmed).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a key. Keys are case-sensitive, like rclone's own parser.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over key/value pairs in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }
}

/// All sections of a configuration, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sections {
    sections: Vec<Section>,
}

impl Sections {
    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Opens a section, resetting its contents if the name was seen before.
    /// The section keeps the position of its first occurrence.
    fn open(&mut self, name: &str) -> usize {
        match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => {
                self.sections[idx].entries.clear();
                idx
            }
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        }
    }
}

impl<'a> IntoIterator for &'a Sections {
    type Item = &'a Section;
    type IntoIter = std::slice::Iter<'a, Section>;

    fn into_iter(self) -> Self::IntoIter {
        self.sections.iter()
    }
}

/// Parses configuration text into sections.
///
/// Malformed lines are skipped; this never fails.
pub fn parse_sections(text: &str) -> Sections {
    let mut sections = Sections::default();
    let mut current: Option<usize> = None;

    for raw in text.lines() {
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(sections.open(inner.trim()));
            continue;
        }

        let Some(idx) = current else {
            continue;
        };

        if let Some((key, value)) = line.split_once('=') {
            sections.sections[idx].insert(key.trim(), value.trim());
        }
    }

    sections
}

/// A configuration file loaded from disk.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub text: String,
    pub sections: Sections,
}

impl LoadedConfig {
    /// Returns true if the file is an rclone-encrypted config.
    ///
    /// Encrypted configs expose no sections until rclone decrypts them.
    pub fn is_encrypted(&self) -> bool {
        self.text
            .lines()
            .any(|l| l.trim_start().starts_with(ENCRYPTED_CONFIG_MARKER))
    }
}

/// Reads and parses an rclone configuration file.
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let bytes = fs::read(path).config_read_context(path)?;
    let text = String::from_utf8(bytes).context(ConfigDecodeSnafu { path })?;
    let sections = parse_sections(&text);

    debug!(
        path = %path.display(),
        sections = sections.len(),
        "loaded rclone config"
    );

    Ok(LoadedConfig {
        path: path.to_path_buf(),
        text,
        sections,
    })
}
