//! Mapping records and their auto-generation from rclone config sections.
//!
//! A mapping pairs a remote specification (`remote:bucket/path`) with a label
//! and a mount target. The store keeps them in display order; the
//! presentation layer edits them and hands snapshots to the supervisor and
//! the startup registrar.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::conf::{Section, Sections};
use crate::error::{Error, Result};
use crate::target::{Addressing, DriveLetterAllocator};

/// `type` values that mark a remote as bucket-based object storage.
pub const OBJECT_STORAGE_TYPES: &[&str] = &["s3"];

/// Keys that name a bucket inside a remote section, in lookup order.
pub const BUCKET_KEYS: &[&str] = &["bucket", "bucket_name"];

/// Opaque mapping identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingId(Uuid);

impl MappingId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A remote-to-target mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub id: MappingId,
    /// Remote specification, e.g. `gdrive:` or `s3:bucket/path`.
    pub remote: String,
    pub label: String,
    /// Drive letter token or directory path.
    pub target: String,
    /// Whether the mapping should be registered as a startup entry.
    pub startup: bool,
}

/// Field-level edit; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct MappingEdit {
    pub remote: Option<String>,
    pub label: Option<String>,
    pub target: Option<String>,
    pub startup: Option<bool>,
}

/// Collaborator asked for extra bucket names while auto-generating.
///
/// Called once per bucket-based section. Closures of the form
/// `FnMut(&str) -> Vec<String>` implement it.
pub trait BucketPrompt {
    fn extra_buckets(&mut self, section: &str) -> Vec<String>;
}

impl<F> BucketPrompt for F
where
    F: FnMut(&str) -> Vec<String>,
{
    fn extra_buckets(&mut self, section: &str) -> Vec<String> {
        self(section)
    }
}

/// Prompt that never adds buckets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtraBuckets;

impl BucketPrompt for NoExtraBuckets {
    fn extra_buckets(&mut self, _section: &str) -> Vec<String> {
        Vec::new()
    }
}

/// How auto-generated mappings get their targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetNaming {
    /// `X:`, `W:`, ... from the cyclic allocator.
    DriveLetters,
    /// `<base>/<label>` directories.
    Directories { base: PathBuf },
}

impl TargetNaming {
    /// Naming that fits an addressing convention.
    pub fn for_addressing(addressing: Addressing, mount_base: PathBuf) -> Self {
        match addressing {
            Addressing::DriveLetter => TargetNaming::DriveLetters,
            Addressing::Directory => TargetNaming::Directories { base: mount_base },
        }
    }
}

/// Returns the default base directory for path-addressed mounts.
///
/// # Errors
/// Returns an error if the home directory cannot be determined.
pub fn default_mount_base() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(Error::HomeDirNotFound)?;
    Ok(home.join("EZMount"))
}

/// Ordered collection of mapping records.
#[derive(Debug, Clone)]
pub struct MappingStore {
    records: Vec<MappingRecord>,
    naming: TargetNaming,
}

impl MappingStore {
    pub fn new(naming: TargetNaming) -> Self {
        Self {
            records: Vec::new(),
            naming,
        }
    }

    pub fn records(&self) -> &[MappingRecord] {
        &self.records
    }

    pub fn get(&self, id: MappingId) -> Option<&MappingRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replaces all records with mappings derived from `sections`.
    ///
    /// Bucket-based sections emit one record per bucket: the one named in
    /// the section (if any) followed by whatever `prompt` returns for it.
    /// Every other section emits a single `<section>:` record.
    pub fn auto_generate(
        &mut self,
        sections: &Sections,
        prompt: &mut dyn BucketPrompt,
    ) -> &[MappingRecord] {
        self.records.clear();
        let mut letters = DriveLetterAllocator::new();

        for section in sections {
            let name = section.name();

            if !is_bucket_remote(section) {
                self.push_generated(format!("{}:", name), name.to_string(), &mut letters);
                continue;
            }

            let mut buckets: Vec<String> = section_bucket(section).into_iter().collect();
            buckets.extend(
                prompt
                    .extra_buckets(name)
                    .iter()
                    .map(|b| b.trim())
                    .filter(|b| !b.is_empty())
                    .map(str::to_string),
            );

            for bucket in buckets {
                self.push_generated(
                    format!("{}:{}", name, bucket),
                    format!("{}-{}", name, bucket),
                    &mut letters,
                );
            }
        }

        debug!(count = self.records.len(), "auto-generated mappings");
        &self.records
    }

    fn push_generated(&mut self, remote: String, label: String, letters: &mut DriveLetterAllocator) {
        let letter = letters.next_token();
        let target = match &self.naming {
            TargetNaming::DriveLetters => letter,
            TargetNaming::Directories { base } => base
                .join(sanitize_mount_name(&label))
                .to_string_lossy()
                .into_owned(),
        };

        self.records.push(MappingRecord {
            id: MappingId::new(),
            remote,
            label,
            target,
            startup: false,
        });
    }

    /// Appends a mapping. The label defaults to the remote.
    pub fn add(
        &mut self,
        remote: impl Into<String>,
        label: Option<String>,
        target: impl Into<String>,
        startup: bool,
    ) -> MappingId {
        let remote = remote.into();
        let record = MappingRecord {
            id: MappingId::new(),
            label: label.unwrap_or_else(|| remote.clone()),
            remote,
            target: target.into(),
            startup,
        };
        let id = record.id;
        self.records.push(record);
        id
    }

    /// Applies a field-level edit to a mapping.
    pub fn edit(&mut self, id: MappingId, edit: MappingEdit) -> Result<&MappingRecord> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::MappingNotFound { id: id.to_string() })?;

        if let Some(remote) = edit.remote {
            record.remote = remote;
        }
        if let Some(label) = edit.label {
            record.label = label;
        }
        if let Some(target) = edit.target {
            record.target = target;
        }
        if let Some(startup) = edit.startup {
            record.startup = startup;
        }

        Ok(record)
    }

    pub fn remove(&mut self, id: MappingId) -> Result<MappingRecord> {
        let idx = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::MappingNotFound { id: id.to_string() })?;
        Ok(self.records.remove(idx))
    }

    /// Removes every mapping. The caller is expected to confirm first.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

fn is_bucket_remote(section: &Section) -> bool {
    let is_object_storage = section
        .get("type")
        .map(|t| {
            OBJECT_STORAGE_TYPES
                .iter()
                .any(|known| t.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false);

    is_object_storage || section_bucket(section).is_some()
}

fn section_bucket(section: &Section) -> Option<String> {
    BUCKET_KEYS
        .iter()
        .filter_map(|key| section.get(key))
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Makes a label safe to use as a single path component.
fn sanitize_mount_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "remote".to_string()
    } else {
        sanitized
    }
}
