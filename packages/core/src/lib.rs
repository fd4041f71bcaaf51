//! ezmount-core: Core library for managing rclone mounts.
//!
//! This library reads rclone configuration files, turns their remotes into
//! mount mappings, supervises the `rclone mount` processes behind those
//! mappings and registers them to start at login.
//!
//! # Modules
//!
//! - [`conf`]: rclone config section parsing
//! - [`target`]: Drive letter and directory mount targets
//! - [`mapping`]: Mapping records and auto-generation
//! - [`rclone`]: Executable lookup and mount arguments
//! - [`process`]: Detached launch and graceful termination
//! - [`supervisor`]: Tracked mounts, start/stop and reconciliation
//! - [`startup`]: Autostart artifacts and the startup manifest
//! - [`settings`]: Persisted user settings
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use ezmount_core::{conf, mapping, MountSupervisor, Settings};
//!
//! let settings = Settings::load(&Settings::default_path().unwrap()).unwrap();
//! let config = conf::load_config(Path::new("/home/me/.config/rclone/rclone.conf")).unwrap();
//!
//! let supervisor = MountSupervisor::new(settings.supervisor_settings());
//! let naming = settings
//!     .target_naming(supervisor.settings().addressing)
//!     .unwrap();
//!
//! let mut store = mapping::MappingStore::new(naming);
//! store.auto_generate(&config.sections, &mut mapping::NoExtraBuckets);
//!
//! for record in store.records() {
//!     if !supervisor.is_target_live(&record.target) {
//!         supervisor.start_mount(record, &config.path).unwrap();
//!     }
//! }
//! ```

pub mod conf;
pub mod error;
pub mod mapping;
pub mod process;
pub mod rclone;
pub mod settings;
pub mod startup;
pub mod supervisor;
pub mod target;

// Re-export commonly used types
pub use conf::{LoadedConfig, Section, Sections};
pub use error::{Error, Result};
pub use mapping::{BucketPrompt, MappingEdit, MappingId, MappingRecord, MappingStore};
pub use settings::Settings;
pub use startup::{StartupEntry, StartupLayout, StartupRegistrar};
pub use supervisor::{MountState, MountSupervisor, StopOutcome, TrackedMount};
pub use target::{Addressing, DirectoryCheck, MountTarget};
