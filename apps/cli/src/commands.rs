//! Subcommand handlers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::thread;

use ezmount_core::conf::{self, LoadedConfig};
use ezmount_core::mapping::MappingStore;
use ezmount_core::{
    MountSupervisor, Settings, StartupEntry, StartupRegistrar, StopOutcome, TrackedMount,
};
use snafu::OptionExt;
use tracing::{info, warn};

use crate::{
    BucketArgs, Cli, CliResult, Commands, NoConfigSnafu, StartupCommands, UnknownLabelsSnafu,
};

/// Settings plus where they came from.
struct Session {
    settings_path: PathBuf,
    settings: Settings,
}

impl Session {
    fn open(path: Option<PathBuf>) -> CliResult<Self> {
        let settings_path = match path {
            Some(path) => path,
            None => Settings::default_path()?,
        };
        let settings = Settings::load(&settings_path)?;
        Ok(Self {
            settings_path,
            settings,
        })
    }

    /// Loads the rclone config and remembers it for next time.
    fn load_config(&mut self, explicit: Option<PathBuf>) -> CliResult<LoadedConfig> {
        let path = explicit
            .or_else(|| self.settings.last_config.clone())
            .context(NoConfigSnafu)?;
        let config = conf::load_config(&path)?;

        if config.is_encrypted() {
            warn!(path = %path.display(), "rclone config is encrypted; no remotes can be read");
        }

        if self.settings.last_config.as_deref() != Some(path.as_path()) {
            self.settings.last_config = Some(path);
            if let Err(e) = self.settings.save(&self.settings_path) {
                warn!(error = %e, "could not remember config path");
            }
        }

        Ok(config)
    }

    fn supervisor(&self) -> MountSupervisor {
        MountSupervisor::new(self.settings.supervisor_settings())
    }

    fn mappings(
        &self,
        supervisor: &MountSupervisor,
        config: &LoadedConfig,
        buckets: &BucketArgs,
    ) -> CliResult<MappingStore> {
        let naming = self.settings.target_naming(supervisor.settings().addressing)?;
        let mut store = MappingStore::new(naming);

        let extra: HashMap<&str, &[String]> = buckets
            .buckets
            .iter()
            .map(|spec| (spec.section.as_str(), spec.buckets.as_slice()))
            .collect();
        let mut prompt = |section: &str| -> Vec<String> {
            extra.get(section).map(|b| b.to_vec()).unwrap_or_default()
        };

        store.auto_generate(&config.sections, &mut prompt);
        Ok(store)
    }

    /// Manifest entries, or none when the startup layout is unavailable.
    fn startup_entries(&self) -> Vec<StartupEntry> {
        match self.settings.startup_layout() {
            Ok(layout) => StartupRegistrar::new(layout).load(),
            Err(e) => {
                warn!(error = %e, "startup manifest unavailable");
                Vec::new()
            }
        }
    }
}

pub fn run(cli: Cli) -> CliResult<()> {
    let mut session = Session::open(cli.settings)?;

    match cli.command {
        Commands::Sections => {
            let config = session.load_config(cli.config)?;
            print_sections(&config);
        }
        Commands::Mappings(buckets) => {
            let config = session.load_config(cli.config)?;
            let supervisor = session.supervisor();
            let store = session.mappings(&supervisor, &config, &buckets)?;
            for record in store.records() {
                println!("{:<24} {:<32} {}", record.label, record.remote, record.target);
            }
        }
        Commands::Mount { buckets, force } => {
            let config = session.load_config(cli.config)?;
            let supervisor = session.supervisor();
            let store = session.mappings(&supervisor, &config, &buckets)?;
            mount_all(&session, &supervisor, &store, &config.path, force);
        }
        Commands::Status => {
            let supervisor = session.supervisor();
            let records = optional_records(&mut session, &supervisor, cli.config);
            supervisor.reconcile(records.records(), &session.startup_entries());
            print_mounts(&supervisor.mounts());
        }
        Commands::Unmount {
            target,
            refresh_shell,
        } => {
            let supervisor = session.supervisor();
            let records = optional_records(&mut session, &supervisor, cli.config);
            supervisor.reconcile(records.records(), &session.startup_entries());
            unmount(&supervisor, target.as_deref(), refresh_shell)?;
        }
        Commands::Startup(command) => startup(&mut session, cli.config, command)?,
    }

    Ok(())
}

/// Mappings for detection when a config is available, otherwise none.
fn optional_records(
    session: &mut Session,
    supervisor: &MountSupervisor,
    config: Option<PathBuf>,
) -> MappingStore {
    let naming = session
        .settings
        .target_naming(supervisor.settings().addressing)
        .unwrap_or(ezmount_core::mapping::TargetNaming::DriveLetters);

    if config.is_none() && session.settings.last_config.is_none() {
        return MappingStore::new(naming);
    }

    let loaded = session
        .load_config(config)
        .and_then(|c| session.mappings(supervisor, &c, &BucketArgs::default()));
    match loaded {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "scanning startup entries only");
            MappingStore::new(naming)
        }
    }
}

fn print_sections(config: &LoadedConfig) {
    if config.sections.is_empty() {
        println!("no sections in {}", config.path.display());
        return;
    }

    for section in &config.sections {
        // Values may hold credentials; show the type only.
        match section.get("type") {
            Some(kind) => println!("[{}] type={} ({} keys)", section.name(), kind, section.len()),
            None => println!("[{}] ({} keys)", section.name(), section.len()),
        }
    }
}

fn print_mounts(mounts: &[TrackedMount]) {
    if mounts.is_empty() {
        println!("no mounts");
        return;
    }

    for mount in mounts {
        let owner = if mount.detected {
            if mount.startup_origin {
                "detected (startup)".to_string()
            } else {
                "detected".to_string()
            }
        } else {
            format!("pid {}", mount.pid.map(|p| p.to_string()).unwrap_or_default())
        };
        println!(
            "{:<9} {:<48} {:<20} since {}",
            mount.state.to_string(),
            mount.key,
            owner,
            mount.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn mount_all(
    session: &Session,
    supervisor: &MountSupervisor,
    store: &MappingStore,
    config_path: &Path,
    force: bool,
) {
    for record in store.records() {
        if should_skip(supervisor, &record.target, force) {
            println!("skip  {} -> {} (already mounted)", record.remote, record.target);
            continue;
        }
        match supervisor.start_mount(record, config_path) {
            Ok(_) => println!("start {} -> {}", record.remote, record.target),
            Err(e) => println!("fail  {} -> {}: {}", record.remote, record.target, e),
        }
    }

    watch(session, supervisor, store);
}

/// Live targets are left alone unless forced. A directory only counts as
/// live when something is mounted on it.
fn should_skip(supervisor: &MountSupervisor, target: &str, force: bool) -> bool {
    !force && supervisor.is_target_live(target)
}

/// Reconciles until no mount launched by this process is running.
fn watch(session: &Session, supervisor: &MountSupervisor, store: &MappingStore) {
    let owned = |mounts: Vec<TrackedMount>| -> HashSet<String> {
        mounts
            .into_iter()
            .filter(TrackedMount::is_process_owned)
            .map(|m| m.key)
            .collect()
    };

    let mut running = owned(supervisor.mounts());
    if running.is_empty() {
        return;
    }

    let interval = session.settings.reconcile_interval();
    println!("watching {} mount(s); interrupt to leave them running", running.len());

    while !running.is_empty() {
        thread::sleep(interval);
        let report = supervisor.reconcile(store.records(), &session.startup_entries());
        for key in &report.detected {
            info!(key = %key, "detected mount");
        }

        let now = owned(supervisor.mounts());
        for key in running.difference(&now) {
            println!("exited {}", key);
        }
        running = now;
    }
}

fn unmount(supervisor: &MountSupervisor, target: Option<&str>, refresh_shell: bool) -> CliResult<()> {
    let refresh_recommended = match target {
        Some(target) => {
            let outcome = supervisor.stop_mount(target)?;
            print_outcome(target, &outcome);
            supervisor.settings().addressing == ezmount_core::Addressing::DriveLetter
        }
        None => {
            let report = supervisor.stop_all();
            if report.outcomes.is_empty() {
                println!("nothing to unmount");
            }
            for (key, outcome) in &report.outcomes {
                print_outcome(key, outcome);
            }
            report.refresh_recommended
        }
    };

    if refresh_shell {
        supervisor.refresh_shell_view()?;
    } else if refresh_recommended {
        println!("hint: pass --refresh-shell if Explorer still lists the drive");
    }
    Ok(())
}

fn print_outcome(what: &str, outcome: &StopOutcome) {
    println!("{}: {}", what, outcome);
    if outcome.was_detection_only() {
        println!("  warning: this mount was not started here; the unmount was best-effort");
    }
}

fn startup(session: &mut Session, config: Option<PathBuf>, command: StartupCommands) -> CliResult<()> {
    let registrar = StartupRegistrar::new(session.settings.startup_layout()?);

    match command {
        StartupCommands::Commit { buckets, only } => {
            let loaded = session.load_config(config)?;
            let supervisor = session.supervisor();
            let store = session.mappings(&supervisor, &loaded, &buckets)?;

            let mut records = store.records().to_vec();
            if only.is_empty() {
                records.iter_mut().for_each(|r| r.startup = true);
            } else {
                let unknown: Vec<String> = only
                    .iter()
                    .filter(|label| !records.iter().any(|r| &r.label == *label))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return UnknownLabelsSnafu { labels: unknown }.fail();
                }
                for record in &mut records {
                    record.startup = only.contains(&record.label);
                }
            }

            let rclone = supervisor.locate_rclone()?;
            let report = registrar.commit(&records, &rclone, &loaded.path)?;
            for entry in &report.entries {
                println!("{} -> {}", entry.label, entry.artifact_path.display());
            }
            for (label, error) in &report.failures {
                println!("failed {}: {}", label, error);
            }
        }
        StartupCommands::Clear => {
            let report = registrar.clear_all();
            println!(
                "removed {} startup entr{}{}",
                report.removed,
                if report.removed == 1 { "y" } else { "ies" },
                if report.failed > 0 {
                    format!(", {} could not be removed", report.failed)
                } else {
                    String::new()
                }
            );
        }
        StartupCommands::List => {
            let entries = registrar.load();
            if entries.is_empty() {
                println!("no startup entries");
            }
            for entry in entries {
                println!(
                    "{:<24} {} -> {}  ({}, {})",
                    entry.label,
                    entry.remote,
                    entry.target,
                    entry.artifact_path.display(),
                    entry.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }

    Ok(())
}
