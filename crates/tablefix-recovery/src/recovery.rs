//! Corruption recovery workflow.
//!
//! Probes the store, classifies the open error, inspects the implicated
//! segment, snapshots the store and finally asks the engine to drop corrupted
//! segments from its manifest:
//!
//! ```text
//! Probing -> Healthy
//!         -> Classifying -> Unsupported
//!                        -> Inspecting -> Declined
//!                                      -> BackingUp -> Repairing -> Verifying -> Fixed | FixFailed
//! ```
//!
//! The store directory is not touched until a verified backup exists.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::classify::{is_corruption, probe, OpenOutcome};
use crate::clone::clone_dir;
use crate::config::{OpenOptions, RecoveryConfig};
use crate::engine::{StoreEngine, StoreHandle};
use crate::error::{RecoveryError, RecoveryResult};
use crate::inspect::inspect_segment;
use crate::verify::verify_clone;

/// Suffix of generated backup directory names.
pub const BACKUP_SUFFIX: &str = "_corrupted_backup";

/// Phase of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RecoveryPhase {
    /// `run` has not been called.
    #[default]
    NotStarted,
    /// Opening the store with diagnostic options.
    Probing,
    /// The store opened cleanly.
    Healthy,
    /// Deciding what kind of failure the open reported.
    Classifying,
    /// The failure is not a checksum error; nothing was done.
    Unsupported,
    /// Scanning the corrupted segment.
    Inspecting,
    /// The segment holds data and no override was given; nothing was done.
    Declined,
    /// Cloning and verifying the store directory.
    BackingUp,
    /// First destructive open.
    Repairing,
    /// Second destructive open.
    Verifying,
    /// The store opens after repair.
    Fixed,
    /// The repair sequence failed.
    FixFailed,
    /// A filesystem or engine error stopped the run before repair.
    Aborted,
}

impl RecoveryPhase {
    /// Returns true if the run ends in this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryPhase::Healthy
                | RecoveryPhase::Unsupported
                | RecoveryPhase::Declined
                | RecoveryPhase::Fixed
                | RecoveryPhase::FixFailed
                | RecoveryPhase::Aborted
        )
    }
}

/// Non-error result of a recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    /// The store opened; nothing was changed.
    Healthy,
    /// The corrupted segment holds data; re-run with the force override to drop it.
    NotEmpty {
        /// The segment that failed its checksum.
        segment: PathBuf,
    },
    /// Corrupted segments were dropped from the manifest.
    Fixed {
        /// Where the pre-repair snapshot was written.
        backup_dir: PathBuf,
        /// The segment that failed its checksum.
        segment: PathBuf,
    },
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryOutcome::Healthy => write!(f, "database is healthy"),
            RecoveryOutcome::NotEmpty { segment } => write!(
                f,
                "table {} is not empty, set force_delete_non_empty to delete it",
                segment.display()
            ),
            RecoveryOutcome::Fixed { backup_dir, .. } => {
                write!(f, "database is fixed (backup at {})", backup_dir.display())
            }
        }
    }
}

/// Backup location used when the caller does not supply one:
/// `<store dir>_corrupted_backup_<unix secs>`, next to the store.
pub fn default_backup_dir(store_dir: &Path, unix_secs: u64) -> PathBuf {
    let name = store_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    store_dir.with_file_name(format!("{}{}_{}", name, BACKUP_SUFFIX, unix_secs))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Drives one recovery run against a storage engine.
pub struct RecoveryWorkflow<'a, E: StoreEngine> {
    engine: &'a E,
    config: RecoveryConfig,
    phase: RecoveryPhase,
    backup_dir: Option<PathBuf>,
    clock: fn() -> u64,
}

impl<'a, E: StoreEngine> RecoveryWorkflow<'a, E> {
    /// Creates a workflow for the store described by `config`.
    pub fn new(engine: &'a E, config: RecoveryConfig) -> Self {
        info!(
            store = %config.store.dir.display(),
            value_dir = %config.store.value_dir().display(),
            backup_dir = ?config.backup_dir,
            force_delete_non_empty = config.force_delete_non_empty,
            "creating recovery workflow"
        );

        Self {
            engine,
            config,
            phase: RecoveryPhase::NotStarted,
            backup_dir: None,
            clock: unix_now,
        }
    }

    /// Replaces the clock used to name generated backup directories.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Current phase.
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Backup destination, once the run has chosen one.
    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    /// The configuration this workflow was built with.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Runs the workflow to a terminal phase.
    pub fn run(&mut self) -> RecoveryResult<RecoveryOutcome> {
        let result = self.run_phases();
        if let Err(e) = &result {
            if !self.phase.is_terminal() {
                self.phase = RecoveryPhase::Aborted;
            }
            error!(phase = ?self.phase, error = %e, "recovery failed");
        }
        result
    }

    fn run_phases(&mut self) -> RecoveryResult<RecoveryOutcome> {
        self.transition(RecoveryPhase::Probing);
        let probe_options = OpenOptions::probe(&self.config.store);

        let segment = match probe(self.engine, &probe_options) {
            OpenOutcome::Healthy(handle) => {
                handle.close().map_err(RecoveryError::Close)?;
                self.transition(RecoveryPhase::Healthy);
                info!(store = %self.config.store.dir.display(), "database is healthy");
                return Ok(RecoveryOutcome::Healthy);
            }
            OpenOutcome::Corrupted(segment) => {
                self.transition(RecoveryPhase::Classifying);
                segment
            }
            OpenOutcome::Fatal(err) => {
                self.transition(RecoveryPhase::Classifying);
                if is_corruption(&err) {
                    return Err(RecoveryError::UnparseableSegmentPath {
                        message: err.message,
                    });
                }
                self.transition(RecoveryPhase::Unsupported);
                return Err(RecoveryError::Unsupported(err));
            }
        };

        let segment = if segment.is_relative() {
            self.config.store.dir.join(segment)
        } else {
            segment
        };

        self.transition(RecoveryPhase::Inspecting);
        let inspection = inspect_segment(&segment)?;
        if !inspection.all_zero && !self.config.force_delete_non_empty {
            self.transition(RecoveryPhase::Declined);
            warn!(
                segment = %segment.display(),
                size_bytes = inspection.size_bytes,
                "table is not empty, set force_delete_non_empty to delete it"
            );
            return Ok(RecoveryOutcome::NotEmpty { segment });
        }

        info!(
            segment = %segment.display(),
            all_zero = inspection.all_zero,
            "database is corrupted, trying to fix it"
        );

        self.transition(RecoveryPhase::BackingUp);
        let backup_dir = self.backup()?;

        self.transition(RecoveryPhase::Repairing);
        let repair_options = OpenOptions::repair(&self.config.store);

        // The first destructive open rewrites the manifest and is expected to fail.
        match self.engine.open(&repair_options) {
            Ok(handle) => {
                self.transition(RecoveryPhase::FixFailed);
                if let Err(e) = handle.close() {
                    warn!(error = %e, "failed to close store after unexpected repair success");
                }
                return Err(RecoveryError::FixedBeforeRestart);
            }
            Err(err) => debug!(error = %err, "first destructive open failed as expected"),
        }

        self.transition(RecoveryPhase::Verifying);
        match self.engine.open(&repair_options) {
            Ok(handle) => {
                if let Err(e) = handle.close() {
                    self.transition(RecoveryPhase::FixFailed);
                    return Err(RecoveryError::Close(e));
                }
            }
            Err(err) => {
                self.transition(RecoveryPhase::FixFailed);
                return Err(RecoveryError::RepairFailed(err));
            }
        }

        self.transition(RecoveryPhase::Fixed);
        info!(
            store = %self.config.store.dir.display(),
            backup = %backup_dir.display(),
            "database is fixed"
        );
        Ok(RecoveryOutcome::Fixed { backup_dir, segment })
    }

    /// Clones the store directory to the backup location and verifies the copy.
    fn backup(&mut self) -> RecoveryResult<PathBuf> {
        let store_dir = fs::canonicalize(&self.config.store.dir)
            .map_err(|e| RecoveryError::fs("canonicalize", &self.config.store.dir, e))?;

        let backup_dir = match &self.config.backup_dir {
            Some(dir) => dir.clone(),
            None => default_backup_dir(&store_dir, (self.clock)()),
        };
        let resolved = resolve_path(&backup_dir)
            .map_err(|e| RecoveryError::fs("resolve", &backup_dir, e))?;
        if resolved.starts_with(&store_dir) {
            return Err(RecoveryError::BackupInsideStore {
                store: store_dir,
                backup: backup_dir,
            });
        }
        self.backup_dir = Some(backup_dir.clone());

        info!(
            "creating backup from {} to {}",
            store_dir.display(),
            backup_dir.display()
        );

        clone_dir(&store_dir, &backup_dir)
            .and_then(|_| verify_clone(&store_dir, &backup_dir))
            .map_err(|e| RecoveryError::Backup {
                destination: backup_dir.clone(),
                source: Box::new(e),
            })?;

        Ok(backup_dir)
    }

    fn transition(&mut self, next: RecoveryPhase) {
        debug!(from = ?self.phase, to = ?next, "recovery phase");
        self.phase = next;
    }
}

/// Makes `path` absolute without requiring it to exist.
///
/// The longest existing prefix is canonicalized and the rest appended as is.
fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        match fs::canonicalize(existing) {
            Ok(mut resolved) => {
                for part in rest.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(e);
                };
                rest.push(name.to_os_string());
                existing = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
            }
            Err(e) => return Err(e),
        }
    }
}
