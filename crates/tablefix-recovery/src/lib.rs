#![warn(missing_docs)]

//! Tablefix recovery subsystem: checksum-corruption detection, backup and manifest repair
//!
//! This crate drives the repair of an on-disk table store whose open call fails
//! with a checksum error. It classifies the open error, inspects the implicated
//! segment, snapshots the whole store with an attribute-preserving directory
//! clone, and only then asks the storage engine to drop corrupted segments from
//! its manifest.

pub mod classify;
pub mod clone;
pub mod config;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod recovery;
pub mod verify;

pub use classify::{
    classify_open_error, extract_segment_path, is_corruption, probe, OpenOutcome,
    CORRUPTION_MARKER,
};
pub use clone::{clone_dir, CloneStats, EntryKind, FileAttributes};
pub use config::{OpenOptions, RecoveryConfig, StoreConfig, KEEP_ALL_VERSIONS};
pub use engine::{MockHandle, MockOpen, MockStoreEngine, StoreEngine, StoreHandle};
pub use error::{EngineError, RecoveryError, RecoveryResult};
pub use inspect::{inspect_segment, SegmentInspection, SEGMENT_SCAN_CHUNK};
pub use recovery::{
    default_backup_dir, RecoveryOutcome, RecoveryPhase, RecoveryWorkflow, BACKUP_SUFFIX,
};
pub use verify::{verify_clone, VerifyReport};
