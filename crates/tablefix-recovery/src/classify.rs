//! Classification of store open errors.
//!
//! An open either succeeds, fails with a checksum error that names a segment
//! file, or fails for a reason the workflow must not try to repair.
//!
//! Engines that report the corrupted segment in
//! [`EngineError::corrupted_segment`] are classified from that field. Otherwise
//! the segment path is taken from the error text with [`extract_segment_path`],
//! which relies on the engine formatting checksum errors as
//! `"<description>: <path>"`. That format is not a stable contract, so the
//! heuristic is only a fallback.

use std::path::PathBuf;

use tracing::debug;

use crate::config::OpenOptions;
use crate::engine::StoreEngine;
use crate::error::EngineError;

/// Substring that marks an open error as checksum corruption.
pub const CORRUPTION_MARKER: &str = "checksum";

/// Result of an open attempt.
#[derive(Debug)]
pub enum OpenOutcome<H> {
    /// The store opened; the handle must be closed by the receiver.
    Healthy(H),
    /// The store failed a checksum on the given segment file.
    Corrupted(PathBuf),
    /// The store failed to open for any other reason.
    Fatal(EngineError),
}

/// Returns true if the error reports checksum corruption.
pub fn is_corruption(err: &EngineError) -> bool {
    err.corrupted_segment.is_some() || err.message.contains(CORRUPTION_MARKER)
}

/// Recovers the segment path from an engine message.
///
/// Takes the text after the last `:` and trims it. Returns `None` when that
/// leaves nothing.
pub fn extract_segment_path(message: &str) -> Option<PathBuf> {
    let last = message.rsplit(':').next().unwrap_or(message).trim();
    if last.is_empty() {
        None
    } else {
        Some(PathBuf::from(last))
    }
}

/// Classifies an open error.
///
/// A checksum error whose message yields no path stays `Fatal`; use
/// [`is_corruption`] to tell it apart from an unsupported error.
pub fn classify_open_error<H>(err: EngineError) -> OpenOutcome<H> {
    if let Some(segment) = &err.corrupted_segment {
        return OpenOutcome::Corrupted(segment.clone());
    }
    if !err.message.contains(CORRUPTION_MARKER) {
        return OpenOutcome::Fatal(err);
    }
    match extract_segment_path(&err.message) {
        Some(segment) => OpenOutcome::Corrupted(segment),
        None => OpenOutcome::Fatal(err),
    }
}

/// Opens the store and classifies the result.
pub fn probe<E: StoreEngine>(engine: &E, options: &OpenOptions) -> OpenOutcome<E::Handle> {
    match engine.open(options) {
        Ok(handle) => OpenOutcome::Healthy(handle),
        Err(err) => {
            debug!(error = %err, "open failed, classifying");
            classify_open_error(err)
        }
    }
}
