//! Inspection of the segment implicated by a checksum error.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RecoveryError, RecoveryResult};

/// Read size used when scanning a segment for non-zero bytes.
pub const SEGMENT_SCAN_CHUNK: usize = 1024;

/// What the scan found in a segment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInspection {
    /// The scanned file.
    pub path: PathBuf,
    /// Number of bytes read.
    pub size_bytes: u64,
    /// True if every byte read was zero. An empty file counts as all zeros.
    pub all_zero: bool,
}

/// Scans `path` and reports whether it holds only zero bytes.
///
/// A segment that was preallocated but never written reads back as zeros and
/// can be dropped from the manifest without losing data.
pub fn inspect_segment(path: &Path) -> RecoveryResult<SegmentInspection> {
    let mut file = File::open(path).map_err(|e| RecoveryError::fs("open segment", path, e))?;
    file.metadata()
        .map_err(|e| RecoveryError::fs("stat segment", path, e))?;

    let mut buf = [0u8; SEGMENT_SCAN_CHUNK];
    let mut size_bytes = 0u64;
    let mut all_zero = true;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(RecoveryError::fs("read segment", path, e)),
        };
        size_bytes += n as u64;
        if all_zero && buf[..n].iter().any(|&b| b != 0) {
            all_zero = false;
            debug!(path = %path.display(), offset = size_bytes - n as u64, "found non-zero chunk");
        }
    }

    debug!(path = %path.display(), size_bytes, all_zero, "segment scanned");

    Ok(SegmentInspection {
        path: path.to_path_buf(),
        size_bytes,
        all_zero,
    })
}
