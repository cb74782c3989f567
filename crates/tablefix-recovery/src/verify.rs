//! Verification that a backup matches the tree it was cloned from.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clone::{EntryKind, FileAttributes};
use crate::error::{RecoveryError, RecoveryResult};

const COMPARE_CHUNK: usize = 64 * 1024;

/// Summary of a successful verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Source entries compared, not counting the root.
    pub entries_checked: u64,
    /// File content bytes compared.
    pub bytes_compared: u64,
}

/// Checks that every entry under `source` has an identical copy under `destination`.
///
/// Kind, ownership, link targets, mode bits of non-links and file content must
/// match. Entries that exist only in `destination` are ignored.
pub fn verify_clone(source: &Path, destination: &Path) -> RecoveryResult<VerifyReport> {
    let mut report = VerifyReport::default();
    verify_entries(source, destination, Path::new(""), &mut report)?;
    debug!(
        entries = report.entries_checked,
        bytes = report.bytes_compared,
        "backup verified"
    );
    Ok(report)
}

fn verify_entries(
    source: &Path,
    destination: &Path,
    rel: &Path,
    report: &mut VerifyReport,
) -> RecoveryResult<()> {
    let entries = fs::read_dir(source)
        .map_err(|e| RecoveryError::fs("read_dir", source, e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| RecoveryError::fs("read_dir", source, e))?;

    for entry in entries {
        let name = entry.file_name();
        let rel_path = rel.join(&name);
        let source_path = entry.path();
        let dest_path = destination.join(&name);

        let expected = FileAttributes::read(&source_path)?;
        let actual = match FileAttributes::read(&dest_path) {
            Ok(attrs) => attrs,
            Err(RecoveryError::Filesystem { source, .. })
                if source.kind() == ErrorKind::NotFound =>
            {
                return Err(mismatch(rel_path, "missing from backup".to_string()));
            }
            Err(e) => return Err(e),
        };

        compare_attributes(&rel_path, &expected, &actual)?;

        match expected.kind {
            EntryKind::Directory => verify_entries(&source_path, &dest_path, &rel_path, report)?,
            EntryKind::Regular => {
                report.bytes_compared += compare_content(&source_path, &dest_path, &rel_path)?;
            }
            EntryKind::Symlink | EntryKind::Other => {}
        }
        report.entries_checked += 1;
    }

    Ok(())
}

fn compare_attributes(
    rel: &Path,
    expected: &FileAttributes,
    actual: &FileAttributes,
) -> RecoveryResult<()> {
    if expected.kind != actual.kind {
        return Err(mismatch(
            rel.to_path_buf(),
            format!("kind {:?} != {:?}", actual.kind, expected.kind),
        ));
    }
    if (expected.uid, expected.gid) != (actual.uid, actual.gid) {
        return Err(mismatch(
            rel.to_path_buf(),
            format!(
                "owner {}:{} != {}:{}",
                actual.uid, actual.gid, expected.uid, expected.gid
            ),
        ));
    }
    if expected.kind == EntryKind::Symlink {
        if expected.symlink_target != actual.symlink_target {
            return Err(mismatch(
                rel.to_path_buf(),
                format!(
                    "link target {:?} != {:?}",
                    actual.symlink_target, expected.symlink_target
                ),
            ));
        }
    } else if expected.mode != actual.mode {
        return Err(mismatch(
            rel.to_path_buf(),
            format!("mode {:o} != {:o}", actual.mode, expected.mode),
        ));
    }
    Ok(())
}

fn compare_content(source: &Path, dest: &Path, rel: &Path) -> RecoveryResult<u64> {
    let mut a = File::open(source).map_err(|e| RecoveryError::fs("open", source, e))?;
    let mut b = File::open(dest).map_err(|e| RecoveryError::fs("open", dest, e))?;
    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];
    let mut total = 0u64;

    loop {
        let n = read_full(&mut a, &mut buf_a).map_err(|e| RecoveryError::fs("read", source, e))?;
        let m = read_full(&mut b, &mut buf_b).map_err(|e| RecoveryError::fs("read", dest, e))?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Err(mismatch(
                rel.to_path_buf(),
                format!("content differs near offset {}", total),
            ));
        }
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

/// Fills `buf` unless EOF comes first; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn mismatch(path: PathBuf, reason: String) -> RecoveryError {
    warn!(path = %path.display(), reason = %reason, "backup mismatch");
    RecoveryError::BackupMismatch { path, reason }
}
