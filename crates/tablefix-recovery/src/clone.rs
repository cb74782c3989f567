//! Attribute-preserving recursive directory clone.
//!
//! Used to snapshot a store before any destructive repair. Entries are read
//! with `symlink_metadata`, so links are recreated instead of followed.
//! Ownership is copied to every entry and mode bits to every non-link entry.
//! Directory attributes are applied after the directory has been populated.
//! File contents and directory entries are synced before the clone returns.

use std::fs::{self, DirBuilder, File, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::{lchown, symlink, DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RecoveryError, RecoveryResult};

/// Mode used for directories created before their real mode is known.
const DIR_CREATE_MODE: u32 = 0o755;

/// Permission bits carried over by the clone (rwx plus setuid/setgid/sticky).
const MODE_MASK: u32 = 0o7777;

/// Type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// FIFO, socket or device node; copied like a regular file
    Other,
}

impl EntryKind {
    fn from_file_type(ft: fs::FileType) -> Self {
        if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_file() {
            EntryKind::Regular
        } else {
            EntryKind::Other
        }
    }
}

/// Attributes read from a source entry and reapplied to its copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// Entry type.
    pub kind: EntryKind,
    /// Permission bits, masked to [`MODE_MASK`].
    pub mode: u32,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Link target, for symlinks only.
    pub symlink_target: Option<PathBuf>,
}

impl FileAttributes {
    /// Reads the attributes of `path` without following a final symlink.
    pub fn read(path: &Path) -> RecoveryResult<Self> {
        let meta = fs::symlink_metadata(path).map_err(|e| RecoveryError::fs("stat", path, e))?;
        let kind = EntryKind::from_file_type(meta.file_type());
        let symlink_target = match kind {
            EntryKind::Symlink => {
                Some(fs::read_link(path).map_err(|e| RecoveryError::fs("readlink", path, e))?)
            }
            _ => None,
        };

        Ok(Self {
            kind,
            mode: meta.mode() & MODE_MASK,
            uid: meta.uid(),
            gid: meta.gid(),
            symlink_target,
        })
    }

    /// Applies ownership, then mode unless the entry is a symlink.
    ///
    /// Ownership goes first because changing it clears setuid/setgid bits.
    pub fn apply(&self, path: &Path) -> RecoveryResult<()> {
        lchown(path, Some(self.uid), Some(self.gid))
            .map_err(|e| RecoveryError::fs("lchown", path, e))?;

        if self.kind != EntryKind::Symlink {
            fs::set_permissions(path, Permissions::from_mode(self.mode))
                .map_err(|e| RecoveryError::fs("chmod", path, e))?;
        }
        Ok(())
    }
}

/// Counters for one clone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneStats {
    /// Directories cloned, not counting the root.
    pub directories: u64,
    /// Regular and other non-link files copied.
    pub files: u64,
    /// Symlinks recreated.
    pub symlinks: u64,
    /// File content bytes copied.
    pub bytes_copied: u64,
}

/// Recursively copies the tree under `source` into `destination`.
///
/// `destination` is created with its parents if absent; an existing
/// destination is merged into. The first failure aborts the clone.
pub fn clone_dir(source: &Path, destination: &Path) -> RecoveryResult<CloneStats> {
    let meta = fs::symlink_metadata(source).map_err(|e| RecoveryError::fs("stat", source, e))?;
    if !meta.is_dir() {
        return Err(RecoveryError::NotADirectory {
            path: source.to_path_buf(),
        });
    }

    debug!(
        source = %source.display(),
        destination = %destination.display(),
        "starting directory clone"
    );

    ensure_dir(destination)?;
    let mut stats = CloneStats::default();
    clone_entries(source, destination, &mut stats)?;

    info!(
        source = %source.display(),
        destination = %destination.display(),
        directories = stats.directories,
        files = stats.files,
        symlinks = stats.symlinks,
        bytes = stats.bytes_copied,
        "directory cloned"
    );

    Ok(stats)
}

fn clone_entries(
    source: &Path,
    destination: &Path,
    stats: &mut CloneStats,
) -> RecoveryResult<()> {
    let mut entries = fs::read_dir(source)
        .map_err(|e| RecoveryError::fs("read_dir", source, e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| RecoveryError::fs("read_dir", source, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let source_path = entry.path();
        let dest_path = destination.join(entry.file_name());
        let attrs = FileAttributes::read(&source_path)?;

        match attrs.kind {
            EntryKind::Directory => {
                ensure_dir(&dest_path)?;
                make_owner_writable(&dest_path)?;
                clone_entries(&source_path, &dest_path, stats)?;
                stats.directories += 1;
            }
            EntryKind::Symlink => {
                copy_symlink(&attrs, &dest_path)?;
                stats.symlinks += 1;
            }
            EntryKind::Regular | EntryKind::Other => {
                stats.bytes_copied += copy_file(&source_path, &dest_path)?;
                stats.files += 1;
            }
        }

        attrs.apply(&dest_path)?;
    }

    sync_dir(destination)
}

/// Creates `path` and its parents unless it already is a directory.
fn ensure_dir(path: &Path) -> RecoveryResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(RecoveryError::NotADirectory {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => DirBuilder::new()
            .recursive(true)
            .mode(DIR_CREATE_MODE)
            .create(path)
            .map_err(|e| RecoveryError::fs("mkdir", path, e)),
        Err(e) => Err(RecoveryError::fs("stat", path, e)),
    }
}

fn copy_symlink(attrs: &FileAttributes, dest: &Path) -> RecoveryResult<()> {
    let target = attrs
        .symlink_target
        .as_deref()
        .ok_or_else(|| {
            RecoveryError::fs("readlink", dest, io::Error::from(ErrorKind::InvalidData))
        })?;

    // A link left by an earlier clone is replaced; anything else is a conflict.
    if let Ok(meta) = fs::symlink_metadata(dest) {
        if meta.file_type().is_symlink() {
            fs::remove_file(dest).map_err(|e| RecoveryError::fs("unlink", dest, e))?;
        }
    }

    symlink(target, dest).map_err(|e| RecoveryError::fs("symlink", dest, e))
}

/// Streams the content of `source` into `dest` and returns the byte count.
///
/// The copy is flushed to stable storage before returning.
fn copy_file(source: &Path, dest: &Path) -> RecoveryResult<u64> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(RecoveryError::fs(
                "create",
                dest,
                io::Error::new(ErrorKind::AlreadyExists, "destination is a symlink"),
            ));
        }
        // An earlier copy may be read-only; replace it instead of writing through it.
        Ok(_) => fs::remove_file(dest).map_err(|e| RecoveryError::fs("unlink", dest, e))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(RecoveryError::fs("stat", dest, e)),
    }

    let mut input = File::open(source).map_err(|e| RecoveryError::fs("open", source, e))?;
    let mut output = File::create(dest).map_err(|e| RecoveryError::fs("create", dest, e))?;
    let copied =
        io::copy(&mut input, &mut output).map_err(|e| RecoveryError::fs("copy", dest, e))?;
    output.sync_all().map_err(|e| RecoveryError::fs("fsync", dest, e))?;

    Ok(copied)
}

/// Flushes the entries of a populated directory.
fn sync_dir(path: &Path) -> RecoveryResult<()> {
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| RecoveryError::fs("fsync", path, e))
}

/// Gives the owner write and search access to a directory left by an earlier
/// clone, so it can be merged into. The source mode is reapplied afterwards.
fn make_owner_writable(path: &Path) -> RecoveryResult<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| RecoveryError::fs("stat", path, e))?;
    let mode = meta.mode() & MODE_MASK;
    if mode & 0o300 == 0o300 {
        return Ok(());
    }
    fs::set_permissions(path, Permissions::from_mode(mode | 0o700))
        .map_err(|e| RecoveryError::fs("chmod", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mode_of(path: &Path) -> u32 {
        fs::symlink_metadata(path).unwrap().mode() & MODE_MASK
    }

    #[test]
    fn test_clone_flat_files() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("MANIFEST"), b"manifest").unwrap();
        fs::write(src.path().join("000001.sst"), vec![7u8; 5000]).unwrap();

        let stats = clone_dir(src.path(), dst.path()).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes_copied, 5008);
        assert_eq!(fs::read(dst.path().join("MANIFEST")).unwrap(), b"manifest");
        assert_eq!(fs::read(dst.path().join("000001.sst")).unwrap(), vec![7u8; 5000]);
    }

    #[test]
    fn test_clone_creates_missing_destination_parents() {
        let src = tempdir().unwrap();
        let root = tempdir().unwrap();
        fs::write(src.path().join("a"), b"a").unwrap();
        let dst = root.path().join("x/y/backup");

        clone_dir(src.path(), &dst).unwrap();
        assert_eq!(fs::read(dst.join("a")).unwrap(), b"a");
    }

    #[test]
    fn test_clone_preserves_modes() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let file = src.path().join("000002.vlog");
        fs::write(&file, b"value log").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o640)).unwrap();
        let exec = src.path().join("run.sh");
        fs::write(&exec, b"#!/bin/sh").unwrap();
        fs::set_permissions(&exec, Permissions::from_mode(0o751)).unwrap();

        clone_dir(src.path(), dst.path()).unwrap();
        assert_eq!(mode_of(&dst.path().join("000002.vlog")), 0o640);
        assert_eq!(mode_of(&dst.path().join("run.sh")), 0o751);
    }

    #[test]
    fn test_clone_applies_directory_mode_after_population() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let sub = src.path().join("archive");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("000007.sst"), b"seven").unwrap();
        fs::set_permissions(&sub, Permissions::from_mode(0o555)).unwrap();

        let stats = clone_dir(src.path(), dst.path()).unwrap();
        assert_eq!(stats.directories, 1);
        assert_eq!(mode_of(&dst.path().join("archive")), 0o555);
        assert_eq!(fs::read(dst.path().join("archive/000007.sst")).unwrap(), b"seven");

        fs::set_permissions(&sub, Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(dst.path().join("archive"), Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_clone_relinks_symlinks_without_following() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("000001.sst"), b"data").unwrap();
        symlink("000001.sst", src.path().join("CURRENT")).unwrap();
        symlink("/nonexistent/target", src.path().join("dangling")).unwrap();

        let stats = clone_dir(src.path(), dst.path()).unwrap();
        assert_eq!(stats.symlinks, 2);
        assert_eq!(stats.files, 1);

        let current = dst.path().join("CURRENT");
        assert!(fs::symlink_metadata(&current).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&current).unwrap(), PathBuf::from("000001.sst"));
        assert_eq!(
            fs::read_link(dst.path().join("dangling")).unwrap(),
            PathBuf::from("/nonexistent/target")
        );
    }

    #[test]
    fn test_clone_does_not_descend_into_symlinked_dir() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret"), b"x").unwrap();
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        symlink(outside.path(), src.path().join("link")).unwrap();

        clone_dir(src.path(), dst.path()).unwrap();
        let link = dst.path().join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), outside.path());
    }

    #[test]
    fn test_clone_merges_into_existing_destination() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/new"), b"new").unwrap();
        symlink("new", src.path().join("sub/link")).unwrap();

        fs::create_dir(dst.path().join("sub")).unwrap();
        fs::write(dst.path().join("sub/existing"), b"keep").unwrap();
        symlink("stale", dst.path().join("sub/link")).unwrap();

        clone_dir(src.path(), dst.path()).unwrap();
        assert_eq!(fs::read(dst.path().join("sub/existing")).unwrap(), b"keep");
        assert_eq!(fs::read(dst.path().join("sub/new")).unwrap(), b"new");
        assert_eq!(fs::read_link(dst.path().join("sub/link")).unwrap(), PathBuf::from("new"));
    }

    #[test]
    fn test_clone_twice_is_idempotent() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("f"), b"one").unwrap();
        symlink("f", src.path().join("l")).unwrap();

        let first = clone_dir(src.path(), dst.path()).unwrap();
        let second = clone_dir(src.path(), dst.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(dst.path().join("f")).unwrap(), b"one");
    }

    #[test]
    fn test_clone_merges_over_read_only_copy() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let file = src.path().join("000001.sst");
        fs::write(&file, b"first").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o444)).unwrap();
        clone_dir(src.path(), dst.path()).unwrap();

        fs::set_permissions(&file, Permissions::from_mode(0o644)).unwrap();
        fs::write(&file, b"second").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o444)).unwrap();
        clone_dir(src.path(), dst.path()).unwrap();

        let copy = dst.path().join("000001.sst");
        assert_eq!(fs::read(&copy).unwrap(), b"second");
        assert_eq!(mode_of(&copy), 0o444);
    }

    #[test]
    fn test_clone_merges_into_read_only_directory() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let sub = src.path().join("archive");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("000001.sst"), b"one").unwrap();
        fs::set_permissions(&sub, Permissions::from_mode(0o555)).unwrap();
        clone_dir(src.path(), dst.path()).unwrap();

        fs::set_permissions(&sub, Permissions::from_mode(0o755)).unwrap();
        fs::write(sub.join("000002.sst"), b"two").unwrap();
        fs::set_permissions(&sub, Permissions::from_mode(0o555)).unwrap();
        clone_dir(src.path(), dst.path()).unwrap();

        let copy = dst.path().join("archive");
        assert_eq!(fs::read(copy.join("000002.sst")).unwrap(), b"two");
        assert_eq!(mode_of(&copy), 0o555);

        fs::set_permissions(&sub, Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(&copy, Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_clone_refuses_to_write_through_destination_symlink() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let victim = outside.path().join("victim");
        fs::write(&victim, b"untouched").unwrap();
        fs::write(src.path().join("000001.sst"), b"payload").unwrap();
        symlink(&victim, dst.path().join("000001.sst")).unwrap();

        let err = clone_dir(src.path(), dst.path()).unwrap_err();
        assert!(matches!(err, RecoveryError::Filesystem { op: "create", .. }));
        assert_eq!(fs::read(&victim).unwrap(), b"untouched");
    }

    #[test]
    fn test_sync_dir_reports_fsync_failure() {
        let root = tempdir().unwrap();
        let err = sync_dir(&root.path().join("missing")).unwrap_err();
        assert!(matches!(err, RecoveryError::Filesystem { op: "fsync", .. }));
    }

    #[test]
    fn test_clone_conflicting_entry_type_fails() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir(src.path().join("entry")).unwrap();
        fs::write(dst.path().join("entry"), b"file in the way").unwrap();

        let err = clone_dir(src.path(), dst.path()).unwrap_err();
        assert!(matches!(err, RecoveryError::NotADirectory { .. }));
    }

    #[test]
    fn test_clone_source_must_be_directory() {
        let root = tempdir().unwrap();
        let file = root.path().join("file");
        fs::write(&file, b"x").unwrap();

        let err = clone_dir(&file, &root.path().join("out")).unwrap_err();
        assert!(matches!(err, RecoveryError::NotADirectory { .. }));
        assert!(!root.path().join("out").exists());
    }

    #[test]
    fn test_clone_missing_source_fails() {
        let root = tempdir().unwrap();
        let err = clone_dir(&root.path().join("missing"), &root.path().join("out")).unwrap_err();
        assert!(matches!(err, RecoveryError::Filesystem { op: "stat", .. }));
    }

    #[test]
    fn test_clone_leaves_source_untouched() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let file = src.path().join("000001.sst");
        fs::write(&file, b"payload").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o600)).unwrap();
        let before = FileAttributes::read(&file).unwrap();

        clone_dir(src.path(), dst.path()).unwrap();
        assert_eq!(FileAttributes::read(&file).unwrap(), before);
        assert_eq!(fs::read(&file).unwrap(), b"payload");
    }

    #[test]
    fn test_file_attributes_read_symlink() {
        let root = tempdir().unwrap();
        let link = root.path().join("l");
        symlink("target", &link).unwrap();

        let attrs = FileAttributes::read(&link).unwrap();
        assert_eq!(attrs.kind, EntryKind::Symlink);
        assert_eq!(attrs.symlink_target, Some(PathBuf::from("target")));
    }
}
