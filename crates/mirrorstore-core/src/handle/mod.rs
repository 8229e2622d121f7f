//! Capability handles for the user-authorized external file.
//!
//! The mirror file is reachable only through a host-granted capability that
//! can be revoked out-of-band at any time. `ExternalFile` models the file
//! itself; the sibling-directory capability (`ExternalDir`) is optional and
//! resolved once at construction - hosts without it simply lose shadow
//! copies, backups, and locking (the lock degrades to a no-op).

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Result of probing whether a handle is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Full read/write access.
    Granted,
    /// Access may be recoverable by re-requesting it once.
    Provisional,
    /// The grant is gone; the handle is unusable.
    Revoked,
}

/// A user-authorized external file.
pub trait ExternalFile: fmt::Debug + Send + Sync {
    /// File name within its parent (used to derive sibling names).
    fn name(&self) -> &str;

    /// Stable reference that can be persisted in settings to rebind the
    /// handle later, when the host supports it.
    fn reference(&self) -> Option<PathBuf> {
        None
    }

    /// Read the whole file. A missing or empty file reads as empty bytes.
    fn read(&self) -> io::Result<Vec<u8>>;

    /// Replace the file contents.
    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Truncate the file to zero length.
    fn truncate(&self) -> io::Result<()>;

    /// Last-modified time, when the host exposes one.
    fn modified(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Check whether the grant is still live.
    fn probe(&self) -> Availability;

    /// One-shot attempt to upgrade provisional access back to granted.
    fn request_access(&self) -> bool {
        false
    }

    /// Sibling-directory capability, when the host grants it.
    fn directory(&self) -> Option<&dyn ExternalDir> {
        None
    }
}

/// Sibling access around an external file: open, remove, and enumerate
/// files in the same directory. Powers lock files, shadow copies, and
/// backups.
pub trait ExternalDir: fmt::Debug + Send + Sync {
    /// Bind a handle to a sibling by name. The file need not exist yet.
    fn open(&self, name: &str) -> io::Result<Box<dyn ExternalFile>>;

    /// Remove a sibling by name. Missing files are not an error.
    fn remove(&self, name: &str) -> io::Result<()>;

    /// List sibling file names.
    fn list(&self) -> io::Result<Vec<String>>;
}

/// The capability-granting step: how the host hands out mirror handles.
pub trait HandleProvider: fmt::Debug + Send + Sync {
    /// Ask the host to grant a fresh mirror file handle (connect flow).
    fn request(&self, suggested_name: &str) -> io::Result<Box<dyn ExternalFile>>;

    /// Rebind a handle from a reference persisted in settings.
    fn restore(&self, reference: &Path) -> io::Result<Box<dyn ExternalFile>>;
}

fn reject_separators(name: &str) -> io::Result<()> {
    if name.contains(['/', '\\']) || name == ".." {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("sibling name must be a bare file name: {name:?}"),
        ));
    }
    Ok(())
}

/// Filesystem-backed external file handle.
#[derive(Debug, Clone)]
pub struct FsFileHandle {
    path: PathBuf,
    name: String,
    dir: Option<FsDirHandle>,
}

impl FsFileHandle {
    /// Bind a handle to `path`. The sibling capability resolves to the
    /// parent directory when the path has one.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| FsDirHandle {
                path: p.to_path_buf(),
            });
        Self { path, name, dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExternalFile for FsFileHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn reference(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn read(&self) -> io::Result<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(&self.path, bytes)
    }

    fn truncate(&self) -> io::Result<()> {
        std::fs::write(&self.path, b"")
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    fn probe(&self) -> Availability {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.permissions().readonly() => Availability::Provisional,
            Ok(_) => Availability::Granted,
            Err(_) => match self.path.parent() {
                Some(parent) if parent.is_dir() => Availability::Granted,
                _ => Availability::Revoked,
            },
        }
    }

    fn directory(&self) -> Option<&dyn ExternalDir> {
        self.dir.as_ref().map(|d| d as &dyn ExternalDir)
    }
}

/// Filesystem-backed sibling directory.
#[derive(Debug, Clone)]
pub struct FsDirHandle {
    path: PathBuf,
}

impl ExternalDir for FsDirHandle {
    fn open(&self, name: &str) -> io::Result<Box<dyn ExternalFile>> {
        reject_separators(name)?;
        Ok(Box::new(FsFileHandle::new(self.path.join(name))))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        reject_separators(name)?;
        match std::fs::remove_file(self.path.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

/// Null object for hosts without persistent file-handle capability.
///
/// Probes as revoked, exposes no sibling directory, and refuses I/O, so the
/// engine reports the mirror as simply unavailable.
#[derive(Debug, Clone, Default)]
pub struct NullFileHandle;

impl ExternalFile for NullFileHandle {
    fn name(&self) -> &str {
        "detached"
    }

    fn read(&self) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no external file capability",
        ))
    }

    fn write(&self, _bytes: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no external file capability",
        ))
    }

    fn truncate(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no external file capability",
        ))
    }

    fn probe(&self) -> Availability {
        Availability::Revoked
    }
}

/// Grants handles inside a fixed directory - the filesystem analogue of a
/// host file picker rooted somewhere user-chosen.
#[derive(Debug, Clone)]
pub struct DirectoryHandleProvider {
    root: PathBuf,
}

impl DirectoryHandleProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl HandleProvider for DirectoryHandleProvider {
    fn request(&self, suggested_name: &str) -> io::Result<Box<dyn ExternalFile>> {
        reject_separators(suggested_name)?;
        std::fs::create_dir_all(&self.root)?;
        Ok(Box::new(FsFileHandle::new(self.root.join(suggested_name))))
    }

    fn restore(&self, reference: &Path) -> io::Result<Box<dyn ExternalFile>> {
        Ok(Box::new(FsFileHandle::new(reference)))
    }
}

/// Provider for hosts that cannot grant file handles at all.
#[derive(Debug, Clone, Default)]
pub struct NullHandleProvider;

impl HandleProvider for NullHandleProvider {
    fn request(&self, _suggested_name: &str) -> io::Result<Box<dyn ExternalFile>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "host cannot grant file handles",
        ))
    }

    fn restore(&self, _reference: &Path) -> io::Result<Box<dyn ExternalFile>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "host cannot grant file handles",
        ))
    }
}
