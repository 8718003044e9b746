use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths;

/// The write+read handle pair over one raw AVS file: an append-only writer
/// and an independent random-access reader.
#[derive(Debug)]
pub struct AvsHandles {
    pub writer: File,
    pub reader: File,
}

/// Opens the handle pair on a raw AVS file, creating it if missing.
pub fn open(raw_path: &Path) -> Result<AvsHandles> {
    let writer = OpenOptions::new()
        .create(true)
        .append(true)
        .open(raw_path)?;
    let reader = OpenOptions::new().read(true).open(raw_path)?;
    Ok(AvsHandles { writer, reader })
}

/// Flushes and closes the pair. The writer is synced so appended records
/// are durable before the descriptors go away.
pub fn close(handles: AvsHandles) -> Result<()> {
    handles.writer.sync_all()?;
    Ok(())
}

/// Per-container file state: the stable public path, the raw file it
/// currently resolves to, the live handle pair, and during compaction the
/// temporary target file and its handles.
#[derive(Debug)]
pub struct Backend {
    /// Stable symlink path, the container's public identity on disk.
    pub file_path: PathBuf,
    /// Raw file the symlink currently points at.
    pub file_path_raw: PathBuf,
    /// None models the closed-descriptor state.
    pub handles: Option<AvsHandles>,
    pub tmp_file_path_raw: Option<PathBuf>,
    pub tmp_handles: Option<AvsHandles>,
}

impl Backend {
    /// Opens the backend for a stable path, creating the raw file and
    /// symlink on first boot.
    pub fn open(stable: &Path) -> Result<Self> {
        let raw = paths::resolve(stable)?;
        let handles = open(&raw)?;
        Ok(Self {
            file_path: stable.to_path_buf(),
            file_path_raw: raw,
            handles: Some(handles),
            tmp_file_path_raw: None,
            tmp_handles: None,
        })
    }

    /// Re-resolves the stable path and replaces the live handle pair.
    pub fn reopen(&mut self) -> Result<()> {
        let raw = paths::resolve_existing(&self.file_path)?;
        self.handles = Some(open(&raw)?);
        self.file_path_raw = raw;
        Ok(())
    }
}

/// Single-shot reopen policy: when the last reply is the closed-descriptor
/// sentinel, reopen against the stable path and leave the reply untouched.
/// Any other reply leaves the handles alone.
pub fn reopen_if_closed<T>(backend: &mut Backend, reply: &Result<T>) {
    if matches!(reply, Err(Error::HandleClosed)) {
        if let Err(e) = backend.reopen() {
            tracing::warn!(
                path = %backend.file_path.display(),
                error = %e,
                "Failed to reopen AVS handles"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_file_and_pair() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("0.avs_1");
        let mut handles = open(&raw).unwrap();
        assert!(raw.exists());

        handles.writer.write_all(b"abc").unwrap();
        assert_eq!(handles.writer.seek(SeekFrom::End(0)).unwrap(), 3);
        close(handles).unwrap();
    }

    #[test]
    fn test_backend_first_boot_creates_symlink() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("obj").join("1.avs");
        let backend = Backend::open(&stable).unwrap();

        assert!(stable.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(backend.file_path_raw.exists());
        assert!(backend.handles.is_some());
    }

    #[test]
    fn test_reopen_if_closed_restores_handles() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("obj").join("1.avs");
        let mut backend = Backend::open(&stable).unwrap();
        backend.handles = None;

        let reply: Result<()> = Err(Error::HandleClosed);
        reopen_if_closed(&mut backend, &reply);
        assert!(backend.handles.is_some());
    }

    #[test]
    fn test_other_errors_leave_handles_alone() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("obj").join("1.avs");
        let mut backend = Backend::open(&stable).unwrap();
        backend.handles = None;

        let reply: Result<()> = Err(Error::Io("boom".into()));
        reopen_if_closed(&mut backend, &reply);
        assert!(backend.handles.is_none());
    }
}
