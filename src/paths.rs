use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::fs::symlink;

#[cfg(not(unix))]
fn symlink(_original: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Mints a fresh raw file name for the stable path. Second granularity is
/// enough: compactions are not re-entrant within a worker.
pub fn mint_raw(stable: &Path) -> PathBuf {
    let mut name = stable.as_os_str().to_os_string();
    name.push(format!("_{}", unix_seconds()));
    PathBuf::from(name)
}

/// Like [`mint_raw`], but never returns `avoid`. Guards the compactor
/// against minting the currently-live raw name when boot and compaction
/// fall in the same second.
pub fn mint_raw_avoiding(stable: &Path, avoid: &Path) -> PathBuf {
    let mut raw = mint_raw(stable);
    let mut bump = 0u32;
    while raw == avoid {
        bump += 1;
        let mut name = stable.as_os_str().to_os_string();
        name.push(format!("_{}.{}", unix_seconds(), bump));
        raw = PathBuf::from(name);
    }
    raw
}

/// Resolves the stable path to its raw target, creating the raw file and
/// symlink on first boot.
pub fn resolve(stable: &Path) -> Result<PathBuf> {
    if let Some(parent) = stable.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::read_link(stable) {
        Ok(target) => Ok(target),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let raw = mint_raw(stable);
            fs::File::create(&raw)?;
            symlink(&raw, stable)?;
            Ok(raw)
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves the stable path without creating anything. Used by the reopen
/// path, where the symlink must already exist.
pub fn resolve_existing(stable: &Path) -> Result<PathBuf> {
    fs::read_link(stable).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            e.into()
        }
    })
}

/// Repoints the stable symlink at a new raw file. Removing the old link is
/// best-effort; creating the new one is not.
pub fn swap_symlink(stable: &Path, new_raw: &Path) -> Result<()> {
    let _ = fs::remove_file(stable);
    symlink(new_raw, stable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_boot_creates_raw_and_symlink() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("object").join("1.avs");

        let raw = resolve(&stable).unwrap();
        assert!(raw.exists());
        assert!(stable.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&stable).unwrap(), raw);

        // Raw names carry the stable name plus a timestamp suffix.
        let raw_name = raw.file_name().unwrap().to_str().unwrap().to_string();
        assert!(raw_name.starts_with("1.avs_"));
    }

    #[test]
    fn test_resolve_is_stable_across_calls() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("object").join("1.avs");

        let first = resolve(&stable).unwrap();
        let second = resolve(&stable).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_existing_without_symlink() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("object").join("1.avs");
        assert_eq!(resolve_existing(&stable), Err(Error::NotFound));
    }

    #[test]
    fn test_mint_raw_avoiding_skips_live_name() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("object").join("1.avs");
        let live = mint_raw(&stable);

        let minted = mint_raw_avoiding(&stable, &live);
        assert_ne!(minted, live);
    }

    #[test]
    fn test_swap_symlink_repoints() {
        let dir = tempdir().unwrap();
        let stable = dir.path().join("object").join("1.avs");
        let old_raw = resolve(&stable).unwrap();

        let new_raw = dir.path().join("object").join("1.avs_99999");
        fs::File::create(&new_raw).unwrap();
        swap_symlink(&stable, &new_raw).unwrap();

        assert_eq!(fs::read_link(&stable).unwrap(), new_raw);
        assert!(old_raw.exists(), "swap must not delete the old raw file");
    }
}
