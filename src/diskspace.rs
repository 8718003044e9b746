use std::path::Path;

use crate::error::Result;

/// Free bytes available to unprivileged writes on the filesystem holding
/// `path`.
#[cfg(unix)]
pub fn free_bytes(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| crate::error::Error::Io(e.to_string()))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Fallback for platforms without statvfs: report unlimited space so the
/// compaction precheck passes.
#[cfg(not(unix))]
pub fn free_bytes(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_bytes_on_tmp() {
        let free = free_bytes(Path::new("/tmp")).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn test_free_bytes_missing_path() {
        assert!(free_bytes(Path::new("/definitely/not/a/mount")).is_err());
    }
}
