//! Free-space probing and writability checks.

use std::fs;
use std::path::Path;

/// Bytes available to unprivileged writers at `path`.
///
/// Probing failures report zero so callers fail safe: a path that
/// cannot be measured admits nothing.
#[cfg(unix)]
#[must_use]
pub fn disk_free_bytes(path: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        tracing::warn!(path = %path.display(), "statvfs failed; reporting zero free bytes");
        return 0;
    }
    (stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64)
}

/// Fallback for platforms without `statvfs`: no enforcement.
#[cfg(not(unix))]
#[must_use]
pub fn disk_free_bytes(_path: &Path) -> u64 {
    u64::MAX
}

/// Whether `path` can be created and written to.
///
/// Performs a real write probe: creates the directory if needed, drops
/// a marker file, removes it.
#[must_use]
pub fn dir_writable(path: &Path) -> bool {
    if fs::create_dir_all(path).is_err() {
        return false;
    }
    let probe = path.join(".write_test");
    if fs::write(&probe, b"x").is_err() {
        return false;
    }
    let _ = fs::remove_file(&probe);
    true
}
