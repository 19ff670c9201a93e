//! Small filesystem helpers shared by every file-backed store.
//!
//! All writes go through a temp file in the target's directory followed by
//! an atomic rename, so a crash mid-write leaves either the old file or the
//! new one, never a torn one.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Create `dir` (and parents) and restrict it to the owner on unix
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Atomically replace `path` with `contents`
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    persist(path, contents, false)
}

/// Atomically replace `path` with `contents`, readable and writable by the
///  owner only
pub fn write_atomic_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    persist(path, contents, true)
}

fn persist(path: &Path, contents: &[u8], private: bool) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    // NamedTempFile is created 0600 on unix already
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    if !private {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))?;
        }
    }

    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        if let Err(e) = handle.sync_all() {
            tracing::debug!(dir = %dir.display(), "directory fsync failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
