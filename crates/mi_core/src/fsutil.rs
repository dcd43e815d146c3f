//! Atomic private-mode file writes.
//!
//! Every persisted secret (KT state, device-sync key, trust entries, ratchet
//! records) goes through [`write_atomic`]: stage into a temp file in the
//! destination directory, fsync, then rename over the target. A crash leaves
//! either the old file or the new one, never a torn write.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut staging = tempfile::NamedTempFile::new_in(dir)?;
    staging.write_all(bytes)?;
    staging.flush()?;
    staging.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        staging.as_file().set_permissions(perms)?;
    }

    staging
        .persist(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(())
}

/// Read a whole file, bounded so a corrupted state file cannot balloon.
pub fn read_limited(path: &Path, max_bytes: u64) -> io::Result<Vec<u8>> {
    let meta = fs::metadata(path)?;
    if meta.len() > max_bytes {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "file too large"));
    }
    fs::read(path)
}
