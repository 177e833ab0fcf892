//! Atomic PID file I/O.
//!
//! Format: a single line holding the PID.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Write `pid` to `path` atomically using temp file + rename.
pub fn write_pidfile(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    let temp_path = temp_path_for(path);
    fs::write(&temp_path, format!("{pid}\n"))?;
    fs::rename(&temp_path, path)
}

/// Read the PID stored at `path`.
pub fn read_pidfile(path: &Path) -> io::Result<u32> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing or invalid PID"))
}

/// Delete the PID file (idempotent - no error if missing).
pub fn delete_pidfile(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
