//! The daemon PID file: written at startup, removed on clean shutdown, and
//! used to refuse a second daemon against the same configuration.
//!
//! Exclusive create (`O_EXCL`-style) of an ASCII PID + newline — a plain,
//! portable way to detect "another instance is already running here"
//! without a lock file format of its own.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates `path` exclusively and writes the current PID into it.
    /// Fails if the file already exists — a second daemon instance, or a
    /// stale file from an unclean shutdown that the operator must clear.
    pub fn create(path: &Path) -> Result<PidFile> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| {
                format!(
                    "creating pid file {} (another pgrelay instance running, or a stale pid file left behind?)",
                    path.display()
                )
            })?;
        writeln!(file, "{}", std::process::id()).context("writing pid file")?;
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgrelay.pid");
        {
            let pidfile = PidFile::create(&path).unwrap();
            assert!(path.exists());
            drop(pidfile);
        }
        assert!(!path.exists());
    }

    #[test]
    fn second_create_fails_while_first_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgrelay.pid");
        let _first = PidFile::create(&path).unwrap();
        assert!(PidFile::create(&path).is_err());
    }
}
