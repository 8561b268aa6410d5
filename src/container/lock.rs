//! Exclusive lock over a runtime root
//!
//! Each `corral` invocation is its own runtime instance. Lifecycle calls hold
//! this lock for their whole duration and reload the on-disk registry under
//! it, so two instances never hand out one name, address or host port, and
//! never write state for a container the other has removed.

use crate::error::{CorralError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[derive(Debug)]
pub struct RootLock {
    file: File,
}

impl RootLock {
    /// Block until the lock at `path` is ours
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .map_err(|e| CorralError::external(format!("lock {}", path.display()), e))?;
        Ok(Self { file })
    }

    /// Take the lock only if nobody holds it
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(CorralError::external(format!("lock {}", path.display()), e)),
        }
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CorralError::external(format!("create {}", parent.display()), e))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| CorralError::external(format!("open {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let held = RootLock::acquire(&path).unwrap();
        assert!(path.is_file());
        assert!(RootLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(RootLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_lock_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh/root/lock");
        let _lock = RootLock::acquire(&path).unwrap();
        assert!(path.is_file());
    }
}
