//! On-disk container state
//!
//! Each record lives at `<containers_dir>/<id>/state.json` so that separate
//! runtime invocations see the same registry.

use super::config::ContainerRecord;
use crate::error::{CorralError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone)]
pub struct StateStore {
    containers_dir: PathBuf,
}

impl StateStore {
    pub fn new(containers_dir: impl Into<PathBuf>) -> Self {
        Self {
            containers_dir: containers_dir.into(),
        }
    }

    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.containers_dir.join(container_id)
    }

    pub fn file_path(&self, container_id: &str) -> PathBuf {
        self.container_dir(container_id).join(STATE_FILE)
    }

    /// Write the record, replacing the previous state atomically
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let dir = self.container_dir(&record.id);
        fs::create_dir_all(&dir)
            .map_err(|e| CorralError::external(format!("create {}", dir.display()), e))?;

        let path = self.file_path(&record.id);
        let staging = dir.join(format!("{}.tmp", STATE_FILE));
        let file = File::create(&staging)
            .map_err(|e| CorralError::external(format!("create {}", staging.display()), e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, record)?;
        writer
            .flush()
            .map_err(|e| CorralError::external(format!("write {}", staging.display()), e))?;
        fs::rename(&staging, &path)
            .map_err(|e| CorralError::external(format!("rename {}", path.display()), e))?;

        tracing::trace!(container = %record.id, status = %record.status, "saved state");
        Ok(())
    }

    pub fn load(&self, container_id: &str) -> Result<ContainerRecord> {
        load_file(&self.file_path(container_id))
    }

    /// Every readable record; broken state files are skipped
    pub fn load_all(&self) -> Result<Vec<ContainerRecord>> {
        let entries = match fs::read_dir(&self.containers_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CorralError::external(
                    format!("read {}", self.containers_dir.display()),
                    e,
                ))
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(STATE_FILE);
            if !path.is_file() {
                continue;
            }
            match load_file(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Delete the container's directory with its state file
    pub fn remove(&self, container_id: &str) -> Result<()> {
        let dir = self.container_dir(container_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CorralError::external(format!("remove {}", dir.display()), e)),
        }
    }
}

fn load_file(path: &Path) -> Result<ContainerRecord> {
    let file = File::open(path)
        .map_err(|e| CorralError::external(format!("open {}", path.display()), e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::mock::sample_record;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut record = sample_record("real-1", "web");
        record.last_usage = Some(Default::default());

        store.save(&record).unwrap();
        assert!(dir.path().join("real-1/state.json").is_file());
        assert!(!dir.path().join("real-1/state.json.tmp").exists());

        let loaded = store.load("real-1").unwrap();
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.network, record.network);
        // samples stay in memory
        assert_eq!(loaded.last_usage, None);
    }

    #[test]
    fn test_load_all_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_record("real-1", "web")).unwrap();
        store.save(&sample_record("real-2", "db")).unwrap();
        fs::create_dir(dir.path().join("real-3")).unwrap();
        fs::write(dir.path().join("real-3/state.json"), "{not json").unwrap();
        fs::create_dir(dir.path().join("scratch")).unwrap();

        let records = store.load_all().unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"web") && names.contains(&"db"));
    }

    #[test]
    fn test_load_all_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_record("real-1", "web")).unwrap();

        store.remove("real-1").unwrap();
        assert!(!dir.path().join("real-1").exists());
        store.remove("real-1").unwrap();
        assert_eq!(store.load("real-1").unwrap_err().raw_os_error(), Some(libc::ENOENT));
    }
}
