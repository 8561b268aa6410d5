//! Container root filesystems
//!
//! Each container gets a private upper and work directory stacked over the
//! image's read-only layers with an overlay mount.

pub mod overlay;

use crate::config::RuntimeConfig;
use crate::error::{CorralError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Manifest listing an image's layer directories, oldest first
pub const LAYER_MANIFEST: &str = "layers.json";

/// The filesystem owned by one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRecord {
    pub container_id: String,
    /// Read-only layers, oldest first
    pub lower_dirs: Vec<PathBuf>,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
}

/// Disk usage of a container's writable layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub layer_count: usize,
    pub upper_size_bytes: u64,
    pub inode_count: u64,
}

/// Filesystem manager
#[derive(Debug, Clone)]
pub struct FilesystemManager {
    layers_dir: PathBuf,
    containers_dir: PathBuf,
    proc_filesystems: PathBuf,
}

impl FilesystemManager {
    pub fn new(layers_dir: impl Into<PathBuf>, containers_dir: impl Into<PathBuf>) -> Self {
        Self {
            layers_dir: layers_dir.into(),
            containers_dir: containers_dir.into(),
            proc_filesystems: PathBuf::from("/proc/filesystems"),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.layers_dir(), config.containers_dir())
    }

    /// Directory name an image's layers live under
    pub fn image_dir_name(image: &str) -> String {
        image.replace(['/', ':'], "_")
    }

    /// Verify overlay mounts are available
    pub fn check_support(&self) -> Result<()> {
        overlay::check_support(&self.proc_filesystems)
    }

    /// Layer directories for `image`, oldest first
    pub fn resolve_layers(&self, image: &str) -> Result<Vec<PathBuf>> {
        if image.is_empty() {
            return Err(CorralError::InvalidArgument("image name is empty".to_string()));
        }
        let image_dir = self.layers_dir.join(Self::image_dir_name(image));
        if !image_dir.is_dir() {
            return Err(CorralError::external(
                format!("layers for image {} at {}", image, image_dir.display()),
                io::Error::from_raw_os_error(libc::ENOENT),
            ));
        }

        let manifest = image_dir.join(LAYER_MANIFEST);
        if !manifest.exists() {
            return Ok(vec![image_dir]);
        }

        let content = fs::read_to_string(&manifest)
            .map_err(|e| CorralError::external(format!("read {}", manifest.display()), e))?;
        let names: Vec<String> = serde_json::from_str(&content).map_err(|e| {
            CorralError::external(
                format!("parse {}", manifest.display()),
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;
        if names.is_empty() {
            return Err(CorralError::external(
                format!("{} lists no layers", manifest.display()),
                io::Error::from_raw_os_error(libc::ENOENT),
            ));
        }

        names
            .iter()
            .map(|name| {
                let relative = Path::new(name);
                if !relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
                {
                    return Err(CorralError::InvalidArgument(format!(
                        "layer {} escapes the image directory",
                        name
                    )));
                }
                let layer = image_dir.join(relative);
                if !layer.is_dir() {
                    return Err(CorralError::external(
                        format!("layer {}", layer.display()),
                        io::Error::from_raw_os_error(libc::ENOENT),
                    ));
                }
                Ok(layer)
            })
            .collect()
    }

    /// Lay out scratch directories for `container_id` and mount the overlay.
    ///
    /// Either everything is in place afterwards or nothing created here remains.
    pub fn create(&self, container_id: &str, image: &str) -> Result<FilesystemRecord> {
        let lower_dirs = self.resolve_layers(image)?;

        fs::create_dir_all(&self.containers_dir).map_err(|e| {
            CorralError::external(format!("create {}", self.containers_dir.display()), e)
        })?;
        let container_dir = self.containers_dir.join(container_id);
        fs::create_dir(&container_dir)
            .map_err(|e| CorralError::external(format!("create {}", container_dir.display()), e))?;

        let record = FilesystemRecord {
            container_id: container_id.to_string(),
            lower_dirs,
            upper_dir: container_dir.join("upper"),
            work_dir: container_dir.join("work"),
            merged_dir: container_dir.join("rootfs"),
        };

        let result = [&record.upper_dir, &record.work_dir, &record.merged_dir]
            .into_iter()
            .try_for_each(|dir| {
                fs::create_dir(dir)
                    .map_err(|e| CorralError::external(format!("create {}", dir.display()), e))
            })
            .and_then(|()| {
                overlay::mount(
                    &record.lower_dirs,
                    &record.upper_dir,
                    &record.work_dir,
                    &record.merged_dir,
                )
            });

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(&container_dir) {
                tracing::warn!("Failed to remove {}: {}", container_dir.display(), cleanup);
            }
            return Err(e);
        }

        tracing::debug!(container = container_id, image, "filesystem ready");
        Ok(record)
    }

    /// Point the container at `servers` through `/etc/resolv.conf`
    pub fn write_resolv_conf(&self, record: &FilesystemRecord, servers: &[String]) -> Result<()> {
        let etc = record.merged_dir.join("etc");
        // resolved on the host, an image's /etc symlink could point anywhere
        if is_symlink(&etc) {
            return Err(CorralError::InvalidArgument(format!(
                "{} is a symlink, refusing to write resolv.conf through it",
                etc.display()
            )));
        }
        fs::create_dir_all(&etc)
            .map_err(|e| CorralError::external(format!("create {}", etc.display()), e))?;

        let resolv = etc.join("resolv.conf");
        if is_symlink(&resolv) {
            fs::remove_file(&resolv)
                .map_err(|e| CorralError::external(format!("remove {}", resolv.display()), e))?;
        }

        let content: String = servers
            .iter()
            .map(|server| format!("nameserver {}\n", server))
            .collect();
        fs::write(&resolv, content)
            .map_err(|e| CorralError::external(format!("write {}", resolv.display()), e))
    }

    /// Size and inode count of the writable layer
    pub fn info(&self, record: &FilesystemRecord) -> Result<FilesystemInfo> {
        let mut info = FilesystemInfo {
            layer_count: record.lower_dirs.len(),
            ..Default::default()
        };
        if !record.upper_dir.exists() {
            return Ok(info);
        }

        for entry in walkdir::WalkDir::new(&record.upper_dir).min_depth(1) {
            let entry = entry.map_err(|e| {
                CorralError::external(
                    format!("walk {}", record.upper_dir.display()),
                    io::Error::other(e),
                )
            })?;
            info.inode_count += 1;
            if entry.file_type().is_file() {
                if let Ok(metadata) = entry.metadata() {
                    info.upper_size_bytes += metadata.len();
                }
            }
        }
        Ok(info)
    }

    /// Unmount and delete the container's directories. Lower layers are left
    /// alone; calling this again is harmless.
    pub fn cleanup(&self, record: &FilesystemRecord) -> Result<()> {
        if overlay::is_mounted(&record.merged_dir).unwrap_or(true) {
            overlay::unmount(&record.merged_dir)?;
        }

        let mut first_error = None;
        for dir in [&record.merged_dir, &record.upper_dir, &record.work_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to remove {}: {}", dir.display(), e);
                    first_error.get_or_insert(CorralError::external(
                        format!("remove {}", dir.display()),
                        e,
                    ));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(container = %record.container_id, "filesystem removed");
                Ok(())
            }
        }
    }
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> FilesystemManager {
        FilesystemManager::new(root.join("layers"), root.join("containers"))
    }

    #[test]
    fn test_image_dir_name() {
        assert_eq!(FilesystemManager::image_dir_name("alpine:3.19"), "alpine_3.19");
        assert_eq!(
            FilesystemManager::image_dir_name("library/nginx:latest"),
            "library_nginx_latest"
        );
    }

    #[test]
    fn test_single_layer_image() {
        let root = tempfile::tempdir().unwrap();
        let image_dir = root.path().join("layers/busybox");
        fs::create_dir_all(&image_dir).unwrap();

        let layers = manager(root.path()).resolve_layers("busybox").unwrap();
        assert_eq!(layers, vec![image_dir]);
    }

    #[test]
    fn test_layer_manifest() {
        let root = tempfile::tempdir().unwrap();
        let image_dir = root.path().join("layers/app_1.0");
        fs::create_dir_all(image_dir.join("base")).unwrap();
        fs::create_dir_all(image_dir.join("app")).unwrap();
        fs::write(image_dir.join(LAYER_MANIFEST), r#"["base", "app"]"#).unwrap();

        let layers = manager(root.path()).resolve_layers("app:1.0").unwrap();
        assert_eq!(layers, vec![image_dir.join("base"), image_dir.join("app")]);
    }

    #[test]
    fn test_missing_layers_fail() {
        let root = tempfile::tempdir().unwrap();
        let fs_manager = manager(root.path());
        let err = fs_manager.resolve_layers("nope").unwrap_err();
        assert_eq!(err.kind(), "external_resource_failure");

        let image_dir = root.path().join("layers/broken");
        fs::create_dir_all(&image_dir).unwrap();
        fs::write(image_dir.join(LAYER_MANIFEST), r#"["gone"]"#).unwrap();
        assert!(fs_manager.resolve_layers("broken").is_err());

        fs::write(image_dir.join(LAYER_MANIFEST), r#"["../escape"]"#).unwrap();
        assert_eq!(
            fs_manager.resolve_layers("broken").unwrap_err().kind(),
            "invalid_argument"
        );
    }

    #[test]
    fn test_failed_create_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("layers/busybox")).unwrap();
        let fs_manager = manager(root.path());

        // unprivileged mount fails; privileged runs may succeed
        match fs_manager.create("real-1", "busybox") {
            Ok(record) => {
                assert!(overlay::is_mounted(&record.merged_dir).unwrap());
                fs_manager.cleanup(&record).unwrap();
                assert!(!record.upper_dir.exists());
                assert!(!record.merged_dir.exists());
            }
            Err(_) => assert!(!root.path().join("containers/real-1").exists()),
        }
    }

    #[test]
    fn test_info_walks_upper_only() {
        let root = tempfile::tempdir().unwrap();
        let container_dir = root.path().join("containers/real-2");
        let record = FilesystemRecord {
            container_id: "real-2".to_string(),
            lower_dirs: vec![root.path().join("l1"), root.path().join("l2")],
            upper_dir: container_dir.join("upper"),
            work_dir: container_dir.join("work"),
            merged_dir: container_dir.join("rootfs"),
        };
        fs::create_dir_all(record.upper_dir.join("etc")).unwrap();
        fs::write(record.upper_dir.join("etc/hostname"), b"web\n").unwrap();
        fs::write(record.upper_dir.join("data"), vec![0u8; 100]).unwrap();

        let info = manager(root.path()).info(&record).unwrap();
        assert_eq!(info.layer_count, 2);
        assert_eq!(info.inode_count, 3);
        assert_eq!(info.upper_size_bytes, 104);
    }

    #[test]
    fn test_write_resolv_conf_replaces_symlink() {
        let root = tempfile::tempdir().unwrap();
        let merged = root.path().join("rootfs");
        fs::create_dir_all(merged.join("etc")).unwrap();
        let outside = root.path().join("outside");
        fs::write(&outside, "untouched").unwrap();
        std::os::unix::fs::symlink(&outside, merged.join("etc/resolv.conf")).unwrap();

        let record = FilesystemRecord {
            container_id: "real-3".to_string(),
            lower_dirs: Vec::new(),
            upper_dir: root.path().join("upper"),
            work_dir: root.path().join("work"),
            merged_dir: merged.clone(),
        };
        let servers = vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()];
        manager(root.path()).write_resolv_conf(&record, &servers).unwrap();

        assert_eq!(
            fs::read_to_string(merged.join("etc/resolv.conf")).unwrap(),
            "nameserver 8.8.8.8\nnameserver 1.1.1.1\n"
        );
        assert_eq!(fs::read_to_string(&outside).unwrap(), "untouched");
    }

    #[test]
    fn test_write_resolv_conf_refuses_symlinked_etc() {
        let root = tempfile::tempdir().unwrap();
        let merged = root.path().join("rootfs");
        fs::create_dir_all(&merged).unwrap();
        let host_etc = root.path().join("host-etc");
        fs::create_dir(&host_etc).unwrap();
        std::os::unix::fs::symlink(&host_etc, merged.join("etc")).unwrap();

        let record = FilesystemRecord {
            container_id: "real-4".to_string(),
            lower_dirs: Vec::new(),
            upper_dir: root.path().join("upper"),
            work_dir: root.path().join("work"),
            merged_dir: merged,
        };
        let err = manager(root.path())
            .write_resolv_conf(&record, &["8.8.8.8".to_string()])
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert!(!host_etc.join("resolv.conf").exists());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let container_dir = root.path().join("containers/real-4");
        let record = FilesystemRecord {
            container_id: "real-4".to_string(),
            lower_dirs: Vec::new(),
            upper_dir: container_dir.join("upper"),
            work_dir: container_dir.join("work"),
            merged_dir: container_dir.join("rootfs"),
        };
        fs::create_dir_all(&record.upper_dir).unwrap();
        fs::create_dir_all(&record.work_dir).unwrap();

        let fs_manager = manager(root.path());
        fs_manager.cleanup(&record).unwrap();
        fs_manager.cleanup(&record).unwrap();
        assert!(!record.upper_dir.exists());
        assert!(!record.work_dir.exists());
    }
}
