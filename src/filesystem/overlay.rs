//! Overlay mount helpers

use crate::error::{CorralError, Result};
use crate::runtime::syscall::{self, umount_flags};
use procfs::process::Process;
use std::fs;
use std::path::{Path, PathBuf};

/// Verify the kernel registers the overlay filesystem
pub fn check_support(proc_filesystems: &Path) -> Result<()> {
    let content = fs::read_to_string(proc_filesystems)
        .map_err(|e| CorralError::external(format!("read {}", proc_filesystems.display()), e))?;
    let registered = content
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs_type| fs_type == "overlay");
    if registered {
        Ok(())
    } else {
        Err(CorralError::UnsupportedHost(
            "kernel has no overlay filesystem support".to_string(),
        ))
    }
}

/// Build the overlay option string. `lowers` is oldest first; overlay wants
/// the topmost layer leftmost.
pub fn mount_data(lowers: &[PathBuf], upper: &Path, work: &Path) -> Result<String> {
    let mut lowerdir = Vec::with_capacity(lowers.len());
    for lower in lowers.iter().rev() {
        lowerdir.push(option_path(lower)?);
    }
    Ok(format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir.join(":"),
        option_path(upper)?,
        option_path(work)?
    ))
}

fn option_path(path: &Path) -> Result<String> {
    let text = path.to_str().ok_or_else(|| {
        CorralError::InvalidArgument(format!("{} is not valid UTF-8", path.display()))
    })?;
    // separators of the option string itself
    if text.contains([',', ':']) {
        return Err(CorralError::InvalidArgument(format!(
            "overlay path {} must not contain ',' or ':'",
            text
        )));
    }
    Ok(text.to_string())
}

/// Mount an overlay at `merged`
pub fn mount(lowers: &[PathBuf], upper: &Path, work: &Path, merged: &Path) -> Result<()> {
    let data = mount_data(lowers, upper, work)?;
    let invalid = |e: std::io::Error| CorralError::InvalidArgument(e.to_string());
    let source = syscall::cstring("overlay").map_err(invalid)?;
    let target = syscall::path_cstring(merged).map_err(invalid)?;
    let options = syscall::cstring(&data).map_err(invalid)?;

    syscall::mount(Some(&source), &target, Some(&source), 0, Some(&options))
        .map_err(|e| CorralError::external(format!("mount overlay at {}", merged.display()), e))?;
    tracing::debug!(target = %merged.display(), layers = lowers.len(), "mounted overlay");
    Ok(())
}

/// Lazily unmount `target`; nothing mounted there is not an error
pub fn unmount(target: &Path) -> Result<()> {
    let path = syscall::path_cstring(target)
        .map_err(|e| CorralError::InvalidArgument(e.to_string()))?;
    match syscall::umount2(&path, umount_flags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!(target = %target.display(), "unmounted");
            Ok(())
        }
        Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOENT)) => Ok(()),
        Err(e) => Err(CorralError::external(
            format!("unmount {}", target.display()),
            e,
        )),
    }
}

/// Whether `path` is a mount point in this process's mount namespace
pub fn is_mounted(path: &Path) -> Result<bool> {
    let mount_infos = Process::myself()
        .and_then(|p| p.mountinfo())
        .map_err(|e| CorralError::external("read mountinfo", std::io::Error::other(e)))?;
    Ok(mount_infos.into_iter().any(|m| m.mount_point == path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_data_orders_newest_first() {
        let lowers = vec![PathBuf::from("/l/base"), PathBuf::from("/l/app")];
        let data = mount_data(&lowers, Path::new("/c/upper"), Path::new("/c/work")).unwrap();
        assert_eq!(data, "lowerdir=/l/app:/l/base,upperdir=/c/upper,workdir=/c/work");
    }

    #[test]
    fn test_mount_data_rejects_separators() {
        let lowers = vec![PathBuf::from("/l/a,b")];
        let err = mount_data(&lowers, Path::new("/u"), Path::new("/w")).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_check_support() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filesystems");
        fs::write(&path, "nodev\tsysfs\nnodev\tproc\n\text4\nnodev\toverlay\n").unwrap();
        assert!(check_support(&path).is_ok());

        fs::write(&path, "nodev\tsysfs\n\text4\n").unwrap();
        assert_eq!(check_support(&path).unwrap_err().kind(), "unsupported_host");
    }

    #[test]
    fn test_is_mounted_root() {
        assert!(is_mounted(Path::new("/")).unwrap());
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mounted(dir.path()).unwrap());
    }

    #[test]
    fn test_unmount_not_mounted_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let result = unmount(dir.path());
        // EPERM without CAP_SYS_ADMIN, EINVAL (ignored) with it
        if syscall::geteuid() == 0 {
            assert!(result.is_ok());
        }
    }
}
