//! Named network namespaces
//!
//! A namespace is kept alive by bind-mounting its nsfs file onto
//! `<netns_dir>/<name>`, the same convention `ip netns` uses.

use crate::error::{CorralError, Result};
use crate::runtime::syscall::{self, mount_flags, umount_flags};
use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

fn path_arg(path: &Path) -> Result<std::ffi::CString> {
    syscall::path_cstring(path).map_err(|e| CorralError::InvalidArgument(e.to_string()))
}

fn join_thread<T>(result: std::thread::Result<Result<T>>) -> Result<T> {
    result.map_err(|_| CorralError::Lock("network namespace thread panicked".to_string()))?
}

/// Create a fresh network namespace and pin it at `path`
pub fn create(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| CorralError::external(format!("create {}", dir.display()), e))?;
    }
    File::options()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| CorralError::external(format!("create {}", path.display()), e))?;

    let target = path_arg(path)?;
    // unshare moves only the calling thread, which exits right after
    let pinned = std::thread::scope(|scope| {
        join_thread(
            scope
                .spawn(|| {
                    syscall::unshare(libc::CLONE_NEWNET)
                        .map_err(|e| CorralError::external("unshare network namespace", e))?;
                    let source = syscall::cstring(format!(
                        "/proc/self/task/{}/ns/net",
                        syscall::gettid()
                    ))
                    .map_err(|e| CorralError::InvalidArgument(e.to_string()))?;
                    syscall::mount(Some(&source), &target, None, mount_flags::MS_BIND, None)
                        .map_err(|e| {
                            CorralError::external(format!("pin namespace at {}", path.display()), e)
                        })
                })
                .join(),
        )
    });

    if let Err(e) = pinned {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    tracing::debug!(path = %path.display(), "created network namespace");
    Ok(())
}

/// Run `f` on a thread that has joined the namespace pinned at `path`
pub fn run_in<T, F>(path: &Path, f: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    let netns = File::open(path)
        .map_err(|e| CorralError::external(format!("open {}", path.display()), e))?;
    std::thread::scope(|scope| {
        join_thread(
            scope
                .spawn(|| {
                    syscall::setns(netns.as_raw_fd(), libc::CLONE_NEWNET).map_err(|e| {
                        CorralError::external(format!("enter {}", path.display()), e)
                    })?;
                    f()
                })
                .join(),
        )
    })
}

/// Unpin and delete the namespace at `path`; a missing one is not an error
pub fn remove(path: &Path) -> Result<()> {
    let target = path_arg(path)?;
    match syscall::umount2(&target, umount_flags::MNT_DETACH) {
        Ok(()) => {}
        Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOENT)) => {}
        Err(e) => {
            return Err(CorralError::external(
                format!("unmount {}", path.display()),
                e,
            ))
        }
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CorralError::external(format!("remove {}", path.display()), e)),
    }
}
