//! Raw system call bindings for Linux
//!
//! Thin wrappers over libc that turn `-1` returns into `io::Error`. Everything
//! that may run in a freshly cloned child takes pre-built `CStr` arguments so
//! the child never allocates between clone and exec.

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Mount flags used by the runtime
pub mod mount_flags {
    pub const MS_RDONLY: libc::c_ulong = libc::MS_RDONLY;
    pub const MS_NOSUID: libc::c_ulong = libc::MS_NOSUID;
    pub const MS_NODEV: libc::c_ulong = libc::MS_NODEV;
    pub const MS_NOEXEC: libc::c_ulong = libc::MS_NOEXEC;
    pub const MS_BIND: libc::c_ulong = libc::MS_BIND;
    pub const MS_REC: libc::c_ulong = libc::MS_REC;
    pub const MS_PRIVATE: libc::c_ulong = libc::MS_PRIVATE;
}

/// Umount flags
pub mod umount_flags {
    /// Lazy unmount
    pub const MNT_DETACH: libc::c_int = libc::MNT_DETACH;
}

/// Result type for syscall operations
pub type SyscallResult<T> = std::result::Result<T, io::Error>;

fn cvt(result: libc::c_int) -> SyscallResult<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Convert a string into a C string, rejecting interior NULs
pub fn cstring(value: impl AsRef<OsStr>) -> SyscallResult<CString> {
    CString::new(value.as_ref().as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{:?} contains a NUL byte", value.as_ref()),
        )
    })
}

/// Convert a path into a C string
pub fn path_cstring(path: &Path) -> SyscallResult<CString> {
    cstring(path.as_os_str())
}

fn opt_ptr(value: Option<&CStr>) -> *const libc::c_char {
    value.map(CStr::as_ptr).unwrap_or(std::ptr::null())
}

/// Perform unshare syscall to create new namespaces
pub fn unshare(flags: libc::c_int) -> SyscallResult<()> {
    cvt(unsafe { libc::unshare(flags) }).map(drop)
}

/// Move the calling thread into the namespace referred to by `fd`
pub fn setns(fd: RawFd, nstype: libc::c_int) -> SyscallResult<()> {
    cvt(unsafe { libc::setns(fd, nstype) }).map(drop)
}

/// Set the hostname
pub fn sethostname(name: &[u8]) -> SyscallResult<()> {
    cvt(unsafe { libc::sethostname(name.as_ptr() as *const libc::c_char, name.len()) }).map(drop)
}

/// Mount a filesystem
pub fn mount(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> SyscallResult<()> {
    let result = unsafe {
        libc::mount(
            opt_ptr(source),
            target.as_ptr(),
            opt_ptr(fstype),
            flags,
            opt_ptr(data) as *const libc::c_void,
        )
    };
    cvt(result).map(drop)
}

/// Unmount a filesystem
pub fn umount2(target: &CStr, flags: libc::c_int) -> SyscallResult<()> {
    cvt(unsafe { libc::umount2(target.as_ptr(), flags) }).map(drop)
}

/// Pivot root filesystem
pub fn pivot_root(new_root: &CStr, put_old: &CStr) -> SyscallResult<()> {
    // pivot_root has no libc wrapper
    let result =
        unsafe { libc::syscall(libc::SYS_pivot_root, new_root.as_ptr(), put_old.as_ptr()) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Change current directory
pub fn chdir(path: &CStr) -> SyscallResult<()> {
    cvt(unsafe { libc::chdir(path.as_ptr()) }).map(drop)
}

/// Create a directory, treating an existing one as success
pub fn mkdir_existing_ok(path: &CStr, mode: libc::mode_t) -> SyscallResult<()> {
    match cvt(unsafe { libc::mkdir(path.as_ptr(), mode) }) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove an empty directory
pub fn rmdir(path: &CStr) -> SyscallResult<()> {
    cvt(unsafe { libc::rmdir(path.as_ptr()) }).map(drop)
}

/// Forbid the process and its descendants from gaining privileges on exec
pub fn set_no_new_privs() -> SyscallResult<()> {
    cvt(unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) }).map(drop)
}

/// Create a close-on-exec pipe, returning `(read, write)`
pub fn pipe() -> SyscallResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// read(2) retried on EINTR
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> SyscallResult<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// write(2) retried on EINTR
pub fn write_fd(fd: RawFd, buf: &[u8]) -> SyscallResult<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Wait for a child process.
///
/// Returns `None` when `WNOHANG` was given and the child has not changed state.
pub fn waitpid(pid: libc::pid_t, options: libc::c_int) -> SyscallResult<Option<libc::c_int>> {
    let mut status: libc::c_int = 0;
    loop {
        let result = unsafe { libc::waitpid(pid, &mut status, options) };
        if result > 0 {
            return Ok(Some(status));
        }
        if result == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Send a signal to a process
pub fn kill(pid: libc::pid_t, signal: libc::c_int) -> SyscallResult<()> {
    cvt(unsafe { libc::kill(pid, signal) }).map(drop)
}

/// Get the current process ID
pub fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

/// Get the calling thread ID
pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Effective user ID of the caller
pub fn geteuid() -> libc::uid_t {
    unsafe { libc::geteuid() }
}

/// Effective group ID of the caller
pub fn getegid() -> libc::gid_t {
    unsafe { libc::getegid() }
}

/// Clone with namespaces.
///
/// The child runs `callback(arg)` on `stack` and is reaped through `SIGCHLD`
/// like a forked child.
pub fn clone_with_namespaces(
    callback: extern "C" fn(*mut libc::c_void) -> libc::c_int,
    stack: &mut [u8],
    flags: libc::c_int,
    arg: *mut libc::c_void,
) -> SyscallResult<libc::pid_t> {
    // Stack grows downward; keep the top 16-byte aligned
    let top = stack.as_mut_ptr().wrapping_add(stack.len());
    let top = ((top as usize) & !0xf) as *mut libc::c_void;

    let result = unsafe { libc::clone(callback, top, flags | libc::SIGCHLD, arg) };
    cvt(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_getpid() {
        assert!(getpid() > 0);
        assert!(gettid() > 0);
    }

    #[test]
    fn test_cstring_rejects_nul() {
        assert!(cstring("ok").is_ok());
        let err = cstring("bad\0path").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_pipe_round_trip() {
        let (read, write) = pipe().unwrap();
        assert_eq!(write_fd(write.as_raw_fd(), b"x").unwrap(), 1);
        drop(write);

        let mut buf = [0u8; 4];
        assert_eq!(read_fd(read.as_raw_fd(), &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'x');
        assert_eq!(read_fd(read.as_raw_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_kill_zero_on_self() {
        assert!(kill(getpid(), 0).is_ok());
    }

    #[test]
    fn test_mkdir_existing_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_cstring(&dir.path().join("sub")).unwrap();
        mkdir_existing_ok(&path, 0o755).unwrap();
        mkdir_existing_ok(&path, 0o755).unwrap();
        rmdir(&path).unwrap();
    }
}
