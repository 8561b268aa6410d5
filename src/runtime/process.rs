//! Container process management
//!
//! A container init is created with a single `clone(2)` carrying the namespace
//! flags. The child parks on a sync pipe until the parent has mapped its user
//! ids and attached it to a cgroup, then changes root and execs. Setup errors
//! travel back over a close-on-exec pipe as a raw errno.

use super::syscall::{self, mount_flags, umount_flags};
use crate::error::{CorralError, Result};
use procfs::process::{ProcState, Process};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const CHILD_STACK_SIZE: usize = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// PATH handed to container commands
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Process configuration for a container
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Arguments (first is the executable)
    pub args: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Hostname set inside the UTS namespace
    pub hostname: String,
    /// Merged root filesystem the process pivots into
    pub rootfs: PathBuf,
    /// Pre-built network namespace to join instead of creating one
    pub netns: Option<PathBuf>,
}

impl ProcessConfig {
    /// Create a new process config with the given command
    pub fn new(args: Vec<String>, rootfs: impl Into<PathBuf>) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        env.insert("HOME".to_string(), "/root".to_string());
        env.insert("TERM".to_string(), "xterm".to_string());

        Self {
            args,
            env,
            hostname: String::new(),
            rootfs: rootfs.into(),
            netns: None,
        }
    }

    /// Set the hostname, also exported as `HOSTNAME`
    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self.env.insert("HOSTNAME".to_string(), hostname.to_string());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Join the network namespace bound at `path`
    pub fn netns(mut self, path: impl Into<PathBuf>) -> Self {
        self.netns = Some(path.into());
        self
    }

    /// Resolve the program against the container's PATH inside the rootfs.
    ///
    /// The result is a path as the container sees it.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        let program = self
            .args
            .first()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CorralError::InvalidArgument("container command is empty".to_string()))?;

        if program.contains('/') {
            return Ok(PathBuf::from(program));
        }

        let search = self.env.get("PATH").map(String::as_str).unwrap_or(DEFAULT_PATH);
        for dir in search.split(':').filter(|d| !d.is_empty()) {
            let host_side = self.rootfs.join(dir.trim_start_matches('/')).join(program);
            // lstat so absolute symlinks are not resolved against the host root
            if host_side.symlink_metadata().is_ok() {
                return Ok(Path::new(dir).join(program));
            }
        }

        Err(CorralError::external(
            format!("{} not found in container PATH", program),
            io::Error::from_raw_os_error(libc::ENOENT),
        ))
    }
}

/// Everything the child needs, converted up front so it never allocates
struct ChildSetup {
    hostname: CString,
    rootfs: CString,
    root: CString,
    dot: CString,
    proc_dir: CString,
    proc_fs: CString,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ChildSetup {
    fn new(config: &ProcessConfig) -> Result<Self> {
        let program = config.resolve_program()?;
        let invalid = |e: io::Error| CorralError::InvalidArgument(e.to_string());

        let argv = config
            .args
            .iter()
            .map(syscall::cstring)
            .collect::<io::Result<Vec<_>>>()
            .map_err(invalid)?;
        let envp = config
            .env
            .iter()
            .map(|(k, v)| syscall::cstring(format!("{}={}", k, v)))
            .collect::<io::Result<Vec<_>>>()
            .map_err(invalid)?;

        Ok(Self {
            hostname: syscall::cstring(&config.hostname).map_err(invalid)?,
            rootfs: syscall::path_cstring(&config.rootfs).map_err(invalid)?,
            root: syscall::cstring("/").map_err(invalid)?,
            dot: syscall::cstring(".").map_err(invalid)?,
            proc_dir: syscall::path_cstring(&config.rootfs.join("proc")).map_err(invalid)?,
            proc_fs: syscall::cstring("proc").map_err(invalid)?,
            program: syscall::path_cstring(&program).map_err(invalid)?,
            argv,
            envp,
        })
    }
}

#[derive(Clone, Copy)]
struct PipeFds {
    sync_read: RawFd,
    sync_write: RawFd,
    err_read: RawFd,
    err_write: RawFd,
}

struct ChildContext<'a> {
    setup: &'a ChildSetup,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    fds: PipeFds,
}

impl<'a> ChildContext<'a> {
    fn new(setup: &'a ChildSetup, fds: PipeFds) -> Self {
        let mut argv: Vec<_> = setup.argv.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<_> = setup.envp.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());
        Self {
            setup,
            argv,
            envp,
            fds,
        }
    }

    /// Runs in the cloned child. Only returns on failure.
    fn enter(&self) -> io::Result<()> {
        let setup = self.setup;
        unsafe {
            libc::close(self.fds.sync_write);
            libc::close(self.fds.err_read);
        }

        let mut byte = [0u8; 1];
        if syscall::read_fd(self.fds.sync_read, &mut byte)? != 1 {
            return Err(io::Error::from_raw_os_error(libc::ECANCELED));
        }

        syscall::sethostname(setup.hostname.as_bytes())?;
        syscall::mount(
            None,
            &setup.root,
            None,
            mount_flags::MS_REC | mount_flags::MS_PRIVATE,
            None,
        )?;
        syscall::mount(
            Some(&setup.rootfs),
            &setup.rootfs,
            None,
            mount_flags::MS_BIND | mount_flags::MS_REC,
            None,
        )?;

        if syscall::mkdir_existing_ok(&setup.proc_dir, 0o555).is_ok() {
            // an image without a usable /proc still runs
            let _ = syscall::mount(
                Some(&setup.proc_fs),
                &setup.proc_dir,
                Some(&setup.proc_fs),
                mount_flags::MS_NOSUID | mount_flags::MS_NODEV | mount_flags::MS_NOEXEC,
                None,
            );
        }

        syscall::chdir(&setup.rootfs)?;
        syscall::pivot_root(&setup.dot, &setup.dot)?;
        syscall::umount2(&setup.dot, umount_flags::MNT_DETACH)?;
        syscall::chdir(&setup.root)?;

        syscall::set_no_new_privs()?;

        unsafe {
            libc::execve(setup.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
        }
        Err(io::Error::last_os_error())
    }
}

extern "C" fn child_main(arg: *mut libc::c_void) -> libc::c_int {
    let context = unsafe { &*(arg as *const ChildContext) };
    let errno = match context.enter() {
        Ok(()) => libc::EINVAL,
        Err(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
    };
    let _ = syscall::write_fd(context.fds.err_write, &errno.to_ne_bytes());
    unsafe { libc::_exit(127) }
}

fn clone_child(setup: &ChildSetup, fds: PipeFds, flags: libc::c_int) -> io::Result<libc::pid_t> {
    let mut context = ChildContext::new(setup, fds);
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    syscall::clone_with_namespaces(
        child_main,
        &mut stack,
        flags,
        &mut context as *mut ChildContext as *mut libc::c_void,
    )
}

/// Liveness as seen from the host: signal zero succeeds and the process is
/// neither a zombie nor dead.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    match syscall::kill(pid, 0) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EPERM) => {}
        Err(_) => return false,
    }
    match Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => !matches!(stat.state(), Ok(ProcState::Zombie) | Ok(ProcState::Dead)),
        Err(_) => false,
    }
}

fn decode_status(status: libc::c_int) -> Option<i32> {
    if libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Some(128 + libc::WTERMSIG(status))
    } else {
        None
    }
}

/// Handle to a container init process
#[derive(Debug)]
pub struct ContainerProcess {
    pid: libc::pid_t,
    /// Whether this process is our child and must be reaped with waitpid
    owned: bool,
    sync: Option<OwnedFd>,
    errors: Option<OwnedFd>,
    exited: bool,
    exit_code: Option<i32>,
}

impl ContainerProcess {
    /// Clone a child into new namespaces; it stays parked until [`release`](Self::release)
    pub(crate) fn spawn(config: &ProcessConfig, flags: libc::c_int) -> Result<Self> {
        let setup = ChildSetup::new(config)?;
        let (sync_read, sync_write) =
            syscall::pipe().map_err(|e| CorralError::external("create sync pipe", e))?;
        let (err_read, err_write) =
            syscall::pipe().map_err(|e| CorralError::external("create error pipe", e))?;
        let fds = PipeFds {
            sync_read: sync_read.as_raw_fd(),
            sync_write: sync_write.as_raw_fd(),
            err_read: err_read.as_raw_fd(),
            err_write: err_write.as_raw_fd(),
        };

        let pid = match &config.netns {
            Some(netns) => {
                let netns_file = File::open(netns)
                    .map_err(|e| CorralError::external(format!("open {}", netns.display()), e))?;
                // setns only affects the calling thread, so clone from a scratch one
                let joined = std::thread::scope(|scope| {
                    scope
                        .spawn(|| {
                            syscall::setns(netns_file.as_raw_fd(), libc::CLONE_NEWNET)?;
                            clone_child(&setup, fds, flags)
                        })
                        .join()
                });
                joined
                    .map_err(|_| CorralError::Lock("spawn thread panicked".to_string()))?
                    .map_err(|e| {
                        CorralError::external(format!("clone into {}", netns.display()), e)
                    })?
            }
            None => clone_child(&setup, fds, flags)
                .map_err(|e| CorralError::external("clone container init", e))?,
        };

        drop(sync_read);
        drop(err_write);

        Ok(Self {
            pid,
            owned: true,
            sync: Some(sync_write),
            errors: Some(err_read),
            exited: false,
            exit_code: None,
        })
    }

    /// Take over an already running child of this process
    pub fn from_child(child: std::process::Child) -> Self {
        let pid = child.id() as libc::pid_t;
        // dropping a Child neither waits nor kills; reaping is ours from here
        drop(child);
        Self {
            pid,
            owned: true,
            sync: None,
            errors: None,
            exited: false,
            exit_code: None,
        }
    }

    /// Track a process started by another runtime instance
    pub fn adopt(pid: libc::pid_t) -> Self {
        Self {
            pid,
            owned: false,
            sync: None,
            errors: None,
            exited: false,
            exit_code: None,
        }
    }

    /// Get the process ID
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Get the exit code, once known
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Let a parked child continue into exec and report how that went
    pub fn release(&mut self) -> Result<()> {
        let Some(sync) = self.sync.take() else {
            return Ok(());
        };
        let written = syscall::write_fd(sync.as_raw_fd(), &[1]);
        drop(sync);
        if let Err(e) = written {
            self.kill_and_reap();
            return Err(CorralError::external("release container init", e));
        }

        let Some(errors) = self.errors.take() else {
            return Ok(());
        };
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match syscall::read_fd(errors.as_raw_fd(), &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.kill_and_reap();
                    return Err(CorralError::external("read container init status", e));
                }
            }
        }

        if filled == 0 {
            // close-on-exec closed the pipe: the command is running
            return Ok(());
        }

        let errno = if filled == buf.len() {
            i32::from_ne_bytes(buf)
        } else {
            libc::EIO
        };
        let _ = self.wait();
        Err(CorralError::external(
            "start container command",
            io::Error::from_raw_os_error(errno),
        ))
    }

    /// Check for exit without blocking
    pub fn try_wait(&mut self) -> io::Result<bool> {
        if self.exited {
            return Ok(true);
        }
        if !self.owned {
            self.exited = !is_alive(self.pid);
            return Ok(self.exited);
        }
        match syscall::waitpid(self.pid, libc::WNOHANG) {
            Ok(Some(status)) => {
                self.record_exit(status);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {
                self.exited = true;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` for exit; true when the process is gone
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Wait for the process to exit
    pub fn wait(&mut self) -> io::Result<()> {
        if self.owned && !self.exited {
            match syscall::waitpid(self.pid, 0) {
                Ok(Some(status)) => self.record_exit(status),
                Ok(None) => {}
                Err(e) if e.raw_os_error() == Some(libc::ECHILD) => self.exited = true,
                Err(e) => return Err(e),
            }
            return Ok(());
        }
        while !self.try_wait()? {
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// Send a signal; a process that is already gone is not an error
    pub fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        match syscall::kill(self.pid, signal) {
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            result => result,
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and wait unconditionally.
    ///
    /// Returns true when the forceful kill was needed.
    pub fn terminate(&mut self, grace: Duration) -> io::Result<bool> {
        if self.try_wait()? {
            return Ok(false);
        }
        self.signal(libc::SIGTERM)?;
        if self.wait_timeout(grace)? {
            return Ok(false);
        }
        self.signal(libc::SIGKILL)?;
        self.wait()?;
        Ok(true)
    }

    /// Best-effort SIGKILL and reap, used when unwinding a failed start
    pub fn kill_and_reap(&mut self) {
        let _ = self.signal(libc::SIGKILL);
        let _ = self.wait();
    }

    fn record_exit(&mut self, status: libc::c_int) {
        self.exited = true;
        self.exit_code = decode_status(status);
    }
}
