//! Linux namespace management
//!
//! Host capability checks, namespace identity lookups, user namespace id
//! mapping, and the entry point that launches an isolated container process.

use super::process::{ContainerProcess, ProcessConfig};
use super::syscall;
use crate::error::{CorralError, Result};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Types of Linux namespaces a container is isolated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NamespaceType {
    /// User namespace - isolates user and group IDs
    User,
    /// Mount namespace - isolates filesystem mount points
    Mount,
    /// UTS namespace - isolates hostname and domain name
    Uts,
    /// IPC namespace - isolates System V IPC and POSIX message queues
    Ipc,
    /// PID namespace - isolates process IDs
    Pid,
    /// Network namespace - isolates network devices, ports, etc.
    Net,
}

impl NamespaceType {
    /// Get the clone flag for this namespace type
    pub fn clone_flag(&self) -> libc::c_int {
        match self {
            NamespaceType::User => libc::CLONE_NEWUSER,
            NamespaceType::Mount => libc::CLONE_NEWNS,
            NamespaceType::Uts => libc::CLONE_NEWUTS,
            NamespaceType::Ipc => libc::CLONE_NEWIPC,
            NamespaceType::Pid => libc::CLONE_NEWPID,
            NamespaceType::Net => libc::CLONE_NEWNET,
        }
    }

    /// Get the namespace file name in /proc/[pid]/ns/
    pub fn proc_name(&self) -> &'static str {
        match self {
            NamespaceType::User => "user",
            NamespaceType::Mount => "mnt",
            NamespaceType::Uts => "uts",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Pid => "pid",
            NamespaceType::Net => "net",
        }
    }

    /// All namespace types, user namespace first
    pub fn all() -> [NamespaceType; 6] {
        [
            NamespaceType::User,
            NamespaceType::Mount,
            NamespaceType::Uts,
            NamespaceType::Ipc,
            NamespaceType::Pid,
            NamespaceType::Net,
        ]
    }

    /// Path of this namespace for `pid` (or the caller when `None`)
    pub fn proc_path(&self, pid: Option<libc::pid_t>) -> PathBuf {
        let pid = pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "self".to_string());
        PathBuf::from(format!("/proc/{}/ns/{}", pid, self.proc_name()))
    }
}

/// Combined clone flags for a set of namespace types
pub fn clone_flags(namespaces: &[NamespaceType]) -> libc::c_int {
    namespaces.iter().fold(0, |acc, ns| acc | ns.clone_flag())
}

/// Extract the inode number from a namespace link target such as `mnt:[4026531840]`
pub fn parse_namespace_link(target: &str) -> Option<u64> {
    let start = target.find('[')? + 1;
    let end = target[start..].find(']')? + start;
    target[start..end].parse().ok()
}

/// Namespace manager for creating container processes
#[derive(Debug, Clone)]
pub struct NamespaceManager {
    proc_root: PathBuf,
}

/// One line of a `uid_map` or `gid_map`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// Every id the kernel can represent, mapped onto itself
    pub const IDENTITY: IdMapping = IdMapping {
        container_id: 0,
        host_id: 0,
        size: u32::MAX,
    };

    /// Mapping for a runtime whose effective id is `host_id`.
    ///
    /// Root maps the whole id range, so images keep their file owners and
    /// programs can switch to unprivileged users. Anyone else can only map
    /// their own id onto container root.
    pub fn for_host_id(host_id: u32) -> Self {
        if host_id == 0 {
            Self::IDENTITY
        } else {
            IdMapping {
                container_id: 0,
                host_id,
                size: 1,
            }
        }
    }
}

fn render_id_map(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

impl Default for NamespaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceManager {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Verify the host can isolate a container in all six namespace kinds
    pub fn check_support(&self) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(CorralError::UnsupportedHost(format!(
                "containers need a Linux kernel, this host runs {}",
                std::env::consts::OS
            )));
        }

        if syscall::geteuid() != 0 {
            return Err(CorralError::InsufficientPrivilege(
                "creating namespaces, cgroups and mounts requires root".to_string(),
            ));
        }

        let missing: Vec<&str> = NamespaceType::all()
            .iter()
            .filter(|ns| !self.proc_root.join("self/ns").join(ns.proc_name()).exists())
            .map(|ns| ns.proc_name())
            .collect();
        if !missing.is_empty() {
            return Err(CorralError::UnsupportedHost(format!(
                "kernel does not expose namespace files: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Namespace identities of the calling process, keyed by kind
    pub fn current_namespace_ids(&self) -> Result<BTreeMap<String, u64>> {
        let mut ids = BTreeMap::new();
        for ns in NamespaceType::all() {
            let path = self.proc_root.join("self/ns").join(ns.proc_name());
            let target = std::fs::read_link(&path)
                .map_err(|e| CorralError::external(format!("readlink {}", path.display()), e))?;
            let target = target.to_string_lossy();
            let id = parse_namespace_link(&target).ok_or_else(|| {
                CorralError::UnsupportedHost(format!("unexpected namespace link {}", target))
            })?;
            ids.insert(ns.proc_name().to_string(), id);
        }
        Ok(ids)
    }

    /// Write the id maps of a freshly cloned child.
    ///
    /// `setgroups` is denied only for an unprivileged caller, where the
    /// kernel requires it before `gid_map` can be written.
    pub fn setup_user_namespace(
        &self,
        pid: libc::pid_t,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> Result<()> {
        let base = self.proc_root.join(pid.to_string());
        tracing::debug!(pid, ?uid_mappings, ?gid_mappings, "writing id maps");

        write_proc_file(&base.join("uid_map"), &render_id_map(uid_mappings))?;

        let setgroups = base.join("setgroups");
        if syscall::geteuid() != 0 && setgroups.exists() {
            write_proc_file(&setgroups, "deny")?;
        }

        write_proc_file(&base.join("gid_map"), &render_id_map(gid_mappings))
    }

    /// Launch `config` as a child that starts life inside fresh namespaces.
    ///
    /// The returned process is held at a barrier: the caller attaches it to
    /// its cgroup and then calls [`ContainerProcess::release`] to let it exec.
    pub fn create_isolated_process(&self, config: &ProcessConfig) -> Result<ContainerProcess> {
        self.check_support()?;

        let mut namespaces = NamespaceType::all().to_vec();
        if config.netns.is_some() {
            namespaces.retain(|ns| *ns != NamespaceType::Net);
        }

        let mut process = ContainerProcess::spawn(config, clone_flags(&namespaces))?;
        tracing::debug!(pid = process.pid(), hostname = %config.hostname, "cloned container init");

        let uid_map = IdMapping::for_host_id(syscall::geteuid());
        let gid_map = IdMapping::for_host_id(syscall::getegid());
        if let Err(e) = self.setup_user_namespace(process.pid(), &[uid_map], &[gid_map]) {
            process.kill_and_reap();
            return Err(e);
        }

        Ok(process)
    }
}

fn write_proc_file(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| CorralError::external(format!("open {}", path.display()), e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| CorralError::external(format!("write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_type_clone_flags() {
        assert_eq!(NamespaceType::Mount.clone_flag(), libc::CLONE_NEWNS);
        assert_eq!(NamespaceType::Uts.clone_flag(), libc::CLONE_NEWUTS);
        assert_eq!(NamespaceType::Pid.clone_flag(), libc::CLONE_NEWPID);
        assert_eq!(NamespaceType::Net.clone_flag(), libc::CLONE_NEWNET);
        assert_eq!(NamespaceType::User.clone_flag(), libc::CLONE_NEWUSER);
    }

    #[test]
    fn test_all_puts_user_first() {
        assert_eq!(NamespaceType::all()[0], NamespaceType::User);
        assert_eq!(NamespaceType::all().len(), 6);
    }

    #[test]
    fn test_combined_flags() {
        let flags = clone_flags(&NamespaceType::all());
        for ns in NamespaceType::all() {
            assert!(flags & ns.clone_flag() != 0);
        }
        assert_eq!(flags & libc::CLONE_NEWCGROUP, 0);
    }

    #[test]
    fn test_proc_path() {
        assert_eq!(NamespaceType::Pid.proc_path(None), PathBuf::from("/proc/self/ns/pid"));
        assert_eq!(
            NamespaceType::Net.proc_path(Some(1234)),
            PathBuf::from("/proc/1234/ns/net")
        );
    }

    #[test]
    fn test_parse_namespace_link() {
        assert_eq!(parse_namespace_link("mnt:[4026531840]"), Some(4026531840));
        assert_eq!(parse_namespace_link("net:[1]"), Some(1));
        assert_eq!(parse_namespace_link("garbage"), None);
        assert_eq!(parse_namespace_link("pid:[abc]"), None);
    }

    #[test]
    fn test_current_namespace_ids() {
        let manager = NamespaceManager::new();
        let ids = manager.current_namespace_ids().unwrap();
        assert_eq!(ids.len(), 6);
        assert!(ids.contains_key("mnt"));
        assert!(ids.values().all(|id| *id > 0));
    }

    #[test]
    fn test_root_maps_full_id_range() {
        assert_eq!(IdMapping::for_host_id(0), IdMapping::IDENTITY);
        assert_eq!(render_id_map(&[IdMapping::for_host_id(0)]), "0 0 4294967295\n");
        assert_eq!(render_id_map(&[IdMapping::for_host_id(1000)]), "0 1000 1\n");
    }

    #[test]
    fn test_setup_user_namespace_writes_maps() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("42");
        std::fs::create_dir(&proc_dir).unwrap();
        for name in ["uid_map", "gid_map", "setgroups"] {
            std::fs::write(proc_dir.join(name), "").unwrap();
        }
        let manager = NamespaceManager {
            proc_root: dir.path().to_path_buf(),
        };

        let mapping = IdMapping::for_host_id(syscall::geteuid());
        manager.setup_user_namespace(42, &[mapping], &[mapping]).unwrap();

        let uid_map = std::fs::read_to_string(proc_dir.join("uid_map")).unwrap();
        let setgroups = std::fs::read_to_string(proc_dir.join("setgroups")).unwrap();
        if syscall::geteuid() == 0 {
            assert_eq!(uid_map, "0 0 4294967295\n");
            // a privileged runtime leaves setgroups usable inside
            assert_eq!(setgroups, "");
        } else {
            assert!(uid_map.starts_with("0 "));
            assert_eq!(setgroups, "deny");
        }
        assert_eq!(std::fs::read_to_string(proc_dir.join("gid_map")).unwrap(), uid_map);
    }

    #[test]
    fn test_check_support_requires_root() {
        let result = NamespaceManager::new().check_support();
        if syscall::geteuid() != 0 {
            assert_eq!(result.unwrap_err().kind(), "insufficient_privilege");
        }
    }
}
