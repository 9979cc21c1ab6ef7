use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ProvisioningError;

use super::{BackendKind, LimitKind, SandboxBackend, SandboxInstance, SandboxSpec, Usage};

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

/// Limits applied in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    file_size: u64,
    cpu_seconds: u64,
}

/// Runs programs as ordinary host processes
///
/// Every sandbox gets its own scratch directory, process group and rlimits,
/// and optionally a fresh (empty) network namespace. There is no filesystem
/// isolation: the submitted code is only protected by file permissions. Use
/// it for development and tests, not for untrusted traffic.
///
/// The process cap is enforced by a per-sandbox pids cgroup when a delegated
/// cgroup v2 directory is configured; forks past the cap then fail, even for
/// root. Without one, the program's process group is counted while it runs
/// and killed once it grows past the cap.
pub struct ProcessBackend {
    work_root: PathBuf,
    unshare_network: bool,
    cgroup_root: Option<PathBuf>,
    next_id: AtomicU64,
}

impl ProcessBackend {
    pub fn new(work_root: PathBuf, unshare_network: bool) -> Result<Self> {
        std::fs::create_dir_all(&work_root)?;

        log::warn!("Process backend provides NO filesystem isolation - use only in trusted environments");
        if !unshare_network {
            log::warn!("Process backend runs programs WITH network access");
        }

        Ok(Self {
            work_root,
            unshare_network,
            cgroup_root: None,
            next_id: AtomicU64::new(0),
        })
    }

    /// Places every sandbox in its own pids cgroup below `root`
    ///
    /// `root` must be a cgroup v2 directory writable by this process with the
    /// `pids` controller enabled in its `cgroup.subtree_control`.
    pub fn with_cgroup_root(mut self, root: PathBuf) -> Self {
        self.cgroup_root = Some(root);
        self
    }

    fn cgroup_dir(&self, sandbox: &SandboxInstance) -> Option<PathBuf> {
        self.cgroup_root
            .as_ref()
            .map(|root| root.join(&sandbox.native_id))
    }

    /// Creates the sandbox cgroup with a fresh `pids.events` counter
    async fn create_cgroup(dir: &Path, cap: u32) -> io::Result<()> {
        tokio::fs::create_dir(dir).await?;
        tokio::fs::write(dir.join("pids.max"), cap.to_string()).await
    }

    async fn remove_cgroup(dir: &Path) -> io::Result<()> {
        // cgroup.kill only exists on kernels >= 5.14; the process group kill covers older ones
        let _ = tokio::fs::write(dir.join("cgroup.kill"), "1").await;
        match tokio::fs::remove_dir(dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    fn kill_group(pid: u32) {
        // The program leads its own process group, so this reaches its children too
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                log::warn!("Failed to kill process group {pid}: {err}");
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxInstance, ProvisioningError> {
        let serial = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{serial}", std::process::id());
        let work_dir = self.work_root.join(&name);

        tokio::fs::create_dir_all(&work_dir).await?;

        if let Some(root) = &self.cgroup_root {
            let cgroup = root.join(&name);
            if let Err(e) = Self::create_cgroup(&cgroup, spec.limits.process_count_cap).await {
                let _ = Self::remove_cgroup(&cgroup).await;
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                return Err(ProvisioningError::Unavailable(format!(
                    "cannot set up pids cgroup {}: {e}",
                    cgroup.display()
                )));
            }
        }
        log::debug!("Process sandbox {name} created at {}", work_dir.display());

        Ok(SandboxInstance::new(name, work_dir, spec.clone()))
    }

    fn command(&self, sandbox: &SandboxInstance) -> Result<Command, ProvisioningError> {
        let spec = &sandbox.spec;
        let argv = spec.argv(&spec.code_dir);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProvisioningError::Failed("empty run command".to_string()))?;

        let limits = ChildLimits {
            file_size: spec.limits.output_cap_bytes() as u64,
            cpu_seconds: spec.limits.wall_clock_timeout_ms.div_ceil(1000) + 1,
        };
        let unshare_network = self.unshare_network;
        let cgroup_procs = self
            .cgroup_dir(sandbox)
            .map(|dir| CString::new(dir.join("cgroup.procs").as_os_str().as_bytes()))
            .transpose()
            .map_err(|e| ProvisioningError::Failed(format!("invalid cgroup path: {e}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&sandbox.work_dir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &sandbox.work_dir)
            .env("TMPDIR", &sandbox.work_dir)
            .process_group(0)
            .kill_on_drop(true);

        // SAFETY: the closure only calls async-signal-safe libc functions
        unsafe {
            cmd.pre_exec(move || {
                if let Some(procs) = &cgroup_procs {
                    join_cgroup(procs)?;
                }
                apply_limits(&limits)?;
                if unshare_network {
                    enter_empty_network()?;
                }
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn sample_memory_kb(&self, sandbox: &SandboxInstance) -> Option<u64> {
        let pid = sandbox.active_pid()?;
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        parse_vm_hwm(&status)
    }

    fn process_limit_hit(&self, sandbox: &SandboxInstance) -> bool {
        let cap = sandbox.spec.limits.process_count_cap as usize;
        match self.cgroup_dir(sandbox) {
            Some(dir) => std::fs::read_to_string(dir.join("pids.events"))
                .ok()
                .and_then(|events| parse_pids_events_max(&events))
                .is_some_and(|refused| refused > 0),
            None => sandbox
                .active_pid()
                .is_some_and(|pid| count_group_members(pid) > cap),
        }
    }

    async fn interrupt(&self, sandbox: &SandboxInstance) {
        if let Some(pid) = sandbox.active_pid() {
            Self::kill_group(pid);
        }
        if let Some(dir) = self.cgroup_dir(sandbox) {
            let _ = tokio::fs::write(dir.join("cgroup.kill"), "1").await;
        }
    }

    async fn usage(&self, _sandbox: &SandboxInstance, status: &ExitStatus) -> Usage {
        match status.signal() {
            Some(libc::SIGXFSZ) => Usage {
                limit: Some(LimitKind::Output),
                ..Usage::default()
            },
            Some(libc::SIGXCPU) => Usage {
                timed_out: true,
                ..Usage::default()
            },
            _ => Usage::default(),
        }
    }

    async fn scrub(&self, sandbox: &SandboxInstance) -> Result<(), ProvisioningError> {
        if let Some(pid) = sandbox.active_pid() {
            Self::kill_group(pid);
        }
        match tokio::fs::remove_dir_all(&sandbox.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&sandbox.work_dir).await?;
        if let Some(dir) = self.cgroup_dir(sandbox) {
            // Recreated so the refused-fork counter starts from zero
            Self::remove_cgroup(&dir).await?;
            Self::create_cgroup(&dir, sandbox.spec.limits.process_count_cap).await?;
        }
        log::debug!("Process sandbox {} scrubbed", sandbox.native_id);
        Ok(())
    }

    async fn destroy(&self, sandbox: &SandboxInstance) -> Result<()> {
        if let Some(pid) = sandbox.active_pid() {
            Self::kill_group(pid);
        }
        match tokio::fs::remove_dir_all(&sandbox.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = self.cgroup_dir(sandbox) {
            Self::remove_cgroup(&dir).await?;
        }
        log::debug!("Process sandbox {} destroyed", sandbox.native_id);
        Ok(())
    }
}

fn set_rlimit(resource: RlimitResource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn apply_limits(limits: &ChildLimits) -> io::Result<()> {
    set_rlimit(libc::RLIMIT_FSIZE, limits.file_size, limits.file_size)?;
    set_rlimit(libc::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds + 1)?;
    set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

/// Moves the calling process into the cgroup whose `cgroup.procs` is `procs`
fn join_cgroup(procs: &CString) -> io::Result<()> {
    let fd = unsafe { libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // "0" stands for the writing process
    let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if written == 1 { Ok(()) } else { Err(err) }
}

/// Moves the child into new user and network namespaces with no interfaces but loopback
fn enter_empty_network() -> io::Result<()> {
    let rc = unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Extracts the `VmHWM` (peak resident set) value of a `/proc/<pid>/status` dump
fn parse_vm_hwm(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|value| value.trim().trim_end_matches("kB").trim().parse().ok())
}

/// Refused forks recorded by a `pids.events` file
fn parse_pids_events_max(events: &str) -> Option<u64> {
    events
        .lines()
        .find_map(|line| line.strip_prefix("max "))
        .and_then(|value| value.trim().parse().ok())
}

/// Process group id from a `/proc/<pid>/stat` line
fn parse_stat_pgrp(stat: &str) -> Option<u32> {
    // The command name may contain spaces and parentheses; fields resume after the last ')'
    let (_, rest) = stat.rsplit_once(')')?;
    // state, ppid, pgrp
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Processes currently in the process group led by `pgid`, zombies included
fn count_group_members(pgid: u32) -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter(|stat| parse_stat_pgrp(stat) == Some(pgid))
        .count()
}
