use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{LanguageConfig, ResourceLimits, SOURCE_PLACEHOLDER};
use crate::error::ProvisioningError;

use super::LimitKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Plain host process with rlimits
    Process,
    /// OS-level jail driven by `isolate`
    Isolate,
    /// Container (or microVM through an OCI runtime) driven by `docker`
    Container,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Isolate => "isolate",
            Self::Container => "container",
        })
    }
}

/// Everything a backend needs to know to build one sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub language: String,
    /// Host directory with the submitted source, mounted read-only
    pub code_dir: PathBuf,
    pub file_name: String,
    pub command: Vec<String>,
    pub image: Option<String>,
    pub limits: ResourceLimits,
}

impl SandboxSpec {
    pub fn new(language: &LanguageConfig, code_dir: &Path, limits: &ResourceLimits) -> Self {
        Self {
            language: language.name.clone(),
            code_dir: code_dir.to_path_buf(),
            file_name: language.file_name.clone(),
            command: language.command.clone(),
            image: language.image.clone(),
            limits: limits.clone(),
        }
    }

    /// Run command with the source placeholder resolved against `code_root`
    pub fn argv(&self, code_root: &Path) -> Vec<String> {
        let source = code_root.join(&self.file_name);
        let source = source.to_string_lossy();
        self.command
            .iter()
            .map(|arg| arg.replace(SOURCE_PLACEHOLDER, &source))
            .collect()
    }
}

/// Backend state of one live sandbox
#[derive(Debug)]
pub struct SandboxInstance {
    /// Backend-native identifier: box id, container id or scratch name
    pub native_id: String,
    /// Host-side scratch directory owned by this sandbox
    pub work_dir: PathBuf,
    pub spec: SandboxSpec,
    active_pid: AtomicU32,
}

impl SandboxInstance {
    pub fn new(native_id: impl Into<String>, work_dir: PathBuf, spec: SandboxSpec) -> Self {
        Self {
            native_id: native_id.into(),
            work_dir,
            spec,
            active_pid: AtomicU32::new(0),
        }
    }

    /// Host pid of the process most recently started in this sandbox
    pub fn active_pid(&self) -> Option<u32> {
        match self.active_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn set_active_pid(&self, pid: Option<u32>) {
        self.active_pid.store(pid.unwrap_or(0), Ordering::Release);
    }
}

/// Resource accounting collected after the program exited
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub peak_memory_kb: Option<u64>,
    pub limit: Option<LimitKind>,
    /// The backend itself stopped the program for exceeding its time budget
    pub timed_out: bool,
}

/// Sandbox capability: one isolation technology behind acquire/run/release
///
/// The provisioner and the execution driver only talk to this trait, never
/// to a concrete isolation runtime.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Creates a fresh isolated environment for `spec`
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxInstance, ProvisioningError>;

    /// Command that starts the program inside the sandbox; stdio is attached by the caller
    fn command(&self, sandbox: &SandboxInstance) -> Result<Command, ProvisioningError>;

    /// Peak memory observed so far while the program runs, in KiB
    fn sample_memory_kb(&self, _sandbox: &SandboxInstance) -> Option<u64> {
        None
    }

    /// Whether the program tried to hold more processes than `process_count_cap`
    ///
    /// Sampled while the program runs and once after it exits. Backends that
    /// cannot observe it keep the default; the program then only sees its
    /// forks fail.
    fn process_limit_hit(&self, _sandbox: &SandboxInstance) -> bool {
        false
    }

    /// Forcibly stops everything running inside the sandbox
    async fn interrupt(&self, sandbox: &SandboxInstance);

    /// Accounting for the run that just finished
    async fn usage(&self, sandbox: &SandboxInstance, status: &ExitStatus) -> Usage;

    /// Resets writable state so the sandbox can run another test case
    async fn scrub(&self, sandbox: &SandboxInstance) -> Result<(), ProvisioningError>;

    /// Reclaims every host resource held by the sandbox; tolerates repeated calls
    async fn destroy(&self, sandbox: &SandboxInstance) -> anyhow::Result<()>;
}

/// Turns a failed spawn of a runtime binary into the matching provisioning error
pub(super) fn spawn_error(binary: &str, e: std::io::Error) -> ProvisioningError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProvisioningError::Unavailable(format!("{binary} not found"))
    } else {
        ProvisioningError::Unavailable(format!("failed to run {binary}: {e}"))
    }
}
