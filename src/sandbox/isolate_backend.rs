use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use crate::error::ProvisioningError;

use super::backend::spawn_error;
use super::{
    BackendKind, CODE_MOUNT, LimitKind, SandboxBackend, SandboxInstance, SandboxSpec, Usage,
};

// Sandbox configuration constants
const RUNTIME_OPEN_FILES: u32 = 64;
const WALL_TIME_GRACE_SECS: f64 = 0.5;
const SANDBOX_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// OS-level jail built on the `isolate` tool
///
/// Each sandbox is one isolate box (`--cg` mode): its own mount, pid and
/// network namespaces plus a memory cgroup. The submitted code directory is
/// bound read-only at [`CODE_MOUNT`]; isolate never shares the host network
/// unless asked to.
pub struct IsolateBackend {
    binary: String,
    /// Box ids not currently owned by a sandbox
    free_boxes: Mutex<Vec<u32>>,
    /// Released boxes whose `--cleanup` failed; cleaned again before reuse
    quarantined: Mutex<Vec<u32>>,
    /// Directory for meta files
    work_root: PathBuf,
}

impl IsolateBackend {
    pub fn new(binary: String, first_box_id: u32, box_count: u32, work_root: PathBuf) -> Result<Self> {
        if box_count == 0 {
            bail!("isolate backend needs at least one box");
        }
        std::fs::create_dir_all(&work_root)?;

        // Hand out low ids first
        let free_boxes = (first_box_id..first_box_id + box_count).rev().collect();

        Ok(Self {
            binary,
            free_boxes: Mutex::new(free_boxes),
            quarantined: Mutex::new(Vec::new()),
            work_root,
        })
    }

    fn meta_path(&self, box_id: &str) -> PathBuf {
        self.work_root.join(format!("box-{box_id}.meta"))
    }

    fn return_box(&self, box_id: u32) {
        let mut free = self.free_boxes.lock();
        if !free.contains(&box_id) {
            free.push(box_id);
        }
    }

    /// Takes a free box, falling back to cleaning up a quarantined one
    async fn take_box(&self) -> Result<u32, ProvisioningError> {
        if let Some(box_id) = self.free_boxes.lock().pop() {
            return Ok(box_id);
        }

        let candidates = self.quarantined.lock().len();
        for _ in 0..candidates {
            let Some(box_id) = self.quarantined.lock().pop() else {
                break;
            };
            match self.box_command(&box_id.to_string(), "--cleanup").await {
                Ok(_) => {
                    log::info!("Isolate box {box_id} reclaimed from quarantine");
                    return Ok(box_id);
                }
                Err(e) => {
                    log::warn!("Isolate box {box_id} still unusable: {e}");
                    self.quarantined.lock().insert(0, box_id);
                }
            }
        }

        Err(ProvisioningError::Unavailable("no free isolate box".to_string()))
    }

    /// Runs `isolate -b <id> --cg <action>` and fails on non-zero exit
    async fn box_command(&self, box_id: &str, action: &str) -> Result<String, ProvisioningError> {
        let output = Command::new(&self.binary)
            .args(["-b", box_id, "--cg", action])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary, e))?;

        if !output.status.success() {
            return Err(ProvisioningError::Failed(format!(
                "isolate {action} on box {box_id} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Isolate
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxInstance, ProvisioningError> {
        let box_id = self.take_box().await?;
        let native_id = box_id.to_string();

        let root_dir = match self.box_command(&native_id, "--init").await {
            Ok(root) => root,
            Err(e) => {
                self.return_box(box_id);
                return Err(e);
            }
        };
        if root_dir.is_empty() {
            self.return_box(box_id);
            return Err(ProvisioningError::Failed(
                "isolate --init produced empty stdout".to_string(),
            ));
        }

        log::debug!("Isolate box {box_id} initialized at {root_dir}");
        Ok(SandboxInstance::new(
            native_id,
            PathBuf::from(root_dir).join("box"),
            spec.clone(),
        ))
    }

    fn command(&self, sandbox: &SandboxInstance) -> Result<Command, ProvisioningError> {
        let spec = &sandbox.spec;
        let limits = &spec.limits;
        let argv = spec.argv(Path::new(CODE_MOUNT));
        if argv.is_empty() {
            return Err(ProvisioningError::Failed("empty run command".to_string()));
        }

        let wall_time_arg = format!(
            "--wall-time={:.3}",
            limits.wall_clock_timeout_ms as f64 / 1000.0 + WALL_TIME_GRACE_SECS
        );
        let memory_arg = format!("--cg-mem={}", limits.memory_cap_kb());
        let processes_arg = format!("--processes={}", limits.process_count_cap);
        let open_files_arg = format!("--open-files={RUNTIME_OPEN_FILES}");
        let fsize_arg = format!("--fsize={}", limits.output_cap_kb);
        let dir_arg = format!("--dir={CODE_MOUNT}={}", spec.code_dir.display());
        let meta_path = self.meta_path(&sandbox.native_id);
        let meta_path = meta_path.to_string_lossy();

        // Stdio is passed through to the caller since no -i/-o/-r is given
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "-b",
            &sandbox.native_id,
            "--cg",
            "--run",
            &wall_time_arg,
            &memory_arg,
            &processes_arg,
            &open_files_arg,
            &fsize_arg,
            &dir_arg,
            "-E",
            SANDBOX_PATH,
            "-M",
            &meta_path,
            "--silent",
            "--",
        ])
        .args(&argv)
        .kill_on_drop(true);

        Ok(cmd)
    }

    async fn interrupt(&self, sandbox: &SandboxInstance) {
        // Killing the keeper tears the box's pid namespace down with it
        if let Some(pid) = sandbox.active_pid() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    async fn usage(&self, sandbox: &SandboxInstance, _status: &ExitStatus) -> Usage {
        let meta_path = self.meta_path(&sandbox.native_id);
        match tokio::fs::read_to_string(&meta_path).await {
            Ok(meta) => parse_meta(&meta),
            Err(e) => {
                log::warn!("Failed to read meta file {}: {e}", meta_path.display());
                Usage::default()
            }
        }
    }

    async fn scrub(&self, sandbox: &SandboxInstance) -> Result<(), ProvisioningError> {
        self.box_command(&sandbox.native_id, "--cleanup").await?;
        self.box_command(&sandbox.native_id, "--init").await?;
        log::debug!("Isolate box {} reinitialized", sandbox.native_id);
        Ok(())
    }

    async fn destroy(&self, sandbox: &SandboxInstance) -> Result<()> {
        let box_id: u32 = sandbox.native_id.parse()?;
        let _ = tokio::fs::remove_file(self.meta_path(&sandbox.native_id)).await;

        match self.box_command(&sandbox.native_id, "--cleanup").await {
            Ok(_) => {
                self.return_box(box_id);
                log::debug!("Isolate box {box_id} cleaned up");
            }
            Err(e) => {
                // The box stays out of the free list until a later cleanup succeeds
                log::warn!("Quarantining isolate box {box_id}: {e}");
                let mut quarantined = self.quarantined.lock();
                if !quarantined.contains(&box_id) {
                    quarantined.push(box_id);
                }
            }
        }
        Ok(())
    }
}

/// Reads an isolate meta file into resource usage
fn parse_meta(meta_content: &str) -> Usage {
    let mut usage = Usage::default();
    let mut max_rss = None;

    for line in meta_content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key {
                "cg-oom-killed" => {
                    // cg-oom-killed:1
                    usage.limit = Some(LimitKind::Memory);
                }
                "status" => {
                    // TO = timed out, SG = signal, RE = runtime error, XX = internal
                    if value == "TO" {
                        usage.timed_out = true;
                    }
                }
                "exitsig" => {
                    if value == libc::SIGXFSZ.to_string() && usage.limit.is_none() {
                        usage.limit = Some(LimitKind::Output);
                    }
                }
                "cg-mem" => {
                    if let Ok(memory) = value.parse::<u64>() {
                        usage.peak_memory_kb = Some(memory);
                    }
                }
                "max-rss" => {
                    max_rss = value.parse::<u64>().ok();
                }
                _ => {}
            }
        }
    }

    if usage.peak_memory_kb.is_none() {
        usage.peak_memory_kb = max_rss;
    }
    usage
}
