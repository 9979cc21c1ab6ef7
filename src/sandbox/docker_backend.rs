use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ProvisioningError;

use super::backend::spawn_error;
use super::{
    BackendKind, CODE_MOUNT, LimitKind, SandboxBackend, SandboxInstance, SandboxSpec, Usage,
};

const TMPFS_MOUNT: &str = "/tmp:rw,exec,nosuid,size=64m";
const CONTAINER_LABEL: &str = "gradebox.sandbox=1";

/// Container-based sandboxes driven through the `docker` CLI
///
/// Containers are created with no network, a read-only root filesystem, a
/// fresh tmpfs at `/tmp`, dropped capabilities and cgroup limits. The code
/// directory is bind-mounted read-only at [`CODE_MOUNT`]. Passing a runtime
/// such as `kata-runtime` turns every sandbox into a microVM.
pub struct DockerBackend {
    binary: String,
    runtime: Option<String>,
}

impl DockerBackend {
    pub fn new(binary: String, runtime: Option<String>) -> Self {
        Self { binary, runtime }
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn create_args(&self, spec: &SandboxSpec) -> Result<Vec<String>, ProvisioningError> {
        let image = spec.image.as_ref().ok_or_else(|| {
            ProvisioningError::Failed(format!("language {} has no image", spec.language))
        })?;
        let limits = &spec.limits;

        let mut args = vec![
            "create".to_string(),
            "--interactive".to_string(),
            "--network=none".to_string(),
            "--read-only".to_string(),
            format!("--tmpfs={TMPFS_MOUNT}"),
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            format!("--memory={}m", limits.memory_cap_mb),
            format!("--memory-swap={}m", limits.memory_cap_mb),
            format!("--cpus={}", limits.cpu_share),
            format!("--pids-limit={}", limits.process_count_cap),
            format!("--label={CONTAINER_LABEL}"),
            "--workdir=/tmp".to_string(),
            format!("--volume={}:{CODE_MOUNT}:ro", spec.code_dir.display()),
        ];
        if let Some(runtime) = &self.runtime {
            args.push(format!("--runtime={runtime}"));
        }
        args.push(image.clone());
        args.extend(spec.argv(Path::new(CODE_MOUNT)));

        Ok(args)
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let output = self
            .docker()
            .args(["rm", "--force", "--volumes", container_id])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                bail!("docker rm {container_id} failed: {}", stderr.trim());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxInstance, ProvisioningError> {
        let args = self.create_args(spec)?;
        let output = self
            .docker()
            .args(&args)
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(if stderr.contains("Cannot connect to the Docker daemon") {
                ProvisioningError::Unavailable(stderr.to_string())
            } else {
                ProvisioningError::Failed(format!("docker create failed: {stderr}"))
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(ProvisioningError::Failed(
                "docker create printed no container id".to_string(),
            ));
        }

        log::debug!("Container {container_id} created for {}", spec.language);
        Ok(SandboxInstance::new(
            container_id,
            spec.code_dir.clone(),
            spec.clone(),
        ))
    }

    fn command(&self, sandbox: &SandboxInstance) -> Result<Command, ProvisioningError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["start", "--attach", "--interactive", &sandbox.native_id])
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn sample_memory_kb(&self, sandbox: &SandboxInstance) -> Option<u64> {
        read_cgroup_file(&sandbox.native_id, "memory", "memory.peak", "memory.max_usage_in_bytes")
            .and_then(|bytes| bytes.trim().parse::<u64>().ok())
            .map(|bytes| bytes / 1024)
    }

    // The container cgroup disappears when the program exits, so only hits
    // sampled while it runs are seen
    fn process_limit_hit(&self, sandbox: &SandboxInstance) -> bool {
        read_cgroup_file(&sandbox.native_id, "pids", "pids.events", "pids.events")
            .and_then(|events| {
                events
                    .lines()
                    .find_map(|line| line.strip_prefix("max "))
                    .and_then(|count| count.trim().parse::<u64>().ok())
            })
            .is_some_and(|refused| refused > 0)
    }

    async fn interrupt(&self, sandbox: &SandboxInstance) {
        let result = self
            .docker()
            .args(["kill", &sandbox.native_id])
            .output()
            .await;
        if let Err(e) = result {
            log::warn!("docker kill {} failed: {e}", sandbox.native_id);
        }
    }

    async fn usage(&self, sandbox: &SandboxInstance, _status: &ExitStatus) -> Usage {
        let output = self
            .docker()
            .args([
                "inspect",
                "--format",
                "{{.State.OOMKilled}}",
                &sandbox.native_id,
            ])
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let oom_killed = String::from_utf8_lossy(&output.stdout).trim() == "true";
                Usage {
                    limit: oom_killed.then_some(LimitKind::Memory),
                    ..Usage::default()
                }
            }
            Ok(output) => {
                log::warn!(
                    "docker inspect {} failed: {}",
                    sandbox.native_id,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                Usage::default()
            }
            Err(e) => {
                log::warn!("docker inspect {} failed: {e}", sandbox.native_id);
                Usage::default()
            }
        }
    }

    async fn scrub(&self, sandbox: &SandboxInstance) -> Result<(), ProvisioningError> {
        // The root filesystem is read-only and the tmpfs is recreated on every
        // start, so stopping the container resets all writable state
        let output = self
            .docker()
            .args(["stop", "--time=0", &sandbox.native_id])
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary, e))?;

        if !output.status.success() {
            return Err(ProvisioningError::Failed(format!(
                "docker stop {} failed: {}",
                sandbox.native_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn destroy(&self, sandbox: &SandboxInstance) -> Result<()> {
        self.remove(&sandbox.native_id).await?;
        log::debug!("Container {} removed", sandbox.native_id);
        Ok(())
    }
}

/// Reads a file of the container's cgroup, trying the systemd and cgroupfs
/// layouts of cgroup v2 before the v1 `controller` hierarchy
fn read_cgroup_file(id: &str, controller: &str, v2_name: &str, v1_name: &str) -> Option<String> {
    [
        format!("/sys/fs/cgroup/system.slice/docker-{id}.scope/{v2_name}"),
        format!("/sys/fs/cgroup/docker/{id}/{v2_name}"),
        format!("/sys/fs/cgroup/{controller}/docker/{id}/{v1_name}"),
    ]
    .iter()
    .find_map(|path| std::fs::read_to_string(path).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LanguageConfig, ResourceLimits};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_args_lock_the_container_down() {
        let language = LanguageConfig {
            name: "python".to_string(),
            file_name: "main.py".to_string(),
            command: vec!["python3".to_string(), "%SOURCE%".to_string()],
            image: Some("python:3.12-slim".to_string()),
        };
        let spec = SandboxSpec::new(
            &language,
            Path::new("/var/cache/gradebox/ws-1"),
            &ResourceLimits::default(),
        );
        let backend = DockerBackend::new("docker".to_string(), Some("runsc".to_string()));
        let args = backend.create_args(&spec).unwrap();

        assert_eq!(args[0], "create");
        for expected in [
            "--network=none",
            "--read-only",
            "--memory=256m",
            "--memory-swap=256m",
            "--cpus=1",
            "--pids-limit=16",
            "--volume=/var/cache/gradebox/ws-1:/sandbox:ro",
            "--runtime=runsc",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        assert_eq!(
            &args[args.len() - 3..],
            &["python:3.12-slim", "python3", "/sandbox/main.py"]
        );
    }

    #[test]
    fn test_create_requires_image() {
        let language = LanguageConfig {
            name: "python".to_string(),
            file_name: "main.py".to_string(),
            command: vec!["python3".to_string(), "%SOURCE%".to_string()],
            image: None,
        };
        let spec = SandboxSpec::new(&language, Path::new("/tmp"), &ResourceLimits::default());
        let backend = DockerBackend::new("docker".to_string(), None);
        assert!(backend.create_args(&spec).is_err());
    }
}
