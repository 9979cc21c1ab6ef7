mod backend;
mod docker_backend;
mod driver;
mod isolate_backend;
mod process_backend;
mod provisioner;

// Re-export the capability trait and common types
pub use backend::{BackendKind, SandboxBackend, SandboxInstance, SandboxSpec, Usage};
pub use docker_backend::DockerBackend;
pub use driver::{ExecutionDriver, ExecutionOutcome, Fault, LimitKind, Verdict, compare_output};
pub use isolate_backend::IsolateBackend;
pub use process_backend::ProcessBackend;
pub use provisioner::{Provisioner, SandboxHandle};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::config::BackendConfig;

/// Fixed in-sandbox directory holding the submitted code, mounted read-only
pub const CODE_MOUNT: &str = "/sandbox";

/// Creates the sandbox backend selected by the configuration
///
/// `process` runs programs as plain host processes with rlimits and is meant
/// for development and tests; `isolate` and `docker` provide real isolation.
pub fn create_backend(
    config: &BackendConfig,
    max_concurrency: usize,
) -> Result<Arc<dyn SandboxBackend>> {
    match config {
        BackendConfig::Process {
            unshare_network,
            work_root,
            cgroup_root,
        } => {
            let work_root = match work_root {
                Some(dir) => dir.clone(),
                None => default_work_root("process")?,
            };
            log::info!("Creating process backend (network isolation: {unshare_network})");
            let backend = ProcessBackend::new(work_root, *unshare_network)?;
            Ok(Arc::new(match cgroup_root {
                Some(root) => {
                    log::info!("Process caps enforced by pids cgroups under {}", root.display());
                    backend.with_cgroup_root(root.clone())
                }
                None => {
                    log::warn!("No cgroup_root set, process caps are enforced by sampling only");
                    backend
                }
            }))
        }
        BackendConfig::Isolate {
            binary,
            first_box_id,
            box_count,
            work_root,
        } => {
            if (*box_count as usize) < max_concurrency {
                log::warn!(
                    "isolate box_count {box_count} is below max_concurrency {max_concurrency}"
                );
            }
            let work_root = match work_root {
                Some(dir) => dir.clone(),
                None => default_work_root("isolate")?,
            };
            log::info!("Creating isolate backend with boxes {first_box_id}..+{box_count}");
            Ok(Arc::new(IsolateBackend::new(
                binary.clone(),
                *first_box_id,
                *box_count,
                work_root,
            )?))
        }
        BackendConfig::Docker { binary, runtime } => {
            log::info!(
                "Creating docker backend (runtime: {})",
                runtime.as_deref().unwrap_or("default")
            );
            Ok(Arc::new(DockerBackend::new(binary.clone(), runtime.clone())))
        }
    }
}

/// Per-backend scratch directory under the user cache dir
pub fn default_work_root(name: &str) -> Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "gradebox")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;

    let dir = proj_dirs.cache_dir().join(name);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
