use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::{LanguageConfig, ResourceLimits};
use crate::error::ProvisioningError;

use super::{SandboxBackend, SandboxInstance, SandboxSpec};

const TEARDOWN_ATTEMPTS: u32 = 3;
const TEARDOWN_BACKOFF: Duration = Duration::from_millis(50);

/// Hands out sandboxes from a backend and keeps count of the live ones
pub struct Provisioner {
    backend: Arc<dyn SandboxBackend>,
    live: Arc<AtomicUsize>,
    next_serial: AtomicU64,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            live: Arc::new(AtomicUsize::new(0)),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Sandboxes created and not yet fully torn down
    pub fn live_sandboxes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Creates a fresh sandbox with `code_dir` mounted read-only
    pub async fn acquire(
        &self,
        language: &LanguageConfig,
        code_dir: &Path,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, ProvisioningError> {
        let spec = SandboxSpec::new(language, code_dir, limits);
        let instance = self.backend.create(&spec).await?;

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!(
            "Sandbox #{serial} ({} {}) acquired, {live} live",
            self.backend.kind(),
            instance.native_id
        );

        Ok(SandboxHandle {
            serial,
            instance: Some(instance),
            backend: Arc::clone(&self.backend),
            live: Arc::clone(&self.live),
        })
    }

    /// Tears the sandbox down; never fails, teardown errors are only logged
    pub async fn release(&self, handle: SandboxHandle) {
        handle.release().await;
    }

    /// Scrubs a used sandbox for the next test case, destroying it if that fails
    pub async fn recycle(&self, handle: SandboxHandle) -> Result<SandboxHandle, ProvisioningError> {
        let scrubbed = match handle.instance() {
            Ok(instance) => self.backend.scrub(instance).await,
            Err(e) => Err(e),
        };

        match scrubbed {
            Ok(()) => Ok(handle),
            Err(e) => {
                log::warn!("Failed to scrub sandbox #{}: {e}", handle.serial);
                handle.release().await;
                Err(e)
            }
        }
    }
}

/// Exclusive ownership of one live sandbox
///
/// Releasing consumes the handle. A handle dropped without release is torn
/// down in the background on the current tokio runtime.
pub struct SandboxHandle {
    serial: u64,
    instance: Option<SandboxInstance>,
    backend: Arc<dyn SandboxBackend>,
    live: Arc<AtomicUsize>,
}

impl SandboxHandle {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn instance(&self) -> Result<&SandboxInstance, ProvisioningError> {
        self.instance
            .as_ref()
            .ok_or_else(|| ProvisioningError::Failed(format!("sandbox #{} released", self.serial)))
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        self.backend.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(instance) = self.instance.take() {
            teardown(
                Arc::clone(&self.backend),
                instance,
                Arc::clone(&self.live),
                self.serial,
            )
            .await;
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };

        let backend = Arc::clone(&self.backend);
        let live = Arc::clone(&self.live);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                log::debug!("Sandbox #{} dropped without release", self.serial);
                runtime.spawn(teardown(backend, instance, live, self.serial));
            }
            Err(_) => {
                log::error!(
                    "Sandbox #{} ({}) dropped outside a runtime and leaked",
                    self.serial,
                    instance.native_id
                );
                live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

async fn teardown(
    backend: Arc<dyn SandboxBackend>,
    instance: SandboxInstance,
    live: Arc<AtomicUsize>,
    serial: u64,
) {
    backend.interrupt(&instance).await;

    for attempt in 1..=TEARDOWN_ATTEMPTS {
        match backend.destroy(&instance).await {
            Ok(()) => break,
            Err(e) if attempt == TEARDOWN_ATTEMPTS => {
                log::error!(
                    "Giving up on tearing down sandbox #{serial} ({}): {e:#}",
                    instance.native_id
                );
            }
            Err(e) => {
                log::warn!("Teardown of sandbox #{serial} failed (attempt {attempt}): {e:#}");
                tokio::time::sleep(TEARDOWN_BACKOFF * attempt).await;
            }
        }
    }

    let live = live.fetch_sub(1, Ordering::SeqCst) - 1;
    log::debug!("Sandbox #{serial} released, {live} live");
}
