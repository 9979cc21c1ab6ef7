#![allow(dead_code)]

use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use gradebox::config::Config;
use gradebox::database::{SqliteStore, SubmissionStore, init_db};
use gradebox::engine::Engine;
use gradebox::error::ProvisioningError;
use gradebox::sandbox::{
    BackendKind, ProcessBackend, SandboxBackend, SandboxInstance, SandboxSpec, Usage,
};
use gradebox::submission::{Submission, TestCase};

/// Process backend that can refuse to create sandboxes and records how many were alive at once
pub struct InstrumentedBackend {
    inner: ProcessBackend,
    failures_left: AtomicU32,
    live: AtomicUsize,
    max_live: AtomicUsize,
    created: AtomicUsize,
}

impl InstrumentedBackend {
    pub fn new(work_root: &Path, failures: u32) -> Self {
        Self {
            inner: ProcessBackend::new(work_root.to_path_buf(), false).unwrap(),
            failures_left: AtomicU32::new(failures),
            live: AtomicUsize::new(0),
            max_live: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn failures_left(&self) -> u32 {
        self.failures_left.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxBackend for InstrumentedBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxInstance, ProvisioningError> {
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ProvisioningError::Unavailable(
                "sandbox runtime unreachable".to_string(),
            ));
        }

        let instance = self.inner.create(spec).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(instance)
    }

    fn command(&self, sandbox: &SandboxInstance) -> Result<Command, ProvisioningError> {
        self.inner.command(sandbox)
    }

    fn sample_memory_kb(&self, sandbox: &SandboxInstance) -> Option<u64> {
        self.inner.sample_memory_kb(sandbox)
    }

    fn process_limit_hit(&self, sandbox: &SandboxInstance) -> bool {
        self.inner.process_limit_hit(sandbox)
    }

    async fn interrupt(&self, sandbox: &SandboxInstance) {
        self.inner.interrupt(sandbox).await
    }

    async fn usage(&self, sandbox: &SandboxInstance, status: &ExitStatus) -> Usage {
        self.inner.usage(sandbox, status).await
    }

    async fn scrub(&self, sandbox: &SandboxInstance) -> Result<(), ProvisioningError> {
        self.inner.scrub(sandbox).await
    }

    async fn destroy(&self, sandbox: &SandboxInstance) -> anyhow::Result<()> {
        self.inner.destroy(sandbox).await?;
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine over a temporary database and the instrumented backend; removed on drop
pub struct TestEngine {
    pub dir: tempfile::TempDir,
    pub engine: Engine,
    pub store: SqliteStore,
    pub backend: Arc<InstrumentedBackend>,
}

impl TestEngine {
    pub async fn submission(&self, language: &str, source: &str) -> Submission {
        let id = self
            .store
            .insert_submission(0, 1, language, source)
            .await
            .unwrap();
        self.store.fetch_submission(id).await.unwrap()
    }
}

pub fn config(extra: serde_json::Value) -> Config {
    let mut value = serde_json::json!({
        "engine": { "max_concurrency": 4, "queue_depth": 8 },
        "retry": { "max_retries": 3, "initial_backoff_ms": 5, "max_backoff_ms": 20 },
        "limits": { "wall_clock_timeout_ms": 2000 },
        "backend": { "type": "process", "unshare_network": false },
        "languages": [
            { "name": "sh", "file_name": "main.sh", "command": ["/bin/sh", "%SOURCE%"] }
        ]
    });
    merge(&mut value, extra);
    serde_json::from_value(value).unwrap()
}

fn merge(base: &mut serde_json::Value, extra: serde_json::Value) {
    match (base, extra) {
        (serde_json::Value::Object(base), serde_json::Value::Object(extra)) => {
            for (key, value) in extra {
                merge(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, extra) => *base = extra,
    }
}

pub async fn start_engine(config: &Config, failures: u32) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(init_db(dir.path().join("db.sqlite3")).await.unwrap());
    let backend = Arc::new(InstrumentedBackend::new(&dir.path().join("sandboxes"), failures));
    let engine = Engine::start(
        config,
        backend.clone(),
        Arc::new(store.clone()),
        dir.path().join("workspaces"),
    )
    .unwrap();

    TestEngine {
        dir,
        engine,
        store,
        backend,
    }
}

pub fn case(id: i64, input: &str, expected: &str) -> TestCase {
    TestCase {
        id,
        problem_id: 1,
        input: input.to_string(),
        expected_output: expected.to_string(),
        is_hidden: false,
    }
}

pub fn hidden_case(id: i64, input: &str, expected: &str) -> TestCase {
    TestCase {
        is_hidden: true,
        ..case(id, input, expected)
    }
}

pub const ADDER: &str = "read a b\necho $((a + b))\n";
