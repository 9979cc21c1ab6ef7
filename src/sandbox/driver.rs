use std::convert::Infallible;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Comparison;
use crate::error::{ExecutionError, ProvisioningError};
use crate::submission::TestCase;

use super::{SandboxBackend, SandboxHandle, SandboxInstance};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
/// Time given to a killed program to be reaped
const KILL_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Memory,
    Processes,
    Output,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Processes => "process",
            Self::Output => "output",
        })
    }
}

/// Why a program that did not time out still failed to produce a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    ExitCode(i32),
    Signal(i32),
    LimitExceeded(LimitKind),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "killed by signal {signal}"),
            Self::LimitExceeded(kind) => write!(f, "{kind} limit exceeded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Matched,
    Mismatched,
    Faulted(Fault),
    TimedOut,
}

impl Verdict {
    /// Short machine-readable name used in per-case reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Matched => "accepted",
            Self::Mismatched => "wrong_answer",
            Self::Faulted(Fault::LimitExceeded(LimitKind::Memory)) => "memory_limit_exceeded",
            Self::Faulted(Fault::LimitExceeded(LimitKind::Processes)) => "process_limit_exceeded",
            Self::Faulted(Fault::LimitExceeded(LimitKind::Output)) => "output_limit_exceeded",
            Self::Faulted(_) => "runtime_error",
            Self::TimedOut => "time_limit_exceeded",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => f.write_str("matched"),
            Self::Mismatched => f.write_str("mismatched"),
            Self::Faulted(fault) => write!(f, "faulted ({fault})"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Result of running a program against one test case
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub verdict: Verdict,
    pub elapsed_ms: f64,
    pub peak_memory_mb: f64,
    /// Leading bytes of stderr, bounded by `stderr_excerpt_bytes`
    pub stderr_excerpt: String,
}

/// Compares captured stdout with the expected output
///
/// `Exact` ignores trailing whitespace and newlines of both sides and nothing
/// else. `Lenient` additionally ignores trailing whitespace on every line.
pub fn compare_output(actual: &[u8], expected: &str, comparison: Comparison) -> bool {
    match comparison {
        Comparison::Exact => actual.trim_ascii_end() == expected.as_bytes().trim_ascii_end(),
        Comparison::Lenient => {
            let normalize = |s: &str| -> String {
                s.lines()
                    .map(|line| line.trim_end())
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim_end()
                    .to_string()
            };
            normalize(&String::from_utf8_lossy(actual)) == normalize(expected)
        }
    }
}

/// Runs one program against one test case inside a provisioned sandbox
#[derive(Debug, Clone)]
pub struct ExecutionDriver {
    comparison: Comparison,
}

/// Stdout read up to the output cap
struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

impl ExecutionDriver {
    pub fn new(comparison: Comparison) -> Self {
        Self { comparison }
    }

    /// Feeds the test input, waits for the program under the wall-clock
    /// timeout and classifies the result
    ///
    /// Only infrastructure problems and cancellation are errors; everything
    /// the program does, including crashing or hanging, is an outcome.
    pub async fn run(
        &self,
        handle: &SandboxHandle,
        case: &TestCase,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let instance = handle.instance()?;
        let backend = handle.backend();

        let mut cmd = backend.command(instance)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ProvisioningError::Failed(format!("failed to start program: {e}")))?;
        instance.set_active_pid(child.id());

        let result = self
            .supervise(backend, instance, &mut child, case, cancel, start)
            .await;
        instance.set_active_pid(None);
        result
    }

    async fn supervise(
        &self,
        backend: &dyn SandboxBackend,
        instance: &SandboxInstance,
        child: &mut Child,
        case: &TestCase,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let limits = &instance.spec.limits;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let peak_kb = AtomicU64::new(0);
        let memory_exceeded = AtomicBool::new(false);
        let processes_exceeded = AtomicBool::new(false);

        let io_and_exit = async {
            tokio::join!(
                feed_stdin(stdin, case.input.as_bytes()),
                async {
                    let captured = read_capped(stdout, limits.output_cap_bytes()).await;
                    if captured.overflowed {
                        backend.interrupt(instance).await;
                    }
                    captured
                },
                read_excerpt(stderr, limits.stderr_excerpt_bytes),
                child.wait(),
            )
        };
        let watch = watch_limits(
            backend,
            instance,
            limits.memory_cap_kb(),
            &peak_kb,
            &memory_exceeded,
            &processes_exceeded,
        );
        let exec = async {
            tokio::select! {
                (_, stdout, stderr, status) = io_and_exit => (stdout, stderr, status),
                never = watch => match never {},
            }
        };

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = timeout(limits.wall_clock_timeout(), exec) => Some(result),
        };

        let (stdout, stderr, status) = match finished {
            None => {
                stop(backend, instance, child).await;
                return Err(ExecutionError::Cancelled);
            }
            Some(Err(_elapsed)) => {
                let elapsed_ms = elapsed_ms(start);
                stop(backend, instance, child).await;
                return Ok(ExecutionOutcome {
                    verdict: Verdict::TimedOut,
                    elapsed_ms,
                    peak_memory_mb: kb_to_mb(peak_kb.load(Ordering::Relaxed)),
                    stderr_excerpt: String::new(),
                });
            }
            Some(Ok(finished)) => finished,
        };
        let elapsed_ms = elapsed_ms(start);
        let status = status.map_err(ProvisioningError::from)?;

        let usage = backend.usage(instance, &status).await;
        let peak = peak_kb
            .load(Ordering::Relaxed)
            .max(usage.peak_memory_kb.unwrap_or(0));
        let over_memory =
            memory_exceeded.load(Ordering::Relaxed) || peak > limits.memory_cap_kb();
        let over_processes =
            processes_exceeded.load(Ordering::Relaxed) || backend.process_limit_hit(instance);

        let verdict = if usage.timed_out {
            Verdict::TimedOut
        } else if over_memory || usage.limit == Some(LimitKind::Memory) {
            Verdict::Faulted(Fault::LimitExceeded(LimitKind::Memory))
        } else if over_processes || usage.limit == Some(LimitKind::Processes) {
            Verdict::Faulted(Fault::LimitExceeded(LimitKind::Processes))
        } else if stdout.overflowed || usage.limit == Some(LimitKind::Output) {
            Verdict::Faulted(Fault::LimitExceeded(LimitKind::Output))
        } else if !status.success() {
            Verdict::Faulted(exit_fault(&status))
        } else if compare_output(&stdout.bytes, &case.expected_output, self.comparison) {
            Verdict::Matched
        } else {
            Verdict::Mismatched
        };

        Ok(ExecutionOutcome {
            verdict,
            elapsed_ms,
            peak_memory_mb: kb_to_mb(peak),
            stderr_excerpt: stderr,
        })
    }
}

fn exit_fault(status: &ExitStatus) -> Fault {
    match (status.code(), status.signal()) {
        (Some(code), _) => Fault::ExitCode(code),
        (None, Some(signal)) => Fault::Signal(signal),
        (None, None) => Fault::ExitCode(-1),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

/// Kills everything in the sandbox and reaps the program
async fn stop(backend: &dyn SandboxBackend, instance: &SandboxInstance, child: &mut Child) {
    backend.interrupt(instance).await;
    let _ = child.start_kill();
    if timeout(KILL_GRACE, child.wait()).await.is_err() {
        log::warn!("Program in sandbox {} did not exit after kill", instance.native_id);
    }
}

async fn feed_stdin(stdin: Option<ChildStdin>, input: &[u8]) {
    let Some(mut stdin) = stdin else {
        return;
    };
    // The program may exit without reading its input
    if let Err(e) = stdin.write_all(input).await {
        log::debug!("Stopped writing stdin: {e}");
        return;
    }
    let _ = stdin.shutdown().await;
}

async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, cap: usize) -> Captured {
    let mut captured = Captured {
        bytes: Vec::new(),
        overflowed: false,
    };
    let Some(mut pipe) = pipe else {
        return captured;
    };

    let mut buf = [0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if captured.bytes.len() + n > cap {
                    captured.overflowed = true;
                    break;
                }
                captured.bytes.extend_from_slice(&buf[..n]);
            }
            Err(e) => {
                log::debug!("Stopped reading stdout: {e}");
                break;
            }
        }
    }
    captured
}

/// Keeps the first `keep` bytes and drains the rest so the program never blocks on stderr
async fn read_excerpt<R: AsyncRead + Unpin>(pipe: Option<R>, keep: usize) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };

    let mut kept = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    while let Ok(n) = pipe.read(&mut buf).await {
        if n == 0 {
            break;
        }
        let room = keep.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Samples memory and processes until dropped, interrupting the program once it goes over a cap
async fn watch_limits(
    backend: &dyn SandboxBackend,
    instance: &SandboxInstance,
    cap_kb: u64,
    peak_kb: &AtomicU64,
    memory_exceeded: &AtomicBool,
    processes_exceeded: &AtomicBool,
) -> Infallible {
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        interval.tick().await;
        if let Some(sample) = backend.sample_memory_kb(instance) {
            peak_kb.fetch_max(sample, Ordering::Relaxed);
            if sample > cap_kb && !memory_exceeded.swap(true, Ordering::Relaxed) {
                log::debug!(
                    "Sandbox {} went over its memory cap ({sample} KiB > {cap_kb} KiB)",
                    instance.native_id
                );
                backend.interrupt(instance).await;
            }
        }
        if !processes_exceeded.load(Ordering::Relaxed) && backend.process_limit_hit(instance) {
            processes_exceeded.store(true, Ordering::Relaxed);
            log::debug!("Sandbox {} went over its process cap", instance.native_id);
            backend.interrupt(instance).await;
        }
    }
}
