mod capture;
mod vm;

pub use capture::{Capture, Captured};
pub use vm::{Fault, FaultKind};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::compiled::CompiledUnit;
use crate::config::{ByteSize, EngineConfig};
use crate::value::Value;
use vm::{Vm, VmLimits};

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_output_bytes: usize,
    pub max_call_depth: usize,
}

impl From<&EngineConfig> for SandboxLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_output_bytes: config.max_output_bytes.as_usize(),
            max_call_depth: config.max_call_depth,
        }
    }
}

/// One invocation of an entry point
#[derive(Debug)]
pub struct ExecutionRequest {
    pub unit: Arc<CompiledUnit>,
    pub entry_point: String,
    pub arguments: Vec<Value>,
    pub deadline: Instant,
    pub memory_ceiling: Option<ByteSize>,
}

#[derive(Debug)]
pub enum SandboxOutcome {
    Success {
        value: Value,
        stdout: Captured,
        stderr: Captured,
        elapsed: Duration,
    },
    Fault {
        fault: Fault,
        stdout: Captured,
        stderr: Captured,
        elapsed: Duration,
    },
    /// The deadline passed first; output is what was captured until then
    Timeout { stdout: Captured, stderr: Captured },
    /// Cancelled from outside
    Interrupted { stdout: Captured, stderr: Captured },
}

/// Runs compiled entry points on dedicated threads under a wall-clock deadline
///
/// Each run gets a fresh thread named `sandbox-<session>` and its own output
/// buffers. When the deadline or the cancellation token fires first, the
/// interrupt flag is raised and the thread is detached; its state is never
/// looked at again.
#[derive(Debug)]
pub struct Sandbox {
    limits: SandboxLimits,
    launched: AtomicU64,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            launched: AtomicU64::new(0),
        }
    }

    /// Execution threads spawned so far
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::Relaxed)
    }

    pub async fn run(&self, request: ExecutionRequest, cancel: &CancellationToken) -> SandboxOutcome {
        let ExecutionRequest {
            unit,
            entry_point,
            arguments,
            deadline,
            memory_ceiling,
        } = request;
        let session = unit.session();
        let stdout = Capture::new(self.limits.max_output_bytes);
        let stderr = Capture::new(self.limits.max_output_bytes);

        let Some(entry) = unit.entry_point(&entry_point, arguments.len()) else {
            let fault = Fault::new(
                FaultKind::NoSuchFunction,
                format!(
                    "entry unit '{}' has no function '{entry_point}' taking {} argument(s)",
                    unit.entry_unit(),
                    arguments.len()
                ),
            );
            return SandboxOutcome::Fault {
                fault,
                stdout: stdout.take(),
                stderr: stderr.take(),
                elapsed: Duration::ZERO,
            };
        };

        if Instant::now() >= deadline {
            return SandboxOutcome::Timeout {
                stdout: stdout.take(),
                stderr: stderr.take(),
            };
        }

        let limits = VmLimits {
            max_call_depth: self.limits.max_call_depth,
            memory_ceiling: memory_ceiling.map(|ceiling| ceiling.0),
        };
        let interrupt = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();

        let spawned = std::thread::Builder::new()
            .name(format!("sandbox-{session}"))
            .spawn({
                let (stdout, stderr, interrupt) = (stdout.clone(), stderr.clone(), interrupt.clone());
                move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        Vm::new(&unit, &stdout, &stderr, &interrupt, limits).invoke(entry, &arguments)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(Fault::new(
                            FaultKind::InternalError,
                            format!("execution panicked: {}", panic_message(&*payload)),
                        ))
                    });
                    if tx.send(result).is_err() {
                        log::debug!("Execution of session {session} finished after it was abandoned");
                    }
                }
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn execution thread for session {session}: {e}");
            return SandboxOutcome::Fault {
                fault: Fault::new(FaultKind::InternalError, format!("cannot spawn execution thread: {e}")),
                stdout: stdout.take(),
                stderr: stderr.take(),
                elapsed: Duration::ZERO,
            };
        }
        self.launched.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            biased;

            result = rx => {
                let elapsed = started.elapsed();
                let (stdout, stderr) = (stdout.take(), stderr.take());
                match result {
                    Ok(Ok(value)) => SandboxOutcome::Success { value, stdout, stderr, elapsed },
                    Ok(Err(fault)) => SandboxOutcome::Fault { fault, stdout, stderr, elapsed },
                    Err(_) => SandboxOutcome::Fault {
                        fault: Fault::new(FaultKind::InternalError, "execution thread vanished without a result"),
                        stdout,
                        stderr,
                        elapsed,
                    },
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                interrupt.store(true, Ordering::Release);
                log::info!("Session {session} hit its deadline, execution thread detached");
                SandboxOutcome::Timeout { stdout: stdout.take(), stderr: stderr.take() }
            }
            _ = cancel.cancelled() => {
                interrupt.store(true, Ordering::Release);
                log::info!("Session {session} cancelled while running, execution thread detached");
                SandboxOutcome::Interrupted { stdout: stdout.take(), stderr: stderr.take() }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::session::SessionId;
    use crate::source::SourceUnit;

    fn request(text: &str, deadline: Duration) -> ExecutionRequest {
        let unit = Compiler::default()
            .compile(SessionId(3), &[SourceUnit::entry("Main", text)])
            .unwrap();
        ExecutionRequest {
            unit: Arc::new(unit),
            entry_point: "main".to_string(),
            arguments: Vec::new(),
            deadline: Instant::now() + deadline,
            memory_ceiling: None,
        }
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxLimits {
            max_output_bytes: 1024,
            max_call_depth: 64,
        })
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let req = request(r#"fn main() { println("hi"); eprint("warn"); return 42; }"#, Duration::from_secs(5));
        let outcome = sandbox().run(req, &CancellationToken::new()).await;
        let SandboxOutcome::Success { value, stdout, stderr, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(value, Value::Int(42));
        assert_eq!(stdout.text, "hi\n");
        assert_eq!(stderr.text, "warn");
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let req = request(r#"fn main() { print("x"); while true { } }"#, Duration::from_millis(50));
        let started = Instant::now();
        let outcome = sandbox().run(req, &CancellationToken::new()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        let SandboxOutcome::Timeout { stdout, .. } = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(stdout.text, "x");
    }

    #[tokio::test]
    async fn test_timed_out_thread_winds_down() {
        // a single str() call that would otherwise render for a very long time
        let req = request(
            "fn main() { let a = [1]; for i in 0..40 { a = [a, a]; } return str(a); }",
            Duration::from_millis(100),
        );
        let unit = req.unit.clone();
        let sandbox = sandbox();
        let outcome = sandbox.run(req, &CancellationToken::new()).await;
        assert!(matches!(outcome, SandboxOutcome::Timeout { .. }));
        assert_eq!(sandbox.launched(), 1);

        // the detached thread drops its handle on the unit once it unwinds
        let released = Instant::now() + Duration::from_secs(1);
        while Arc::strong_count(&unit) > 1 {
            assert!(Instant::now() < released, "execution thread kept running after its deadline");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts() {
        let req = request("fn main() { while true { } }", Duration::from_secs(30));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let outcome = sandbox().run(req, &token).await;
        assert!(matches!(outcome, SandboxOutcome::Interrupted { .. }));
    }

    #[tokio::test]
    async fn test_fault_and_missing_entry() {
        let req = request("fn main() { return [1][5]; }", Duration::from_secs(5));
        let outcome = sandbox().run(req, &CancellationToken::new()).await;
        let SandboxOutcome::Fault { fault, .. } = outcome else {
            panic!("expected fault, got {outcome:?}");
        };
        assert_eq!(fault.kind, FaultKind::IndexError);
        assert!(fault.to_string().contains("at main (Main:1)"));

        let mut req = request("fn main() { }", Duration::from_secs(5));
        req.arguments = vec![Value::Int(1)];
        let sandbox = sandbox();
        let outcome = sandbox.run(req, &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            SandboxOutcome::Fault { fault: Fault { kind: FaultKind::NoSuchFunction, .. }, .. }
        ));
        assert_eq!(sandbox.launched(), 0);
    }

    #[tokio::test]
    async fn test_output_beyond_limit_is_counted() {
        let req = request(
            r#"fn main() { for i in 0..100 { print("0123456789abcdef"); } }"#,
            Duration::from_secs(5),
        );
        let outcome = sandbox().run(req, &CancellationToken::new()).await;
        let SandboxOutcome::Success { stdout, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(stdout.text.len(), 1024);
        assert_eq!(stdout.dropped, 1600 - 1024);
    }
}
