use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::compiler::{CompileError, ENTRY_FUNCTION};
use crate::sandbox::ExecutionRequest;
use crate::scheduler::Scheduler;
use crate::session::{Session, SessionState};
use crate::verdict::Outcome;

/// One slot: takes sessions off the queue and runs them to a verdict
pub async fn worker(
    id: usize,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            session = scheduler.queue().pop() => {
                let session_id = session.id();
                log::info!("Worker {id} got session {session_id} from queue");

                let outcome = process(&scheduler, &session).await;
                scheduler.queue().release();
                log::debug!("Worker {id} released its slot after session {session_id}");
                scheduler.finish(&session, outcome);
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Compiles and runs one session inside its deadline
async fn process(scheduler: &Scheduler, session: &Session) -> Outcome {
    let session_id = session.id();
    let cancel = session.cancel_token();
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    // 1. Compile on the blocking pool; the deadline starts here
    session.advance(SessionState::Compiling);
    let deadline = Instant::now() + session.deadline();
    scheduler.queue().record_compilation();

    let compiler = scheduler.compiler.clone();
    let units = session.units().to_vec();
    let compile_handle =
        tokio::task::spawn_blocking(move || compiler.compile(session_id, &units));

    let compiled = tokio::select! {
        biased;

        result = compile_handle => match result {
            Ok(Ok(unit)) => unit,
            Ok(Err(e)) => return Outcome::Compiled(e),
            Err(e) => {
                log::error!("Compilation of session {session_id} failed to complete: {e}");
                return Outcome::Compiled(CompileError::Unavailable(format!(
                    "compilation aborted: {e}"
                )));
            }
        },
        _ = tokio::time::sleep_until(deadline) => {
            log::info!("Session {session_id} hit its deadline while compiling");
            return Outcome::CompileTimedOut;
        }
        _ = cancel.cancelled() => return Outcome::Cancelled,
    };
    if Instant::now() >= deadline {
        log::info!("Session {session_id} compiled past its deadline");
        return Outcome::CompileTimedOut;
    }

    for warning in compiled.warnings() {
        log::debug!("Session {session_id}: {warning}");
    }

    // 2. Execute the entry point on its own thread
    session.advance(SessionState::Running);
    let request = ExecutionRequest {
        unit: Arc::new(compiled),
        entry_point: ENTRY_FUNCTION.to_string(),
        arguments: session.arguments().to_vec(),
        deadline,
        memory_ceiling: scheduler.config().memory_ceiling,
    };
    Outcome::Executed(scheduler.sandbox.run(request, cancel).await)
}
