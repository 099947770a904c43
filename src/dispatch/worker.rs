//! Per-supervisor worker loop.
//!
//! Each worker owns one pool slot, pulls items off the shared queue, runs
//! them with the per-test timeout, classifies the outcome, and either
//! finalizes a result or re-enqueues the item. Worker-local errors never
//! escape: they are reduced to a result or a requeue.

use std::path::Path;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{PoolSlot, Shared};
use crate::events::Event;
use crate::supervisor::{Liveness, Supervisor, SupervisorError, SupervisorState, Verdict};
use crate::test::{Test, TestResult, TestStatus, WorkItem};

/// What a finished attempt means for the worker itself.
enum SlotAfterAttempt {
    /// The supervisor survived; keep pulling work.
    Keep,
    /// The supervisor is gone and will not be restarted; retire.
    Retire,
}

/// Outcome of the timed `run_test` call, before classification.
enum AttemptOutcome {
    Completed(Verdict),
    Crashed(SupervisorError),
    BackendFailed(SupervisorError),
    TimedOut,
    Cancelled,
}

pub(super) async fn run_worker<S: Supervisor>(shared: &Shared<'_, S>, slot: &PoolSlot<S>) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            item = shared.queue.pop() => match item {
                Some(item) => item,
                None => break,
            },
        };

        if !claim_slot(slot).await {
            // Supervisor is gone; hand the item back uncharged.
            shared.queue.push_back(item);
            break;
        }

        match process_item(shared, slot, item).await {
            SlotAfterAttempt::Keep => {}
            SlotAfterAttempt::Retire => break,
        }

        if shared.fatal() {
            break;
        }
    }

    shared.worker_retired();
}

/// Waits for this worker's supervisor to be `Ready` and claims it `Busy`.
/// Returns `false` if the supervisor crashed for good.
async fn claim_slot<S: Supervisor>(slot: &PoolSlot<S>) -> bool {
    loop {
        let notified = slot.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let mut state = slot.state.lock().unwrap();
            match *state {
                SupervisorState::Ready => {
                    *state = SupervisorState::Busy;
                    return true;
                }
                // The prober is restarting it; wait for the outcome.
                SupervisorState::Starting => {}
                _ => return false,
            }
        }
        notified.await;
    }
}

async fn process_item<S: Supervisor>(
    shared: &Shared<'_, S>,
    slot: &PoolSlot<S>,
    mut item: WorkItem<S::Test>,
) -> SlotAfterAttempt {
    let test = item.test.clone();
    let test_id = test.id().clone();
    let iteration = test.iteration();
    let attempt = item.next_attempt_index();
    let supervisor_id = slot.supervisor.id().to_string();

    shared
        .events
        .emit(Event::TestStarted {
            test_id: test_id.clone(),
            iteration,
            attempt,
            supervisor_id: supervisor_id.clone(),
        })
        .await;

    let (mut stdout, mut stderr) = match shared.writer.open_sinks(&test_id) {
        Ok(sinks) => sinks,
        Err(e) => {
            shared.set_fatal(e);
            slot.set_state(SupervisorState::Ready);
            return SlotAfterAttempt::Keep;
        }
    };

    let started_at = Utc::now();
    let clock = std::time::Instant::now();

    let outcome = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => AttemptOutcome::Cancelled,
        timed = timeout(
            shared.policy.test_timeout,
            slot.supervisor.run_test(&test, &mut stdout, &mut stderr, shared.policy.test_timeout),
        ) => match timed {
            Ok(Ok(verdict)) => AttemptOutcome::Completed(verdict),
            Ok(Err(e)) if e.is_crash() => AttemptOutcome::Crashed(e),
            Ok(Err(e)) => AttemptOutcome::BackendFailed(e),
            // Dropping the run future aborts the in-flight test.
            Err(_) => AttemptOutcome::TimedOut,
        },
    };

    let finished_at = Utc::now();
    let duration = clock.elapsed();

    if let Err(e) = stdout.finish().and_then(|_| stderr.finish()) {
        warn!(%test_id, "failed to flush output capture: {e}");
    }

    if matches!(outcome, AttemptOutcome::Cancelled) {
        shared
            .events
            .emit(Event::Cancelled {
                test_id: test_id.clone(),
                iteration,
            })
            .await;
        shared.consume_item(not_run(&item, &supervisor_id, attempt));
        slot.set_state(SupervisorState::Ready);
        return SlotAfterAttempt::Keep;
    }

    let mut crashed = false;
    let mut diagnostics = std::collections::BTreeMap::new();
    let status = match outcome {
        AttemptOutcome::Completed(verdict) => {
            diagnostics.extend(verdict.diagnostics);
            verdict.status
        }
        AttemptOutcome::TimedOut => {
            // The abort already happened when the run future was dropped;
            // a dead probe here means the abort did not stick.
            crashed = slot.supervisor.probe().await == Liveness::Dead;
            diagnostics.insert(
                "timeout_seconds".to_string(),
                shared.policy.test_timeout.as_secs().to_string(),
            );
            TestStatus::TimedOut
        }
        AttemptOutcome::Crashed(e) => {
            crashed = true;
            diagnostics.insert("error".to_string(), e.to_string());
            TestStatus::Errored
        }
        AttemptOutcome::BackendFailed(e) => {
            diagnostics.insert("error".to_string(), e.to_string());
            TestStatus::Errored
        }
        AttemptOutcome::Cancelled => unreachable!("handled above"),
    };

    let (status, artifacts) =
        collect_artifacts(shared, slot, &test, status, &mut diagnostics).await;

    let result = TestResult {
        test_id: test_id.clone(),
        iteration_index: iteration,
        status,
        started_at,
        finished_at,
        duration_seconds: duration.as_secs_f64(),
        supervisor_id: supervisor_id.clone(),
        attempt_index: attempt,
        stdout_excerpt: stdout.excerpt(),
        stderr_excerpt: stderr.excerpt(),
        artifacts,
        diagnostics,
    };

    item.attempts_so_far += 1;

    if crashed {
        return handle_crash(shared, slot, item, result).await;
    }

    // Every attempt goes into the journal, retried or not.
    if let Err(e) = shared.writer.persist_attempt(&result) {
        shared.set_fatal(e);
        slot.set_state(SupervisorState::Ready);
        return SlotAfterAttempt::Keep;
    }

    if result.status.is_retryable_failure() && item.failure_retries < shared.policy.retry_failures {
        item.failure_retries += 1;
        debug!(%test_id, attempt, "retrying failed test");
        shared
            .events
            .emit(Event::TestRetried {
                test_id,
                iteration,
                next_attempt: item.next_attempt_index(),
            })
            .await;
        shared.queue.requeue(item);
        slot.set_state(SupervisorState::Ready);
        return SlotAfterAttempt::Keep;
    }

    shared.finalize_item(result).await;
    slot.set_state(SupervisorState::Ready);
    SlotAfterAttempt::Keep
}

/// Crash accounting: charge the item, then either poison-pill it or restart
/// the supervisor and let another worker try the item first.
async fn handle_crash<S: Supervisor>(
    shared: &Shared<'_, S>,
    slot: &PoolSlot<S>,
    mut item: WorkItem<S::Test>,
    mut result: TestResult,
) -> SlotAfterAttempt {
    let supervisor_id = slot.supervisor.id().to_string();
    slot.set_state(SupervisorState::Crashed);
    shared
        .events
        .emit(Event::SupervisorDown {
            supervisor_id: supervisor_id.clone(),
        })
        .await;

    item.supervisor_kills_caused += 1;

    if item.supervisor_kills_caused > shared.policy.max_supervisor_restarts {
        // Poison pill: finalize as errored and stop restarting supervisors
        // on this item's behalf. This worker's supervisor stays down.
        warn!(
            test_id = %result.test_id,
            kills = item.supervisor_kills_caused,
            "restart cap exceeded, isolating poison-pill test"
        );
        result.status = TestStatus::Errored;
        result.diagnostics.insert(
            "poison_pill".to_string(),
            format!("crashed {} supervisors", item.supervisor_kills_caused),
        );
        if let Err(e) = shared.writer.persist_attempt(&result) {
            shared.set_fatal(e);
            return SlotAfterAttempt::Retire;
        }
        shared.finalize_item(result).await;
        return SlotAfterAttempt::Retire;
    }

    if let Err(e) = shared.writer.persist_attempt(&result) {
        shared.set_fatal(e);
        return SlotAfterAttempt::Retire;
    }

    // Back of the queue: give another supervisor the first shot at it.
    shared
        .events
        .emit(Event::TestRetried {
            test_id: result.test_id.clone(),
            iteration: result.iteration_index,
            next_attempt: item.next_attempt_index(),
        })
        .await;
    shared.queue.push_back(item);

    slot.set_state(SupervisorState::Starting);
    let restarted = tokio::select! {
        _ = shared.cancel.cancelled() => Err(SupervisorError::Startup("cancelled".to_string())),
        outcome = timeout(shared.policy.startup_timeout, slot.supervisor.restart()) => match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SupervisorError::Startup("restart timed out".to_string())),
        },
    };

    match restarted {
        Ok(()) => {
            slot.set_state(SupervisorState::Ready);
            shared
                .events
                .emit(Event::SupervisorRestarted { supervisor_id })
                .await;
            SlotAfterAttempt::Keep
        }
        Err(e) => {
            warn!(%supervisor_id, "restart failed: {e}");
            slot.set_state(SupervisorState::Crashed);
            SlotAfterAttempt::Retire
        }
    }
}

async fn collect_artifacts<S: Supervisor>(
    shared: &Shared<'_, S>,
    slot: &PoolSlot<S>,
    test: &S::Test,
    status: TestStatus,
    diagnostics: &mut std::collections::BTreeMap<String, String>,
) -> (TestStatus, Vec<std::path::PathBuf>) {
    let dest = match shared.writer.artifacts_dir(test.id()) {
        Ok(dir) => dir,
        Err(e) => {
            shared.set_fatal(e);
            return (status, Vec::new());
        }
    };

    match slot.supervisor.collect_artifacts(test, &dest).await {
        Ok(paths) => {
            let relative = paths
                .iter()
                .map(|p| Path::new("artifacts").join(p))
                .collect();
            (status, relative)
        }
        Err(e) => {
            warn!(test_id = %test.id(), "artifact collection failed: {e}");
            diagnostics.insert("artifact_collection".to_string(), e.to_string());
            // Never hide a real failure: only a pass is downgraded.
            let status = if status == TestStatus::Passed {
                TestStatus::Errored
            } else {
                status
            };
            (status, Vec::new())
        }
    }
}

/// Result stub for an item abandoned on cancellation. Counted, not
/// journaled.
pub(super) fn not_run<T: Test>(
    item: &WorkItem<T>,
    supervisor_id: &str,
    attempt: u32,
) -> TestResult {
    let now = Utc::now();
    TestResult {
        test_id: item.test.id().clone(),
        iteration_index: item.test.iteration(),
        status: TestStatus::NotRun,
        started_at: now,
        finished_at: now,
        duration_seconds: 0.0,
        supervisor_id: supervisor_id.to_string(),
        attempt_index: attempt,
        stdout_excerpt: String::new(),
        stderr_excerpt: String::new(),
        artifacts: Vec::new(),
        diagnostics: Default::default(),
    }
}
