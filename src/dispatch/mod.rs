//! Work dispatch across the supervisor pool.
//!
//! The dispatcher drives N supervisors to drain a shared FIFO queue of
//! [`WorkItem`]s while enforcing the retry, restart, timeout, and liveness
//! policies.
//!
//! ```text
//!   WorkItems ──► WorkQueue ◄──┬── worker(S1) ──► RunWriter / EventSink
//!                              ├── worker(S2) ──►        │
//!                              └── worker(SN) ──►        ▼
//!        prober ── probe idle supervisors ──►       RunSummary
//! ```
//!
//! One worker task per live supervisor plus one liveness prober, all
//! spawned in a scope so they can borrow the shared run state. Worker-local
//! failures are reduced to results or requeues; only store failures and
//! total pool loss are fatal.

pub mod queue;
mod worker;

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{Event, EventSink};
use crate::store::{RunWriter, StoreError};
use crate::supervisor::{Liveness, Supervisor, SupervisorState};
use crate::test::{Test, TestResult, TestStatus, WorkItem};

pub use queue::WorkQueue;

/// Policy block consumed by the dispatcher. Mirrors the `[test_runner]`
/// configuration section.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Per-test budget; on exceed the attempt is recorded `TimedOut`.
    pub test_timeout: Duration,
    /// Budget around `start()` and `restart()`.
    pub startup_timeout: Duration,
    /// Liveness cadence for idle supervisors; zero disables the prober.
    pub probe_interval: Duration,
    /// Per-item poison-pill cap on supervisor crashes.
    pub max_supervisor_restarts: u32,
    /// Retry budget for `Failed`/`TimedOut` outcomes.
    pub retry_failures: u32,
    /// Leave supervisors running after drain, for manual debugging.
    pub keep_alive: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_secs(1800),
            startup_timeout: Duration::from_secs(600),
            probe_interval: Duration::ZERO,
            max_supervisor_restarts: 3,
            retry_failures: 0,
            keep_alive: false,
        }
    }
}

/// Errors that abort a run. Everything else is reduced to a test result.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no supervisors available: every startup failed")]
    NoSupervisorsAvailable,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Aggregated outcome of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Work items the run was asked to execute.
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub timed_out: usize,
    pub not_run: usize,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Whether the run was cut short by cancellation.
    pub cancelled: bool,
    /// Final result per work item, in completion order.
    pub results: Vec<TestResult>,
}

impl RunSummary {
    fn new(total: usize, results: Vec<TestResult>, duration: Duration, cancelled: bool) -> Self {
        let mut summary = Self {
            total,
            passed: 0,
            failed: 0,
            skipped: 0,
            errored: 0,
            timed_out: 0,
            not_run: 0,
            duration,
            cancelled,
            results: Vec::new(),
        };
        for result in &results {
            match result.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Errored => summary.errored += 1,
                TestStatus::TimedOut => summary.timed_out += 1,
                TestStatus::NotRun => summary.not_run += 1,
            }
        }
        summary.results = results;
        summary
    }

    /// `true` when every item passed or was deliberately skipped.
    pub fn success(&self) -> bool {
        self.failed + self.errored + self.timed_out + self.not_run == 0
    }

    /// Process exit code: infrastructure failures are distinguished from
    /// test failures, and cancellation from both.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if self.errored > 0 {
            2
        } else if self.failed + self.timed_out > 0 {
            1
        } else {
            0
        }
    }
}

/// One supervisor plus the dispatcher's view of its lifecycle state.
///
/// A supervisor in `Busy` owns exactly one test; `Ready` owns none. The
/// worker and the prober coordinate through the state mutex and notify.
pub(crate) struct PoolSlot<S: Supervisor> {
    pub(crate) supervisor: S,
    pub(crate) state: StdMutex<SupervisorState>,
    pub(crate) notify: Notify,
}

impl<S: Supervisor> PoolSlot<S> {
    fn new(supervisor: S) -> Self {
        Self {
            supervisor,
            state: StdMutex::new(SupervisorState::Ready),
            notify: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: SupervisorState) {
        *self.state.lock().unwrap() = state;
        self.notify.notify_waiters();
    }
}

/// State shared between the workers, the prober, and the run loop.
pub(crate) struct Shared<'a, S: Supervisor> {
    pub(crate) queue: WorkQueue<S::Test>,
    pub(crate) writer: &'a RunWriter,
    pub(crate) events: EventSink,
    pub(crate) policy: &'a DispatchPolicy,
    pub(crate) cancel: CancellationToken,
    /// Internal signal: every worker has retired; the prober can stop.
    done: CancellationToken,
    outstanding: AtomicUsize,
    live_workers: AtomicUsize,
    results: StdMutex<Vec<TestResult>>,
    fatal: StdMutex<Option<StoreError>>,
}

impl<'a, S: Supervisor> Shared<'a, S> {
    fn new(
        items: Vec<WorkItem<S::Test>>,
        writer: &'a RunWriter,
        events: EventSink,
        policy: &'a DispatchPolicy,
        cancel: CancellationToken,
        workers: usize,
    ) -> Self {
        let outstanding = items.len();
        Self {
            queue: WorkQueue::new(items),
            writer,
            events,
            policy,
            cancel,
            done: CancellationToken::new(),
            outstanding: AtomicUsize::new(outstanding),
            live_workers: AtomicUsize::new(workers),
            results: StdMutex::new(Vec::new()),
            fatal: StdMutex::new(None),
        }
    }

    /// Records the finalized result of a work item and emits the terminal
    /// event. The caller has already journaled the attempt.
    pub(crate) async fn finalize_item(&self, result: TestResult) {
        self.results.lock().unwrap().push(result.clone());
        self.events
            .emit(Event::TestFinished {
                result: Box::new(result),
            })
            .await;
        self.item_done();
    }

    /// Accounts for an item that will produce no journaled result
    /// (cancellation, pool loss).
    pub(crate) fn consume_item(&self, result: TestResult) {
        self.results.lock().unwrap().push(result);
        self.item_done();
    }

    fn item_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.queue.close();
        }
    }

    pub(crate) fn worker_retired(&self) {
        if self.live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last worker out: nothing can make progress anymore.
            self.queue.close();
            self.done.cancel();
        }
    }

    /// Store failures are fatal: record the first one and wind the run
    /// down.
    pub(crate) fn set_fatal(&self, error: StoreError) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            warn!("result store failure, aborting run: {error}");
            *fatal = Some(error);
        }
        drop(fatal);
        self.queue.close();
        self.done.cancel();
    }

    pub(crate) fn fatal(&self) -> bool {
        self.fatal.lock().unwrap().is_some()
    }

    fn take_fatal(&self) -> Option<StoreError> {
        self.fatal.lock().unwrap().take()
    }

    fn into_results(self) -> Vec<TestResult> {
        self.results.into_inner().unwrap()
    }
}

/// The dispatcher. Owns the policy and the sinks; borrows the run writer.
pub struct Dispatcher<'a> {
    policy: DispatchPolicy,
    writer: &'a RunWriter,
    events: EventSink,
}

impl<'a> Dispatcher<'a> {
    pub fn new(policy: DispatchPolicy, writer: &'a RunWriter, events: EventSink) -> Self {
        Self {
            policy,
            writer,
            events,
        }
    }

    /// Drains the queue across the pool.
    ///
    /// Supervisors are started concurrently; startup failures shrink the
    /// pool and only a fully failed pool aborts the run. Items are handed
    /// out in the caller's order. On cancellation the queue drains
    /// partially and unfinished items are reported `NotRun`.
    pub async fn run<S: Supervisor>(
        &self,
        supervisors: Vec<S>,
        items: Vec<WorkItem<S::Test>>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, DispatchError> {
        let clock = Instant::now();
        let total = items.len();

        let slots = self.start_pool(supervisors).await?;
        info!(pool = slots.len(), tests = total, "dispatching");

        let shared = Shared::<S>::new(
            items,
            self.writer,
            self.events.clone(),
            &self.policy,
            cancel.clone(),
            slots.len(),
        );
        if total == 0 {
            shared.queue.close();
        }

        tokio_scoped::scope(|scope| {
            for slot in &slots {
                let shared = &shared;
                scope.spawn(async move { worker::run_worker(shared, slot).await });
            }
            if !self.policy.probe_interval.is_zero() {
                let shared = &shared;
                let slots = &slots;
                scope.spawn(async move { probe_loop(shared, slots).await });
            }
        });

        if let Some(error) = shared.take_fatal() {
            self.stop_pool(&slots, true).await;
            return Err(error.into());
        }

        let cancelled = cancel.is_cancelled();
        self.settle_leftovers(&shared, cancelled).await?;
        self.stop_pool(&slots, false).await;
        self.events.emit(Event::RunComplete).await;

        Ok(RunSummary::new(
            total,
            shared.into_results(),
            clock.elapsed(),
            cancelled,
        ))
    }

    async fn start_pool<S: Supervisor>(
        &self,
        supervisors: Vec<S>,
    ) -> Result<Vec<PoolSlot<S>>, DispatchError> {
        let startup_timeout = self.policy.startup_timeout;
        let startups = supervisors.into_iter().map(|supervisor| async move {
            match timeout(startup_timeout, supervisor.start()).await {
                Ok(Ok(())) => Some(supervisor),
                Ok(Err(e)) => {
                    warn!(supervisor_id = supervisor.id(), "startup failed, dropping from pool: {e}");
                    None
                }
                Err(_) => {
                    warn!(supervisor_id = supervisor.id(), "startup timed out, dropping from pool");
                    None
                }
            }
        });

        let slots: Vec<PoolSlot<S>> = join_all(startups)
            .await
            .into_iter()
            .flatten()
            .map(PoolSlot::new)
            .collect();

        if slots.is_empty() {
            return Err(DispatchError::NoSupervisorsAvailable);
        }
        for slot in &slots {
            self.events
                .emit(Event::SupervisorUp {
                    supervisor_id: slot.supervisor.id().to_string(),
                })
                .await;
        }
        Ok(slots)
    }

    /// Accounts for items still queued after the workers retired: `NotRun`
    /// on cancellation, `Errored` when the pool died underneath them.
    async fn settle_leftovers<S: Supervisor>(
        &self,
        shared: &Shared<'_, S>,
        cancelled: bool,
    ) -> Result<(), DispatchError> {
        for item in shared.queue.drain_remaining() {
            if cancelled {
                self.events
                    .emit(Event::Cancelled {
                        test_id: item.test.id().clone(),
                        iteration: item.test.iteration(),
                    })
                    .await;
                shared.consume_item(worker::not_run(&item, "", item.next_attempt_index()));
            } else {
                let mut result = worker::not_run(&item, "", item.next_attempt_index());
                result.status = TestStatus::Errored;
                result
                    .diagnostics
                    .insert("error".to_string(), "no live supervisors remained".to_string());
                self.writer.persist_attempt(&result)?;
                shared.finalize_item(result).await;
            }
        }
        Ok(())
    }

    async fn stop_pool<S: Supervisor>(&self, slots: &[PoolSlot<S>], force: bool) {
        if self.policy.keep_alive && !force {
            info!("keep-alive set, leaving supervisors running");
            return;
        }
        let stop_timeout = self.policy.startup_timeout;
        let stops = slots.iter().map(|slot| async move {
            slot.set_state(SupervisorState::Stopping);
            match timeout(stop_timeout, slot.supervisor.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(supervisor_id = slot.supervisor.id(), "stop failed: {e}"),
                Err(_) => warn!(
                    supervisor_id = slot.supervisor.id(),
                    "stop timed out, escalating termination"
                ),
            }
            slot.set_state(SupervisorState::Stopped);
        });
        join_all(stops).await;
    }
}

/// Periodically probes idle supervisors and restarts dead ones.
///
/// Busy supervisors are never probed: the running test is their liveness
/// signal, and a stuck test is the worker's timeout path to handle.
async fn probe_loop<S: Supervisor>(shared: &Shared<'_, S>, slots: &[PoolSlot<S>]) {
    let mut ticker = tokio::time::interval(shared.policy.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.done.cancelled() => break,
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for slot in slots {
            if slot.state() != SupervisorState::Ready {
                continue;
            }
            if slot.supervisor.probe().await == Liveness::Alive {
                continue;
            }

            // Claim the slot for restart; the worker may have taken it
            // between the probe and now, in which case leave it alone.
            {
                let mut state = slot.state.lock().unwrap();
                if *state != SupervisorState::Ready {
                    continue;
                }
                *state = SupervisorState::Starting;
            }

            let supervisor_id = slot.supervisor.id().to_string();
            shared
                .events
                .emit(Event::SupervisorDown {
                    supervisor_id: supervisor_id.clone(),
                })
                .await;

            match timeout(shared.policy.startup_timeout, slot.supervisor.restart()).await {
                Ok(Ok(())) => {
                    slot.set_state(SupervisorState::Ready);
                    shared
                        .events
                        .emit(Event::SupervisorRestarted { supervisor_id })
                        .await;
                }
                Ok(Err(e)) => {
                    warn!(%supervisor_id, "restart after dead probe failed: {e}");
                    slot.set_state(SupervisorState::Crashed);
                }
                Err(_) => {
                    warn!(%supervisor_id, "restart after dead probe timed out");
                    slot.set_state(SupervisorState::Crashed);
                }
            }
        }
    }
}
