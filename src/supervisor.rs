//! Supervisor contract: a scoped worker resource executing one test at a time.
//!
//! A supervisor typically wraps a disposable virtual machine, but the
//! dispatcher only sees this trait. Backends implement it over whatever
//! transport they have; the [`local`] backend runs tests as host processes.

pub mod local;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::test::{Test, TestStatus};

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors raised by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The supervisor failed to come up (or come back up).
    #[error("supervisor startup failed: {0}")]
    Startup(String),

    /// The transport to the supervisor broke mid-operation. The dispatcher
    /// treats this as a crash of the supervisor.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend could not execute this particular test.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Whether this error means the supervisor itself is gone, as opposed
    /// to a per-test problem.
    pub fn is_crash(&self) -> bool {
        matches!(self, SupervisorError::Transport(_) | SupervisorError::Io(_))
    }
}

/// Answer of a liveness probe. Indeterminate answers map to `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

/// Verdict a supervisor reports for a test that ran to completion.
///
/// Only `Passed`, `Failed`, and `Skipped` are produced here; `Errored` and
/// `TimedOut` are assigned by the dispatcher from the failure path.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: TestStatus,
    /// Backend diagnostics to attach to the result (dmesg excerpt, etc.).
    pub diagnostics: std::collections::BTreeMap<String, String>,
}

impl Verdict {
    pub fn new(status: TestStatus) -> Self {
        Self {
            status,
            diagnostics: Default::default(),
        }
    }
}

/// Append-only byte stream receiving test output as it arrives.
///
/// Sinks may be called from the supervisor's I/O task; implementations
/// decide whether to back them with files or ring buffers.
pub trait OutputSink: Send {
    fn write(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

/// A scoped worker resource capable of executing one test at a time.
///
/// Lifecycle: `start` must be paired with `stop`; `restart` is
/// `stop(); start()` with the same identity preserved so workers do not
/// rebind. A supervisor executes at most one test at a time, but `probe`
/// may be called concurrently with `run_test` and must not interfere;
/// implementations take `&self` and synchronize internally.
///
/// Cancellation: dropping the future returned by [`run_test`] must abort
/// the in-flight test (kill the child process, tear down the exec channel).
/// The dispatcher relies on this for timeout enforcement.
///
/// [`run_test`]: Supervisor::run_test
#[async_trait]
pub trait Supervisor: Send + Sync + 'static {
    /// The concrete test type this supervisor executes.
    type Test: Test;

    /// Stable identifier for the lifetime of this instance.
    fn id(&self) -> &str;

    /// Brings the supervisor up. May take significant time (VM boot); the
    /// dispatcher wraps this in the configured startup timeout, and a
    /// timed-out start must leave no running side processes behind.
    async fn start(&self) -> SupervisorResult<()>;

    /// Executes one test, streaming output into the sinks as it arrives.
    ///
    /// `timeout` is advisory for the backend (e.g. to pass down to a remote
    /// harness); the dispatcher separately enforces it around this call.
    async fn run_test(
        &self,
        test: &Self::Test,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        timeout: Duration,
    ) -> SupervisorResult<Verdict>;

    /// Cheap liveness check, returning within a short bounded time.
    async fn probe(&self) -> Liveness;

    /// Copies the artifacts of the given test's last attempt into
    /// `dest_dir`, returning their paths relative to `dest_dir`. Invoked
    /// after every completed attempt, successful or not.
    async fn collect_artifacts(
        &self,
        test: &Self::Test,
        dest_dir: &Path,
    ) -> SupervisorResult<Vec<PathBuf>>;

    /// Tears the supervisor down, killing any in-flight work.
    async fn stop(&self) -> SupervisorResult<()>;

    /// Equivalent to `stop(); start()` with identity preserved.
    async fn restart(&self) -> SupervisorResult<()>;
}

/// Dispatcher-side view of a supervisor's lifecycle.
///
/// ```text
/// Uninitialized → Starting → Ready ⇄ Busy
///                              │       │
///                              ├───────┴──→ Crashed → (Starting)
///                              └──→ Stopping → Stopped
/// ```
///
/// `Crashed` is reachable from any live state: a failed liveness probe or a
/// transport error during a test both land here. A supervisor in `Busy`
/// owns exactly one test; `Ready` owns none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Uninitialized,
    Starting,
    Ready,
    Busy,
    Crashed,
    Stopping,
    Stopped,
}

impl SupervisorState {
    /// Whether the supervisor is up (or coming up) from the pool's view.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SupervisorState::Starting | SupervisorState::Ready | SupervisorState::Busy
        )
    }

    /// Whether the transition `self → next` is legal.
    pub fn can_become(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match (self, next) {
            (Uninitialized, Starting) => true,
            (Starting, Ready) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            // Crash is reachable from any live state.
            (s, Crashed) if s.is_live() => true,
            // Restart path.
            (Crashed, Starting) => true,
            (Ready, Stopping) | (Crashed, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SupervisorState::*;

    #[test]
    fn lifecycle_path_is_legal() {
        let path = [Uninitialized, Starting, Ready, Busy, Ready, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(pair[0].can_become(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn crash_reachable_from_live_states_only() {
        assert!(Starting.can_become(Crashed));
        assert!(Ready.can_become(Crashed));
        assert!(Busy.can_become(Crashed));
        assert!(!Stopped.can_become(Crashed));
        assert!(!Uninitialized.can_become(Crashed));
    }

    #[test]
    fn crashed_supervisor_can_restart_or_stop() {
        assert!(Crashed.can_become(Starting));
        assert!(Crashed.can_become(Stopping));
        assert!(!Crashed.can_become(Busy));
    }

    #[test]
    fn busy_cannot_stop_directly() {
        // An in-flight test has to resolve (or crash) first.
        assert!(!Busy.can_become(Stopping));
    }
}
