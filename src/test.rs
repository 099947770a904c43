//! Test identity, status, and result types.
//!
//! These are the vocabulary types shared by every subsystem: the dispatcher
//! schedules [`WorkItem`]s, supervisors execute anything implementing
//! [`Test`], and the result store persists [`TestResult`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable, hierarchical test identity: `<suite>/<name>`, e.g. `btrfs/001`.
///
/// Equality is string equality; ordering is lexicographic and used only for
/// stable output. Execution order is decided by the scheduler, never by the
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// Creates an identity from suite and name components.
    pub fn new(suite: &str, name: &str) -> Self {
        Self(format!("{suite}/{name}"))
    }

    /// Returns the suite component (`btrfs` in `btrfs/001`).
    pub fn suite(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Returns the name component (`001` in `btrfs/001`).
    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }

    /// Returns the full identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TestId {
    type Err = InvalidTestId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((suite, name)) if !suite.is_empty() && !name.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(InvalidTestId(s.to_string())),
        }
    }
}

/// Error returned when a test identity is not of the `<suite>/<name>` form.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid test id (expected <suite>/<name>): {0:?}")]
pub struct InvalidTestId(pub String);

/// The outcome of one test attempt.
///
/// `Errored` denotes infrastructure failure (supervisor crashed, transport
/// lost) as distinct from `Failed`, where the test ran and its verdict was
/// negative. `NotRun` is only valid on a cancelled or never-dispatched test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Errored,
    TimedOut,
    NotRun,
}

impl TestStatus {
    /// Returns `true` for outcomes that do not fail the run.
    pub fn is_success(self) -> bool {
        matches!(self, TestStatus::Passed | TestStatus::Skipped)
    }

    /// Returns `true` for outcomes eligible for the failure-retry budget.
    ///
    /// `TimedOut` counts as `Failed` for retry purposes. `Errored` is
    /// handled separately under the supervisor-restart budget.
    pub fn is_retryable_failure(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::TimedOut)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
            TestStatus::Errored => "errored",
            TestStatus::TimedOut => "timedout",
            TestStatus::NotRun => "notrun",
        };
        f.write_str(s)
    }
}

impl FromStr for TestStatus {
    type Err = InvalidTestStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "passed" => Ok(TestStatus::Passed),
            "failed" => Ok(TestStatus::Failed),
            "skipped" => Ok(TestStatus::Skipped),
            "errored" => Ok(TestStatus::Errored),
            "timedout" => Ok(TestStatus::TimedOut),
            "notrun" => Ok(TestStatus::NotRun),
            other => Err(InvalidTestStatus(other.to_string())),
        }
    }
}

/// Error returned when a textual status is not recognized.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown test status: {0:?}")]
pub struct InvalidTestStatus(pub String);

/// A schedulable test.
///
/// Implementations carry whatever opaque payload their supervisor backend
/// needs to execute them, but must not hold mutable state tied to a specific
/// supervisor: the dispatcher may hand the same test to any supervisor in
/// the pool, and hands clones out again on retry.
pub trait Test: Clone + Send + Sync + 'static {
    /// The stable identity of this test.
    fn id(&self) -> &TestId;

    /// Iteration index, starting at 1. The same [`TestId`] may appear
    /// several times in one run when iteration is configured.
    fn iteration(&self) -> u32;
}

/// The immutable record of one completed test attempt.
///
/// Field names match the on-disk `results.jsonl` journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: TestId,
    pub iteration_index: u32,
    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub supervisor_id: String,
    pub attempt_index: u32,
    #[serde(default)]
    pub stdout_excerpt: String,
    #[serde(default)]
    pub stderr_excerpt: String,
    /// Paths relative to this result's directory in the store.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Backend-specific key/value diagnostics (dmesg excerpt, panic flag).
    #[serde(default)]
    pub diagnostics: BTreeMap<String, String>,
}

/// The dispatcher's bookkeeping wrapper around a [`Test`].
///
/// One `WorkItem` exists per `(test_id, iteration)` pair selected for the
/// run. The counters feed the retry and poison-pill policies.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    pub test: T,
    /// Completed attempts. The next attempt has index `attempts_so_far + 1`.
    pub attempts_so_far: u32,
    /// How many supervisors this item has crashed so far.
    pub supervisor_kills_caused: u32,
    /// Retries consumed from the failure budget. Crash retries are
    /// accounted separately under the restart budget.
    pub(crate) failure_retries: u32,
    /// Whether the single allowed requeue-to-front has been spent.
    pub(crate) front_requeued: bool,
}

impl<T: Test> WorkItem<T> {
    /// Wraps a test for dispatch.
    pub fn new(test: T) -> Self {
        Self {
            test,
            attempts_so_far: 0,
            supervisor_kills_caused: 0,
            failure_retries: 0,
            front_requeued: false,
        }
    }

    /// The 1-based index the next attempt will be recorded under.
    pub fn next_attempt_index(&self) -> u32 {
        self.attempts_so_far + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_components() {
        let id: TestId = "btrfs/001".parse().unwrap();
        assert_eq!(id.suite(), "btrfs");
        assert_eq!(id.name(), "001");
        assert_eq!(id.to_string(), "btrfs/001");
    }

    #[test]
    fn test_id_rejects_malformed() {
        assert!("btrfs".parse::<TestId>().is_err());
        assert!("/001".parse::<TestId>().is_err());
        assert!("btrfs/".parse::<TestId>().is_err());
        assert!("".parse::<TestId>().is_err());
    }

    #[test]
    fn test_id_nested_name_allowed() {
        let id: TestId = "xfs/dir/007".parse().unwrap();
        assert_eq!(id.suite(), "xfs");
        assert_eq!(id.name(), "dir/007");
    }

    #[test]
    fn test_id_ordering_is_lexicographic() {
        let mut ids: Vec<TestId> = ["xfs/002", "btrfs/010", "btrfs/002"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let sorted: Vec<_> = ids.iter().map(|i| i.as_str()).collect();
        assert_eq!(sorted, vec!["btrfs/002", "btrfs/010", "xfs/002"]);
    }

    #[test]
    fn status_text_round_trip() {
        for status in [
            TestStatus::Passed,
            TestStatus::Failed,
            TestStatus::Skipped,
            TestStatus::Errored,
            TestStatus::TimedOut,
            TestStatus::NotRun,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<TestStatus>().unwrap(), status);
        }
        assert!("flaky".parse::<TestStatus>().is_err());
    }

    #[test]
    fn retryable_statuses() {
        assert!(TestStatus::Failed.is_retryable_failure());
        assert!(TestStatus::TimedOut.is_retryable_failure());
        assert!(!TestStatus::Errored.is_retryable_failure());
        assert!(!TestStatus::Passed.is_retryable_failure());
        assert!(!TestStatus::Skipped.is_retryable_failure());
    }

    #[test]
    fn result_serde_field_names() {
        let result = TestResult {
            test_id: "generic/013".parse().unwrap(),
            iteration_index: 1,
            status: TestStatus::Passed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_seconds: 1.5,
            supervisor_id: "sv0".to_string(),
            attempt_index: 1,
            stdout_excerpt: String::new(),
            stderr_excerpt: String::new(),
            artifacts: vec![PathBuf::from("artifacts/013.full")],
            diagnostics: BTreeMap::new(),
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"test_id\":\"generic/013\""));
        assert!(json.contains("\"status\":\"passed\""));
        assert!(json.contains("\"iteration_index\":1"));
        assert!(json.contains("\"attempt_index\":1"));

        let back: TestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.test_id, result.test_id);
        assert_eq!(back.status, result.status);
        assert_eq!(back.artifacts, result.artifacts);
    }
}
