//! Run-vs-run comparison.
//!
//! Loads the final statuses of two runs and classifies each test into the
//! four diff sets. `Skipped` on either side excludes a test from
//! regression/progression classification; infrastructure `Errored` in the
//! changed run counts as a regression when the baseline passed.

use std::collections::BTreeMap;

use crate::test::{TestId, TestStatus};

/// The diff between a baseline and a changed run.
///
/// A test may land in two sets at once: one that failed in the baseline
/// and is gone from the changed run is both a progression and removed.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    /// Passed in baseline, no longer passing in changed.
    pub regressions: Vec<TestId>,
    /// Failing in baseline, no longer failing in changed.
    pub progressions: Vec<TestId>,
    /// Present only in changed.
    pub new: Vec<TestId>,
    /// Present only in baseline.
    pub removed: Vec<TestId>,
    pub baseline_total: usize,
    pub changed_total: usize,
}

impl Comparison {
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    /// 0 when no regressions, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.has_regressions() { 1 } else { 0 }
    }
}

fn failing(status: TestStatus) -> bool {
    matches!(
        status,
        TestStatus::Failed | TestStatus::Errored | TestStatus::TimedOut
    )
}

/// Computes the diff between two final-status maps.
///
/// Output sets are ordered lexicographically by test id.
pub fn compare(
    baseline: &BTreeMap<TestId, TestStatus>,
    changed: &BTreeMap<TestId, TestStatus>,
) -> Comparison {
    let mut diff = Comparison {
        baseline_total: baseline.len(),
        changed_total: changed.len(),
        ..Default::default()
    };

    for (id, &base_status) in baseline {
        let changed_status = changed.get(id).copied();

        if changed_status.is_none() {
            diff.removed.push(id.clone());
        }

        // Skips are excluded from pass/fail classification on either side.
        if base_status == TestStatus::Skipped
            || changed_status == Some(TestStatus::Skipped)
            || base_status == TestStatus::NotRun
            || changed_status == Some(TestStatus::NotRun)
        {
            continue;
        }

        let was_passing = base_status == TestStatus::Passed;
        let now_passing = changed_status == Some(TestStatus::Passed);
        let now_failing = changed_status.is_some_and(failing);

        if was_passing && !now_passing {
            diff.regressions.push(id.clone());
        } else if failing(base_status) && !now_failing {
            diff.progressions.push(id.clone());
        }
    }

    for id in changed.keys() {
        if !baseline.contains_key(id) {
            diff.new.push(id.clone());
        }
    }

    diff
}
