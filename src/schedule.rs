//! Work-list construction and duration-aware ordering.
//!
//! The dispatcher runs items in exactly the order it is given; this module
//! is where that order is decided.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::test::{Test, TestId, TestStatus, WorkItem};

/// Options shaping the work list, from `[test_selection]`.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Run each selected test this many times (distinct iteration
    /// indices). Values below 1 mean once.
    pub iterate: u32,
    /// Shuffle the input list before ordering.
    pub randomize: bool,
    /// Durations from a prior run; enables largest-first ordering.
    pub slowest_first: Option<HashMap<TestId, f64>>,
    /// Restrict the list to these ids (rerun-failures mode).
    pub rerun_only: Option<HashSet<TestId>>,
}

/// Orders tests with known durations largest-first, then tests without
/// known durations in their incoming order.
///
/// Largest-processing-time-first list scheduling keeps the pool busy to the
/// end and stays within a factor of two of the optimal makespan. The sort
/// is stable, so applying it twice is a no-op.
pub fn order_slowest_first<T: Test>(tests: Vec<T>, durations: &HashMap<TestId, f64>) -> Vec<T> {
    let (mut known, unknown): (Vec<T>, Vec<T>) = tests
        .into_iter()
        .partition(|t| durations.contains_key(t.id()));
    known.sort_by(|a, b| durations[b.id()].total_cmp(&durations[a.id()]));
    known.extend(unknown);
    known
}

/// Ids that were failing in a prior run, for `rerun_failures`.
pub fn rerun_set(statuses: &BTreeMap<TestId, TestStatus>) -> HashSet<TestId> {
    statuses
        .iter()
        .filter(|(_, status)| {
            matches!(
                status,
                TestStatus::Failed | TestStatus::Errored | TestStatus::TimedOut
            )
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// Builds the dispatch order: filter, shuffle, order by duration, expand
/// iterations. `reiterate` clones a test with a new iteration index.
pub fn build_work_list<T: Test>(
    tests: Vec<T>,
    options: &ScheduleOptions,
    reiterate: impl Fn(&T, u32) -> T,
) -> Vec<WorkItem<T>> {
    let mut tests: Vec<T> = match &options.rerun_only {
        Some(keep) => tests.into_iter().filter(|t| keep.contains(t.id())).collect(),
        None => tests,
    };

    if options.randomize {
        tests.shuffle(&mut thread_rng());
    }
    if let Some(durations) = &options.slowest_first {
        tests = order_slowest_first(tests, durations);
    }

    let iterations = options.iterate.max(1);
    let mut items = Vec::with_capacity(tests.len() * iterations as usize);
    for test in &tests {
        for iteration in 1..=iterations {
            items.push(WorkItem::new(reiterate(test, iteration)));
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Stub {
        id: TestId,
        iteration: u32,
    }

    impl Test for Stub {
        fn id(&self) -> &TestId {
            &self.id
        }
        fn iteration(&self) -> u32 {
            self.iteration
        }
    }

    fn stub(name: &str) -> Stub {
        Stub {
            id: name.parse().unwrap(),
            iteration: 1,
        }
    }

    fn durations(entries: &[(&str, f64)]) -> HashMap<TestId, f64> {
        entries
            .iter()
            .map(|(id, secs)| (id.parse().unwrap(), *secs))
            .collect()
    }

    fn ids(tests: &[Stub]) -> Vec<&str> {
        tests.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn slowest_known_durations_come_first() {
        let durations = durations(&[("g/a", 10.0), ("g/b", 30.0), ("g/c", 20.0)]);
        let ordered = order_slowest_first(
            vec![stub("g/a"), stub("g/b"), stub("g/c")],
            &durations,
        );
        assert_eq!(ids(&ordered), vec!["g/b", "g/c", "g/a"]);
    }

    #[test]
    fn unknown_durations_keep_input_order_after_known() {
        let durations = durations(&[("g/slow", 100.0)]);
        let ordered = order_slowest_first(
            vec![stub("g/x"), stub("g/slow"), stub("g/y")],
            &durations,
        );
        assert_eq!(ids(&ordered), vec!["g/slow", "g/x", "g/y"]);
    }

    #[test]
    fn ordering_is_idempotent() {
        let durations = durations(&[("g/a", 10.0), ("g/b", 30.0), ("g/c", 20.0)]);
        let once = order_slowest_first(
            vec![stub("g/a"), stub("g/b"), stub("g/c")],
            &durations,
        );
        let twice = order_slowest_first(once.clone(), &durations);
        assert_eq!(once, twice);
    }

    #[test]
    fn iterate_expands_with_distinct_indices() {
        let options = ScheduleOptions {
            iterate: 3,
            ..Default::default()
        };
        let items = build_work_list(vec![stub("g/a")], &options, |t, i| Stub {
            id: t.id.clone(),
            iteration: i,
        });
        let iterations: Vec<u32> = items.iter().map(|w| w.test.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
    }

    #[test]
    fn rerun_only_filters_the_list() {
        let statuses: BTreeMap<TestId, TestStatus> = [
            ("g/pass", TestStatus::Passed),
            ("g/fail", TestStatus::Failed),
            ("g/err", TestStatus::Errored),
            ("g/slow", TestStatus::TimedOut),
            ("g/skip", TestStatus::Skipped),
        ]
        .iter()
        .map(|(id, s)| (id.parse().unwrap(), *s))
        .collect();

        let options = ScheduleOptions {
            rerun_only: Some(rerun_set(&statuses)),
            ..Default::default()
        };
        let items = build_work_list(
            vec![stub("g/pass"), stub("g/fail"), stub("g/err"), stub("g/slow"), stub("g/skip")],
            &options,
            |t, _| t.clone(),
        );
        assert_eq!(
            items
                .iter()
                .map(|w| w.test.id.as_str())
                .collect::<Vec<_>>(),
            vec!["g/fail", "g/err", "g/slow"]
        );
    }

    #[test]
    fn randomize_preserves_the_set() {
        let options = ScheduleOptions {
            randomize: true,
            ..Default::default()
        };
        let items = build_work_list(
            (0..20).map(|i| stub(&format!("g/{i:03}"))).collect(),
            &options,
            |t, _| t.clone(),
        );
        let mut names: Vec<String> = items.iter().map(|w| w.test.id.to_string()).collect();
        names.sort();
        let expected: Vec<String> = (0..20).map(|i| format!("g/{i:03}")).collect();
        assert_eq!(names, expected);
    }
}
