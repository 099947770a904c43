//! Configuration schema.
//!
//! One record drives both the TOML file and the CLI: the file deserializes
//! into [`Config`], and CLI flags merge over it in `main`. Unknown keys are
//! rejected everywhere.
//!
//! ```text
//! Config (root)
//! ├── fstests               - path to the fstests checkout
//! ├── TestSelectionConfig   - which tests, and in what shape
//! ├── TestRunnerConfig      - pool size, timeouts, retry/restart budgets
//! └── OutputConfig          - result store, reporter toggles, recording
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the fstests checkout tests are collected from and run in.
    pub fstests: Option<PathBuf>,

    #[serde(default)]
    pub test_selection: TestSelectionConfig,

    #[serde(default)]
    pub test_runner: TestRunnerConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Which tests run, and in what shape the list reaches the dispatcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TestSelectionConfig {
    /// Test patterns: `btrfs/001`, `generic/0?3`, or a bare suite name.
    #[serde(default)]
    pub tests: Vec<String>,

    /// Group names from the suites' `group.list` files.
    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub exclude_tests: Vec<String>,

    /// File of exclusion patterns, one per line, `#` comments.
    pub exclude_tests_file: Option<PathBuf>,

    #[serde(default)]
    pub exclude_groups: Vec<String>,

    /// fstests config sections to run under (`check -s`); passed through
    /// to the backend.
    #[serde(default)]
    pub section: Vec<String>,

    /// fstests config sections to skip (`check -x`); passed through to
    /// the backend.
    #[serde(default)]
    pub exclude_section: Vec<String>,

    /// Shuffle the selected tests before scheduling.
    #[serde(default)]
    pub randomize: bool,

    /// Run each selected test this many times, with distinct iteration
    /// indices.
    #[serde(default = "default_iterate")]
    pub iterate: u32,

    /// Run reference supplying durations for largest-first ordering:
    /// empty/`latest`, a recording label, or `-k`.
    pub slowest_first: Option<String>,

    /// Run reference restricting the list to tests that were failing
    /// there.
    pub rerun_failures: Option<String>,
}

impl Default for TestSelectionConfig {
    fn default() -> Self {
        Self {
            tests: Vec::new(),
            groups: Vec::new(),
            exclude_tests: Vec::new(),
            exclude_tests_file: None,
            exclude_groups: Vec::new(),
            section: Vec::new(),
            exclude_section: Vec::new(),
            randomize: false,
            iterate: default_iterate(),
            slowest_first: None,
            rerun_failures: None,
        }
    }
}

fn default_iterate() -> u32 {
    1
}

/// Dispatcher policy knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TestRunnerConfig {
    /// Number of supervisors in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// After drain, leave supervisors running for manual debugging.
    #[serde(default)]
    pub keep_alive: bool,

    /// Per-test budget in seconds; on exceed the test is `timedout`.
    #[serde(default = "default_test_timeout")]
    pub test_timeout: u64,

    /// Budget in seconds around supervisor start and restart.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,

    /// Liveness probe cadence in seconds; 0 disables the prober.
    #[serde(default)]
    pub probe_interval: u64,

    /// Per-test cap on supervisors it may crash before being isolated.
    #[serde(default = "default_max_supervisor_restarts")]
    pub max_supervisor_restarts: u32,

    /// Retries granted to failing (or timing-out) tests.
    #[serde(default)]
    pub retry_failures: u32,

    /// Capture dmesg around each test (passed through to the backend).
    #[serde(default)]
    pub dmesg: bool,
}

impl Default for TestRunnerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            keep_alive: false,
            test_timeout: default_test_timeout(),
            startup_timeout: default_startup_timeout(),
            probe_interval: 0,
            max_supervisor_restarts: default_max_supervisor_restarts(),
            retry_failures: 0,
            dmesg: false,
        }
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_test_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_startup_timeout() -> u64 {
    600 // VM boots can be slow
}

fn default_max_supervisor_restarts() -> u32 {
    3
}

/// Persistence and reporting.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Where results persist. Required for recordings, comparisons, and
    /// `slowest_first`; without it the run writes to a throwaway store.
    pub results_dir: Option<PathBuf>,

    /// Print the failing tests after the summary.
    #[serde(default)]
    pub print_failure_list: bool,

    /// Print the N slowest tests; 0 disables.
    #[serde(default)]
    pub print_n_slowest: usize,

    /// Print a bucketed duration histogram.
    #[serde(default)]
    pub print_duration_hist: bool,

    /// Create a recording under this label after completion.
    pub record: Option<String>,

    /// Compare against this run reference after completion and print the
    /// regression summary.
    pub compare_to: Option<String>,
}
