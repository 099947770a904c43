//! Configuration loading.
//!
//! See [`schema`] for the full schema. Loading expands `~` in the path
//! fields so configs can be shared between users.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::collect::Selection;
use crate::dispatch::DispatchPolicy;

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string. Useful for tests and for
/// generating configuration programmatically.
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("invalid configuration")?;
    config.fstests = config.fstests.map(expand_path);
    config.output.results_dir = config.output.results_dir.map(expand_path);
    config.test_selection.exclude_tests_file =
        config.test_selection.exclude_tests_file.map(expand_path);
    Ok(config)
}

fn expand_path(path: PathBuf) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

impl Config {
    /// Serializes the settled configuration for the run snapshot.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// The collector's view of `[test_selection]`.
    pub fn selection(&self) -> Selection {
        Selection {
            tests: self.test_selection.tests.clone(),
            groups: self.test_selection.groups.clone(),
            exclude_tests: self.test_selection.exclude_tests.clone(),
            exclude_tests_file: self.test_selection.exclude_tests_file.clone(),
            exclude_groups: self.test_selection.exclude_groups.clone(),
        }
    }

    /// The dispatcher's view of `[test_runner]`.
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            test_timeout: Duration::from_secs(self.test_runner.test_timeout),
            startup_timeout: Duration::from_secs(self.test_runner.startup_timeout),
            probe_interval: Duration::from_secs(self.test_runner.probe_interval),
            max_supervisor_restarts: self.test_runner.max_supervisor_restarts,
            retry_failures: self.test_runner.retry_failures,
            keep_alive: self.test_runner.keep_alive,
        }
    }
}
