//! Local supervisor implementation.
//!
//! Runs fstests directly on the host as child processes of fstorm. There is
//! no isolation (a test that wedges the kernel wedges the machine), but it
//! needs no VM images and is the fastest way to exercise the runner.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared kernel and filesystem) |
//! | Liveness probing | Trivially alive (host transport cannot drop) |
//! | Abort on timeout | Child process is killed when the run future drops |
//! | Artifact collection | Local copy from the fstests `results/` tree |

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::{Liveness, OutputSink, Supervisor, SupervisorError, SupervisorResult, Verdict};
use crate::collect::FsTest;
use crate::test::{Test, TestStatus};

/// Supervisor that runs fstests as host child processes.
///
/// Each test is executed as `./check [-s SECTION]... [-x SECTION]...
/// <suite>/<name>` from the fstests checkout. The child is spawned with
/// kill-on-drop so that cancelling the run future (the dispatcher's
/// timeout path) aborts the in-flight test.
pub struct LocalSupervisor {
    id: String,
    fstests_root: PathBuf,
    sections: Vec<String>,
    exclude_sections: Vec<String>,
    dmesg: bool,
}

impl LocalSupervisor {
    /// Creates a supervisor rooted at the given fstests checkout.
    pub fn new(id: impl Into<String>, fstests_root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            fstests_root: fstests_root.into(),
            sections: Vec::new(),
            exclude_sections: Vec::new(),
            dmesg: false,
        }
    }

    /// Restricts runs to the given fstests config sections (`check -s`).
    pub fn with_sections(mut self, sections: Vec<String>) -> Self {
        self.sections = sections;
        self
    }

    /// Skips the given fstests config sections (`check -x`).
    pub fn with_exclude_sections(mut self, sections: Vec<String>) -> Self {
        self.exclude_sections = sections;
        self
    }

    /// Enables dmesg capture (`check -d`).
    pub fn with_dmesg(mut self, dmesg: bool) -> Self {
        self.dmesg = dmesg;
        self
    }

    fn results_dir_for(&self, test: &FsTest) -> PathBuf {
        self.fstests_root.join("results").join(test.id().suite())
    }
}

#[async_trait]
impl Supervisor for LocalSupervisor {
    type Test = FsTest;

    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> SupervisorResult<()> {
        let check = self.fstests_root.join("check");
        if !check.is_file() {
            return Err(SupervisorError::Startup(format!(
                "no check script at {}",
                check.display()
            )));
        }
        Ok(())
    }

    async fn run_test(
        &self,
        test: &FsTest,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        _timeout: Duration,
    ) -> SupervisorResult<Verdict> {
        let mut command = tokio::process::Command::new("./check");
        for section in &self.sections {
            command.arg("-s").arg(section);
        }
        for section in &self.exclude_sections {
            command.arg("-x").arg(section);
        }
        if self.dmesg {
            command.arg("-d");
        }
        command
            .arg(test.id().as_str())
            .current_dir(&self.fstests_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::Backend(format!("failed to spawn check: {e}")))?;

        let mut out = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Backend("stdout not captured".to_string()))?;
        let mut err = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Backend("stderr not captured".to_string()))?;

        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let mut out_done = false;
        let mut err_done = false;

        while !(out_done && err_done) {
            tokio::select! {
                read = out.read(&mut out_buf), if !out_done => {
                    let n = read?;
                    if n == 0 {
                        out_done = true;
                    } else {
                        stdout.write(&out_buf[..n])?;
                    }
                }
                read = err.read(&mut err_buf), if !err_done => {
                    let n = read?;
                    if n == 0 {
                        err_done = true;
                    } else {
                        stderr.write(&err_buf[..n])?;
                    }
                }
            }
        }

        let status = child.wait().await?;

        let notrun = self
            .results_dir_for(test)
            .join(format!("{}.notrun", test.id().name()));

        let verdict_status = if notrun.is_file() {
            TestStatus::Skipped
        } else if status.success() {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };

        let mut verdict = Verdict::new(verdict_status);
        if let Some(code) = status.code() {
            verdict
                .diagnostics
                .insert("exit_code".to_string(), code.to_string());
        }
        Ok(verdict)
    }

    async fn probe(&self) -> Liveness {
        // Host transport cannot drop; a dead host takes the prober with it.
        Liveness::Alive
    }

    async fn collect_artifacts(
        &self,
        test: &FsTest,
        dest_dir: &Path,
    ) -> SupervisorResult<Vec<PathBuf>> {
        let results_dir = self.results_dir_for(test);
        let mut collected = Vec::new();

        let mut entries = match tokio::fs::read_dir(&results_dir).await {
            Ok(entries) => entries,
            // Tests that never got to write results leave no directory.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(collected),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{}.", test.id().name());
        tokio::fs::create_dir_all(dest_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !name.starts_with(&prefix) || !entry.file_type().await?.is_file() {
                continue;
            }
            tokio::fs::copy(entry.path(), dest_dir.join(&file_name)).await?;
            collected.push(PathBuf::from(file_name));
        }

        collected.sort();
        Ok(collected)
    }

    async fn stop(&self) -> SupervisorResult<()> {
        // Child processes are transient; nothing to tear down.
        Ok(())
    }

    async fn restart(&self) -> SupervisorResult<()> {
        self.stop().await?;
        self.start().await
    }
}
