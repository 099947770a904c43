//! On-disk result store.
//!
//! Layout, relied upon by the reporter and comparator:
//!
//! ```text
//! <results_dir>/
//!   tests/<test_id>/<run_id>/
//!     status            # textual TestStatus of the final attempt
//!     stdout            # full capture
//!     stderr            # full capture
//!     meta.json         # TestResult fields
//!     artifacts/...     # backend-supplied files
//!   runs/<run_id>/
//!     config.toml       # captured configuration for this run
//!     results.jsonl     # one TestResult per line, in completion order
//!     tests -> ../../tests
//!   latest -> runs/<run_id>
//!   recordings/<label> -> runs/<run_id>
//! ```
//!
//! Writes are append-only during a run. The `latest` symlink is updated
//! atomically (symlink at a temp name, then rename) as soon as the run
//! directory is initialized, so an interrupted run still leaves a coherent
//! `latest`. The journal is flushed after every line; readers tolerate a
//! truncated trailing line.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::Utc;
use tracing::{debug, warn};

use crate::supervisor::OutputSink;
use crate::test::{TestId, TestResult, TestStatus};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the result store. Store failures are fatal to a run:
/// its output is the product.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("recording {0:?} already exists (pass --force to replace it)")]
    LabelExists(String),

    #[error("no recorded runs yet: latest does not resolve")]
    NoLatest,

    #[error("unknown recording: {0:?}")]
    UnknownLabel(String),

    #[error("wanted the {wanted}-th most recent recording, only {available} exist")]
    NotEnoughRecordings { wanted: usize, available: usize },

    #[error("invalid run reference {0:?} (expected a label or a negative index)")]
    BadSource(String),
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Reference to a recorded run: `latest`, a recording label, or `-k` for
/// the k-th most recent recording by mtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Latest,
    Label(String),
    Nth(usize),
}

impl FromStr for SourceRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "latest" {
            return Ok(SourceRef::Latest);
        }
        if let Some(rest) = s.strip_prefix('-') {
            let n: usize = rest
                .parse()
                .map_err(|_| StoreError::BadSource(s.to_string()))?;
            if n == 0 {
                return Err(StoreError::BadSource(s.to_string()));
            }
            return Ok(SourceRef::Nth(n));
        }
        Ok(SourceRef::Label(s.to_string()))
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::Latest => f.write_str("latest"),
            SourceRef::Label(label) => f.write_str(label),
            SourceRef::Nth(n) => write!(f, "-{n}"),
        }
    }
}

/// Handle on a results directory.
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in ["tests", "runs", "recordings"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| io_err(path, e))?;
        }
        Ok(Self { root })
    }

    /// Opens a store in a throwaway directory. Used when no `results_dir`
    /// is configured: the run still goes through the single write path, but
    /// nothing survives the process.
    pub fn open_ephemeral() -> StoreResult<(Self, tempfile::TempDir)> {
        let dir = tempfile::tempdir().map_err(|e| io_err("<tempdir>", e))?;
        let store = Self::open(dir.path())?;
        Ok((store, dir))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generates a fresh, monotonic run id from the wall clock.
    pub fn new_run_id() -> String {
        Utc::now().format("%Y%m%d-%H%M%S%.3f").to_string()
    }

    /// Initializes a run directory and atomically points `latest` at it.
    ///
    /// After this returns, `latest/results.jsonl` exists and is empty:
    /// well-formed, never partial.
    pub fn begin_run(&self, run_id: &str, config_toml: &str) -> StoreResult<RunWriter> {
        let run_dir = self.root.join("runs").join(run_id);
        fs::create_dir_all(&run_dir).map_err(|e| io_err(&run_dir, e))?;

        let config_path = run_dir.join("config.toml");
        fs::write(&config_path, config_toml).map_err(|e| io_err(&config_path, e))?;

        let tests_link = run_dir.join("tests");
        if !tests_link.exists() {
            std::os::unix::fs::symlink("../../tests", &tests_link)
                .map_err(|e| io_err(&tests_link, e))?;
        }

        let journal_path = run_dir.join("results.jsonl");
        let journal = File::create(&journal_path).map_err(|e| io_err(&journal_path, e))?;

        self.point_latest_at(run_id)?;
        debug!(run_id, "run directory initialized");

        Ok(RunWriter {
            run_dir,
            run_id: run_id.to_string(),
            tests_root: self.root.join("tests"),
            journal: Mutex::new(BufWriter::new(journal)),
        })
    }

    fn point_latest_at(&self, run_id: &str) -> StoreResult<()> {
        let target = PathBuf::from("runs").join(run_id);
        let tmp = self.root.join(format!(".latest.{}", std::process::id()));
        let latest = self.root.join("latest");

        let _ = fs::remove_file(&tmp);
        std::os::unix::fs::symlink(&target, &tmp).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &latest).map_err(|e| io_err(&latest, e))
    }

    /// Resolves the run directory `latest` points at.
    pub fn latest_run_dir(&self) -> StoreResult<PathBuf> {
        let latest = self.root.join("latest");
        latest.canonicalize().map_err(|_| StoreError::NoLatest)
    }

    /// Creates a recording of `latest` under the given label.
    ///
    /// Recordings are never-deleted references; an existing label is an
    /// error unless `force` is set. With the label omitted, the run's own
    /// timestamp id is used.
    pub fn create_recording(&self, label: Option<&str>, force: bool) -> StoreResult<PathBuf> {
        let run_dir = self.latest_run_dir()?;
        let run_id = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(StoreError::NoLatest)?;
        let label = label.unwrap_or(&run_id);

        let link = self.root.join("recordings").join(label);
        if link.symlink_metadata().is_ok() {
            if !force {
                return Err(StoreError::LabelExists(label.to_string()));
            }
            fs::remove_file(&link).map_err(|e| io_err(&link, e))?;
        }

        let target = PathBuf::from("../runs").join(&run_id);
        std::os::unix::fs::symlink(&target, &link).map_err(|e| io_err(&link, e))?;
        Ok(link)
    }

    /// Recordings sorted most recent first by link mtime.
    pub fn recordings_by_recency(&self) -> StoreResult<Vec<(String, PathBuf)>> {
        let dir = self.root.join("recordings");
        let mut entries: Vec<(SystemTime, String, PathBuf)> = Vec::new();

        for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let label = entry.file_name().to_string_lossy().into_owned();
            let mtime = entry
                .path()
                .symlink_metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match entry.path().canonicalize() {
                Ok(target) => entries.push((mtime, label, target)),
                Err(_) => warn!(%label, "skipping broken recording link"),
            }
        }

        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, l, p)| (l, p)).collect())
    }

    /// Resolves a source reference to a run directory.
    pub fn resolve(&self, source: &SourceRef) -> StoreResult<PathBuf> {
        match source {
            SourceRef::Latest => self.latest_run_dir(),
            SourceRef::Label(label) => {
                let link = self.root.join("recordings").join(label);
                link.canonicalize()
                    .map_err(|_| StoreError::UnknownLabel(label.clone()))
            }
            SourceRef::Nth(n) => {
                let recordings = self.recordings_by_recency()?;
                if recordings.len() < *n {
                    return Err(StoreError::NotEnoughRecordings {
                        wanted: *n,
                        available: recordings.len(),
                    });
                }
                Ok(recordings[*n - 1].1.clone())
            }
        }
    }
}

/// Write handle for one run. This is the single journal writer the run's
/// results funnel through; per-test directories are independently writable.
pub struct RunWriter {
    run_dir: PathBuf,
    run_id: String,
    tests_root: PathBuf,
    journal: Mutex<BufWriter<File>>,
}

impl RunWriter {
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// This run's directory for the given test: `tests/<id>/<run_id>/`.
    pub fn test_dir(&self, id: &TestId) -> PathBuf {
        self.tests_root.join(id.as_str()).join(&self.run_id)
    }

    /// The artifacts directory for the given test, created on demand.
    pub fn artifacts_dir(&self, id: &TestId) -> StoreResult<PathBuf> {
        let dir = self.test_dir(id).join("artifacts");
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(dir)
    }

    /// Opens fresh file-backed stdout/stderr sinks for one attempt.
    ///
    /// Each attempt truncates the captures; the files end up holding the
    /// final attempt, which is the authoritative one.
    pub fn open_sinks(&self, id: &TestId) -> StoreResult<(FileSink, FileSink)> {
        let dir = self.test_dir(id);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok((
            FileSink::create(dir.join("stdout"))?,
            FileSink::create(dir.join("stderr"))?,
        ))
    }

    /// Persists one attempt: rewrites the per-test `status` and `meta.json`
    /// and appends a journal line, flushed before returning.
    pub fn persist_attempt(&self, result: &TestResult) -> StoreResult<()> {
        let dir = self.test_dir(&result.test_id);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let status_path = dir.join("status");
        fs::write(&status_path, format!("{}\n", result.status))
            .map_err(|e| io_err(&status_path, e))?;

        let meta_path = dir.join("meta.json");
        let meta = serde_json::to_vec_pretty(result).expect("result serializes");
        fs::write(&meta_path, meta).map_err(|e| io_err(&meta_path, e))?;

        let line = serde_json::to_string(result).expect("result serializes");
        let mut journal = self.journal.lock().unwrap();
        journal
            .write_all(line.as_bytes())
            .and_then(|_| journal.write_all(b"\n"))
            .and_then(|_| journal.flush())
            .map_err(|e| io_err(self.run_dir.join("results.jsonl"), e))
    }
}

/// Loads every journaled attempt from a run directory, in completion order.
///
/// A truncated trailing line (crash mid-write) is skipped, not an error.
pub fn load_results(run_dir: &Path) -> StoreResult<Vec<TestResult>> {
    let path = run_dir.join("results.jsonl");
    let file = File::open(&path).map_err(|e| io_err(&path, e))?;
    let mut results = Vec::new();

    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| io_err(&path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TestResult>(&line) {
            Ok(result) => results.push(result),
            Err(e) => debug!(error = %e, "skipping unparseable journal line"),
        }
    }
    Ok(results)
}

/// Reduces journaled attempts to the final status per test.
///
/// Attempts appear in completion order and the final attempt is
/// authoritative, so last-wins.
pub fn final_statuses(results: &[TestResult]) -> BTreeMap<TestId, TestStatus> {
    let mut map = BTreeMap::new();
    for result in results {
        map.insert(result.test_id.clone(), result.status);
    }
    map
}

/// Extracts each test's most recent duration from journaled attempts.
pub fn latest_durations(results: &[TestResult]) -> HashMap<TestId, f64> {
    let mut map = HashMap::new();
    for result in results {
        if result.status != TestStatus::NotRun {
            map.insert(result.test_id.clone(), result.duration_seconds);
        }
    }
    map
}

/// Excerpt tail kept in memory per capture.
const EXCERPT_LIMIT: usize = 4096;

/// File-backed [`OutputSink`] that also keeps a bounded tail of the stream
/// for the result's excerpt field.
pub struct FileSink {
    writer: BufWriter<File>,
    tail: VecDeque<u8>,
}

impl FileSink {
    fn create(path: PathBuf) -> StoreResult<Self> {
        let file = File::create(&path).map_err(|e| io_err(&path, e))?;
        Ok(Self {
            writer: BufWriter::new(file),
            tail: VecDeque::with_capacity(EXCERPT_LIMIT),
        })
    }

    /// The trailing portion of the stream, lossily decoded.
    pub fn excerpt(&self) -> String {
        let bytes: Vec<u8> = self.tail.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Flushes the capture to disk.
    pub fn finish(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl OutputSink for FileSink {
    fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(chunk)?;
        for &byte in chunk {
            if self.tail.len() == EXCERPT_LIMIT {
                self.tail.pop_front();
            }
            self.tail.push_back(byte);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn result(name: &str, status: TestStatus, attempt: u32) -> TestResult {
        let now = Utc::now();
        TestResult {
            test_id: format!("generic/{name}").parse().unwrap(),
            iteration_index: 1,
            status,
            started_at: now,
            finished_at: now,
            duration_seconds: 2.0,
            supervisor_id: "sv0".to_string(),
            attempt_index: attempt,
            stdout_excerpt: String::new(),
            stderr_excerpt: String::new(),
            artifacts: Vec::new(),
            diagnostics: Map::new(),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let writer = store.begin_run("20260101-000000.000", "# config\n").unwrap();

        let a = result("001", TestStatus::Passed, 1);
        let b = result("002", TestStatus::Failed, 1);
        writer.persist_attempt(&a).unwrap();
        writer.persist_attempt(&b).unwrap();

        let loaded = load_results(writer.run_dir()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].test_id, a.test_id);
        assert_eq!(loaded[0].status, TestStatus::Passed);
        assert_eq!(loaded[1].test_id, b.test_id);
        assert_eq!(loaded[1].duration_seconds, b.duration_seconds);
    }

    #[test]
    fn latest_is_coherent_immediately_after_begin_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let _writer = store.begin_run("20260101-000000.000", "").unwrap();

        let latest = store.latest_run_dir().unwrap();
        let results = load_results(&latest).unwrap();
        assert!(results.is_empty());
        assert!(latest.join("config.toml").is_file());
    }

    #[test]
    fn latest_moves_to_newest_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        store.begin_run("20260101-000000.000", "").unwrap();
        store.begin_run("20260101-000001.000", "").unwrap();

        let latest = store.latest_run_dir().unwrap();
        assert!(latest.ends_with("runs/20260101-000001.000"));
    }

    #[test]
    fn per_test_files_reflect_final_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let writer = store.begin_run("20260101-000000.000", "").unwrap();

        writer
            .persist_attempt(&result("003", TestStatus::Failed, 1))
            .unwrap();
        writer
            .persist_attempt(&result("003", TestStatus::Passed, 2))
            .unwrap();

        let test_dir = writer.test_dir(&"generic/003".parse().unwrap());
        let status = fs::read_to_string(test_dir.join("status")).unwrap();
        assert_eq!(status.trim(), "passed");

        // The journal keeps both attempts; the final one is authoritative.
        let loaded = load_results(writer.run_dir()).unwrap();
        assert_eq!(loaded.len(), 2);
        let finals = final_statuses(&loaded);
        assert_eq!(finals[&"generic/003".parse().unwrap()], TestStatus::Passed);
    }

    #[test]
    fn truncated_trailing_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let writer = store.begin_run("20260101-000000.000", "").unwrap();
        writer
            .persist_attempt(&result("004", TestStatus::Passed, 1))
            .unwrap();

        let journal = writer.run_dir().join("results.jsonl");
        let mut file = fs::OpenOptions::new().append(true).open(&journal).unwrap();
        file.write_all(b"{\"test_id\":\"gener").unwrap();

        let loaded = load_results(writer.run_dir()).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn recording_labels_are_unique_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        store.begin_run("20260101-000000.000", "").unwrap();

        store.create_recording(Some("baseline"), false).unwrap();
        let err = store.create_recording(Some("baseline"), false).unwrap_err();
        assert!(matches!(err, StoreError::LabelExists(_)));
        store.create_recording(Some("baseline"), true).unwrap();
    }

    #[test]
    fn recordings_do_not_follow_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        store.begin_run("20260101-000000.000", "").unwrap();
        store.create_recording(Some("pinned"), false).unwrap();

        // A newer run moves latest but not the recording.
        store.begin_run("20260101-000001.000", "").unwrap();
        let pinned = store.resolve(&SourceRef::Label("pinned".to_string())).unwrap();
        assert!(pinned.ends_with("runs/20260101-000000.000"));
    }

    #[test]
    fn nth_resolves_by_recency() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();

        store.begin_run("20260101-000000.000", "").unwrap();
        store.create_recording(Some("older"), false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.begin_run("20260101-000001.000", "").unwrap();
        store.create_recording(Some("newer"), false).unwrap();

        let newest = store.resolve(&SourceRef::Nth(1)).unwrap();
        let second = store.resolve(&SourceRef::Nth(2)).unwrap();
        assert!(newest.ends_with("runs/20260101-000001.000"));
        assert!(second.ends_with("runs/20260101-000000.000"));

        let err = store.resolve(&SourceRef::Nth(3)).unwrap_err();
        assert!(matches!(err, StoreError::NotEnoughRecordings { .. }));
    }

    #[test]
    fn source_ref_parsing() {
        assert_eq!("".parse::<SourceRef>().unwrap(), SourceRef::Latest);
        assert_eq!("latest".parse::<SourceRef>().unwrap(), SourceRef::Latest);
        assert_eq!(
            "-2".parse::<SourceRef>().unwrap(),
            SourceRef::Nth(2)
        );
        assert_eq!(
            "baseline".parse::<SourceRef>().unwrap(),
            SourceRef::Label("baseline".to_string())
        );
        assert!("-0".parse::<SourceRef>().is_err());
        assert!("-x".parse::<SourceRef>().is_err());
    }

    #[test]
    fn file_sink_keeps_tail_excerpt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let writer = store.begin_run("20260101-000000.000", "").unwrap();

        let id: TestId = "generic/005".parse().unwrap();
        let (mut stdout, _stderr) = writer.open_sinks(&id).unwrap();
        let big = vec![b'x'; EXCERPT_LIMIT * 2];
        stdout.write(&big).unwrap();
        stdout.write(b"END").unwrap();
        stdout.finish().unwrap();

        let excerpt = stdout.excerpt();
        assert_eq!(excerpt.len(), EXCERPT_LIMIT);
        assert!(excerpt.ends_with("END"));

        let on_disk = fs::read(writer.test_dir(&id).join("stdout")).unwrap();
        assert_eq!(on_disk.len(), EXCERPT_LIMIT * 2 + 3);
    }
}
