//! fstests test collection.
//!
//! Expands the `[test_selection]` rules against an fstests checkout. The
//! checkout lays tests out as `tests/<suite>/<name>` scripts with expected
//! output in `<name>.out` and group membership in the suite's `group.list`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::test::{Test, TestId};

/// Result type for collection operations.
pub type CollectResult<T> = Result<T, CollectError>;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("not an fstests checkout (no tests/ directory): {0}")]
    MissingTree(PathBuf),

    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CollectError {
    CollectError::Io {
        path: path.into(),
        source,
    }
}

/// A concrete fstests test: identity plus iteration index. The command to
/// run it is synthesized by the supervisor backend from the identity.
#[derive(Debug, Clone)]
pub struct FsTest {
    id: TestId,
    iteration: u32,
}

impl FsTest {
    pub fn new(id: TestId) -> Self {
        Self { id, iteration: 1 }
    }

    /// A clone of this test under a different iteration index.
    pub fn with_iteration(&self, iteration: u32) -> Self {
        Self {
            id: self.id.clone(),
            iteration: iteration.max(1),
        }
    }
}

impl Test for FsTest {
    fn id(&self) -> &TestId {
        &self.id
    }

    fn iteration(&self) -> u32 {
        self.iteration
    }
}

/// Selection rules, mirroring `[test_selection]`.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Test patterns: `btrfs/001`, `generic/0?3`, `generic/*`, or a bare
    /// suite name meaning the whole suite.
    pub tests: Vec<String>,
    /// Group names from the suites' `group.list` files, e.g. `quick`.
    pub groups: Vec<String>,
    pub exclude_tests: Vec<String>,
    /// File of exclusion patterns, one per line, `#` comments.
    pub exclude_tests_file: Option<PathBuf>,
    pub exclude_groups: Vec<String>,
}

impl Selection {
    fn is_empty(&self) -> bool {
        self.tests.is_empty() && self.groups.is_empty()
    }
}

/// Scans an fstests checkout and expands selections into test lists.
pub struct Collector {
    root: PathBuf,
}

impl Collector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Expands the selection into a lexicographically sorted test list.
    ///
    /// An empty selection means every discovered test. Scheduling decides
    /// the execution order later; sorted output here keeps `list` stable.
    pub fn collect(&self, selection: &Selection) -> CollectResult<Vec<FsTest>> {
        let all = self.scan()?;
        let groups = self.load_groups()?;

        let mut selected: BTreeSet<TestId> = if selection.is_empty() {
            all.iter().cloned().collect()
        } else {
            let mut set = BTreeSet::new();
            for pattern in &selection.tests {
                let pattern = normalize_pattern(pattern);
                let before = set.len();
                set.extend(
                    all.iter()
                        .filter(|id| glob_match(&pattern, id.as_str()))
                        .cloned(),
                );
                if set.len() == before {
                    warn!(%pattern, "test pattern matched nothing");
                }
            }
            for group in &selection.groups {
                let before = set.len();
                set.extend(
                    all.iter()
                        .filter(|id| groups.get(id).is_some_and(|g| g.contains(group)))
                        .cloned(),
                );
                if set.len() == before {
                    warn!(%group, "group matched nothing");
                }
            }
            set
        };

        let mut exclude_patterns: Vec<String> = selection
            .exclude_tests
            .iter()
            .map(|p| normalize_pattern(p))
            .collect();
        if let Some(path) = &selection.exclude_tests_file {
            let content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
            exclude_patterns.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(normalize_pattern),
            );
        }

        selected.retain(|id| {
            !exclude_patterns
                .iter()
                .any(|pattern| glob_match(pattern, id.as_str()))
        });
        selected.retain(|id| {
            !selection.exclude_groups.iter().any(|group| {
                groups.get(id).is_some_and(|g| g.contains(group))
            })
        });

        debug!(count = selected.len(), "collected tests");
        Ok(selected.into_iter().map(FsTest::new).collect())
    }

    /// Walks `tests/<suite>/` for test scripts. Expected-output files
    /// (`NNN.out`, `NNN.out.linux`) and group lists are not tests.
    fn scan(&self) -> CollectResult<Vec<TestId>> {
        let tests_dir = self.root.join("tests");
        if !tests_dir.is_dir() {
            return Err(CollectError::MissingTree(self.root.clone()));
        }

        let mut found = Vec::new();
        for suite_entry in fs::read_dir(&tests_dir).map_err(|e| io_err(&tests_dir, e))? {
            let suite_entry = suite_entry.map_err(|e| io_err(&tests_dir, e))?;
            if !suite_entry.file_type().map_err(|e| io_err(&tests_dir, e))?.is_dir() {
                continue;
            }
            let suite = suite_entry.file_name().to_string_lossy().into_owned();

            let suite_dir = suite_entry.path();
            for entry in fs::read_dir(&suite_dir).map_err(|e| io_err(&suite_dir, e))? {
                let entry = entry.map_err(|e| io_err(&suite_dir, e))?;
                if !entry.file_type().map_err(|e| io_err(&suite_dir, e))?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                // Test scripts are purely numeric; this skips Makefiles,
                // group lists, and NNN.out expectations in one go.
                if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                    continue;
                }
                found.push(TestId::new(&suite, &name));
            }
        }

        found.sort();
        Ok(found)
    }

    /// Parses group membership from each suite's `group.list` (or the
    /// older `group` file): one test per line, name first, groups after.
    fn load_groups(&self) -> CollectResult<BTreeMap<TestId, HashSet<String>>> {
        let tests_dir = self.root.join("tests");
        let mut map = BTreeMap::new();

        for suite_entry in fs::read_dir(&tests_dir).map_err(|e| io_err(&tests_dir, e))? {
            let suite_entry = suite_entry.map_err(|e| io_err(&tests_dir, e))?;
            if !suite_entry.file_type().map_err(|e| io_err(&tests_dir, e))?.is_dir() {
                continue;
            }
            let suite = suite_entry.file_name().to_string_lossy().into_owned();

            let list = ["group.list", "group"]
                .into_iter()
                .map(|f| suite_entry.path().join(f))
                .find(|p| p.is_file());
            let Some(list) = list else { continue };

            let content = fs::read_to_string(&list).map_err(|e| io_err(&list, e))?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut tokens = line.split_whitespace();
                let Some(name) = tokens.next() else { continue };
                let groups: HashSet<String> = tokens.map(str::to_string).collect();
                map.insert(TestId::new(&suite, name), groups);
            }
        }

        Ok(map)
    }
}

/// A bare suite name selects the whole suite.
fn normalize_pattern(pattern: &str) -> String {
    let pattern = pattern.trim();
    if pattern.contains('/') {
        pattern.to_string()
    } else {
        format!("{pattern}/*")
    }
}

/// Shell-style wildcard match: `*` spans any run, `?` one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
