//! Reading what the test runner tells us: console banners and summaries, and the
//! structured results artifact it may leave behind.

use crate::filter::relative_slash_path;
use crate::model::{RunMetrics, TestCounts};
use eyre::{Result, WrapErr};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the results artifact inside the per-project results directory.
pub const RESULTS_FILE_NAME: &str = "json-result.json";

/// Remove ANSI escape sequences (CSI and OSC) from runner output.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // parameters and intermediates, then one final byte in @..~
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerOutcome {
    Pass,
    Fail,
}

/// A `PASS <path>` / `FAIL <path>` line printed when a spec finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner<'a> {
    pub outcome: BannerOutcome,
    pub path: &'a str,
}

/// Parse a banner from an ANSI-stripped line.
pub fn parse_banner(line: &str) -> Option<Banner<'_>> {
    let line = line.trim_start();
    let (outcome, rest) = if let Some(rest) = line.strip_prefix("PASS") {
        (BannerOutcome::Pass, rest)
    } else if let Some(rest) = line.strip_prefix("FAIL") {
        (BannerOutcome::Fail, rest)
    } else {
        return None;
    };
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let path = rest.split_whitespace().next()?;
    Some(Banner { outcome, path })
}

/// Which of `specs` (workspace-relative, `/`-separated) a banner path refers to.
///
/// Runners print paths relative to whatever directory they ran in, so match on suffix.
pub fn match_banner_spec<'s>(specs: &'s [String], banner_path: &str) -> Option<&'s str> {
    let banner_path = banner_path.trim_start_matches("./");
    specs
        .iter()
        .find(|spec| {
            spec.as_str() == banner_path
                || spec.ends_with(&format!("/{banner_path}"))
                || banner_path.ends_with(&format!("/{spec}"))
        })
        .map(String::as_str)
}

fn count_pairs(line: &str, mut on_pair: impl FnMut(&str, u32)) {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect();
    for pair in tokens.windows(2) {
        if let Ok(n) = pair[0].parse::<u32>() {
            on_pair(pair[1], n);
        }
    }
}

fn last_line_starting_with<'a>(output: &'a str, prefix: &str) -> Option<&'a str> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with(prefix))
}

/// Counts from the last `Tests:` summary line, e.g.
/// `Tests:       45 passed, 2 failed, 1 skipped, 48 total`.
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    let line = last_line_starting_with(output, "Tests:")?;

    let mut counts = TestCounts::default();
    let mut total = None;
    let mut seen = false;
    count_pairs(line, |word, n| {
        match word {
            "passed" => counts.passed = n,
            "failed" => counts.failed = n,
            "skipped" => counts.skipped = n,
            "total" => total = Some(n),
            _ => return,
        }
        seen = true;
    });

    if !seen {
        return None;
    }
    counts.total = total.unwrap_or(counts.passed + counts.failed + counts.skipped);
    Some(counts)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuiteCounts {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
}

/// Counts from the last `Test Suites:` line. Useful when a suite fails to compile
/// and the `Tests:` line reports nothing.
pub fn parse_suite_counts(output: &str) -> Option<SuiteCounts> {
    let line = last_line_starting_with(output, "Test Suites:")?;

    let mut counts = SuiteCounts::default();
    count_pairs(line, |word, n| match word {
        "passed" => counts.passed = n,
        "failed" => counts.failed = n,
        "total" => counts.total = n,
        _ => {}
    });

    (counts.total > 0).then_some(counts)
}

/// The slice of output belonging to one failing spec: from its `FAIL` banner up to
/// the next banner, or the suite summary when it was the last one.
pub fn extract_spec_failure_output(output: &str, spec_rel_path: &str) -> Option<String> {
    let file_name = spec_rel_path.rsplit('/').next().unwrap_or(spec_rel_path);
    let lines: Vec<&str> = output.lines().collect();

    let start = lines.iter().position(|line| {
        parse_banner(line).is_some_and(|b| b.outcome == BannerOutcome::Fail)
            && line.contains(file_name)
    })?;

    let following = &lines[start + 1..];
    let end = following
        .iter()
        .position(|l| parse_banner(l).is_some())
        .or_else(|| {
            following
                .iter()
                .position(|l| l.trim_start().starts_with("Test Suites:"))
        })
        .unwrap_or(following.len());

    Some(lines[start..start + 1 + end].join("\n").trim().to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResultsSummary {
    pub tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub pending: u32,
    pub skipped: u32,
    pub start: u64,
    pub stop: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultTest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub failure_messages: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsBody {
    #[serde(default)]
    pub summary: Option<ResultsSummary>,
    #[serde(default)]
    pub tests: Vec<ResultTest>,
}

/// The `json-result.json` artifact written by the runner's JSON reporter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsFile {
    pub results: ResultsBody,
}

impl ResultsFile {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).wrap_err("failed to parse test results")
    }

    /// Per-spec metrics keyed by workspace-relative path.
    ///
    /// A spec counts as failed (exit code 1) if any of its tests failed; its duration
    /// is the sum of its tests' durations. `pending` counts as skipped.
    pub fn per_spec_metrics(&self, workspace_root: &Path, last_run: &str) -> BTreeMap<String, RunMetrics> {
        #[derive(Default)]
        struct Acc {
            counts: TestCounts,
            duration_ms: f64,
        }

        let mut by_file: BTreeMap<String, Acc> = BTreeMap::new();
        for test in &self.results.tests {
            let Some(file_path) = test.file_path.as_deref().filter(|p| !p.is_empty()) else {
                continue;
            };
            let acc = by_file
                .entry(relative_slash_path(workspace_root, Path::new(file_path)))
                .or_default();
            match test.status.as_str() {
                "passed" => acc.counts.passed += 1,
                "failed" => acc.counts.failed += 1,
                "pending" | "skipped" => acc.counts.skipped += 1,
                _ => {}
            }
            acc.duration_ms += test.duration.unwrap_or(0.0);
        }

        by_file
            .into_iter()
            .map(|(rel, mut acc)| {
                acc.counts.total = acc.counts.passed + acc.counts.failed + acc.counts.skipped;
                let metrics = RunMetrics {
                    last_run: last_run.to_string(),
                    exit_code: if acc.counts.failed > 0 { 1 } else { 0 },
                    duration_ms: acc.duration_ms.max(0.0).round() as u64,
                    test_counts: Some(acc.counts),
                };
                (rel, metrics)
            })
            .collect()
    }

    /// Failing tests for one spec, or `None` if it has no recorded failures.
    pub fn failure_details(&self, spec_abs_path: &Path) -> Option<SpecFailureDetails> {
        let wanted = spec_abs_path.to_string_lossy().replace('\\', "/");

        let mut details = SpecFailureDetails {
            spec: spec_abs_path.to_path_buf(),
            failing_tests: Vec::new(),
            total_failed: 0,
            total_passed: 0,
        };
        for test in &self.results.tests {
            let Some(file_path) = test.file_path.as_deref() else {
                continue;
            };
            if file_path.replace('\\', "/") != wanted {
                continue;
            }
            match test.status.as_str() {
                "passed" => details.total_passed += 1,
                "failed" => {
                    details.total_failed += 1;
                    details.failing_tests.push(FailingTest {
                        name: test.name.clone(),
                        message: (!test.failure_messages.is_empty())
                            .then(|| test.failure_messages.join("\n")),
                    });
                }
                _ => {}
            }
        }

        (details.total_failed > 0).then_some(details)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailingTest {
    pub name: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecFailureDetails {
    pub spec: PathBuf,
    pub failing_tests: Vec<FailingTest>,
    pub total_failed: u32,
    pub total_passed: u32,
}

/// What a finished run means for the cache and for `last_failed_specs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// One entry per requested spec, keyed by workspace-relative path
    pub metrics: Vec<(String, RunMetrics)>,
    pub failed_specs: Vec<PathBuf>,
}

/// Combine structured results (when available) with the process exit status.
///
/// Specs the results don't mention inherit the overall exit code and duration.
pub fn reconcile_run(
    workspace_root: &Path,
    specs: &[PathBuf],
    per_spec: Option<&BTreeMap<String, RunMetrics>>,
    exit_code: i32,
    duration_ms: u64,
    last_run: &str,
) -> RunOutcome {
    let mut metrics = Vec::with_capacity(specs.len());
    let mut failed_specs = Vec::new();

    for spec in specs {
        let rel = relative_slash_path(workspace_root, spec);
        let m = per_spec
            .and_then(|results| results.get(&rel).cloned())
            .unwrap_or_else(|| RunMetrics {
                last_run: last_run.to_string(),
                exit_code,
                duration_ms,
                test_counts: None,
            });
        if !m.passed() {
            failed_specs.push(spec.clone());
        }
        metrics.push((rel, m));
    }

    RunOutcome {
        metrics,
        failed_specs,
    }
}
