//! Terminal rendering for the CLI

use owo_colors::OwoColorize;
use serde::Serialize;
use std::path::Path;
use testpick::cache::RunCache;
use testpick::orchestrator::{RunEnd, RunSummary};
use testpick::workspace::WorkspaceState;
use testpick_core::filter::relative_slash_path;
use testpick_core::report::{extract_spec_failure_output, parse_suite_counts, parse_test_counts};
use testpick_core::{ChangeStatus, ChangedFile, MissingSpecEntry, Project, RunMetrics, SpecStatus};

fn spec_badge(status: SpecStatus) -> String {
    let badge = format!("[{}]", status.badge());
    match status {
        SpecStatus::Unstaged => badge.yellow().to_string(),
        SpecStatus::Staged => badge.green().to_string(),
        SpecStatus::Committed => badge.blue().to_string(),
        SpecStatus::Regular => badge.dimmed().to_string(),
    }
}

fn change_badge(status: ChangeStatus) -> String {
    spec_badge(status.into())
}

fn format_duration(ms: u64) -> String {
    format!("{:.1}s", ms as f64 / 1000.0)
}

fn metrics_note(metrics: Option<&RunMetrics>) -> String {
    let Some(m) = metrics else {
        return "not run".dimmed().to_string();
    };
    let verdict = if m.passed() {
        "pass".green().to_string()
    } else {
        "fail".red().to_string()
    };
    let counts = m
        .test_counts
        .map(|c| format!(", {}/{} passed", c.passed, c.total))
        .unwrap_or_default();
    format!(
        "{} ({}{}, {})",
        verdict,
        format_duration(m.duration_ms),
        counts,
        m.last_run.dimmed()
    )
}

pub fn render_projects(projects: &[Project], root: &Path) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{} {} projects\n",
        "##".bold(),
        projects.len().to_string().cyan().bold()
    ));
    for p in projects {
        let runner = match p.runner {
            testpick_core::RunnerKind::Jest => p.runner.to_string().green().to_string(),
            testpick_core::RunnerKind::Karma => p.runner.to_string().yellow().to_string(),
            testpick_core::RunnerKind::Unknown => p.runner.to_string().dimmed().to_string(),
        };
        output.push_str(&format!(
            "   {} {} {}\n",
            p.name.bold(),
            runner,
            relative_slash_path(root, &p.root).dimmed()
        ));
    }
    output
}

pub fn render_changed(files: &[ChangedFile], base_ref: &str) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{} {} changed files against {}\n",
        "##".bold(),
        files.len().to_string().cyan().bold(),
        base_ref.cyan()
    ));
    for f in files {
        output.push_str(&format!("   {} {}\n", change_badge(f.status), f.rel_path));
    }
    output
}

fn render_missing(output: &mut String, root: &Path, missing: &[MissingSpecEntry]) {
    for m in missing {
        output.push_str(&format!(
            "   {} {} {} {}\n",
            "!".yellow().bold(),
            relative_slash_path(root, &m.source_abs_path),
            "has no spec, expected".dimmed(),
            relative_slash_path(root, &m.expected_spec_abs_path).yellow()
        ));
    }
}

pub fn render_status(state: &WorkspaceState, cache: &RunCache) -> String {
    let root = state.workspace_root.as_path();
    let resolution = &state.resolution;
    let mut output = String::new();

    output.push_str(&format!(
        "{} {} on {} against {}\n",
        "##".bold(),
        root.display().to_string().cyan().bold(),
        state.branch.cyan(),
        state.base_ref.cyan()
    ));
    output.push_str(&format!(
        "{} changed files, {} specs in {} projects, {} missing specs\n",
        state.changed_files.len(),
        resolution.spec_count(),
        resolution.projects.len(),
        resolution.missing_count()
    ));

    for project in &resolution.projects {
        output.push('\n');
        output.push_str(&format!(
            "{} {} ({})\n",
            "->".blue().bold(),
            project.name.bold(),
            project.runner
        ));
        for spec in &project.specs {
            let rel = relative_slash_path(root, &spec.abs_path);
            output.push_str(&format!(
                "   {} {} {}\n",
                spec_badge(spec.status),
                rel,
                metrics_note(cache.get(&rel))
            ));
        }
        render_missing(&mut output, root, &project.missing_specs);
    }

    if !resolution.missing_specs.is_empty() {
        output.push('\n');
        output.push_str(&format!(
            "{} outside any project\n",
            "->".blue().bold()
        ));
        render_missing(&mut output, root, &resolution.missing_specs);
    }

    output
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusSpecJson<'a> {
    path: String,
    status: SpecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_run: Option<&'a RunMetrics>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusMissingJson {
    source: String,
    expected_spec: String,
    source_status: ChangeStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusProjectJson<'a> {
    name: &'a str,
    runner: testpick_core::RunnerKind,
    root: String,
    specs: Vec<StatusSpecJson<'a>>,
    missing_specs: Vec<StatusMissingJson>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusJson<'a> {
    workspace_root: String,
    branch: &'a str,
    base_ref: &'a str,
    projects: Vec<StatusProjectJson<'a>>,
    missing_specs: Vec<StatusMissingJson>,
}

fn missing_json(root: &Path, missing: &[MissingSpecEntry]) -> Vec<StatusMissingJson> {
    missing
        .iter()
        .map(|m| StatusMissingJson {
            source: relative_slash_path(root, &m.source_abs_path),
            expected_spec: relative_slash_path(root, &m.expected_spec_abs_path),
            source_status: m.source_status,
        })
        .collect()
}

pub fn render_status_json(state: &WorkspaceState, cache: &RunCache) -> eyre::Result<String> {
    let root = state.workspace_root.as_path();
    let status = StatusJson {
        workspace_root: root.display().to_string(),
        branch: &state.branch,
        base_ref: &state.base_ref,
        projects: state
            .resolution
            .projects
            .iter()
            .map(|p| StatusProjectJson {
                name: &p.name,
                runner: p.runner,
                root: relative_slash_path(root, &p.root),
                specs: p
                    .specs
                    .iter()
                    .map(|s| {
                        let path = relative_slash_path(root, &s.abs_path);
                        let last_run = cache.get(&path);
                        StatusSpecJson {
                            path,
                            status: s.status,
                            last_run,
                        }
                    })
                    .collect(),
                missing_specs: missing_json(root, &p.missing_specs),
            })
            .collect(),
        missing_specs: missing_json(root, &state.resolution.missing_specs),
    };
    Ok(serde_json::to_string_pretty(&status)?)
}

pub fn render_cache(cache: &RunCache) -> String {
    let stats = cache.stats();
    let mut output = String::new();
    output.push_str(&format!(
        "{} {} cached specs in {}\n",
        "##".bold(),
        stats.entries.to_string().cyan().bold(),
        cache.path().display()
    ));
    if let Some(updated_at) = stats.updated_at {
        output.push_str(&format!("Last updated {}\n", updated_at.dimmed()));
    }
    for (rel, metrics) in cache.entries() {
        output.push_str(&format!("   {} {}\n", rel, metrics_note(Some(metrics))));
    }
    output
}

pub fn render_run_summary(summary: &RunSummary, root: &Path, verbose: bool) -> String {
    let mut output = String::new();
    let duration = format_duration(summary.duration_ms);

    match &summary.end {
        RunEnd::Cancelled => {
            output.push_str(&format!(
                "\n{} Run for {} cancelled after {}\n",
                "!".yellow().bold(),
                summary.project.cyan(),
                duration
            ));
            return output;
        }
        RunEnd::Failed { message } => {
            output.push_str(&format!(
                "\n{} Could not run tests for {}: {}\n",
                "x".red().bold(),
                summary.project.cyan(),
                message
            ));
            return output;
        }
        RunEnd::Completed { .. } => {}
    }

    let totals = parse_test_counts(&summary.output)
        .map(|c| {
            format!(
                " ({} passed, {} failed, {} skipped)",
                c.passed, c.failed, c.skipped
            )
        })
        .unwrap_or_default();

    if summary.succeeded() {
        output.push_str(&format!(
            "\n{} All specs passed for {} in {}{}\n",
            "OK".green().bold(),
            summary.project.cyan(),
            duration,
            totals
        ));
        return output;
    }

    let passed = summary.metrics.len().saturating_sub(summary.failed_specs.len());
    output.push_str(&format!(
        "\n{} {} spec(s) failed, {} passed for {} in {}{}\n",
        "x".red().bold(),
        summary.failed_specs.len(),
        passed,
        summary.project.cyan(),
        duration,
        totals
    ));
    if summary.failed_specs.is_empty()
        && let Some(suites) = parse_suite_counts(&summary.output)
        && suites.failed > 0
    {
        output.push_str(&format!(
            "   {} of {} suites failed to run\n",
            suites.failed, suites.total
        ));
    }
    for spec in &summary.failed_specs {
        let rel = relative_slash_path(root, spec);
        output.push_str(&format!("   {} {}\n", "x".red(), rel));
        if let Some(details) = summary.failures.iter().find(|d| &d.spec == spec) {
            for test in &details.failing_tests {
                output.push_str(&format!("      {} {}\n", "-".red(), test.name));
            }
        }
        if verbose && let Some(section) = extract_spec_failure_output(&summary.output, &rel) {
            for line in section.lines() {
                output.push_str(&format!("      {}\n", line.dimmed()));
            }
        }
    }
    output
}
