//! Terminal reporting.
//!
//! Two halves: a live progress consumer driven by the event stream, and
//! the end-of-run summary printer. Both write to the terminal; structured
//! consumers should read the journal instead.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::compare::Comparison;
use crate::config::OutputConfig;
use crate::dispatch::RunSummary;
use crate::events::Event;
use crate::test::{TestResult, TestStatus};

/// Consumes the event stream and renders live progress. Returns once
/// `RunComplete` arrives or the stream closes.
pub async fn run_progress(mut rx: mpsc::Receiver<Event>, total: usize, verbose: bool) {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
    );

    while let Some(event) = rx.recv().await {
        match event {
            Event::TestStarted {
                test_id,
                supervisor_id,
                ..
            } => {
                if verbose {
                    pb.println(format!("{supervisor_id}: running {test_id}"));
                }
            }
            Event::TestRetried {
                test_id,
                next_attempt,
                ..
            } => {
                pb.println(format!(
                    "{} {test_id} (attempt {next_attempt})",
                    style("RETRY").yellow()
                ));
            }
            Event::TestFinished { result } => {
                pb.inc(1);
                let label = status_label(result.status);
                if verbose || !result.status.is_success() {
                    pb.println(format!(
                        "{label} {} ({:.1}s)",
                        result.test_id, result.duration_seconds
                    ));
                }
            }
            Event::Cancelled { .. } => {
                pb.inc(1);
            }
            Event::SupervisorUp { supervisor_id } => {
                if verbose {
                    pb.println(format!("{supervisor_id}: up"));
                }
            }
            Event::SupervisorDown { supervisor_id } => {
                pb.println(format!(
                    "{} supervisor {supervisor_id} went down",
                    style("WARN").red()
                ));
            }
            Event::SupervisorRestarted { supervisor_id } => {
                pb.println(format!("{supervisor_id}: restarted"));
            }
            Event::RunComplete => break,
        }
    }
    pb.finish_and_clear();
}

fn status_label(status: TestStatus) -> console::StyledObject<&'static str> {
    match status {
        TestStatus::Passed => style("PASS").green(),
        TestStatus::Failed => style("FAIL").red(),
        TestStatus::Skipped => style("SKIP").yellow(),
        TestStatus::Errored => style("ERR ").red().bold(),
        TestStatus::TimedOut => style("TIME").red(),
        TestStatus::NotRun => style("----").dim(),
    }
}

/// Prints the end-of-run summary: counts by status and the optional
/// failure list, slowest tests, and duration histogram.
pub fn print_summary(summary: &RunSummary, output: &OutputConfig) {
    println!();
    println!("Test results:");
    println!("  Total:     {}", summary.total);
    println!("  Passed:    {}", style(summary.passed).green());
    println!("  Failed:    {}", style(summary.failed).red());
    println!("  Skipped:   {}", style(summary.skipped).yellow());
    if summary.timed_out > 0 {
        println!("  Timed out: {}", style(summary.timed_out).red());
    }
    if summary.errored > 0 {
        println!("  Errored:   {}", style(summary.errored).red().bold());
    }
    if summary.not_run > 0 {
        println!("  Not run:   {}", style(summary.not_run).dim());
    }
    println!("  Duration:  {:.1}s", summary.duration.as_secs_f64());

    if output.print_failure_list {
        print_failure_list(&summary.results);
    }
    if output.print_n_slowest > 0 {
        print_slowest(&summary.results, output.print_n_slowest);
    }
    if output.print_duration_hist {
        print_histogram(&summary.results);
    }

    println!();
    if summary.cancelled {
        println!("{}", style("Run cancelled.").yellow().bold());
    } else if summary.success() {
        println!("{}", style("All tests passed.").green().bold());
    } else if summary.errored > 0 {
        println!(
            "{}",
            style("Infrastructure errors occurred; see the failure list.")
                .red()
                .bold()
        );
    } else {
        println!("{}", style("Some tests failed.").red().bold());
    }
}

fn print_failure_list(results: &[TestResult]) {
    let failures: Vec<&TestResult> = results
        .iter()
        .filter(|r| {
            matches!(
                r.status,
                TestStatus::Failed | TestStatus::Errored | TestStatus::TimedOut
            )
        })
        .collect();
    if failures.is_empty() {
        return;
    }

    println!();
    println!("Failures:");
    for result in failures {
        println!(
            "  {} {} (attempt {}, on {})",
            status_label(result.status),
            result.test_id,
            result.attempt_index,
            result.supervisor_id
        );
        if let Some(error) = result.diagnostics.get("error") {
            println!("    {}", style(error).dim());
        }
        for line in result.stderr_excerpt.lines().rev().take(3).collect::<Vec<_>>().into_iter().rev() {
            println!("    {}", style(line).dim());
        }
    }
}

fn print_slowest(results: &[TestResult], n: usize) {
    let mut ranked: Vec<&TestResult> = results
        .iter()
        .filter(|r| r.status != TestStatus::NotRun)
        .collect();
    ranked.sort_by(|a, b| b.duration_seconds.total_cmp(&a.duration_seconds));

    println!();
    println!("Slowest tests:");
    for result in ranked.into_iter().take(n) {
        println!("  {:>8.1}s  {}", result.duration_seconds, result.test_id);
    }
}

/// Fixed-width text histogram of test durations, bucketed linearly.
fn print_histogram(results: &[TestResult]) {
    let durations: Vec<f64> = results
        .iter()
        .filter(|r| r.status != TestStatus::NotRun)
        .map(|r| r.duration_seconds)
        .collect();
    if durations.is_empty() {
        return;
    }

    let max = durations.iter().cloned().fold(f64::MIN, f64::max);
    let buckets = 6usize;
    let width = (max / buckets as f64).max(0.1);
    let mut counts = vec![0usize; buckets];
    for d in &durations {
        let idx = ((d / width) as usize).min(buckets - 1);
        counts[idx] += 1;
    }
    let tallest = counts.iter().copied().max().unwrap_or(1).max(1);

    println!();
    println!("Duration histogram:");
    for (i, count) in counts.iter().enumerate() {
        let low = width * i as f64;
        let high = width * (i + 1) as f64;
        let bar_len = (count * 40).div_ceil(tallest).min(40);
        println!(
            "  {low:>7.1}s - {high:>7.1}s  {:<40} {count}",
            "#".repeat(if *count == 0 { 0 } else { bar_len })
        );
    }
}

/// Prints the regression summary of a comparison.
pub fn print_comparison(diff: &Comparison) {
    println!();
    println!(
        "Comparison: {} baseline tests, {} changed tests",
        diff.baseline_total, diff.changed_total
    );

    let sets: [(&str, &Vec<crate::test::TestId>, console::Color); 4] = [
        ("Regressions", &diff.regressions, console::Color::Red),
        ("Progressions", &diff.progressions, console::Color::Green),
        ("New", &diff.new, console::Color::Cyan),
        ("Removed", &diff.removed, console::Color::Yellow),
    ];
    for (name, ids, color) in sets {
        println!("  {} ({}):", style(name).fg(color), ids.len());
        for id in ids {
            println!("    {id}");
        }
    }

    println!();
    if diff.has_regressions() {
        println!("{}", style("Regressions detected.").red().bold());
    } else {
        println!("{}", style("No regressions.").green().bold());
    }
}
