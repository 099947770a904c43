//! fstorm CLI - parallel fstests runner.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fstorm::collect::{CollectError, Collector, FsTest};
use fstorm::compare;
use fstorm::config::{self, Config};
use fstorm::dispatch::Dispatcher;
use fstorm::events::EventSink;
use fstorm::report;
use fstorm::schedule::{self, ScheduleOptions};
use fstorm::store::{self, ResultStore, SourceRef};
use fstorm::supervisor::local::LocalSupervisor;
use fstorm::{Test, TestId, TestStatus};

/// Exit code for configuration errors, after sysexits EX_USAGE.
const EXIT_CONFIG: i32 = 64;

#[derive(Parser)]
#[command(name = "fstorm")]
#[command(about = "Parallel fstests runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fstorm.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the selected tests (the default when no subcommand is given)
    Run(RunArgs),

    /// Create a named recording of the latest run
    Record {
        /// Label for the recording; the run timestamp if omitted
        label: Option<String>,

        /// Replace an existing recording with the same label
        #[arg(long)]
        force: bool,
    },

    /// Diff two recorded runs and report regressions
    Compare {
        /// Baseline run: a label, `latest`, or `-k`
        #[arg(short = 'a', default_value = "-2", allow_hyphen_values = true)]
        baseline: String,

        /// Changed run
        #[arg(short = 'b', default_value = "-1", allow_hyphen_values = true)]
        changed: String,
    },

    /// Print the matched tests without running them
    List,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Test patterns, overriding the configured selection
    #[arg(long = "test", value_name = "PATTERN")]
    tests: Vec<String>,

    /// Group names, overriding the configured selection
    #[arg(long = "group", value_name = "GROUP")]
    groups: Vec<String>,

    /// Supervisor pool size
    #[arg(long)]
    pool_size: Option<usize>,

    /// Per-test timeout in seconds
    #[arg(long)]
    test_timeout: Option<u64>,

    /// Retry budget for failing tests
    #[arg(long)]
    retry_failures: Option<u32>,

    /// Run every selected test N times
    #[arg(long)]
    iterate: Option<u32>,

    /// Shuffle the selection before scheduling
    #[arg(long)]
    randomize: bool,

    /// Duration source for largest-first ordering (label, `latest`, `-k`)
    #[arg(long, value_name = "SOURCE", allow_hyphen_values = true)]
    slowest_first: Option<String>,

    /// Restrict the run to tests that were failing in SOURCE
    #[arg(long, value_name = "SOURCE", allow_hyphen_values = true)]
    rerun_failures: Option<String>,

    /// Results directory
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Record the run under LABEL when it completes
    #[arg(long, value_name = "LABEL")]
    record: Option<String>,

    /// Leave supervisors running after the run, for debugging
    #[arg(long)]
    keep_alive: bool,
}

/// Error class that maps to [`EXIT_CONFIG`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

fn usage(message: impl Into<String>) -> anyhow::Error {
    UsageError(message.into()).into()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "fstorm=debug"
    } else {
        "fstorm=info"
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let outcome = match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_tests(config, args, cli.verbose).await,
        Commands::Record { label, force } => record_run(&config, label.as_deref(), force),
        Commands::Compare { baseline, changed } => compare_runs(&config, &baseline, &changed),
        Commands::List => list_tests(&config),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = if e.downcast_ref::<UsageError>().is_some() {
                EXIT_CONFIG
            } else {
                1
            };
            std::process::exit(code);
        }
    }
}

fn merge_cli(config: &mut Config, args: RunArgs) {
    if !args.tests.is_empty() {
        config.test_selection.tests = args.tests;
    }
    if !args.groups.is_empty() {
        config.test_selection.groups = args.groups;
    }
    if let Some(pool_size) = args.pool_size {
        config.test_runner.pool_size = pool_size;
    }
    if let Some(test_timeout) = args.test_timeout {
        config.test_runner.test_timeout = test_timeout;
    }
    if let Some(retry_failures) = args.retry_failures {
        config.test_runner.retry_failures = retry_failures;
    }
    if let Some(iterate) = args.iterate {
        config.test_selection.iterate = iterate;
    }
    if args.randomize {
        config.test_selection.randomize = true;
    }
    if args.slowest_first.is_some() {
        config.test_selection.slowest_first = args.slowest_first;
    }
    if args.rerun_failures.is_some() {
        config.test_selection.rerun_failures = args.rerun_failures;
    }
    if args.results_dir.is_some() {
        config.output.results_dir = args.results_dir;
    }
    if args.record.is_some() {
        config.output.record = args.record;
    }
    if args.keep_alive {
        config.test_runner.keep_alive = true;
    }
}

fn fstests_root(config: &Config) -> Result<PathBuf> {
    config
        .fstests
        .clone()
        .ok_or_else(|| usage("`fstests` is not set in the configuration"))
}

fn collect_tests(config: &Config) -> Result<Vec<FsTest>> {
    let root = fstests_root(config)?;
    Collector::new(&root)
        .collect(&config.selection())
        .map_err(|e| match e {
            CollectError::MissingTree(path) => {
                usage(format!("not an fstests checkout: {}", path.display()))
            }
            other => anyhow::Error::from(other),
        })
}

/// Opens the configured persistent store, failing for subcommands that
/// cannot work without one.
fn open_store(config: &Config) -> Result<ResultStore> {
    let dir = config
        .output
        .results_dir
        .as_ref()
        .ok_or_else(|| usage("this operation requires `output.results_dir`"))?;
    Ok(ResultStore::open(dir)?)
}

fn parse_source(text: &str) -> Result<SourceRef> {
    text.parse::<SourceRef>().map_err(|e| usage(e.to_string()))
}

fn statuses_from(
    results_store: &ResultStore,
    source: &SourceRef,
) -> Result<std::collections::BTreeMap<TestId, TestStatus>> {
    let run_dir = results_store.resolve(source)?;
    let results = store::load_results(&run_dir)?;
    Ok(store::final_statuses(&results))
}

async fn run_tests(mut config: Config, args: RunArgs, verbose: bool) -> Result<i32> {
    merge_cli(&mut config, args);

    let fstests = fstests_root(&config)?;
    let tests = collect_tests(&config)?;
    info!("matched {} tests", tests.len());

    let persistent = config.output.results_dir.is_some();
    let (results_store, ephemeral_dir) = match &config.output.results_dir {
        Some(dir) => (ResultStore::open(dir)?, None),
        None => {
            let (results_store, dir) = ResultStore::open_ephemeral()?;
            (results_store, Some(dir))
        }
    };
    // Keeps a throwaway store alive until the run is over.
    let _ephemeral_dir = ephemeral_dir;

    let mut options = ScheduleOptions {
        iterate: config.test_selection.iterate,
        randomize: config.test_selection.randomize,
        ..Default::default()
    };
    if let Some(source) = &config.test_selection.slowest_first {
        if !persistent {
            return Err(usage("`slowest_first` requires `output.results_dir`"));
        }
        let run_dir = results_store.resolve(&parse_source(source)?)?;
        let results = store::load_results(&run_dir)
            .with_context(|| format!("loading durations from {}", run_dir.display()))?;
        options.slowest_first = Some(store::latest_durations(&results));
    }
    if let Some(source) = &config.test_selection.rerun_failures {
        if !persistent {
            return Err(usage("`rerun_failures` requires `output.results_dir`"));
        }
        let statuses = statuses_from(&results_store, &parse_source(source)?)?;
        options.rerun_only = Some(schedule::rerun_set(&statuses));
    }

    let items = schedule::build_work_list(tests, &options, |t, i| t.with_iteration(i));
    info!("dispatching {} work items", items.len());

    let pool: Vec<LocalSupervisor> = (0..config.test_runner.pool_size.max(1))
        .map(|i| {
            LocalSupervisor::new(format!("sv{i}"), &fstests)
                .with_sections(config.test_selection.section.clone())
                .with_exclude_sections(config.test_selection.exclude_section.clone())
                .with_dmesg(config.test_runner.dmesg)
        })
        .collect();

    let writer = results_store.begin_run(&ResultStore::new_run_id(), &config.to_toml())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, draining");
                cancel.cancel();
            }
        }
    });

    let (events, rx) = EventSink::channel(256);
    let progress = tokio::spawn(report::run_progress(rx, items.len(), verbose));

    let dispatcher = Dispatcher::new(config.dispatch_policy(), &writer, events);
    let summary = dispatcher.run(pool, items, cancel).await?;
    let _ = progress.await;

    report::print_summary(&summary, &config.output);

    if let Some(label) = &config.output.record {
        if !persistent {
            warn!("`output.record` requires `output.results_dir`; skipping recording");
        } else if summary.cancelled {
            warn!("run was cancelled; skipping recording");
        } else {
            let link = results_store.create_recording(Some(label), false)?;
            info!("recorded {}", link.display());
        }
    }

    if let Some(source) = &config.output.compare_to {
        if persistent {
            let baseline = statuses_from(&results_store, &parse_source(source)?)?;
            let changed = store::final_statuses(&store::load_results(writer.run_dir())?);
            report::print_comparison(&compare::compare(&baseline, &changed));
        } else {
            warn!("`output.compare_to` requires `output.results_dir`; skipping comparison");
        }
    }

    Ok(summary.exit_code())
}

fn record_run(config: &Config, label: Option<&str>, force: bool) -> Result<i32> {
    let results_store = open_store(config)?;
    let link = results_store.create_recording(label, force)?;
    let target = link.canonicalize().unwrap_or_else(|_| link.clone());
    println!("recorded {} -> {}", link.display(), target.display());
    Ok(0)
}

fn compare_runs(config: &Config, baseline: &str, changed: &str) -> Result<i32> {
    let results_store = open_store(config)?;
    let baseline = statuses_from(&results_store, &parse_source(baseline)?)?;
    let changed = statuses_from(&results_store, &parse_source(changed)?)?;

    let diff = compare::compare(&baseline, &changed);
    report::print_comparison(&diff);
    Ok(diff.exit_code())
}

fn list_tests(config: &Config) -> Result<i32> {
    let tests = collect_tests(config)?;
    for test in &tests {
        println!("{}", test.id());
    }
    info!("{} tests matched", tests.len());
    Ok(0)
}
