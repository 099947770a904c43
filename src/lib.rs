//! # fstorm
//!
//! A parallel fstests runner. fstorm drains a file-system test suite
//! across a pool of disposable supervisors (typically VMs), collects
//! per-test outcomes and artifacts into an on-disk result store, and
//! diffs runs against recorded baselines.
//!
//! ## Architecture
//!
//! The core composes two contracts so backends plug in without the
//! dispatcher knowing about file systems, VMs, or SSH:
//!
//! - [`Test`](test::Test): names a test; executed *by* a supervisor.
//! - [`Supervisor`](supervisor::Supervisor): a scoped worker resource
//!   running one test at a time, with liveness probing and restart.
//!
//! Around them:
//!
//! - [`dispatch`]: the work-dispatch engine: shared FIFO queue, one
//!   worker per supervisor, bounded retries, poison-pill isolation, a
//!   liveness prober, and cancellation.
//! - [`store`]: the on-disk result store with a `latest` pointer and
//!   named recordings.
//! - [`compare`]: run-vs-run regression detection.
//! - [`schedule`]: duration-aware largest-first ordering.
//! - [`collect`]: fstests discovery (suites, groups, globs).
//! - [`events`] / [`report`]: the progress event stream and terminal
//!   rendering.
//!
//! ## Quick start
//!
//! ```no_run
//! use fstorm::collect::Collector;
//! use fstorm::dispatch::Dispatcher;
//! use fstorm::events::EventSink;
//! use fstorm::schedule::{self, ScheduleOptions};
//! use fstorm::store::ResultStore;
//! use fstorm::supervisor::local::LocalSupervisor;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = fstorm::config::load_config(std::path::Path::new("fstorm.toml"))?;
//!     let fstests = config.fstests.clone().expect("fstests path");
//!
//!     let tests = Collector::new(&fstests).collect(&config.selection())?;
//!     let items = schedule::build_work_list(tests, &ScheduleOptions::default(), |t, i| {
//!         t.with_iteration(i)
//!     });
//!
//!     let store = ResultStore::open("results")?;
//!     let writer = store.begin_run(&ResultStore::new_run_id(), &config.to_toml())?;
//!     let (events, _rx) = EventSink::channel(256);
//!
//!     let pool = vec![LocalSupervisor::new("sv0", &fstests)];
//!     let dispatcher = Dispatcher::new(config.dispatch_policy(), &writer, events);
//!     let summary = dispatcher.run(pool, items, CancellationToken::new()).await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod collect;
pub mod compare;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod report;
pub mod schedule;
pub mod store;
pub mod supervisor;
pub mod test;

// Re-export the types most embedders need.

pub use config::{Config, load_config};
pub use dispatch::{DispatchPolicy, Dispatcher, RunSummary};
pub use store::{ResultStore, SourceRef};
pub use supervisor::{Supervisor, SupervisorState};
pub use test::{Test, TestId, TestResult, TestStatus, WorkItem};
