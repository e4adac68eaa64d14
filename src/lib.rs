//! # hpc-grader
//!
//! A grading harness for performance-oriented programming assignments.
//!
//! A run compiles a contestant's program, pins it to a set of isolated CPU cores, executes each
//! test case under a wall-clock limit, checks the output for correctness and maps the measured
//! performance (a time or a throughput) through a scoring curve. The per-case results are
//! written once to a YAML result file.
//!
//! It provides:
//! - Core discovery and selection through `taskset` ([`cores`])
//! - Pinned, time-limited process execution ([`runner`])
//! - Extraction of checksums, timings and labelled metrics from output ([`parser`])
//! - Scoring curves ([`curve`]) and result records ([`record`])
//! - Declarative evaluators as YAML suite files ([`suite`], [`validate`])
//! - The orchestration itself ([`harness`])
//!
//! # Documentation Overview
//!
//! - For the stages of a run and how failures are recorded, see the [`harness`] module.
//! - For the suite file format, see [`suite`].
//! - For environment variables and flags, see
//! [`Configuration`](crate::configuration::Configuration).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::path::Path;
//! use hpc_grader::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let suite = Suite::load(Path::new("bitmatrix/suite.yaml"))?;
//!
//!     // Allow running unpinned on machines without `taskset`
//!     let config = Configuration::new().with_allow_uncontained(true);
//!
//!     let report = Harness::new(suite, config).run()?;
//!     for (case, result) in report.results.iter() {
//!         println!("{case}: {result}");
//!     }
//!     println!("total: {:.2}", report.total());
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;
pub mod configuration;
pub mod cores;
pub mod curve;
pub mod harness;
mod logger;
pub mod parser;
pub mod record;
pub mod runner;
pub mod suite;
pub mod validate;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use hpc_grader::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`Harness`](crate::harness::Harness) and its [`HarnessReport`](crate::harness::HarnessReport)
/// - [`Suite`](crate::suite::Suite)
/// - result types and the [`ResultSink`](crate::record::ResultSink) trait
/// - core selection types and the [`CoreProber`](crate::cores::CoreProber) trait
pub mod prelude {
    pub use crate::configuration::Configuration;
    pub use crate::cores::{CoreProber, CoreSet, FixedProber, TasksetProber};
    pub use crate::curve::ScoreCurve;
    pub use crate::harness::{Harness, HarnessReport};
    pub use crate::record::{AggregateResult, ResultSink, ScoreResult, YamlResultFile};
    pub use crate::suite::Suite;
}
