//! Suite files: the declarative description of one evaluator.
//!
//! A suite is a YAML document listing the build steps, the cores to reserve and the scored
//! test cases. Relative paths are resolved against the directory of the suite file.
//!
//! ```yaml
//! name: bitmatrix
//! compile:
//!   - command: clang++
//!     args: [-O3, -std=c++20, source_code/main.cpp, source_code/user.cpp, -o, build/user]
//! cores:
//!   count: 1
//! cases:
//!   - id: "1"
//!     weight: 20
//!     program:
//!       command: build/user
//!       args: ["512", "10000", "{seed}", "{key}"]
//!       timeout_secs: 3567.5
//!     reference:
//!       command: build/ref
//!       args: ["512", "1", "{seed}", "{key}"]
//!       timeout_secs: 5
//!     metric: { kind: mean_line }
//!     validation: { kind: checksum_match }
//!     curve: { family: power_law, tmin: 9.5, tmax: 237.5 }
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use lazy_regex::{regex, Regex};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    curve::ScoreCurve,
    parser::{self, MetricPattern, ParseError},
    runner::{timeout_from_secs, ExecutionOutcome, Invocation},
    validate::Validation,
};

/// A suite file could not be used.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// The file could not be read.
    #[error("could not read suite '{path}'")]
    Read {
        /// Suite file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a valid suite document.
    #[error("could not parse suite '{path}'")]
    Yaml {
        /// Suite file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },
    /// A case is inconsistent.
    #[error("case '{case}': {reason}")]
    InvalidCase {
        /// Case id.
        case: String,
        /// What is wrong.
        reason: String,
    },
    /// The suite as a whole is inconsistent.
    #[error("invalid suite: {0}")]
    Invalid(String),
}

/// One evaluator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    /// Display name.
    pub name: String,
    /// Directory the commands run in, relative to the suite file.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Result file, relative to the suite file.
    #[serde(default = "default_result_file")]
    pub result_file: PathBuf,
    /// Files that must exist (relative to the working directory) before compiling.
    #[serde(default)]
    pub required_files: Vec<PathBuf>,
    /// Build steps, run in order.
    #[serde(default)]
    pub compile: Vec<CompileStep>,
    /// Cores to reserve for the whole run.
    #[serde(default)]
    pub cores: CoreRequest,
    /// Default value of `{num_runs}`.
    #[serde(default = "default_num_runs")]
    pub num_runs: u32,
    /// Scored cases, in result order.
    pub cases: Vec<TestCase>,
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_result_file() -> PathBuf {
    PathBuf::from("result.yaml")
}

fn default_num_runs() -> u32 {
    1
}

/// One build command.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompileStep {
    /// Executable.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Deadline in seconds (default 600).
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Info recorded when this step fails (default `"Compile Error"`): on every case for a
    /// suite build step, on its own case for a case build step.
    #[serde(default)]
    pub info: Option<String>,
}

impl CompileStep {
    /// Used when `timeout_secs` is absent.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Deadline of the step.
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .and_then(|secs| timeout_from_secs(secs).ok())
            .unwrap_or(Self::DEFAULT_TIMEOUT)
    }
}

/// How many cores the cases are pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreRequest {
    /// Number of cores; `0` runs unpinned.
    #[serde(default = "default_core_count")]
    pub count: usize,
    /// The cores must have consecutive ids.
    #[serde(default)]
    pub contiguous: bool,
    /// Probe ids `0..probe_limit` instead of the host CPU count.
    #[serde(default)]
    pub probe_limit: Option<usize>,
}

fn default_core_count() -> usize {
    1
}

impl Default for CoreRequest {
    fn default() -> Self {
        Self {
            count: default_core_count(),
            contiguous: false,
            probe_limit: None,
        }
    }
}

/// A process to run, before template expansion.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramSpec {
    /// Executable, relative to the working directory or on `PATH`.
    pub command: String,
    /// Arguments; may use template variables.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment; values may use template variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Deadline in seconds (default 60).
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Append stderr to stdout before parsing.
    #[serde(default)]
    pub merge_stderr: bool,
}

impl ProgramSpec {
    /// Deadline of one run.
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .and_then(|secs| timeout_from_secs(secs).ok())
            .unwrap_or(Invocation::DEFAULT_TIMEOUT)
    }
}

/// A file copied next to the program before it runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputFile {
    /// Source, relative to the working directory; may use template variables.
    pub from: String,
    /// Destination relative to the working directory. Defaults to the source file name.
    #[serde(default)]
    pub to: Option<String>,
}

/// Warm-up and repetition policy.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Repeat {
    /// Measured runs after the warm-up run.
    pub runs: u32,
    /// Cold start may take this many times the mean...
    #[serde(default = "default_cold_start_factor")]
    pub cold_start_factor: f64,
    /// ...or the mean plus this much, whichever is larger.
    #[serde(default = "default_cold_start_slack")]
    pub cold_start_slack: f64,
}

fn default_cold_start_factor() -> f64 {
    1.5
}

fn default_cold_start_slack() -> f64 {
    1.5
}

impl Repeat {
    /// Largest accepted cold-start measurement for a given mean.
    pub fn cold_start_bound(&self, mean: f64) -> f64 {
        (self.cold_start_factor * mean).max(mean + self.cold_start_slack)
    }
}

/// Where the performance number of a case comes from.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSource {
    /// Elapsed seconds of the run.
    #[default]
    WallClock,
    /// `Mean: <x> us` of the checksum line.
    MeanLine,
    /// First line of the two-line PASS/FAIL format.
    FirstLine,
    /// First of several synonym patterns, each with one capture group.
    Labeled {
        /// Metric name, for messages.
        name: String,
        /// Regex synonyms.
        patterns: Vec<String>,
    },
    /// graph500 harmonic-mean TEPS of one kernel (`bfs`, `sssp`).
    Teps {
        /// Kernel name.
        kernel: String,
    },
    /// The only capture of `pattern` in the output.
    SingleOccurrence {
        /// Regex with one capture group.
        pattern: String,
    },
    /// A fixed value.
    Constant {
        /// Performance recorded.
        value: f64,
    },
}

impl MetricSource {
    /// Compiles the patterns this source needs, if any.
    pub fn extractor(&self) -> Result<Extractor, String> {
        Ok(match self {
            MetricSource::WallClock => Extractor::WallClock,
            MetricSource::MeanLine => Extractor::MeanLine,
            MetricSource::FirstLine => Extractor::FirstLine,
            MetricSource::Labeled { name, patterns } => {
                Extractor::Pattern(MetricPattern::new(name.as_str(), patterns)?)
            }
            MetricSource::Teps { kernel } => {
                Extractor::Pattern(MetricPattern::harmonic_mean_teps(kernel)?)
            }
            MetricSource::SingleOccurrence { pattern } => Extractor::Single(
                Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?,
            ),
            MetricSource::Constant { value } => Extractor::Constant(*value),
        })
    }
}

/// Compiled form of a [`MetricSource`].
#[derive(Debug, Clone)]
pub enum Extractor {
    /// Elapsed seconds.
    WallClock,
    /// Mean of the checksum line.
    MeanLine,
    /// First line of the two-line format.
    FirstLine,
    /// Synonym patterns.
    Pattern(MetricPattern),
    /// Single occurrence of a regex.
    Single(Regex),
    /// Fixed value.
    Constant(f64),
}

impl Extractor {
    /// Reads the performance number of one run.
    pub fn measure(&self, outcome: &ExecutionOutcome) -> Result<f64, ParseError> {
        let text = outcome.stdout.as_str();
        match self {
            Extractor::WallClock => Ok(outcome.elapsed.as_secs_f64()),
            Extractor::MeanLine => Ok(parser::parse_checksum_and_mean(text)?.mean),
            Extractor::FirstLine => Ok(parser::parse_time_and_verdict(text)?.time),
            Extractor::Pattern(pattern) => Ok(pattern.extract(text)?.value),
            Extractor::Single(re) => parser::parse_single_occurrence(text, re),
            Extractor::Constant(value) => Ok(*value),
        }
    }
}

/// One scored case.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    /// Key in the result file.
    pub id: String,
    /// Points awarded at full score.
    pub weight: f64,
    /// Program to run. Exactly one of `program` and `reuse` is set.
    #[serde(default)]
    pub program: Option<ProgramSpec>,
    /// Score the runs of an earlier case instead of running again.
    #[serde(default)]
    pub reuse: Option<String>,
    /// Build steps of this case alone, run once before its program. A failure zeroes only
    /// this case.
    #[serde(default)]
    pub build: Vec<CompileStep>,
    /// Program whose output is the expected answer.
    #[serde(default)]
    pub reference: Option<ProgramSpec>,
    /// Files staged before the run.
    #[serde(default)]
    pub inputs: Vec<InputFile>,
    /// Performance source.
    #[serde(default)]
    pub metric: MetricSource,
    /// Correctness check.
    #[serde(default)]
    pub validation: Validation,
    /// Scoring curve; without one the case is pass/fail.
    #[serde(default)]
    pub curve: Option<ScoreCurve>,
    /// Warm-up and repetitions.
    #[serde(default)]
    pub repeat: Option<Repeat>,
}

impl Suite {
    /// Reads and checks a suite file.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self, SuiteError> {
        let text = fs::read_to_string(path).map_err(|source| SuiteError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Self::from_yaml(&text, base_dir).map_err(|e| match e {
            SuiteError::Yaml { source, .. } => SuiteError::Yaml {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses a suite document whose relative paths are resolved against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, SuiteError> {
        let mut suite: Suite = serde_yaml::from_str(text).map_err(|source| SuiteError::Yaml {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        suite.base_dir = base_dir.into();
        suite.validate()?;
        debug!(name = %suite.name, cases = suite.cases.len(), "suite loaded");
        Ok(suite)
    }

    /// Directory every command runs in.
    pub fn workdir(&self) -> PathBuf {
        match &self.workdir {
            Some(dir) => self.base_dir.join(dir),
            None => self.base_dir.clone(),
        }
    }

    /// Where results are written unless overridden.
    pub fn result_path(&self) -> PathBuf {
        self.base_dir.join(&self.result_file)
    }

    /// Case by id.
    pub fn case(&self, id: &str) -> Option<&TestCase> {
        self.cases.iter().find(|c| c.id == id)
    }

    /// Sum of the case weights.
    pub fn max_score(&self) -> f64 {
        self.cases.iter().map(|c| c.weight).sum()
    }

    fn validate(&self) -> Result<(), SuiteError> {
        if self.cases.is_empty() {
            return Err(SuiteError::Invalid("no test case".to_string()));
        }
        for step in &self.compile {
            if let Some(secs) = step.timeout_secs {
                timeout_from_secs(secs).map_err(|e| {
                    SuiteError::Invalid(format!("build step '{}': {e}", step.command))
                })?;
            }
        }
        let mut seen = HashSet::new();
        for case in &self.cases {
            let invalid = |reason: String| SuiteError::InvalidCase {
                case: case.id.clone(),
                reason,
            };
            if !seen.insert(case.id.as_str()) {
                return Err(invalid("duplicate id".to_string()));
            }
            if !case.weight.is_finite() || case.weight < 0.0 {
                return Err(invalid(format!("weight must be >= 0, got {}", case.weight)));
            }
            match (&case.program, &case.reuse) {
                (Some(_), None) => {}
                (None, Some(other)) => {
                    let target = self
                        .cases
                        .iter()
                        .take_while(|c| c.id != case.id)
                        .find(|c| &c.id == other)
                        .ok_or_else(|| invalid(format!("reuses unknown or later case '{other}'")))?;
                    if target.program.is_none() {
                        return Err(invalid(format!("reused case '{other}' has no program")));
                    }
                    if !case.inputs.is_empty() || case.repeat.is_some() || !case.build.is_empty() {
                        return Err(invalid(
                            "build, inputs and repeat belong to the reused case".to_string(),
                        ));
                    }
                }
                _ => {
                    return Err(invalid(
                        "exactly one of 'program' and 'reuse' must be set".to_string(),
                    ))
                }
            }
            if case.validation.needs_reference() && case.reference.is_none() {
                return Err(invalid("checksum validation needs a reference program".to_string()));
            }
            if let Some(curve) = &case.curve {
                curve.validate().map_err(invalid)?;
            }
            if let Some(repeat) = &case.repeat {
                if repeat.runs == 0 {
                    return Err(invalid("repeat.runs must be at least 1".to_string()));
                }
            }
            let timeouts = [&case.program, &case.reference]
                .into_iter()
                .flatten()
                .filter_map(|program| program.timeout_secs)
                .chain(case.build.iter().filter_map(|step| step.timeout_secs))
                .chain(case.validation.timeout_secs());
            for secs in timeouts {
                timeout_from_secs(secs).map_err(invalid)?;
            }
            case.metric.extractor().map_err(invalid)?;
        }
        if self.cores.probe_limit == Some(0) {
            return Err(SuiteError::Invalid("cores.probe_limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Values substituted for `{seed}`, `{key}`, `{cores}`, `{case}` and `{num_runs}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    /// Random seed handed to the programs.
    pub seed: u64,
    /// Checksum key handed to the programs.
    pub key: u64,
    /// Pinned cores as a cpu list, empty when unpinned.
    pub cores: String,
    /// Id of the running case.
    pub case: String,
    /// Number of measured runs.
    pub num_runs: u32,
}

impl TemplateVars {
    /// Same values for another case.
    pub fn for_case(&self, case: &str) -> Self {
        Self {
            case: case.to_string(),
            ..self.clone()
        }
    }

    /// Replaces the known `{name}` placeholders of `template`; other text is kept as is.
    pub fn expand(&self, template: &str) -> String {
        regex!(r"\{([a-z_]+)\}")
            .replace_all(template, |caps: &lazy_regex::Captures| match &caps[1] {
                "seed" => self.seed.to_string(),
                "key" => self.key.to_string(),
                "cores" => self.cores.clone(),
                "case" => self.case.clone(),
                "num_runs" => self.num_runs.to_string(),
                _ => caps[0].to_string(),
            })
            .into_owned()
    }
}
