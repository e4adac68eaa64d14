//! Per-case results and the result file.
//!
//! A [`ScoreResult`] can only be built through [`ScoreResult::scored`] or
//! [`ScoreResult::zeroed`], which is how the `zero_flag ⇒ score == 0` rule is kept.
//! Results are collected into an [`AggregateResult`] and handed once to a [`ResultSink`].

use std::{
    fmt,
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use tracing::info;

/// Status strings understood by the outer grading system.
pub mod status {
    /// Full marks.
    pub const ACCEPTED: &str = "Accepted";
    /// Valid run with a partial score.
    pub const SUCCESS: &str = "Success";
    /// Build step failed.
    pub const COMPILE_ERROR: &str = "Compile Error";
    /// Deadline reached, or measurement at the zero-score threshold.
    pub const TIME_LIMIT_EXCEEDED: &str = "Time Limit Exceeded";
    /// Crash or non-zero exit.
    pub const RUNTIME_ERROR: &str = "Runtime Error";
    /// Wrong or unparseable output.
    pub const WRONG_ANSWER: &str = "Wrong Answer";
    /// Warm-up run too slow compared to the measured runs.
    pub const COLD_START_TOO_LONG: &str = "Cold Start too Long";
}

/// Outcome of one test case, as written to the result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    performance: f64,
    info: String,
    score: f64,
    zero_flag: bool,
}

impl ScoreResult {
    /// A valid run worth `score` points.
    ///
    /// Negative or NaN scores are stored as `0`.
    pub fn scored(performance: f64, info: impl Into<String>, score: f64) -> Self {
        Self {
            performance,
            info: info.into(),
            score: if score.is_nan() { 0.0 } else { score.max(0.0) },
            zero_flag: false,
        }
    }

    /// A disqualified run: the score is `0` whatever was measured.
    pub fn zeroed(info: impl Into<String>, performance: f64) -> Self {
        Self {
            performance,
            info: info.into(),
            score: 0.0,
            zero_flag: true,
        }
    }

    /// Measured value (time or throughput), `0` when nothing was measured.
    pub fn performance(&self) -> f64 {
        self.performance
    }

    /// Status description.
    pub fn info(&self) -> &str {
        &self.info
    }

    /// Points earned.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Whether the case was disqualified.
    pub fn zero_flag(&self) -> bool {
        self.zero_flag
    }
}

impl fmt::Display for ScoreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zero_flag {
            write!(f, "{} (zero)", self.info)
        } else {
            write!(f, "{}: {:.2} pts (performance {})", self.info, self.score, self.performance)
        }
    }
}

/// All case results of a run, in suite order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateResult {
    cases: Vec<(String, ScoreResult)>,
}

impl AggregateResult {
    /// Empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or replaces) the result of case `id`.
    pub fn insert(&mut self, id: impl Into<String>, result: ScoreResult) {
        let id = id.into();
        match self.cases.iter_mut().find(|(case, _)| *case == id) {
            Some(slot) => slot.1 = result,
            None => self.cases.push((id, result)),
        }
    }

    /// Result of case `id`, if recorded.
    pub fn get(&self, id: &str) -> Option<&ScoreResult> {
        self.cases
            .iter()
            .find_map(|(case, result)| (case == id).then_some(result))
    }

    /// Whether case `id` has a result.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// `(id, result)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScoreResult)> {
        self.cases.iter().map(|(id, r)| (id.as_str(), r))
    }

    /// Number of recorded cases.
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// True when no case is recorded.
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Sum of the (already weighted) case scores.
    pub fn total(&self) -> f64 {
        self.cases.iter().map(|(_, r)| r.score).sum()
    }
}

/// Serialized as a plain mapping `id -> record`, keeping suite order.
impl Serialize for AggregateResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cases.len()))?;
        for (id, result) in &self.cases {
            map.serialize_entry(id, result)?;
        }
        map.end()
    }
}

/// Where the final results go.
pub trait ResultSink {
    /// Stores `result`, replacing whatever a previous run left.
    fn persist(&mut self, result: &AggregateResult) -> anyhow::Result<()>;
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    fn persist(&mut self, result: &AggregateResult) -> anyhow::Result<()> {
        (**self).persist(result)
    }
}

/// YAML result file, overwritten on every run.
#[derive(Debug, Clone)]
pub struct YamlResultFile {
    path: PathBuf,
}

impl YamlResultFile {
    /// Result file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back a result file as `id -> record`, in file order.
    pub fn load(&self) -> anyhow::Result<Vec<(String, ScoreResult)>> {
        let file = File::open(&self.path)
            .with_context(|| format!("could not open '{}'", self.path.display()))?;
        let mapping: serde_yaml::Mapping =
            serde_yaml::from_reader(file).context("result file is not a YAML mapping")?;
        mapping
            .into_iter()
            .map(|(key, value)| {
                let id = match key {
                    serde_yaml::Value::String(s) => s,
                    other => serde_yaml::to_string(&other)?.trim().to_string(),
                };
                let result: ScoreResult = serde_yaml::from_value(value)
                    .with_context(|| format!("invalid record for case '{id}'"))?;
                Ok((id, result))
            })
            .collect()
    }
}

impl ResultSink for YamlResultFile {
    fn persist(&mut self, result: &AggregateResult) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("could not create '{}'", parent.display()))?;
        }
        let file = File::create(&self.path)
            .with_context(|| format!("could not create '{}'", self.path.display()))?;
        serde_yaml::to_writer(BufWriter::new(file), result)
            .with_context(|| format!("could not write '{}'", self.path.display()))?;
        info!(path = %self.path.display(), total = result.total(), "result file written");
        Ok(())
    }
}
