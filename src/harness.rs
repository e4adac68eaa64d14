//! Orchestration of one grading run.
//!
//! A [`Harness`] walks a [`Suite`] through the stages
//! `Init → Compiling → Allocating → Running(i) → Scoring → Persisted`.
//! Setup failures (a missing source file, a failed build step, not enough cores) zero every
//! case and jump straight to `Persisted`. A failing case only zeroes itself.
//!
//! The result file is written exactly once per run, whatever happens: a guard owns the sink
//! and persists on drop if the run did not get to do it, and a panic while running cases is
//! caught and recorded as `"Test process error: ..."` on every case not scored yet.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use hpc_grader::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let suite = Suite::load(Path::new("suite.yaml"))?;
//!     let config = Configuration::from_env()?;
//!     let report = Harness::new(suite, config).with_seed(42).run()?;
//!     println!("total: {}", report.total());
//!     Ok(())
//! }
//! ```

use std::{
    collections::HashMap,
    fmt, fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use rand::Rng;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    configuration::Configuration,
    cores::{self, CoreProber, CoreSet, TasksetProber},
    logger::init_logger,
    record::{status, AggregateResult, ResultSink, ScoreResult, YamlResultFile},
    runner::{ExecutionOutcome, Invocation},
    suite::{CompileStep, ProgramSpec, Suite, TemplateVars, TestCase},
    validate::CheckContext,
};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Seeds drawn, required files checked.
    Init,
    /// Build steps running.
    Compiling,
    /// A build step failed.
    CompileFailed,
    /// Probing and selecting cores.
    Allocating,
    /// Not enough cores.
    AllocationFailed,
    /// Running the i-th selected case (1-based).
    Running(usize),
    /// All cases done, totals computed.
    Scoring,
    /// Result file written.
    Persisted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Running(i) => write!(f, "Running({i})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct HarnessReport {
    /// Every selected case, in suite order, as written to the result file.
    pub results: AggregateResult,
    /// Setup failure that zeroed every case, if any.
    pub fatal: Option<String>,
}

impl HarnessReport {
    /// Sum of the case scores.
    pub fn total(&self) -> f64 {
        self.results.total()
    }
}

/// Runs a suite and writes its results.
pub struct Harness<'a> {
    suite: Suite,
    config: Configuration,
    prober: Box<dyn CoreProber + 'a>,
    sink: Box<dyn ResultSink + 'a>,
    seed: Option<u64>,
    key: Option<u64>,
    num_runs: Option<u32>,
    selected: Vec<String>,
}

impl<'a> Harness<'a> {
    /// Harness probing cores with `taskset` and writing the suite's result file (or the
    /// configured override).
    pub fn new(suite: Suite, config: Configuration) -> Self {
        if config.log {
            if let Err(e) = init_logger() {
                eprintln!("logging disabled: {e:#}");
            }
        }
        trace!(?config);

        let result_path = config
            .result_path
            .clone()
            .unwrap_or_else(|| suite.result_path());
        Self {
            suite,
            config,
            prober: Box::new(TasksetProber),
            sink: Box::new(YamlResultFile::new(result_path)),
            seed: None,
            key: None,
            num_runs: None,
            selected: vec![],
        }
    }

    /// Replaces the core probe.
    pub fn with_prober(mut self, prober: impl CoreProber + 'a) -> Self {
        self.prober = Box::new(prober);
        self
    }

    /// Replaces the result destination.
    pub fn with_sink(mut self, sink: impl ResultSink + 'a) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Fixes `{seed}` instead of drawing it.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Fixes `{key}` instead of drawing it.
    pub fn with_key(mut self, key: u64) -> Self {
        self.key = Some(key);
        self
    }

    /// Overrides `{num_runs}`.
    pub fn with_num_runs(mut self, num_runs: u32) -> Self {
        self.num_runs = Some(num_runs);
        self
    }

    /// Restricts the run to these cases. An empty list selects every case.
    ///
    /// # Errors
    ///
    /// When an id is not in the suite.
    pub fn with_cases<I, S>(mut self, ids: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            if self.suite.case(&id).is_none() {
                bail!("unknown case '{id}' in suite '{}'", self.suite.name);
            }
            self.selected.push(id);
        }
        Ok(self)
    }

    /// Runs every stage and writes the result file.
    ///
    /// # Errors
    ///
    /// Only when the result file could not be written. Everything else is recorded in the
    /// results.
    #[instrument(skip_all, fields(suite = %self.suite.name))]
    pub fn run(self) -> anyhow::Result<HarnessReport> {
        let Harness {
            suite,
            config,
            prober,
            mut sink,
            seed,
            key,
            num_runs,
            selected,
        } = self;

        let mut rng = rand::rng();
        let vars = TemplateVars {
            seed: seed.unwrap_or_else(|| rng.random_range(0..(1u64 << 31) - 1)),
            key: key.unwrap_or_else(|| rng.random_range(1u64 << 30..(1u64 << 31) - 1)),
            cores: String::new(),
            case: String::new(),
            num_runs: num_runs.unwrap_or(suite.num_runs),
        };
        info!(seed = vars.seed, key = vars.key, num_runs = vars.num_runs);

        let cases = suite
            .cases
            .iter()
            .filter(|c| selected.is_empty() || selected.contains(&c.id))
            .collect::<Vec<_>>();
        let mut guard = PersistGuard::new(&mut *sink, cases.iter().map(|c| c.id.clone()));

        let mut session = Session {
            suite: &suite,
            config: &config,
            prober: &*prober,
            workdir: PathBuf::new(),
            vars,
            affinity: None,
            runs: HashMap::new(),
            stage: Stage::Init,
        };

        let fatal = match panic::catch_unwind(AssertUnwindSafe(|| {
            session.execute(&cases, &mut guard)
        })) {
            Ok(Ok(fatal)) => fatal,
            Ok(Err(e)) => {
                error!("test process error: {e:#}");
                let reason = format!("Test process error: {e:#}");
                guard.zero_remaining(&reason);
                Some(reason)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("test process panicked: {message}");
                let reason = format!("Test process error: {message}");
                guard.zero_remaining(&reason);
                Some(reason)
            }
        };

        let results = guard.finish()?;
        session.enter(Stage::Persisted);
        if config.verbose {
            print_summary(&results, &suite, fatal.as_deref());
        }
        Ok(HarnessReport { results, fatal })
    }
}

/// Owns the sink until the single write happens.
struct PersistGuard<S: ResultSink> {
    sink: S,
    results: AggregateResult,
    pending: Vec<String>,
    written: bool,
}

impl<S: ResultSink> PersistGuard<S> {
    fn new(sink: S, ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            sink,
            results: AggregateResult::new(),
            pending: ids.into_iter().collect(),
            written: false,
        }
    }

    fn record(&mut self, id: &str, result: ScoreResult) {
        self.pending.retain(|p| p != id);
        self.results.insert(id, result);
    }

    fn zero_remaining(&mut self, reason: &str) {
        for id in std::mem::take(&mut self.pending) {
            self.results.insert(id, ScoreResult::zeroed(reason, 0.0));
        }
    }

    fn finish(mut self) -> anyhow::Result<AggregateResult> {
        self.written = true;
        self.sink.persist(&self.results)?;
        Ok(std::mem::take(&mut self.results))
    }
}

impl<S: ResultSink> Drop for PersistGuard<S> {
    fn drop(&mut self) {
        if self.written {
            return;
        }
        self.written = true;
        self.zero_remaining("Test process error: run aborted");
        if let Err(e) = self.sink.persist(&self.results) {
            error!("could not persist results: {e:#}");
        }
    }
}

/// State of one run once the harness is consumed.
struct Session<'s> {
    suite: &'s Suite,
    config: &'s Configuration,
    prober: &'s dyn CoreProber,
    workdir: PathBuf,
    vars: TemplateVars,
    affinity: Option<CoreSet>,
    runs: HashMap<String, Result<Vec<ExecutionOutcome>, ScoreResult>>,
    stage: Stage,
}

impl<'s> Session<'s> {
    fn enter(&mut self, stage: Stage) {
        debug!(from = %self.stage, to = %stage, "stage");
        self.stage = stage;
    }

    /// Returns the setup failure, if one zeroed every case.
    fn execute<S: ResultSink>(
        &mut self,
        cases: &[&'s TestCase],
        guard: &mut PersistGuard<S>,
    ) -> anyhow::Result<Option<String>> {
        let workdir = self.suite.workdir();
        self.workdir = fs::canonicalize(&workdir).with_context(|| {
            format!("working directory '{}' does not exist", workdir.display())
        })?;

        if self.config.verbose {
            println!("Using seed: {}, key: {}", self.vars.seed, self.vars.key);
        }
        if let Some(missing) = self
            .suite
            .required_files
            .iter()
            .find(|f| !self.workdir.join(f).exists())
        {
            error!(file = %missing.display(), "required file missing");
            let reason = "Compile Error: Source file not found".to_string();
            guard.zero_remaining(&reason);
            return Ok(Some(reason));
        }

        self.enter(Stage::Compiling);
        if let Err(reason) = self.compile() {
            self.enter(Stage::CompileFailed);
            if self.config.verbose {
                println!("\x1b[31m{reason}\x1b[39m");
            }
            guard.zero_remaining(&reason);
            return Ok(Some(reason));
        }

        self.enter(Stage::Allocating);
        match self.allocate() {
            Ok(affinity) => {
                if self.config.verbose {
                    match &affinity {
                        Some(cores) => println!("Using cores: {cores}"),
                        None => println!("Running without core pinning"),
                    }
                }
                self.vars.cores = affinity.as_ref().map(CoreSet::to_string).unwrap_or_default();
                self.affinity = affinity;
            }
            Err(reason) => {
                self.enter(Stage::AllocationFailed);
                if self.config.verbose {
                    println!("\x1b[31m{reason}\x1b[39m");
                }
                guard.zero_remaining(&reason);
                return Ok(Some(reason));
            }
        }

        for (i, &case) in cases.iter().enumerate() {
            self.enter(Stage::Running(i + 1));
            if self.config.verbose {
                println!("\x1b[32mRunning case {}/{}:\x1b[39m {}", i + 1, cases.len(), case.id);
            }
            let result = self.score_case(case);
            info!(case = %case.id, %result);
            if self.config.verbose {
                print_case_result(&case.id, &result);
            }
            guard.record(&case.id, result);
        }

        self.enter(Stage::Scoring);
        Ok(None)
    }

    #[instrument(skip(self))]
    fn compile(&self) -> Result<(), String> {
        self.build(&self.suite.compile, &self.vars)
    }

    /// Runs build steps in order; the error is the info of the failed step.
    fn build(&self, steps: &[CompileStep], vars: &TemplateVars) -> Result<(), String> {
        for step in steps {
            let reason = step
                .info
                .clone()
                .unwrap_or_else(|| status::COMPILE_ERROR.to_string());
            let mut invocation = Invocation::new(resolve_command(&self.workdir, &step.command))
                .args(step.args.iter().map(|a| vars.expand(a)))
                .affinity(self.affinity.clone())
                .cwd(&self.workdir)
                .timeout(step.timeout())
                .merge_stderr(true);
            for (key, value) in &step.env {
                invocation = invocation.env(key.as_str(), vars.expand(value));
            }
            let outcome = invocation.run().map_err(|e| {
                error!("could not start build step: {e:#}");
                reason.clone()
            })?;
            if let Some(failure) = outcome.failure_description() {
                error!(
                    command = %step.command,
                    "compilation error ({failure}): {}",
                    outcome.stdout.trim()
                );
                return Err(reason);
            }
            debug!(command = %step.command, elapsed = ?outcome.elapsed, "build step done");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn allocate(&self) -> Result<Option<CoreSet>, String> {
        let request = self.suite.cores;
        if request.count == 0 {
            return Ok(None);
        }
        let usable = match &self.config.cpu_list {
            Some(list) => list.clone(),
            None => {
                let limit = self
                    .config
                    .probe_limit
                    .or(request.probe_limit)
                    .unwrap_or_else(cores::host_cpu_count);
                cores::probe_usable_cores(self.prober, limit)
            }
        };
        let selected = if request.contiguous {
            cores::select_contiguous_block(&usable, request.count)
        } else {
            cores::select_first(&usable, request.count)
        };
        match selected {
            Ok(set) => Ok(Some(set)),
            Err(e) if usable.is_empty() && self.config.allow_uncontained => {
                warn!("{e}, running without core pinning");
                Ok(None)
            }
            Err(e) => {
                error!("{e}");
                Err(e.to_string())
            }
        }
    }

    #[instrument(skip_all, fields(case = %case.id))]
    fn score_case(&mut self, case: &'s TestCase) -> ScoreResult {
        let suite = self.suite;
        let source = match &case.reuse {
            Some(id) => match suite.case(id) {
                Some(source) => source,
                None => return ScoreResult::zeroed(format!("Test process error: no case '{id}'"), 0.0),
            },
            None => case,
        };
        let runs = match self.runs_of(source) {
            Ok(runs) => runs,
            Err(zeroed) => return zeroed,
        };

        let vars = self.vars.for_case(&case.id);
        let reference_stdout = match &case.reference {
            Some(reference) => match self.run_program(reference, &vars) {
                Ok(outcome) => Some(outcome.stdout),
                Err(zeroed) => return zeroed,
            },
            None => None,
        };
        for outcome in &runs {
            let ctx = CheckContext {
                stdout: &outcome.stdout,
                workdir: &self.workdir,
                reference_stdout: reference_stdout.as_deref(),
                affinity: self.affinity.as_ref(),
            };
            if let Err(e) = case.validation.check(&ctx) {
                warn!("wrong answer: {e}");
                return ScoreResult::zeroed(status::WRONG_ANSWER, 0.0);
            }
        }

        let extractor = match case.metric.extractor() {
            Ok(extractor) => extractor,
            Err(e) => return ScoreResult::zeroed(format!("Test process error: {e}"), 0.0),
        };
        let (warm_up, measured) = match source.repeat {
            Some(_) => (runs.first(), runs.get(1..).unwrap_or_default()),
            None => (None, runs.as_slice()),
        };
        let mut values = Vec::with_capacity(measured.len());
        for outcome in measured {
            match extractor.measure(outcome) {
                Ok(value) => values.push(value),
                Err(e) => {
                    warn!("wrong answer: {e}");
                    return ScoreResult::zeroed(status::WRONG_ANSWER, 0.0);
                }
            }
        }
        if values.is_empty() {
            return ScoreResult::zeroed("Test process error: no measured run", 0.0);
        }
        let performance = values.iter().sum::<f64>() / values.len() as f64;
        debug!(?values, performance);

        if let (Some(repeat), Some(warm_up)) = (source.repeat, warm_up) {
            match extractor.measure(warm_up) {
                Ok(cold) if cold <= repeat.cold_start_bound(performance) => {
                    debug!(cold, "cold start accepted");
                }
                Ok(cold) => {
                    warn!(cold, bound = repeat.cold_start_bound(performance), "cold start too long");
                    return ScoreResult::zeroed(status::COLD_START_TOO_LONG, performance);
                }
                Err(e) => {
                    warn!("wrong answer in warm-up run: {e}");
                    return ScoreResult::zeroed(status::WRONG_ANSWER, 0.0);
                }
            }
        }

        match &case.curve {
            Some(curve) => {
                let fraction = curve.fraction(performance);
                let verdict = if fraction >= 1.0 {
                    status::ACCEPTED
                } else if fraction <= 0.0 && !curve.higher_is_better() {
                    status::TIME_LIMIT_EXCEEDED
                } else {
                    status::SUCCESS
                };
                ScoreResult::scored(performance, verdict, fraction * case.weight)
            }
            None => ScoreResult::scored(performance, status::ACCEPTED, case.weight),
        }
    }

    /// Runs of `case`, executed on first use and cached for cases reusing them.
    fn runs_of(&mut self, case: &'s TestCase) -> Result<Vec<ExecutionOutcome>, ScoreResult> {
        if let Some(cached) = self.runs.get(&case.id) {
            trace!(case = %case.id, "reusing runs");
            return cached.clone();
        }
        let runs = self.execute_case(case);
        self.runs.insert(case.id.clone(), runs.clone());
        runs
    }

    fn execute_case(&self, case: &TestCase) -> Result<Vec<ExecutionOutcome>, ScoreResult> {
        let Some(program) = &case.program else {
            return Err(ScoreResult::zeroed(
                format!("Test process error: case '{}' has no program", case.id),
                0.0,
            ));
        };
        let vars = self.vars.for_case(&case.id);
        if !case.build.is_empty() {
            self.build(&case.build, &vars).map_err(|reason| ScoreResult::zeroed(reason, 0.0))?;
        }
        self.stage_inputs(case, &vars)?;

        let total = case.repeat.map_or(1, |r| r.runs + 1);
        let mut outcomes = Vec::with_capacity(total as usize);
        for run in 0..total {
            let outcome = self.run_program(program, &vars)?;
            debug!(run, elapsed = ?outcome.elapsed);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn stage_inputs(&self, case: &TestCase, vars: &TemplateVars) -> Result<(), ScoreResult> {
        for input in &case.inputs {
            let from = self.workdir.join(vars.expand(&input.from));
            if !from.is_file() {
                error!(path = %from.display(), "input file missing");
                return Err(ScoreResult::zeroed(
                    format!("Missing input file: {}", vars.expand(&input.from)),
                    0.0,
                ));
            }
            let to = match &input.to {
                Some(to) => self.workdir.join(vars.expand(to)),
                None => match from.file_name() {
                    Some(name) => self.workdir.join(name),
                    None => continue,
                },
            };
            if to == from {
                continue;
            }
            let copied = to
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|_| fs::copy(&from, &to));
            if let Err(e) = copied {
                error!(from = %from.display(), to = %to.display(), "could not stage input: {e}");
                return Err(ScoreResult::zeroed(
                    format!("Test process error: could not stage {}", from.display()),
                    0.0,
                ));
            }
            trace!(from = %from.display(), to = %to.display(), "staged input");
        }
        Ok(())
    }

    /// One pinned, time-limited run. Any failure is already a zeroed result.
    fn run_program(
        &self,
        program: &ProgramSpec,
        vars: &TemplateVars,
    ) -> Result<ExecutionOutcome, ScoreResult> {
        let mut invocation = Invocation::new(resolve_command(&self.workdir, &program.command))
            .args(program.args.iter().map(|a| vars.expand(a)))
            .affinity(self.affinity.clone())
            .cwd(&self.workdir)
            .timeout(program.timeout())
            .merge_stderr(program.merge_stderr);
        for (key, value) in &program.env {
            invocation = invocation.env(key.as_str(), vars.expand(value));
        }

        let outcome = invocation.run().map_err(|e| {
            error!("{e:#}");
            ScoreResult::zeroed(format!("Runtime Error: {e:#}"), 0.0)
        })?;
        if outcome.timed_out {
            return Err(ScoreResult::zeroed(status::TIME_LIMIT_EXCEEDED, 0.0));
        }
        if let Some(failure) = outcome.failure_description() {
            warn!(stderr = %outcome.stderr.trim(), "{failure}");
            let verdict = match outcome.signal {
                Some(_) => format!("{}: {failure}", status::RUNTIME_ERROR),
                None => status::RUNTIME_ERROR.to_string(),
            };
            return Err(ScoreResult::zeroed(verdict, 0.0));
        }
        Ok(outcome)
    }
}

/// Relative paths with a directory part are taken from the working directory.
pub(crate) fn resolve_command(workdir: &Path, command: &str) -> String {
    let path = Path::new(command);
    if path.is_relative() && path.components().count() > 1 {
        workdir.join(path).to_string_lossy().into_owned()
    } else {
        command.to_string()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn print_case_result(id: &str, result: &ScoreResult) {
    // green for scored cases, red for zeroed ones
    let colour = if result.zero_flag() { 31 } else { 32 };
    println!("\x1b[{colour}mcase {id}:\x1b[39m {result}");
}

fn print_summary(results: &AggregateResult, suite: &Suite, fatal: Option<&str>) {
    if let Some(reason) = fatal {
        println!("\x1b[31m{}: {reason}\x1b[39m", suite.name);
    }
    println!(
        "\x1b[32m{}: total score {:.2} / {:.2}\x1b[39m",
        suite.name,
        results.total(),
        suite.max_score()
    );
}

#[cfg(test)]
mod harness_tests {
    use super::*;
    use crate::cores::FixedProber;

    #[derive(Default)]
    struct Counting {
        writes: Vec<AggregateResult>,
    }

    impl ResultSink for Counting {
        fn persist(&mut self, result: &AggregateResult) -> anyhow::Result<()> {
            self.writes.push(result.clone());
            Ok(())
        }
    }

    #[test]
    fn guard_writes_once_when_dropped() {
        let mut sink = Counting::default();
        {
            let mut guard = PersistGuard::new(&mut sink, ["1".to_string(), "2".to_string()]);
            guard.record("1", ScoreResult::scored(1.0, status::ACCEPTED, 5.0));
        }
        assert_eq!(sink.writes.len(), 1);
        let written = &sink.writes[0];
        assert_eq!(written.get("1").unwrap().score(), 5.0);
        assert_eq!(
            written.get("2").unwrap().info(),
            "Test process error: run aborted"
        );
    }

    #[test]
    fn guard_does_not_write_twice() {
        let mut sink = Counting::default();
        let guard = PersistGuard::new(&mut sink, ["1".to_string()]);
        let results = guard.finish().unwrap();
        assert_eq!(results.len(), 0);
        assert_eq!(sink.writes.len(), 1);
    }

    #[test]
    fn command_resolution() {
        let dir = Path::new("/srv/eval");
        assert_eq!(resolve_command(dir, "build/user"), "/srv/eval/build/user");
        assert_eq!(resolve_command(dir, "sh"), "sh");
        assert_eq!(resolve_command(dir, "/bin/sh"), "/bin/sh");
    }

    #[test]
    fn missing_workdir_zeroes_every_case() {
        let suite = Suite::from_yaml(
            "name: x\nworkdir: does/not/exist\ncases:\n  - { id: a, weight: 1, program: { command: p } }",
            std::env::temp_dir(),
        )
        .unwrap();
        let mut sink = Counting::default();
        let report = Harness::new(suite, Configuration::new().with_verbose(false))
            .with_prober(FixedProber::new([0]))
            .with_sink(&mut sink)
            .run()
            .unwrap();
        assert!(report.fatal.unwrap().starts_with("Test process error"));
        assert_eq!(sink.writes.len(), 1);
        assert!(sink.writes[0].get("a").unwrap().zero_flag());
    }

    #[test]
    fn unknown_case_filter_is_rejected() {
        let suite = Suite::from_yaml(
            "name: x\ncases:\n  - { id: a, weight: 1, program: { command: p } }",
            ".",
        )
        .unwrap();
        assert!(Harness::new(suite, Configuration::new())
            .with_cases(["b"])
            .is_err());
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Running(3).to_string(), "Running(3)");
        assert_eq!(Stage::CompileFailed.to_string(), "CompileFailed");
    }
}
