use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use hpc_grader::prelude::*;

/// Compile, pin, run and grade a contestant program described by a suite file.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Suite file describing the evaluator
    #[arg(default_value = "suite.yaml")]
    suite: PathBuf,

    /// Only run these cases (repeatable)
    #[arg(long = "case", value_name = "ID")]
    cases: Vec<String>,

    /// Seed passed to the programs as {seed} (random when omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Checksum key passed to the programs as {key} (random when omitted)
    #[arg(long)]
    key: Option<u64>,

    /// Value of {num_runs}
    #[arg(long)]
    num_runs: Option<u32>,

    /// Write results here instead of the suite's result file
    #[arg(long, value_name = "PATH")]
    result: Option<PathBuf>,

    /// Use these cores instead of probing, e.g. "0-3,8"
    #[arg(long, value_name = "LIST")]
    cpu_list: Option<CoreSet>,

    /// Run unpinned when no core can be used
    #[arg(long)]
    allow_uncontained: bool,

    /// Log every event to a timestamped file
    #[arg(long)]
    log: bool,

    /// Do not print progress
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(report) if report.fatal.is_none() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("\x1b[31merror:\x1b[39m {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<HarnessReport> {
    let mut config = Configuration::from_env()?;
    if cli.quiet {
        config = config.with_verbose(false);
    }
    if cli.log {
        config = config.with_log(true);
    }
    if cli.allow_uncontained {
        config = config.with_allow_uncontained(true);
    }
    if let Some(cores) = cli.cpu_list {
        config = config.with_cpu_list(cores);
    }
    if let Some(path) = cli.result {
        config = config.with_result_path(path);
    }

    let suite = Suite::load(&cli.suite)
        .with_context(|| format!("could not load '{}'", cli.suite.display()))?;

    let mut harness = Harness::new(suite, config).with_cases(cli.cases)?;
    if let Some(seed) = cli.seed {
        harness = harness.with_seed(seed);
    }
    if let Some(key) = cli.key {
        harness = harness.with_key(key);
    }
    if let Some(num_runs) = cli.num_runs {
        harness = harness.with_num_runs(num_runs);
    }
    harness.run()
}
