//! Correctness checks applied to a finished run.
//!
//! A check only runs after the program exited with code 0 before its deadline. Any failure
//! is scored as a wrong answer; the [`ValidationError`] detail only goes to the log.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    cores::CoreSet,
    harness::resolve_command,
    parser::{self, ParseError},
    runner::{timeout_from_secs, Invocation},
};

/// How the output of a case is checked.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validation {
    /// Any successful run is correct.
    #[default]
    None,
    /// Second line of the two-line format must read `PASS`.
    PassToken,
    /// `Checksum: 0x..` must equal the one printed by the case's reference program.
    ChecksumMatch,
    /// Last non-empty stdout line must equal `expected`.
    LastLineEquals {
        /// Expected line, e.g. a reference hash.
        expected: String,
    },
    /// Last non-empty line of a file written by the program must contain `needle`.
    FileLastLineContains {
        /// File, relative to the working directory.
        path: PathBuf,
        /// Required text.
        needle: String,
    },
    /// Line-by-line comparison of the sums of the numbers of two text tables.
    NumericTable {
        /// File written by the program.
        output: PathBuf,
        /// Fixture to compare against.
        reference: PathBuf,
        /// Largest accepted relative error over all lines.
        max_relative_error: f64,
    },
    /// A verifier program must exit with code 0.
    ExternalCommand {
        /// Verifier executable.
        command: String,
        /// Its arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Deadline, in seconds.
        #[serde(default)]
        timeout_secs: Option<f64>,
    },
}

/// Why an output was judged wrong.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// The output could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The program reported `FAIL` (or something else than `PASS`).
    #[error("program verdict is {0}")]
    Verdict(String),
    /// No reference output was supplied to compare with.
    #[error("no reference output to compare with")]
    NoReference,
    /// Contestant and reference checksums differ.
    #[error("checksum 0x{got} differs from reference 0x{expected}")]
    ChecksumMismatch {
        /// Contestant checksum.
        got: String,
        /// Reference checksum.
        expected: String,
    },
    /// Last output line differs.
    #[error("last line is '{got}', expected '{expected}'")]
    LastLine {
        /// What was printed.
        got: String,
        /// What was expected.
        expected: String,
    },
    /// A file is missing, unreadable or does not have the expected content.
    #[error("{path}: {reason}")]
    File {
        /// File involved.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
    /// Tables differ by more than the tolerance.
    #[error("maximum relative error {error} exceeds {tolerance}")]
    Tolerance {
        /// Largest per-line error.
        error: f64,
        /// Accepted bound.
        tolerance: f64,
    },
    /// The verifier program failed.
    #[error("verifier failed: {0}")]
    Verifier(String),
}

/// What a check may look at.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    /// Captured stdout of the run.
    pub stdout: &'a str,
    /// Working directory of the run; relative paths are resolved against it.
    pub workdir: &'a Path,
    /// Stdout of the reference program, when the case has one.
    pub reference_stdout: Option<&'a str>,
    /// Cores the verifier is pinned to.
    pub affinity: Option<&'a CoreSet>,
}

impl Validation {
    /// Whether the case must provide a reference program.
    pub fn needs_reference(&self) -> bool {
        matches!(self, Validation::ChecksumMatch)
    }

    /// Deadline setting of the verifier, if this check runs one.
    pub fn timeout_secs(&self) -> Option<f64> {
        match self {
            Validation::ExternalCommand { timeout_secs, .. } => *timeout_secs,
            _ => None,
        }
    }

    /// Runs the check.
    #[instrument(skip(ctx))]
    pub fn check(&self, ctx: &CheckContext<'_>) -> Result<(), ValidationError> {
        match self {
            Validation::None => Ok(()),
            Validation::PassToken => {
                let parsed = parser::parse_time_and_verdict(ctx.stdout)?;
                if parsed.is_pass() {
                    Ok(())
                } else {
                    Err(ValidationError::Verdict(parsed.verdict))
                }
            }
            Validation::ChecksumMatch => {
                let reference = ctx.reference_stdout.ok_or(ValidationError::NoReference)?;
                let expected = parser::parse_checksum(reference)?;
                let got = parser::parse_checksum(ctx.stdout)?;
                if got == expected {
                    Ok(())
                } else {
                    Err(ValidationError::ChecksumMismatch { got, expected })
                }
            }
            Validation::LastLineEquals { expected } => {
                let got = parser::last_line(ctx.stdout).unwrap_or_default();
                if got == expected.trim() {
                    Ok(())
                } else {
                    Err(ValidationError::LastLine {
                        got: got.to_string(),
                        expected: expected.clone(),
                    })
                }
            }
            Validation::FileLastLineContains { path, needle } => {
                let path = ctx.workdir.join(path);
                let text = read(&path)?;
                match parser::last_line(&text) {
                    Some(line) if line.contains(needle.as_str()) => Ok(()),
                    Some(line) => Err(ValidationError::File {
                        path,
                        reason: format!("last line '{line}' does not contain '{needle}'"),
                    }),
                    None => Err(ValidationError::File {
                        path,
                        reason: "file is empty".to_string(),
                    }),
                }
            }
            Validation::NumericTable {
                output,
                reference,
                max_relative_error,
            } => {
                let output = read(&ctx.workdir.join(output))?;
                let reference_path = ctx.workdir.join(reference);
                let reference = read(&reference_path)?;
                let error = max_line_sum_error(&output, &reference).ok_or_else(|| {
                    ValidationError::File {
                        path: reference_path,
                        reason: "no comparable line".to_string(),
                    }
                })?;
                debug!(error, tolerance = max_relative_error, "numeric table compared");
                if error <= *max_relative_error {
                    Ok(())
                } else {
                    Err(ValidationError::Tolerance {
                        error,
                        tolerance: *max_relative_error,
                    })
                }
            }
            Validation::ExternalCommand {
                command,
                args,
                timeout_secs,
            } => {
                let timeout = timeout_secs
                    .and_then(|secs| timeout_from_secs(secs).ok())
                    .unwrap_or(Invocation::DEFAULT_TIMEOUT);
                let outcome = Invocation::new(resolve_command(ctx.workdir, command))
                    .args(args.iter().map(String::as_str))
                    .affinity(ctx.affinity.cloned())
                    .cwd(ctx.workdir)
                    .timeout(timeout)
                    .merge_stderr(true)
                    .run()
                    .map_err(|e| ValidationError::Verifier(format!("{e:#}")))?;
                match outcome.failure_description() {
                    None => Ok(()),
                    Some(reason) => {
                        warn!(output = %outcome.stdout.trim(), "verifier rejected the output");
                        Err(ValidationError::Verifier(reason))
                    }
                }
            }
        }
    }
}

fn read(path: &Path) -> Result<String, ValidationError> {
    fs::read_to_string(path).map_err(|e| ValidationError::File {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Largest per-line error between the sums of the numeric tokens of `output` and `reference`.
///
/// Lines are paired by index up to the shorter file; pairs where either side has no finite
/// number are skipped. The error is relative to the reference sum, or absolute when that sum
/// is within `1e-10` of zero. `None` when no pair was comparable.
pub fn max_line_sum_error(output: &str, reference: &str) -> Option<f64> {
    fn line_sum(line: &str) -> Option<f64> {
        let numbers = line
            .split_whitespace()
            .filter_map(|token| token.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .collect::<Vec<_>>();
        (!numbers.is_empty()).then(|| numbers.iter().sum())
    }

    // blank lines around the tables do not shift the pairing
    let output_lines = output.trim().lines().collect::<Vec<_>>();
    let reference_lines = reference.trim().lines().collect::<Vec<_>>();
    if output_lines.len() != reference_lines.len() {
        warn!(
            output = output_lines.len(),
            reference = reference_lines.len(),
            "line count mismatch"
        );
    }

    output_lines
        .iter()
        .zip(&reference_lines)
        .filter_map(|(out, reference)| Some((line_sum(out)?, line_sum(reference)?)))
        .map(|(got, expected)| {
            let diff = (expected - got).abs();
            if expected.abs() > 1e-10 {
                diff / expected.abs()
            } else {
                diff
            }
        })
        .fold(None, |max: Option<f64>, e| Some(max.map_or(e, |m| m.max(e))))
}
