//! Extraction of checksums, timings, verdicts and labelled metrics from program output.
//!
//! Nothing here guesses: a field that is absent or does not parse as a number is a
//! [`ParseError`], which the harness scores as a wrong answer.

use lazy_regex::{regex, Regex};
use thiserror::Error;

/// Output did not have the expected shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// An expected field is absent.
    #[error("missing {0} in program output")]
    Missing(String),
    /// A field is present but is not a number.
    #[error("{field}: '{token}' is not a number")]
    NotANumber {
        /// What was being read.
        field: String,
        /// The offending text.
        token: String,
    },
    /// A pattern that must match once matched zero or several times.
    #[error("expected exactly one match of '{pattern}', found {found}")]
    Occurrences {
        /// The pattern source.
        pattern: String,
        /// How many matches were found.
        found: usize,
    },
}

/// Checksum and mean time printed by checksum-style benchmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChecksumLine {
    /// Upper-case hexadecimal digits, without the `0x` prefix.
    pub checksum: String,
    /// Mean time per repetition, in microseconds.
    pub mean: f64,
}

/// Reads `Checksum: 0x<HEX>\tMean: <FLOAT> us`.
pub fn parse_checksum_and_mean(text: &str) -> Result<ChecksumLine, ParseError> {
    let caps = regex!(r"(?m)^Checksum: 0x([0-9A-F]+)\tMean: ([\d.]+) us")
        .captures(text)
        .ok_or_else(|| ParseError::Missing("checksum and mean line".to_string()))?;
    let mean = parse_number("mean", &caps[2])?;
    Ok(ChecksumLine {
        checksum: caps[1].to_string(),
        mean,
    })
}

/// Reads `Checksum: 0x<HEX>` and returns the hexadecimal digits.
pub fn parse_checksum(text: &str) -> Result<String, ParseError> {
    regex!(r"(?m)^Checksum: 0x([0-9A-F]+)")
        .captures(text)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| ParseError::Missing("checksum".to_string()))
}

/// Average time on the first line, verdict on the second.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedVerdict {
    /// Value of the first line.
    pub time: f64,
    /// Second line, trimmed and upper-cased.
    pub verdict: String,
}

impl TimedVerdict {
    /// The program judged its own result correct.
    pub fn is_pass(&self) -> bool {
        self.verdict == "PASS"
    }
}

/// Reads the two-line `<float>` / `PASS|FAIL` format.
pub fn parse_time_and_verdict(text: &str) -> Result<TimedVerdict, ParseError> {
    let mut lines = text.trim().lines();
    let first = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| ParseError::Missing("time line".to_string()))?;
    let verdict = lines
        .next()
        .map(|l| l.trim().to_uppercase())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ParseError::Missing("verdict line".to_string()))?;
    let time = parse_number("time", first)?;
    Ok(TimedVerdict { time, verdict })
}

/// A number found through a [`MetricPattern`], with the text it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Token as printed, e.g. `5.28466e+08`.
    pub raw: String,
    /// Parsed value.
    pub value: f64,
}

/// Synonym patterns for one named metric. The first pattern that matches wins.
///
/// Each pattern must have one capture group holding the number. Patterns are case-insensitive.
#[derive(Debug, Clone)]
pub struct MetricPattern {
    name: String,
    patterns: Vec<Regex>,
}

impl MetricPattern {
    /// Compiles the synonyms of metric `name`.
    ///
    /// # Errors
    ///
    /// The message of the first pattern that is not a valid regex.
    pub fn new<I, S>(name: impl Into<String>, patterns: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                Regex::new(&format!("(?i){}", p.as_ref()))
                    .map_err(|e| format!("invalid pattern '{}': {e}", p.as_ref()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Err("at least one pattern is required".to_string());
        }
        Ok(Self {
            name: name.into(),
            patterns,
        })
    }

    /// Harmonic-mean TEPS as printed by graph500 (`bfs  harmonic_mean_TEPS:  !  5.28e+08`),
    /// in both label orders.
    pub fn harmonic_mean_teps(kernel: &str) -> Result<Self, String> {
        let number = r"\s*[:=]\s*[^0-9eE+\-.]*([0-9eE+\-.]+)";
        let label = lazy_regex::regex::escape(kernel);
        let patterns = [
            format!(r"\b{label}\b\s*harmonic[_\s-]*mean[_\s-]*teps{number}"),
            format!(r"harmonic\s*mean.*teps.*{label}{number}"),
        ];
        Self::new(kernel, patterns)
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Searches `text` with each synonym in order.
    pub fn extract(&self, text: &str) -> Result<Metric, ParseError> {
        let token = self
            .patterns
            .iter()
            .find_map(|re| re.captures(text))
            .and_then(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
            .ok_or_else(|| ParseError::Missing(self.name.clone()))?;
        let value = parse_number(&self.name, &token)?;
        Ok(Metric { raw: token, value })
    }
}

/// The single capture of `pattern` in `text`, e.g. `dequant cost (\d+\.\d+) s`.
pub fn parse_single_occurrence(text: &str, pattern: &Regex) -> Result<f64, ParseError> {
    let tokens = pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect::<Vec<_>>();
    match tokens.as_slice() {
        [token] => parse_number(pattern.as_str(), token),
        _ => Err(ParseError::Occurrences {
            pattern: pattern.as_str().to_string(),
            found: tokens.len(),
        }),
    }
}

/// Last non-empty line, trimmed.
pub fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

fn parse_number(field: &str, token: &str) -> Result<f64, ParseError> {
    let token = token.trim();
    token
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::NotANumber {
            field: field.to_string(),
            token: token.to_string(),
        })
}
