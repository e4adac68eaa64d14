//! Config for the grader behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`]. Command-line flags are applied on
//! top through the `with_*` methods.
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive, set the value to `"true"` to enable one.
//!
//! - `GRADER_VERBOSE` — Print progress and verdicts to stdout (default: `true`)
//! - `GRADER_LOG` — Enable logging to a file (default: `false`)
//! - `GRADER_ALLOW_UNCONTAINED` — Run without pinning when no usable core is found (default: `false`)
//! - `GRADER_PROBE_LIMIT` — Number of core ids to probe (default: host CPU count)
//! - `CPU_LIST` — Use this cpu list (e.g. `"0-3,8"`) instead of probing

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::cores::CoreSet;

/// Configuration for grader behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) probe_limit: Option<usize>,
    pub(crate) cpu_list: Option<CoreSet>,
    pub(crate) result_path: Option<PathBuf>,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Running without core pinning is not allowed.
    /// - Every core id up to the host CPU count is probed.
    /// - The result file named by the suite is used.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            allow_uncontained: false,
            probe_limit: None,
            cpu_list: None,
            result_path: None,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Unset flags keep their default value.
    ///
    /// # Errors
    ///
    /// When `CPU_LIST` or `GRADER_PROBE_LIMIT` is set but cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let cpu_list = match std::env::var("CPU_LIST") {
            Ok(list) => Some(
                list.parse::<CoreSet>()
                    .with_context(|| format!("invalid CPU_LIST '{list}'"))?,
            ),
            Err(_) => None,
        };
        let probe_limit = match std::env::var("GRADER_PROBE_LIMIT") {
            Ok(limit) => Some(
                limit
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid GRADER_PROBE_LIMIT '{limit}'"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            verbose: get_env_flag("GRADER_VERBOSE", true),
            log: get_env_flag("GRADER_LOG", false),
            allow_uncontained: get_env_flag("GRADER_ALLOW_UNCONTAINED", false),
            probe_limit,
            cpu_list,
            result_path: None,
        })
    }

    /// Enable or disable console output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Allow running cases unpinned when no core can be allocated.
    ///
    /// The suite still fails if it asks for more cores than are usable; this only covers hosts
    /// where probing finds nothing at all (no `taskset`).
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Probe core ids `0..limit` instead of the host CPU count.
    pub fn with_probe_limit(mut self, limit: usize) -> Self {
        self.probe_limit = Some(limit);
        self
    }

    /// Use `cores` as the usable set, skipping the probe.
    pub fn with_cpu_list(mut self, cores: CoreSet) -> Self {
        self.cpu_list = Some(cores);
        self
    }

    /// Write results to `path` instead of the suite's result file.
    pub fn with_result_path(mut self, path: impl AsRef<Path>) -> Self {
        self.result_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Whether console output is enabled.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Whether file logging is enabled.
    pub fn log(&self) -> bool {
        self.log
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod configuration_tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Configuration::new();
        assert!(config.verbose);
        assert!(!config.log);
        assert!(!config.allow_uncontained);
        assert!(config.cpu_list.is_none());
        assert!(config.result_path.is_none());
    }

    #[test]
    fn default_is_verbose_like_new() {
        let config = Configuration::default();
        assert!(config.verbose);
        assert!(!config.log);
        assert!(config.probe_limit.is_none());
    }

    #[test]
    fn builders_override() {
        let config = Configuration::new()
            .with_verbose(false)
            .with_allow_uncontained(true)
            .with_probe_limit(8)
            .with_cpu_list("2-3".parse().unwrap())
            .with_result_path("out.yaml");
        assert!(!config.verbose);
        assert!(config.allow_uncontained);
        assert_eq!(config.probe_limit, Some(8));
        assert_eq!(config.cpu_list.unwrap().ids(), &[2, 3]);
        assert_eq!(config.result_path.as_deref(), Some(Path::new("out.yaml")));
    }
}
