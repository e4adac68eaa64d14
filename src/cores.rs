//! CPU core discovery and selection.
//!
//! Cores are found by trial-pinning: a core is usable if a trivial command pinned to it with
//! `taskset` exits successfully. The probing itself is behind the [`CoreProber`] trait so that
//! selection logic can be exercised with a fixed set of cores.
//!
//! # Example
//!
//! ```
//! use hpc_grader::cores::{probe_usable_cores, select_contiguous_block, FixedProber};
//!
//! let prober = FixedProber::new([0, 1, 2, 5, 6, 7, 8]);
//! let usable = probe_usable_cores(&prober, 16);
//! let block = select_contiguous_block(&usable, 4).unwrap();
//! assert_eq!(block.to_string(), "5,6,7,8");
//! ```

use std::{collections::BTreeSet, fmt, process::Stdio, str::FromStr};

use anyhow::{bail, Context};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Ordered, duplicate-free list of core ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CoreSet(Vec<usize>);

impl CoreSet {
    /// Builds a set from any ids; they are sorted and deduplicated.
    pub fn new(ids: impl IntoIterator<Item = usize>) -> Self {
        let set: BTreeSet<usize> = ids.into_iter().collect();
        Self(set.into_iter().collect())
    }

    /// Core ids, ascending.
    pub fn ids(&self) -> &[usize] {
        &self.0
    }

    /// Number of cores.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no core is in the set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact cpu-list form using ranges, e.g. `"0-3,6"`.
    pub fn to_range_list(&self) -> String {
        let mut parts = vec![];
        for (start, len) in runs(&self.0) {
            let first = self.0[start];
            let last = self.0[start + len - 1];
            if len == 1 {
                parts.push(first.to_string());
            } else {
                parts.push(format!("{first}-{last}"));
            }
        }
        parts.join(",")
    }
}

/// Comma separated ids, the form `taskset -c` accepts.
impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self
            .0
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&list)
    }
}

/// Parses cpu lists such as `"0-3,6,8"` (inclusive ranges and individual ids).
impl FromStr for CoreSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty string");
        }
        let mut set = BTreeSet::new();
        for item in s.split(',') {
            let item = item.trim();
            let bounds = item.split('-').collect::<Vec<_>>();
            match bounds.as_slice() {
                [value] => {
                    let value: usize = value
                        .parse()
                        .with_context(|| format!("could not parse {value}"))?;
                    set.insert(value);
                }
                [start, end] => {
                    let start: usize = start
                        .parse()
                        .with_context(|| format!("could not parse {start}"))?;
                    let end: usize = end
                        .parse()
                        .with_context(|| format!("could not parse {end}"))?;
                    let range = if start <= end {
                        start..=end
                    } else {
                        end..=start
                    };
                    set.extend(range);
                }
                _ => bail!(
                    "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
                ),
            }
        }
        Ok(Self(set.into_iter().collect()))
    }
}

/// Why no core set could be handed out.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Fewer usable (or contiguous) cores than requested.
    #[error("Not enough cores: need {needed} but now is {found}")]
    InsufficientCores {
        /// Best count that was available.
        found: usize,
        /// Requested count.
        needed: usize,
    },
}

/// Capability to test whether a single core can be pinned to.
pub trait CoreProber {
    /// True if a trivial process pinned to `core` ran successfully.
    fn is_usable(&self, core: usize) -> bool;
}

/// Probes cores by running `taskset -c <id> true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TasksetProber;

impl CoreProber for TasksetProber {
    fn is_usable(&self, core: usize) -> bool {
        std::process::Command::new("taskset")
            .args(["-c", &core.to_string(), "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Prober answering from a fixed set of usable cores.
#[derive(Debug, Clone, Default)]
pub struct FixedProber {
    usable: BTreeSet<usize>,
}

impl FixedProber {
    /// Every id in `usable` passes the probe, nothing else does.
    pub fn new(usable: impl IntoIterator<Item = usize>) -> Self {
        Self {
            usable: usable.into_iter().collect(),
        }
    }
}

impl CoreProber for FixedProber {
    fn is_usable(&self, core: usize) -> bool {
        self.usable.contains(&core)
    }
}

/// Probes every id in `[0, max_id)`.
#[instrument(skip(prober))]
pub fn probe_usable_cores(prober: &dyn CoreProber, max_id: usize) -> CoreSet {
    let usable = CoreSet::new((0..max_id).filter(|&id| prober.is_usable(id)));
    debug!(usable = %usable.to_range_list(), "probed cores");
    usable
}

/// Number of logical CPUs known to the host; the default probing range.
pub fn host_cpu_count() -> usize {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_all();
    sys.cpus().len().max(1)
}

/// Picks `size` cores from the longest run of consecutive ids.
///
/// Ties between equally long runs go to the lowest ids.
pub fn select_contiguous_block(usable: &CoreSet, size: usize) -> Result<CoreSet, AllocationError> {
    let ids = usable.ids();
    let best = runs(ids).max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));
    let (start, len) = best.unwrap_or((0, 0));
    if len < size {
        return Err(AllocationError::InsufficientCores {
            found: len,
            needed: size,
        });
    }
    let block = CoreSet(ids[start..start + size].to_vec());
    info!(cores = %block.to_range_list(), "selected contiguous block");
    Ok(block)
}

/// Picks the first `size` usable cores, contiguous or not.
pub fn select_first(usable: &CoreSet, size: usize) -> Result<CoreSet, AllocationError> {
    if usable.len() < size {
        return Err(AllocationError::InsufficientCores {
            found: usable.len(),
            needed: size,
        });
    }
    Ok(CoreSet(usable.ids()[..size].to_vec()))
}

/// `(start index, length)` of every maximal run of consecutive ids.
fn runs(ids: &[usize]) -> impl Iterator<Item = (usize, usize)> + '_ {
    let mut start = 0;
    (1..=ids.len()).filter_map(move |i| {
        if i < ids.len() && ids[i] == ids[i - 1] + 1 {
            return None;
        }
        let run = (start, i - start);
        start = i;
        Some(run)
    })
}
