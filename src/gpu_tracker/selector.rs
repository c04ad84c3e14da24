//! GPU selector resolution.
//!
//! A selector is `all` or a comma separated list of indices (`3`), inclusive
//! ranges (`0-2`) and unique IDs (`0x1a2b...`, or more than eight bare hex
//! digits). Resolution never fails: bad tokens are reported back and the
//! rest of the list still applies.

use crate::runtime::gpu::{DeviceInfo, UniqueIdIndex};

/// Out-of-range members a single range reports one by one, on top of the
/// GPU count.
const RANGE_REPORT_SLACK: usize = 64;

/// Outcome of resolving a selector against the current GPU list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuSelection {
    /// Ascending; duplicates kept.
    pub valid: Vec<usize>,
    /// Tokens (or single range members) that name no GPU.
    pub invalid: Vec<String>,
    /// Range tokens that are not of the form `start-end` with `start <= end`.
    pub invalid_ranges: Vec<String>,
}

impl GpuSelection {
    fn add_unique_id(&mut self, token: &str, unique_ids: &UniqueIdIndex) {
        let lowered = token.to_ascii_lowercase();
        let gpus = if lowered.starts_with("0x") {
            unique_ids.get(&lowered)
        } else {
            unique_ids
                .get(&format!("0x{lowered}"))
                .or_else(|| unique_ids.get(&lowered))
        };

        match gpus {
            Some(gpus) => self.valid.extend(gpus),
            None => self.invalid.push(token.to_string()),
        }
    }

    fn add_range(&mut self, token: &str, start: &str, end: &str, count: usize) {
        let bounds = start.parse::<i64>().ok().zip(end.parse::<i64>().ok());
        let Some((start, end)) = bounds.filter(|(s, e)| s <= e) else {
            self.invalid_ranges.push(token.to_string());
            return;
        };

        let last = i64::try_from(count).unwrap_or(i64::MAX) - 1;
        let mut budget = count + RANGE_REPORT_SLACK;
        if start < 0 {
            self.add_invalid_span(start, end.min(-1), &mut budget);
        }
        self.valid
            .extend((start.max(0)..=end.min(last)).filter_map(|gpu| in_bounds(gpu, count)));
        if end > last {
            self.add_invalid_span(start.max(last + 1), end, &mut budget);
        }
    }

    /// Report `from..=to` member by member until `budget` runs out, then
    /// as one `first-last` token.
    fn add_invalid_span(&mut self, from: i64, to: i64, budget: &mut usize) {
        let mut gpu = from;
        loop {
            if *budget == 0 && gpu < to {
                self.invalid.push(format!("{gpu}-{to}"));
                return;
            }
            self.invalid.push(gpu.to_string());
            *budget = budget.saturating_sub(1);
            if gpu >= to {
                return;
            }
            gpu += 1;
        }
    }

    fn add_index(&mut self, token: &str, count: usize) {
        match token.parse::<i64>().ok().and_then(|gpu| in_bounds(gpu, count)) {
            Some(gpu) => self.valid.push(gpu),
            None => self.invalid.push(token.to_string()),
        }
    }
}

fn in_bounds(gpu: i64, count: usize) -> Option<usize> {
    usize::try_from(gpu).ok().filter(|gpu| *gpu < count)
}

/// `0x`/`0X` prefixed, or a bare all-hex token too long to be an index.
fn is_unique_id(token: &str) -> bool {
    token.starts_with("0x")
        || token.starts_with("0X")
        || (token.len() > 8 && token.bytes().all(|b| b.is_ascii_hexdigit()))
}

pub fn is_all(spec: &str) -> bool {
    matches!(spec, "all" | "All" | "ALL")
}

/// Resolve `spec` against `universe`, the current ordered GPU list.
pub fn resolve(spec: &str, universe: &[DeviceInfo], unique_ids: &UniqueIdIndex) -> GpuSelection {
    let count = universe.len();
    if is_all(spec) {
        return GpuSelection {
            valid: (0..count).collect(),
            ..Default::default()
        };
    }

    let mut selection = GpuSelection::default();
    for token in spec.split(',') {
        if is_unique_id(token) {
            selection.add_unique_id(token, unique_ids);
        } else if let Some((start, end)) = token.split_once('-') {
            selection.add_range(token, start, end, count);
        } else {
            selection.add_index(token, count);
        }
    }

    selection.valid.sort_unstable();
    selection
}
