//! Static eviction estimate keyed on the SKU's core count.
//!
//! The last tier of the pipeline. Larger VM sizes are reclaimed less often,
//! so the vCPU count encoded in the SKU name stands in for a real score.

use std::sync::OnceLock;

use regex::Regex;

use crate::classify::EvictionClassification;

/// Core count assumed when the SKU name carries none.
pub const DEFAULT_CORE_COUNT: u32 = 2;

/// `(minimum cores, risk label, bucket)`, checked top-down.
const THRESHOLDS: [(u32, &str, &str); 4] = [
    (64, "Very Low", "0-5% (Est)"),
    (32, "Low", "5-10% (Est)"),
    (16, "Low-Medium", "10-15% (Est)"),
    (8, "Medium", "15-20% (Est)"),
];

const SMALL_SKU: (&str, &str) = ("Medium-High", "20-30% (Est)");

fn core_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"_[A-Za-z]*(\d+)").ok())
        .as_ref()
}

/// Core count encoded in a SKU name.
///
/// Reads the first digit run that follows an underscore and optional family
/// letters: `Standard_D16s_v5` → 16, `Standard_E4-2ds_v5` → 4. Falls back to
/// [`DEFAULT_CORE_COUNT`]; oversized numbers saturate.
///
/// # Panics
///
/// This function never panics.
pub fn core_count(sku: &str) -> u32 {
    core_pattern()
        .and_then(|re| re.captures(sku))
        .and_then(|caps| caps.get(1))
        .map(|digits| digits.as_str().parse::<u32>().unwrap_or(u32::MAX))
        .unwrap_or(DEFAULT_CORE_COUNT)
}

/// Heuristic classification for `sku`.
///
/// # Panics
///
/// This function never panics.
pub fn estimate(sku: &str) -> EvictionClassification {
    let cores = core_count(sku);
    let (label, bucket) = THRESHOLDS
        .iter()
        .find(|(min, _, _)| cores >= *min)
        .map_or(SMALL_SKU, |(_, label, bucket)| (*label, *bucket));
    EvictionClassification::estimated(label, bucket)
}
