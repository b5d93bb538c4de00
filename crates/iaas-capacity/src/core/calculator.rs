//! Pure capacity arithmetic shared by admission checks and allocations.
//!
//! All quantities are integers in canonical units (MHz, bytes, IOPS). Only the overprovisioning factor and the
//! resulting ratios are floating point, so above 2^53 they carry the rounding error of `f64`. Factor 1 and
//! threshold 1 are computed on integers and stay exact for every value.

/// Returned by [`utilization_ratio`] for a zero denominator. Exceeds every threshold, so it never admits.
pub const UNKNOWN_UTILIZATION: f64 = f64::INFINITY;

/// Returns raw capacity multiplied by the overprovisioning factor, rounded down.
///
/// A factor below 1 never yields more than the raw capacity, results beyond `u64::MAX` saturate.
pub fn effective_capacity(total: u64, factor: f64) -> u64 {
    if !factor.is_finite() || factor <= 0. {
        return 0;
    }
    if factor == 1. {
        return total;
    }
    let scaled = (total as f64 * factor).floor() as u64;
    if factor < 1. {
        scaled.min(total)
    } else {
        scaled
    }
}

/// Returns `numerator / denominator`, or [`UNKNOWN_UTILIZATION`] if the denominator is zero.
pub fn utilization_ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return UNKNOWN_UTILIZATION;
    }
    numerator as f64 / denominator as f64
}

/// Checks whether placing `requested` on top of `current_used` pushes utilization strictly above `threshold`.
pub fn would_cross_threshold(current_used: u64, requested: u64, effective_total: u64, threshold: f64) -> bool {
    let allocated = current_used.saturating_add(requested);
    if threshold == 1. && effective_total > 0 {
        return allocated > effective_total;
    }
    utilization_ratio(allocated, effective_total) > threshold
}

/// Returns capacity left under the effective total.
/// Reserved capacity is subtracted only when `consider_reserved` is set.
pub fn free_capacity(effective_total: u64, used: u64, reserved: u64, consider_reserved: bool) -> u64 {
    let taken = if consider_reserved {
        used.saturating_add(reserved)
    } else {
        used
    };
    effective_total.saturating_sub(taken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_capacity_rounds_down() {
        assert_eq!(effective_capacity(1000, 1.0), 1000);
        assert_eq!(effective_capacity(1000, 2.0), 2000);
        assert_eq!(effective_capacity(1001, 0.5), 500);
        assert_eq!(effective_capacity(3, 1.5), 4);
        assert_eq!(effective_capacity(1000, 0.), 0);
        assert_eq!(effective_capacity(1000, f64::NAN), 0);
    }

    #[test]
    fn zero_denominator_is_unknown() {
        assert_eq!(utilization_ratio(0, 0), UNKNOWN_UTILIZATION);
        assert_eq!(utilization_ratio(10, 0), UNKNOWN_UTILIZATION);
        assert!(would_cross_threshold(0, 0, 0, 1.0));
    }

    #[test]
    fn threshold_boundary_is_not_crossed() {
        // 1700 of 2000 is exactly 0.85
        assert!(!would_cross_threshold(1700, 0, 2000, 0.85));
        assert!(would_cross_threshold(1700, 1, 2000, 0.85));
        assert!(!would_cross_threshold(600, 200, 1000, 0.8));
        assert!(would_cross_threshold(600, 201, 1000, 0.8));
    }

    #[test]
    fn large_values_stay_exact_without_scaling() {
        let total = (1u64 << 53) + 1;
        assert_eq!(effective_capacity(total, 1.0), total);
        assert_eq!(effective_capacity(u64::MAX, 1.0), u64::MAX);
        assert!(effective_capacity(u64::MAX - 1, 0.999_999_999) <= u64::MAX - 1);
        assert_eq!(effective_capacity(u64::MAX, 4.0), u64::MAX);

        // one unit above the total is visible at full threshold even where f64 can't tell them apart
        assert!(!would_cross_threshold(total - 1, 1, total, 1.0));
        assert!(would_cross_threshold(total, 1, total, 1.0));
        assert!(would_cross_threshold(1, 0, 0, 1.0));
    }

    #[test]
    fn free_capacity_saturates() {
        assert_eq!(free_capacity(8000, 6000, 1000, false), 2000);
        assert_eq!(free_capacity(8000, 6000, 1000, true), 1000);
        assert_eq!(free_capacity(8000, 7000, 2000, true), 0);
    }
}
