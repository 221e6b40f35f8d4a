//! Score normalisation shared by the indicators. Descriptive statistics
//! come from `statrs` at the call sites.

/// Linear ramp: 0 at `lo`, 100 at `hi`, clamped outside.
pub fn ramp(value: f64, lo: f64, hi: f64) -> f64 {
    if hi == lo {
        return if value >= hi { 100.0 } else { 0.0 };
    }
    ((value - lo) / (hi - lo) * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_clamps_both_ends() {
        assert_eq!(ramp(-5.0, 0.0, 10.0), 0.0);
        assert_eq!(ramp(5.0, 0.0, 10.0), 50.0);
        assert_eq!(ramp(50.0, 0.0, 10.0), 100.0);
        assert_eq!(ramp(3.0, 10.0, 0.0), 70.0);
    }

    #[test]
    fn degenerate_ramp_is_a_step() {
        assert_eq!(ramp(4.9, 5.0, 5.0), 0.0);
        assert_eq!(ramp(5.0, 5.0, 5.0), 100.0);
    }
}
