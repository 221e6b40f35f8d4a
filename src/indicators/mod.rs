//! Pluggable statistical indicators. Each indicator is a plain data record
//! holding its metadata and two function pointers, so the registry stores
//! all 50 of them in one `Vec` and dispatches without trait objects.

pub mod competition;
pub mod price;
pub mod procedural;
pub mod registry;
pub mod relationship;
pub mod timing;

pub use registry::IndicatorRegistry;

use tracing::debug;

use crate::config::BASE_THRESHOLD;
use crate::context::{IndicatorContext, MarketSegment};
use crate::error::IndicatorError;
use crate::types::{Evidence, FlagType, IndicatorCategory, IndicatorResult, TenderRecord};

pub type EvaluateFn = fn(&TenderRecord, &IndicatorContext) -> Result<Signal, IndicatorError>;
pub type ThresholdFn = fn(f64, Option<&MarketSegment>) -> f64;

/// Raw output of an indicator body before clamping and thresholding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signal {
    pub score: f64,
    pub confidence: f64,
    pub evidence: Evidence,
    pub description: String,
}

impl Signal {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self { score, confidence, ..Self::default() }
    }

    /// A clean result: the indicator looked and found nothing.
    pub fn clear(confidence: f64) -> Self {
        Self::new(0.0, confidence)
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Indicator {
    pub name: &'static str,
    pub category: IndicatorCategory,
    pub flag_type: FlagType,
    /// Relative importance, tunable or learned.
    pub weight: f64,
    pub base_threshold: f64,
    pub description: &'static str,
    pub evaluate: EvaluateFn,
    pub adaptive_threshold: ThresholdFn,
}

impl Indicator {
    pub const fn new(
        name: &'static str,
        category: IndicatorCategory,
        flag_type: FlagType,
        description: &'static str,
        evaluate: EvaluateFn,
    ) -> Self {
        Self {
            name,
            category,
            flag_type,
            weight: 1.0,
            base_threshold: BASE_THRESHOLD,
            description,
            evaluate,
            adaptive_threshold: fixed_threshold,
        }
    }

    pub const fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub const fn threshold(mut self, base_threshold: f64) -> Self {
        self.base_threshold = base_threshold;
        self
    }

    pub const fn adaptive(mut self, f: ThresholdFn) -> Self {
        self.adaptive_threshold = f;
        self
    }

    pub fn threshold_for(&self, segment: Option<&MarketSegment>) -> f64 {
        let t = (self.adaptive_threshold)(self.base_threshold, segment);
        if t.is_finite() {
            t.clamp(0.0, 100.0)
        } else {
            self.base_threshold
        }
    }

    /// Runs the indicator body. Errors never escape: a failing indicator
    /// yields a zero-score, zero-confidence result.
    pub fn evaluate(&self, record: &TenderRecord, ctx: &IndicatorContext) -> IndicatorResult {
        let threshold = self.threshold_for(ctx.segment.as_ref());
        match (self.evaluate)(record, ctx) {
            Ok(signal) => self.finish(signal, threshold),
            Err(e) => {
                debug!(
                    indicator = self.name,
                    record_id = %record.id,
                    "[INDICATOR] {} skipped for {}: {e}",
                    self.name, record.id,
                );
                self.neutral(threshold, &e.to_string())
            }
        }
    }

    pub(crate) fn neutral(&self, threshold: f64, reason: &str) -> IndicatorResult {
        let mut evidence = Evidence::new();
        evidence.insert("error".to_string(), reason.into());
        IndicatorResult {
            indicator_name: self.name.to_string(),
            category: self.category,
            flag_type: self.flag_type,
            score: 0.0,
            weight: self.weight,
            threshold,
            evidence,
            description: format!("{} not evaluated: {reason}", self.name),
            confidence: 0.0,
            triggered: false,
        }
    }

    fn finish(&self, signal: Signal, threshold: f64) -> IndicatorResult {
        let score = clamp_score(signal.score);
        let confidence = if signal.confidence.is_finite() {
            signal.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let description = if signal.description.is_empty() {
            self.description.to_string()
        } else {
            signal.description
        };
        IndicatorResult {
            indicator_name: self.name.to_string(),
            category: self.category,
            flag_type: self.flag_type,
            score,
            weight: self.weight,
            threshold,
            evidence: signal.evidence,
            description,
            confidence,
            triggered: score >= threshold,
        }
    }
}

pub fn fixed_threshold(base: f64, _segment: Option<&MarketSegment>) -> f64 {
    base
}

/// Tighter trigger for large contracts, looser for micro purchases.
pub fn value_scaled_threshold(base: f64, segment: Option<&MarketSegment>) -> f64 {
    use crate::context::ValueBand;
    match segment.map(|s| s.value_band) {
        Some(ValueBand::Micro) => base + 15.0,
        Some(ValueBand::Large) => base - 10.0,
        Some(ValueBand::Major) => base - 15.0,
        _ => base,
    }
}

pub(crate) fn require<T>(value: Option<T>, field: &'static str) -> Result<T, IndicatorError> {
    value.ok_or(IndicatorError::MissingData(field))
}

pub(crate) fn require_ctx<T>(value: Option<T>, what: &'static str) -> Result<T, IndicatorError> {
    value.ok_or(IndicatorError::MissingContext(what))
}

/// NaN maps to 0; everything else is clamped into [0, 100].
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ValueBand;

    fn overshoot(_: &TenderRecord, _: &IndicatorContext) -> Result<Signal, IndicatorError> {
        Ok(Signal::new(250.0, 3.0))
    }

    fn failing(_: &TenderRecord, _: &IndicatorContext) -> Result<Signal, IndicatorError> {
        Err(IndicatorError::MissingData("num_bidders"))
    }

    const OVERSHOOT: Indicator = Indicator::new(
        "overshoot",
        IndicatorCategory::Price,
        FlagType::PriceAnomaly,
        "test",
        overshoot,
    );

    #[test]
    fn scores_are_clamped_and_triggered() {
        let r = OVERSHOOT.evaluate(&TenderRecord::new("t"), &IndicatorContext::default());
        assert_eq!(r.score, 100.0);
        assert_eq!(r.confidence, 1.0);
        assert!(r.triggered);
    }

    #[test]
    fn failure_yields_neutral_result() {
        let ind = Indicator::new("failing", IndicatorCategory::Competition, FlagType::SingleBidder, "test", failing);
        let r = ind.evaluate(&TenderRecord::new("t"), &IndicatorContext::default());
        assert_eq!(r.score, 0.0);
        assert_eq!(r.confidence, 0.0);
        assert!(!r.triggered);
        assert!(r.evidence.contains_key("error"));
    }

    #[test]
    fn adaptive_threshold_follows_value_band() {
        let ind = OVERSHOOT.adaptive(value_scaled_threshold);
        let major = MarketSegment { cpv_division: "45".to_string(), value_band: ValueBand::Major };
        let micro = MarketSegment { cpv_division: "45".to_string(), value_band: ValueBand::Micro };
        assert_eq!(ind.threshold_for(Some(&major)), 35.0);
        assert_eq!(ind.threshold_for(Some(&micro)), 65.0);
        assert_eq!(ind.threshold_for(None), 50.0);
    }

    #[test]
    fn nan_score_is_zero() {
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(-4.0), 0.0);
    }
}
