//! Uncertainty layer: bootstrap interval around the point estimate, data
//! completeness of the feature vector, and the uncertainty matrix.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};

use super::ensemble::{AggregationStrategy, WeightedSignal};
use crate::config::{
    ci_width_thresholds, BOOTSTRAP_ITERATIONS, BOOTSTRAP_NOISE, COMPLETENESS_THRESHOLD,
    CONFIDENCE_LEVEL, FEATURE_COUNT,
};
use crate::indicators::IndicatorRegistry;
use crate::types::{Flag, FlagType, IndicatorCategory, IndicatorResult, TenderRecord, UncertaintyLevel};

/// Point estimate with its bootstrap interval.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub score: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn as_triple(&self) -> (f64, f64, f64) {
        (self.score, self.lower, self.upper)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceEstimator {
    strategy: AggregationStrategy,
    iterations: usize,
    confidence_level: f64,
    noise: f64,
}

impl ConfidenceEstimator {
    pub fn new(strategy: AggregationStrategy) -> Self {
        Self {
            strategy,
            iterations: BOOTSTRAP_ITERATIONS,
            confidence_level: CONFIDENCE_LEVEL,
            noise: BOOTSTRAP_NOISE,
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_confidence_level(mut self, level: f64) -> Self {
        if level > 0.0 && level < 1.0 {
            self.confidence_level = level;
        }
        self
    }

    pub fn with_strategy(mut self, strategy: AggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self::new(cfg.strategy)
            .with_iterations(cfg.bootstrap_iterations)
            .with_confidence_level(cfg.confidence_level)
    }

    pub fn strategy(&self) -> AggregationStrategy {
        self.strategy
    }

    /// Deterministic RNG when `seed` is set, keyed by the record id so each
    /// record draws its own stream.
    pub fn estimate_for(&self, record_id: &str, signals: &[WeightedSignal], seed: Option<u64>) -> ConfidenceInterval {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ stable_hash(record_id)),
            None => StdRng::from_entropy(),
        };
        self.estimate(signals, &mut rng)
    }

    /// Perturbs every signal score by an independent uniform factor in
    /// [-noise, +noise], recomputes with the same weights and strategy, and
    /// returns the central `confidence_level` band of the samples.
    /// Empty or zero-weight input gives the zero interval.
    pub fn estimate<R: Rng + ?Sized>(&self, signals: &[WeightedSignal], rng: &mut R) -> ConfidenceInterval {
        let total_weight: f64 = signals
            .iter()
            .map(|s| s.weight)
            .filter(|w| w.is_finite() && *w > 0.0)
            .sum();
        if signals.is_empty() || total_weight <= 0.0 {
            return ConfidenceInterval::default();
        }

        let point = f64::from(self.strategy.score(signals));
        let base: Vec<f64> = signals.iter().map(|s| s.score).collect();
        let weights: Vec<f64> = signals.iter().map(|s| s.weight).collect();

        let mut perturbed = vec![0.0; base.len()];
        let mut samples = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            for (p, s) in perturbed.iter_mut().zip(&base) {
                let factor: f64 = rng.gen_range(-self.noise..=self.noise);
                *p = (s + s * factor).clamp(0.0, 100.0);
            }
            samples.push(self.strategy.combine(&perturbed, &weights));
        }

        let alpha = (1.0 - self.confidence_level) / 2.0;
        let mut samples = Data::new(samples);
        let lower = finite_or(samples.quantile(alpha), point);
        let upper = finite_or(samples.quantile(1.0 - alpha), point);
        ConfidenceInterval { score: point, lower, upper }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// FNV-1a; stable across builds, unlike the std hasher.
fn stable_hash(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3))
}

// ---------------------------------------------------------------------------
// Data completeness
// ---------------------------------------------------------------------------

/// A single feature slot. Null, NaN, zero, `false` and empty text all count
/// as missing: zero doubles as the "not recorded" sentinel upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Null,
    Number(f64),
    Bool(bool),
    Text(String),
}

impl FeatureValue {
    pub fn is_present(&self) -> bool {
        match self {
            FeatureValue::Null => false,
            FeatureValue::Number(v) => !v.is_nan() && *v != 0.0,
            FeatureValue::Bool(b) => *b,
            FeatureValue::Text(s) => !s.is_empty(),
        }
    }
}

impl From<Option<f64>> for FeatureValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(FeatureValue::Null, FeatureValue::Number)
    }
}

impl From<Option<u32>> for FeatureValue {
    fn from(v: Option<u32>) -> Self {
        v.map_or(FeatureValue::Null, |n| FeatureValue::Number(f64::from(n)))
    }
}

impl From<Option<i64>> for FeatureValue {
    fn from(v: Option<i64>) -> Self {
        v.map_or(FeatureValue::Null, |n| FeatureValue::Number(n as f64))
    }
}

impl From<Option<&str>> for FeatureValue {
    fn from(v: Option<&str>) -> Self {
        v.map_or(FeatureValue::Null, |s| FeatureValue::Text(s.to_string()))
    }
}

/// Named feature slots for one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: BTreeMap<String, FeatureValue>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn present(&self) -> usize {
        self.values.values().filter(|v| v.is_present()).count()
    }

    /// Fixed layout: 16 record attributes, one slot per registry indicator
    /// (50 for the standard registry), 15 per-type max flag scores, 15
    /// per-type flag counts, 16 aggregates.
    pub fn extract(
        record: &TenderRecord,
        registry: &IndicatorRegistry,
        results: &[IndicatorResult],
        flags: &[Flag],
    ) -> Self {
        let mut fv = Self::new();

        fv.insert("num_bidders", record.num_bidders);
        fv.insert("estimated_value", record.estimated_value);
        fv.insert("awarded_value", record.awarded_value);
        fv.insert("amended_value", record.amended_value);
        fv.insert("amendment_count", Some(record.amendment_count));
        fv.insert("complaint_count", Some(record.complaint_count));
        fv.insert("num_lots", record.num_lots);
        fv.insert("submission_days", record.submission_days());
        fv.insert(
            "decision_days",
            record.award_date.zip(record.deadline_date).map(|(a, d)| (a - d).num_days()),
        );
        fv.insert(
            "signing_days",
            record.contract_signing_date.zip(record.award_date).map(|(s, a)| (s - a).num_days()),
        );
        fv.insert("procuring_entity", record.procuring_entity.as_deref());
        fv.insert("winner", record.winner.as_deref());
        fv.insert("cpv_code", record.cpv_code.as_deref());
        fv.insert("procedure_type", record.procedure_type.map(|p| p.as_str()));
        fv.insert(
            "price_weight",
            record.evaluation_criteria.map(|c| match c {
                crate::types::EvaluationCriteria::LowestPrice => 1.0,
                crate::types::EvaluationCriteria::BestValue { price_weight } => price_weight,
            }),
        );
        fv.insert("title", record.title.as_deref());

        for indicator in registry.iter() {
            let score = results
                .iter()
                .find(|r| r.indicator_name == indicator.name)
                .map(|r| r.score);
            fv.insert(format!("indicator.{}", indicator.name), score);
        }

        let active: Vec<&Flag> = flags.iter().filter(|f| !f.is_false_positive).collect();
        for flag_type in FlagType::ALL {
            let of_type = active.iter().filter(|f| f.flag_type == flag_type);
            let max = of_type.clone().map(|f| f.score).fold(None, |m: Option<f64>, s| {
                Some(m.map_or(s, |m| m.max(s)))
            });
            fv.insert(format!("flag_max.{flag_type}"), max);
            fv.insert(format!("flag_count.{flag_type}"), Some(of_type.count() as u32));
        }

        for category in IndicatorCategory::ALL {
            let scores: Vec<f64> = results
                .iter()
                .filter(|r| r.category == category && r.confidence > 0.0)
                .map(|r| r.score)
                .collect();
            fv.insert(format!("category_mean.{category}"), (!scores.is_empty()).then(|| scores.iter().mean()));
            fv.insert(
                format!("category_max.{category}"),
                scores.iter().copied().reduce(f64::max),
            );
        }

        let evaluated: Vec<&IndicatorResult> = results.iter().filter(|r| r.confidence > 0.0).collect();
        let confidences: Vec<f64> = evaluated.iter().map(|r| r.confidence).collect();
        fv.insert("triggered_count", Some(results.iter().filter(|r| r.triggered).count() as u32));
        fv.insert("mean_confidence", (!confidences.is_empty()).then(|| confidences.iter().mean()));
        fv.insert("flag_count", Some(active.len() as u32));
        fv.insert(
            "distinct_flag_types",
            Some(active.iter().map(|f| f.flag_type).collect::<std::collections::BTreeSet<_>>().len() as u32),
        );
        fv.insert(
            "false_positive_count",
            Some(flags.iter().filter(|f| f.is_false_positive).count() as u32),
        );
        fv.insert("valid_bid_count", Some(record.valid_bids().count() as u32));

        fv
    }
}

/// Share of the fixed feature layout that carries a real value, in [0, 1].
pub fn data_completeness(features: &FeatureVector) -> f64 {
    (features.present() as f64 / FEATURE_COUNT as f64).clamp(0.0, 1.0)
}

/// | ci_width    | completeness >= 0.70 | < 0.70 |
/// |-------------|----------------------|--------|
/// | <= 10       | low                  | medium |
/// | (10, 25]    | medium               | high   |
/// | > 25        | high                 | high   |
pub fn classify_uncertainty(ci_width: f64, completeness: f64) -> UncertaintyLevel {
    use ci_width_thresholds::*;
    let complete = completeness >= COMPLETENESS_THRESHOLD;
    if ci_width.is_nan() || ci_width > MODERATE_MAX {
        UncertaintyLevel::High
    } else if ci_width > NARROW_MAX {
        if complete {
            UncertaintyLevel::Medium
        } else {
            UncertaintyLevel::High
        }
    } else if complete {
        UncertaintyLevel::Low
    } else {
        UncertaintyLevel::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(key: FlagType, score: f64, weight: f64) -> WeightedSignal {
        WeightedSignal { key, score, weight }
    }

    fn cri() -> ConfidenceEstimator {
        ConfidenceEstimator::new(AggregationStrategy::WeightedMeanWithBonus)
    }

    #[test]
    fn empty_input_gives_zero_triple() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(cri().estimate(&[], &mut rng).as_triple(), (0.0, 0.0, 0.0));
        let zero_weight = [signal(FlagType::SingleBidder, 80.0, 0.0)];
        assert_eq!(cri().estimate(&zero_weight, &mut rng).as_triple(), (0.0, 0.0, 0.0));
    }

    #[test]
    fn single_type_interval_brackets_point() {
        let signals = [signal(FlagType::BidRotation, 70.0, 1.2)];
        let mut rng = StdRng::seed_from_u64(7);
        let ci = cri().estimate(&signals, &mut rng);
        assert_eq!(ci.score, 70.0);
        assert!(ci.lower <= ci.score && ci.score <= ci.upper, "{ci:?}");
        // Uniform ±10% noise: the 90% band sits inside [63, 77].
        assert!(ci.lower >= 63.0 && ci.upper <= 77.0, "{ci:?}");
    }

    #[test]
    fn bonus_is_constant_across_iterations() {
        let signals = [
            signal(FlagType::SingleBidder, 50.0, 1.0),
            signal(FlagType::PriceAnomaly, 50.0, 1.0),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let ci = cri().estimate(&signals, &mut rng);
        // point = 50 + 8; every sample lies in [45 + 8, 55 + 8].
        assert_eq!(ci.score, 58.0);
        assert!(ci.lower >= 53.0 && ci.upper <= 63.0, "{ci:?}");
    }

    #[test]
    fn seeded_estimates_repeat() {
        let signals = [signal(FlagType::SingleBidder, 80.0, 1.0), signal(FlagType::ShortDeadline, 40.0, 0.8)];
        let a = cri().estimate_for("t-1", &signals, Some(42));
        let b = cri().estimate_for("t-1", &signals, Some(42));
        assert_eq!(a, b);
    }

    #[test]
    fn clipping_at_the_top() {
        let signals = [signal(FlagType::SingleBidder, 100.0, 1.0)];
        let mut rng = StdRng::seed_from_u64(11);
        let ci = cri().estimate(&signals, &mut rng);
        assert_eq!(ci.upper, 100.0);
        assert!(ci.lower >= 90.0);
    }

    #[test]
    fn completeness_edges() {
        assert_eq!(data_completeness(&FeatureVector::new()), 0.0);

        let mut full = FeatureVector::new();
        for i in 0..FEATURE_COUNT {
            full.insert(format!("f{i}"), Some(1.0 + i as f64));
        }
        assert_eq!(data_completeness(&full), 1.0);

        let mut sentinels = FeatureVector::new();
        sentinels.insert("zero", Some(0.0));
        sentinels.insert("nan", Some(f64::NAN));
        sentinels.insert("null", FeatureValue::Null);
        sentinels.insert("empty", Some(""));
        sentinels.insert("false", FeatureValue::Bool(false));
        sentinels.insert("real", Some("x"));
        assert_eq!(sentinels.present(), 1);
    }

    #[test]
    fn standard_extraction_fills_fixed_layout() {
        let registry = IndicatorRegistry::standard();
        let fv = FeatureVector::extract(&TenderRecord::new("t"), &registry, &[], &[]);
        assert_eq!(fv.len(), FEATURE_COUNT);
        let c = data_completeness(&fv);
        assert!((0.0..=1.0).contains(&c));
    }

    #[test]
    fn uncertainty_matrix_boundaries() {
        use UncertaintyLevel::*;
        let cases = [
            (10.0, 0.70, Low),
            (10.0, 0.69, Medium),
            (10.01, 0.70, Medium),
            (10.01, 0.69, High),
            (25.0, 0.70, Medium),
            (25.0, 0.69, High),
            (25.01, 0.70, High),
            (25.01, 0.69, High),
        ];
        for (width, completeness, expected) in cases {
            assert_eq!(classify_uncertainty(width, completeness), expected, "{width} {completeness}");
        }
    }
}
