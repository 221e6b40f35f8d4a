use std::collections::{HashMap, HashSet};

use serde_json::json;

use super::baseline::baseline_score;
use super::confidence::{classify_uncertainty, data_completeness, ConfidenceEstimator, FeatureVector};
use super::ensemble::{signals_from_flags, FlagWeights, WeightedSignal};
use crate::indicators::IndicatorRegistry;
use crate::types::{Flag, IndicatorResult, RiskLevel, RiskScore, TenderRecord, UncertaintyLevel};

/// Everything produced for one record in a scoring pass.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub score: RiskScore,
    /// Flags raised by this pass, ready to persist.
    pub fresh_flags: Vec<Flag>,
    /// Persisted and fresh flags merged; what the score was computed from.
    pub flags: Vec<Flag>,
    pub baseline: bool,
}

/// Turns a record, its indicator results and its persisted flags into one
/// [`RiskScore`]. Pure and CPU-bound; callers run it on the blocking pool.
#[derive(Debug, Clone)]
pub struct RecordScorer {
    estimator: ConfidenceEstimator,
    weights: FlagWeights,
    seed: Option<u64>,
}

impl RecordScorer {
    pub fn new(estimator: ConfidenceEstimator, seed: Option<u64>) -> Self {
        Self { weights: estimator.strategy().default_weights(), estimator, seed }
    }

    pub fn with_weights(mut self, weights: FlagWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn estimator(&self) -> &ConfidenceEstimator {
        &self.estimator
    }

    pub fn score(
        &self,
        record: &TenderRecord,
        registry: &IndicatorRegistry,
        results: &[IndicatorResult],
        persisted: &[Flag],
        now_ns: i64,
    ) -> ScoredRecord {
        let fresh_flags: Vec<Flag> = results.iter().filter_map(|r| r.to_flag(&record.id)).collect();
        let flags = merge_flags(persisted, &fresh_flags, results);
        let signals = signals_from_flags(&flags, &self.weights);
        let completeness = data_completeness(&FeatureVector::extract(record, registry, results, &flags));
        let active = flags.iter().filter(|f| !f.is_false_positive).count() as u32;

        let has_weight = signals.iter().any(|s| s.weight.is_finite() && s.weight > 0.0);
        if !has_weight {
            let score = baseline_row(record, active, completeness, now_ns);
            return ScoredRecord { score, fresh_flags, flags, baseline: true };
        }

        let strategy = self.estimator.strategy();
        let risk_score = strategy.score(&signals);
        let ci = self.estimator.estimate_for(&record.id, &signals, self.seed);
        let score = RiskScore {
            record_id: record.id.clone(),
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            flag_count: active,
            flags_summary: flags_summary(strategy.to_string(), &signals, &flags),
            ci_lower: ci.lower,
            ci_upper: ci.upper,
            uncertainty_level: classify_uncertainty(ci.width(), completeness),
            data_completeness: completeness,
            last_analyzed: now_ns,
        };
        ScoredRecord { score, fresh_flags, flags, baseline: false }
    }

    /// Row for a record whose scoring task failed outright.
    pub fn fallback(&self, record: &TenderRecord, now_ns: i64) -> RiskScore {
        let mut row = baseline_row(record, 0, 0.0, now_ns);
        row.uncertainty_level = UncertaintyLevel::High;
        row.flags_summary = json!({ "baseline": true, "scoring_failed": true }).to_string();
        row
    }
}

fn baseline_row(record: &TenderRecord, flag_count: u32, completeness: f64, now_ns: i64) -> RiskScore {
    let bidders = record.bidder_count();
    let score = baseline_score(bidders);
    let point = f64::from(score);
    RiskScore {
        record_id: record.id.clone(),
        risk_score: score,
        risk_level: RiskLevel::from_score(score),
        flag_count,
        flags_summary: json!({ "baseline": true, "num_bidders": bidders }).to_string(),
        ci_lower: point,
        ci_upper: point,
        uncertainty_level: classify_uncertainty(0.0, completeness),
        data_completeness: completeness,
        last_analyzed: now_ns,
    }
}

/// Fresh flags replace persisted ones raised by the same indicator, keeping
/// the storage id and any false-positive mark. A persisted flag whose
/// indicator ran in `results` without triggering is left out of the merge;
/// its row stays in storage. Other persisted flags are kept as-is.
pub fn merge_flags(persisted: &[Flag], fresh: &[Flag], results: &[IndicatorResult]) -> Vec<Flag> {
    let cleared: HashSet<&str> = results
        .iter()
        .filter(|r| !r.triggered)
        .map(|r| r.indicator_name.as_str())
        .collect();
    let mut merged: Vec<Flag> = persisted
        .iter()
        .filter(|f| !f.indicator.as_deref().is_some_and(|name| cleared.contains(name)))
        .cloned()
        .collect();
    let by_indicator: HashMap<(String, String), usize> = merged
        .iter()
        .enumerate()
        .filter_map(|(i, f)| f.indicator.clone().map(|name| ((f.record_id.clone(), name), i)))
        .collect();

    for flag in fresh {
        let existing = flag
            .indicator
            .as_ref()
            .and_then(|name| by_indicator.get(&(flag.record_id.clone(), name.clone())));
        match existing {
            Some(&i) => {
                let old = &merged[i];
                let mut updated = flag.clone();
                updated.id = old.id;
                updated.is_false_positive = old.is_false_positive;
                merged[i] = updated;
            }
            None => merged.push(flag.clone()),
        }
    }
    merged.sort_by(|a, b| {
        (a.flag_type, a.indicator.as_deref()).cmp(&(b.flag_type, b.indicator.as_deref()))
    });
    merged
}

/// JSON object describing the signals behind a score. Key order is stable so
/// that reruns on unchanged data write byte-identical rows.
pub fn flags_summary(strategy: String, signals: &[WeightedSignal], flags: &[Flag]) -> String {
    let types: serde_json::Map<String, serde_json::Value> = signals
        .iter()
        .map(|s| (s.key.to_string(), json!({ "score": s.score, "weight": s.weight })))
        .collect();
    let active: Vec<serde_json::Value> = flags
        .iter()
        .filter(|f| !f.is_false_positive)
        .map(|f| {
            json!({
                "flag_type": f.flag_type,
                "indicator": f.indicator,
                "severity": f.severity,
                "score": f.score,
                "description": f.description,
            })
        })
        .collect();
    json!({ "strategy": strategy, "types": types, "flags": active }).to_string()
}
