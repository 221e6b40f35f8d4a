//! Ensemble aggregation: many independent signals in, one 0–100 score out.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::corroboration;
use crate::indicators::clamp_score;
use crate::types::{Flag, FlagType, RiskLevel};

/// One entry per flag type, already reduced to its maximum score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedSignal {
    pub key: FlagType,
    pub score: f64,
    pub weight: f64,
}

/// Per-type weights. Types without an entry weigh 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagWeights(HashMap<FlagType, f64>);

impl FlagWeights {
    pub fn uniform() -> Self {
        Self(HashMap::new())
    }

    /// Weights for the full-coverage batch formula.
    pub fn batch_default() -> Self {
        Self(HashMap::from([
            (FlagType::SingleBidder, 1.0),
            (FlagType::RepeatWinner, 1.2),
            (FlagType::PriceAnomaly, 1.1),
            (FlagType::BidClustering, 1.3),
            (FlagType::ShortDeadline, 0.9),
        ]))
    }

    /// `CRI_WEIGHTS` for the interactive weighted-mean formula.
    pub fn cri_default() -> Self {
        Self(HashMap::from([
            (FlagType::SingleBidder, 1.0),
            (FlagType::LowCompetition, 0.8),
            (FlagType::RepeatWinner, 0.9),
            (FlagType::MarketConcentration, 0.8),
            (FlagType::BidRotation, 1.2),
            (FlagType::CoverBidding, 1.1),
            (FlagType::PriceAnomaly, 1.0),
            (FlagType::BidClustering, 1.2),
            (FlagType::ValueInflation, 0.9),
            (FlagType::ContractSplitting, 1.0),
            (FlagType::ContractAmendment, 0.7),
            (FlagType::ShortDeadline, 0.8),
            (FlagType::TimingAnomaly, 0.6),
            (FlagType::ConnectedParties, 1.1),
            (FlagType::ProceduralIrregularity, 0.9),
        ]))
    }

    pub fn get(&self, flag_type: FlagType) -> f64 {
        self.0.get(&flag_type).copied().unwrap_or(1.0)
    }

    pub fn set(&mut self, flag_type: FlagType, weight: f64) {
        self.0.insert(flag_type, weight);
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// The two aggregation formulas in use. They are not interchangeable and
/// generally give different numbers for the same signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Full-coverage batch formula: weighted sum scaled by a corroboration
    /// multiplier and divided by the number of types, floored at the
    /// strongest single `score * weight`. The floor only lifts results where
    /// a low-weight type would pull the average down: bid_clustering 50 plus
    /// short_deadline 50 gives 65 here against 63 from the bare formula.
    BatchWeightedAverage,
    /// Interactive CRI formula: weighted mean plus a flat per-type bonus.
    WeightedMeanWithBonus,
}

impl AggregationStrategy {
    pub fn default_weights(self) -> FlagWeights {
        match self {
            AggregationStrategy::BatchWeightedAverage => FlagWeights::batch_default(),
            AggregationStrategy::WeightedMeanWithBonus => FlagWeights::cri_default(),
        }
    }

    /// Unrounded score in [0, 100]. Zero for no signals or zero total weight.
    pub fn raw(self, signals: &[WeightedSignal]) -> f64 {
        let scores: Vec<f64> = signals.iter().map(|s| s.score).collect();
        let weights: Vec<f64> = signals.iter().map(|s| s.weight).collect();
        self.combine(&scores, &weights)
    }

    /// Final integer score.
    pub fn score(self, signals: &[WeightedSignal]) -> u8 {
        to_score(self.raw(signals))
    }

    /// Core formula over parallel score/weight slices. The bootstrap calls
    /// this directly with perturbed scores and unchanged weights.
    pub fn combine(self, scores: &[f64], weights: &[f64]) -> f64 {
        let n = scores.len().min(weights.len());
        if n == 0 {
            return 0.0;
        }
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        let mut strongest: f64 = 0.0;
        for (s, w) in scores.iter().zip(weights).take(n) {
            let s = clamp_score(*s);
            let w = sanitize_weight(*w);
            weighted_sum += s * w;
            total_weight += w;
            strongest = strongest.max(s * w);
        }
        if total_weight <= 0.0 {
            return 0.0;
        }

        let raw = match self {
            AggregationStrategy::BatchWeightedAverage => {
                let multiplier = 1.0 + (n as f64 - 1.0) * corroboration::BATCH_STEP;
                // Never below the strongest single signal on its own, so that a
                // corroborating type cannot pull the score down.
                (weighted_sum * multiplier / n as f64).max(strongest)
            }
            AggregationStrategy::WeightedMeanWithBonus => {
                let bonus = if n > 1 {
                    corroboration::CRI_BONUS_PER_TYPE * (n as f64 - 1.0)
                } else {
                    0.0
                };
                weighted_sum / total_weight + bonus
            }
        };
        clamp_score(raw)
    }
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregationStrategy::BatchWeightedAverage => "batch_weighted_average",
            AggregationStrategy::WeightedMeanWithBonus => "weighted_mean_with_bonus",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AggregationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" | "batch_weighted_average" => Ok(AggregationStrategy::BatchWeightedAverage),
            "cri" | "weighted_mean_with_bonus" => Ok(AggregationStrategy::WeightedMeanWithBonus),
            other => Err(format!("unknown aggregation strategy: {other} (expected batch or cri)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal grouping
// ---------------------------------------------------------------------------

/// Non-false-positive flags reduced to the max score per type. The type
/// weight is scaled by the weight carried on the flag that set the max.
pub fn signals_from_flags(flags: &[Flag], weights: &FlagWeights) -> Vec<WeightedSignal> {
    let mut best: BTreeMap<FlagType, (f64, f64)> = BTreeMap::new();
    for flag in flags.iter().filter(|f| !f.is_false_positive) {
        let score = clamp_score(flag.score);
        let weight = sanitize_weight(flag.weight);
        let entry = best.entry(flag.flag_type).or_insert((score, weight));
        if score > entry.0 || (score == entry.0 && weight > entry.1) {
            *entry = (score, weight);
        }
    }
    best.into_iter()
        .map(|(key, (score, flag_weight))| WeightedSignal {
            key,
            score,
            weight: weights.get(key) * flag_weight,
        })
        .collect()
}

pub fn risk_level(score: u8) -> RiskLevel {
    RiskLevel::from_score(score)
}

pub(crate) fn to_score(raw: f64) -> u8 {
    clamp_score(raw).round() as u8
}

fn sanitize_weight(w: f64) -> f64 {
    if w.is_finite() && w > 0.0 {
        w
    } else {
        0.0
    }
}
