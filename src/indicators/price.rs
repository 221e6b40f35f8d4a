//! Price indicators: award values against estimates, segment norms, and the
//! bids that were actually submitted.

use statrs::statistics::Statistics;

use super::{require, require_ctx, value_scaled_threshold, Indicator, Signal};
use crate::context::IndicatorContext;
use crate::error::IndicatorError;
use crate::stats::ramp;
use crate::types::{EvaluationCriteria, FlagType, IndicatorCategory, TenderRecord};

const P: IndicatorCategory = IndicatorCategory::Price;

/// Value thresholds above which stricter procurement procedures apply.
const PROCEDURE_THRESHOLDS: [f64; 4] = [50_000.0, 140_000.0, 215_000.0, 5_382_000.0];

pub const INDICATORS: [Indicator; 10] = [
    Indicator::new("price_outlier", P, FlagType::PriceAnomaly,
        "Award value is far above the segment average", price_outlier)
        .adaptive(value_scaled_threshold),
    Indicator::new("award_above_estimate", P, FlagType::ValueInflation,
        "Awarded value exceeds the estimated value", award_above_estimate)
        .weight(1.2)
        .adaptive(value_scaled_threshold),
    Indicator::new("award_matches_estimate", P, FlagType::PriceAnomaly,
        "Awarded value is practically identical to the confidential estimate", award_matches_estimate)
        .threshold(60.0),
    Indicator::new("bid_clustering", P, FlagType::BidClustering,
        "Bid amounts are implausibly close together", bid_clustering)
        .weight(1.2),
    Indicator::new("round_amount", P, FlagType::PriceAnomaly,
        "Award value is a suspiciously round number", round_amount)
        .weight(0.5),
    Indicator::new("winner_not_lowest", P, FlagType::PriceAnomaly,
        "The winning bid was not the lowest valid bid", winner_not_lowest),
    Indicator::new("amendment_inflation", P, FlagType::ContractAmendment,
        "Amendments raised the contract value substantially", amendment_inflation),
    Indicator::new("weak_discount", P, FlagType::PriceAnomaly,
        "Discount against the estimate is well below the segment norm", weak_discount)
        .weight(0.8),
    Indicator::new("identical_bids", P, FlagType::BidClustering,
        "Two bids have the same amount", identical_bids),
    Indicator::new("threshold_avoidance", P, FlagType::ContractSplitting,
        "Estimated value sits just below a procedure threshold", threshold_avoidance)
        .weight(0.9),
];

fn price_outlier(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let value = require(r.value(), "value")?;
    let stats = require_ctx(ctx.segment_stats.as_ref(), "segment_stats")?;
    let (mean, std) = match (stats.mean_value, stats.std_value) {
        (Some(m), Some(s)) if s > 0.0 && stats.record_count >= 5 => (m, s),
        _ => return Err(IndicatorError::MissingContext("segment value distribution")),
    };
    let z = (value - mean) / std;
    Ok(Signal::new(ramp(z, 1.0, 4.0), (stats.record_count as f64 / 30.0).min(1.0))
        .with("value", value)
        .with("segment_mean", mean)
        .with("z_score", z))
}

fn award_above_estimate(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let (awarded, estimated) = award_and_estimate(r)?;
    let ratio = awarded / estimated;
    Ok(Signal::new(ramp(ratio, 1.0, 1.5), 1.0)
        .with("awarded_value", awarded)
        .with("estimated_value", estimated)
        .with("ratio", ratio))
}

fn award_matches_estimate(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let (awarded, estimated) = award_and_estimate(r)?;
    let deviation = (awarded / estimated - 1.0).abs();
    let score = if deviation <= 0.005 {
        70.0
    } else if deviation <= 0.02 {
        40.0
    } else {
        0.0
    };
    Ok(Signal::new(score, 0.8).with("deviation", deviation))
}

fn bid_clustering(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let amounts = r.valid_amounts();
    if amounts.len() < 3 {
        return Err(IndicatorError::MissingData("three priced valid bids"));
    }
    let mean = amounts.iter().mean();
    if mean.is_nan() || mean <= 0.0 {
        return Err(IndicatorError::MissingData("positive bid amounts"));
    }
    let cv = amounts.iter().population_std_dev() / mean;
    Ok(Signal::new(ramp(cv, 0.05, 0.01), (amounts.len() as f64 / 5.0).min(1.0))
        .with("coefficient_of_variation", cv)
        .with("bids", amounts.len()))
}

fn round_amount(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let awarded = require(r.awarded_value, "awarded_value")?;
    if awarded < 50_000.0 || awarded.fract() != 0.0 {
        return Ok(Signal::clear(0.5));
    }
    let score = if awarded % 100_000.0 == 0.0 {
        55.0
    } else if awarded % 10_000.0 == 0.0 {
        45.0
    } else {
        0.0
    };
    Ok(Signal::new(score, 0.5).with("awarded_value", awarded))
}

fn winner_not_lowest(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let winner_amount = require(r.winner_bid().and_then(|b| b.amount), "winner bid amount")?;
    let amounts = r.valid_amounts();
    let lowest = require(amounts.first().copied(), "valid bid amounts")?;
    let premium = winner_amount / lowest - 1.0;
    let mut score = ramp(premium, 0.0, 0.2);
    if let Some(EvaluationCriteria::BestValue { .. }) = r.evaluation_criteria {
        score /= 2.0;
    }
    Ok(Signal::new(score, 0.9)
        .with("winner_amount", winner_amount)
        .with("lowest_amount", lowest)
        .with("premium", premium))
}

fn amendment_inflation(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let awarded = require(r.awarded_value.filter(|v| *v > 0.0), "awarded_value")?;
    let Some(amended) = r.amended_value else {
        return Ok(Signal::clear(0.6));
    };
    let growth = amended / awarded - 1.0;
    Ok(Signal::new(ramp(growth, 0.1, 0.5), 1.0)
        .with("awarded_value", awarded)
        .with("amended_value", amended)
        .with("growth", growth))
}

fn weak_discount(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let (awarded, estimated) = award_and_estimate(r)?;
    let stats = require_ctx(ctx.segment_stats.as_ref(), "segment_stats")?;
    let norm = require_ctx(stats.median_discount.filter(|d| *d > 0.0), "segment median discount")?;
    let discount = 1.0 - awarded / estimated;
    Ok(Signal::new(ramp(norm - discount, 0.0, 0.2), 0.6)
        .with("discount", discount)
        .with("segment_median_discount", norm))
}

fn identical_bids(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let amounts = r.valid_amounts();
    if amounts.len() < 2 {
        return Err(IndicatorError::MissingData("two priced valid bids"));
    }
    let duplicate = amounts
        .windows(2)
        .any(|w| (w[1] - w[0]).abs() <= w[0] * 1e-4);
    let score = if duplicate { 85.0 } else { 0.0 };
    Ok(Signal::new(score, 0.9).with("bids", amounts.len()))
}

fn threshold_avoidance(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let value = require(r.estimated_value.or(r.awarded_value), "estimated_value")?;
    let nearest = PROCEDURE_THRESHOLDS
        .iter()
        .map(|t| (t, (t - value) / t))
        .find(|(_, gap)| *gap > 0.0 && *gap <= 0.05);
    match nearest {
        Some((threshold, gap)) => Ok(Signal::new(60.0 + 40.0 * (1.0 - gap / 0.05), 0.7)
            .with("value", value)
            .with("threshold", *threshold)
            .with("gap", gap)),
        None => Ok(Signal::clear(0.7)),
    }
}

fn award_and_estimate(r: &TenderRecord) -> Result<(f64, f64), IndicatorError> {
    let awarded = require(r.awarded_value, "awarded_value")?;
    let estimated = require(r.estimated_value, "estimated_value")?;
    if estimated <= 0.0 {
        return Err(IndicatorError::InvalidValue { field: "estimated_value", value: estimated });
    }
    Ok((awarded, estimated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SegmentStats;
    use crate::types::Bid;

    fn priced(amounts: &[f64]) -> TenderRecord {
        let mut r = TenderRecord::new("t");
        r.bids = amounts
            .iter()
            .enumerate()
            .map(|(i, a)| Bid { bidder: format!("b{i}"), amount: Some(*a), disqualified: false })
            .collect();
        r
    }

    #[test]
    fn award_above_estimate_ramps() {
        let mut r = TenderRecord::new("t");
        r.estimated_value = Some(100.0);
        r.awarded_value = Some(125.0);
        let s = award_above_estimate(&r, &IndicatorContext::default()).unwrap();
        assert!((s.score - 50.0).abs() < 1e-9);
        r.estimated_value = Some(0.0);
        assert!(award_above_estimate(&r, &IndicatorContext::default()).is_err());
    }

    #[test]
    fn clustered_bids_score_high() {
        let ctx = IndicatorContext::default();
        let tight = bid_clustering(&priced(&[1000.0, 1001.0, 1002.0, 1000.5]), &ctx).unwrap();
        assert_eq!(tight.score, 100.0);
        let spread = bid_clustering(&priced(&[1000.0, 1500.0, 2000.0]), &ctx).unwrap();
        assert_eq!(spread.score, 0.0);
    }

    #[test]
    fn identical_bids_detected() {
        let ctx = IndicatorContext::default();
        assert_eq!(identical_bids(&priced(&[500.0, 700.0, 500.0]), &ctx).unwrap().score, 85.0);
        assert_eq!(identical_bids(&priced(&[500.0, 700.0]), &ctx).unwrap().score, 0.0);
    }

    #[test]
    fn winner_premium_over_lowest() {
        let mut r = priced(&[100.0, 110.0]);
        r.winner = Some("b1".to_string());
        let s = winner_not_lowest(&r, &IndicatorContext::default()).unwrap();
        assert!((s.score - 50.0).abs() < 1e-6);
        r.evaluation_criteria = Some(EvaluationCriteria::BestValue { price_weight: 0.6 });
        let s = winner_not_lowest(&r, &IndicatorContext::default()).unwrap();
        assert!((s.score - 25.0).abs() < 1e-6);
    }

    #[test]
    fn threshold_avoidance_just_below() {
        let mut r = TenderRecord::new("t");
        r.estimated_value = Some(139_000.0);
        let s = threshold_avoidance(&r, &IndicatorContext::default()).unwrap();
        assert!(s.score > 85.0);
        r.estimated_value = Some(141_000.0);
        assert_eq!(threshold_avoidance(&r, &IndicatorContext::default()).unwrap().score, 0.0);
    }

    #[test]
    fn price_outlier_needs_distribution() {
        let mut r = TenderRecord::new("t");
        r.awarded_value = Some(400.0);
        let mut ctx = IndicatorContext::default();
        assert!(price_outlier(&r, &ctx).is_err());
        ctx.segment_stats = Some(SegmentStats {
            record_count: 30,
            mean_value: Some(100.0),
            std_value: Some(75.0),
            ..SegmentStats::default()
        });
        let s = price_outlier(&r, &ctx).unwrap();
        assert!((s.score - 100.0).abs() < 1e-9);
    }
}
