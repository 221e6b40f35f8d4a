//! Procedural indicators: choice of procedure, contract splitting, and
//! gaps or contradictions in the procedure record.

use super::{require, require_ctx, value_scaled_threshold, Indicator, Signal};
use crate::context::{IndicatorContext, ValueBand};
use crate::error::IndicatorError;
use crate::stats::ramp;
use crate::types::{EvaluationCriteria, FlagType, IndicatorCategory, ProcedureType, TenderRecord};

const PR: IndicatorCategory = IndicatorCategory::Procedural;

/// Combined value at which split awards would have required an open procedure.
const SPLITTING_THRESHOLD: f64 = 140_000.0;

pub const INDICATORS: [Indicator; 10] = [
    Indicator::new("unpublished_procedure", PR, FlagType::ProceduralIrregularity,
        "Contract awarded without a published call for competition", unpublished_procedure)
        .weight(1.2),
    Indicator::new("high_value_non_open", PR, FlagType::ProceduralIrregularity,
        "High-value contract awarded through a non-open procedure", high_value_non_open)
        .adaptive(value_scaled_threshold),
    Indicator::new("contract_splitting", PR, FlagType::ContractSplitting,
        "Several small awards to the same supplier add up past a threshold", contract_splitting)
        .weight(1.2),
    Indicator::new("frequent_amendments", PR, FlagType::ContractAmendment,
        "Contract was amended many times", frequent_amendments),
    Indicator::new("complaints_filed", PR, FlagType::ProceduralIrregularity,
        "Bidders filed complaints about the procedure", complaints_filed)
        .weight(0.8),
    Indicator::new("subjective_criteria", PR, FlagType::ProceduralIrregularity,
        "Award criteria leave little weight on price", subjective_criteria)
        .weight(0.7),
    Indicator::new("discretionary_non_open", PR, FlagType::ProceduralIrregularity,
        "Non-open procedure whose award criteria leave little weight on price", discretionary_non_open)
        .weight(0.6),
    Indicator::new("no_lot_division", PR, FlagType::LowCompetition,
        "Very large contract was not divided into lots", no_lot_division)
        .weight(0.7),
    Indicator::new("vague_title", PR, FlagType::ProceduralIrregularity,
        "Tender title is uninformative", vague_title)
        .weight(0.4),
    Indicator::new("winner_not_among_bidders", PR, FlagType::ProceduralIrregularity,
        "Winner does not appear among the valid bids", winner_not_among_bidders)
        .weight(1.3),
];

fn unpublished_procedure(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let procedure = require(r.procedure_type, "procedure_type")?;
    let score = if procedure.is_unpublished() {
        85.0
    } else if procedure == ProcedureType::NegotiatedWithPublication {
        40.0
    } else {
        0.0
    };
    Ok(Signal::new(score, 1.0).with("procedure_type", procedure.as_str()))
}

fn high_value_non_open(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let procedure = require(r.procedure_type, "procedure_type")?;
    let band = require_ctx(ctx.segment.as_ref().map(|s| s.value_band), "market segment")?;
    let score = match (procedure.is_open(), band) {
        (true, _) => 0.0,
        (false, b) if b.is_high_value() => 90.0,
        (false, ValueBand::Medium) => 50.0,
        (false, _) => 0.0,
    };
    Ok(Signal::new(score, 1.0)
        .with("procedure_type", procedure.as_str())
        .with("value_band", band.to_string()))
}

fn contract_splitting(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let value = require(r.value(), "value")?;
    if ctx.related_awards.is_empty() {
        return Ok(Signal::clear(0.6));
    }
    let related: Vec<f64> = ctx.related_awards.iter().filter_map(|a| a.value).collect();
    let combined = value + related.iter().sum::<f64>();
    let each_below = value < SPLITTING_THRESHOLD && related.iter().all(|v| *v < SPLITTING_THRESHOLD);
    let count = ctx.related_awards.len();
    let score = if each_below && combined >= SPLITTING_THRESHOLD {
        (60.0 + 10.0 * count as f64).min(100.0)
    } else if count >= 2 {
        40.0
    } else {
        0.0
    };
    Ok(Signal::new(score, 0.7)
        .with("related_awards", count)
        .with("combined_value", combined)
        .describe(format!("{count} related awards within the splitting window, combined {combined:.0}")))
}

fn frequent_amendments(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    Ok(Signal::new(ramp(f64::from(r.amendment_count), 0.0, 4.0), 0.9)
        .with("amendment_count", r.amendment_count))
}

fn complaints_filed(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    Ok(Signal::new((30.0 * f64::from(r.complaint_count)).min(100.0), 0.8)
        .with("complaint_count", r.complaint_count))
}

fn subjective_criteria(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    match require(r.evaluation_criteria, "evaluation_criteria")? {
        EvaluationCriteria::LowestPrice => Ok(Signal::clear(1.0)),
        EvaluationCriteria::BestValue { price_weight } => {
            if !(0.0..=1.0).contains(&price_weight) {
                return Err(IndicatorError::InvalidValue { field: "price_weight", value: price_weight });
            }
            Ok(Signal::new(ramp(price_weight, 0.5, 0.1), 0.8).with("price_weight", price_weight))
        }
    }
}

fn discretionary_non_open(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let procedure = require(r.procedure_type, "procedure_type")?;
    let criteria = require(r.evaluation_criteria, "evaluation_criteria")?;
    let price_weight = match criteria {
        EvaluationCriteria::LowestPrice => 1.0,
        EvaluationCriteria::BestValue { price_weight } => price_weight,
    };
    if !(0.0..=1.0).contains(&price_weight) {
        return Err(IndicatorError::InvalidValue { field: "price_weight", value: price_weight });
    }
    if procedure.is_open() {
        return Ok(Signal::clear(0.9).with("procedure_type", procedure.as_str()));
    }
    Ok(Signal::new(ramp(price_weight, 0.6, 0.2), 0.9)
        .with("procedure_type", procedure.as_str())
        .with("price_weight", price_weight))
}

fn no_lot_division(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let lots = require(r.num_lots, "num_lots")?;
    let value = require(r.value(), "value")?;
    if lots > 1 {
        return Ok(Signal::clear(0.8).with("num_lots", lots));
    }
    let stats = require_ctx(ctx.segment_stats.as_ref(), "segment_stats")?;
    let median = require_ctx(stats.median_value.filter(|m| *m > 0.0), "segment median value")?;
    let ratio = value / median;
    Ok(Signal::new(ramp(ratio, 3.0, 10.0), 0.6)
        .with("value_to_median", ratio)
        .with("num_lots", lots))
}

fn vague_title(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let title = require(r.title.as_deref().map(str::trim).filter(|t| !t.is_empty()), "title")?;
    let score = if title.chars().count() < 15 { 40.0 } else { 0.0 };
    Ok(Signal::new(score, 0.5).with("title_length", title.chars().count()))
}

fn winner_not_among_bidders(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let winner = require(r.winner.as_deref(), "winner")?;
    if r.bids.is_empty() {
        return Err(IndicatorError::MissingData("bids"));
    }
    let score = match r.winner_bid() {
        None => 95.0,
        Some(b) if b.disqualified => 100.0,
        Some(_) => 0.0,
    };
    Ok(Signal::new(score, 1.0).with("winner", winner))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::context::{MarketSegment, RelatedAward};
    use crate::types::Bid;

    fn related(id: &str, value: f64) -> RelatedAward {
        RelatedAward {
            record_id: id.to_string(),
            value: Some(value),
            award_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        }
    }

    #[test]
    fn splitting_crosses_threshold() {
        let mut r = TenderRecord::new("t");
        r.awarded_value = Some(60_000.0);
        let ctx = IndicatorContext {
            related_awards: vec![related("a", 50_000.0), related("b", 45_000.0)],
            ..IndicatorContext::default()
        };
        assert_eq!(contract_splitting(&r, &ctx).unwrap().score, 80.0);
    }

    #[test]
    fn high_value_non_open_by_band() {
        let mut r = TenderRecord::new("t");
        r.procedure_type = Some(ProcedureType::DirectAward);
        let ctx = IndicatorContext {
            segment: Some(MarketSegment { cpv_division: "45".to_string(), value_band: ValueBand::Major }),
            ..IndicatorContext::default()
        };
        assert_eq!(high_value_non_open(&r, &ctx).unwrap().score, 90.0);
        r.procedure_type = Some(ProcedureType::Open);
        assert_eq!(high_value_non_open(&r, &ctx).unwrap().score, 0.0);
    }

    #[test]
    fn subjective_criteria_rejects_bad_weight() {
        let mut r = TenderRecord::new("t");
        r.evaluation_criteria = Some(EvaluationCriteria::BestValue { price_weight: 0.1 });
        assert_eq!(subjective_criteria(&r, &IndicatorContext::default()).unwrap().score, 100.0);
        r.evaluation_criteria = Some(EvaluationCriteria::BestValue { price_weight: 1.5 });
        assert!(subjective_criteria(&r, &IndicatorContext::default()).is_err());
    }

    #[test]
    fn winner_must_have_bid() {
        let mut r = TenderRecord::new("t");
        r.winner = Some("ghost".to_string());
        r.bids = vec![Bid { bidder: "real".to_string(), amount: None, disqualified: false }];
        assert_eq!(winner_not_among_bidders(&r, &IndicatorContext::default()).unwrap().score, 95.0);
    }

    #[test]
    fn discretion_needs_procedure_and_criteria() {
        let ctx = IndicatorContext::default();
        let mut r = TenderRecord::new("t");
        assert!(discretionary_non_open(&r, &ctx).is_err());
        r.procedure_type = Some(ProcedureType::NegotiatedWithoutPublication);
        assert!(discretionary_non_open(&r, &ctx).is_err());
        r.evaluation_criteria = Some(EvaluationCriteria::BestValue { price_weight: 0.2 });
        assert_eq!(discretionary_non_open(&r, &ctx).unwrap().score, 100.0);
        r.evaluation_criteria = Some(EvaluationCriteria::LowestPrice);
        assert_eq!(discretionary_non_open(&r, &ctx).unwrap().score, 0.0);
        r.procedure_type = Some(ProcedureType::Open);
        r.evaluation_criteria = Some(EvaluationCriteria::BestValue { price_weight: 0.1 });
        assert_eq!(discretionary_non_open(&r, &ctx).unwrap().score, 0.0);
    }

    #[test]
    fn title_quality() {
        let mut r = TenderRecord::new("t");
        assert!(vague_title(&r, &IndicatorContext::default()).is_err());
        r.title = Some("   ".to_string());
        assert!(vague_title(&r, &IndicatorContext::default()).is_err());
        r.title = Some("Works".to_string());
        assert_eq!(vague_title(&r, &IndicatorContext::default()).unwrap().score, 40.0);
        r.title = Some("Resurfacing of the northern ring road".to_string());
        assert_eq!(vague_title(&r, &IndicatorContext::default()).unwrap().score, 0.0);
    }
}
