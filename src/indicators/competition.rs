//! Competition indicators: how many firms actually competed, and whether the
//! competition that took place looks genuine.

use super::{require, require_ctx, Indicator, Signal};
use crate::context::IndicatorContext;
use crate::error::IndicatorError;
use crate::stats::ramp;
use crate::types::{FlagType, IndicatorCategory, ProcedureType, TenderRecord};

const C: IndicatorCategory = IndicatorCategory::Competition;

pub const INDICATORS: [Indicator; 10] = [
    Indicator::new("single_bidder", C, FlagType::SingleBidder,
        "Only one bid was received", single_bidder),
    Indicator::new("low_bidder_count", C, FlagType::LowCompetition,
        "Fewer bidders than is typical for the market segment", low_bidder_count),
    Indicator::new("high_disqualification_rate", C, FlagType::LowCompetition,
        "A large share of bids was disqualified", high_disqualification_rate),
    Indicator::new("sole_valid_bid", C, FlagType::SingleBidder,
        "Several bids were received but only one survived evaluation", sole_valid_bid)
        .weight(1.1),
    Indicator::new("entity_single_bidder_history", C, FlagType::LowCompetition,
        "The buyer frequently awards contracts with a single bidder", entity_single_bidder_history)
        .weight(0.8),
    Indicator::new("restricted_procedure", C, FlagType::LowCompetition,
        "The procedure type restricted who could bid", restricted_procedure),
    Indicator::new("buyer_concentration", C, FlagType::MarketConcentration,
        "The buyer's awards are concentrated on one supplier", buyer_concentration),
    Indicator::new("bidder_count_mismatch", C, FlagType::ProceduralIrregularity,
        "Reported bidder count disagrees with the bid list", bidder_count_mismatch)
        .weight(0.7)
        .threshold(60.0),
    Indicator::new("cover_bidding", C, FlagType::CoverBidding,
        "Losing bids sit far above the winner, consistent with cover pricing", cover_bidding),
    Indicator::new("incumbent_field", C, FlagType::LowCompetition,
        "The field consists only of long-standing bidders to this buyer", incumbent_field)
        .weight(0.8),
];

fn single_bidder(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let n = require(r.bidder_count(), "num_bidders")?;
    if n == 0 {
        return Err(IndicatorError::InvalidValue { field: "num_bidders", value: 0.0 });
    }
    let score = match n {
        1 => 100.0,
        2 => 40.0,
        _ => 0.0,
    };
    let confidence = if r.num_bidders.is_some() { 1.0 } else { 0.7 };
    Ok(Signal::new(score, confidence).with("num_bidders", n))
}

fn low_bidder_count(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let n = require(r.bidder_count(), "num_bidders")?;
    let stats = require_ctx(ctx.segment_stats.as_ref(), "segment_stats")?;
    let median = require_ctx(stats.median_bidders.filter(|m| *m >= 2.0), "segment median bidders")?;
    let ratio = f64::from(n) / median;
    Ok(Signal::new(ramp(ratio, 1.0, 0.25), (stats.record_count as f64 / 20.0).min(1.0))
        .with("num_bidders", n)
        .with("segment_median_bidders", median))
}

fn high_disqualification_rate(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    if r.bids.is_empty() {
        return Err(IndicatorError::MissingData("bids"));
    }
    let disqualified = r.bids.iter().filter(|b| b.disqualified).count();
    let rate = disqualified as f64 / r.bids.len() as f64;
    Ok(Signal::new(ramp(rate, 0.2, 0.8), 0.8)
        .with("disqualified", disqualified)
        .with("total_bids", r.bids.len())
        .with("rate", rate))
}

fn sole_valid_bid(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    if r.bids.is_empty() {
        return Err(IndicatorError::MissingData("bids"));
    }
    let valid = r.valid_bids().count();
    if r.bids.len() < 2 || valid != 1 {
        return Ok(Signal::clear(0.9).with("valid_bids", valid));
    }
    Ok(Signal::new(90.0, 0.9)
        .with("valid_bids", valid)
        .with("total_bids", r.bids.len())
        .describe(format!("{} bids received, only one valid", r.bids.len())))
}

fn entity_single_bidder_history(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let entity = require_ctx(ctx.entity.as_ref(), "entity profile")?;
    if entity.awards < 5 {
        return Ok(Signal::clear(0.2).with("entity_awards", entity.awards));
    }
    let rate = require_ctx(entity.single_bidder_rate, "entity single-bidder rate")?;
    Ok(Signal::new(ramp(rate, 0.2, 0.7), (f64::from(entity.awards) / 30.0).min(1.0))
        .with("entity_single_bidder_rate", rate)
        .with("entity_awards", entity.awards))
}

fn restricted_procedure(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let procedure = require(r.procedure_type, "procedure_type")?;
    let score = match procedure {
        ProcedureType::Open => 0.0,
        ProcedureType::Restricted | ProcedureType::CompetitiveDialogue => 40.0,
        ProcedureType::NegotiatedWithPublication => 60.0,
        ProcedureType::NegotiatedWithoutPublication | ProcedureType::DirectAward => 85.0,
    };
    Ok(Signal::new(score, 1.0).with("procedure_type", procedure.as_str()))
}

fn buyer_concentration(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let entity = require_ctx(ctx.entity.as_ref(), "entity profile")?;
    if entity.awards < 5 {
        return Ok(Signal::clear(0.2).with("entity_awards", entity.awards));
    }
    Ok(Signal::new(ramp(entity.top_winner_share, 0.3, 0.9), (f64::from(entity.awards) / 20.0).min(1.0))
        .with("top_winner_share", entity.top_winner_share)
        .with("distinct_winners", entity.distinct_winners))
}

fn bidder_count_mismatch(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let reported = require(r.num_bidders, "num_bidders")?;
    if r.bids.is_empty() {
        return Err(IndicatorError::MissingData("bids"));
    }
    let listed = r.bids.len() as u32;
    let diff = reported.abs_diff(listed);
    Ok(Signal::new((35.0 * f64::from(diff)).min(100.0), 0.9)
        .with("reported", reported)
        .with("listed", listed))
}

fn cover_bidding(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let amounts = r.valid_amounts();
    if amounts.len() < 3 {
        return Err(IndicatorError::MissingData("three priced valid bids"));
    }
    let lowest = amounts[0];
    let gap = amounts[1] / lowest - 1.0;
    Ok(Signal::new(ramp(gap, 0.10, 0.40), 0.7)
        .with("lowest_bid", lowest)
        .with("runner_up_gap", gap))
}

fn incumbent_field(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let valid = r.valid_bids().count();
    if valid < 2 {
        return Err(IndicatorError::MissingData("two valid bids"));
    }
    let share = f64::from(ctx.incumbent_bidders) / valid as f64;
    Ok(Signal::new(ramp(share, 0.5, 1.0), 0.6)
        .with("incumbent_bidders", ctx.incumbent_bidders)
        .with("valid_bidders", valid))
}
