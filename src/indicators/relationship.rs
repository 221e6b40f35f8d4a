//! Relationship indicators: recurring buyer–supplier pairings, bidder
//! groups, and supplier identity.

use std::collections::BTreeSet;

use super::{require, require_ctx, value_scaled_threshold, Indicator, Signal};
use crate::context::{IndicatorContext, ValueBand};
use crate::error::IndicatorError;
use crate::stats::ramp;
use crate::types::{FlagType, IndicatorCategory, TenderRecord};

const R: IndicatorCategory = IndicatorCategory::Relationship;

/// Legal-form suffixes ignored when comparing supplier names.
const LEGAL_SUFFIXES: [&str; 10] = ["ltd", "llc", "inc", "gmbh", "sa", "srl", "spa", "bv", "oy", "plc"];

pub const INDICATORS: [Indicator; 10] = [
    Indicator::new("repeat_winner", R, FlagType::RepeatWinner,
        "Supplier repeatedly wins contracts from the same buyer", repeat_winner)
        .adaptive(value_scaled_threshold),
    Indicator::new("supplier_value_share", R, FlagType::MarketConcentration,
        "Supplier holds a large share of the buyer's spend", supplier_value_share),
    Indicator::new("bid_rotation", R, FlagType::BidRotation,
        "The same bidders meet repeatedly and take turns winning", bid_rotation)
        .weight(1.3),
    Indicator::new("persistent_loser", R, FlagType::CoverBidding,
        "A bidder keeps losing to this winner without ever winning", persistent_loser),
    Indicator::new("new_supplier", R, FlagType::ConnectedParties,
        "Winner has no track record before this award", new_supplier)
        .weight(0.9),
    Indicator::new("dominant_win_rate", R, FlagType::RepeatWinner,
        "Supplier wins almost every tender it enters", dominant_win_rate),
    Indicator::new("captive_buyer", R, FlagType::MarketConcentration,
        "Buyer relies on very few suppliers across many awards", captive_buyer)
        .weight(0.8),
    Indicator::new("single_buyer_supplier", R, FlagType::ConnectedParties,
        "Supplier only ever wins from this one buyer", single_buyer_supplier),
    Indicator::new("similar_bidder_names", R, FlagType::ConnectedParties,
        "Competing bidders share a near-identical name", similar_bidder_names)
        .weight(1.2),
    Indicator::new("outsized_award", R, FlagType::ValueInflation,
        "Award is several times the supplier's usual contract size", outsized_award)
        .weight(0.8),
];

fn repeat_winner(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let pair = require_ctx(ctx.pair.as_ref(), "buyer-supplier pair")?;
    let entity_awards = ctx.entity.as_ref().map_or(0, |e| e.awards);
    if entity_awards < 3 {
        return Ok(Signal::clear(0.3).with("entity_awards", entity_awards));
    }
    Ok(Signal::new(ramp(f64::from(pair.awards), 1.0, 6.0), (f64::from(entity_awards) / 15.0).min(1.0))
        .with("wins_with_entity", pair.awards)
        .with("entity_awards", entity_awards)
        .describe(format!("{} awards from this buyer to the same supplier", pair.awards)))
}

fn supplier_value_share(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let pair = require_ctx(ctx.pair.as_ref(), "buyer-supplier pair")?;
    let entity_awards = ctx.entity.as_ref().map_or(0, |e| e.awards);
    if entity_awards < 3 {
        return Ok(Signal::clear(0.3).with("entity_awards", entity_awards));
    }
    Ok(Signal::new(ramp(pair.value_share, 0.25, 0.75), 0.8)
        .with("value_share", pair.value_share)
        .with("pair_value", pair.total_value))
}

fn bid_rotation(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let group = require_ctx(ctx.bidder_group.as_ref(), "bidder group history")?;
    if group.shared_tenders < 3 || group.wins_by_member.len() < 2 {
        return Ok(Signal::clear(0.5).with("shared_tenders", group.shared_tenders));
    }
    let max = group.wins_by_member.values().copied().max().unwrap_or(0);
    let min = group.wins_by_member.values().copied().min().unwrap_or(0);
    let evenness = if max > 0 { f64::from(min) / f64::from(max) } else { 0.0 };
    let score = ramp(f64::from(group.shared_tenders), 2.0, 6.0) * (0.5 + 0.5 * evenness);
    Ok(Signal::new(score, (f64::from(group.shared_tenders) / 6.0).min(1.0))
        .with("shared_tenders", group.shared_tenders)
        .with("rotating_winners", group.wins_by_member.len())
        .with("evenness", evenness))
}

fn persistent_loser(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    if ctx.losers.is_empty() {
        return Err(IndicatorError::MissingContext("losing bidders"));
    }
    let worst = ctx
        .losers
        .iter()
        .filter(|l| l.wins_at_entity == 0)
        .max_by_key(|l| l.losses_to_winner);
    match worst {
        Some(l) => Ok(Signal::new(ramp(f64::from(l.losses_to_winner), 1.0, 5.0), 0.7)
            .with("bidder", l.bidder.clone())
            .with("losses_to_winner", l.losses_to_winner)),
        None => Ok(Signal::clear(0.7)),
    }
}

fn new_supplier(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let winner = require_ctx(ctx.winner.as_ref(), "winner profile")?;
    let first_seen = require_ctx(winner.first_seen, "winner first appearance")?;
    let award = require(r.award_date, "award_date")?;
    if winner.bids > 2 {
        return Ok(Signal::clear(0.8).with("winner_bids", winner.bids));
    }
    let age_days = (award - first_seen).num_days();
    let scale = match ctx.segment.as_ref().map(|s| s.value_band) {
        Some(ValueBand::Micro) | Some(ValueBand::Small) | None => 0.5,
        _ => 1.0,
    };
    Ok(Signal::new(ramp(age_days as f64, 180.0, 0.0) * scale, 0.6)
        .with("supplier_age_days", age_days)
        .with("winner_bids", winner.bids))
}

fn dominant_win_rate(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let winner = require_ctx(ctx.winner.as_ref(), "winner profile")?;
    if winner.bids < 5 {
        return Ok(Signal::clear(0.3).with("winner_bids", winner.bids));
    }
    let rate = require_ctx(winner.win_rate(), "winner win rate")?;
    Ok(Signal::new(ramp(rate, 0.6, 1.0), (f64::from(winner.bids) / 20.0).min(1.0))
        .with("win_rate", rate)
        .with("winner_bids", winner.bids))
}

fn captive_buyer(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let entity = require_ctx(ctx.entity.as_ref(), "entity profile")?;
    if entity.awards < 10 || entity.distinct_winners == 0 {
        return Ok(Signal::clear(0.3).with("entity_awards", entity.awards));
    }
    let per_supplier = f64::from(entity.awards) / f64::from(entity.distinct_winners);
    Ok(Signal::new(ramp(per_supplier, 3.0, 10.0), 0.8)
        .with("awards_per_supplier", per_supplier)
        .with("distinct_winners", entity.distinct_winners))
}

fn single_buyer_supplier(_r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let winner = require_ctx(ctx.winner.as_ref(), "winner profile")?;
    if winner.distinct_entities != 1 {
        return Ok(Signal::clear(0.8).with("distinct_buyers", winner.distinct_entities));
    }
    Ok(Signal::new(ramp(f64::from(winner.wins), 2.0, 8.0), 0.7)
        .with("wins", winner.wins)
        .with("distinct_buyers", winner.distinct_entities))
}

fn similar_bidder_names(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    if r.bids.len() < 2 {
        return Err(IndicatorError::MissingData("two bids"));
    }
    let raw: BTreeSet<&str> = r.bids.iter().map(|b| b.bidder.as_str()).collect();
    let normalized: BTreeSet<String> = raw.iter().map(|n| normalize_name(n)).collect();
    let collisions = raw.len() - normalized.len();
    let score = if collisions > 0 { 80.0 } else { 0.0 };
    Ok(Signal::new(score, 0.7).with("name_collisions", collisions))
}

fn outsized_award(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let value = require(r.value(), "value")?;
    let winner = require_ctx(ctx.winner.as_ref(), "winner profile")?;
    if winner.wins < 3 {
        return Ok(Signal::clear(0.3).with("wins", winner.wins));
    }
    let mean = require_ctx(winner.mean_award_value.filter(|m| *m > 0.0), "winner mean award")?;
    let ratio = value / mean;
    Ok(Signal::new(ramp(ratio, 2.0, 5.0), 0.6)
        .with("value", value)
        .with("winner_mean_award", mean)
        .with("ratio", ratio))
}

/// Lowercase alphanumeric tokens with legal-form suffixes removed.
fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !LEGAL_SUFFIXES.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::context::{BidderGroupHistory, EntityProfile, LoserStat, PairStats, WinnerProfile};
    use crate::types::Bid;

    #[test]
    fn names_normalize_across_legal_forms() {
        assert_eq!(normalize_name("ACME Building Ltd."), "acme building");
        assert_eq!(normalize_name("Acme-Building LLC"), "acme building");
    }

    #[test]
    fn similar_names_collide() {
        let mut r = TenderRecord::new("t");
        r.bids = ["Acme Building Ltd", "ACME BUILDING LLC", "Other SA"]
            .iter()
            .map(|n| Bid { bidder: n.to_string(), amount: None, disqualified: false })
            .collect();
        let s = similar_bidder_names(&r, &IndicatorContext::default()).unwrap();
        assert_eq!(s.score, 80.0);
    }

    #[test]
    fn repeat_winner_scales_with_pair_awards() {
        let ctx = IndicatorContext {
            pair: Some(PairStats { awards: 6, total_value: 1.0, value_share: 0.5 }),
            entity: Some(EntityProfile { awards: 15, ..EntityProfile::default() }),
            ..IndicatorContext::default()
        };
        let s = repeat_winner(&TenderRecord::new("t"), &ctx).unwrap();
        assert_eq!(s.score, 100.0);
        assert_eq!(s.confidence, 1.0);
    }

    #[test]
    fn rotation_needs_several_winners() {
        let mut wins = BTreeMap::new();
        wins.insert("a".to_string(), 3);
        wins.insert("b".to_string(), 3);
        let ctx = IndicatorContext {
            bidder_group: Some(BidderGroupHistory { shared_tenders: 6, wins_by_member: wins }),
            ..IndicatorContext::default()
        };
        assert_eq!(bid_rotation(&TenderRecord::new("t"), &ctx).unwrap().score, 100.0);

        let mut solo = BTreeMap::new();
        solo.insert("a".to_string(), 6);
        let ctx = IndicatorContext {
            bidder_group: Some(BidderGroupHistory { shared_tenders: 6, wins_by_member: solo }),
            ..IndicatorContext::default()
        };
        assert_eq!(bid_rotation(&TenderRecord::new("t"), &ctx).unwrap().score, 0.0);
    }

    #[test]
    fn persistent_loser_ignores_bidders_with_wins() {
        let ctx = IndicatorContext {
            losers: vec![
                LoserStat { bidder: "x".to_string(), losses_to_winner: 9, wins_at_entity: 2 },
                LoserStat { bidder: "y".to_string(), losses_to_winner: 3, wins_at_entity: 0 },
            ],
            ..IndicatorContext::default()
        };
        let s = persistent_loser(&TenderRecord::new("t"), &ctx).unwrap();
        assert!((s.score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn dominant_win_rate_requires_history() {
        let ctx = IndicatorContext {
            winner: Some(WinnerProfile { wins: 10, bids: 10, ..WinnerProfile::default() }),
            ..IndicatorContext::default()
        };
        assert_eq!(dominant_win_rate(&TenderRecord::new("t"), &ctx).unwrap().score, 100.0);
    }
}
