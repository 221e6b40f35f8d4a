//! Precomputed, read-only context for indicators: market-segment statistics
//! and supplier/buyer histories built once per run from the in-scope corpus.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::SPLITTING_WINDOW_DAYS;
use crate::types::TenderRecord;

/// Segments smaller than this fall back to division-wide statistics.
const MIN_SEGMENT_SIZE: usize = 5;

/// A bidder counts as an incumbent once it has bid this many times at an entity.
const INCUMBENT_MIN_BIDS: u32 = 3;

// ---------------------------------------------------------------------------
// Market segment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueBand {
    /// < 10k
    Micro,
    /// 10k–100k
    Small,
    /// 100k–1M
    Medium,
    /// 1M–10M
    Large,
    /// >= 10M
    Major,
}

impl ValueBand {
    pub fn from_value(value: f64) -> Self {
        if value < 10_000.0 {
            ValueBand::Micro
        } else if value < 100_000.0 {
            ValueBand::Small
        } else if value < 1_000_000.0 {
            ValueBand::Medium
        } else if value < 10_000_000.0 {
            ValueBand::Large
        } else {
            ValueBand::Major
        }
    }

    pub fn is_high_value(self) -> bool {
        matches!(self, ValueBand::Large | ValueBand::Major)
    }
}

impl std::fmt::Display for ValueBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueBand::Micro => "micro",
            ValueBand::Small => "small",
            ValueBand::Medium => "medium",
            ValueBand::Large => "large",
            ValueBand::Major => "major",
        };
        write!(f, "{s}")
    }
}

/// Procurement category plus value band; drives adaptive thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketSegment {
    pub cpv_division: String,
    pub value_band: ValueBand,
}

impl MarketSegment {
    pub fn of(record: &TenderRecord) -> Option<Self> {
        Some(Self {
            cpv_division: record.cpv_division()?.to_string(),
            value_band: ValueBand::from_value(record.value()?),
        })
    }
}

// ---------------------------------------------------------------------------
// Context values handed to indicators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub record_count: usize,
    pub median_value: Option<f64>,
    pub mean_value: Option<f64>,
    pub std_value: Option<f64>,
    pub median_bidders: Option<f64>,
    pub median_submission_days: Option<f64>,
    pub single_bidder_rate: Option<f64>,
    /// Median of `1 - awarded / estimated`.
    pub median_discount: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WinnerProfile {
    pub wins: u32,
    /// Tenders the supplier bid on (including wins without a bid list).
    pub bids: u32,
    pub distinct_entities: u32,
    pub first_seen: Option<NaiveDate>,
    pub mean_award_value: Option<f64>,
    pub total_value: f64,
}

impl WinnerProfile {
    pub fn win_rate(&self) -> Option<f64> {
        (self.bids > 0).then(|| f64::from(self.wins) / f64::from(self.bids))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityProfile {
    pub awards: u32,
    pub distinct_winners: u32,
    /// Share of awards going to the entity's most frequent winner.
    pub top_winner_share: f64,
    pub single_bidder_rate: Option<f64>,
    pub total_value: f64,
}

/// Awards from one entity to one winner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairStats {
    pub awards: u32,
    pub total_value: f64,
    /// Share of the entity's total awarded value.
    pub value_share: f64,
}

/// Past tenders at the same entity where two or more of this record's
/// valid bidders competed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BidderGroupHistory {
    pub shared_tenders: u32,
    pub wins_by_member: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoserStat {
    pub bidder: String,
    /// Tenders at this entity where the bidder lost to this record's winner.
    pub losses_to_winner: u32,
    pub wins_at_entity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedAward {
    pub record_id: String,
    pub value: Option<f64>,
    pub award_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorContext {
    pub segment: Option<MarketSegment>,
    pub segment_stats: Option<SegmentStats>,
    pub winner: Option<WinnerProfile>,
    pub entity: Option<EntityProfile>,
    pub pair: Option<PairStats>,
    pub bidder_group: Option<BidderGroupHistory>,
    pub losers: Vec<LoserStat>,
    /// Same entity, CPV division and winner, awarded within the splitting window.
    pub related_awards: Vec<RelatedAward>,
    /// Valid bidders with a long participation history at this entity.
    pub incumbent_bidders: u32,
}

// ---------------------------------------------------------------------------
// ContextIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AwardRef {
    record_id: String,
    winner: Option<String>,
    cpv_division: Option<String>,
    value: Option<f64>,
    award_date: Option<NaiveDate>,
    bidders: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct ContextIndex {
    segments: HashMap<MarketSegment, SegmentStats>,
    divisions: HashMap<String, SegmentStats>,
    winners: HashMap<String, WinnerProfile>,
    entities: HashMap<String, EntityProfile>,
    pairs: HashMap<(String, String), PairStats>,
    participation: HashMap<(String, String), u32>,
    awards_by_entity: HashMap<String, Vec<AwardRef>>,
}

impl ContextIndex {
    pub fn build(records: &[TenderRecord]) -> Self {
        let mut index = ContextIndex::default();
        index.build_segments(records);
        index.build_histories(records);
        index
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn context_for(&self, record: &TenderRecord) -> IndicatorContext {
        let segment = MarketSegment::of(record);
        let segment_stats = segment
            .as_ref()
            .and_then(|s| self.segments.get(s))
            .filter(|s| s.record_count >= MIN_SEGMENT_SIZE)
            .or_else(|| record.cpv_division().and_then(|d| self.divisions.get(d)))
            .cloned();

        let winner = record.winner.as_ref().and_then(|w| self.winners.get(w)).cloned();
        let entity = record
            .procuring_entity
            .as_ref()
            .and_then(|e| self.entities.get(e))
            .cloned();
        let pair = match (&record.procuring_entity, &record.winner) {
            (Some(e), Some(w)) => self.pairs.get(&(e.clone(), w.clone())).cloned(),
            _ => None,
        };

        let empty = Vec::new();
        let awards = record
            .procuring_entity
            .as_ref()
            .and_then(|e| self.awards_by_entity.get(e))
            .unwrap_or(&empty);

        let incumbent_bidders = record
            .procuring_entity
            .as_ref()
            .map(|e| {
                record
                    .valid_bids()
                    .filter(|b| {
                        self.participation
                            .get(&(e.clone(), b.bidder.clone()))
                            .is_some_and(|n| *n > INCUMBENT_MIN_BIDS)
                    })
                    .count() as u32
            })
            .unwrap_or(0);

        IndicatorContext {
            segment,
            segment_stats,
            winner,
            entity,
            pair,
            bidder_group: bidder_group_history(record, awards),
            losers: loser_stats(record, awards),
            related_awards: related_awards(record, awards),
            incumbent_bidders,
        }
    }

    fn build_segments(&mut self, records: &[TenderRecord]) {
        let mut by_segment: HashMap<MarketSegment, Vec<&TenderRecord>> = HashMap::new();
        let mut by_division: HashMap<String, Vec<&TenderRecord>> = HashMap::new();
        for record in records {
            if let Some(segment) = MarketSegment::of(record) {
                by_segment.entry(segment).or_default().push(record);
            }
            if let Some(division) = record.cpv_division() {
                by_division.entry(division.to_string()).or_default().push(record);
            }
        }
        self.segments = by_segment
            .into_iter()
            .map(|(k, v)| (k, segment_stats(&v)))
            .collect();
        self.divisions = by_division
            .into_iter()
            .map(|(k, v)| (k, segment_stats(&v)))
            .collect();
    }

    fn build_histories(&mut self, records: &[TenderRecord]) {
        let mut winner_entities: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut winner_values: HashMap<String, Vec<f64>> = HashMap::new();
        let mut entity_winner_counts: HashMap<String, HashMap<String, u32>> = HashMap::new();
        let mut entity_single: HashMap<String, (u32, u32)> = HashMap::new();

        for record in records {
            let bidders: BTreeSet<String> = record.valid_bids().map(|b| b.bidder.clone()).collect();
            let first_date = record.publication_date.or(record.award_date);

            for bidder in record.bids.iter().map(|b| &b.bidder).collect::<BTreeSet<_>>() {
                let profile = self.winners.entry(bidder.clone()).or_default();
                profile.bids += 1;
                profile.first_seen = earliest(profile.first_seen, first_date);
                if let Some(entity) = &record.procuring_entity {
                    *self.participation.entry((entity.clone(), bidder.clone())).or_default() += 1;
                }
            }

            if let Some(winner) = &record.winner {
                let profile = self.winners.entry(winner.clone()).or_default();
                profile.wins += 1;
                if !record.bids.iter().any(|b| &b.bidder == winner) {
                    profile.bids += 1;
                    profile.first_seen = earliest(profile.first_seen, first_date);
                }
                if let Some(v) = record.value() {
                    profile.total_value += v;
                    winner_values.entry(winner.clone()).or_default().push(v);
                }
                if let Some(entity) = &record.procuring_entity {
                    winner_entities.entry(winner.clone()).or_default().insert(entity.clone());
                    *entity_winner_counts
                        .entry(entity.clone())
                        .or_default()
                        .entry(winner.clone())
                        .or_default() += 1;
                    let pair = self.pairs.entry((entity.clone(), winner.clone())).or_default();
                    pair.awards += 1;
                    pair.total_value += record.value().unwrap_or(0.0);
                }
            }

            if let Some(entity) = &record.procuring_entity {
                let profile = self.entities.entry(entity.clone()).or_default();
                profile.awards += 1;
                profile.total_value += record.value().unwrap_or(0.0);
                if let Some(n) = record.bidder_count() {
                    let counts = entity_single.entry(entity.clone()).or_default();
                    counts.1 += 1;
                    if n == 1 {
                        counts.0 += 1;
                    }
                }
                self.awards_by_entity.entry(entity.clone()).or_default().push(AwardRef {
                    record_id: record.id.clone(),
                    winner: record.winner.clone(),
                    cpv_division: record.cpv_division().map(str::to_string),
                    value: record.value(),
                    award_date: record.award_date,
                    bidders,
                });
            }
        }

        for (winner, profile) in self.winners.iter_mut() {
            profile.distinct_entities = winner_entities.get(winner).map_or(0, |s| s.len() as u32);
            profile.mean_award_value = winner_values.get(winner).and_then(|v| mean(v));
        }

        for (entity, profile) in self.entities.iter_mut() {
            if let Some(counts) = entity_winner_counts.get(entity) {
                profile.distinct_winners = counts.len() as u32;
                let top = counts.values().copied().max().unwrap_or(0);
                profile.top_winner_share = f64::from(top) / f64::from(profile.awards.max(1));
            }
            profile.single_bidder_rate = entity_single
                .get(entity)
                .filter(|(_, known)| *known > 0)
                .map(|(single, known)| f64::from(*single) / f64::from(*known));
        }

        for ((entity, _), pair) in self.pairs.iter_mut() {
            let total = self.entities.get(entity).map_or(0.0, |e| e.total_value);
            pair.value_share = if total > 0.0 { pair.total_value / total } else { 0.0 };
        }
    }
}

fn segment_stats(records: &[&TenderRecord]) -> SegmentStats {
    let values: Vec<f64> = records.iter().filter_map(|r| r.value()).collect();
    let bidders: Vec<f64> = records
        .iter()
        .filter_map(|r| r.bidder_count())
        .map(f64::from)
        .collect();
    let days: Vec<f64> = records
        .iter()
        .filter_map(|r| r.submission_days())
        .filter(|d| *d >= 0)
        .map(|d| d as f64)
        .collect();
    let discounts: Vec<f64> = records
        .iter()
        .filter_map(|r| match (r.awarded_value, r.estimated_value) {
            (Some(a), Some(e)) if e > 0.0 => Some(1.0 - a / e),
            _ => None,
        })
        .collect();
    let single_rate = (!bidders.is_empty())
        .then(|| bidders.iter().filter(|b| **b == 1.0).count() as f64 / bidders.len() as f64);

    SegmentStats {
        record_count: records.len(),
        median_value: median(&values),
        mean_value: mean(&values),
        std_value: population_std_dev(&values),
        median_bidders: median(&bidders),
        median_submission_days: median(&days),
        single_bidder_rate: single_rate,
        median_discount: median(&discounts),
    }
}

// statrs returns NaN for empty input; segment stats want `None` instead.

fn mean(values: &[f64]) -> Option<f64> {
    use statrs::statistics::Statistics;
    (!values.is_empty()).then(|| values.iter().mean())
}

fn population_std_dev(values: &[f64]) -> Option<f64> {
    use statrs::statistics::Statistics;
    (!values.is_empty()).then(|| values.iter().population_std_dev())
}

fn median(values: &[f64]) -> Option<f64> {
    use statrs::statistics::{Data, OrderStatistics};
    (!values.is_empty()).then(|| Data::new(values.to_vec()).median())
}

fn earliest(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn bidder_group_history(record: &TenderRecord, awards: &[AwardRef]) -> Option<BidderGroupHistory> {
    let group: BTreeSet<&str> = record.valid_bids().map(|b| b.bidder.as_str()).collect();
    if group.len() < 2 {
        return None;
    }
    let mut history = BidderGroupHistory::default();
    for award in awards.iter().filter(|a| a.record_id != record.id) {
        let overlap = award.bidders.iter().filter(|b| group.contains(b.as_str())).count();
        if overlap < 2 {
            continue;
        }
        history.shared_tenders += 1;
        if let Some(w) = award.winner.as_ref().filter(|w| group.contains(w.as_str())) {
            *history.wins_by_member.entry(w.clone()).or_default() += 1;
        }
    }
    Some(history)
}

fn loser_stats(record: &TenderRecord, awards: &[AwardRef]) -> Vec<LoserStat> {
    let Some(winner) = record.winner.as_deref() else {
        return Vec::new();
    };
    record
        .valid_bids()
        .filter(|b| b.bidder != winner)
        .map(|b| {
            let mut stat = LoserStat {
                bidder: b.bidder.clone(),
                losses_to_winner: 0,
                wins_at_entity: 0,
            };
            for award in awards.iter().filter(|a| a.record_id != record.id) {
                match award.winner.as_deref() {
                    Some(w) if w == b.bidder => stat.wins_at_entity += 1,
                    Some(w) if w == winner && award.bidders.contains(&b.bidder) => {
                        stat.losses_to_winner += 1
                    }
                    _ => {}
                }
            }
            stat
        })
        .collect()
}

fn related_awards(record: &TenderRecord, awards: &[AwardRef]) -> Vec<RelatedAward> {
    let (Some(winner), Some(division), Some(date)) =
        (record.winner.as_deref(), record.cpv_division(), record.award_date)
    else {
        return Vec::new();
    };
    awards
        .iter()
        .filter(|a| a.record_id != record.id)
        .filter(|a| a.winner.as_deref() == Some(winner))
        .filter(|a| a.cpv_division.as_deref() == Some(division))
        .filter_map(|a| {
            let other = a.award_date?;
            ((other - date).num_days().abs() <= SPLITTING_WINDOW_DAYS).then(|| RelatedAward {
                record_id: a.record_id.clone(),
                value: a.value,
                award_date: other,
            })
        })
        .collect()
}
