//! Timing indicators: submission windows, award speed, and calendar effects.

use chrono::{Datelike, NaiveDate, Weekday};

use super::{require, require_ctx, value_scaled_threshold, Indicator, Signal};
use crate::context::IndicatorContext;
use crate::error::IndicatorError;
use crate::stats::ramp;
use crate::types::{FlagType, IndicatorCategory, TenderRecord};

const T: IndicatorCategory = IndicatorCategory::Timing;

pub const INDICATORS: [Indicator; 10] = [
    Indicator::new("short_deadline", T, FlagType::ShortDeadline,
        "Submission window was too short for genuine competition", short_deadline)
        .adaptive(value_scaled_threshold),
    Indicator::new("deadline_vs_segment", T, FlagType::ShortDeadline,
        "Submission window is far shorter than the segment norm", deadline_vs_segment)
        .weight(0.9),
    Indicator::new("rushed_award", T, FlagType::TimingAnomaly,
        "Award decided at or before the submission deadline", rushed_award)
        .threshold(55.0),
    Indicator::new("delayed_award", T, FlagType::TimingAnomaly,
        "Award decision took unusually long", delayed_award)
        .weight(0.6),
    Indicator::new("weekend_activity", T, FlagType::TimingAnomaly,
        "Publication or award happened on a weekend", weekend_activity)
        .weight(0.5),
    Indicator::new("holiday_publication", T, FlagType::TimingAnomaly,
        "Tender published over the year-end holidays", holiday_publication)
        .weight(0.7),
    Indicator::new("year_end_award", T, FlagType::TimingAnomaly,
        "Award made in the budget-flush weeks of December", year_end_award)
        .weight(0.6),
    Indicator::new("signing_before_award", T, FlagType::ProceduralIrregularity,
        "Contract signed before the award decision", signing_before_award)
        .weight(1.3),
    Indicator::new("signing_delay", T, FlagType::TimingAnomaly,
        "Long gap between award and contract signature", signing_delay)
        .weight(0.6),
    Indicator::new("inconsistent_timeline", T, FlagType::ProceduralIrregularity,
        "Deadline, award or signature dated before the publication", inconsistent_timeline)
        .weight(0.8),
];

fn short_deadline(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let days = submission_days(r)?;
    Ok(Signal::new(ramp(days as f64, 30.0, 5.0), 1.0).with("submission_days", days))
}

fn deadline_vs_segment(r: &TenderRecord, ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let days = submission_days(r)?;
    let stats = require_ctx(ctx.segment_stats.as_ref(), "segment_stats")?;
    let median = require_ctx(stats.median_submission_days.filter(|m| *m >= 1.0), "segment median deadline")?;
    let ratio = days as f64 / median;
    Ok(Signal::new(ramp(ratio, 0.8, 0.3), (stats.record_count as f64 / 20.0).min(1.0))
        .with("submission_days", days)
        .with("segment_median_days", median))
}

fn rushed_award(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let deadline = require(r.deadline_date, "deadline_date")?;
    let award = require(r.award_date, "award_date")?;
    let days = (award - deadline).num_days();
    let score = match days {
        d if d < 0 => 90.0,
        0 | 1 => 60.0,
        _ => 0.0,
    };
    Ok(Signal::new(score, 1.0).with("deadline_to_award_days", days))
}

fn delayed_award(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let deadline = require(r.deadline_date, "deadline_date")?;
    let award = require(r.award_date, "award_date")?;
    let days = (award - deadline).num_days();
    Ok(Signal::new(ramp(days as f64, 120.0, 365.0), 0.8).with("deadline_to_award_days", days))
}

fn weekend_activity(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    if r.publication_date.is_none() && r.award_date.is_none() {
        return Err(IndicatorError::MissingData("publication_date and award_date"));
    }
    let hits = [r.publication_date, r.award_date]
        .into_iter()
        .flatten()
        .filter(|d| is_weekend(*d))
        .count();
    let score = match hits {
        0 => 0.0,
        1 => 45.0,
        _ => 70.0,
    };
    Ok(Signal::new(score, 0.7).with("weekend_dates", hits))
}

fn holiday_publication(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let published = require(r.publication_date, "publication_date")?;
    if !is_year_end_holiday(published) {
        return Ok(Signal::clear(0.8));
    }
    let short = r.submission_days().is_some_and(|d| d < 15);
    let score = if short { 75.0 } else { 50.0 };
    Ok(Signal::new(score, 0.8)
        .with("publication_date", published.to_string())
        .with("short_window", short))
}

fn year_end_award(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let award = require(r.award_date, "award_date")?;
    if !(award.month() == 12 && award.day() >= 15) {
        return Ok(Signal::clear(0.8));
    }
    let non_open = r.procedure_type.is_some_and(|p| !p.is_open());
    let score = if non_open { 65.0 } else { 45.0 };
    Ok(Signal::new(score, 0.8)
        .with("award_date", award.to_string())
        .with("non_open_procedure", non_open))
}

fn signing_before_award(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let award = require(r.award_date, "award_date")?;
    let signed = require(r.contract_signing_date, "contract_signing_date")?;
    let days = (signed - award).num_days();
    let score = if days < 0 { 90.0 } else { 0.0 };
    Ok(Signal::new(score, 1.0).with("award_to_signing_days", days))
}

fn signing_delay(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let award = require(r.award_date, "award_date")?;
    let signed = require(r.contract_signing_date, "contract_signing_date")?;
    let days = (signed - award).num_days();
    Ok(Signal::new(ramp(days as f64, 60.0, 240.0), 0.8).with("award_to_signing_days", days))
}

fn inconsistent_timeline(r: &TenderRecord, _ctx: &IndicatorContext) -> Result<Signal, IndicatorError> {
    let published = require(r.publication_date, "publication_date")?;
    let later: Vec<NaiveDate> = [r.deadline_date, r.award_date, r.contract_signing_date]
        .into_iter()
        .flatten()
        .collect();
    if later.is_empty() {
        return Err(IndicatorError::MissingData("deadline, award or signing date"));
    }
    let early = later.iter().filter(|d| **d < published).count();
    let score = match early {
        0 => 0.0,
        1 => 70.0,
        _ => 95.0,
    };
    Ok(Signal::new(score, 1.0)
        .with("dates_before_publication", early)
        .with("dates_checked", later.len()))
}

fn submission_days(r: &TenderRecord) -> Result<i64, IndicatorError> {
    let days = require(r.submission_days(), "publication_date and deadline_date")?;
    if days < 0 {
        return Err(IndicatorError::InvalidValue { field: "submission_days", value: days as f64 });
    }
    Ok(days)
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_year_end_holiday(date: NaiveDate) -> bool {
    (date.month() == 12 && date.day() >= 20) || (date.month() == 1 && date.day() <= 6)
}
