use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::risk_thresholds;

/// Structured key/value evidence attached to indicator results and flags.
pub type Evidence = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Flag types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    SingleBidder,
    LowCompetition,
    RepeatWinner,
    MarketConcentration,
    BidRotation,
    CoverBidding,
    PriceAnomaly,
    BidClustering,
    ValueInflation,
    ContractSplitting,
    ContractAmendment,
    ShortDeadline,
    TimingAnomaly,
    ConnectedParties,
    ProceduralIrregularity,
}

impl FlagType {
    pub const ALL: [FlagType; 15] = [
        FlagType::SingleBidder,
        FlagType::LowCompetition,
        FlagType::RepeatWinner,
        FlagType::MarketConcentration,
        FlagType::BidRotation,
        FlagType::CoverBidding,
        FlagType::PriceAnomaly,
        FlagType::BidClustering,
        FlagType::ValueInflation,
        FlagType::ContractSplitting,
        FlagType::ContractAmendment,
        FlagType::ShortDeadline,
        FlagType::TimingAnomaly,
        FlagType::ConnectedParties,
        FlagType::ProceduralIrregularity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FlagType::SingleBidder => "single_bidder",
            FlagType::LowCompetition => "low_competition",
            FlagType::RepeatWinner => "repeat_winner",
            FlagType::MarketConcentration => "market_concentration",
            FlagType::BidRotation => "bid_rotation",
            FlagType::CoverBidding => "cover_bidding",
            FlagType::PriceAnomaly => "price_anomaly",
            FlagType::BidClustering => "bid_clustering",
            FlagType::ValueInflation => "value_inflation",
            FlagType::ContractSplitting => "contract_splitting",
            FlagType::ContractAmendment => "contract_amendment",
            FlagType::ShortDeadline => "short_deadline",
            FlagType::TimingAnomaly => "timing_anomaly",
            FlagType::ConnectedParties => "connected_parties",
            FlagType::ProceduralIrregularity => "procedural_irregularity",
        }
    }
}

impl std::fmt::Display for FlagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FlagType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlagType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown flag type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Severity::Critical
        } else if score >= 60.0 {
            Severity::High
        } else if score >= 40.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A persisted signal attached to a record. Flags are never deleted; a
/// manual review marks them false positive, which removes them from
/// aggregation only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    /// Storage id, `None` until persisted.
    pub id: Option<i64>,
    pub record_id: String,
    pub flag_type: FlagType,
    /// Name of the indicator that raised the flag, if any.
    pub indicator: Option<String>,
    pub severity: Severity,
    pub score: f64,
    /// Weight of the raising indicator; 1.0 for flags from elsewhere.
    pub weight: f64,
    pub description: String,
    pub evidence: Evidence,
    pub is_false_positive: bool,
}

impl Flag {
    pub fn new(record_id: impl Into<String>, flag_type: FlagType, score: f64) -> Self {
        Self {
            id: None,
            record_id: record_id.into(),
            flag_type,
            indicator: None,
            severity: Severity::from_score(score),
            score,
            weight: 1.0,
            description: String::new(),
            evidence: Evidence::new(),
            is_false_positive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Indicator results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorCategory {
    Competition,
    Price,
    Timing,
    Relationship,
    Procedural,
}

impl IndicatorCategory {
    pub const ALL: [IndicatorCategory; 5] = [
        IndicatorCategory::Competition,
        IndicatorCategory::Price,
        IndicatorCategory::Timing,
        IndicatorCategory::Relationship,
        IndicatorCategory::Procedural,
    ];
}

impl std::fmt::Display for IndicatorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndicatorCategory::Competition => "competition",
            IndicatorCategory::Price => "price",
            IndicatorCategory::Timing => "timing",
            IndicatorCategory::Relationship => "relationship",
            IndicatorCategory::Procedural => "procedural",
        };
        write!(f, "{s}")
    }
}

/// Output of one indicator on one record. Intermediate value consumed by
/// the aggregator; persisted only when turned into a [`Flag`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorResult {
    pub indicator_name: String,
    pub category: IndicatorCategory,
    pub flag_type: FlagType,
    /// Always in [0, 100].
    pub score: f64,
    pub weight: f64,
    pub threshold: f64,
    pub evidence: Evidence,
    pub description: String,
    /// Always in [0, 1].
    pub confidence: f64,
    /// `score >= threshold`.
    pub triggered: bool,
}

impl IndicatorResult {
    /// Converts a triggered result into a flag for persistence.
    pub fn to_flag(&self, record_id: &str) -> Option<Flag> {
        if !self.triggered {
            return None;
        }
        Some(Flag {
            id: None,
            record_id: record_id.to_string(),
            flag_type: self.flag_type,
            indicator: Some(self.indicator_name.clone()),
            severity: Severity::from_score(self.score),
            score: self.score,
            weight: self.weight,
            description: self.description.clone(),
            evidence: self.evidence.clone(),
            is_false_positive: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Risk score
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Minimal,
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    /// Pure function of the score; identical for every scoring path.
    pub fn from_score(score: u8) -> Self {
        use risk_thresholds::*;
        if score >= CRITICAL_MIN {
            RiskLevel::Critical
        } else if score >= HIGH_MIN {
            RiskLevel::High
        } else if score >= MEDIUM_MIN {
            RiskLevel::Medium
        } else if score >= LOW_MIN {
            RiskLevel::Low
        } else {
            RiskLevel::Minimal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Minimal => "minimal",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RiskLevel::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown risk level: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UncertaintyLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for UncertaintyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UncertaintyLevel::Low => "low",
            UncertaintyLevel::Medium => "medium",
            UncertaintyLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UncertaintyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(UncertaintyLevel::Low),
            "medium" => Ok(UncertaintyLevel::Medium),
            "high" => Ok(UncertaintyLevel::High),
            other => Err(format!("unknown uncertainty level: {other}")),
        }
    }
}

/// The durable output: exactly one row per record, replaced on re-analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub record_id: String,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub flag_count: u32,
    /// JSON summary of the signals behind the score.
    pub flags_summary: String,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub uncertainty_level: UncertaintyLevel,
    pub data_completeness: f64,
    /// Nanosecond UTC epoch timestamp.
    pub last_analyzed: i64,
}

// ---------------------------------------------------------------------------
// Tender record: minimal attributes read from the data layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderStatus {
    Published,
    Awarded,
    Completed,
    Cancelled,
}

impl TenderStatus {
    /// Awarded and completed tenders are scored by the coverage run.
    pub fn in_scope(self) -> bool {
        matches!(self, TenderStatus::Awarded | TenderStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TenderStatus::Published => "published",
            TenderStatus::Awarded => "awarded",
            TenderStatus::Completed => "completed",
            TenderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TenderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "published" => Ok(TenderStatus::Published),
            "awarded" => Ok(TenderStatus::Awarded),
            "completed" => Ok(TenderStatus::Completed),
            "cancelled" => Ok(TenderStatus::Cancelled),
            other => Err(format!("unknown tender status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureType {
    Open,
    Restricted,
    CompetitiveDialogue,
    NegotiatedWithPublication,
    NegotiatedWithoutPublication,
    DirectAward,
}

impl ProcedureType {
    /// Anything other than an open procedure limits who may bid.
    pub fn is_open(self) -> bool {
        matches!(self, ProcedureType::Open)
    }

    pub fn is_unpublished(self) -> bool {
        matches!(self, ProcedureType::NegotiatedWithoutPublication | ProcedureType::DirectAward)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcedureType::Open => "open",
            ProcedureType::Restricted => "restricted",
            ProcedureType::CompetitiveDialogue => "competitive_dialogue",
            ProcedureType::NegotiatedWithPublication => "negotiated_with_publication",
            ProcedureType::NegotiatedWithoutPublication => "negotiated_without_publication",
            ProcedureType::DirectAward => "direct_award",
        }
    }
}

impl std::str::FromStr for ProcedureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ProcedureType::Open),
            "restricted" => Ok(ProcedureType::Restricted),
            "competitive_dialogue" => Ok(ProcedureType::CompetitiveDialogue),
            "negotiated_with_publication" => Ok(ProcedureType::NegotiatedWithPublication),
            "negotiated_without_publication" => Ok(ProcedureType::NegotiatedWithoutPublication),
            "direct_award" => Ok(ProcedureType::DirectAward),
            other => Err(format!("unknown procedure type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EvaluationCriteria {
    LowestPrice,
    /// Most economically advantageous tender; `price_weight` in [0, 1].
    BestValue { price_weight: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bidder: String,
    pub amount: Option<f64>,
    pub disqualified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub id: String,
    pub title: Option<String>,
    pub procuring_entity: Option<String>,
    pub winner: Option<String>,
    /// Common Procurement Vocabulary code, e.g. "45233140-2".
    pub cpv_code: Option<String>,
    pub procedure_type: Option<ProcedureType>,
    pub status: TenderStatus,
    pub num_bidders: Option<u32>,
    pub estimated_value: Option<f64>,
    pub awarded_value: Option<f64>,
    /// Final contract value after amendments.
    pub amended_value: Option<f64>,
    pub amendment_count: u32,
    pub complaint_count: u32,
    pub num_lots: Option<u32>,
    pub evaluation_criteria: Option<EvaluationCriteria>,
    pub publication_date: Option<NaiveDate>,
    pub deadline_date: Option<NaiveDate>,
    pub award_date: Option<NaiveDate>,
    pub contract_signing_date: Option<NaiveDate>,
    pub bids: Vec<Bid>,
}

impl TenderRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            procuring_entity: None,
            winner: None,
            cpv_code: None,
            procedure_type: None,
            status: TenderStatus::Awarded,
            num_bidders: None,
            estimated_value: None,
            awarded_value: None,
            amended_value: None,
            amendment_count: 0,
            complaint_count: 0,
            num_lots: None,
            evaluation_criteria: None,
            publication_date: None,
            deadline_date: None,
            award_date: None,
            contract_signing_date: None,
            bids: Vec::new(),
        }
    }

    /// Awarded value, falling back to the estimate.
    pub fn value(&self) -> Option<f64> {
        self.awarded_value.or(self.estimated_value).filter(|v| v.is_finite() && *v > 0.0)
    }

    /// First two CPV digits, the procurement division.
    pub fn cpv_division(&self) -> Option<&str> {
        let code = self.cpv_code.as_deref()?;
        if code.len() >= 2 && code.is_char_boundary(2) {
            Some(&code[..2])
        } else {
            None
        }
    }

    /// Days between publication and submission deadline.
    pub fn submission_days(&self) -> Option<i64> {
        Some((self.deadline_date? - self.publication_date?).num_days())
    }

    /// Bidder count, falling back to the bid list when the count is not reported.
    pub fn bidder_count(&self) -> Option<u32> {
        match self.num_bidders {
            Some(n) => Some(n),
            None if !self.bids.is_empty() => Some(self.bids.len() as u32),
            None => None,
        }
    }

    pub fn valid_bids(&self) -> impl Iterator<Item = &Bid> {
        self.bids.iter().filter(|b| !b.disqualified)
    }

    /// Amounts of valid bids, ascending.
    pub fn valid_amounts(&self) -> Vec<f64> {
        let mut amounts: Vec<f64> = self
            .valid_bids()
            .filter_map(|b| b.amount)
            .filter(|a| a.is_finite() && *a > 0.0)
            .collect();
        amounts.sort_by(|a, b| a.total_cmp(b));
        amounts
    }

    pub fn winner_bid(&self) -> Option<&Bid> {
        let winner = self.winner.as_deref()?;
        self.bids.iter().find(|b| b.bidder == winner)
    }
}

/// Nanoseconds since the UNIX epoch, as stored in `last_analyzed`.
pub fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
