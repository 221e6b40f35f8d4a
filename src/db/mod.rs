//! Storage boundary: read records and flags, write flags and risk rows.

pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use crate::error::Result;
use crate::types::{Flag, RiskLevel, RiskScore, TenderRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub trait RiskStore: Send + Sync + 'static {
    /// Awarded and completed records, ordered by id.
    fn in_scope_records(&self) -> impl Future<Output = Result<Vec<TenderRecord>>> + Send;

    fn load_record(&self, record_id: &str) -> impl Future<Output = Result<Option<TenderRecord>>> + Send;

    /// All flags, false positives included, keyed by record id.
    fn flags_for(&self, record_ids: &[String]) -> impl Future<Output = Result<HashMap<String, Vec<Flag>>>> + Send;

    /// Upserts on (record id, indicator). Never clears a false-positive mark
    /// and never deletes.
    fn save_flags(&self, flags: &[Flag]) -> impl Future<Output = Result<()>> + Send;

    fn mark_false_positive(&self, flag_id: i64) -> impl Future<Output = Result<()>> + Send;

    /// Insert-or-replace keyed on record id; all rows or none.
    fn upsert_scores(&self, rows: &[RiskScore]) -> impl Future<Output = Result<()>> + Send;

    fn risk_score(&self, record_id: &str) -> impl Future<Output = Result<Option<RiskScore>>> + Send;

    /// Table-wide row count per level; levels with no rows are present with 0.
    fn risk_level_counts(&self) -> impl Future<Output = Result<BTreeMap<RiskLevel, u64>>> + Send;
}

pub(crate) fn empty_level_counts() -> BTreeMap<RiskLevel, u64> {
    RiskLevel::ALL.into_iter().map(|l| (l, 0)).collect()
}
