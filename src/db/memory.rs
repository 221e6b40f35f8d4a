use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use dashmap::DashMap;

use super::{empty_level_counts, RiskStore};
use crate::error::{AppError, Result};
use crate::types::{Flag, RiskLevel, RiskScore, TenderRecord};

/// DashMap-backed store with the same contract as [`super::SqliteStore`].
/// Used by tests; can be told to fail the next N score batches.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, TenderRecord>,
    flags: DashMap<i64, Flag>,
    flag_keys: DashMap<(String, String), i64>,
    scores: DashMap<String, RiskScore>,
    next_flag_id: AtomicI64,
    failing_upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_records(&self, records: impl IntoIterator<Item = TenderRecord>) {
        for r in records {
            self.records.insert(r.id.clone(), r);
        }
    }

    /// The next `n` calls to `upsert_scores` fail without writing.
    pub fn fail_next_upserts(&self, n: usize) {
        self.failing_upserts.store(n, Ordering::SeqCst);
    }

    pub fn score_count(&self) -> usize {
        self.scores.len()
    }

    pub fn flag_count(&self) -> usize {
        self.flags.len()
    }

    pub fn all_scores(&self) -> Vec<RiskScore> {
        let mut rows: Vec<RiskScore> = self.scores.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        rows
    }

    fn take_failure(&self) -> bool {
        self.failing_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn insert_flag(&self, flag: &Flag) {
        let id = self.next_flag_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = flag.clone();
        stored.id = Some(id);
        if let Some(name) = &flag.indicator {
            self.flag_keys.insert((flag.record_id.clone(), name.clone()), id);
        }
        self.flags.insert(id, stored);
    }
}

impl RiskStore for MemoryStore {
    async fn in_scope_records(&self) -> Result<Vec<TenderRecord>> {
        let mut out: Vec<TenderRecord> = self
            .records
            .iter()
            .filter(|e| e.value().status.in_scope())
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn load_record(&self, record_id: &str) -> Result<Option<TenderRecord>> {
        Ok(self.records.get(record_id).map(|r| r.value().clone()))
    }

    async fn flags_for(&self, record_ids: &[String]) -> Result<HashMap<String, Vec<Flag>>> {
        let mut out: HashMap<String, Vec<Flag>> = HashMap::new();
        for entry in self.flags.iter() {
            let flag = entry.value();
            if record_ids.contains(&flag.record_id) {
                out.entry(flag.record_id.clone()).or_default().push(flag.clone());
            }
        }
        for flags in out.values_mut() {
            flags.sort_by_key(|f| f.id);
        }
        Ok(out)
    }

    async fn save_flags(&self, flags: &[Flag]) -> Result<()> {
        for flag in flags {
            let existing = flag
                .indicator
                .as_ref()
                .and_then(|name| self.flag_keys.get(&(flag.record_id.clone(), name.clone())).map(|id| *id));
            match existing.and_then(|id| self.flags.get_mut(&id)) {
                Some(mut stored) => {
                    let keep_id = stored.id;
                    let keep_fp = stored.is_false_positive;
                    *stored = flag.clone();
                    stored.id = keep_id;
                    stored.is_false_positive = keep_fp;
                }
                None => self.insert_flag(flag),
            }
        }
        Ok(())
    }

    async fn mark_false_positive(&self, flag_id: i64) -> Result<()> {
        match self.flags.get_mut(&flag_id) {
            Some(mut flag) => {
                flag.is_false_positive = true;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("flag {flag_id}"))),
        }
    }

    async fn upsert_scores(&self, rows: &[RiskScore]) -> Result<()> {
        if self.take_failure() {
            return Err(AppError::Injected(format!("upsert of {} rows", rows.len())));
        }
        for row in rows {
            self.scores.insert(row.record_id.clone(), row.clone());
        }
        Ok(())
    }

    async fn risk_score(&self, record_id: &str) -> Result<Option<RiskScore>> {
        Ok(self.scores.get(record_id).map(|r| r.value().clone()))
    }

    async fn risk_level_counts(&self) -> Result<BTreeMap<RiskLevel, u64>> {
        let mut counts = empty_level_counts();
        for entry in self.scores.iter() {
            *counts.entry(entry.value().risk_level).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
