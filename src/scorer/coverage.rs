//! Full-coverage scoring: every in-scope record gets exactly one risk row,
//! whether or not any indicator fired.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::confidence::ConfidenceEstimator;
use super::ensemble::AggregationStrategy;
use super::latency::{LatencyPercentiles, LatencyStats};
use super::record_scorer::RecordScorer;
use crate::config::Config;
use crate::context::ContextIndex;
use crate::db::RiskStore;
use crate::error::{AppError, Result};
use crate::indicators::IndicatorRegistry;
use crate::types::{now_ns, Flag, IndicatorResult, RiskLevel, RiskScore, TenderRecord};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageSummary {
    pub records_in_scope: usize,
    pub scored: usize,
    pub baseline_scored: usize,
    pub failed_tasks: usize,
    pub failed_batches: usize,
    /// Levels written by this run.
    pub run_levels: BTreeMap<RiskLevel, u64>,
    /// Levels across the whole score table after the run.
    pub table_levels: BTreeMap<RiskLevel, u64>,
    pub latency: Option<LatencyPercentiles>,
    pub elapsed: Duration,
}

impl CoverageSummary {
    /// Counts and shares per level, highest first.
    pub fn render_table(&self) -> String {
        let total: u64 = self.table_levels.values().sum();
        let mut out = String::new();
        let _ = writeln!(out, "{:<10} {:>8} {:>8}", "level", "records", "share");
        let _ = writeln!(out, "{}", "-".repeat(28));
        for level in RiskLevel::ALL.iter().rev() {
            let n = self.table_levels.get(level).copied().unwrap_or(0);
            let share = if total == 0 { 0.0 } else { 100.0 * n as f64 / total as f64 };
            let _ = writeln!(out, "{:<10} {:>8} {:>7.1}%", level.as_str(), n, share);
        }
        let _ = writeln!(out, "{}", "-".repeat(28));
        let _ = writeln!(out, "{:<10} {:>8}", "total", total);
        let _ = writeln!(
            out,
            "in scope {} | scored {} | baseline {} | failed batches {} | {:.1}s",
            self.records_in_scope,
            self.scored,
            self.baseline_scored,
            self.failed_batches,
            self.elapsed.as_secs_f64(),
        );
        if let Some(p) = self.latency {
            let _ = writeln!(
                out,
                "per-record latency p50 {}us | p95 {}us | p99 {}us",
                p.p50_us, p.p95_us, p.p99_us
            );
        }
        out
    }
}

struct BatchOutcome {
    rows: Vec<RiskScore>,
    fresh_flags: Vec<Flag>,
    baseline: usize,
    failed_tasks: usize,
}

pub struct CoverageRunner<S: RiskStore> {
    store: Arc<S>,
    registry: Arc<IndicatorRegistry>,
    scorer: Arc<RecordScorer>,
    batch_size: usize,
    concurrency: usize,
    evaluate_indicators: bool,
    latency: Arc<LatencyStats>,
}

impl<S: RiskStore> CoverageRunner<S> {
    pub fn new(store: Arc<S>, registry: Arc<IndicatorRegistry>, scorer: RecordScorer) -> Self {
        let defaults = Config::default();
        Self {
            store,
            registry,
            scorer: Arc::new(scorer),
            batch_size: defaults.batch_size,
            concurrency: defaults.worker_concurrency,
            evaluate_indicators: defaults.evaluate_indicators,
            latency: Arc::new(LatencyStats::new()),
        }
    }

    pub fn from_config(store: Arc<S>, registry: Arc<IndicatorRegistry>, cfg: &Config) -> Self {
        let scorer = RecordScorer::new(ConfidenceEstimator::from_config(cfg), cfg.bootstrap_seed);
        Self::new(store, registry, scorer)
            .with_batch_size(cfg.batch_size)
            .with_concurrency(cfg.worker_concurrency)
            .with_indicators(cfg.evaluate_indicators)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_indicators(mut self, evaluate: bool) -> Self {
        self.evaluate_indicators = evaluate;
        self
    }

    pub fn strategy(&self) -> AggregationStrategy {
        self.scorer.estimator().strategy()
    }

    /// Scores every in-scope record. A failed batch write is logged and
    /// counted; the run moves on to the next batch.
    pub async fn run(&self) -> Result<CoverageSummary> {
        let started = Instant::now();
        self.latency.reset();

        let records = self.store.in_scope_records().await?;
        let index = Arc::new(ContextIndex::build(&records));
        let batch_count = records.len().div_ceil(self.batch_size);
        info!(
            records = records.len(),
            segments = index.segment_count(),
            batches = batch_count,
            strategy = %self.strategy(),
            "[COVERAGE] starting run"
        );

        let mut summary = CoverageSummary {
            records_in_scope: records.len(),
            run_levels: crate::db::empty_level_counts(),
            ..CoverageSummary::default()
        };

        for (batch_no, batch) in records.chunks(self.batch_size).enumerate() {
            match self.process_batch(batch, &index).await {
                Ok(outcome) => {
                    summary.scored += outcome.rows.len();
                    summary.baseline_scored += outcome.baseline;
                    summary.failed_tasks += outcome.failed_tasks;
                    for row in &outcome.rows {
                        *summary.run_levels.entry(row.risk_level).or_insert(0) += 1;
                    }
                    debug!(
                        batch = batch_no + 1,
                        rows = outcome.rows.len(),
                        flags = outcome.fresh_flags.len(),
                        "[COVERAGE] batch written"
                    );
                }
                Err(e) => {
                    summary.failed_batches += 1;
                    error!(batch = batch_no + 1, size = batch.len(), "[COVERAGE] batch failed: {e}");
                }
            }
        }

        summary.table_levels = match self.store.risk_level_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("[COVERAGE] could not read level distribution: {e}");
                summary.run_levels.clone()
            }
        };
        summary.latency = self.latency.percentiles();
        summary.elapsed = started.elapsed();

        info!(
            scored = summary.scored,
            baseline = summary.baseline_scored,
            failed_batches = summary.failed_batches,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "[COVERAGE] run complete"
        );
        Ok(summary)
    }

    async fn process_batch(&self, batch: &[TenderRecord], index: &Arc<ContextIndex>) -> Result<BatchOutcome> {
        let ids: Vec<String> = batch.iter().map(|r| r.id.clone()).collect();
        let mut persisted = self.store.flags_for(&ids).await?;
        let now = now_ns();

        let tasks = batch.iter().map(|record| {
            let record = Arc::new(record.clone());
            let flags = persisted.remove(&record.id).unwrap_or_default();
            let registry = Arc::clone(&self.registry);
            let scorer = Arc::clone(&self.scorer);
            let index = Arc::clone(index);
            let latency = Arc::clone(&self.latency);
            let evaluate = self.evaluate_indicators;
            async move {
                let submitted = Instant::now();
                let task_record = Arc::clone(&record);
                let joined = tokio::task::spawn_blocking(move || {
                    let ctx = index.context_for(&task_record);
                    let results = if evaluate {
                        registry.evaluate_record(&task_record, &ctx)
                    } else {
                        Vec::new()
                    };
                    scorer.score(&task_record, &registry, &results, &flags, now)
                })
                .await;
                latency.record(submitted.elapsed());
                (record, joined)
            }
        });

        let finished: Vec<_> = stream::iter(tasks).buffer_unordered(self.concurrency).collect().await;

        let mut outcome = BatchOutcome {
            rows: Vec::with_capacity(finished.len()),
            fresh_flags: Vec::new(),
            baseline: 0,
            failed_tasks: 0,
        };
        for (record, joined) in finished {
            match joined {
                Ok(scored) => {
                    if scored.baseline {
                        outcome.baseline += 1;
                    }
                    outcome.fresh_flags.extend(scored.fresh_flags);
                    outcome.rows.push(scored.score);
                }
                Err(e) => {
                    warn!(record_id = %record.id, "[COVERAGE] scoring task failed, using baseline: {e}");
                    outcome.failed_tasks += 1;
                    outcome.baseline += 1;
                    outcome.rows.push(self.scorer.fallback(&record, now));
                }
            }
        }
        outcome.rows.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        if self.evaluate_indicators {
            self.store.save_flags(&outcome.fresh_flags).await?;
        }
        self.store.upsert_scores(&outcome.rows).await?;
        Ok(outcome)
    }
}

/// Result of an on-demand single-record analysis.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub score: RiskScore,
    pub results: Vec<IndicatorResult>,
    pub flags: Vec<Flag>,
}

/// Scores one record interactively with the weighted-mean-plus-bonus
/// strategy, evaluating its indicators concurrently, and upserts the row.
pub async fn analyze_record<S: RiskStore>(
    store: &S,
    registry: Arc<IndicatorRegistry>,
    index: &ContextIndex,
    record_id: &str,
    estimator: ConfidenceEstimator,
    seed: Option<u64>,
) -> Result<Analysis> {
    let record = store
        .load_record(record_id)
        .await?
        .ok_or_else(|| AppError::NotFound(record_id.to_string()))?;
    let record = Arc::new(record);
    let ctx = Arc::new(index.context_for(&record));
    let results = registry.evaluate_concurrent(Arc::clone(&record), ctx).await;

    let persisted = store
        .flags_for(&[record.id.clone()])
        .await?
        .remove(&record.id)
        .unwrap_or_default();

    let scorer = RecordScorer::new(estimator.with_strategy(AggregationStrategy::WeightedMeanWithBonus), seed);
    let scored = {
        let record = Arc::clone(&record);
        let registry = Arc::clone(&registry);
        let results = results.clone();
        tokio::task::spawn_blocking(move || scorer.score(&record, &registry, &results, &persisted, now_ns())).await?
    };

    store.save_flags(&scored.fresh_flags).await?;
    store.upsert_scores(std::slice::from_ref(&scored.score)).await?;
    info!(
        record_id = %record.id,
        score = scored.score.risk_score,
        level = %scored.score.risk_level,
        flags = scored.score.flag_count,
        "[COVERAGE] record analyzed"
    );

    Ok(Analysis { score: scored.score, results, flags: scored.flags })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::db::MemoryStore;
    use crate::types::{Bid, FlagType, ProcedureType, TenderStatus};

    fn record(id: &str, bidders: Option<u32>) -> TenderRecord {
        let mut r = TenderRecord::new(id);
        r.num_bidders = bidders;
        r
    }

    fn suspicious(id: &str) -> TenderRecord {
        let mut r = TenderRecord::new(id);
        r.title = Some("Supply of laboratory equipment".to_string());
        r.procuring_entity = Some("city-hospital".to_string());
        r.winner = Some("acme".to_string());
        r.cpv_code = Some("33100000-1".to_string());
        r.procedure_type = Some(ProcedureType::DirectAward);
        r.num_bidders = Some(1);
        r.estimated_value = Some(480_000.0);
        r.awarded_value = Some(499_000.0);
        r.publication_date = NaiveDate::from_ymd_opt(2024, 5, 2);
        r.deadline_date = NaiveDate::from_ymd_opt(2024, 5, 6);
        r.award_date = NaiveDate::from_ymd_opt(2024, 5, 7);
        r.bids = vec![Bid { bidder: "acme".to_string(), amount: Some(499_000.0), disqualified: false }];
        r
    }

    fn runner(store: Arc<MemoryStore>, batch_size: usize) -> CoverageRunner<MemoryStore> {
        let scorer = RecordScorer::new(
            ConfidenceEstimator::new(AggregationStrategy::BatchWeightedAverage).with_iterations(200),
            Some(17),
        );
        CoverageRunner::new(store, Arc::new(IndicatorRegistry::standard()), scorer)
            .with_batch_size(batch_size)
            .with_concurrency(4)
    }

    #[tokio::test]
    async fn every_in_scope_record_gets_a_row() {
        let store = Arc::new(MemoryStore::new());
        let mut cancelled = record("x", Some(1));
        cancelled.status = TenderStatus::Cancelled;
        store.insert_records([record("a", Some(1)), record("b", Some(3)), record("c", None), cancelled]);

        let summary = runner(Arc::clone(&store), 2).with_indicators(false).run().await.unwrap();
        assert_eq!(summary.records_in_scope, 3);
        assert_eq!(summary.scored, 3);
        assert_eq!(summary.baseline_scored, 3);
        assert_eq!(store.score_count(), 3);
        assert_eq!(store.risk_score("a").await.unwrap().unwrap().risk_score, 25);
        assert_eq!(store.risk_score("b").await.unwrap().unwrap().risk_score, 5);
        assert_eq!(store.risk_score("c").await.unwrap().unwrap().risk_score, 10);
        assert!(store.risk_score("x").await.unwrap().is_none());
        assert_eq!(summary.latency.map(|p| p.samples), Some(3));
    }

    #[tokio::test]
    async fn failed_batch_is_skipped_and_counted() {
        let store = Arc::new(MemoryStore::new());
        store.insert_records((0..5).map(|i| record(&format!("r{i}"), Some(2))));
        store.fail_next_upserts(1);

        let summary = runner(Arc::clone(&store), 2).with_indicators(false).run().await.unwrap();
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.scored, 3);
        assert_eq!(store.score_count(), 3);

        // A rerun fills the gap.
        let summary = runner(Arc::clone(&store), 2).with_indicators(false).run().await.unwrap();
        assert_eq!(summary.failed_batches, 0);
        assert_eq!(store.score_count(), 5);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.insert_records([suspicious("s1"), suspicious("s2"), record("plain", Some(4))]);

        runner(Arc::clone(&store), 500).run().await.unwrap();
        let first = store.all_scores();
        let flags_after_first = store.flag_count();
        runner(Arc::clone(&store), 500).run().await.unwrap();
        let second = store.all_scores();

        assert_eq!(first.len(), 3);
        assert_eq!(store.flag_count(), flags_after_first);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.record_id, b.record_id);
            assert_eq!(a.risk_score, b.risk_score);
            assert_eq!(a.risk_level, b.risk_level);
            assert_eq!(a.flag_count, b.flag_count);
            assert_eq!(a.flags_summary, b.flags_summary);
            assert!((a.ci_lower - b.ci_lower).abs() < 1e-9);
            assert!((a.ci_upper - b.ci_upper).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn false_positive_review_lowers_the_score() {
        let store = Arc::new(MemoryStore::new());
        store.insert_records([suspicious("s1")]);
        runner(Arc::clone(&store), 500).run().await.unwrap();
        let before = store.risk_score("s1").await.unwrap().unwrap();
        assert!(before.flag_count > 0);

        let flags = store.flags_for(&["s1".to_string()]).await.unwrap();
        for flag in &flags["s1"] {
            store.mark_false_positive(flag.id.unwrap()).await.unwrap();
        }
        runner(Arc::clone(&store), 500).run().await.unwrap();
        let after = store.risk_score("s1").await.unwrap().unwrap();
        assert_eq!(after.flag_count, 0);
        assert_eq!(after.risk_score, 25);
        assert!(store.flags_for(&["s1".to_string()]).await.unwrap()["s1"]
            .iter()
            .all(|f| f.is_false_positive));
    }

    #[tokio::test]
    async fn analyze_uses_weighted_mean_and_upserts() {
        let store = MemoryStore::new();
        store.insert_records([suspicious("s1")]);
        let records = store.in_scope_records().await.unwrap();
        let index = ContextIndex::build(&records);
        let estimator = ConfidenceEstimator::new(AggregationStrategy::BatchWeightedAverage).with_iterations(100);

        let analysis = analyze_record(&store, Arc::new(IndicatorRegistry::standard()), &index, "s1", estimator, Some(1))
            .await
            .unwrap();
        assert_eq!(analysis.results.len(), 50);
        let summary: serde_json::Value = serde_json::from_str(&analysis.score.flags_summary).unwrap();
        assert_eq!(summary["strategy"], "weighted_mean_with_bonus");
        assert_eq!(store.risk_score("s1").await.unwrap(), Some(analysis.score.clone()));
        assert!(analysis.flags.iter().any(|f| f.flag_type == FlagType::SingleBidder));

        let missing = analyze_record(&store, Arc::new(IndicatorRegistry::standard()), &index, "nope", estimator, None).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn data_poor_record_is_scored_by_the_baseline() {
        let store = Arc::new(MemoryStore::new());
        store.insert_records([record("bare", Some(3))]);

        let summary = runner(Arc::clone(&store), 500).run().await.unwrap();
        assert_eq!(summary.baseline_scored, 1);
        let row = store.risk_score("bare").await.unwrap().unwrap();
        assert_eq!(row.risk_score, 5);
        assert_eq!(row.risk_level, RiskLevel::Minimal);
        assert_eq!(row.flag_count, 0);
        assert!(row.data_completeness < 0.7);
        assert_eq!(store.flag_count(), 0);
    }

    #[tokio::test]
    async fn unreadable_flag_row_does_not_sink_the_batch() {
        let store = Arc::new(crate::db::SqliteStore::in_memory().await.unwrap());
        store
            .insert_records(&[record("a", Some(1)), record("b", Some(3)), record("c", None)])
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO flags (record_id, flag_type, indicator, severity, score, created_at, updated_at) \
             VALUES ('a', 'legacy_type', NULL, 'high', 80.0, 0, 0)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let scorer = RecordScorer::new(
            ConfidenceEstimator::new(AggregationStrategy::BatchWeightedAverage).with_iterations(100),
            Some(5),
        );
        let summary = CoverageRunner::new(Arc::clone(&store), Arc::new(IndicatorRegistry::standard()), scorer)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.records_in_scope, 3);
        assert_eq!(summary.scored, 3);
        assert_eq!(summary.failed_batches, 0);
        for id in ["a", "b", "c"] {
            assert!(store.risk_score(id).await.unwrap().is_some(), "{id} unscored");
        }
        assert_eq!(store.risk_score("a").await.unwrap().unwrap().risk_score, 100);
    }

    #[test]
    fn table_lists_every_level() {
        let mut summary = CoverageSummary { table_levels: crate::db::empty_level_counts(), ..Default::default() };
        summary.table_levels.insert(RiskLevel::High, 3);
        summary.table_levels.insert(RiskLevel::Minimal, 1);
        let table = summary.render_table();
        for level in RiskLevel::ALL {
            assert!(table.contains(level.as_str()), "{table}");
        }
        assert!(table.contains("75.0%"), "{table}");
    }
}
