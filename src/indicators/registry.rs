use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use super::{competition, price, procedural, relationship, timing, Indicator};
use crate::context::IndicatorContext;
use crate::types::{IndicatorCategory, IndicatorResult, TenderRecord};

/// Catalog of indicators grouped by category.
#[derive(Debug, Clone)]
pub struct IndicatorRegistry {
    indicators: Vec<Indicator>,
}

impl IndicatorRegistry {
    pub fn new(indicators: Vec<Indicator>) -> Self {
        Self { indicators }
    }

    /// All 50 indicators, 10 per category.
    pub fn standard() -> Self {
        let indicators = competition::INDICATORS
            .into_iter()
            .chain(price::INDICATORS)
            .chain(timing::INDICATORS)
            .chain(relationship::INDICATORS)
            .chain(procedural::INDICATORS)
            .collect();
        Self::new(indicators)
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Indicator> {
        self.indicators.iter().find(|i| i.name == name)
    }

    pub fn by_category(&self, category: IndicatorCategory) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter().filter(move |i| i.category == category)
    }

    /// Overrides an indicator's weight (e.g. with a learned value).
    /// Returns false when no indicator has that name.
    pub fn set_weight(&mut self, name: &str, weight: f64) -> bool {
        match self.indicators.iter_mut().find(|i| i.name == name) {
            Some(ind) if weight.is_finite() && weight >= 0.0 => {
                ind.weight = weight;
                true
            }
            Some(_) => {
                warn!(indicator = name, weight, "[INDICATOR] rejected non-finite or negative weight");
                false
            }
            None => false,
        }
    }

    /// Sequential evaluation of every indicator on one record.
    pub fn evaluate_record(&self, record: &TenderRecord, ctx: &IndicatorContext) -> Vec<IndicatorResult> {
        self.indicators.iter().map(|i| i.evaluate(record, ctx)).collect()
    }

    /// Sequential, isolate-on-error evaluation over a batch, one indicator at
    /// a time across all records. Keyed by record id; result order within a
    /// record follows registry order.
    pub fn evaluate_batch(
        &self,
        batch: &[(TenderRecord, IndicatorContext)],
    ) -> HashMap<String, Vec<IndicatorResult>> {
        let mut out: HashMap<String, Vec<IndicatorResult>> = batch
            .iter()
            .map(|(r, _)| (r.id.clone(), Vec::with_capacity(self.indicators.len())))
            .collect();
        for indicator in &self.indicators {
            for (record, ctx) in batch {
                let result = indicator.evaluate(record, ctx);
                if let Some(results) = out.get_mut(&record.id) {
                    results.push(result);
                }
            }
        }
        out
    }

    /// Evaluates each indicator as its own blocking task. A task that panics
    /// contributes a neutral result; the rest of the record is unaffected.
    pub async fn evaluate_concurrent(
        &self,
        record: Arc<TenderRecord>,
        ctx: Arc<IndicatorContext>,
    ) -> Vec<IndicatorResult> {
        let mut set = JoinSet::new();
        for (idx, indicator) in self.indicators.iter().enumerate() {
            let indicator = *indicator;
            let record = Arc::clone(&record);
            let ctx = Arc::clone(&ctx);
            set.spawn_blocking(move || (idx, indicator.evaluate(&record, &ctx)));
        }

        let mut slots: Vec<Option<IndicatorResult>> = vec![None; self.indicators.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(record_id = %record.id, "[INDICATOR] task failed: {e}"),
            }
        }

        slots
            .into_iter()
            .zip(&self.indicators)
            .map(|(slot, indicator)| {
                slot.unwrap_or_else(|| {
                    let threshold = indicator.threshold_for(ctx.segment.as_ref());
                    indicator.neutral(threshold, "task failed")
                })
            })
            .collect()
    }
}

impl Default for IndicatorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::error::IndicatorError;
    use crate::indicators::Signal;
    use crate::types::FlagType;

    fn always_high(_: &TenderRecord, _: &IndicatorContext) -> Result<Signal, IndicatorError> {
        Ok(Signal::new(90.0, 1.0))
    }

    fn always_fails(_: &TenderRecord, _: &IndicatorContext) -> Result<Signal, IndicatorError> {
        Err(IndicatorError::MissingData("everything"))
    }

    fn panics(_: &TenderRecord, _: &IndicatorContext) -> Result<Signal, IndicatorError> {
        panic!("indicator bug")
    }

    fn tiny_registry() -> IndicatorRegistry {
        IndicatorRegistry::new(vec![
            Indicator::new("high", IndicatorCategory::Price, FlagType::PriceAnomaly, "t", always_high),
            Indicator::new("fails", IndicatorCategory::Timing, FlagType::ShortDeadline, "t", always_fails),
        ])
    }

    #[test]
    fn standard_registry_has_ten_per_category() {
        let registry = IndicatorRegistry::standard();
        assert_eq!(registry.len(), 50);
        for category in IndicatorCategory::ALL {
            assert_eq!(registry.by_category(category).count(), 10, "{category}");
        }
        let names: HashSet<_> = registry.iter().map(|i| i.name).collect();
        assert_eq!(names.len(), 50, "indicator names must be unique");
    }

    #[test]
    fn standard_indicators_tolerate_an_empty_record() {
        let registry = IndicatorRegistry::standard();
        let results = registry.evaluate_record(&TenderRecord::new("bare"), &IndicatorContext::default());
        assert_eq!(results.len(), 50);
        for r in &results {
            assert!((0.0..=100.0).contains(&r.score), "{}", r.indicator_name);
            assert!((0.0..=1.0).contains(&r.confidence), "{}", r.indicator_name);
            assert_eq!(r.triggered, r.score >= r.threshold);
        }
    }

    #[test]
    fn batch_isolates_failures() {
        let registry = tiny_registry();
        let batch = vec![
            (TenderRecord::new("a"), IndicatorContext::default()),
            (TenderRecord::new("b"), IndicatorContext::default()),
        ];
        let out = registry.evaluate_batch(&batch);
        assert_eq!(out.len(), 2);
        for results in out.values() {
            assert_eq!(results.len(), 2);
            assert!(results[0].triggered);
            assert_eq!(results[1].score, 0.0);
            assert_eq!(results[1].confidence, 0.0);
        }
    }

    #[test]
    fn set_weight_rejects_bad_values() {
        let mut registry = tiny_registry();
        assert!(registry.set_weight("high", 1.7));
        assert_eq!(registry.get("high").map(|i| i.weight), Some(1.7));
        assert!(!registry.set_weight("high", f64::NAN));
        assert!(!registry.set_weight("missing", 1.0));
    }

    #[tokio::test]
    async fn concurrent_matches_sequential_and_survives_panics() {
        let mut indicators: Vec<Indicator> = tiny_registry().iter().copied().collect();
        indicators.push(Indicator::new("panics", IndicatorCategory::Procedural, FlagType::ProceduralIrregularity, "t", panics));
        let registry = IndicatorRegistry::new(indicators);

        let record = Arc::new(TenderRecord::new("r"));
        let ctx = Arc::new(IndicatorContext::default());
        let results = registry.evaluate_concurrent(record, ctx).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].indicator_name, "high");
        assert!(results[0].triggered);
        assert_eq!(results[2].indicator_name, "panics");
        assert_eq!(results[2].score, 0.0);
        assert!(!results[2].triggered);
    }
}
