use procurement_risk::config::FEATURE_COUNT;
use procurement_risk::indicators::IndicatorRegistry;
use procurement_risk::scorer::confidence::{
    classify_uncertainty, data_completeness, FeatureValue, FeatureVector,
};
use procurement_risk::scorer::ensemble::{signals_from_flags, WeightedSignal};
use procurement_risk::scorer::{AggregationStrategy, ConfidenceEstimator};
use procurement_risk::types::{Flag, FlagType, RiskLevel, TenderRecord, UncertaintyLevel};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

const STRATEGIES: [AggregationStrategy; 2] = [
    AggregationStrategy::BatchWeightedAverage,
    AggregationStrategy::WeightedMeanWithBonus,
];

fn flag_strategy() -> impl Strategy<Value = Flag> {
    (0..FlagType::ALL.len(), -20.0f64..130.0, any::<bool>()).prop_map(|(t, score, fp)| {
        let mut flag = Flag::new("r", FlagType::ALL[t], score);
        flag.is_false_positive = fp;
        flag
    })
}

fn signals(strategy: AggregationStrategy, flags: &[Flag]) -> Vec<WeightedSignal> {
    signals_from_flags(flags, &strategy.default_weights())
}

proptest! {
    #[test]
    fn score_in_range_and_level_matches(flags in prop::collection::vec(flag_strategy(), 0..30)) {
        for strategy in STRATEGIES {
            let score = strategy.score(&signals(strategy, &flags));
            prop_assert!(score <= 100);
            prop_assert_eq!(RiskLevel::from_score(score), expected_level(score));
        }
    }

    #[test]
    fn new_corroborating_type_never_lowers_score(
        picks in prop::sample::subsequence((0..FlagType::ALL.len()).collect::<Vec<_>>(), 2..=FlagType::ALL.len()),
        scores in prop::collection::vec(0.0f64..=100.0, 15),
        extra in 0.0f64..=1.0,
    ) {
        let (existing, new_type) = picks.split_at(picks.len() - 1);
        let flags: Vec<Flag> = existing
            .iter()
            .zip(&scores)
            .map(|(&t, &s)| Flag::new("r", FlagType::ALL[t], s))
            .collect();
        let max = flags.iter().map(|f| f.score).fold(0.0, f64::max);
        let mut more = flags.clone();
        more.push(Flag::new("r", FlagType::ALL[new_type[0]], max + (100.0 - max) * extra));

        for strategy in STRATEGIES {
            let before = strategy.score(&signals(strategy, &flags));
            let after = strategy.score(&signals(strategy, &more));
            prop_assert!(after >= before, "{strategy}: {before} -> {after}");
        }
    }

    #[test]
    fn false_positives_never_count(flags in prop::collection::vec(flag_strategy(), 1..20)) {
        let mut all_fp = flags.clone();
        for f in &mut all_fp {
            f.is_false_positive = true;
        }
        for strategy in STRATEGIES {
            prop_assert_eq!(strategy.score(&signals(strategy, &all_fp)), 0);
        }
    }

    #[test]
    fn completeness_is_a_fraction(values in prop::collection::vec(
        prop_oneof![
            Just(FeatureValue::Null),
            any::<f64>().prop_map(FeatureValue::Number),
            any::<bool>().prop_map(FeatureValue::Bool),
            ".{0,8}".prop_map(FeatureValue::Text),
        ],
        0..200,
    )) {
        let mut fv = FeatureVector::new();
        for (i, v) in values.into_iter().enumerate() {
            fv.insert(format!("f{i}"), v);
        }
        let c = data_completeness(&fv);
        prop_assert!((0.0..=1.0).contains(&c));
    }

    #[test]
    fn extraction_has_fixed_width(bidders in prop::option::of(0u32..20), value in prop::option::of(1.0f64..1e8)) {
        let mut record = TenderRecord::new("r");
        record.num_bidders = bidders;
        record.awarded_value = value;
        let registry = IndicatorRegistry::standard();
        let results = registry.evaluate_record(&record, &Default::default());
        let fv = FeatureVector::extract(&record, &registry, &results, &[]);
        prop_assert_eq!(fv.len(), FEATURE_COUNT);
        prop_assert!((0.0..=1.0).contains(&data_completeness(&fv)));
    }

    #[test]
    fn uncertainty_is_monotone_in_width(a in 0.0f64..60.0, b in 0.0f64..60.0, c in 0.0f64..=1.0) {
        let (narrow, wide) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(rank(classify_uncertainty(narrow, c)) <= rank(classify_uncertainty(wide, c)));
    }
}

fn expected_level(score: u8) -> RiskLevel {
    match score {
        80..=100 => RiskLevel::Critical,
        60..=79 => RiskLevel::High,
        40..=59 => RiskLevel::Medium,
        20..=39 => RiskLevel::Low,
        _ => RiskLevel::Minimal,
    }
}

fn rank(level: UncertaintyLevel) -> u8 {
    match level {
        UncertaintyLevel::Low => 0,
        UncertaintyLevel::Medium => 1,
        UncertaintyLevel::High => 2,
    }
}

#[test]
fn single_type_interval_brackets_point_for_most_seeds() {
    let trials = 1000u64;
    for strategy in STRATEGIES {
        let estimator = ConfidenceEstimator::new(strategy).with_iterations(200);
        let mut bracketed = 0;
        for seed in 0..trials {
            let mut rng = StdRng::seed_from_u64(seed);
            let t = FlagType::ALL[(seed % 15) as usize];
            let score = 10.0 + (seed as f64 * 7.3) % 90.0;
            let signal = WeightedSignal { key: t, score, weight: strategy.default_weights().get(t) };
            let ci = estimator.estimate(&[signal], &mut rng);
            if ci.lower <= ci.score && ci.score <= ci.upper {
                bracketed += 1;
            }
        }
        assert!(bracketed * 100 >= trials * 95, "{strategy}: {bracketed}/{trials}");
    }
}

#[test]
fn empty_input_is_the_zero_triple() {
    let mut rng = StdRng::seed_from_u64(0);
    for strategy in STRATEGIES {
        let ci = ConfidenceEstimator::new(strategy).estimate(&[], &mut rng);
        assert_eq!(ci.as_triple(), (0.0, 0.0, 0.0));
    }
}
