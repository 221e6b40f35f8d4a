use crate::error::{AppError, Result};
use crate::scorer::ensemble::AggregationStrategy;

/// Records written per upsert transaction by the coverage runner.
pub const COVERAGE_BATCH_SIZE: usize = 500;

/// Bootstrap iterations for the confidence interval.
pub const BOOTSTRAP_ITERATIONS: usize = 1000;

/// Two-sided confidence level of the bootstrap interval.
pub const CONFIDENCE_LEVEL: f64 = 0.90;

/// Relative half-width of the uniform noise applied to each signal score
/// per bootstrap iteration.
pub const BOOTSTRAP_NOISE: f64 = 0.10;

/// Size of the feature vector used for data completeness.
pub const FEATURE_COUNT: usize = 112;

/// Below this completeness the uncertainty matrix moves one step up.
pub const COMPLETENESS_THRESHOLD: f64 = 0.70;

/// Default indicator trigger point.
pub const BASE_THRESHOLD: f64 = 50.0;

/// Related awards closer than this are candidates for contract splitting.
pub const SPLITTING_WINDOW_DAYS: i64 = 30;

/// Risk-level thresholds on the 0–100 score.
pub mod risk_thresholds {
    pub const CRITICAL_MIN: u8 = 80;
    pub const HIGH_MIN: u8 = 60;
    pub const MEDIUM_MIN: u8 = 40;
    pub const LOW_MIN: u8 = 20;
}

/// CI-width thresholds for the uncertainty matrix.
pub mod ci_width_thresholds {
    pub const NARROW_MAX: f64 = 10.0;
    pub const MODERATE_MAX: f64 = 25.0;
}

/// Zero-flag baseline scores keyed on bidder count.
pub mod baseline_scores {
    pub const SINGLE_BIDDER: u8 = 25;
    pub const COMPETITIVE: u8 = 5;
    pub const UNKNOWN_BIDDERS: u8 = 10;
}

/// Corroboration parameters for the two aggregation strategies.
pub mod corroboration {
    /// Multiplier step per additional distinct type (batch strategy).
    pub const BATCH_STEP: f64 = 0.15;
    /// Flat bonus per additional distinct type (CRI strategy).
    pub const CRI_BONUS_PER_TYPE: f64 = 8.0;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub log_level: String,
    /// Records per upsert batch (COVERAGE_BATCH_SIZE)
    pub batch_size: usize,
    /// Bootstrap iterations per record (BOOTSTRAP_ITERATIONS)
    pub bootstrap_iterations: usize,
    /// Two-sided CI level in (0, 1) (CONFIDENCE_LEVEL)
    pub confidence_level: f64,
    /// Optional seed; mixed with the record id so reruns reproduce intervals (BOOTSTRAP_SEED)
    pub bootstrap_seed: Option<u64>,
    /// Records scored concurrently on the blocking pool (WORKER_CONCURRENCY)
    pub worker_concurrency: usize,
    /// Strategy used by the coverage runner (AGGREGATION_STRATEGY=batch|cri)
    pub strategy: AggregationStrategy,
    /// Run the indicator registry during coverage instead of reading persisted flags only
    /// (EVALUATE_INDICATORS)
    pub evaluate_indicators: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "procurement.db".to_string(),
            log_level: "info".to_string(),
            batch_size: COVERAGE_BATCH_SIZE,
            bootstrap_iterations: BOOTSTRAP_ITERATIONS,
            confidence_level: CONFIDENCE_LEVEL,
            bootstrap_seed: None,
            worker_concurrency: default_concurrency(),
            strategy: AggregationStrategy::BatchWeightedAverage,
            evaluate_indicators: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let batch_size = parse_env("COVERAGE_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(AppError::Config("COVERAGE_BATCH_SIZE must be at least 1".to_string()));
        }

        let confidence_level = parse_env("CONFIDENCE_LEVEL", defaults.confidence_level)?;
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(AppError::Config("CONFIDENCE_LEVEL must lie strictly between 0 and 1".to_string()));
        }

        let strategy = match std::env::var("AGGREGATION_STRATEGY") {
            Ok(raw) => raw.parse::<AggregationStrategy>().map_err(AppError::Config)?,
            Err(_) => defaults.strategy,
        };

        let bootstrap_seed = match std::env::var("BOOTSTRAP_SEED") {
            Ok(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| AppError::Config("BOOTSTRAP_SEED must be an unsigned integer".to_string()))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            db_path: std::env::var("DB_PATH").unwrap_or(defaults.db_path),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            batch_size,
            bootstrap_iterations: parse_env("BOOTSTRAP_ITERATIONS", defaults.bootstrap_iterations)?,
            confidence_level,
            bootstrap_seed,
            worker_concurrency: parse_env("WORKER_CONCURRENCY", defaults.worker_concurrency)?.max(1),
            strategy,
            evaluate_indicators: parse_env("EVALUATE_INDICATORS", defaults.evaluate_indicators)?,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
