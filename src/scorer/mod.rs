pub mod baseline;
pub mod confidence;
pub mod coverage;
pub mod ensemble;
pub mod latency;
pub mod record_scorer;

pub use confidence::ConfidenceEstimator;
pub use coverage::{analyze_record, Analysis, CoverageRunner, CoverageSummary};
pub use ensemble::AggregationStrategy;
pub use record_scorer::RecordScorer;
