use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use procurement_risk::config::Config;
use procurement_risk::context::ContextIndex;
use procurement_risk::db::{RiskStore, SqliteStore};
use procurement_risk::error::Result;
use procurement_risk::indicators::IndicatorRegistry;
use procurement_risk::scorer::{analyze_record, Analysis, AggregationStrategy, ConfidenceEstimator, CoverageRunner};

#[derive(Parser)]
#[command(author, version, about = "Corruption-risk scoring for procurement awards", long_about = None)]
struct Cli {
    /// SQLite database file (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<String>,
    /// Coverage aggregation strategy: batch or cri (overrides AGGREGATION_STRATEGY)
    #[arg(long)]
    strategy: Option<AggregationStrategy>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Score every awarded or completed tender and print the level distribution
    Run,
    /// Score one tender interactively and show the indicators behind it
    Analyze {
        record_id: String,
        /// Print the full analysis as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a flag as a false positive; it is kept but no longer scored
    FalsePositive { flag_id: i64 },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(path) = cli.db_path {
        cfg.db_path = path;
    }
    if let Some(strategy) = cli.strategy {
        cfg.strategy = strategy;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cli.command.unwrap_or(Command::Run), cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command, cfg: Config) -> Result<()> {
    let store = Arc::new(SqliteStore::connect(&cfg.db_path).await?);
    let registry = Arc::new(IndicatorRegistry::standard());
    info!(
        indicators = registry.len(),
        batch_size = cfg.batch_size,
        workers = cfg.worker_concurrency,
        "[MAIN] ready"
    );

    match command {
        Command::Run => {
            let runner = CoverageRunner::from_config(Arc::clone(&store), registry, &cfg);
            let summary = runner.run().await?;
            println!("{}", summary.render_table());
        }
        Command::Analyze { record_id, json } => {
            let records = store.in_scope_records().await?;
            let index = ContextIndex::build(&records);
            let estimator = ConfidenceEstimator::from_config(&cfg);
            let analysis =
                analyze_record(store.as_ref(), registry, &index, &record_id, estimator, cfg.bootstrap_seed).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                print_analysis(&analysis);
            }
        }
        Command::FalsePositive { flag_id } => {
            store.mark_false_positive(flag_id).await?;
            println!("flag {flag_id} marked as false positive; rerun scoring to apply");
        }
    }
    Ok(())
}

fn print_analysis(a: &Analysis) {
    let s = &a.score;
    println!(
        "{} | score {} ({}) | CI [{:.1}, {:.1}] | uncertainty {} | completeness {:.0}%",
        s.record_id,
        s.risk_score,
        s.risk_level,
        s.ci_lower,
        s.ci_upper,
        s.uncertainty_level,
        s.data_completeness * 100.0,
    );

    let mut triggered: Vec<_> = a.results.iter().filter(|r| r.triggered).collect();
    triggered.sort_by(|x, y| y.score.total_cmp(&x.score));
    if triggered.is_empty() {
        println!("no indicators triggered");
        return;
    }
    println!("{:<28} {:<14} {:>6} {:>6}  description", "indicator", "category", "score", "thr");
    for r in triggered {
        let description = if r.description.is_empty() { "-" } else { r.description.as_str() };
        println!(
            "{:<28} {:<14} {:>6.1} {:>6.1}  {}",
            r.indicator_name,
            r.category.to_string(),
            r.score,
            r.threshold,
            description
        );
    }
}
