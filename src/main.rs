use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bikemoves_match::distribution::{
    Adjustment, Bin, Distribution, EdgeBins, FitOptions, edge_statistics,
};
use bikemoves_match::osrm::HttpConnector;
use bikemoves_match::routing::{RoutingClient, RoutingConfig};
use bikemoves_match::store::PgTripStore;
use bikemoves_match::trip_matcher::{BatchReport, TripMatcher, TripMatcherConfig};
use bikemoves_match::trip_processor::TripProcessor;
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(name = "bikemoves-match")]
#[command(about = "Map matching and legend fitting for BikeMoves trips", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Database and routing engine settings shared by the matching commands
#[derive(Args)]
struct MatchArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Base URL of osrm-routed
    #[arg(long, env = "OSRM_URL", default_value = "http://localhost:5000")]
    osrm_url: String,

    /// Road network (profile) to route on
    #[arg(long, env = "OSRM_NETWORK")]
    network: String,

    /// Per-request routing timeout in milliseconds
    #[arg(long, env = "OSRM_TIMEOUT", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Trip pipelines in flight at once
    #[arg(long, env = "MATCH_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    #[arg(long)]
    progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Match every trip that has not been matched yet
    Match {
        #[command(flatten)]
        args: MatchArgs,

        /// Keep running and rematch every this many seconds
        #[arg(long)]
        watch: Option<u64>,
    },

    /// Route the fastest alternative for matched trips that lack one
    Alternatives {
        #[command(flatten)]
        args: MatchArgs,
    },

    /// Fit legend stops to a `[{"value", "count"}]` JSON file
    Fit {
        input: PathBuf,

        #[arg(short, long, default_value_t = 5)]
        bins: usize,

        /// Mirror stops around this value
        #[arg(long, allow_hyphen_values = true)]
        center: Option<f64>,

        /// Cumulative percentile per cut point, comma separated
        #[arg(long, value_delimiter = ',')]
        profile: Option<Vec<f64>>,

        /// Use the equal-width search instead of quantiles
        #[arg(long)]
        search: bool,

        /// Start the first search stop at zero
        #[arg(long, requires = "search")]
        zero_based: bool,
    },

    /// Fit the explore map legends from a JSON file with `speed`, `trips`,
    /// `users` and `preference` bins
    Stats { input: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Match { args, watch } => {
            let matcher = Arc::new(build_matcher(args).await?);
            let processor = TripProcessor::new(matcher.clone());

            if let Some(seconds) = watch {
                processor.start_scheduler(Duration::from_secs(seconds)).await;
                return Ok(ExitCode::SUCCESS);
            }

            let report = processor.run_once().await?;
            drop(processor);
            if let Ok(matcher) = Arc::try_unwrap(matcher) {
                matcher.shutdown().await;
            }

            Ok(report.map_or(ExitCode::SUCCESS, |report| exit_code(&report)))
        }
        Commands::Alternatives { args } => {
            let matcher = build_matcher(args).await?;
            let report = matcher.find_alternatives().await?;
            matcher.shutdown().await;
            Ok(exit_code(&report))
        }
        Commands::Fit {
            input,
            bins,
            center,
            profile,
            search,
            zero_based,
        } => {
            let data: Vec<Bin> = read_json(&input)?;
            let dist = Distribution::new(&data);
            info!(
                "Fitting {} stops to {} values (total weight {:.2})",
                bins,
                data.len(),
                dist.total()
            );

            let output = if search {
                serde_json::to_string_pretty(&dist.search(bins, zero_based)?)?
            } else {
                let options = FitOptions {
                    profile,
                    adjustment: center.map_or(Adjustment::Equal, Adjustment::Center),
                };
                serde_json::to_string_pretty(&dist.fit(bins, &options)?)?
            };
            println!("{}", output);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats { input } => {
            let bins: EdgeBins = read_json(&input)?;
            let stats = edge_statistics(&bins)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build_matcher(args: MatchArgs) -> Result<TripMatcher<PgTripStore, HttpConnector>> {
    let store = Arc::new(PgTripStore::connect(&args.database_url).await?);
    let routing = RoutingClient::new(
        HttpConnector::new(args.osrm_url),
        RoutingConfig {
            network: args.network,
            timeout: Duration::from_millis(args.timeout_ms),
        },
    );
    let config = TripMatcherConfig {
        concurrency: args.concurrency,
        show_progress: args.progress,
        ..Default::default()
    };
    Ok(TripMatcher::new(store, routing, config))
}

// Nonzero when any trip's results could not be read or written
fn exit_code(report: &BatchReport) -> ExitCode {
    if report.is_clean() {
        return ExitCode::SUCCESS;
    }
    for (trip_id, reason) in &report.failures {
        error!("Trip {} was not persisted: {}", trip_id, reason);
    }
    ExitCode::FAILURE
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}
