//! Lanewatch - CI Lane Poller
//!
//! Polls the configured CI lanes on an interval, keeping finished build
//! payloads in a budgeted on-disk cache, and logs a per-lane summary after
//! every pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lanewatch::build::BuildRecord;
use lanewatch::cache::{CacheContext, FileBackend, KvBackend, MemoryBackend, DEFAULT_NAMESPACE};
use lanewatch::config::{LaneVisibility, PollerConfig};
use lanewatch::error::Result;
use lanewatch::fetch::{FetchOrchestrator, HttpTransport};
use lanewatch::lane::{make_lanes, Lane};
use lanewatch::signal::ChangeSignal;
use lanewatch::StandardBuild;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Lanewatch - poll CI lanes and cache finished build results
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CI server base URL
    #[arg(
        long,
        env = "LANEWATCH_SERVER",
        default_value = "https://jenkins.mono-project.com"
    )]
    server: String,

    /// Lane visibility level (1 = core, 2 = extended, 3 = everything)
    #[arg(long, env = "LANEWATCH_VISIBILITY", default_value = "1")]
    visibility: u8,

    /// Skip pull-request lanes
    #[arg(long, env = "LANEWATCH_NO_PR")]
    no_pr: bool,

    /// Skip per-build failure reports (metadata only)
    #[arg(long, env = "LANEWATCH_NO_REPORTS")]
    no_reports: bool,

    /// Maximum build queries per lane per poll
    #[arg(long, env = "LANEWATCH_MAX_BUILD_QUERIES", default_value = "50")]
    max_build_queries: usize,

    /// Cache budget in bytes of stored payload
    #[arg(long, env = "LANEWATCH_CACHE_BUDGET", default_value = "4998976")]
    cache_budget: i64,

    /// Cache directory; omit to keep the cache in memory only
    #[arg(long, env = "LANEWATCH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Poll interval in seconds
    #[arg(long, env = "LANEWATCH_POLL_INTERVAL_SECONDS", default_value = "120")]
    poll_interval_seconds: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "LANEWATCH_REQUEST_TIMEOUT_SECONDS", default_value = "30")]
    request_timeout_seconds: u64,

    /// Run a single poll pass and exit
    #[arg(long, env = "LANEWATCH_ONCE")]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            server: self.server.trim_end_matches('/').to_string(),
            visibility: LaneVisibility::from_level(self.visibility),
            allow_pr: !self.no_pr,
            fetch_reports: !self.no_reports,
            max_build_queries: self.max_build_queries,
            cache_budget: self.cache_budget,
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.poller_config();

    info!("Starting lanewatch");
    info!("  Server: {}", config.server);
    info!("  Visibility level: {}", config.visibility.level());
    info!("  PR lanes: {}", config.allow_pr);
    info!("  Failure reports: {}", config.fetch_reports);
    info!("  Cache budget: {} bytes", config.cache_budget);

    let backend: Arc<dyn KvBackend> = match &args.cache_dir {
        Some(dir) => {
            info!("  Cache directory: {}", dir.display());
            Arc::new(FileBackend::open(dir)?)
        }
        None => {
            info!("  Cache: in-memory");
            Arc::new(MemoryBackend::new())
        }
    };

    let ctx = Arc::new(CacheContext::open(
        backend,
        DEFAULT_NAMESPACE,
        config.cache_budget,
    )?);
    info!(
        "Cache opened: {} bytes used, {} builds evictable",
        ctx.usage(),
        ctx.evictable_groups()
    );

    let transport = HttpTransport::new(config.request_timeout)?;
    let orchestrator = FetchOrchestrator::new(ctx, transport, ChangeSignal::new());

    let mut lanes: Vec<Lane<StandardBuild>> = make_lanes(&config);
    info!("Polling {} lanes", lanes.len());

    loop {
        let pass = futures::future::join_all(
            lanes
                .iter_mut()
                .map(|lane| lane.load(&orchestrator, &config)),
        );
        pass.await;

        log_summary(&lanes, &config, orchestrator.context());

        if args.once {
            break;
        }
        tokio::time::sleep(Duration::from_secs(args.poll_interval_seconds)).await;
    }

    Ok(())
}

// =============================================================================
// Summary
// =============================================================================

fn log_summary(lanes: &[Lane<StandardBuild>], config: &PollerConfig, ctx: &CacheContext) {
    let mut builds = 0usize;
    let mut in_flight = 0usize;
    let mut failed_fetches = 0usize;
    let mut failures = 0usize;

    for lane in lanes {
        let lane_builds = lane.builds().count();
        builds += lane_builds;
        for build in lane.builds() {
            if !build.loaded(config.fetch_reports) {
                in_flight += 1;
            }
            if build.failed() {
                failed_fetches += 1;
            }
            failures += build.failures.len();
        }
        if lane.status.failed {
            info!(lane = %lane.name, "Lane index failed to load");
        } else {
            info!(lane = %lane.name, builds = lane_builds, "Lane loaded");
        }
    }

    info!(
        builds,
        in_flight,
        failed_fetches,
        test_failures = failures,
        cache_usage = ctx.usage(),
        cache_budget = ctx.budget(),
        "Poll pass complete"
    );
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
