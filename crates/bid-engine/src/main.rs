//! bid-probe: drive the bid engine against a backend and report what it serves.
//!
//! Usage:
//!   bid-probe [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Config file path (default: config/probe.toml)
//!   --log-level <LEVEL>         trace, debug, info, warn, error (overrides config)
//!   --publisher-id <ID>         Publisher id (overrides config)
//!   --cdb-url <URL>             Bid endpoint (overrides config)
//!   --offline                   Use the in-memory backend instead of HTTP
//!   -r, --rounds <N>            Request rounds over all placements (default: 3)
//!   --interval-ms <MS>          Pause between rounds (default: 1000)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rust_decimal::Decimal;
use tokio::runtime::Handle;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use bid_engine::api::{BidApi, HttpBidApi, ScriptedBidApi};
use bid_engine::{BidEngine, EngineConfig};

/// CLI arguments for bid-probe.
#[derive(Parser, Debug)]
#[command(name = "bid-probe")]
#[command(about = "Exercise the bid cache against a bidding backend")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/probe.toml")]
    config: PathBuf,

    /// Log level (overrides config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Publisher id (overrides config file)
    #[arg(long)]
    publisher_id: Option<String>,

    /// Bid endpoint URL (overrides config file)
    #[arg(long)]
    cdb_url: Option<String>,

    /// Answer every slot from an in-memory backend
    #[arg(long)]
    offline: bool,

    /// Number of request rounds
    #[arg(short, long, default_value_t = 3)]
    rounds: u32,

    /// Pause between rounds in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {}", e);
    }

    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        EngineConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        EngineConfig::default()
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(args.log_level.clone(), args.publisher_id.clone(), args.cdb_url.clone());

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&config.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    if !config_found {
        warn!("Config file not found at {:?}, using defaults", args.config);
    }

    config.validate().context("Configuration validation failed")?;
    if config.placements.is_empty() {
        bail!("No placements configured; add [[placements]] to the config file");
    }

    let api: Arc<dyn BidApi> = if args.offline {
        info!("Using in-memory backend");
        Arc::new(ScriptedBidApi::auto_bidding(Decimal::new(150, 2), 30))
    } else {
        Arc::new(HttpBidApi::new(&config.network).context("Failed to create HTTP client")?)
    };

    info!(
        publisher_id = %config.publisher.publisher_id,
        placements = config.placements.len(),
        "Starting bid-probe"
    );

    let placements = config.placements.clone();
    let wait = config.network.timeout;
    let engine = BidEngine::new(config, api, Handle::current());
    engine.start_metric_flush();

    if let Some(prefetch) = engine.prefetch_registered() {
        match prefetch.await {
            Ok(outcome) => info!(outcome = ?outcome, "Prefetch finished"),
            Err(_) => warn!("Prefetch result lost"),
        }
    }

    for round in 1..=args.rounds {
        for key in &placements {
            let decision = engine.decide(key);
            match &decision.bid {
                Some(bid) => info!(
                    round,
                    placement = %key,
                    state = ?decision.state,
                    cpm = %bid.cpm,
                    ttl_secs = bid.ttl_secs,
                    "Bid served"
                ),
                None => info!(round, placement = %key, state = ?decision.state, "No bid"),
            }
        }

        if round == args.rounds {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(args.interval_ms)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping early");
                break;
            }
        }
    }

    // One blocking request to show the wait path
    if let Some(key) = placements.first() {
        let bid = engine.request_bid_or_wait(key, wait).await;
        info!(placement = %key, served = bid.is_some(), "Final request with wait");
    }

    engine.shutdown().await;

    let counters = engine.counters();
    let queue = engine.queue_stats();
    info!(
        bid_requests = counters.bid_requests,
        bids_served = counters.bids_served,
        fill_rate_pct = format!("{:.1}", counters.fill_rate()),
        suppressed_cooldown = counters.suppressed_cooldown,
        suppressed_no_bid = counters.suppressed_no_bid,
        suppressed_kill_switch = counters.suppressed_kill_switch,
        fetches_started = counters.fetches_started,
        fetches_failed = counters.fetches_failed,
        malformed_slots = counters.malformed_slots,
        metrics_offered = queue.offered,
        metrics_dropped = queue.dropped,
        metrics_rolled_back = queue.rolled_back,
        "bid-probe finished"
    );

    Ok(())
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
