// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use rustls::crypto::{CryptoProvider, ring};

use listing_harvester::aggregator::{Aggregator, run_aggregator};
use listing_harvester::collector::{FETCH_TIMEOUT, HttpFetcher, build_collector, run_collector};
use listing_harvester::config;
use listing_harvester::context::{AppContext, wait_for_signal};
use listing_harvester::metrics::spawn_reporter;
use listing_harvester::showcase;
use listing_harvester::sources::{SUPPORTED, get_adapter};

/// Every role's metrics line is logged this often.
const METRICS_EVERY: Duration = Duration::from_secs(30);

// ------------------------------------------------------------
// Command line
// ------------------------------------------------------------
//
// One binary, one role per process:
//
// - collect <source>  scrape one source on every refresh signal
// - aggregate         validate and store batches (service "core")
// - refresh           publish a single refresh signal and exit
// - showcase          serve the stored providers over HTTP
//
#[derive(Parser, Debug)]
#[command(name = "listing-harvester", version, about = "Listing ingestion pipeline")]
struct Cli {
    /// Local configuration file, used when no config server is set
    #[arg(long, global = true, default_value = "config.json", env = "HARVESTER_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the collector of one source
    Collect {
        /// Source service name (provider1, provider2)
        service: String,
    },

    /// Run the aggregator
    Aggregate {
        /// Do not broadcast a refresh signal at startup
        #[arg(long)]
        skip_initial_refresh: bool,
    },

    /// Broadcast one refresh signal
    Refresh,

    /// Serve GET /providers
    Showcase {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },
}

impl Command {
    /// Name the configuration is looked up by.
    fn service(&self) -> &str {
        match self {
            Self::Collect { service } => service,
            Self::Aggregate { .. } => "core",
            Self::Refresh => "refresh",
            Self::Showcase { .. } => "showcase_server",
        }
    }
}

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging and the cryptography backend (rustls)
// - Load configuration for the selected role
// - Run the role until it ends or a termination signal arrives
// - Close every opened handle on the way out
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // rustls >= 0.23 requires an explicit CryptoProvider,
    // installed once before any TLS connection is opened.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    let cli = Cli::parse();
    let service = cli.command.service().to_string();

    let cfg = config::load(&service, &cli.config)
        .await
        .with_context(|| format!("cannot load configuration for {service}"))?;

    let mut ctx = AppContext::new(service, cfg);
    let reporter = spawn_reporter(ctx.metrics.clone(), METRICS_EVERY);

    let result = tokio::select! {
        result = run(&mut ctx, cli.command) => result,
        signal = wait_for_signal() => {
            log::info!("Termination signal received");
            signal.context("cannot listen for termination signals")
        }
    };

    reporter.abort();
    ctx.shutdown().await;
    result
}

async fn run(ctx: &mut AppContext, command: Command) -> anyhow::Result<()> {
    match command {
        // ----------------------------------------------------
        // COLLECTOR
        // ----------------------------------------------------
        Command::Collect { service } => {
            let adapter = get_adapter(&service).with_context(|| {
                format!("source '{service}' is not supported (known: {})", SUPPORTED.join(", "))
            })?;
            let provider = ctx.config.provider()?.clone();
            let transport = ctx.connect_transport().await?;

            let collector = build_collector(
                &provider,
                adapter,
                Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?),
                ctx.config.retry,
                &ctx.run_id,
                ctx.telemetry.clone(),
                ctx.metrics.clone(),
            );

            log::info!("Starting {service} collector for {}", provider.source.identity());
            run_collector(&collector, &transport).await;
            Ok(())
        }

        // ----------------------------------------------------
        // AGGREGATOR
        // ----------------------------------------------------
        Command::Aggregate {
            skip_initial_refresh,
        } => {
            let store = ctx.connect_store().await?;
            let transport = ctx.connect_transport().await?;

            let mut aggregator = Aggregator::new(
                store,
                ctx.telemetry.clone(),
                ctx.metrics.clone(),
                ctx.run_id.clone(),
            )
            .await
            .context("cannot load dictionaries")?;

            if !skip_initial_refresh {
                match transport.publish_refresh().await {
                    Ok(receivers) => log::info!("Initial refresh reached {receivers} collectors"),
                    Err(e) => log::warn!("Initial refresh failed: {e}"),
                }
            }

            run_aggregator(&mut aggregator, &transport, &ctx.metrics).await;
            Ok(())
        }

        // ----------------------------------------------------
        // ONE-SHOT REFRESH
        // ----------------------------------------------------
        Command::Refresh => {
            let transport = ctx.connect_transport().await?;
            let receivers = transport.publish_refresh().await?;
            log::info!("Refresh signal reached {receivers} collectors");
            Ok(())
        }

        // ----------------------------------------------------
        // SHOWCASE
        // ----------------------------------------------------
        Command::Showcase { bind } => {
            let store = ctx.connect_store().await?;
            showcase::serve(store, bind).await
        }
    }
}
