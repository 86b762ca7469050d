//! CurveBot - automated launchpad sniping backend
//! Mission: discover launches, score them, and execute entries and exits
//! with at-most-once guarantees, across restarts and concurrent workers.
//!
//! Long-lived loops are gated by feature-flag env vars and all coordinate
//! through the database; nothing here holds correctness-relevant state in
//! memory.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use curvebot_backend::db::Database;
use curvebot_backend::discovery::{onchain::OnchainSource, telegram::TelegramSource};
use curvebot_backend::executor::{fees::FeeSchedule, ExecutorConfig, ExecutorWorker};
use curvebot_backend::models::Config;
use curvebot_backend::monitor::exit_engine::{
    AccountEventListener, ExitEngine, ExitEngineConfig,
};
use curvebot_backend::monitor::graduation::GraduationMonitor;
use curvebot_backend::monitor::maintenance::MaintenanceLoop;
use curvebot_backend::monitor::pricing::PriceService;
use curvebot_backend::opportunity::OpportunityMatcher;
use curvebot_backend::providers::aggregator::AggregatorClient;
use curvebot_backend::providers::dexscreener::DexScreenerClient;
use curvebot_backend::providers::launchpad::LaunchpadApiClient;
use curvebot_backend::providers::rpc::RpcClient;
use curvebot_backend::router::amm::AmmAdapter;
use curvebot_backend::router::bonding_curve::BondingCurveAdapter;
use curvebot_backend::router::{SwapRouter, VenueAdapter};

#[derive(Parser, Debug)]
#[command(name = "curvebot", about = "Launchpad sniping execution core")]
struct Cli {
    /// Override DATABASE_PATH from the environment
    #[arg(long)]
    db_path: Option<String>,

    /// Override WORKER_COUNT from the environment
    #[arg(long)]
    workers: Option<usize>,

    /// Force dry-run regardless of DRY_RUN
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "curvebot_backend=info,curvebot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(path) = cli.db_path {
        config.database_path = path;
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if cli.dry_run {
        config.dry_run = true;
    }

    info!("CurveBot starting (dry_run={})", config.dry_run);
    let db = Database::open(&config.database_path)?;

    // Shared provider adapters
    let rpc = Arc::new(RpcClient::new(config.rpc_http_url.clone()));
    let aggregator = Arc::new(AggregatorClient::new(config.aggregator_url.clone()));
    let dexscreener = Arc::new(DexScreenerClient::new(config.dexscreener_url.clone()));
    let launchpad = Arc::new(LaunchpadApiClient::new(config.launchpad_api_url.clone()));

    // Probe order is the fallback order: AMM first.
    let adapters: Vec<Arc<dyn VenueAdapter>> = vec![
        Arc::new(AmmAdapter::new(rpc.clone(), aggregator.clone())),
        Arc::new(BondingCurveAdapter::new(rpc.clone(), launchpad.clone())),
    ];
    let swap_router = Arc::new(SwapRouter::new(adapters));

    let prices = Arc::new(PriceService::new(
        rpc.clone(),
        aggregator.clone(),
        dexscreener.clone(),
        launchpad.clone(),
    ));

    let mut tasks = Vec::new();

    // Discovery: telegram transport feeds a channel; the source consumes it.
    let (telegram_tx, telegram_rx) = mpsc::channel(256);
    // The chat transport (bot API long-polling) is an external collaborator
    // wired up at deployment; it pushes ChannelMessages into telegram_tx.
    let _telegram_tx = telegram_tx;
    let telegram = TelegramSource::new(
        db.clone(),
        std::time::Duration::from_secs(config.telegram_dedup_ttl_secs),
        config.monitored_channel_id.clone(),
    );
    tasks.push(tokio::spawn(telegram.run(telegram_rx)));

    if config.onchain_discovery_enabled {
        let onchain = OnchainSource::new(
            db.clone(),
            rpc.clone(),
            config.rpc_ws_url.clone(),
            config.launchpad_program_id.clone(),
        );
        tasks.push(tokio::spawn(onchain.run()));
    } else {
        info!("On-chain discovery disabled by flag");
    }

    // Matcher only runs when auto execution is on; manual trading flows
    // through the outbox regardless.
    if config.auto_execute_enabled {
        let matcher = Arc::new(OpportunityMatcher::new(
            db.clone(),
            rpc.clone(),
            launchpad.clone(),
            Vec::new(),
            config.max_attempts,
        ));
        tasks.push(tokio::spawn(matcher.run()));
    } else {
        info!("Auto execution disabled by flag; matcher not started");
    }

    // Executor workers
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    for n in 0..config.worker_count.max(1) {
        let worker = Arc::new(ExecutorWorker::new(
            db.clone(),
            swap_router.clone(),
            rpc.clone(),
            FeeSchedule::new(config.platform_fee_bps),
            ExecutorConfig {
                worker_id: format!("{}-{}-{}", hostname, std::process::id(), n),
                batch_size: 4,
                lease_ttl_secs: config.lease_ttl_secs,
                min_position_sol: config.min_position_sol,
                max_position_sol: config.max_position_sol,
                max_balance_pct: config.max_balance_pct,
                post_buy_cooldown_secs: config.post_buy_cooldown_secs,
                circuit_cooldown_secs: 300,
                dry_run: config.dry_run,
            },
        ));
        tasks.push(tokio::spawn(worker.run()));
    }

    // Exit engine + optional account event listener
    if config.tp_sl_engine_enabled {
        let engine = Arc::new(ExitEngine::new(
            db.clone(),
            prices.clone(),
            ExitEngineConfig {
                poll_interval_secs: config.poller_interval_secs,
                max_job_attempts: config.max_attempts,
            },
        ));
        tasks.push(tokio::spawn(engine.clone().run()));
        let listener =
            AccountEventListener::new(db.clone(), engine, config.rpc_ws_url.clone());
        tasks.push(tokio::spawn(listener.run()));
    } else {
        info!("TP/SL engine disabled by flag");
    }

    if config.graduation_monitor_enabled {
        let graduation = Arc::new(GraduationMonitor::new(
            db.clone(),
            rpc.clone(),
            launchpad.clone(),
            config.graduation_interval_secs,
        ));
        tasks.push(tokio::spawn(graduation.run()));
    } else {
        info!("Graduation monitor disabled by flag");
    }

    tasks.push(tokio::spawn(
        Arc::new(MaintenanceLoop::new(db.clone())).run(),
    ));

    info!("All loops running ({} tasks); ctrl-c to stop", tasks.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    warn!("Shutdown signal received, stopping");
    for task in tasks {
        task.abort();
    }
    Ok(())
}
