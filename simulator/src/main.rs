//! Balanced Simulator
//!
//! Drives the ledger through named scenarios or a random load, against the
//! in-memory store or PostgreSQL, then audits the result.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use balanced_ledger::{InMemoryStore, LedgerConfig, LedgerEngine, LedgerStore, PgStore};

mod controller;
mod metrics;
mod scenario;

use controller::{FaultInjector, SimulationController};
use scenario::Scenario;

/// Balanced Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Balanced ledger load and concurrency simulator")]
struct Args {
    /// Scenario to run (walkthrough, race, crossfire, failure-recovery).
    /// Without one, a random load runs.
    #[arg(short, long)]
    scenario: Option<String>,

    /// Accounts to create for the random load
    #[arg(short, long, default_value = "8")]
    accounts: usize,

    /// Random operations to run
    #[arg(short, long, default_value = "500")]
    operations: usize,

    /// Operations in flight at once during the random load
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// PostgreSQL URL; overrides DATABASE_URL. Without either, the
    /// in-memory store is used.
    #[arg(long)]
    database_url: Option<String>,

    /// Row-lock wait bound in milliseconds; overrides LEDGER_LOCK_TIMEOUT_MS
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print ledger metrics in Prometheus format at the end
    #[arg(long)]
    prometheus: bool,
}

fn init_tracing(json: bool, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run<S: LedgerStore>(
    store: Arc<S>,
    config: &LedgerConfig,
    args: &Args,
    fault_injector: Option<FaultInjector>,
) -> anyhow::Result<()> {
    let engine = Arc::new(LedgerEngine::new(store, config));
    let mut controller = SimulationController::new(engine.clone(), args.seed);
    if let Some(injector) = fault_injector {
        controller = controller.with_fault_injector(injector);
    }

    match &args.scenario {
        Some(name) => controller.run_scenario(Scenario::load(name)?).await?,
        None => {
            controller
                .run_random(args.accounts, args.operations, args.concurrency)
                .await?
        }
    }

    let metrics = controller.metrics();
    info!("Simulation complete");
    info!("Total operations: {}", metrics.total_operations);
    info!("Committed: {}", metrics.committed);
    info!("Failures: {:?}", metrics.failures);
    info!("Average latency: {}µs", metrics.average_latency_us());
    info!("p99 latency: {}µs", metrics.p99_latency_us());

    let report = engine.check_integrity().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.prometheus {
        println!("{}", engine.metrics().to_prometheus());
    }

    if !report.passed {
        anyhow::bail!(
            "integrity check failed with {} violation(s)",
            report.violations.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = LedgerConfig::from_env();
    if let Some(url) = &args.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(ms) = args.lock_timeout_ms {
        config.lock_timeout = Duration::from_millis(ms);
    }

    init_tracing(args.json, &config.log_level);
    config.validate()?;

    info!("Starting Balanced Simulator");
    info!("Lock timeout: {}ms", config.lock_timeout.as_millis());

    match config.database_url.clone() {
        Some(url) => {
            info!("Using PostgreSQL store");
            let store = PgStore::connect(&url, config.max_connections).await?;
            store.migrate().await?;
            run(Arc::new(store), &config, &args, None).await
        }
        None => {
            info!("Using in-memory store");
            let store = Arc::new(InMemoryStore::new());
            let handle = store.clone();
            let injector: FaultInjector = Box::new(move |n| handle.fail_next_commits(n));
            run(store, &config, &args, Some(injector)).await
        }
    }
}
