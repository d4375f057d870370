use std::sync::Arc;
use std::time::{Duration, Instant};

use analysis_core::{InMemoryPriceData, PriceDataProvider};
use anyhow::{anyhow, bail, Context, Result};
use broker_trait::{PaperBroker, PaperConfig};
use notification_service::NotificationService;
use portfolio_manager::SqlitePositionStore;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::signal::unix::SignalKind;
use tokio::time;

use trading_agent::{
    AgentConfig, AgentMetrics, OrderExecutor, PositionDecisionEngine, RawScenario, SessionRouter,
    SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting position tracking agent");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!(
        "  Auto-trading: {} | buy amount {:.0} | {} concurrent orders | timeout {}s",
        config.auto_trading_enabled,
        config.default_buy_amount,
        config.max_concurrent_orders,
        config.order_timeout_seconds
    );
    tracing::info!(
        "  Slots: {} (max {} per sector, {:.0}% share) | partial sell {:.0}%",
        config.max_slots,
        config.max_same_sector,
        config.sector_concentration_ratio * 100.0,
        config.partial_sell_ratio * 100.0
    );

    if !config.paper_trading {
        bail!("PAPER_TRADING=false but no live brokerage client is configured");
    }

    // 3. Persistence
    let store = Arc::new(
        SqlitePositionStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening position store at {}", config.database_url))?,
    );
    tracing::info!("Position store ready ({})", config.database_url);

    // 4. Price history
    let prices = Arc::new(match &config.price_data_file {
        Some(path) => InMemoryPriceData::from_json_file(path)
            .with_context(|| format!("loading PRICE_DATA_FILE {}", path))?,
        None => {
            tracing::warn!("PRICE_DATA_FILE not set; volatility, trend and regime use fallbacks");
            InMemoryPriceData::new()
        }
    });

    // 5. Paper brokerage, quoted at the latest close
    let cash = Decimal::from_f64(config.paper_starting_cash)
        .ok_or_else(|| anyhow!("invalid PAPER_STARTING_CASH {}", config.paper_starting_cash))?;
    let broker = Arc::new(PaperBroker::new(PaperConfig::default().with_cash(cash)));
    seed_quotes(&broker, &prices);

    let executor = Arc::new(OrderExecutor::new(
        broker.clone(),
        Arc::new(SystemClock),
        SessionRouter::new(config.timezone()?),
        config.execution_config(),
    ));

    let price_source: Arc<dyn PriceDataProvider> = prices.clone();
    let engine = PositionDecisionEngine::from_config(
        &config,
        price_source,
        store,
        executor.clone(),
        NotificationService::logging(),
    )?;

    let mut agent_metrics = AgentMetrics::new(config.metrics_log_interval_cycles);

    tracing::info!(
        "Agent is now running. Evaluating every {}s. Press Ctrl+C to stop.",
        config.cycle_interval_seconds
    );

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut interval = time::interval(Duration::from_secs(config.cycle_interval_seconds));
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let started = Instant::now();
                refresh_prices(&broker, &prices, config.price_data_file.as_deref());
                let scenarios = load_scenarios(config.scenario_file.as_deref());
                match engine.run_cycle(scenarios).await {
                    Ok(cycle) => agent_metrics.record_cycle(&cycle),
                    Err(e) => tracing::error!(
                        "Error in evaluation cycle after {:?}: {}",
                        started.elapsed(),
                        e
                    ),
                }

                match engine.summary().await {
                    Ok(summary) => tracing::info!(
                        open = summary.open_positions,
                        free_slots = summary.free_slots(),
                        avg_profit_rate = format!("{:+.2}%", summary.avg_profit_rate),
                        "Portfolio"
                    ),
                    Err(e) => tracing::warn!("Portfolio summary unavailable: {}", e),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down trading agent...");
                executor.shutdown();
                break;
            }
        }
    }

    agent_metrics.log_metrics();
    if let Ok(perf) = engine.performance(100).await {
        tracing::info!(
            trades = perf.total_trades,
            win_rate = format!("{:.1}%", perf.win_rate),
            avg_profit_rate = format!("{:+.2}%", perf.avg_profit_rate),
            "Closed trade performance"
        );
    }
    tracing::info!("Trading agent stopped");
    Ok(())
}

fn seed_quotes(broker: &PaperBroker, prices: &InMemoryPriceData) {
    let mut seeded = 0;
    for symbol in prices.symbols() {
        if let Some(price) = prices.latest_close(&symbol).and_then(Decimal::from_f64) {
            broker.set_quote(symbol, price);
            seeded += 1;
        }
    }
    tracing::debug!("Paper broker quoting {} symbols", seeded);
}

/// Price history and quotes are re-read every cycle. A failed read keeps the
/// previous snapshot.
fn refresh_prices(broker: &PaperBroker, prices: &InMemoryPriceData, path: Option<&str>) {
    let Some(path) = path else {
        return;
    };
    match prices.reload_json_file(path) {
        Ok(loaded) => {
            tracing::debug!("Reloaded {} price series from {}", loaded, path);
            seed_quotes(broker, prices);
        }
        Err(e) => tracing::warn!("Keeping previous prices, reload of {} failed: {}", path, e),
    }
}

/// Scenarios are re-read every cycle; a missing or malformed file means no new candidates.
fn load_scenarios(path: Option<&str>) -> Vec<RawScenario> {
    let Some(path) = path else {
        return Vec::new();
    };
    match std::fs::read_to_string(path) {
        Ok(raw) => match RawScenario::parse_batch(&raw) {
            Ok(batch) => {
                tracing::info!("Loaded {} scenarios from {}", batch.len(), path);
                batch
            }
            Err(e) => {
                tracing::warn!("Could not parse {}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) => {
            tracing::warn!("Could not read {}: {}", path, e);
            Vec::new()
        }
    }
}
