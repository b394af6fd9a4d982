use clap::{Parser, ValueEnum};
use jats::analyzer::Analyzer;
use jats::config::{AppConfig, Overrides, Platform};
use jats::gateway::{ExchangeGateway, KisGateway, PaperGateway, UpbitGateway};
use jats::notifier::{LogNotifier, Notifier, TelegramNotifier};
use jats::orchestrator::{discover_markets, Orchestrator, Scheduler};
use jats::strategy::IndicatorCrossStrategy;
use jats::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Env {
    Dev,
    Prod,
}

impl Env {
    fn as_str(&self) -> &'static str {
        match self {
            Env::Dev => "dev",
            Env::Prod => "prod",
        }
    }
}

#[derive(Parser)]
#[command(name = "jats", about = "Automated spot trading engine")]
struct Cli {
    /// Exchange backend
    #[arg(value_enum)]
    platform: Platform,

    /// Configuration profile (reads config/{env}_config.yaml)
    #[arg(value_enum)]
    env: Env,

    /// Signal check cadence in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Simulate orders against live market data
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let overrides = Overrides {
        platform: cli.platform,
        dry_run: cli.dry_run,
        signal_check_secs: cli.interval,
    };
    let config = match AppConfig::load(cli.env.as_str(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            setup_logging("info");
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    setup_logging(&config.log.level);

    tracing::info!(
        "🚀 JATS starting (platform: {}, env: {}{})",
        config.platform.as_str(),
        cli.env.as_str(),
        if config.simulated() { ", simulated orders" } else { "" }
    );

    let gateway = build_gateway(&config)?;
    let notifier = build_notifier(&config)?;

    let markets = discover_markets(&config, gateway.as_ref()).await?;
    if markets.is_empty() {
        anyhow::bail!("No {} markets to trade", config.quote_currency);
    }

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Markets: {}", markets.join(", "));
    tracing::info!(
        "  Stop-loss: {}% / trail {}%",
        config.risk.stop_loss_percent,
        config.risk.stop_loss_percent_high
    );
    tracing::info!(
        "  Max per trade: {:.0} {q}, max daily loss: {:.0} {q}",
        config.risk.max_investment_per_trade,
        config.risk.max_daily_loss,
        q = config.quote_currency
    );
    tracing::info!(
        "  Cadences: price {}s, signal {}s, cleanup {}s, reconcile {}s",
        config.schedule.price_tick_secs,
        config.schedule.signal_check_secs,
        config.schedule.order_cleanup_secs,
        config.schedule.reconcile_secs
    );

    let analyzer = Analyzer::new(Arc::new(IndicatorCrossStrategy::new()), config.risk.clone());
    let scheduler = Scheduler::from_config(&config.schedule);
    let orchestrator = Orchestrator::new(config, markets, gateway, notifier, analyzer);

    tracing::info!("\nPress Ctrl+C to stop...\n");
    orchestrator
        .run(scheduler, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        })
        .await;

    tracing::info!("👋 JATS stopped");
    Ok(())
}

fn setup_logging(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("jats={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_gateway(config: &AppConfig) -> Result<Arc<dyn ExchangeGateway>> {
    let live: Arc<dyn ExchangeGateway> = match config.platform {
        Platform::Kis => Arc::new(KisGateway::new(&config.kis)?),
        Platform::Upbit | Platform::Paper => Arc::new(UpbitGateway::new(&config.upbit)?),
    };
    if config.simulated() {
        tracing::info!(
            "📝 Paper trading with {:.0} {}",
            config.execution.paper_quote_balance,
            config.quote_currency
        );
        let paper = PaperGateway::new(
            &config.quote_currency,
            config.execution.paper_quote_balance,
            config.execution.fee_rate,
        )
        .with_quotes(live);
        return Ok(Arc::new(paper));
    }
    Ok(live)
}

fn build_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>> {
    let quiet_hours = Some(config.telegram.quiet_hours()?);
    let prefix = config.platform.as_str();

    match config.telegram.credentials() {
        Some((token, chat_id)) => {
            tracing::info!("📨 Telegram notifications enabled");
            Ok(Arc::new(TelegramNotifier::new(token, chat_id, prefix, quiet_hours)))
        }
        None => {
            tracing::info!("Telegram not configured, notifications go to the log");
            Ok(Arc::new(LogNotifier::new(prefix, quiet_hours)))
        }
    }
}
