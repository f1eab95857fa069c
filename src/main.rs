//! Estate engine
//!
//! Resolves marketplace listings into canonical properties and publishes
//! valuations and fraud signals on a schedule.

use clap::{Parser, Subcommand};
use estate_engine::{
    config::{ConfigHandle, EngineConfig},
    engine::{load_listings, Engine, InboxSource, IngestQueue, Scheduler},
    events::EventBus,
    fraud::RiskTier,
    normalize::Normalizer,
    storage::Database,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "estate-engine")]
#[command(about = "Property resolution, valuation and fraud scoring for real-estate listings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scheduled passes over the inbox
    Run {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Validate the configuration file
    CheckConfig,
    /// Normalize a listings file and print the result without storing it
    Normalize {
        /// JSON array or JSON Lines file of raw listings
        file: String,
    },
    /// Show stored properties at or above a risk tier
    Risky {
        /// low, medium or high
        #[arg(short, long, default_value = "medium")]
        tier: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = shellexpand::tilde(&cli.config).to_string();

    match cli.command {
        Commands::Run { once } => run_engine(&config_path, once).await,
        Commands::CheckConfig => check_config(&config_path),
        Commands::Normalize { file } => normalize_file(&config_path, &file),
        Commands::Risky { tier } => show_risky(&config_path, &tier).await,
    }
}

async fn run_engine(config_path: &str, once: bool) -> anyhow::Result<()> {
    let handle = Arc::new(ConfigHandle::load(config_path)?);
    let config = handle.snapshot().config;
    tracing::info!("Starting estate engine with {}", config_path);

    let db_path = shellexpand::tilde(&config.database.path).to_string();
    let db = Arc::new(Database::connect(&db_path).await?);

    let engine = Arc::new(Engine::new());
    let restored = engine.restore(
        db.load_properties().await?,
        db.load_valuations().await?,
        db.load_fraud_signals().await?,
    );
    tracing::info!("Restored {} properties from {}", restored, db_path);

    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!("Event {} for {:?}", event.kind(), event.cluster_id());
        }
    });

    let inbox = InboxSource::new(
        shellexpand::tilde(&config.schedule.inbox_dir).to_string(),
        shellexpand::tilde(&config.schedule.processed_dir).to_string(),
    );
    let scheduler = Scheduler::new(
        Arc::clone(&handle),
        engine,
        Arc::new(IngestQueue::default()),
        db,
    )
    .with_source(Arc::new(inbox))
    .with_event_bus(bus);

    let interval = Duration::from_secs(config.schedule.batch_interval_secs.max(1));
    scheduler.run(interval, once).await?;
    Ok(())
}

fn check_config(config_path: &str) -> anyhow::Result<()> {
    let handle = ConfigHandle::load(config_path)?;
    let snapshot = handle.snapshot();
    let config = &snapshot.config;
    println!("Configuration OK: {} (generation {})", config_path, snapshot.generation);
    println!("  merge threshold:   {}", config.resolver.merge_threshold);
    println!("  safety margin:     {}", config.pricing.safety_margin_pct);
    println!("  staleness:         {} days", config.pricing.staleness_days);
    println!("  min comparables:   {}", config.valuation.min_comparables);
    println!(
        "  fraud rules:       {} ({} enabled)",
        config.fraud.rules.len(),
        config.fraud.rules.values().filter(|r| r.enabled).count()
    );
    Ok(())
}

fn normalize_file(config_path: &str, file: &str) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path)?;
    let raws = load_listings(file)?;
    let normalizer = Normalizer::new(config.normalizer);

    let (accepted, rejected) = normalizer.normalize_batch(&raws, chrono::Utc::now());
    for listing in &accepted {
        println!("{}", serde_json::to_string(listing)?);
    }
    for rejection in &rejected {
        eprintln!("{} rejected: {} ({})", rejection.key, rejection.reason, rejection.detail);
    }
    eprintln!("{} accepted, {} rejected", accepted.len(), rejected.len());
    Ok(())
}

async fn show_risky(config_path: &str, tier: &str) -> anyhow::Result<()> {
    let tier = match tier.to_lowercase().as_str() {
        "low" => RiskTier::Low,
        "medium" => RiskTier::Medium,
        "high" => RiskTier::High,
        other => anyhow::bail!("unknown risk tier {}", other),
    };

    let config = EngineConfig::load(config_path)?;
    let db = Database::connect(shellexpand::tilde(&config.database.path).to_string()).await?;

    let signals = db.risky_properties(tier).await?;
    println!("{} properties at or above {:?}", signals.len(), tier);
    for signal in signals {
        let rules: Vec<String> = signal.triggered.iter().map(|r| r.rule.to_string()).collect();
        println!("  {}  score {}  {:?}  [{}]", signal.cluster_id, signal.score, signal.tier, rules.join(", "));
    }
    Ok(())
}
