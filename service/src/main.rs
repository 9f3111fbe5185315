use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use exchanger::{AdapterContext, AdapterRegistry, AdapterSettings};
use payrouter_core::parsing::{encode_invoice_task, parse_invoice_task};
use payrouter_core::validation::validate;
use payrouter_core::InvoiceLedger;
use queue::{
    BrokerSettings, Dispatcher, JsonlAuditSink, PipelineSettings, QueuePipeline,
    ReconciliationEngine, Scheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::SledInvoiceStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "payrouter", version, about = "Routes payment invoices to providers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the invoice queue and reconcile until Ctrl-C
    Run,
    /// Write the effective configuration to the config file
    InitConfig,
    /// Print the effective configuration as JSON
    ShowConfig,
    /// Save a secret (e.g. rabbitmq_password) in the OS keychain
    StoreSecret { key: String, value: String },
    /// Validate a task file and publish it to the invoice exchange
    Publish { path: PathBuf },
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn broker_settings(cfg: &AppConfig) -> Result<BrokerSettings> {
    let password = config::broker_password()?;
    let broker = &cfg.broker;
    let mut settings = BrokerSettings::new(broker.amqp_url(&password)?);
    settings.exchange = broker.exchange.clone();
    settings.queue = broker.queue.clone();
    settings.routing_key = broker.routing_key.clone();
    settings.dead_letter_exchange = broker.dead_letter_exchange.clone();
    settings.dead_letter_queue = broker.dead_letter_queue.clone();
    settings.dead_letter_routing_key = broker.dead_letter_routing_key.clone();
    settings.prefetch_count = broker.prefetch_count;
    settings.delivery_limit = broker.delivery_limit;
    settings.consumer_tag = broker.consumer_tag.clone();
    settings.channel_capacity = usize::from(broker.prefetch_count);
    Ok(settings)
}

fn pipeline_settings(cfg: &AppConfig) -> PipelineSettings {
    PipelineSettings {
        batch_size: cfg.pipeline.batch_size,
        idle_timeout: Duration::from_millis(cfg.pipeline.idle_timeout_ms),
        max_concurrency: cfg.pipeline.max_concurrency,
        task_ttl: chrono::Duration::seconds(cfg.pipeline.task_ttl_secs),
    }
}

fn adapter_settings(cfg: &AppConfig) -> AdapterSettings {
    AdapterSettings {
        request_timeout: Duration::from_secs(cfg.providers.request_timeout_secs),
        requisites_ttl: chrono::Duration::seconds(cfg.providers.requisites_ttl_secs),
    }
}

async fn run(cfg: AppConfig) -> Result<()> {
    let store = SledInvoiceStore::open(&cfg.storage.store_path)
        .with_context(|| format!("Failed to open store at {}", cfg.storage.store_path))?;
    let audit = JsonlAuditSink::new(&cfg.storage.audit_path);
    let ledger = InvoiceLedger::new(Arc::new(store.clone()), Arc::new(audit));

    let ctx = AdapterContext::new(ledger.clone(), adapter_settings(&cfg))
        .context("Failed to build HTTP client")?;
    let registry = AdapterRegistry::with_builtin(ctx);
    tracing::info!(providers = ?registry.names(), "adapters registered");

    let mut broker = queue::broker::connect(broker_settings(&cfg)?)
        .await
        .context("Failed to set up broker")?;
    let inbox = broker.consume().await.context("Failed to start consumer")?;

    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), ledger.clone()));
    let pipeline = Arc::new(QueuePipeline::new(inbox, dispatcher, pipeline_settings(&cfg)));
    let reconciler = Arc::new(ReconciliationEngine::new(registry, ledger));
    let handle = Scheduler::new(
        pipeline,
        reconciler,
        Duration::from_secs(cfg.pipeline.interval_secs),
        Duration::from_secs(cfg.reconciliation.interval_secs),
    )
    .start();

    tracing::info!("payrouter running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    handle.shutdown();
    broker.close().await;
    store.flush().context("Failed to flush store")?;
    Ok(())
}

async fn publish(cfg: AppConfig, path: PathBuf) -> Result<()> {
    let body = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let task = parse_invoice_task(&body).context("Task file is not a valid invoice task")?;
    validate(&task).context("Task failed validation")?;

    let broker = queue::broker::connect(broker_settings(&cfg)?)
        .await
        .context("Failed to set up broker")?;
    broker
        .publish(&encode_invoice_task(&task)?)
        .await
        .context("Failed to publish task")?;
    tracing::info!(invoice_id = task.invoice.id, "task published");
    broker.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config::load()?).await,
        Command::InitConfig => {
            let cfg = config::load()?;
            config::store(&cfg)?;
            tracing::info!("configuration written");
            Ok(())
        }
        Command::ShowConfig => {
            let cfg = config::load()?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
        Command::StoreSecret { key, value } => {
            config::store_secret(&key, &value)
                .with_context(|| format!("Failed to store secret {key}"))?;
            tracing::info!(%key, "secret stored");
            Ok(())
        }
        Command::Publish { path } => publish(config::load()?, path).await,
    }
}
