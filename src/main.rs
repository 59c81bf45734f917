use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use handoff::config::Config;
use handoff::ingest::{
    webhook, AuditLog, Deduplicator, HeliusClient, IngestPipeline, RateLimitedDispatcher, SubscriptionManager,
    TransactionNormalizer, WebSocketConfig,
};
use handoff::strategy::{Orchestrator, PatternStateMachine, TradePlan};
use handoff::trading::{
    wallet, ChainClient, ExecutionConfig, JupiterClient, PnlLedger, SolanaChainClient, TokenInfoProvider,
    TradeExecutionEngine,
};

struct ServiceOrchestrator {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl ServiceOrchestrator {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, name: &'static str, service: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        info!("▶️ Starting {}", name);
        let task = tokio::spawn(async move {
            let result = service.await;
            if let Err(e) = &result {
                error!("{} stopped with error: {:#}", name, e);
            }
            result
        });
        self.tasks.push((name, task));
    }

    #[instrument(skip_all)]
    async fn start_all_services(&mut self, config: Config) -> Result<()> {
        info!("🚀 Starting handoff services");

        let keypair = wallet::load_keypair(config.wallets.keypair_path.as_deref(), &config.wallets.private_key_env)?;
        let api_key = config
            .provider
            .api_key
            .clone()
            .context("API key missing after validation")?;

        let limits = &config.limits;
        let dispatcher = RateLimitedDispatcher::new(
            limits.detail_lookups_per_sec,
            limits.rpc_calls_per_sec,
            limits.aggregator_calls_per_sec,
        );
        let audit = Arc::new(AuditLog::open(&config.ingest.audit_dir)?);

        // Trading
        let chain = Arc::new(SolanaChainClient::new(
            config.provider.rpc_url.clone(),
            keypair,
            dispatcher.clone(),
        ));
        let jupiter = Arc::new(JupiterClient::new(
            config.execution.jupiter_api_url.clone(),
            config.execution.priority_fee_lamports,
        )?);
        let token_info = Arc::new(TokenInfoProvider::new(
            config.execution.price_api_url.clone(),
            chain.clone(),
            dispatcher.clone(),
        )?);
        let ledger = Arc::new(RwLock::new(PnlLedger::new()));
        let engine = TradeExecutionEngine::new(
            jupiter,
            chain.clone(),
            ledger,
            ExecutionConfig::from_settings(&config.execution, config.wallets.profit_wallet.clone()),
        )
        .with_dispatcher(dispatcher.clone());
        let engine = Arc::new(engine);

        // Detection
        let watched = config.watched_addresses();
        let machine = PatternStateMachine::new(config.detection.clone(), watched.clone(), token_info)
            .with_trader(chain.owner().to_string());
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let orchestrator =
            Orchestrator::new(machine, engine, TradePlan::from(&config.execution)).with_watch_commands(watch_tx);
        let events = orchestrator.sender();
        self.spawn("orchestrator", orchestrator.run(self.shutdown_tx.subscribe()));

        // Ingestion
        let helius = Arc::new(HeliusClient::new(config.provider.transactions_api_url.clone(), api_key)?);
        let normalizer = TransactionNormalizer::new(helius, dispatcher).with_audit(audit.clone());
        let dedup = Arc::new(Deduplicator::new(Duration::from_secs(limits.dedup_retention_secs)));
        let sweeper = dedup
            .clone()
            .spawn_sweeper(Duration::from_secs(limits.dedup_retention_secs.max(1)), self.shutdown_tx.subscribe());
        self.spawn("dedup sweeper", async move {
            sweeper.await.context("Dedup sweeper task failed")
        });

        let pipeline = Arc::new(
            IngestPipeline::new(dedup, Arc::new(normalizer), events, limits.max_concurrent_normalizations)
                .with_audit(audit),
        );

        if config.ingest.websocket_enabled {
            let (notification_tx, notification_rx) = mpsc::unbounded_channel();
            let ws_config = WebSocketConfig {
                url: config.provider.websocket_url(),
                ping_interval: Duration::from_secs(config.ingest.ping_interval_secs),
                max_backoff: Duration::from_secs(config.ingest.max_backoff_secs),
                ..WebSocketConfig::default()
            };
            let manager = Arc::new(SubscriptionManager::new(ws_config, notification_tx, self.shutdown_tx.clone()));
            for (role, address) in watched.iter() {
                manager.watch(role, address);
            }
            self.spawn("subscriptions", async move { manager.run(watch_rx).await });
            self.spawn("ingest pipeline", pipeline.clone().run(notification_rx, self.shutdown_tx.subscribe()));
        } else {
            warn!("⚠️ Websocket ingestion disabled, discovered wallets will not be subscribed");
            drop(watch_rx);
        }

        if config.ingest.webhook_enabled {
            self.spawn(
                "webhook",
                webhook::serve(config.ingest.webhook_port, pipeline, self.shutdown_tx.subscribe()),
            );
        }

        info!("✅ All {} services started successfully", self.tasks.len());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown_all(&mut self) -> Result<()> {
        info!("🛑 Shutting down all services");

        let _ = self.shutdown_tx.send(());
        debug!("Shutdown signal sent to all services");

        for (name, task) in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => info!("✅ {} shut down cleanly", name),
                Ok(Err(e)) => warn!("⚠️ {} error during shutdown: {}", name, e),
                Err(e) => error!("❌ {} task failed: {}", name, e),
            }
        }

        info!("✅ All services shut down");
        Ok(())
    }
}

fn init_tracing() -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "handoff.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Keep the file writer alive for the whole process
    std::mem::forget(guard);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("🤝 Handoff Trading Bot");
    info!("======================");

    let config_path = std::env::var("HANDOFF_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let private_key_present = std::env::var(&config.wallets.private_key_env)
        .map(|k| !k.is_empty())
        .unwrap_or(false);
    if let Err(e) = config.validate(private_key_present) {
        error!("❌ Invalid configuration: {}", e);
        return Err(e.into());
    }
    if config.execution.dry_run {
        warn!("🧪 Dry run mode: trades are quoted but never submitted");
    }

    let mut services = ServiceOrchestrator::new();

    if let Err(e) = services.start_all_services(config).await {
        error!("Failed to start services: {:#}", e);
        services.shutdown_all().await?;
        return Err(e);
    }
    info!("🎯 Watching for handoff patterns");
    info!("Press Ctrl+C to shutdown all services");

    match signal::ctrl_c().await {
        Ok(()) => info!("🛑 Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    services.shutdown_all().await?;

    info!("👋 Handoff shutdown complete");
    Ok(())
}
