use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use comms_pipeline::classifier::{self, ClassificationEngine};
use comms_pipeline::config::PipelineConfig;
use comms_pipeline::events::{EventConsumer, TopicExchange};
use comms_pipeline::grouping::{self, GroupingEngine};
use comms_pipeline::ingest::{IncomingMessage, IngestService};
use comms_pipeline::llm::{AiClassifier, OpenAiClassifier};
use comms_pipeline::responder::{
    self, DeliveryService, ResponderEngine, RuleStore, TwilioGateway,
};
use comms_pipeline::spam::{self, ReputationService, SpamEngine};
use comms_pipeline::store::{Database, LibSqlBackend};

/// Console logging, plus a daily rolling file when `COMMS_LOG_DIR` is set.
/// The returned guard must live as long as the process.
fn init_tracing(
    config: &PipelineConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "comms-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

/// Wait until every queue has been idle for two consecutive polls and no
/// delayed reply is left to send.
async fn drain(exchange: &TopicExchange, responder: &ResponderEngine) {
    loop {
        let mut idle_polls = 0;
        while idle_polls < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            idle_polls = if exchange.is_idle() { idle_polls + 1 } else { 0 };
        }
        if responder.pending_replies() == 0 {
            return;
        }
        responder.finish_pending().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("📨 Comms pipeline v{}", env!("CARGO_PKG_VERSION"));

    // ── Store ────────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.store.db_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", config.store.db_path.display())
            })?,
    );
    eprintln!("   Database: {}", config.store.db_path.display());

    // ── Bus ──────────────────────────────────────────────────────────────
    let exchange = TopicExchange::new(&config.bus.exchange_name, config.bus.queue_capacity);
    let policy = config.bus.failure_policy;
    eprintln!("   Exchange: {} ({policy:?})", config.bus.exchange_name);

    // ── Engines ──────────────────────────────────────────────────────────
    let grouper = Arc::new(GroupingEngine::new(Arc::clone(&db), exchange.clone()));
    let mut grouper_consumer = EventConsumer::new(exchange.clone(), grouping::SERVICE_NAME, policy);
    grouper.register(&mut grouper_consumer)?;

    let ai: Option<Arc<dyn AiClassifier>> = OpenAiClassifier::from_config(&config.classifier)?
        .map(|c| Arc::new(c) as Arc<dyn AiClassifier>);
    eprintln!(
        "   Classifier: {}",
        match &ai {
            Some(c) => format!("AI ({}) + rules", c.model_name()),
            None => "rules only (OPENAI_API_KEY not set)".to_string(),
        }
    );
    let classifier = Arc::new(ClassificationEngine::new(
        Arc::clone(&db),
        exchange.clone(),
        ai,
        &config.classifier,
    ));
    let mut classifier_consumer =
        EventConsumer::new(exchange.clone(), classifier::SERVICE_NAME, policy);
    classifier.register(&mut classifier_consumer)?;

    let reputation = ReputationService::from_config(&config.spam)?;
    let spam_engine = Arc::new(SpamEngine::new(
        Arc::clone(&db),
        exchange.clone(),
        reputation,
        config.spam.clone(),
    ));
    let mut spam_consumer = EventConsumer::new(exchange.clone(), spam::SERVICE_NAME, policy);
    spam_engine.register(&mut spam_consumer)?;

    let gateway = TwilioGateway::from_config(&config.responder)?;
    eprintln!(
        "   SMS: {}",
        if gateway.is_some() { "twilio" } else { "disabled" }
    );
    let responder_engine = Arc::new(ResponderEngine::new(
        Arc::clone(&db),
        exchange.clone(),
        Arc::new(RuleStore::default()),
        DeliveryService::new(gateway, Arc::clone(&db)),
        config.responder.clone(),
    ));
    let mut responder_consumer =
        EventConsumer::new(exchange.clone(), responder::SERVICE_NAME, policy);
    responder_engine.register(&mut responder_consumer)?;

    let mut consumers = JoinSet::new();
    for consumer in [
        grouper_consumer,
        classifier_consumer,
        spam_consumer,
        responder_consumer,
    ] {
        consumers.spawn(consumer.start_consuming());
    }

    // ── Ingress: one JSON message per stdin line ─────────────────────────
    let ingest = IngestService::new(Arc::clone(&db), exchange.clone());
    eprintln!("   Reading JSON messages from stdin. Ctrl-C to exit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let incoming: IncomingMessage = match serde_json::from_str(line) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(error = %e, "Rejected malformed message");
                            continue;
                        }
                    };
                    if let Err(e) = ingest.receive(incoming, Uuid::new_v4()).await {
                        tracing::warn!(error = %e, "Message not ingested");
                    }
                }
                Ok(None) => {
                    tracing::info!("stdin closed, draining queues");
                    tokio::select! {
                        _ = drain(&exchange, &responder_engine) => {}
                        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
                    }
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error reading stdin");
                    break;
                }
            },
        }
    }

    // Only non-zero when interrupted; a completed drain leaves none.
    responder_engine.abort_pending();
    exchange.close();
    while let Some(result) = consumers.join_next().await {
        match result {
            Ok(Ok(stats)) => tracing::debug!(?stats, "Consumer finished"),
            Ok(Err(e)) => tracing::error!(error = %e, "Consumer failed"),
            Err(e) => tracing::error!(error = %e, "Consumer task panicked"),
        }
    }
    Ok(())
}
