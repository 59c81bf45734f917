use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::audit::AuditLog;
use super::dedup::Deduplicator;
use super::normalizer::{normalize_record, TransactionNormalizer};
use super::provider::EnhancedTransaction;
use super::websocket::LogNotification;
use crate::core::types::CanonicalTransfer;
use crate::strategy::orchestrator::EngineEvent;

/// Dedup, audit and normalize incoming notifications, then hand the transfers
/// to the orchestrator. One notification's transfers travel as one batch.
pub struct IngestPipeline {
    dedup: Arc<Deduplicator>,
    normalizer: Arc<TransactionNormalizer>,
    audit: Option<Arc<AuditLog>>,
    events: mpsc::Sender<EngineEvent>,
    permits: Arc<Semaphore>,
}

impl IngestPipeline {
    pub fn new(
        dedup: Arc<Deduplicator>,
        normalizer: Arc<TransactionNormalizer>,
        events: mpsc::Sender<EngineEvent>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            dedup,
            normalizer,
            audit: None,
            events,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Consumes websocket notifications until shutdown.
    ///
    /// Each notification is processed on its own task; a panicking task only
    /// loses that notification.
    pub async fn run(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<LogNotification>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        info!("🚀 Ingest pipeline started");

        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    let Some(notification) = notification else {
                        debug!("Notification channel closed");
                        break;
                    };
                    if !self.admit(&notification) {
                        continue;
                    }
                    let pipeline = self.clone();
                    tasks.spawn(async move {
                        pipeline.process_signature(&notification.signature).await
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join_result(joined);
                }
                _ = shutdown.recv() => {
                    info!("🛑 Ingest pipeline shutting down");
                    break;
                }
            }
        }

        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Notification task panicked during shutdown: {}", e);
                }
            }
        }
        Ok(())
    }

    fn admit(&self, notification: &LogNotification) -> bool {
        if !self.dedup.should_process(&notification.signature) {
            debug!("Duplicate notification {}, skipping", notification.signature);
            return false;
        }
        self.audit_raw(&notification.raw);
        if notification.failed {
            debug!("Transaction {} failed on-chain, skipping", notification.signature);
            return false;
        }
        true
    }

    /// Normalizes one signature under the concurrency cap and forwards the batch.
    /// Returns the number of transfers forwarded.
    pub async fn process_signature(&self, signature: &str) -> usize {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return 0,
        };

        let Some(transfers) = self.normalizer.normalize(signature).await else {
            debug!("No canonical transfers for {}, skipping", signature);
            return 0;
        };

        match self.forward(transfers).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Dropping transfers for {}: {}", signature, e);
                0
            }
        }
    }

    /// Webhook path: records already carry full detail, no lookup needed.
    /// Items that fail to parse are skipped. Errors only when the orchestrator is gone.
    pub async fn ingest_records(&self, records: Vec<Value>) -> Result<usize> {
        let mut forwarded = 0;

        for raw in records {
            let record: EnhancedTransaction = match serde_json::from_value(raw.clone()) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping malformed webhook record: {}", e);
                    continue;
                }
            };
            if record.signature.is_empty() {
                warn!("Skipping webhook record without signature");
                continue;
            }
            if !self.dedup.should_process(&record.signature) {
                debug!("Duplicate webhook record {}, skipping", record.signature);
                continue;
            }
            self.audit_raw(&raw);
            forwarded += self.forward(normalize_record(&record)).await?;
        }

        Ok(forwarded)
    }

    async fn forward(&self, transfers: Vec<CanonicalTransfer>) -> Result<usize> {
        if transfers.is_empty() {
            return Ok(0);
        }
        for transfer in &transfers {
            debug!("📥 {}", transfer);
        }
        let count = transfers.len();
        self.events
            .send(EngineEvent::Transfers(transfers))
            .await
            .context("Orchestrator channel closed")?;
        Ok(count)
    }

    fn audit_raw(&self, raw: &Value) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_raw(raw) {
                warn!("Failed to append raw record to audit log: {}", e);
            }
        }
    }
}

fn log_join_result(joined: Result<usize, tokio::task::JoinError>) {
    match joined {
        Ok(count) => debug!("Notification processed ({} transfers)", count),
        Err(e) if e.is_panic() => error!("Notification handler panicked, notification dropped: {}", e),
        Err(e) => debug!("Notification task cancelled: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::dispatcher::RateLimitedDispatcher;
    use crate::ingest::provider::TransactionDetailSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    struct StaticSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransactionDetailSource for StaticSource {
        async fn fetch_transaction(&self, signature: &str) -> anyhow::Result<Option<EnhancedTransaction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if signature == "boom" {
                panic!("malformed record");
            }
            Ok(Some(EnhancedTransaction {
                signature: signature.to_string(),
                tx_type: "TRANSFER".to_string(),
                ..Default::default()
            }))
        }
    }

    fn pipeline(source: Arc<StaticSource>) -> (Arc<IngestPipeline>, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let normalizer = TransactionNormalizer::new(source, RateLimitedDispatcher::unlimited())
            .with_retry(1, Duration::from_millis(1));
        let pipeline = IngestPipeline::new(
            Arc::new(Deduplicator::new(Duration::from_secs(60))),
            Arc::new(normalizer),
            tx,
            5,
        );
        (Arc::new(pipeline), rx)
    }

    fn notification(signature: &str) -> LogNotification {
        LogNotification {
            wallet_name: "SELLER".to_string(),
            address: "S1".to_string(),
            signature: signature.to_string(),
            logs: Vec::new(),
            failed: false,
            raw: serde_json::json!({ "signature": signature }),
        }
    }

    #[tokio::test]
    async fn test_duplicates_processed_once_and_panics_isolated() {
        let source = Arc::new(StaticSource { calls: AtomicUsize::new(0) });
        let (pipeline, mut events) = pipeline(source.clone());
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(pipeline.run(note_rx, shutdown_rx));
        note_tx.send(notification("a")).unwrap();
        note_tx.send(notification("a")).unwrap();
        note_tx.send(notification("boom")).unwrap();
        note_tx.send(notification("b")).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(EngineEvent::Transfers(batch))) => seen.push(batch[0].signature.clone()),
                other => panic!("unexpected event: {:?}", other.is_ok()),
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        shutdown_tx.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_webhook_records_skip_malformed_and_duplicates() {
        let source = Arc::new(StaticSource { calls: AtomicUsize::new(0) });
        let (pipeline, mut events) = pipeline(source.clone());

        let records = vec![
            serde_json::json!({"signature": "w1", "type": "TRANSFER",
                "nativeTransfers": [{"fromUserAccount": "A", "toUserAccount": "B", "amount": 1000000000}]}),
            serde_json::json!({"signature": "w1", "type": "TRANSFER"}),
            serde_json::json!({"signature": 42}),
        ];
        let forwarded = pipeline.ingest_records(records).await.unwrap();
        assert_eq!(forwarded, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(events.recv().await, Some(EngineEvent::Transfers(b)) if b[0].signature == "w1"));
    }

    #[tokio::test]
    async fn test_closed_orchestrator_is_an_error() {
        let source = Arc::new(StaticSource { calls: AtomicUsize::new(0) });
        let (pipeline, events) = pipeline(source);
        drop(events);
        let result = pipeline
            .ingest_records(vec![serde_json::json!({"signature": "x", "type": "TRANSFER"})])
            .await;
        assert!(result.is_err());
    }
}
