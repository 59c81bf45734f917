//! Transaction ingestion: subscriptions, webhook, dedup, rate limiting and normalization

pub mod audit;
pub mod dedup;
pub mod dispatcher;
pub mod normalizer;
pub mod pipeline;
pub mod provider;
pub mod webhook;
pub mod websocket;

pub use audit::AuditLog;
pub use dedup::Deduplicator;
pub use dispatcher::{LimiterId, RateLimitedDispatcher};
pub use normalizer::{normalize_record, TransactionNormalizer};
pub use pipeline::IngestPipeline;
pub use provider::{EnhancedTransaction, HeliusClient, TransactionDetailSource};
pub use websocket::{LogNotification, SubscriptionCommand, SubscriptionManager, WebSocketConfig};
