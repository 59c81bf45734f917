use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use super::audit::AuditLog;
use super::dispatcher::{LimiterId, RateLimitedDispatcher};
use super::provider::{EnhancedTransaction, SwapEvent, TransactionDetailSource};
use crate::core::types::{Asset, CanonicalTransfer, SwapLeg, TransferEvent};
use crate::core::utils::lamports_to_sol;

/// Converts provider records into canonical transfers
pub struct TransactionNormalizer {
    source: Arc<dyn TransactionDetailSource>,
    dispatcher: RateLimitedDispatcher,
    audit: Option<Arc<AuditLog>>,
    max_attempts: u32,
    retry_base: Duration,
}

impl TransactionNormalizer {
    pub fn new(source: Arc<dyn TransactionDetailSource>, dispatcher: RateLimitedDispatcher) -> Self {
        Self {
            source,
            dispatcher,
            audit: None,
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_base = retry_base;
        self
    }

    /// Fetches the detail for `signature` and normalizes it.
    ///
    /// `None` means skip: the lookup kept failing or the provider had nothing.
    pub async fn normalize(&self, signature: &str) -> Option<Vec<CanonicalTransfer>> {
        let record = self.fetch_with_retry(signature).await?;
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_detail(&record) {
                warn!("Failed to append detail record to audit log: {}", e);
            }
        }
        Some(normalize_record(&record))
    }

    async fn fetch_with_retry(&self, signature: &str) -> Option<EnhancedTransaction> {
        for attempt in 1..=self.max_attempts {
            let result = self
                .dispatcher
                .dispatch(LimiterId::DetailLookup, || self.source.fetch_transaction(signature))
                .await;

            match result {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {
                    debug!("No transaction data received for {}", signature);
                    return None;
                }
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.retry_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "Detail lookup for {} failed (attempt {}/{}): {} - retrying in {:?}",
                        signature, attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!("Detail lookup for {} failed after {} attempts: {}", signature, attempt, e);
                }
            }
        }
        None
    }
}

fn record_timestamp(record: &EnhancedTransaction) -> DateTime<Utc> {
    record
        .timestamp
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Normalizes a record that is already in hand (webhook transport, tests).
///
/// Swaps yield up to two transfers, input leg first. Plain transfers and mints
/// only canonicalize the first token transfer, or failing that the first native
/// transfer; additional entries in the same record are ignored.
pub fn normalize_record(record: &EnhancedTransaction) -> Vec<CanonicalTransfer> {
    let timestamp = record_timestamp(record);
    let wrap = |event: TransferEvent| CanonicalTransfer {
        signature: record.signature.clone(),
        timestamp,
        event,
    };

    let events = match record.tx_type.as_str() {
        "SWAP" => {
            let legs = record.events.swap.as_ref().map(swap_legs).unwrap_or_default();
            if legs.is_empty() {
                vec![TransferEvent::Other { tx_type: record.tx_type.clone() }]
            } else {
                legs
            }
        }
        "TRANSFER" => vec![first_transfer(record)
            .unwrap_or_else(|| TransferEvent::Other { tx_type: record.tx_type.clone() })],
        "TOKEN_MINT" => vec![record
            .token_transfers
            .first()
            .map(|t| TransferEvent::Mint {
                mint: t.mint.clone(),
                to: t.to_user_account.clone().unwrap_or_default(),
                amount: t.ui_amount(),
            })
            .unwrap_or_else(|| TransferEvent::Other { tx_type: record.tx_type.clone() })],
        other => vec![TransferEvent::Other { tx_type: other.to_string() }],
    };

    events.into_iter().map(wrap).collect()
}

fn first_transfer(record: &EnhancedTransaction) -> Option<TransferEvent> {
    if let Some(t) = record.token_transfers.first() {
        return Some(TransferEvent::Transfer {
            from: t.from_user_account.clone().unwrap_or_default(),
            to: t.to_user_account.clone().unwrap_or_default(),
            asset: Asset::from_mint(&t.mint),
            amount: t.ui_amount(),
        });
    }
    record.native_transfers.first().map(|t| TransferEvent::Transfer {
        from: t.from_user_account.clone().unwrap_or_default(),
        to: t.to_user_account.clone().unwrap_or_default(),
        asset: Asset::Native,
        amount: lamports_to_sol(t.amount),
    })
}

fn swap_legs(swap: &SwapEvent) -> Vec<TransferEvent> {
    let inner = swap.inner_swaps.first();

    let input = if let Some(t) = swap.token_inputs.first() {
        Some(TransferEvent::Swap {
            leg: SwapLeg::Input,
            account: t.user_account.clone().unwrap_or_default(),
            asset: Asset::from_mint(&t.mint),
            amount: t.ui_amount(),
        })
    } else if let Some(native) = &swap.native_input {
        Some(TransferEvent::Swap {
            leg: SwapLeg::Input,
            account: native.account.clone(),
            asset: Asset::Native,
            amount: lamports_to_sol(native.amount),
        })
    } else {
        inner.and_then(|i| i.token_inputs.first()).map(|t| TransferEvent::Swap {
            leg: SwapLeg::Input,
            account: t.from_user_account.clone().unwrap_or_default(),
            asset: Asset::from_mint(&t.mint),
            amount: t.ui_amount(),
        })
    };

    let output = if let Some(t) = swap.token_outputs.first() {
        Some(TransferEvent::Swap {
            leg: SwapLeg::Output,
            account: t.user_account.clone().unwrap_or_default(),
            asset: Asset::from_mint(&t.mint),
            amount: t.ui_amount(),
        })
    } else if let Some(native) = &swap.native_output {
        Some(TransferEvent::Swap {
            leg: SwapLeg::Output,
            account: native.account.clone(),
            asset: Asset::Native,
            amount: lamports_to_sol(native.amount),
        })
    } else {
        inner.and_then(|i| i.token_outputs.first()).map(|t| TransferEvent::Swap {
            leg: SwapLeg::Output,
            account: t.to_user_account.clone().unwrap_or_default(),
            asset: Asset::from_mint(&t.mint),
            amount: t.ui_amount(),
        })
    };

    input.into_iter().chain(output).collect()
}
