/// Trade Execution Engine
///
/// Sizes a buy or sell, quotes and builds it through the swap aggregator,
/// submits and confirms it on-chain and records the fill in the ledger.
/// Failed attempts are retried a fixed number of times.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument, warn};

use super::chain::{ChainClient, Confirmation, MintInfo};
use super::jupiter_client::{QuoteResponse, SwapAggregator};
use super::ledger::{PnlLedger, TradeSide, TransactionRecord};
use crate::config::Execution;
use crate::ingest::dispatcher::{LimiterId, RateLimitedDispatcher};
use crate::core::constants::SOL_MINT;
use crate::core::utils::{lamports_to_sol, shorten_pubkey, sol_to_lamports, token_amount_to_ui, ui_to_token_amount};

/// Why a single trade attempt failed
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("No usable route for {input} -> {output}")]
    NoRoute { input: String, output: String },

    #[error("Balance or mint lookup failed: {0}")]
    Rpc(String),

    #[error("Quote request failed: {0}")]
    Quote(String),

    #[error("Swap build failed: {0}")]
    Build(String),

    #[error("Transaction submission failed: {0}")]
    Submit(String),

    #[error("Confirmation timed out for {0}")]
    ConfirmationTimeout(String),

    #[error("Transaction {signature} failed on-chain: {reason}")]
    TransactionFailed { signature: String, reason: String },
}

impl TradeError {
    /// Missing data is not going to appear on the next attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TradeError::InsufficientBalance(_) | TradeError::NoRoute { .. })
    }
}

/// What the caller learns about a trade
#[derive(Debug, Clone, PartialEq)]
pub struct TradeOutcome {
    pub success: bool,
    pub signature: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl TradeOutcome {
    pub fn failed(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            signature: None,
            attempts,
            error: Some(error.into()),
        }
    }
}

/// Filled amounts of one confirmed swap
#[derive(Debug, Clone)]
struct Fill {
    token_amount: f64,
    sol_amount: f64,
    signature: String,
}

/// Configuration for trade execution
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub confirmation_timeout: Duration,
    /// SOL left untouched when sizing a buy
    pub fee_reserve_sol: f64,
    /// SOL kept in the wallet when sweeping profit
    pub sweep_reserve_sol: f64,
    pub profit_wallet: Option<String>,
    /// Quote only, never submit
    pub dry_run: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::from_settings(&Execution::default(), None)
    }
}

impl ExecutionConfig {
    pub fn from_settings(execution: &Execution, profit_wallet: Option<String>) -> Self {
        Self {
            max_attempts: execution.max_attempts.max(1),
            retry_delay: Duration::from_millis(execution.retry_delay_ms),
            confirmation_timeout: Duration::from_secs(execution.confirmation_timeout_secs),
            fee_reserve_sol: execution.fee_reserve_sol,
            sweep_reserve_sol: execution.sweep_reserve_sol,
            profit_wallet,
            dry_run: execution.dry_run,
        }
    }
}

pub struct TradeExecutionEngine {
    aggregator: Arc<dyn SwapAggregator>,
    chain: Arc<dyn ChainClient>,
    ledger: Arc<RwLock<PnlLedger>>,
    config: ExecutionConfig,
    dispatcher: RateLimitedDispatcher,
}

impl TradeExecutionEngine {
    pub fn new(
        aggregator: Arc<dyn SwapAggregator>,
        chain: Arc<dyn ChainClient>,
        ledger: Arc<RwLock<PnlLedger>>,
        config: ExecutionConfig,
    ) -> Self {
        info!("🎯 Trade execution engine created:");
        info!("   • Wallet: {}", chain.owner());
        info!("   • Max attempts: {} ({:?} apart)", config.max_attempts, config.retry_delay);
        info!("   • Fee reserve: {} SOL", config.fee_reserve_sol);
        info!("   • Dry run mode: {}", config.dry_run);

        Self {
            aggregator,
            chain,
            ledger,
            config,
            dispatcher: RateLimitedDispatcher::unlimited(),
        }
    }

    /// Quote and swap-build calls wait on the aggregator budget
    pub fn with_dispatcher(mut self, dispatcher: RateLimitedDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn ledger(&self) -> Arc<RwLock<PnlLedger>> {
        self.ledger.clone()
    }

    pub fn wallet(&self) -> String {
        self.chain.owner().to_string()
    }

    /// Buys `token` with `size_percent` of spendable SOL, or sells `size_percent`
    /// of the held `token` back to SOL. A confirmed fill is recorded; a failed
    /// trade records nothing.
    #[instrument(skip(self, token), fields(token = %shorten_pubkey(token)))]
    pub async fn trade(&self, token: &str, size_percent: f64, side: TradeSide, slippage_bps: u16) -> TradeOutcome {
        let max_attempts = self.config.max_attempts;

        for attempt in 1..=max_attempts {
            match self.attempt(token, size_percent, side, slippage_bps).await {
                Ok(fill) => {
                    info!(
                        "✅ {} confirmed on attempt {}: {:.6} tokens for {:.6} SOL ({})",
                        side, attempt, fill.token_amount, fill.sol_amount, fill.signature
                    );
                    self.record(token, side, &fill).await;
                    if side == TradeSide::Sell {
                        self.sweep_profit().await;
                    }
                    return TradeOutcome {
                        success: true,
                        signature: Some(fill.signature),
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(e) if !e.is_retryable() => {
                    error!("❌ {} of {} abandoned: {}", side, shorten_pubkey(token), e);
                    return TradeOutcome::failed(attempt, e.to_string());
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "⚠️ {} attempt {}/{} failed: {} - retrying in {:?}",
                        side, attempt, max_attempts, e, self.config.retry_delay
                    );
                    sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "❌ {} of {} failed after {} attempts: {}",
                        side, shorten_pubkey(token), max_attempts, e
                    );
                    return TradeOutcome::failed(attempt, e.to_string());
                }
            }
        }

        TradeOutcome::failed(max_attempts, "no attempts made")
    }

    async fn attempt(&self, token: &str, size_percent: f64, side: TradeSide, slippage_bps: u16) -> Result<Fill, TradeError> {
        let mint = self
            .chain
            .mint_info(token)
            .await
            .map_err(|e| TradeError::Rpc(format!("{:#}", e)))?;

        let amount = self.trade_amount(token, size_percent, side, &mint).await?;
        let (input, output) = match side {
            TradeSide::Buy => (SOL_MINT, token),
            TradeSide::Sell => (token, SOL_MINT),
        };

        let quote = self
            .dispatcher
            .dispatch(LimiterId::Aggregator, || {
                self.aggregator.get_quote(input, output, amount, slippage_bps)
            })
            .await
            .map_err(|e| TradeError::Quote(format!("{:#}", e)))?;

        if !quote.has_route() {
            return Err(TradeError::NoRoute {
                input: input.to_string(),
                output: output.to_string(),
            });
        }

        debug!("Quote price impact {:.4}%", quote.price_impact());
        let (token_amount, sol_amount) = fill_amounts(&quote, side, mint.decimals);

        if self.config.dry_run {
            info!("🧪 DRY RUN: would {} {:.6} tokens for {:.6} SOL", side, token_amount, sol_amount);
            return Ok(Fill {
                token_amount,
                sol_amount,
                signature: format!("dry-run-{}-{}", side, Utc::now().timestamp_millis()),
            });
        }

        let wallet = self.wallet();
        let swap = self
            .dispatcher
            .dispatch(LimiterId::Aggregator, || self.aggregator.get_swap_transaction(&quote, &wallet))
            .await
            .map_err(|e| TradeError::Build(format!("{:#}", e)))?;

        let signature = self
            .chain
            .sign_and_send(&swap.swap_transaction)
            .await
            .map_err(|e| TradeError::Submit(format!("{:#}", e)))?;

        debug!("📤 Submitted {}: {}", side, signature);

        match self
            .chain
            .confirm(&signature, self.config.confirmation_timeout)
            .await
            .map_err(|e| TradeError::Submit(format!("{:#}", e)))?
        {
            Confirmation::Confirmed => Ok(Fill {
                token_amount,
                sol_amount,
                signature,
            }),
            Confirmation::Failed(reason) => Err(TradeError::TransactionFailed { signature, reason }),
            Confirmation::TimedOut => Err(TradeError::ConfirmationTimeout(signature)),
        }
    }

    /// Input amount in subunits: lamports for a buy, token subunits for a sell
    async fn trade_amount(&self, token: &str, size_percent: f64, side: TradeSide, mint: &MintInfo) -> Result<u64, TradeError> {
        let fraction = size_percent / 100.0;

        match side {
            TradeSide::Buy => {
                let balance = self
                    .chain
                    .sol_balance()
                    .await
                    .map_err(|e| TradeError::Rpc(format!("{:#}", e)))?;
                let spendable = balance.saturating_sub(sol_to_lamports(self.config.fee_reserve_sol));
                let amount = (spendable as f64 * fraction).floor() as u64;
                if amount == 0 {
                    return Err(TradeError::InsufficientBalance(format!(
                        "{:.6} SOL held, {:.6} SOL reserved for fees",
                        lamports_to_sol(balance),
                        self.config.fee_reserve_sol
                    )));
                }
                Ok(amount)
            }
            TradeSide::Sell => {
                let raw = self
                    .chain
                    .token_balance(token)
                    .await
                    .map_err(|e| TradeError::Rpc(format!("{:#}", e)))?;
                let held = token_amount_to_ui(raw, mint.decimals);
                let amount = ui_to_token_amount(held * fraction, mint.decimals).min(raw);
                if amount == 0 {
                    return Err(TradeError::InsufficientBalance(format!(
                        "no {} held",
                        shorten_pubkey(token)
                    )));
                }
                Ok(amount)
            }
        }
    }

    async fn record(&self, token: &str, side: TradeSide, fill: &Fill) {
        let mut ledger = self.ledger.write().await;
        ledger.append(TransactionRecord {
            side,
            token: token.to_string(),
            token_amount: fill.token_amount,
            sol_amount: fill.sol_amount,
            timestamp: Utc::now(),
            signature: Some(fill.signature.clone()),
        });

        if side == TradeSide::Sell {
            match ledger.compute_pnl(token) {
                Some(report) => info!("💰 PnL for {}: {}", shorten_pubkey(token), report),
                None => warn!("No buy recorded for {}, PnL unavailable", shorten_pubkey(token)),
            }
        }
    }

    /// Moves SOL above the sweep reserve to the profit wallet. Failures are logged only.
    async fn sweep_profit(&self) {
        let Some(profit_wallet) = self.config.profit_wallet.as_deref() else {
            return;
        };
        if self.config.dry_run {
            debug!("Dry run, skipping profit sweep");
            return;
        }

        let balance = match self.chain.sol_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("Profit sweep skipped, balance lookup failed: {}", e);
                return;
            }
        };
        let surplus = balance.saturating_sub(sol_to_lamports(self.config.sweep_reserve_sol));
        if surplus == 0 {
            debug!("No surplus above {} SOL to sweep", self.config.sweep_reserve_sol);
            return;
        }

        match self.chain.transfer_sol(profit_wallet, surplus).await {
            Ok(signature) => info!(
                "🏦 Swept {:.6} SOL to {} ({})",
                lamports_to_sol(surplus),
                shorten_pubkey(profit_wallet),
                signature
            ),
            Err(e) => error!("Profit sweep to {} failed: {}", shorten_pubkey(profit_wallet), e),
        }
    }
}

/// (token amount, SOL amount) as decimals, from the quoted in/out amounts
fn fill_amounts(quote: &QuoteResponse, side: TradeSide, decimals: u8) -> (f64, f64) {
    match side {
        TradeSide::Buy => (
            token_amount_to_ui(quote.out_amount_u64(), decimals),
            lamports_to_sol(quote.in_amount_u64()),
        ),
        TradeSide::Sell => (
            token_amount_to_ui(quote.in_amount_u64(), decimals),
            lamports_to_sol(quote.out_amount_u64()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::fakes::{FakeAggregator, FakeChain};
    use std::sync::atomic::Ordering;

    fn engine(aggregator: Arc<FakeAggregator>, chain: Arc<FakeChain>, config: ExecutionConfig) -> TradeExecutionEngine {
        TradeExecutionEngine::new(aggregator, chain, Arc::new(RwLock::new(PnlLedger::new())), config)
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            retry_delay: Duration::from_millis(1),
            confirmation_timeout: Duration::from_millis(10),
            ..ExecutionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_quote_and_swap_wait_on_aggregator_budget() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 500_000_000));
        let chain = Arc::new(FakeChain::new(2_010_000_000, 0));
        let engine = engine(aggregator, chain, fast_config()).with_dispatcher(RateLimitedDispatcher::new(10, 10, 1));

        let start = std::time::Instant::now();
        let outcome = engine.trade("Tx", 50.0, TradeSide::Buy, 500).await;
        assert!(outcome.success);
        // Quote takes the only slot, the swap build waits ~1s for the next
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_buy_sizes_from_balance_and_records_fill() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 500_000_000));
        let chain = Arc::new(FakeChain::new(2_010_000_000, 0));
        let engine = engine(aggregator.clone(), chain.clone(), fast_config());

        let outcome = engine.trade("Tx", 50.0, TradeSide::Buy, 500).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);

        // (2.01 - 0.01 reserve) * 50%
        let quoted = aggregator.quoted.lock().unwrap();
        assert_eq!(quoted[0], (SOL_MINT.to_string(), "Tx".to_string(), 1_000_000_000));

        let ledger = engine.ledger();
        let ledger = ledger.read().await;
        let records = ledger.records("Tx");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].side, TradeSide::Buy);
        assert_eq!(records[0].sol_amount, 1.0);
        assert_eq!(records[0].token_amount, 500.0);
    }

    #[tokio::test]
    async fn test_three_failures_return_failure_without_record() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 500_000_000));
        aggregator.fail_quotes.store(u32::MAX, Ordering::SeqCst);
        let chain = Arc::new(FakeChain::new(5_000_000_000, 0));
        let engine = engine(aggregator.clone(), chain, fast_config());

        let outcome = engine.trade("Tx", 90.0, TradeSide::Buy, 500).await;
        assert!(!outcome.success);
        assert!(outcome.signature.is_none());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(aggregator.quoted.lock().unwrap().len(), 3);
        assert_eq!(engine.ledger().read().await.record_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 500_000_000));
        let chain = Arc::new(FakeChain::new(5_000_000_000, 0));
        chain.fail_sends.store(1, Ordering::SeqCst);
        let engine = engine(aggregator, chain.clone(), fast_config());

        let outcome = engine.trade("Tx", 90.0, TradeSide::Buy, 500).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(chain.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_route_is_not_retried() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 0));
        let chain = Arc::new(FakeChain::new(5_000_000_000, 0));
        let engine = engine(aggregator.clone(), chain, fast_config());

        let outcome = engine.trade("Tx", 90.0, TradeSide::Buy, 500).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(aggregator.quoted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_not_retried() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 500_000_000));
        let chain = Arc::new(FakeChain::new(5_000_000, 0));
        let engine = engine(aggregator.clone(), chain, fast_config());

        let outcome = engine.trade("Tx", 90.0, TradeSide::Buy, 500).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(aggregator.quoted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_timeout_is_a_failed_attempt() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 500_000_000));
        let chain = Arc::new(FakeChain::new(5_000_000_000, 0));
        *chain.confirmation.lock().unwrap() = Confirmation::TimedOut;
        let engine = engine(aggregator, chain.clone(), fast_config());

        let outcome = engine.trade("Tx", 90.0, TradeSide::Buy, 500).await;
        assert!(!outcome.success);
        assert_eq!(chain.sent.lock().unwrap().len(), 3);
        assert_eq!(engine.ledger().read().await.record_count(), 0);
    }

    #[tokio::test]
    async fn test_sell_converts_holding_and_sweeps_surplus() {
        // 1234.5 tokens at 6 decimals, quote returns 1.2 SOL
        let aggregator = Arc::new(FakeAggregator::new(1_234_500_000, 1_200_000_000));
        let chain = Arc::new(FakeChain::new(3_500_000_000, 1_234_500_000));
        let config = ExecutionConfig {
            profit_wallet: Some("Profit111".to_string()),
            ..fast_config()
        };
        let engine = engine(aggregator.clone(), chain.clone(), config);
        engine.ledger().write().await.record_fill(TradeSide::Buy, "Tx", 1234.5, 1.0);

        let outcome = engine.trade("Tx", 100.0, TradeSide::Sell, 500).await;
        assert!(outcome.success);

        let quoted = aggregator.quoted.lock().unwrap();
        assert_eq!(quoted[0], ("Tx".to_string(), SOL_MINT.to_string(), 1_234_500_000));

        let report = engine.ledger().read().await.compute_pnl("Tx").unwrap();
        assert!((report.pnl - 0.2).abs() < 1e-9);

        // 3.5 SOL held, 1.0 SOL reserve kept
        let transfers = chain.transfers.lock().unwrap();
        assert_eq!(transfers.as_slice(), &[("Profit111".to_string(), 2_500_000_000)]);
    }

    #[tokio::test]
    async fn test_dry_run_records_without_submitting() {
        let aggregator = Arc::new(FakeAggregator::new(1_000_000_000, 500_000_000));
        let chain = Arc::new(FakeChain::new(5_000_000_000, 0));
        let config = ExecutionConfig {
            dry_run: true,
            ..fast_config()
        };
        let engine = engine(aggregator, chain.clone(), config);

        let outcome = engine.trade("Tx", 90.0, TradeSide::Buy, 500).await;
        assert!(outcome.success);
        assert!(outcome.signature.unwrap().starts_with("dry-run-buy"));
        assert!(chain.sent.lock().unwrap().is_empty());
        assert_eq!(engine.ledger().read().await.record_count(), 1);
    }

    #[test]
    fn test_retryability() {
        assert!(!TradeError::NoRoute { input: "a".into(), output: "b".into() }.is_retryable());
        assert!(!TradeError::InsufficientBalance("x".into()).is_retryable());
        assert!(TradeError::ConfirmationTimeout("sig".into()).is_retryable());
        assert!(TradeError::Quote("503".into()).is_retryable());
    }
}
