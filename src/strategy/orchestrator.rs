use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use super::cycle::{CyclePhase, PendingBuy};
use super::state_machine::{Directive, PatternStateMachine};
use crate::config::Execution;
use crate::core::types::CanonicalTransfer;
use crate::core::utils::shorten_pubkey;
use crate::ingest::websocket::SubscriptionCommand;
use crate::trading::execution_engine::{TradeExecutionEngine, TradeOutcome};
use crate::trading::ledger::TradeSide;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the orchestrator reacts to
#[derive(Debug)]
pub enum EngineEvent {
    /// Canonical transfers from one notification
    Transfers(Vec<CanonicalTransfer>),
    /// Jitter delay for the scheduled buy elapsed
    BuyDue { token: String },
    TradeCompleted {
        token: String,
        side: TradeSide,
        outcome: TradeOutcome,
    },
}

/// Sizing and slippage applied to every trade the cycle triggers
#[derive(Debug, Clone)]
pub struct TradePlan {
    pub buy_size_percent: f64,
    pub sell_size_percent: f64,
    pub slippage_bps: u16,
}

impl From<&Execution> for TradePlan {
    fn from(execution: &Execution) -> Self {
        Self {
            buy_size_percent: execution.buy_size_percent,
            sell_size_percent: execution.sell_size_percent,
            slippage_bps: execution.slippage_bps,
        }
    }
}

/// Owns the cycle state; every mutation happens on the task running `run`
pub struct Orchestrator {
    machine: PatternStateMachine,
    engine: Arc<TradeExecutionEngine>,
    plan: TradePlan,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    watch_commands: Option<mpsc::UnboundedSender<SubscriptionCommand>>,
    pending_buy: Option<PendingBuy>,
}

impl Orchestrator {
    pub fn new(machine: PatternStateMachine, engine: Arc<TradeExecutionEngine>, plan: TradePlan) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            machine,
            engine,
            plan,
            events_tx,
            events_rx,
            watch_commands: None,
            pending_buy: None,
        }
    }

    /// Discovered wallets are forwarded here for subscription
    pub fn with_watch_commands(mut self, commands: mpsc::UnboundedSender<SubscriptionCommand>) -> Self {
        self.watch_commands = Some(commands);
        self
    }

    pub fn sender(&self) -> mpsc::Sender<EngineEvent> {
        self.events_tx.clone()
    }

    pub fn machine(&self) -> &PatternStateMachine {
        &self.machine
    }

    pub fn pending_buy(&self) -> Option<&PendingBuy> {
        self.pending_buy.as_ref()
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("🧠 Orchestrator started, watching {} wallets", self.machine.watched().len());
        for (role, address) in self.machine.watched().iter() {
            info!("   • {}: {}", role, address);
        }

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    info!("🛑 Orchestrator shutting down in {}", self.machine.phase());
                    break;
                }
            }
        }

        if let Some(pending) = self.pending_buy.take() {
            pending.cancel();
        }
        Ok(())
    }

    /// Waits for the next event and handles it; false once every sender is gone
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle(event).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Transfers(batch) => {
                let directives = self.machine.on_batch(&batch).await;
                for directive in directives {
                    self.apply(directive);
                }
            }
            EngineEvent::BuyDue { token } => self.on_buy_due(token),
            EngineEvent::TradeCompleted { token, side, outcome } => self.on_trade_completed(token, side, outcome),
        }
    }

    fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::ScheduleBuy { token, delay } => self.schedule_buy(token, delay),
            Directive::ExecuteSell { token } => {
                info!("💸 Selling {}", shorten_pubkey(&token));
                self.spawn_trade(token, TradeSide::Sell);
            }
            Directive::Aborted { token, .. } => self.clear_pending_buy(&token),
            Directive::WalletDiscovered { role, address } => {
                if let Some(commands) = &self.watch_commands {
                    if commands.send(SubscriptionCommand::Watch { name: role, address }).is_err() {
                        warn!("Subscription manager gone, discovered wallet not watched");
                    }
                }
            }
        }
    }

    fn schedule_buy(&mut self, token: String, delay: Duration) {
        if let Some(pending) = &self.pending_buy {
            warn!("Buy for {} already pending, ignoring new schedule", shorten_pubkey(&pending.token));
            return;
        }

        let events = self.events_tx.clone();
        let due_token = token.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            if events.send(EngineEvent::BuyDue { token: due_token }).await.is_err() {
                debug!("Orchestrator gone before buy was due");
            }
        });

        info!("⏳ Buy of {} scheduled in {:?}", shorten_pubkey(&token), delay);
        self.pending_buy = Some(PendingBuy::new(token, timer));
    }

    fn on_buy_due(&mut self, token: String) {
        let state = self.machine.state();
        if !state.is_candidate(&token) || state.phase() != CyclePhase::BuyPending {
            warn!(
                "Stale buy for {} dropped (cycle now {} on {:?})",
                shorten_pubkey(&token),
                state.phase(),
                state.candidate().map(shorten_pubkey)
            );
            self.clear_pending_buy(&token);
            return;
        }

        if let Some(pending) = self.pending_buy.as_mut() {
            pending.fired();
        }
        info!("🛒 Buying {}", shorten_pubkey(&token));
        self.spawn_trade(token, TradeSide::Buy);
    }

    fn on_trade_completed(&mut self, token: String, side: TradeSide, outcome: TradeOutcome) {
        match side {
            TradeSide::Buy => {
                if let Some(mut pending) = self.pending_buy.take() {
                    pending.retry_count = outcome.attempts.saturating_sub(1);
                    debug!("Buy for {} finished after {} retries", shorten_pubkey(&pending.token), pending.retry_count);
                }
                if outcome.success {
                    self.machine.on_buy_confirmed(&token);
                } else {
                    let reason = format!(
                        "buy failed after {} attempts: {}",
                        outcome.attempts,
                        outcome.error.unwrap_or_default()
                    );
                    self.abort_if_awaiting(&token, CyclePhase::BuyPending, &reason);
                }
            }
            TradeSide::Sell => {
                if outcome.success {
                    self.machine.on_sell_confirmed(&token);
                } else {
                    let reason = format!(
                        "sell failed after {} attempts: {}",
                        outcome.attempts,
                        outcome.error.unwrap_or_default()
                    );
                    self.abort_if_awaiting(&token, CyclePhase::SellPending, &reason);
                }
            }
        }
    }

    /// A failure reported after the cycle already moved on (own swap seen on chain) is only logged
    fn abort_if_awaiting(&mut self, token: &str, awaiting: CyclePhase, reason: &str) {
        let phase = self.machine.phase();
        if phase == awaiting && self.machine.state().is_candidate(token) {
            self.machine.abort(token, reason);
        } else {
            warn!(
                "Late failure for {} ignored, cycle already in {}: {}",
                shorten_pubkey(token),
                phase,
                reason
            );
        }
    }

    fn clear_pending_buy(&mut self, token: &str) {
        if self.pending_buy.as_ref().map(|p| p.token == token).unwrap_or(false) {
            if let Some(pending) = self.pending_buy.take() {
                pending.cancel();
            }
        }
    }

    /// Runs the trade on its own task and reports back as `TradeCompleted`
    fn spawn_trade(&self, token: String, side: TradeSide) {
        let engine = self.engine.clone();
        let events = self.events_tx.clone();
        let size_percent = match side {
            TradeSide::Buy => self.plan.buy_size_percent,
            TradeSide::Sell => self.plan.sell_size_percent,
        };
        let slippage_bps = self.plan.slippage_bps;

        tokio::spawn(async move {
            let trade_token = token.clone();
            let trade = tokio::spawn(async move {
                engine.trade(&trade_token, size_percent, side, slippage_bps).await
            });
            let outcome = match trade.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("{} task for {} panicked: {}", side, shorten_pubkey(&token), e);
                    TradeOutcome::failed(0, e.to_string())
                }
            };
            if events
                .send(EngineEvent::TradeCompleted { token, side, outcome })
                .await
                .is_err()
            {
                debug!("Orchestrator gone before {} completed", side);
            }
        });
    }
}
