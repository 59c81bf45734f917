//! Seed → handoff → buy → hold → sell detection over canonical transfers

use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use super::cycle::{CyclePhase, CycleState};
use crate::config::Detection;
use crate::core::types::{Asset, CanonicalTransfer, SwapLeg, TransferEvent, WatchedAddressSet, ROLE_DISTRIB, ROLE_SELLER};
use crate::core::utils::shorten_pubkey;
use crate::trading::token_info::TokenInfoSource;

/// What the orchestrator must do after a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Buy `token` after `delay`
    ScheduleBuy { token: String, delay: Duration },
    /// Sell the whole `token` position now
    ExecuteSell { token: String },
    /// The cycle for `token` was dropped
    Aborted { token: String, reason: String },
    /// A new wallet joined the watched set
    WalletDiscovered { role: String, address: String },
}

pub struct PatternStateMachine {
    state: CycleState,
    watched: WatchedAddressSet,
    detection: Detection,
    token_info: Arc<dyn TokenInfoSource>,
    /// Bot's own wallet; its swaps of the candidate confirm trades
    trader: Option<String>,
}

impl PatternStateMachine {
    pub fn new(detection: Detection, watched: WatchedAddressSet, token_info: Arc<dyn TokenInfoSource>) -> Self {
        Self {
            state: CycleState::default(),
            watched,
            detection,
            token_info,
            trader: None,
        }
    }

    pub fn with_trader(mut self, trader: impl Into<String>) -> Self {
        self.trader = Some(trader.into());
        self
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn phase(&self) -> CyclePhase {
        self.state.phase()
    }

    pub fn watched(&self) -> &WatchedAddressSet {
        &self.watched
    }

    /// Feeds one notification's transfers, in order
    pub async fn on_batch(&mut self, batch: &[CanonicalTransfer]) -> Vec<Directive> {
        let mut directives = Vec::new();

        for transfer in batch {
            self.log_attribution(transfer);

            if let Some(discovered) = self.discover(transfer) {
                directives.push(discovered);
            }

            match self.state.phase() {
                CyclePhase::Idle => {
                    if let Some(token) = self.match_seed(transfer, batch) {
                        directives.extend(self.begin_cycle(token).await);
                    }
                }
                CyclePhase::SeedDetected => {
                    if self.is_handoff(transfer, ROLE_SELLER, ROLE_DISTRIB) {
                        self.state.seller_handoff_observed = true;
                        info!("🔁 SELLER handed {} to DISTRIB", self.candidate_label());
                    } else {
                        self.ignore_repeat_seed(transfer, batch);
                    }
                }
                CyclePhase::AwaitingDistribution => {
                    if self.is_handoff(transfer, ROLE_DISTRIB, ROLE_SELLER) && !self.state.distributing_in_progress {
                        self.state.distributing_in_progress = true;
                        let delay = self.buy_delay();
                        info!(
                            "🎯 DISTRIB returned {} to SELLER, buying in {:?}",
                            self.candidate_label(),
                            delay
                        );
                        if let Some(token) = self.state.candidate_token.clone() {
                            directives.push(Directive::ScheduleBuy { token, delay });
                        }
                    }
                }
                CyclePhase::BuyPending => {
                    if self.is_own_swap(transfer, SwapLeg::Output) {
                        if let Some(token) = self.state.candidate_token.clone() {
                            self.on_buy_confirmed(&token);
                        }
                    } else if self.is_handoff(transfer, ROLE_DISTRIB, ROLE_SELLER) {
                        debug!("Buy already scheduled for {}, ignoring repeat handoff", self.candidate_label());
                    }
                }
                CyclePhase::HoldingPosition => {
                    if self.is_received_by_seller(transfer) {
                        self.state.received_count += 1;
                        info!(
                            "📦 SELLER received {} ({}/{})",
                            self.candidate_label(),
                            self.state.received_count,
                            self.detection.sell_after_received
                        );
                        if self.state.received_count >= self.detection.sell_after_received {
                            self.state.sell_requested = true;
                            if let Some(token) = self.state.candidate_token.clone() {
                                directives.push(Directive::ExecuteSell { token });
                            }
                        }
                    }
                }
                CyclePhase::SellPending => {
                    if self.is_own_swap(transfer, SwapLeg::Input) {
                        if let Some(token) = self.state.candidate_token.clone() {
                            self.on_sell_confirmed(&token);
                        }
                    }
                }
            }
            debug_assert!(self.state.is_consistent(), "cycle flags set without a candidate: {:?}", self.state);
        }

        directives
    }

    /// Marks the buy as filled. Returns false when it does not apply to the current cycle.
    pub fn on_buy_confirmed(&mut self, token: &str) -> bool {
        if self.state.phase() != CyclePhase::BuyPending || !self.state.is_candidate(token) {
            return false;
        }
        self.state.bought_confirmed = true;
        info!("✅ Holding {}", shorten_pubkey(token));
        true
    }

    /// Marks the sell as filled and closes the cycle
    pub fn on_sell_confirmed(&mut self, token: &str) -> bool {
        if self.state.phase() != CyclePhase::SellPending || !self.state.is_candidate(token) {
            return false;
        }
        self.state.sold_confirmed = true;
        info!("🏁 Cycle for {} complete", shorten_pubkey(token));
        self.state.reset();
        true
    }

    /// Drops the cycle for `token`; a stale token is ignored
    pub fn abort(&mut self, token: &str, reason: &str) -> bool {
        if !self.state.is_candidate(token) {
            return false;
        }
        error!("🛑 Aborting cycle for {} in {}: {}", shorten_pubkey(token), self.state.phase(), reason);
        self.state.reset();
        true
    }

    async fn begin_cycle(&mut self, token: String) -> Option<Directive> {
        info!("🌱 Seed swap detected for {}", shorten_pubkey(&token));
        self.state.candidate_token = Some(token.clone());

        let reason = match self.token_info.token_info(&token).await {
            Ok(info) if info.freezable => "token has a freeze authority".to_string(),
            Ok(info) => {
                match info.price_sol {
                    Some(price) => info!("🔍 {} not freezable, price {:.9} SOL", shorten_pubkey(&token), price),
                    None => info!("🔍 {} not freezable, no price yet", shorten_pubkey(&token)),
                }
                return None;
            }
            Err(e) => format!("token info lookup failed: {:#}", e),
        };

        warn!("⚠️ Rejecting {}: {}", shorten_pubkey(&token), reason);
        self.state.reset();
        Some(Directive::Aborted { token, reason })
    }

    /// Native input from SELLER within the seed band, with a token output leg in the same transaction
    fn match_seed(&self, transfer: &CanonicalTransfer, batch: &[CanonicalTransfer]) -> Option<String> {
        let TransferEvent::Swap { leg: SwapLeg::Input, account, asset: Asset::Native, amount } = &transfer.event else {
            return None;
        };
        if !self.watched.is(ROLE_SELLER, account) {
            return None;
        }
        if (amount - self.detection.seed_target_sol).abs() > self.detection.seed_tolerance_sol {
            debug!("SELLER swap of {:.3} SOL outside the seed band", amount);
            return None;
        }

        batch.iter().find_map(|other| match &other.event {
            TransferEvent::Swap { leg: SwapLeg::Output, asset: Asset::Token(mint), .. }
                if other.signature == transfer.signature =>
            {
                Some(mint.clone())
            }
            _ => None,
        })
    }

    fn ignore_repeat_seed(&self, transfer: &CanonicalTransfer, batch: &[CanonicalTransfer]) {
        if let Some(token) = self.match_seed(transfer, batch) {
            if self.state.is_candidate(&token) {
                debug!("Repeat seed for {}, already tracking", shorten_pubkey(&token));
            } else {
                debug!("Seed for {} ignored while another cycle is active", shorten_pubkey(&token));
            }
        }
    }

    fn is_handoff(&self, transfer: &CanonicalTransfer, from_role: &str, to_role: &str) -> bool {
        match &transfer.event {
            TransferEvent::Transfer { from, to, asset, .. } => {
                self.is_candidate_asset(asset) && self.watched.is(from_role, from) && self.watched.is(to_role, to)
            }
            _ => false,
        }
    }

    fn is_received_by_seller(&self, transfer: &CanonicalTransfer) -> bool {
        match &transfer.event {
            TransferEvent::Transfer { to, asset, .. } => {
                self.is_candidate_asset(asset) && self.watched.is(ROLE_SELLER, to)
            }
            _ => false,
        }
    }

    /// A swap by the bot's wallet moving the candidate token on `leg`
    fn is_own_swap(&self, transfer: &CanonicalTransfer, leg: SwapLeg) -> bool {
        let Some(trader) = self.trader.as_deref() else {
            return false;
        };
        match &transfer.event {
            TransferEvent::Swap { leg: l, account, asset, .. } => {
                *l == leg && account == trader && self.is_candidate_asset(asset)
            }
            _ => false,
        }
    }

    fn is_candidate_asset(&self, asset: &Asset) -> bool {
        self.state.candidate().map(|c| asset.is_token(c)).unwrap_or(false)
    }

    /// Native transfer of the discovery amount to an unknown wallet adds it to the watched set
    fn discover(&mut self, transfer: &CanonicalTransfer) -> Option<Directive> {
        let target = self.detection.discovery_amount_sol?;
        let TransferEvent::Transfer { to, asset: Asset::Native, amount, .. } = &transfer.event else {
            return None;
        };
        if (amount - target).abs() > 1e-9 || to.is_empty() || self.watched.contains_address(to) {
            return None;
        }

        let role = self.watched.next_discovered_role();
        if !self.watched.insert(role.clone(), to.clone()) {
            warn!("Role {} already configured, {} not watched", role, shorten_pubkey(to));
            return None;
        }
        info!("🆕 Discovered wallet {} ({}) via {:.1} SOL transfer", role, shorten_pubkey(to), amount);
        Some(Directive::WalletDiscovered {
            role,
            address: to.clone(),
        })
    }

    fn log_attribution(&self, transfer: &CanonicalTransfer) {
        let (from, to) = transfer.parties();
        let role = from
            .and_then(|a| self.watched.role_of(a))
            .or_else(|| to.and_then(|a| self.watched.role_of(a)));
        match role {
            Some(role) => debug!("[{}] {}", role, transfer),
            None => debug!("[-] {}", transfer),
        }
    }

    fn buy_delay(&self) -> Duration {
        let min = self.detection.buy_jitter_min_secs;
        let max = self.detection.buy_jitter_max_secs.max(min);
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }

    fn candidate_label(&self) -> String {
        self.state.candidate().map(shorten_pubkey).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::normalizer::normalize_record;
    use crate::ingest::provider::EnhancedTransaction;
    use crate::trading::fakes::FakeTokenInfo;
    use chrono::Utc;

    const BOT: &str = "Bot1111";

    fn machine(token_info: FakeTokenInfo) -> PatternStateMachine {
        let watched = WatchedAddressSet::from_roles([(ROLE_SELLER, "SELLER"), (ROLE_DISTRIB, "DISTRIB")]);
        PatternStateMachine::new(Detection::default(), watched, Arc::new(token_info)).with_trader(BOT)
    }

    fn seed_batch(amount_lamports: u64, token: &str) -> Vec<CanonicalTransfer> {
        let record: EnhancedTransaction = serde_json::from_value(serde_json::json!({
            "signature": "seed-sig",
            "type": "SWAP",
            "events": {"swap": {
                "nativeInput": {"account": "SELLER", "amount": amount_lamports},
                "tokenOutputs": [{"mint": token}]
            }}
        }))
        .unwrap();
        normalize_record(&record)
    }

    fn transfer(from: &str, to: &str, asset: Asset) -> Vec<CanonicalTransfer> {
        vec![CanonicalTransfer {
            signature: format!("{}-{}", from, to),
            timestamp: Utc::now(),
            event: TransferEvent::Transfer {
                from: from.to_string(),
                to: to.to_string(),
                asset,
                amount: 1000.0,
            },
        }]
    }

    fn tx(token: &str) -> Asset {
        Asset::Token(token.to_string())
    }

    fn own_swap(leg: SwapLeg, token: &str) -> Vec<CanonicalTransfer> {
        vec![CanonicalTransfer {
            signature: "own".to_string(),
            timestamp: Utc::now(),
            event: TransferEvent::Swap {
                leg,
                account: BOT.to_string(),
                asset: tx(token),
                amount: 10.0,
            },
        }]
    }

    async fn hold(sm: &mut PatternStateMachine) {
        sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        sm.on_batch(&transfer("SELLER", "DISTRIB", tx("Tx"))).await;
        sm.on_batch(&transfer("DISTRIB", "SELLER", tx("Tx"))).await;
        assert!(sm.on_buy_confirmed("Tx"));
    }

    #[tokio::test]
    async fn test_seed_swap_detected() {
        let mut sm = machine(FakeTokenInfo::default());
        let directives = sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        assert!(directives.is_empty());
        assert_eq!(sm.phase(), CyclePhase::SeedDetected);
        assert_eq!(sm.state().candidate(), Some("Tx"));
    }

    #[tokio::test]
    async fn test_seed_band_edges() {
        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(149_500_000_000, "Tx")).await;
        assert_eq!(sm.phase(), CyclePhase::SeedDetected);

        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(149_000_000_000, "Tx")).await;
        assert_eq!(sm.phase(), CyclePhase::Idle);

        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(151_000_000_000, "Tx")).await;
        assert_eq!(sm.phase(), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_freezable_token_returns_to_idle() {
        let mut sm = machine(FakeTokenInfo::freezable(&["Tx"]));
        let directives = sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;

        assert_eq!(sm.state(), &CycleState::default());
        assert!(matches!(&directives[..], [Directive::Aborted { token, .. }] if token == "Tx"));
    }

    #[tokio::test]
    async fn test_token_info_failure_aborts() {
        let mut sm = machine(FakeTokenInfo {
            unavailable: true,
            ..Default::default()
        });
        let directives = sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        assert!(sm.state().is_idle());
        assert_eq!(directives.len(), 1);
    }

    #[tokio::test]
    async fn test_handoff_schedules_exactly_one_buy() {
        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        assert!(sm.on_batch(&transfer("SELLER", "DISTRIB", tx("Tx"))).await.is_empty());
        assert_eq!(sm.phase(), CyclePhase::AwaitingDistribution);

        let directives = sm.on_batch(&transfer("DISTRIB", "SELLER", tx("Tx"))).await;
        assert_eq!(directives.len(), 1);
        match &directives[0] {
            Directive::ScheduleBuy { token, delay } => {
                assert_eq!(token, "Tx");
                assert!(*delay >= Duration::from_secs(30) && *delay <= Duration::from_secs(50));
            }
            other => panic!("unexpected directive {:?}", other),
        }
        assert!(sm.state().distributing_in_progress);

        let repeat = sm.on_batch(&transfer("DISTRIB", "SELLER", tx("Tx"))).await;
        assert!(repeat.is_empty());
        assert_eq!(sm.phase(), CyclePhase::BuyPending);
    }

    #[tokio::test]
    async fn test_mismatched_events_leave_state_unchanged() {
        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        let before = sm.state().clone();

        sm.on_batch(&transfer("SELLER", "DISTRIB", tx("Other"))).await;
        sm.on_batch(&transfer("DISTRIB", "SELLER", tx("Tx"))).await;
        sm.on_batch(&transfer("SELLER", "Stranger", tx("Tx"))).await;
        sm.on_batch(&transfer("SELLER", "DISTRIB", Asset::Native)).await;
        assert_eq!(sm.state(), &before);
    }

    #[tokio::test]
    async fn test_repeat_seed_is_noop() {
        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        sm.on_batch(&transfer("SELLER", "DISTRIB", tx("Tx"))).await;
        let before = sm.state().clone();

        let directives = sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        assert!(directives.is_empty());
        assert_eq!(sm.state(), &before);
    }

    #[tokio::test]
    async fn test_two_receipts_trigger_one_sell_then_reset() {
        let mut sm = machine(FakeTokenInfo::default());
        hold(&mut sm).await;
        assert_eq!(sm.phase(), CyclePhase::HoldingPosition);

        assert!(sm.on_batch(&transfer("Anyone", "SELLER", tx("Tx"))).await.is_empty());
        let directives = sm.on_batch(&transfer("DISTRIB", "SELLER", tx("Tx"))).await;
        assert_eq!(directives, vec![Directive::ExecuteSell { token: "Tx".to_string() }]);
        assert_eq!(sm.phase(), CyclePhase::SellPending);

        assert!(sm.on_batch(&transfer("Anyone", "SELLER", tx("Tx"))).await.is_empty());

        assert!(sm.on_sell_confirmed("Tx"));
        assert_eq!(sm.state(), &CycleState::default());
        assert!(!sm.on_sell_confirmed("Tx"));
    }

    #[tokio::test]
    async fn test_own_swaps_confirm_trades() {
        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        sm.on_batch(&transfer("SELLER", "DISTRIB", tx("Tx"))).await;
        sm.on_batch(&transfer("DISTRIB", "SELLER", tx("Tx"))).await;

        sm.on_batch(&own_swap(SwapLeg::Output, "Tx")).await;
        assert_eq!(sm.phase(), CyclePhase::HoldingPosition);
        assert!(!sm.on_buy_confirmed("Tx"));

        sm.on_batch(&transfer("X", "SELLER", tx("Tx"))).await;
        sm.on_batch(&transfer("Y", "SELLER", tx("Tx"))).await;
        sm.on_batch(&own_swap(SwapLeg::Input, "Tx")).await;
        assert!(sm.state().is_idle());
    }

    #[tokio::test]
    async fn test_abort_ignores_stale_token() {
        let mut sm = machine(FakeTokenInfo::default());
        sm.on_batch(&seed_batch(150_000_000_000, "Tx")).await;
        assert!(!sm.abort("Old", "late failure"));
        assert_eq!(sm.state().candidate(), Some("Tx"));
        assert!(sm.abort("Tx", "buy failed"));
        assert!(sm.state().is_idle());
    }

    #[tokio::test]
    async fn test_discovery_of_new_wallet() {
        let mut sm = machine(FakeTokenInfo::default());
        let batch = vec![CanonicalTransfer {
            signature: "d".to_string(),
            timestamp: Utc::now(),
            event: TransferEvent::Transfer {
                from: "SELLER".to_string(),
                to: "Fresh".to_string(),
                asset: Asset::Native,
                amount: 105.0,
            },
        }];

        let directives = sm.on_batch(&batch).await;
        assert_eq!(
            directives,
            vec![Directive::WalletDiscovered {
                role: "Wallet_3".to_string(),
                address: "Fresh".to_string()
            }]
        );
        assert!(sm.watched().contains_address("Fresh"));
        assert!(sm.on_batch(&batch).await.is_empty());
        assert!(sm.state().is_idle());
    }

    #[tokio::test]
    async fn test_discovery_skips_taken_role_name() {
        // Three roles, so the generated name would be Wallet_4
        let watched = WatchedAddressSet::from_roles([
            (ROLE_SELLER, "SELLER"),
            (ROLE_DISTRIB, "DISTRIB"),
            ("Wallet_4", "Configured"),
        ]);
        let mut sm = PatternStateMachine::new(Detection::default(), watched, Arc::new(FakeTokenInfo::default()));
        let batch = vec![CanonicalTransfer {
            signature: "d".to_string(),
            timestamp: Utc::now(),
            event: TransferEvent::Transfer {
                from: "SELLER".to_string(),
                to: "Fresh".to_string(),
                asset: Asset::Native,
                amount: 105.0,
            },
        }];

        assert!(sm.on_batch(&batch).await.is_empty());
        assert!(!sm.watched().contains_address("Fresh"));
        assert!(sm.watched().is("Wallet_4", "Configured"));
    }
}
