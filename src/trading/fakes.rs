//! In-memory aggregator and chain used by the trading and strategy tests

use anyhow::{bail, Result};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::time::Duration;

use super::chain::{ChainClient, Confirmation, MintInfo};
use super::jupiter_client::{QuoteResponse, RoutePlanItem, SwapAggregator, SwapInfo, SwapResponse};
use super::token_info::{TokenInfo, TokenInfoSource};

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Quotes fixed in/out amounts; `out_amount == 0` yields a routeless quote
pub struct FakeAggregator {
    in_amount: u64,
    out_amount: u64,
    pub fail_quotes: AtomicU32,
    /// (input, output, amount) per quote request, failed ones included
    pub quoted: Mutex<Vec<(String, String, u64)>>,
}

impl FakeAggregator {
    pub fn new(in_amount: u64, out_amount: u64) -> Self {
        Self {
            in_amount,
            out_amount,
            fail_quotes: AtomicU32::new(0),
            quoted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SwapAggregator for FakeAggregator {
    async fn get_quote(&self, input_mint: &str, output_mint: &str, amount: u64, slippage_bps: u16) -> Result<QuoteResponse> {
        self.quoted
            .lock()
            .unwrap()
            .push((input_mint.to_string(), output_mint.to_string(), amount));
        if take_failure(&self.fail_quotes) {
            bail!("quote service unavailable");
        }

        let route_plan = if self.out_amount == 0 {
            Vec::new()
        } else {
            vec![RoutePlanItem {
                swap_info: SwapInfo {
                    amm_key: "Amm1".to_string(),
                    label: Some("Fake".to_string()),
                    input_mint: input_mint.to_string(),
                    output_mint: output_mint.to_string(),
                    in_amount: self.in_amount.to_string(),
                    out_amount: self.out_amount.to_string(),
                    extra: Default::default(),
                },
                percent: 100,
            }]
        };

        Ok(QuoteResponse {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount: self.in_amount.to_string(),
            out_amount: self.out_amount.to_string(),
            slippage_bps,
            price_impact_pct: "0".to_string(),
            route_plan,
            extra: Default::default(),
        })
    }

    async fn get_swap_transaction(&self, _quote: &QuoteResponse, _user_public_key: &str) -> Result<SwapResponse> {
        Ok(SwapResponse {
            swap_transaction: "AQID".to_string(),
            last_valid_block_height: 0,
            simulation_error: None,
        })
    }
}

pub struct FakeChain {
    owner: Pubkey,
    sol_lamports: u64,
    token_raw: u64,
    pub decimals: u8,
    pub freezable_mints: Mutex<HashSet<String>>,
    pub fail_sends: AtomicU32,
    pub confirmation: Mutex<Confirmation>,
    pub sent: Mutex<Vec<String>>,
    pub transfers: Mutex<Vec<(String, u64)>>,
}

impl FakeChain {
    pub fn new(sol_lamports: u64, token_raw: u64) -> Self {
        Self {
            owner: Pubkey::new_unique(),
            sol_lamports,
            token_raw,
            decimals: 6,
            freezable_mints: Mutex::new(HashSet::new()),
            fail_sends: AtomicU32::new(0),
            confirmation: Mutex::new(Confirmation::Confirmed),
            sent: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn owner(&self) -> Pubkey {
        self.owner
    }

    async fn sol_balance(&self) -> Result<u64> {
        Ok(self.sol_lamports)
    }

    async fn token_balance(&self, _mint: &str) -> Result<u64> {
        Ok(self.token_raw)
    }

    async fn mint_info(&self, mint: &str) -> Result<MintInfo> {
        Ok(MintInfo {
            decimals: self.decimals,
            freezable: self.freezable_mints.lock().unwrap().contains(mint),
        })
    }

    async fn sign_and_send(&self, _serialized_tx: &str) -> Result<String> {
        if take_failure(&self.fail_sends) {
            bail!("blockhash not found");
        }
        let mut sent = self.sent.lock().unwrap();
        let signature = format!("sig{}", sent.len() + 1);
        sent.push(signature.clone());
        Ok(signature)
    }

    async fn confirm(&self, _signature: &str, _timeout: Duration) -> Result<Confirmation> {
        Ok(self.confirmation.lock().unwrap().clone())
    }

    async fn transfer_sol(&self, to: &str, lamports: u64) -> Result<String> {
        self.transfers.lock().unwrap().push((to.to_string(), lamports));
        Ok("sweep1".to_string())
    }
}

/// Token info with a fixed set of freezable mints; `unavailable` makes every lookup fail
#[derive(Default)]
pub struct FakeTokenInfo {
    pub freezable: HashSet<String>,
    pub unavailable: bool,
}

impl FakeTokenInfo {
    pub fn freezable(mints: &[&str]) -> Self {
        Self {
            freezable: mints.iter().map(|m| m.to_string()).collect(),
            unavailable: false,
        }
    }
}

#[async_trait]
impl TokenInfoSource for FakeTokenInfo {
    async fn token_info(&self, mint: &str) -> Result<TokenInfo> {
        if self.unavailable {
            bail!("mint account not found");
        }
        Ok(TokenInfo {
            mint: mint.to_string(),
            decimals: 6,
            freezable: self.freezable.contains(mint),
            price_sol: None,
        })
    }
}
