use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use super::chain::ChainClient;
use crate::core::constants::SOL_MINT;
use crate::ingest::dispatcher::{LimiterId, RateLimitedDispatcher};

#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub mint: String,
    pub decimals: u8,
    /// Mint keeps an authority able to freeze holder accounts
    pub freezable: bool,
    /// Price in SOL, absent when the price service has none
    pub price_sol: Option<f64>,
}

/// Token metadata lookup used by the seed check
#[async_trait]
pub trait TokenInfoSource: Send + Sync {
    async fn token_info(&self, mint: &str) -> Result<TokenInfo>;
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    data: HashMap<String, PriceEntry>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    price: f64,
}

/// Freeze authority from the mint account plus the Jupiter SOL price
pub struct TokenInfoProvider {
    client: Client,
    price_api_url: String,
    chain: Arc<dyn ChainClient>,
    dispatcher: RateLimitedDispatcher,
}

impl TokenInfoProvider {
    pub fn new(
        price_api_url: impl Into<String>,
        chain: Arc<dyn ChainClient>,
        dispatcher: RateLimitedDispatcher,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            price_api_url: price_api_url.into(),
            chain,
            dispatcher,
        })
    }

    async fn price_in_sol(&self, mint: &str) -> Result<Option<f64>> {
        let request = self
            .client
            .get(&self.price_api_url)
            .query(&[("ids", mint), ("vsToken", SOL_MINT)]);
        let response = self
            .dispatcher
            .dispatch(LimiterId::Aggregator, || request.send())
            .await
            .context("Failed to request token price")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Price request failed with status {}", status);
        }

        let prices: PriceResponse = response.json().await.context("Failed to parse price response")?;
        Ok(prices.data.get(mint).map(|entry| entry.price))
    }
}

#[async_trait]
impl TokenInfoSource for TokenInfoProvider {
    async fn token_info(&self, mint: &str) -> Result<TokenInfo> {
        let mint_info = self.chain.mint_info(mint).await?;

        let price_sol = match self.price_in_sol(mint).await {
            Ok(price) => price,
            Err(e) => {
                debug!("No price for {}: {}", mint, e);
                None
            }
        };

        Ok(TokenInfo {
            mint: mint.to_string(),
            decimals: mint_info.decimals,
            freezable: mint_info.freezable,
            price_sol,
        })
    }
}
