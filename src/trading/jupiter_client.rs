/// Jupiter API Client for swap quotes and swap transactions
///
/// Quotes are requested with GET /quote and turned into a serialized,
/// unsigned swap transaction with POST /swap. Signing and submission
/// happen in the chain client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::{HeaderMap, HeaderValue, CONTENT_TYPE}, Client};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Duration;
use tracing::debug;

/// Jupiter quote response
///
/// Only the fields the engine reads are typed; everything else is kept in
/// `extra` so the quote can be posted back to /swap unchanged.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    /// Input mint
    pub input_mint: String,
    /// Output mint
    pub output_mint: String,
    /// Input amount
    pub in_amount: String,
    /// Output amount
    pub out_amount: String,
    /// Slippage basis points
    #[serde(default)]
    pub slippage_bps: u16,
    /// Price impact percentage
    #[serde(default)]
    pub price_impact_pct: String,
    /// Route plan
    #[serde(default)]
    pub route_plan: Vec<RoutePlanItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuoteResponse {
    pub fn in_amount_u64(&self) -> u64 {
        self.in_amount.parse().unwrap_or(0)
    }

    pub fn out_amount_u64(&self) -> u64 {
        self.out_amount.parse().unwrap_or(0)
    }

    pub fn price_impact(&self) -> f64 {
        self.price_impact_pct.parse().unwrap_or(0.0)
    }

    /// A quote is usable when it has at least one hop and a non-zero output
    pub fn has_route(&self) -> bool {
        !self.route_plan.is_empty() && self.out_amount_u64() > 0
    }
}

/// Route plan item
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlanItem {
    /// Swap info
    pub swap_info: SwapInfo,
    /// Percent
    pub percent: u8,
}

/// Swap info within route plan
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SwapInfo {
    pub amm_key: String,
    #[serde(default)]
    pub label: Option<String>,
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: String,
    pub out_amount: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Swap request for building the transaction
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest<'a> {
    /// User's public key
    pub user_public_key: &'a str,
    /// Quote response from Jupiter, posted back verbatim
    pub quote_response: &'a QuoteResponse,
    /// Wrap and unwrap SOL automatically
    pub wrap_and_unwrap_sol: bool,
    /// Let Jupiter size the compute budget
    pub dynamic_compute_unit_limit: bool,
    /// Priority fee in lamports
    pub prioritization_fee_lamports: u64,
}

/// Jupiter swap response with transaction
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SwapResponse {
    /// Base64 serialized versioned transaction
    pub swap_transaction: String,
    /// Last valid block height
    #[serde(default)]
    pub last_valid_block_height: u64,
    /// Simulate error (if any)
    #[serde(default)]
    pub simulation_error: Option<Value>,
}

/// Quote and build seam of the swap aggregator
#[async_trait]
pub trait SwapAggregator: Send + Sync {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<QuoteResponse>;

    async fn get_swap_transaction(&self, quote: &QuoteResponse, user_public_key: &str) -> Result<SwapResponse>;
}

/// Jupiter V6 API client
pub struct JupiterClient {
    /// HTTP client for API requests
    client: Client,
    /// Jupiter API base URL
    api_url: String,
    /// Priority fee in lamports (for faster transaction processing)
    priority_fee_lamports: u64,
}

impl JupiterClient {
    pub fn new(api_url: impl Into<String>, priority_fee_lamports: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            priority_fee_lamports,
        })
    }
}

#[async_trait]
impl SwapAggregator for JupiterClient {
    /// Get quote for a token swap
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<QuoteResponse> {
        debug!("🔍 Getting Jupiter quote: {} {} -> {}", amount, input_mint, output_mint);

        let amount = amount.to_string();
        let slippage = slippage_bps.to_string();
        let params = [
            ("inputMint", input_mint),
            ("outputMint", output_mint),
            ("amount", amount.as_str()),
            ("slippageBps", slippage.as_str()),
        ];

        let url = format!("{}/quote", self.api_url);

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("Failed to request quote from Jupiter")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Jupiter quote request failed with status {}: {}", status, error_text);
        }

        let quote: QuoteResponse = response
            .json()
            .await
            .context("Failed to parse Jupiter quote response")?;

        debug!(
            "📊 Quote received: {} {} -> {} {} (impact: {}%)",
            quote.in_amount, input_mint, quote.out_amount, output_mint, quote.price_impact_pct
        );

        Ok(quote)
    }

    /// Get swap transaction from Jupiter API
    async fn get_swap_transaction(&self, quote: &QuoteResponse, user_public_key: &str) -> Result<SwapResponse> {
        let url = format!("{}/swap", self.api_url);
        let swap_request = SwapRequest {
            user_public_key,
            quote_response: quote,
            wrap_and_unwrap_sol: true,
            dynamic_compute_unit_limit: true,
            prioritization_fee_lamports: self.priority_fee_lamports,
        };

        debug!("📤 Requesting swap transaction from Jupiter");

        let response = self
            .client
            .post(&url)
            .json(&swap_request)
            .send()
            .await
            .context("Failed to request swap transaction from Jupiter")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Jupiter swap transaction request failed with status {}: {}", status, error_text);
        }

        let swap_response: SwapResponse = response
            .json()
            .await
            .context("Failed to parse Jupiter swap response")?;

        if let Some(err) = &swap_response.simulation_error {
            anyhow::bail!("Jupiter swap simulation failed: {}", err);
        }

        debug!("📥 Swap transaction received from Jupiter");
        Ok(swap_response)
    }
}
