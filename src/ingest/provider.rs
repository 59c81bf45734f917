/// Enhanced transaction records from the provider's parsed-transaction API
///
/// The same shape arrives over the webhook transport, so both ingestion paths
/// deserialize into `EnhancedTransaction`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::{HeaderMap, HeaderValue, CONTENT_TYPE}, Client};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::time::Duration;
use tracing::debug;

/// Accepts lamport/subunit amounts sent either as JSON numbers or strings
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(value) => Ok(value),
        Raw::Float(value) if value >= 0.0 => Ok(value as u64),
        Raw::Float(value) => Err(D::Error::custom(format!("negative amount {}", value))),
        Raw::Text(text) => text.trim().parse().map_err(D::Error::custom),
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhancedTransaction {
    pub signature: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    /// Unix seconds
    pub timestamp: Option<i64>,
    pub slot: Option<u64>,
    pub fee: Option<u64>,
    pub fee_payer: Option<String>,
    pub source: Option<String>,
    pub description: Option<String>,
    pub token_transfers: Vec<TokenTransfer>,
    pub native_transfers: Vec<NativeTransfer>,
    pub events: TransactionEvents,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenTransfer {
    pub from_user_account: Option<String>,
    pub to_user_account: Option<String>,
    pub mint: String,
    /// Already scaled by the provider
    pub token_amount: f64,
    pub raw_token_amount: Option<RawTokenAmount>,
}

impl TokenTransfer {
    /// Decimal amount, preferring the raw subunits when present
    pub fn ui_amount(&self) -> f64 {
        self.raw_token_amount
            .as_ref()
            .map(RawTokenAmount::ui_amount)
            .unwrap_or(self.token_amount)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeTransfer {
    pub from_user_account: Option<String>,
    pub to_user_account: Option<String>,
    /// Lamports
    #[serde(deserialize_with = "lenient_u64")]
    pub amount: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTokenAmount {
    #[serde(deserialize_with = "lenient_u64")]
    pub token_amount: u64,
    pub decimals: u8,
}

impl RawTokenAmount {
    pub fn ui_amount(&self) -> f64 {
        crate::core::utils::token_amount_to_ui(self.token_amount, self.decimals)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionEvents {
    pub swap: Option<SwapEvent>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwapEvent {
    pub native_input: Option<NativeAmount>,
    pub native_output: Option<NativeAmount>,
    pub token_inputs: Vec<TokenLeg>,
    pub token_outputs: Vec<TokenLeg>,
    pub inner_swaps: Vec<InnerSwap>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeAmount {
    pub account: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub amount: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenLeg {
    pub user_account: Option<String>,
    pub token_account: Option<String>,
    pub mint: String,
    pub raw_token_amount: Option<RawTokenAmount>,
}

impl TokenLeg {
    pub fn ui_amount(&self) -> f64 {
        self.raw_token_amount
            .as_ref()
            .map(RawTokenAmount::ui_amount)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InnerSwap {
    pub token_inputs: Vec<TokenTransfer>,
    pub token_outputs: Vec<TokenTransfer>,
}

/// Transaction-detail lookup by signature
#[async_trait]
pub trait TransactionDetailSource: Send + Sync {
    /// `Ok(None)` when the provider has no record for the signature
    async fn fetch_transaction(&self, signature: &str) -> Result<Option<EnhancedTransaction>>;
}

/// Client for the provider's parsed-transactions endpoint
pub struct HeliusClient {
    client: Client,
    api_url: String,
    api_key: String,
}

impl HeliusClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
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
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl TransactionDetailSource for HeliusClient {
    async fn fetch_transaction(&self, signature: &str) -> Result<Option<EnhancedTransaction>> {
        debug!("🔍 Fetching transaction detail for {}", signature);

        let response = self
            .client
            .post(&self.api_url)
            .query(&[("api-key", self.api_key.as_str())])
            .json(&serde_json::json!({ "transactions": [signature] }))
            .send()
            .await
            .context("Failed to request transaction detail")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Transaction detail request failed with status {}: {}", status, error_text);
        }

        let mut records: Vec<EnhancedTransaction> = response
            .json()
            .await
            .context("Failed to parse transaction detail response")?;

        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records.swap_remove(0)))
    }
}
