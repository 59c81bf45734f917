use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_instruction,
    transaction::{Transaction, VersionedTransaction},
};
use spl_token::solana_program::program_pack::Pack;
use spl_token::state::Mint;
use std::str::FromStr;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::ingest::dispatcher::{LimiterId, RateLimitedDispatcher};

/// Mint account facts the engine and the freeze check need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintInfo {
    pub decimals: u8,
    pub freezable: bool,
}

/// Terminal state of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Failed(String),
    TimedOut,
}

/// On-chain reads and writes for the trading wallet
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Trading wallet public key
    fn owner(&self) -> Pubkey;

    /// Lamports held by the trading wallet
    async fn sol_balance(&self) -> Result<u64>;

    /// Raw token subunits held in the trading wallet's associated account
    async fn token_balance(&self, mint: &str) -> Result<u64>;

    async fn mint_info(&self, mint: &str) -> Result<MintInfo>;

    /// Signs a base64 serialized versioned transaction and submits it
    async fn sign_and_send(&self, serialized_tx: &str) -> Result<String>;

    async fn confirm(&self, signature: &str, timeout: Duration) -> Result<Confirmation>;

    async fn transfer_sol(&self, to: &str, lamports: u64) -> Result<String>;
}

/// RPC-backed chain client. Every call goes through the RPC rate limiter.
pub struct SolanaChainClient {
    rpc_client: RpcClient,
    keypair: Keypair,
    dispatcher: RateLimitedDispatcher,
    poll_interval: Duration,
}

impl SolanaChainClient {
    pub fn new(rpc_url: impl Into<String>, keypair: Keypair, dispatcher: RateLimitedDispatcher) -> Self {
        Self {
            rpc_client: RpcClient::new_with_commitment(rpc_url.into(), CommitmentConfig::confirmed()),
            keypair,
            dispatcher,
            poll_interval: Duration::from_secs(2),
        }
    }
}

fn parse_pubkey(value: &str) -> Result<Pubkey> {
    Pubkey::from_str(value).with_context(|| format!("Invalid public key: {}", value))
}

/// Decodes the mint account layout; Token-2022 mints carry extensions after the base layout
pub fn decode_mint(data: &[u8]) -> Result<MintInfo> {
    if data.len() < Mint::LEN {
        bail!("Account data too short for a mint: {} bytes", data.len());
    }
    let mint = Mint::unpack(&data[..Mint::LEN]).context("Failed to unpack mint account")?;
    Ok(MintInfo {
        decimals: mint.decimals,
        freezable: mint.freeze_authority.is_some(),
    })
}

#[async_trait]
impl ChainClient for SolanaChainClient {
    fn owner(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn sol_balance(&self) -> Result<u64> {
        let owner = self.owner();
        self.dispatcher
            .dispatch(LimiterId::Rpc, || self.rpc_client.get_balance(&owner))
            .await
            .context("Failed to get SOL balance")
    }

    async fn token_balance(&self, mint: &str) -> Result<u64> {
        let mint = parse_pubkey(mint)?;
        let ata = spl_associated_token_account::get_associated_token_address(&self.owner(), &mint);
        let balance = self
            .dispatcher
            .dispatch(LimiterId::Rpc, || self.rpc_client.get_token_account_balance(&ata))
            .await
            .with_context(|| format!("Failed to get token balance for {}", ata))?;
        balance
            .amount
            .parse()
            .with_context(|| format!("Invalid token amount {}", balance.amount))
    }

    async fn mint_info(&self, mint: &str) -> Result<MintInfo> {
        let mint = parse_pubkey(mint)?;
        let data = self
            .dispatcher
            .dispatch(LimiterId::Rpc, || self.rpc_client.get_account_data(&mint))
            .await
            .with_context(|| format!("Failed to fetch mint account {}", mint))?;
        decode_mint(&data)
    }

    async fn sign_and_send(&self, serialized_tx: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(serialized_tx)
            .context("Failed to decode swap transaction")?;
        let unsigned: VersionedTransaction =
            bincode::deserialize(&bytes).context("Failed to deserialize transaction")?;
        let transaction = VersionedTransaction::try_new(unsigned.message, &[&self.keypair])
            .context("Failed to sign transaction")?;

        debug!("✍️ Transaction signed, submitting to network");

        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(2),
            ..Default::default()
        };
        let signature = self
            .dispatcher
            .dispatch(LimiterId::Rpc, || {
                self.rpc_client.send_transaction_with_config(&transaction, config)
            })
            .await
            .context("Failed to send transaction")?;

        Ok(signature.to_string())
    }

    async fn confirm(&self, signature: &str, timeout: Duration) -> Result<Confirmation> {
        let signature = Signature::from_str(signature).context("Invalid transaction signature")?;
        let start = Instant::now();

        while start.elapsed() < timeout {
            let status = self
                .dispatcher
                .dispatch(LimiterId::Rpc, || self.rpc_client.get_signature_status(&signature))
                .await;

            match status {
                Ok(Some(Ok(()))) => return Ok(Confirmation::Confirmed),
                Ok(Some(Err(e))) => return Ok(Confirmation::Failed(format!("{:?}", e))),
                Ok(None) => {}
                Err(e) => warn!("Error checking transaction status: {}", e),
            }
            sleep(self.poll_interval).await;
        }

        Ok(Confirmation::TimedOut)
    }

    async fn transfer_sol(&self, to: &str, lamports: u64) -> Result<String> {
        let to = parse_pubkey(to)?;
        let owner = self.owner();
        let instruction = system_instruction::transfer(&owner, &to, lamports);

        let blockhash = self
            .dispatcher
            .dispatch(LimiterId::Rpc, || self.rpc_client.get_latest_blockhash())
            .await
            .context("Failed to get recent blockhash")?;
        let transaction =
            Transaction::new_signed_with_payer(&[instruction], Some(&owner), &[&self.keypair], blockhash);

        let signature = self
            .dispatcher
            .dispatch(LimiterId::Rpc, || self.rpc_client.send_and_confirm_transaction(&transaction))
            .await
            .context("Failed to send transfer")?;

        info!("💸 Transferred {} lamports to {}", lamports, to);
        Ok(signature.to_string())
    }
}
