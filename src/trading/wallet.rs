use anyhow::{bail, Context, Result};
use solana_sdk::signature::Keypair;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Decodes a secret key given as base58 (Solana CLI export) or a JSON byte array
pub fn keypair_from_str(secret: &str) -> Result<Keypair> {
    let secret = secret.trim();

    if let Ok(bytes) = bs58::decode(secret).into_vec() {
        if bytes.len() == 64 {
            return Keypair::from_bytes(&bytes).context("Failed to create keypair from base58 string");
        }
    }

    if let Ok(bytes) = serde_json::from_str::<Vec<u8>>(secret) {
        if bytes.len() == 64 {
            return Keypair::from_bytes(&bytes).context("Failed to create keypair from JSON string");
        }
    }

    bail!("Invalid private key format. Expected base58 string or JSON array of 64 bytes.")
}

/// Loads the trading keypair, trying the keypair file first and then the environment variable
pub fn load_keypair(keypair_path: Option<&str>, private_key_env: &str) -> Result<Keypair> {
    if let Some(path) = keypair_path {
        debug!(path = %path, "Loading keypair from file");

        if Path::new(path).exists() {
            let bytes = fs::read(path).with_context(|| format!("Failed to read keypair file: {}", path))?;

            if let Ok(json_bytes) = serde_json::from_slice::<Vec<u8>>(&bytes) {
                if json_bytes.len() == 64 {
                    info!("🔑 Keypair loaded from file");
                    return Keypair::from_bytes(&json_bytes).context("Failed to create keypair from JSON bytes");
                }
            }

            if bytes.len() == 64 {
                info!("🔑 Keypair loaded from file (raw format)");
                return Keypair::from_bytes(&bytes).context("Failed to create keypair from raw bytes");
            }

            bail!("Invalid keypair file format. Expected 64 bytes or JSON array format.");
        }
        warn!(path = %path, "Keypair file not found, trying environment variable");
    }

    let secret = std::env::var(private_key_env)
        .with_context(|| format!("No keypair file and {} is not set", private_key_env))?;
    let keypair = keypair_from_str(&secret)?;
    info!("🔑 Keypair loaded from environment variable {}", private_key_env);
    Ok(keypair)
}
