use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Seller role name used by the detection cycle
pub const ROLE_SELLER: &str = "SELLER";
/// Distributor role name used by the detection cycle
pub const ROLE_DISTRIB: &str = "DISTRIB";

/// What a transfer moved: native SOL or an SPL token mint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Native,
    Token(String),
}

impl Asset {
    /// Maps a mint identifier to an asset, folding the wrapped-SOL sentinel into `Native`
    pub fn from_mint(mint: &str) -> Self {
        if mint == constants::SOL_MINT {
            Asset::Native
        } else {
            Asset::Token(mint.to_string())
        }
    }

    pub fn is_token(&self, mint: &str) -> bool {
        matches!(self, Asset::Token(m) if m == mint)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => write!(f, "SOL"),
            Asset::Token(mint) => write!(f, "{}", utils::shorten_pubkey(mint)),
        }
    }
}

/// Which side of a swap a leg describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapLeg {
    Input,
    Output,
}

/// Canonical event body. Each variant carries only the fields valid for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferEvent {
    /// One leg of a swap executed by `account`
    Swap {
        leg: SwapLeg,
        account: String,
        asset: Asset,
        amount: f64,
    },
    /// Plain movement of SOL or a token between two wallets
    Transfer {
        from: String,
        to: String,
        asset: Asset,
        amount: f64,
    },
    /// Fresh supply minted to `to`
    Mint {
        mint: String,
        to: String,
        amount: f64,
    },
    /// Anything the detection cycle does not care about
    Other { tx_type: String },
}

/// Normalized view of one provider transaction record (or one leg of it)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTransfer {
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub event: TransferEvent,
}

impl CanonicalTransfer {
    /// Addresses this transfer touches, in (from, to) order where meaningful
    pub fn parties(&self) -> (Option<&str>, Option<&str>) {
        match &self.event {
            TransferEvent::Swap { account, leg: SwapLeg::Input, .. } => (Some(account.as_str()), None),
            TransferEvent::Swap { account, leg: SwapLeg::Output, .. } => (None, Some(account.as_str())),
            TransferEvent::Transfer { from, to, .. } => (Some(from.as_str()), Some(to.as_str())),
            TransferEvent::Mint { to, .. } => (None, Some(to.as_str())),
            TransferEvent::Other { .. } => (None, None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.event {
            TransferEvent::Swap { .. } => "SWAP",
            TransferEvent::Transfer { .. } => "TRANSFER",
            TransferEvent::Mint { .. } => "MINT",
            TransferEvent::Other { .. } => "OTHER",
        }
    }
}

impl fmt::Display for CanonicalTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sig = utils::shorten_pubkey(&self.signature);
        match &self.event {
            TransferEvent::Swap { leg, account, asset, amount } => write!(
                f, "{} SWAP {:?} {} {:.6} {}", sig, leg, utils::shorten_pubkey(account), amount, asset
            ),
            TransferEvent::Transfer { from, to, asset, amount } => write!(
                f, "{} TRANSFER {} -> {} {:.6} {}",
                sig, utils::shorten_pubkey(from), utils::shorten_pubkey(to), amount, asset
            ),
            TransferEvent::Mint { mint, to, amount } => write!(
                f, "{} MINT {} -> {} {:.6}", sig, utils::shorten_pubkey(mint), utils::shorten_pubkey(to), amount
            ),
            TransferEvent::Other { tx_type } => write!(f, "{} {}", sig, tx_type),
        }
    }
}

/// Named roles mapped to wallet addresses. Grows at runtime when wallets are discovered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchedAddressSet {
    roles: BTreeMap<String, String>,
}

impl WatchedAddressSet {
    pub fn from_roles<I, K, V>(roles: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            roles: roles
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(_, v)| !v.is_empty())
                .collect(),
        }
    }

    /// Inserts a role; an existing role keeps its address
    pub fn insert(&mut self, role: impl Into<String>, address: impl Into<String>) -> bool {
        let role = role.into();
        if self.roles.contains_key(&role) {
            return false;
        }
        self.roles.insert(role, address.into());
        true
    }

    pub fn address(&self, role: &str) -> Option<&str> {
        self.roles.get(role).map(String::as_str)
    }

    /// True when `address` is bound to `role`
    pub fn is(&self, role: &str, address: &str) -> bool {
        self.address(role) == Some(address)
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.roles.values().any(|a| a == address)
    }

    /// First role whose address equals `address`
    pub fn role_of(&self, address: &str) -> Option<&str> {
        self.roles
            .iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(r, _)| r.as_str())
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.roles.iter().map(|(r, a)| (r.as_str(), a.as_str()))
    }

    /// Generated name for the next discovered wallet
    pub fn next_discovered_role(&self) -> String {
        format!("Wallet_{}", self.roles.len() + 1)
    }
}

pub mod constants {
    /// Wrapped SOL mint, used as the native-asset sentinel by providers and Jupiter
    pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
    pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;
}

pub mod utils {
    use super::constants::LAMPORTS_PER_SOL;

    /// Convert pubkey to shortened display format
    pub fn shorten_pubkey(pubkey: &str) -> String {
        if pubkey.len() >= 16 {
            format!("{}...{}", &pubkey[..8], &pubkey[pubkey.len() - 8..])
        } else {
            pubkey.to_string()
        }
    }

    /// Convert lamports to SOL
    pub fn lamports_to_sol(lamports: u64) -> f64 {
        lamports as f64 / LAMPORTS_PER_SOL as f64
    }

    /// Convert SOL to lamports, clamping negatives to zero
    pub fn sol_to_lamports(sol: f64) -> u64 {
        if sol <= 0.0 {
            0
        } else {
            (sol * LAMPORTS_PER_SOL as f64) as u64
        }
    }

    /// Extract token amount considering decimals
    pub fn token_amount_to_ui(raw_amount: u64, decimals: u8) -> f64 {
        raw_amount as f64 / 10_f64.powi(decimals as i32)
    }

    /// Inverse of `token_amount_to_ui`, rounding down to whole subunits
    pub fn ui_to_token_amount(ui_amount: f64, decimals: u8) -> u64 {
        if ui_amount <= 0.0 {
            0
        } else {
            (ui_amount * 10_f64.powi(decimals as i32)).floor() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_sol_is_native() {
        assert_eq!(Asset::from_mint(constants::SOL_MINT), Asset::Native);
        assert!(Asset::from_mint("Tx").is_token("Tx"));
    }

    #[test]
    fn test_watched_set_roles() {
        let mut set = WatchedAddressSet::from_roles([("SELLER", "S1"), ("DISTRIB", "D1"), ("EMPTY", "")]);
        assert_eq!(set.len(), 2);
        assert!(set.is(ROLE_SELLER, "S1"));
        assert_eq!(set.role_of("D1"), Some(ROLE_DISTRIB));

        let role = set.next_discovered_role();
        assert_eq!(role, "Wallet_3");
        assert!(set.insert(role, "W3"));
        assert!(!set.insert("SELLER", "other"));
        assert!(set.contains_address("W3"));
        assert!(set.is(ROLE_SELLER, "S1"));
    }

    #[test]
    fn test_amount_conversions() {
        assert_eq!(utils::lamports_to_sol(150_000_000_000), 150.0);
        assert_eq!(utils::sol_to_lamports(-1.0), 0);
        assert_eq!(utils::token_amount_to_ui(1_500_000, 6), 1.5);
        assert_eq!(utils::ui_to_token_amount(1.5, 6), 1_500_000);
    }
}
