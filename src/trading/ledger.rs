use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

/// One confirmed fill. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub side: TradeSide,
    pub token: String,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub timestamp: DateTime<Utc>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PnlReport {
    pub token: String,
    pub total_buy_sol: f64,
    pub total_sell_sol: f64,
    pub pnl: f64,
    pub pnl_percentage: f64,
}

impl fmt::Display for PnlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spent {:.6} SOL, received {:.6} SOL, pnl {:+.6} SOL ({:+.2}%)",
            self.total_buy_sol, self.total_sell_sol, self.pnl, self.pnl_percentage
        )
    }
}

/// Fills per token in arrival order
#[derive(Debug, Default)]
pub struct PnlLedger {
    records: HashMap<String, Vec<TransactionRecord>>,
}

impl PnlLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fill(&mut self, side: TradeSide, token: &str, token_amount: f64, sol_amount: f64) {
        self.append(TransactionRecord {
            side,
            token: token.to_string(),
            token_amount,
            sol_amount,
            timestamp: Utc::now(),
            signature: None,
        });
    }

    pub fn append(&mut self, record: TransactionRecord) {
        self.records.entry(record.token.clone()).or_default().push(record);
    }

    pub fn records(&self, token: &str) -> &[TransactionRecord] {
        self.records.get(token).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Realized PnL for `token`; `None` when nothing was bought
    pub fn compute_pnl(&self, token: &str) -> Option<PnlReport> {
        let records = self.records.get(token)?;

        let (total_buy_sol, total_sell_sol) =
            records.iter().fold((0.0, 0.0), |(buy, sell), r| match r.side {
                TradeSide::Buy => (buy + r.sol_amount, sell),
                TradeSide::Sell => (buy, sell + r.sol_amount),
            });

        if total_buy_sol <= 0.0 {
            return None;
        }

        let pnl = total_sell_sol - total_buy_sol;
        Some(PnlReport {
            token: token.to_string(),
            total_buy_sol,
            total_sell_sol,
            pnl,
            pnl_percentage: pnl / total_buy_sol * 100.0,
        })
    }
}
