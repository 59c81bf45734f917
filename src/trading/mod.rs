pub mod chain;
pub mod execution_engine;
pub mod jupiter_client;
pub mod ledger;
pub mod token_info;
pub mod wallet;

#[cfg(test)]
pub(crate) mod fakes;

pub use chain::{ChainClient, Confirmation, MintInfo, SolanaChainClient};
pub use execution_engine::{ExecutionConfig, TradeError, TradeExecutionEngine, TradeOutcome};
pub use jupiter_client::{JupiterClient, QuoteResponse, SwapAggregator, SwapResponse};
pub use ledger::{PnlLedger, PnlReport, TradeSide, TransactionRecord};
pub use token_info::{TokenInfo, TokenInfoProvider, TokenInfoSource};
