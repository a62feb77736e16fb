pub mod derivation;
pub mod error;
pub mod export;
pub mod history;
pub mod network;
pub mod rpc;
pub mod session;
pub mod types;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod testing;

pub use derivation::{KeyDerivationService, Wallet};
pub use error::{Result, WalletError};
pub use export::{ExportSink, JsonFileSink, Sheet};
pub use history::TransactionHistoryStore;
pub use network::{NetworkContext, TokenConfig};
pub use session::SessionContext;
pub use types::{Asset, MultiTransactionRequest, MultiTransactionResult, Topology, TransactionRecord};
pub use wallet::{Config, WalletManager};
