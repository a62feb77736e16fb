use alloy::primitives::{Address, U256};
use thiserror::Error;

/// A sender whose balance cannot cover its leg of a fan-in batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    /// 1-based wallet index within the session pool
    pub index: usize,
    pub address: Address,
    pub required: U256,
    /// `None` when the balance could not be read
    pub available: Option<U256>,
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.available {
            Some(available) => write!(
                f,
                "wallet #{} ({}) needs {} has {}",
                self.index, self.address, self.required, available
            ),
            None => write!(
                f,
                "wallet #{} ({}) needs {} balance unavailable",
                self.index, self.address, self.required
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid seed phrase: {0}")]
    InvalidSeedPhrase(String),

    #[error("Requested {requested} wallets, at most {max} may be derived at once")]
    RangeTooLarge { requested: u64, max: usize },

    #[error("Invalid derivation range: start {start} is greater than end {end}")]
    InvalidRange { start: u32, end: u32 },

    #[error("Transient RPC error: {0}")]
    TransientRpc(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("No contract code deployed at {0}")]
    ContractNotDeployed(Address),

    #[error("Insufficient balance: {available} < {required} for wallet {address}")]
    InsufficientBalance {
        address: Address,
        required: U256,
        available: U256,
    },

    #[error("Pre-flight check failed for {} wallet(s): {}", .0.len(), format_shortfalls(.0))]
    PreflightFailed(Vec<Shortfall>),

    #[error("Wallet #{0} not found in the session")]
    WalletNotFound(usize),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Invalid environment variable value: {0}")]
    InvalidEnvVar(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WalletError {
    /// Timeouts and dropped connections; worth another attempt after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::TransientRpc(_))
    }
}

fn format_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, WalletError>;
