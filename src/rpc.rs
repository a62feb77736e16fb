//! JSON-RPC access to the active chain.
//!
//! Everything the engine reads from or submits to a node goes through the
//! [`ChainRpc`] trait. [`AlloyRpc`] is the production implementation on top of
//! an alloy provider; tests substitute a scripted mock.

use std::{future::Future, sync::Arc, time::Duration};

use alloy::{
    network::{Ethereum, TransactionBuilder},
    primitives::{Address, Bytes, TxHash, U256},
    providers::{Provider, ProviderBuilder},
    sol,
    sol_types::SolCall,
};
use alloy_rpc_types::TransactionRequest;
use alloy_transport::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, WalletError};

sol! {
    /// Minimal ERC-20 surface used for balances and transfers.
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256 balance);
        function transfer(address to, uint256 amount) external returns (bool success);
        function decimals() external view returns (uint8 value);
        function symbol() external view returns (string value);
    }
}

/// What the engine needs to know about a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub success: bool,
    pub gas_used: u64,
    /// Wei per gas actually paid
    pub effective_gas_price: U256,
}

impl ReceiptSummary {
    pub fn fee(&self) -> U256 {
        U256::from(self.gas_used) * self.effective_gas_price
    }
}

/// Node operations consumed by the balance, gas and transfer components.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn native_balance(&self, address: Address) -> Result<U256>;

    /// Deployed bytecode at `address`; empty for accounts without code
    async fn code_at(&self, address: Address) -> Result<Bytes>;

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256>;

    async fn token_decimals(&self, token: Address) -> Result<u8>;

    async fn token_symbol(&self, token: Address) -> Result<String>;

    /// Current gas price in wei
    async fn gas_price(&self) -> Result<U256>;

    /// Transaction count including pending transactions
    async fn pending_nonce(&self, address: Address) -> Result<u64>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash>;

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<ReceiptSummary>>;
}

/// [`ChainRpc`] backed by an alloy provider.
pub struct AlloyRpc {
    provider: Arc<dyn Provider<Ethereum>>,
    timeout: Option<Duration>,
}

impl AlloyRpc {
    pub fn new(provider: Arc<dyn Provider<Ethereum>>, timeout: Option<Duration>) -> Self {
        Self { provider, timeout }
    }

    /// Connects to `url` with the default filler stack.
    pub async fn connect(url: &str, timeout: Option<Duration>) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .connect(url)
            .await
            .map_err(|e| classify_rpc_error("connect", e))?;
        Ok(Self::new(Arc::new(provider), timeout))
    }

    async fn guarded<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RpcError<TransportErrorKind>>>,
    {
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| WalletError::TransientRpc(format!("{} timed out after {:?}", what, limit)))?,
            None => call.await,
        };
        result.map_err(|e| classify_rpc_error(what, e))
    }

    async fn eth_call(&self, what: &str, to: Address, input: Vec<u8>) -> Result<Bytes> {
        let request = TransactionRequest::default()
            .with_to(to)
            .with_input(input);
        self.guarded(what, async move { self.provider.call(request).await })
            .await
    }
}

#[async_trait]
impl ChainRpc for AlloyRpc {
    async fn chain_id(&self) -> Result<u64> {
        self.guarded("chain id", async { self.provider.get_chain_id().await })
            .await
    }

    async fn native_balance(&self, address: Address) -> Result<U256> {
        self.guarded("balance", async { self.provider.get_balance(address).await })
            .await
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        self.guarded("code", async { self.provider.get_code_at(address).await })
            .await
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        let input = IERC20::balanceOfCall { account: owner }.abi_encode();
        let output = self.eth_call("balanceOf", token, input).await?;
        IERC20::balanceOfCall::abi_decode_returns(&output, true)
            .map(|ret| ret.balance)
            .map_err(|e| WalletError::ProviderError(format!("Failed to decode balanceOf: {}", e)))
    }

    async fn token_decimals(&self, token: Address) -> Result<u8> {
        let output = self
            .eth_call("decimals", token, IERC20::decimalsCall {}.abi_encode())
            .await?;
        IERC20::decimalsCall::abi_decode_returns(&output, true)
            .map(|ret| ret.value)
            .map_err(|e| WalletError::ProviderError(format!("Failed to decode decimals: {}", e)))
    }

    async fn token_symbol(&self, token: Address) -> Result<String> {
        let output = self
            .eth_call("symbol", token, IERC20::symbolCall {}.abi_encode())
            .await?;
        IERC20::symbolCall::abi_decode_returns(&output, true)
            .map(|ret| ret.value)
            .map_err(|e| WalletError::ProviderError(format!("Failed to decode symbol: {}", e)))
    }

    async fn gas_price(&self) -> Result<U256> {
        self.guarded("gas price", async { self.provider.get_gas_price().await })
            .await
            .map(U256::from)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        self.guarded("nonce", async {
            self.provider.get_transaction_count(address).pending().await
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
        let pending = self
            .guarded("send", async {
                self.provider.send_raw_transaction(&raw).await
            })
            .await?;
        debug!(hash = %pending.tx_hash(), "Raw transaction accepted");
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<ReceiptSummary>> {
        let receipt = self
            .guarded("receipt", async {
                self.provider.get_transaction_receipt(hash).await
            })
            .await?;
        Ok(receipt.map(|r| ReceiptSummary {
            success: r.status(),
            gas_used: r.gas_used,
            effective_gas_price: U256::from(r.effective_gas_price),
        }))
    }
}

/// Splits RPC failures into transient (retry later) and permanent.
pub fn classify_rpc_error(what: &str, error: RpcError<TransportErrorKind>) -> WalletError {
    let message = format!("{} failed: {}", what, error);
    match error {
        RpcError::Transport(_) => WalletError::TransientRpc(message),
        _ if is_transient_message(&message) => WalletError::TransientRpc(message),
        _ => WalletError::ProviderError(message),
    }
}

/// Heuristic over node error text for timeouts, dropped connections and rate limits.
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_lowercase();
    [
        "timeout",
        "timed out",
        "connection",
        "network error",
        "rate limit",
        "too many requests",
        "429",
        "503",
        "temporarily unavailable",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}
