use alloy::{
    eips::eip2718::Encodable2718,
    network::TransactionBuilder,
    primitives::{Address, TxHash, U256},
    sol_types::SolCall,
};
use alloy_rpc_types::TransactionRequest;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    derivation::Wallet,
    error::{Result, WalletError},
    network::{NetworkContext, TokenConfig},
    rpc::{ChainRpc, IERC20},
    types::{Asset, TransferOutcome},
    utils::{format_amount, retry_with, NATIVE_DECIMALS},
};

use super::{
    gas::{GasConfig, GasEstimate, GasEstimator},
    Config,
};

/// Signs and submits single transfers from derived wallets
pub struct TransactionExecutor {
    rpc: Arc<dyn ChainRpc>,
    gas: GasEstimator,
    config: Config,
}

impl TransactionExecutor {
    /// Creates a new TransactionExecutor
    pub fn new(rpc: Arc<dyn ChainRpc>, config: Config) -> Self {
        let gas = GasEstimator::new(rpc.clone(), config.gas_buffer_multiplier);
        Self { rpc, gas, config }
    }

    pub fn gas_estimator(&self) -> &GasEstimator {
        &self.gas
    }

    /// Gets the balance of `address` in the given asset's base units
    pub async fn get_wallet_balance(
        &self,
        address: Address,
        asset: Asset,
        network: &NetworkContext,
    ) -> Result<U256> {
        match asset {
            Asset::Native => self.rpc.native_balance(address).await,
            Asset::Token => {
                let token = token_config(network)?;
                self.rpc.token_balance(token.address, address).await
            }
        }
    }

    /// Transfers `amount` base units of `asset` from `from` to `to`.
    ///
    /// Network and validation failures come back as an unsuccessful
    /// [`TransferOutcome`]; only a token transfer on a network without a
    /// configured token is returned as an error.
    pub async fn execute(
        &self,
        network: &NetworkContext,
        from: &Wallet,
        to: Address,
        amount: U256,
        asset: Asset,
        gas: &GasConfig,
    ) -> Result<TransferOutcome> {
        let token = match asset {
            Asset::Native => None,
            Asset::Token => Some(token_config(network)?),
        };

        match self.submit(network, from, to, amount, token, gas).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(from = %from.address, %to, error = %e, "Transfer failed before reaching the chain");
                Ok(TransferOutcome::failed(e.to_string()))
            }
        }
    }

    async fn submit(
        &self,
        network: &NetworkContext,
        from: &Wallet,
        to: Address,
        amount: U256,
        token: Option<&TokenConfig>,
        gas: &GasConfig,
    ) -> Result<TransferOutcome> {
        if amount.is_zero() {
            return Err(WalletError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            ));
        }

        let asset = match token {
            Some(token) => {
                let code = self.rpc.code_at(token.address).await?;
                if code.is_empty() {
                    return Err(WalletError::ContractNotDeployed(token.address));
                }
                Asset::Token
            }
            None => Asset::Native,
        };

        let balance = self.get_wallet_balance(from.address, asset, network).await?;
        if balance < amount {
            return Err(WalletError::InsufficientBalance {
                address: from.address,
                required: amount,
                available: balance,
            });
        }

        let estimate = self.gas.estimate(asset, 1, gas).await?;
        let nonce = self.acquire_nonce(from.address).await?;
        let (tx, fee_per_gas) = build_transaction(
            network.chain_id,
            from.address,
            to,
            amount,
            token,
            nonce,
            &estimate,
            gas.priority_fee(),
        )?;

        let tx_envelope = tx
            .build(&from.ethereum_wallet()?)
            .await
            .map_err(|e| WalletError::Signing(format!("Failed to build transaction: {}", e)))?;
        let raw = tx_envelope.encoded_2718();

        let (symbol, decimals) = match token {
            Some(token) => (token.symbol.as_str(), token.decimals),
            None => (network.native_currency_symbol.as_str(), NATIVE_DECIMALS),
        };
        info!(
            from = %from.address,
            %to,
            amount = %format_amount(amount, decimals),
            symbol,
            nonce,
            gas_limit = estimate.gas_limit,
            fee_per_gas = %fee_per_gas,
            "Sending transaction"
        );

        let start = tokio::time::Instant::now();
        let hash = self
            .rpc
            .send_raw_transaction(raw.into())
            .await
            .map_err(|e| WalletError::TransactionError(format!("Failed to send transaction: {}", e)))?;

        let estimated_fee = U256::from(estimate.gas_limit) * fee_per_gas;
        let outcome = self.confirm(hash, estimated_fee).await;
        info!(
            elapsed = ?start.elapsed(),
            tx_hash = %hash,
            success = outcome.success,
            gas_fee = %format_amount(outcome.gas_fee, NATIVE_DECIMALS),
            "Transaction finished"
        );
        Ok(outcome)
    }

    /// Reads the pending nonce, retrying any failure a bounded number of times
    async fn acquire_nonce(&self, address: Address) -> Result<u64> {
        retry_with(
            "nonce",
            self.config.nonce_retries,
            self.config.nonce_retry_delay,
            |_| true,
            || self.rpc.pending_nonce(address),
        )
        .await
        .map_err(|e| WalletError::TransactionError(format!("Failed to get nonce: {}", e)))
    }

    /// Waits for a receipt and reports the fee the chain actually charged.
    /// Without a receipt the transfer counts as submitted with the estimated fee.
    async fn confirm(&self, hash: TxHash, estimated_fee: U256) -> TransferOutcome {
        let submitted = TransferOutcome {
            success: true,
            tx_hash: Some(hash),
            gas_fee: estimated_fee,
            error: None,
        };
        if !self.config.wait_for_receipt {
            return submitted;
        }

        let deadline = tokio::time::Instant::now() + self.config.confirmation_timeout;
        loop {
            match self.rpc.transaction_receipt(hash).await {
                Ok(Some(receipt)) if receipt.success => {
                    return TransferOutcome {
                        gas_fee: receipt.fee(),
                        ..submitted
                    };
                }
                Ok(Some(receipt)) => {
                    return TransferOutcome {
                        success: false,
                        tx_hash: Some(hash),
                        gas_fee: receipt.fee(),
                        error: Some(format!("Transaction {} reverted", hash)),
                    };
                }
                Ok(None) => debug!(tx_hash = %hash, "Receipt not available yet"),
                Err(e) => debug!(tx_hash = %hash, error = %e, "Failed to read receipt"),
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    tx_hash = %hash,
                    timeout = ?self.config.confirmation_timeout,
                    "No receipt observed, counting transaction as submitted"
                );
                return submitted;
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }
}

fn token_config(network: &NetworkContext) -> Result<&TokenConfig> {
    network.token.as_ref().ok_or_else(|| {
        WalletError::InvalidRequest(format!(
            "No token configured for chain {}",
            network.chain_id
        ))
    })
}

fn to_u128(value: U256, what: &str) -> Result<u128> {
    if value > U256::from(u128::MAX) {
        return Err(WalletError::InvalidRequest(format!("{} is out of range", what)));
    }
    Ok(value.to::<u128>())
}

/// Builds a value transfer or an ERC-20 `transfer` call.
///
/// A priority fee switches from `gasPrice` to EIP-1559 fields with
/// `maxFeePerGas = gas price estimate + priority fee`. Returns the request
/// and the highest fee per gas it may pay.
#[allow(clippy::too_many_arguments)]
pub fn build_transaction(
    chain_id: u64,
    from: Address,
    to: Address,
    amount: U256,
    token: Option<&TokenConfig>,
    nonce: u64,
    estimate: &GasEstimate,
    priority_fee: Option<U256>,
) -> Result<(TransactionRequest, U256)> {
    let tx = TransactionRequest::default()
        .with_from(from)
        .with_nonce(nonce)
        .with_chain_id(chain_id)
        .with_gas_limit(estimate.gas_limit);

    let tx = match token {
        None => tx.with_to(to).with_value(amount),
        Some(token) => tx
            .with_to(token.address)
            .with_value(U256::ZERO)
            .with_input(IERC20::transferCall { to, amount }.abi_encode()),
    };

    match priority_fee {
        Some(priority_fee) => {
            let max_fee = estimate.gas_price + priority_fee;
            let tx = tx
                .with_max_fee_per_gas(to_u128(max_fee, "max fee per gas")?)
                .with_max_priority_fee_per_gas(to_u128(priority_fee, "priority fee")?);
            Ok((tx, max_fee))
        }
        None => {
            let tx = tx.with_gas_price(to_u128(estimate.gas_price, "gas price")?);
            Ok((tx, estimate.gas_price))
        }
    }
}
