use std::sync::Arc;

use alloy::primitives::U256;
use tracing::debug;

use crate::{
    error::Result,
    rpc::ChainRpc,
    types::Asset,
    utils::{format_amount, scale, GAS_LIMIT, NATIVE_DECIMALS, TOKEN_GAS_LIMIT},
};

/// Speed preset applied on top of the network gas price in auto mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GasSpeed {
    Slow,
    #[default]
    Standard,
    Fast,
}

impl GasSpeed {
    pub fn multiplier(&self) -> f64 {
        match self {
            GasSpeed::Slow => 0.8,
            GasSpeed::Standard => 1.0,
            GasSpeed::Fast => 1.5,
        }
    }
}

impl std::str::FromStr for GasSpeed {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slow" => Ok(GasSpeed::Slow),
            "standard" => Ok(GasSpeed::Standard),
            "fast" => Ok(GasSpeed::Fast),
            other => Err(format!("unknown gas speed {:?}", other)),
        }
    }
}

/// How gas parameters are chosen for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasConfig {
    /// Network gas price scaled by the configured buffer and the speed preset
    Auto { speed: GasSpeed },
    /// Operator-supplied values; `gas_limit` falls back to the asset default
    Custom {
        /// Wei per gas
        gas_price: U256,
        gas_limit: Option<u64>,
        /// Wei per gas; a non-zero value switches to EIP-1559 fee fields
        priority_fee: Option<U256>,
    },
}

impl Default for GasConfig {
    fn default() -> Self {
        GasConfig::Auto {
            speed: GasSpeed::Standard,
        }
    }
}

impl GasConfig {
    pub fn priority_fee(&self) -> Option<U256> {
        match self {
            GasConfig::Custom {
                priority_fee: Some(fee),
                ..
            } if !fee.is_zero() => Some(*fee),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimate {
    /// Wei per gas
    pub gas_price: U256,
    pub gas_limit: u64,
    /// `gas_limit * gas_price`, in wei
    pub gas_per_transaction: U256,
    /// `gas_per_transaction * count`, in wei
    pub total_gas_fee: U256,
}

impl GasEstimate {
    /// Total fee in the native currency, e.g. `"0.00315"`
    pub fn total_gas_fee_native(&self) -> String {
        format_amount(self.total_gas_fee, NATIVE_DECIMALS)
    }
}

/// Default gas limit by asset
pub fn default_gas_limit(asset: Asset) -> u64 {
    match asset {
        Asset::Native => GAS_LIMIT,
        Asset::Token => TOKEN_GAS_LIMIT,
    }
}

/// Computes per-transaction and batch gas costs.
pub struct GasEstimator {
    rpc: Arc<dyn ChainRpc>,
    buffer_multiplier: f64,
}

impl GasEstimator {
    pub fn new(rpc: Arc<dyn ChainRpc>, buffer_multiplier: f64) -> Self {
        Self {
            rpc,
            buffer_multiplier,
        }
    }

    /// Estimates the cost of `transaction_count` transfers of `asset`.
    ///
    /// Auto mode reads the current gas price once; custom mode makes no RPC call.
    pub async fn estimate(
        &self,
        asset: Asset,
        transaction_count: usize,
        config: &GasConfig,
    ) -> Result<GasEstimate> {
        let (gas_price, gas_limit) = match config {
            GasConfig::Auto { speed } => {
                let network_price = self.rpc.gas_price().await?;
                let buffered = scale(network_price, self.buffer_multiplier);
                (scale(buffered, speed.multiplier()), default_gas_limit(asset))
            }
            GasConfig::Custom {
                gas_price,
                gas_limit,
                ..
            } => (*gas_price, gas_limit.unwrap_or_else(|| default_gas_limit(asset))),
        };

        let gas_per_transaction = U256::from(gas_limit) * gas_price;
        let estimate = GasEstimate {
            gas_price,
            gas_limit,
            gas_per_transaction,
            total_gas_fee: gas_per_transaction * U256::from(transaction_count),
        };

        debug!(
            ?asset,
            transaction_count,
            gas_price = %estimate.gas_price,
            gas_limit,
            total = %estimate.total_gas_fee_native(),
            "Gas estimate"
        );
        Ok(estimate)
    }
}
