//! Core type definitions for multi-transaction execution.
//!
//! This module contains the records produced by transfers, the requests
//! accepted by the orchestrator, and the statistics reported while a batch runs.

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tokio::time::{Duration, Instant};

use crate::{
    utils::{format_amount, NATIVE_DECIMALS},
    wallet::gas::GasConfig,
};

/// Shape of a multi-transaction batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// One sender, many receivers ("multi-send")
    FanOut,
    /// Many senders, one receiver ("multi-receive")
    FanIn,
}

impl Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::FanOut => write!(f, "fan-out"),
            Topology::FanIn => write!(f, "fan-in"),
        }
    }
}

/// What a transfer moves: the chain's native currency or the active network's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Native,
    Token,
}

/// Tri-state balance: never checked, last check failed, or known in base units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BalanceState {
    #[default]
    Unknown,
    Error,
    Known(U256),
}

impl BalanceState {
    pub fn known(&self) -> Option<U256> {
        match self {
            BalanceState::Known(value) => Some(*value),
            _ => None,
        }
    }

    /// Human-readable form used for exports and logs.
    pub fn display(&self, decimals: u8) -> String {
        match self {
            BalanceState::Unknown => String::new(),
            BalanceState::Error => "error".to_string(),
            BalanceState::Known(value) => format_amount(*value, decimals),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Failed,
}

/// One completed leg of a batch. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub topology: Topology,
    pub from: Address,
    pub to: Address,
    /// Symbol of the transferred asset
    pub token: String,
    /// Amount in the asset's base units
    pub amount: U256,
    pub decimals: u8,
    /// Fee in wei of the native currency
    pub gas_fee: U256,
    pub status: TxStatus,
    pub tx_hash: Option<TxHash>,
    pub error_message: Option<String>,
    pub chain_id: u64,
    pub timestamp: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }

    pub fn amount_display(&self) -> String {
        format_amount(self.amount, self.decimals)
    }

    pub fn gas_fee_display(&self) -> String {
        format_amount(self.gas_fee, NATIVE_DECIMALS)
    }
}

impl Display for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} from {} to {}: {:?}",
            self.topology,
            self.amount_display(),
            self.token,
            self.from,
            self.to,
            self.status
        )
    }
}

/// The other side of each leg: a wallet of the session pool or a raw address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counterparty {
    /// 1-based index into the session's wallet pool
    Wallet(usize),
    Address(Address),
}

/// Transient input to the orchestrator.
#[derive(Debug, Clone)]
pub struct MultiTransactionRequest {
    pub topology: Topology,
    pub asset: Asset,
    /// 1-based index of the single sender (fan-out) or receiver (fan-in)
    pub fixed_wallet: usize,
    pub counterparties: Vec<Counterparty>,
    /// Base units of `asset` moved by every leg
    pub amount_per_transfer: U256,
    pub gas: GasConfig,
}

/// Outcome of a single transfer as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    pub tx_hash: Option<TxHash>,
    /// Fee in wei; zero when nothing reached the chain
    pub gas_fee: U256,
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            gas_fee: U256::ZERO,
            error: Some(error.into()),
        }
    }
}

/// Result of a whole multi-transaction batch.
#[derive(Debug, Clone, Default)]
pub struct MultiTransactionResult {
    pub transactions: Vec<TransactionRecord>,
    pub successful_count: usize,
    pub failed_count: usize,
    /// Sum of leg fees in wei
    pub total_gas_used: U256,
    pub time_elapsed: Duration,
}

/// Running counters for a batch in progress.
#[derive(Debug, Clone)]
pub struct ProgressStats {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub successful_operations: usize,
    pub started_at: Instant,
}

impl ProgressStats {
    pub fn new(total_operations: usize) -> Self {
        Self {
            total_operations,
            completed_operations: 0,
            successful_operations: 0,
            started_at: Instant::now(),
        }
    }

    /// Percentage of completed operations that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.completed_operations == 0 {
            return 0.0;
        }
        self.successful_operations as f64 / self.completed_operations as f64 * 100.0
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_operations == 0 {
            return 100.0;
        }
        self.completed_operations as f64 / self.total_operations as f64 * 100.0
    }

    pub fn operations_per_minute(&self) -> f64 {
        let minutes = self.started_at.elapsed().as_secs_f64() / 60.0;
        if minutes <= f64::EPSILON {
            return 0.0;
        }
        self.completed_operations as f64 / minutes
    }

    /// Linear extrapolation from the average time per completed operation
    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        if self.completed_operations == 0 {
            return None;
        }
        let remaining = self
            .total_operations
            .saturating_sub(self.completed_operations);
        let per_operation = self.started_at.elapsed() / self.completed_operations as u32;
        Some(per_operation * remaining as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_state_display() {
        assert_eq!(BalanceState::Unknown.display(18), "");
        assert_eq!(BalanceState::Error.display(18), "error");
        assert_eq!(
            BalanceState::Known(U256::from(2_500_000u64)).display(6),
            "2.5"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn progress_stats_rates() {
        let mut stats = ProgressStats::new(4);
        assert_eq!(stats.estimated_time_remaining(), None);

        tokio::time::advance(Duration::from_secs(60)).await;
        stats.completed_operations = 2;
        stats.successful_operations = 1;

        assert_eq!(stats.success_rate(), 50.0);
        assert_eq!(stats.progress_percent(), 50.0);
        assert!((stats.operations_per_minute() - 2.0).abs() < 1e-9);
        assert_eq!(
            stats.estimated_time_remaining(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn topology_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Topology::FanOut).unwrap(),
            "\"fan-out\""
        );
        assert_eq!(Topology::FanIn.to_string(), "fan-in");
    }
}
