use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use futures::future;
use tracing::{info, warn};

use crate::{
    derivation::Wallet,
    error::Result,
    network::NetworkContext,
    rpc::ChainRpc,
    types::BalanceState,
    utils::retry_with,
};

use super::Config;

/// Balances of one wallet after a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub index: usize,
    pub address: Address,
    pub native: BalanceState,
    pub token: BalanceState,
    pub checked_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn is_error(&self) -> bool {
        self.native == BalanceState::Error || self.token == BalanceState::Error
    }
}

/// Per-wallet progress of a balance sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceEvent {
    Checking { index: usize, address: Address },
    Completed(BalanceSnapshot),
    Error(BalanceSnapshot),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceTotals {
    pub wallet_count: usize,
    /// Wei of the native currency
    pub total_native: U256,
    /// Base units of the configured token
    pub total_token: U256,
    pub timestamp: DateTime<Utc>,
}

/// Queries native and token balances with bounded concurrency and retries.
pub struct BalanceAggregator {
    rpc: Arc<dyn ChainRpc>,
    max_retries: u32,
    retry_delay: Duration,
    concurrency: usize,
    batch_pause: Duration,
}

impl BalanceAggregator {
    pub fn new(rpc: Arc<dyn ChainRpc>, config: &Config) -> Self {
        Self {
            rpc,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            concurrency: config.balance_concurrency.max(1),
            batch_pause: config.batch_pause,
        }
    }

    /// Reads the native balance, then the token balance, of `address`.
    ///
    /// Transient failures are retried; anything else fails at once.
    pub async fn check_balance(
        &self,
        address: Address,
        network: &NetworkContext,
    ) -> Result<(U256, U256)> {
        let native = retry_with(
            "native balance",
            self.max_retries,
            self.retry_delay,
            |e| e.is_transient(),
            || self.rpc.native_balance(address),
        )
        .await?;

        let token = match &network.token {
            None => U256::ZERO,
            Some(token) => {
                let code = retry_with(
                    "token code",
                    self.max_retries,
                    self.retry_delay,
                    |e| e.is_transient(),
                    || self.rpc.code_at(token.address),
                )
                .await?;

                if code.is_empty() {
                    // no contract, treat as an empty balance so native checks still work
                    U256::ZERO
                } else {
                    retry_with(
                        "token balance",
                        self.max_retries,
                        self.retry_delay,
                        |e| e.is_transient(),
                        || self.rpc.token_balance(token.address, address),
                    )
                    .await?
                }
            }
        };

        Ok((native, token))
    }

    async fn check_one(
        &self,
        index: usize,
        address: Address,
        network: &NetworkContext,
        on_progress: &(dyn Fn(BalanceEvent) + Send + Sync),
    ) -> BalanceSnapshot {
        on_progress(BalanceEvent::Checking { index, address });

        match self.check_balance(address, network).await {
            Ok((native, token)) => {
                let snapshot = BalanceSnapshot {
                    index,
                    address,
                    native: BalanceState::Known(native),
                    token: BalanceState::Known(token),
                    checked_at: Utc::now(),
                };
                on_progress(BalanceEvent::Completed(snapshot.clone()));
                snapshot
            }
            Err(e) => {
                warn!(index, %address, error = %e, "Balance check failed");
                let snapshot = BalanceSnapshot {
                    index,
                    address,
                    native: BalanceState::Error,
                    token: BalanceState::Error,
                    checked_at: Utc::now(),
                };
                on_progress(BalanceEvent::Error(snapshot.clone()));
                snapshot
            }
        }
    }

    /// Checks every wallet in fixed-size concurrent batches and stores the
    /// results on the wallets. Per-wallet failures become `BalanceState::Error`.
    pub async fn check_all_balances(
        &self,
        wallets: &mut [Wallet],
        network: &NetworkContext,
        on_progress: &(dyn Fn(BalanceEvent) + Send + Sync),
    ) -> Vec<BalanceSnapshot> {
        let targets: Vec<(usize, Address)> = wallets.iter().map(|w| (w.index, w.address)).collect();
        let batch_count = targets.len().div_ceil(self.concurrency);
        let mut snapshots = Vec::with_capacity(targets.len());

        for (batch_number, batch) in targets.chunks(self.concurrency).enumerate() {
            let checks = batch
                .iter()
                .map(|(index, address)| self.check_one(*index, *address, network, on_progress));
            let results = future::join_all(checks).await;

            for snapshot in results {
                if let Some(wallet) = wallets.iter_mut().find(|w| w.index == snapshot.index) {
                    wallet.native_balance = snapshot.native;
                    wallet.token_balance = snapshot.token;
                    wallet.last_checked_at = Some(snapshot.checked_at);
                }
                snapshots.push(snapshot);
            }

            if batch_number + 1 < batch_count {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        let failed = snapshots.iter().filter(|s| s.is_error()).count();
        info!(
            checked = snapshots.len(),
            failed,
            chain_id = network.chain_id,
            "Balance check completed"
        );
        snapshots
    }

    /// Sums wallets whose native and token balances are both known.
    /// `wallet_count` covers every wallet.
    pub fn totals(wallets: &[Wallet]) -> BalanceTotals {
        let mut total_native = U256::ZERO;
        let mut total_token = U256::ZERO;
        for wallet in wallets {
            if let (Some(native), Some(token)) =
                (wallet.native_balance.known(), wallet.token_balance.known())
            {
                total_native += native;
                total_token += token;
            }
        }
        BalanceTotals {
            wallet_count: wallets.len(),
            total_native,
            total_token,
            timestamp: Utc::now(),
        }
    }
}
