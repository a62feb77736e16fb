//! State owned by one user session: the active network, the derived wallet
//! pool and the transaction history.

use std::sync::Arc;

use tracing::info;

use crate::{
    derivation::Wallet,
    error::{Result, WalletError},
    history::TransactionHistoryStore,
    network::NetworkContext,
};

#[derive(Debug)]
pub struct SessionContext {
    network: NetworkContext,
    wallets: Vec<Wallet>,
    history: Arc<TransactionHistoryStore>,
}

impl SessionContext {
    pub fn new(network: NetworkContext) -> Self {
        Self {
            network,
            wallets: Vec::new(),
            history: Arc::new(TransactionHistoryStore::new()),
        }
    }

    pub fn network(&self) -> &NetworkContext {
        &self.network
    }

    pub fn wallets(&self) -> &[Wallet] {
        &self.wallets
    }

    pub fn wallets_mut(&mut self) -> &mut [Wallet] {
        &mut self.wallets
    }

    /// Replaces the pool, erasing the keys of the previous one.
    pub fn set_wallets(&mut self, wallets: Vec<Wallet>) {
        self.erase_wallets();
        self.wallets = wallets;
    }

    /// Looks up a wallet by its 1-based index.
    pub fn wallet(&self, index: usize) -> Result<&Wallet> {
        self.wallets
            .iter()
            .find(|w| w.index == index)
            .ok_or(WalletError::WalletNotFound(index))
    }

    pub fn history(&self) -> &Arc<TransactionHistoryStore> {
        &self.history
    }

    /// Makes `network` active. Keys survive; every balance becomes unknown.
    pub fn switch_network(&mut self, network: NetworkContext) {
        info!(
            from = self.network.chain_id,
            to = network.chain_id,
            wallets = self.wallets.len(),
            "Switching network"
        );
        for wallet in &mut self.wallets {
            wallet.invalidate_balances();
        }
        self.network = network;
    }

    /// Zeroizes and drops every derived key.
    pub fn clear(&mut self) {
        let count = self.wallets.len();
        self.erase_wallets();
        self.wallets.clear();
        info!(count, "Cleared wallet pool");
    }

    fn erase_wallets(&mut self) {
        for wallet in &mut self.wallets {
            wallet.erase();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::wallets, types::BalanceState};
    use alloy::primitives::U256;

    fn polygon() -> NetworkContext {
        NetworkContext::new(137, "Polygon", "http://localhost:8545", "POL")
    }

    #[test]
    fn switching_network_keeps_keys_and_drops_balances() {
        let mut session = SessionContext::new(polygon());
        let mut pool = wallets(2);
        pool[0].native_balance = BalanceState::Known(U256::from(1u64));
        pool[1].token_balance = BalanceState::Error;
        session.set_wallets(pool);

        session.switch_network(NetworkContext::new(1, "Ethereum", "http://eth", "ETH"));

        assert_eq!(session.network().chain_id, 1);
        for wallet in session.wallets() {
            assert_eq!(wallet.native_balance, BalanceState::Unknown);
            assert_eq!(wallet.token_balance, BalanceState::Unknown);
            assert!(wallet.signer().is_ok());
        }
    }

    #[test]
    fn clear_removes_wallets() {
        let mut session = SessionContext::new(polygon());
        session.set_wallets(wallets(3));
        assert!(session.wallet(2).is_ok());

        session.clear();
        assert!(session.wallets().is_empty());
        assert!(matches!(session.wallet(2), Err(WalletError::WalletNotFound(2))));
    }
}
