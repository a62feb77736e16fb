pub mod balance;
pub mod execution;
pub mod gas;
pub mod progress;
pub mod transaction;

use alloy::primitives::{Address, U256};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    derivation::{KeyDerivationService, MAX_WALLETS},
    error::{Result, WalletError},
    export::{history_sheets, wallet_sheets, ExportSink},
    history::{HistoryStats, TransactionHistoryStore},
    network::NetworkContext,
    rpc::{AlloyRpc, ChainRpc},
    session::SessionContext,
    types::{
        Asset, MultiTransactionRequest, MultiTransactionResult, Topology, TransactionRecord,
        TxStatus,
    },
    utils::NATIVE_DECIMALS,
};

pub use self::{
    balance::{BalanceAggregator, BalanceEvent, BalanceSnapshot, BalanceTotals},
    execution::MultiTransactionOrchestrator,
    gas::{GasConfig, GasEstimate, GasEstimator, GasSpeed},
    progress::{NoopObserver, ProgressManager, ProgressObserver},
    transaction::TransactionExecutor,
};

/// Configuration for wallet operations loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Multiplier applied to the network gas price in auto mode
    pub gas_buffer_multiplier: f64,
    /// Attempts for a balance read before the wallet is marked as errored
    pub max_retries: u32,
    /// Pause between balance read attempts
    pub retry_delay: Duration,
    /// Attempts for a nonce read before the transfer fails
    pub nonce_retries: u32,
    pub nonce_retry_delay: Duration,
    /// Wallets checked concurrently per batch
    pub balance_concurrency: usize,
    /// Pause between balance batches
    pub batch_pause: Duration,
    /// Pause between fan-out legs
    pub fan_out_delay: Duration,
    /// Pause between fan-in legs
    pub fan_in_delay: Duration,
    /// Largest derivation range accepted in one call
    pub max_wallets: usize,
    /// Per-call RPC timeout; `None` leaves it to the transport
    pub rpc_timeout: Option<Duration>,
    pub wait_for_receipt: bool,
    pub confirmation_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gas_buffer_multiplier: 1.0,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            nonce_retries: 3,
            nonce_retry_delay: Duration::from_secs(1),
            balance_concurrency: 3,
            batch_pause: Duration::from_millis(500),
            fan_out_delay: Duration::from_secs(1),
            fan_in_delay: Duration::from_secs(2),
            max_wallets: MAX_WALLETS,
            rpc_timeout: None,
            wait_for_receipt: true,
            confirmation_timeout: Duration::from_secs(60),
            receipt_poll_interval: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Creates a new Config instance by loading values from environment variables.
    /// Unset variables keep their defaults. This should be called only once during startup.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let rpc_timeout = match dotenv::var("RPC_TIMEOUT") {
            Ok(value) => Some(parse_duration("RPC_TIMEOUT", &value)?),
            Err(_) => defaults.rpc_timeout,
        };

        let config = Self {
            gas_buffer_multiplier: env_or("GAS_BUFFER_MULTIPLIER", defaults.gas_buffer_multiplier)?,
            max_retries: env_or("MAX_RETRIES", defaults.max_retries)?,
            retry_delay: env_duration_or("RETRY_DELAY", defaults.retry_delay)?,
            nonce_retries: env_or("NONCE_RETRIES", defaults.nonce_retries)?,
            nonce_retry_delay: env_duration_or("NONCE_RETRY_DELAY", defaults.nonce_retry_delay)?,
            balance_concurrency: env_or("BALANCE_CONCURRENCY", defaults.balance_concurrency)?,
            batch_pause: env_duration_or("BATCH_PAUSE", defaults.batch_pause)?,
            fan_out_delay: env_duration_or("FAN_OUT_DELAY", defaults.fan_out_delay)?,
            fan_in_delay: env_duration_or("FAN_IN_DELAY", defaults.fan_in_delay)?,
            max_wallets: env_or("MAX_WALLETS", defaults.max_wallets)?,
            rpc_timeout,
            wait_for_receipt: env_or("WAIT_FOR_RECEIPT", defaults.wait_for_receipt)?,
            confirmation_timeout: env_duration_or(
                "CONFIRMATION_TIMEOUT",
                defaults.confirmation_timeout,
            )?,
            receipt_poll_interval: env_duration_or(
                "RECEIPT_POLL_INTERVAL",
                defaults.receipt_poll_interval,
            )?,
        };

        if config.gas_buffer_multiplier <= 0.0 {
            return Err(WalletError::InvalidEnvVar(
                "GAS_BUFFER_MULTIPLIER must be a positive number".to_string(),
            ));
        }
        if config.balance_concurrency == 0 {
            return Err(WalletError::InvalidEnvVar(
                "BALANCE_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match dotenv::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| WalletError::InvalidEnvVar(format!("{} has an invalid value {:?}", name, value))),
        Err(_) => Ok(default),
    }
}

fn env_duration_or(name: &str, default: Duration) -> Result<Duration> {
    match dotenv::var(name) {
        Ok(value) => parse_duration(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| WalletError::InvalidEnvVar(format!("{} must be a duration like 1s: {}", name, e)))
}

/// Owns one session and the components that act on it
pub struct WalletManager {
    pub config: Config,
    rpc: Arc<dyn ChainRpc>,
    session: SessionContext,
    derivation: KeyDerivationService,
    balance_aggregator: BalanceAggregator,
    executor: Arc<TransactionExecutor>,
    orchestrator: MultiTransactionOrchestrator,
}

impl WalletManager {
    /// Connects to the network's selected RPC endpoint
    ///
    /// # Arguments
    /// * `network` - Network to make active
    /// * `config` - Policy constants
    pub async fn connect(network: NetworkContext, config: Config) -> Result<Self> {
        let rpc = AlloyRpc::connect(&network.rpc_endpoint, config.rpc_timeout).await?;
        let chain_id = rpc.chain_id().await?;
        if chain_id != network.chain_id {
            return Err(WalletError::InvalidRequest(format!(
                "RPC endpoint reports chain {} but chain {} was requested",
                chain_id, network.chain_id
            )));
        }
        info!(chain_id, endpoint = %network.rpc_endpoint, "Connected to network");
        Ok(Self::with_rpc(network, Arc::new(rpc), config))
    }

    /// Builds a manager around an existing RPC client
    pub fn with_rpc(network: NetworkContext, rpc: Arc<dyn ChainRpc>, config: Config) -> Self {
        let executor = Arc::new(TransactionExecutor::new(rpc.clone(), config.clone()));
        Self {
            session: SessionContext::new(network),
            derivation: KeyDerivationService::new(config.max_wallets),
            balance_aggregator: BalanceAggregator::new(rpc.clone(), &config),
            orchestrator: MultiTransactionOrchestrator::new(executor.clone(), &config),
            executor,
            rpc,
            config,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn network(&self) -> &NetworkContext {
        self.session.network()
    }

    pub fn history(&self) -> &Arc<TransactionHistoryStore> {
        self.session.history()
    }

    /// Derives wallets `start_index..=end_index` and makes them the session pool
    pub fn generate_wallets(
        &mut self,
        seed_phrase: &str,
        start_index: u32,
        end_index: u32,
    ) -> Result<usize> {
        let wallets = self
            .derivation
            .derive_wallets(seed_phrase, start_index, end_index)?;
        let count = wallets.len();
        self.session.set_wallets(wallets);
        Ok(count)
    }

    /// Refreshes balances of every wallet in the pool
    pub async fn check_all_balances(
        &mut self,
        on_progress: &(dyn Fn(BalanceEvent) + Send + Sync),
    ) -> Vec<BalanceSnapshot> {
        let network = self.session.network().clone();
        self.balance_aggregator
            .check_all_balances(self.session.wallets_mut(), &network, on_progress)
            .await
    }

    pub fn totals(&self) -> BalanceTotals {
        BalanceAggregator::totals(self.session.wallets())
    }

    pub async fn estimate_gas(
        &self,
        asset: Asset,
        transaction_count: usize,
        gas: &GasConfig,
    ) -> Result<GasEstimate> {
        self.executor
            .gas_estimator()
            .estimate(asset, transaction_count, gas)
            .await
    }

    /// Sends a single transfer from wallet `from_index` and records it
    pub async fn send(
        &self,
        from_index: usize,
        to: Address,
        amount: U256,
        asset: Asset,
        gas: &GasConfig,
    ) -> Result<TransactionRecord> {
        let network = self.session.network();
        let wallet = self.session.wallet(from_index)?;
        let outcome = self
            .executor
            .execute(network, wallet, to, amount, asset, gas)
            .await?;

        let (token, decimals) = match (asset, &network.token) {
            (Asset::Token, Some(token)) => (token.symbol.clone(), token.decimals),
            _ => (network.native_currency_symbol.clone(), NATIVE_DECIMALS),
        };
        let record = TransactionRecord {
            topology: Topology::FanOut,
            from: wallet.address,
            to,
            token,
            amount,
            decimals,
            gas_fee: outcome.gas_fee,
            status: if outcome.success {
                TxStatus::Success
            } else {
                TxStatus::Failed
            },
            tx_hash: outcome.tx_hash,
            error_message: outcome.error,
            chain_id: network.chain_id,
            timestamp: Utc::now(),
        };
        self.session.history().append(record.clone());
        Ok(record)
    }

    pub async fn execute_multi_transaction(
        &self,
        request: &MultiTransactionRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<MultiTransactionResult> {
        self.orchestrator
            .execute_multi_transaction(&self.session, request, observer)
            .await
    }

    /// Switches to `network`, reconnecting the RPC client. Keys are kept,
    /// balances reset.
    pub async fn switch_network(&mut self, network: NetworkContext) -> Result<()> {
        let rpc = AlloyRpc::connect(&network.rpc_endpoint, self.config.rpc_timeout).await?;
        self.replace_rpc(network, Arc::new(rpc));
        Ok(())
    }

    /// Switches network with an already built RPC client
    pub fn replace_rpc(&mut self, network: NetworkContext, rpc: Arc<dyn ChainRpc>) {
        self.session.switch_network(network);
        self.executor = Arc::new(TransactionExecutor::new(rpc.clone(), self.config.clone()));
        self.balance_aggregator = BalanceAggregator::new(rpc.clone(), &self.config);
        self.orchestrator = MultiTransactionOrchestrator::new(self.executor.clone(), &self.config);
        self.rpc = rpc;
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    /// Erases every key of the session
    pub fn clear_wallets(&mut self) {
        self.session.clear();
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.session.history().stats()
    }

    /// Hands the wallet list and totals to `sink`
    pub fn export_wallets(&self, sink: &dyn ExportSink) -> Result<()> {
        let sheets = wallet_sheets(self.session.wallets(), self.session.network(), &self.totals());
        sink.write_sheets("wallets", &sheets)
    }

    /// Hands the transaction history and summary to `sink`
    pub fn export_history(&self, sink: &dyn ExportSink) -> Result<()> {
        let history = self.session.history();
        let sheets = history_sheets(&history.all(), &history.stats());
        sink.write_sheets("transactions", &sheets)
    }
}
