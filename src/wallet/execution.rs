use alloy::primitives::{Address, U256};
use chrono::Utc;
use futures::future;
use std::{sync::Arc, time::Duration};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    derivation::Wallet,
    error::{Result, Shortfall, WalletError},
    session::SessionContext,
    types::{
        Asset, Counterparty, MultiTransactionRequest, MultiTransactionResult, Topology,
        TransactionRecord, TxStatus,
    },
    utils::{format_amount, retry_with, NATIVE_DECIMALS},
};

use super::{
    progress::{ProgressManager, ProgressObserver},
    transaction::TransactionExecutor,
    Config,
};

/// One resolved transfer of a batch
struct Leg<'a> {
    sender: &'a Wallet,
    to: Address,
}

/// Runs fan-out and fan-in batches one transfer at a time
pub struct MultiTransactionOrchestrator {
    executor: Arc<TransactionExecutor>,
    fan_out_delay: Duration,
    fan_in_delay: Duration,
    /// Pre-flight balance reads use the same retry and batching policy as balance checks
    max_retries: u32,
    retry_delay: Duration,
    balance_concurrency: usize,
}

impl MultiTransactionOrchestrator {
    /// Creates a new MultiTransactionOrchestrator
    pub fn new(executor: Arc<TransactionExecutor>, config: &Config) -> Self {
        Self {
            executor,
            fan_out_delay: config.fan_out_delay,
            fan_in_delay: config.fan_in_delay,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            balance_concurrency: config.balance_concurrency.max(1),
        }
    }

    fn delay_for(&self, topology: Topology) -> Duration {
        match topology {
            Topology::FanOut => self.fan_out_delay,
            Topology::FanIn => self.fan_in_delay,
        }
    }

    /// Executes every leg of `request` strictly in list order.
    ///
    /// Each leg is recorded in the session history whether it succeeds or
    /// not, and a failed leg never stops the ones after it. Errors are only
    /// returned for malformed requests and for a fan-in whose pre-flight
    /// balance check finds a short sender, in which case nothing is sent.
    pub async fn execute_multi_transaction(
        &self,
        session: &SessionContext,
        request: &MultiTransactionRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<MultiTransactionResult> {
        let span = info_span!(
            "multi_transaction",
            topology = %request.topology,
            legs = request.counterparties.len()
        );
        self.run(session, request, observer).instrument(span).await
    }

    async fn run(
        &self,
        session: &SessionContext,
        request: &MultiTransactionRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<MultiTransactionResult> {
        let start_time = tokio::time::Instant::now();
        let network = session.network();
        let legs = resolve_legs(session, request)?;

        if request.topology == Topology::FanIn {
            self.pre_flight_check(session, &legs, request).await?;
        }

        let (symbol, decimals) = match (request.asset, &network.token) {
            (Asset::Token, Some(token)) => (token.symbol.clone(), token.decimals),
            _ => (network.native_currency_symbol.clone(), NATIVE_DECIMALS),
        };

        let total = legs.len();
        let delay = self.delay_for(request.topology);
        let mut progress_manager = ProgressManager::new(total, observer);
        let mut result = MultiTransactionResult::default();

        for (position, leg) in legs.iter().enumerate() {
            let description = format!(
                "Transfer {} {} from wallet #{} ({}) to {}",
                format_amount(request.amount_per_transfer, decimals),
                symbol,
                leg.sender.index,
                leg.sender.address,
                leg.to
            );
            progress_manager.leg_started(position + 1, &description);

            let outcome = self
                .executor
                .execute(
                    network,
                    leg.sender,
                    leg.to,
                    request.amount_per_transfer,
                    request.asset,
                    &request.gas,
                )
                .await?;

            let record = TransactionRecord {
                topology: request.topology,
                from: leg.sender.address,
                to: leg.to,
                token: symbol.clone(),
                amount: request.amount_per_transfer,
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

            session.history().append(record.clone());
            if record.is_success() {
                result.successful_count += 1;
            } else {
                result.failed_count += 1;
            }
            result.total_gas_used += record.gas_fee;
            progress_manager.leg_completed(&record);
            result.transactions.push(record);

            if position + 1 < total {
                tokio::time::sleep(delay).await;
            }
        }

        result.time_elapsed = start_time.elapsed();
        progress_manager.print_statistics(&result);
        Ok(result)
    }

    /// Verifies every fan-in sender holds the total it sends across all of
    /// its legs. Any shortfall, or a balance still unreadable after retries,
    /// aborts the whole batch.
    async fn pre_flight_check(
        &self,
        session: &SessionContext,
        legs: &[Leg<'_>],
        request: &MultiTransactionRequest,
    ) -> Result<()> {
        let network = session.network();

        // one entry per distinct sender, in order of first appearance
        let mut senders: Vec<(&Wallet, U256)> = Vec::new();
        for leg in legs {
            match senders.iter_mut().find(|(w, _)| w.index == leg.sender.index) {
                Some((_, required)) => {
                    *required = required.saturating_add(request.amount_per_transfer)
                }
                None => senders.push((leg.sender, request.amount_per_transfer)),
            }
        }

        let mut shortfalls = Vec::new();
        for batch in senders.chunks(self.balance_concurrency) {
            let checks = batch.iter().map(|(sender, required)| async move {
                let balance = retry_with(
                    "pre-flight balance",
                    self.max_retries,
                    self.retry_delay,
                    |e| e.is_transient(),
                    || {
                        self.executor
                            .get_wallet_balance(sender.address, request.asset, network)
                    },
                )
                .await;
                (*sender, *required, balance)
            });

            for (sender, required, balance) in future::join_all(checks).await {
                let available = match balance {
                    Ok(balance) if balance >= required => continue,
                    Ok(balance) => Some(balance),
                    Err(e) => {
                        warn!(index = sender.index, error = %e, "Pre-flight balance read failed");
                        None
                    }
                };
                shortfalls.push(Shortfall {
                    index: sender.index,
                    address: sender.address,
                    required,
                    available,
                });
            }
        }

        if shortfalls.is_empty() {
            info!(senders = senders.len(), "Pre-flight check passed");
            return Ok(());
        }

        warn!(
            short = shortfalls.len(),
            senders = senders.len(),
            "Pre-flight check failed, no transactions sent"
        );
        Err(WalletError::PreflightFailed(shortfalls))
    }
}

/// Turns a request into an ordered list of sender/recipient pairs,
/// rejecting anything that cannot be executed as a whole.
fn resolve_legs<'a>(
    session: &'a SessionContext,
    request: &MultiTransactionRequest,
) -> Result<Vec<Leg<'a>>> {
    if request.counterparties.is_empty() {
        return Err(WalletError::InvalidRequest(
            "at least one counterparty is required".to_string(),
        ));
    }
    if request.amount_per_transfer == U256::ZERO {
        return Err(WalletError::InvalidRequest(
            "amount per transfer must be greater than zero".to_string(),
        ));
    }
    if request.asset == Asset::Token && session.network().token.is_none() {
        return Err(WalletError::InvalidRequest(format!(
            "No token configured for chain {}",
            session.network().chain_id
        )));
    }

    let fixed = session.wallet(request.fixed_wallet)?;
    request
        .counterparties
        .iter()
        .map(|counterparty| {
            let leg = match (request.topology, counterparty) {
                (Topology::FanOut, Counterparty::Wallet(index)) => Leg {
                    sender: fixed,
                    to: session.wallet(*index)?.address,
                },
                (Topology::FanOut, Counterparty::Address(address)) => Leg {
                    sender: fixed,
                    to: *address,
                },
                (Topology::FanIn, Counterparty::Wallet(index)) => Leg {
                    sender: session.wallet(*index)?,
                    to: fixed.address,
                },
                (Topology::FanIn, Counterparty::Address(address)) => {
                    return Err(WalletError::InvalidRequest(format!(
                        "fan-in sender {} is not a derived wallet",
                        address
                    )))
                }
            };
            if leg.sender.address == leg.to {
                return Err(WalletError::InvalidRequest(format!(
                    "wallet #{} cannot transfer to itself",
                    leg.sender.index
                )));
            }
            Ok(leg)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        network::{NetworkContext, TokenConfig},
        testing::{wallets, MockRpc, RpcEvent},
        utils::gwei,
        wallet::gas::GasConfig,
    };
    use parking_lot::Mutex;

    fn session(count: u32) -> SessionContext {
        let mut session = SessionContext::new(NetworkContext::new(
            137,
            "Polygon",
            "http://localhost:8545",
            "POL",
        ));
        session.set_wallets(wallets(count));
        session
    }

    fn orchestrator(rpc: Arc<MockRpc>) -> MultiTransactionOrchestrator {
        let config = Config::default();
        let executor = Arc::new(TransactionExecutor::new(rpc, config.clone()));
        MultiTransactionOrchestrator::new(executor, &config)
    }

    fn request(
        topology: Topology,
        fixed_wallet: usize,
        counterparties: Vec<Counterparty>,
        amount: u64,
    ) -> MultiTransactionRequest {
        MultiTransactionRequest {
            topology,
            asset: Asset::Native,
            fixed_wallet,
            counterparties,
            amount_per_transfer: U256::from(amount),
            gas: GasConfig::Custom {
                gas_price: gwei(30),
                gas_limit: None,
                priority_fee: None,
            },
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ProgressObserver for Recorder {
        fn on_leg_start(&self, index: usize, total: usize, _description: &str) {
            self.events.lock().push(format!("start {}/{}", index, total));
        }

        fn on_leg_complete(&self, record: &TransactionRecord) {
            self.events
                .lock()
                .push(format!("done {} {:?}", record.to, record.status));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_continues_past_failure() {
        let rpc = Arc::new(MockRpc::new());
        let session = session(4);
        rpc.set_native(session.wallets()[0].address, U256::from(1_000u64));
        rpc.fail_send(2);

        let external = Address::repeat_byte(0x42);
        let request = request(
            Topology::FanOut,
            1,
            vec![
                Counterparty::Wallet(2),
                Counterparty::Address(external),
                Counterparty::Wallet(4),
            ],
            10,
        );
        let recorder = Recorder::default();
        let result = orchestrator(rpc.clone())
            .execute_multi_transaction(&session, &request, &recorder)
            .await
            .unwrap();

        assert_eq!(result.successful_count, 2);
        assert_eq!(result.failed_count, 1);
        assert_eq!(rpc.send_calls(), 3);

        let history = session.history().all();
        let recipients: Vec<_> = history.iter().map(|r| r.to).collect();
        assert_eq!(
            recipients,
            vec![session.wallets()[1].address, external, session.wallets()[3].address]
        );
        assert_eq!(history[1].status, TxStatus::Failed);
        assert!(history[1].error_message.is_some());
        assert_eq!(history[1].gas_fee, U256::ZERO);
        assert_eq!(result.total_gas_used, rpc.receipt_fee() * U256::from(2u64));
        assert!(history.iter().all(|r| r.topology == Topology::FanOut && r.token == "POL"));

        let events = recorder.events.into_inner();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], "start 1/3");
        assert_eq!(events[4], "start 3/3");
    }

    #[tokio::test(start_paused = true)]
    async fn legs_run_strictly_in_order_with_delay() {
        let rpc = Arc::new(MockRpc::new());
        let session = session(4);
        rpc.set_native(session.wallets()[0].address, U256::from(1_000u64));

        let request = request(
            Topology::FanOut,
            1,
            vec![
                Counterparty::Wallet(2),
                Counterparty::Wallet(3),
                Counterparty::Wallet(4),
            ],
            10,
        );
        orchestrator(rpc.clone())
            .execute_multi_transaction(&session, &request, &crate::wallet::NoopObserver)
            .await
            .unwrap();

        let sends: Vec<_> = rpc
            .events()
            .into_iter()
            .filter(|(_, e)| matches!(e, RpcEvent::SendStart(_) | RpcEvent::SendEnd(_)))
            .collect();
        let order: Vec<_> = sends.iter().map(|(_, e)| *e).collect();
        assert_eq!(
            order,
            vec![
                RpcEvent::SendStart(1),
                RpcEvent::SendEnd(1),
                RpcEvent::SendStart(2),
                RpcEvent::SendEnd(2),
                RpcEvent::SendStart(3),
                RpcEvent::SendEnd(3),
            ]
        );

        let delay = Config::default().fan_out_delay;
        for pair in sends.windows(2) {
            if let ((end_at, RpcEvent::SendEnd(_)), (start_at, RpcEvent::SendStart(_))) =
                (&pair[0], &pair[1])
            {
                assert!(*start_at - *end_at >= delay);
            }
        }

        // nonces are read once per leg, after the previous leg finished
        let nonces = rpc
            .events()
            .iter()
            .filter(|(_, e)| matches!(e, RpcEvent::Nonce(_)))
            .count();
        assert_eq!(nonces, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fan_in_aborts_on_shortfall() {
        let rpc = Arc::new(MockRpc::new());
        let session = session(4);
        let pool = session.wallets();
        rpc.set_native(pool[1].address, U256::from(100u64));
        rpc.set_native(pool[2].address, U256::from(5u64));
        rpc.set_native(pool[3].address, U256::from(100u64));

        let request = request(
            Topology::FanIn,
            1,
            vec![
                Counterparty::Wallet(2),
                Counterparty::Wallet(3),
                Counterparty::Wallet(4),
            ],
            10,
        );
        let err = orchestrator(rpc.clone())
            .execute_multi_transaction(&session, &request, &crate::wallet::NoopObserver)
            .await
            .unwrap_err();

        match err {
            WalletError::PreflightFailed(shortfalls) => {
                assert_eq!(
                    shortfalls,
                    vec![Shortfall {
                        index: 3,
                        address: pool[2].address,
                        required: U256::from(10u64),
                        available: Some(U256::from(5u64)),
                    }]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rpc.send_calls(), 0);
        assert!(session.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fan_in_totals_repeated_sender() {
        let rpc = Arc::new(MockRpc::new());
        let session = session(3);
        let sender = session.wallets()[1].address;
        rpc.set_native(sender, U256::from(15u64));

        let request = request(
            Topology::FanIn,
            1,
            vec![Counterparty::Wallet(2), Counterparty::Wallet(2)],
            10,
        );
        let err = orchestrator(rpc.clone())
            .execute_multi_transaction(&session, &request, &crate::wallet::NoopObserver)
            .await
            .unwrap_err();

        match err {
            WalletError::PreflightFailed(shortfalls) => {
                assert_eq!(
                    shortfalls,
                    vec![Shortfall {
                        index: 2,
                        address: sender,
                        required: U256::from(20u64),
                        available: Some(U256::from(15u64)),
                    }]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rpc.send_calls(), 0);
        assert!(session.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fan_in_pre_flight_retries_transient_reads_in_batches() {
        let rpc = Arc::new(MockRpc::new());
        let session = session(5);
        for wallet in session.wallets() {
            rpc.set_native(wallet.address, U256::from(100u64));
        }
        let first = session.wallets()[1].address;
        let last = session.wallets()[4].address;
        rpc.fail_native(first, 1, true);

        let request = request(
            Topology::FanIn,
            1,
            vec![
                Counterparty::Wallet(2),
                Counterparty::Wallet(3),
                Counterparty::Wallet(4),
                Counterparty::Wallet(5),
            ],
            10,
        );
        let started = tokio::time::Instant::now();
        let result = orchestrator(rpc.clone())
            .execute_multi_transaction(&session, &request, &crate::wallet::NoopObserver)
            .await
            .unwrap();
        assert_eq!(result.successful_count, 4);
        assert_eq!(rpc.send_calls(), 4);

        // senders 2..=4 form the first read batch; sender 5 waits for the retry
        let config = Config::default();
        let first_read_of_last = rpc
            .events()
            .into_iter()
            .find(|(_, e)| *e == RpcEvent::NativeBalance(last))
            .map(|(at, _)| at)
            .unwrap();
        assert!(first_read_of_last - started >= config.retry_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn fan_in_collects_from_every_sender() {
        let rpc = Arc::new(MockRpc::new());
        let token = TokenConfig::new("USDT", Address::repeat_byte(0x77), 6);
        rpc.deploy(token.address);
        let mut session = session(3);
        session.switch_network(session.network().clone().with_token(token));
        for wallet in session.wallets() {
            rpc.set_native(wallet.address, U256::from(10u64.pow(18)));
            rpc.set_token(wallet.address, U256::from(2_000_000u64));
        }

        let mut request = request(
            Topology::FanIn,
            1,
            vec![Counterparty::Wallet(2), Counterparty::Wallet(3)],
            1_500_000,
        );
        request.asset = Asset::Token;

        let started = tokio::time::Instant::now();
        let result = orchestrator(rpc.clone())
            .execute_multi_transaction(&session, &request, &crate::wallet::NoopObserver)
            .await
            .unwrap();

        assert_eq!(result.successful_count, 2);
        assert_eq!(result.failed_count, 0);
        assert!(started.elapsed() >= Config::default().fan_in_delay);

        let history = session.history().all();
        assert_eq!(history[0].from, session.wallets()[1].address);
        assert_eq!(history[1].from, session.wallets()[2].address);
        assert!(history
            .iter()
            .all(|r| r.to == session.wallets()[0].address && r.token == "USDT"));
        assert_eq!(history[0].amount_display(), "1.5");
    }

    #[tokio::test]
    async fn rejects_structural_errors() {
        let rpc = Arc::new(MockRpc::new());
        let session = session(2);
        let orchestrator = orchestrator(rpc.clone());
        let noop = crate::wallet::NoopObserver;

        let missing = request(Topology::FanOut, 9, vec![Counterparty::Wallet(2)], 1);
        assert!(matches!(
            orchestrator.execute_multi_transaction(&session, &missing, &noop).await,
            Err(WalletError::WalletNotFound(9))
        ));

        let raw_sender = request(
            Topology::FanIn,
            1,
            vec![Counterparty::Address(Address::repeat_byte(5))],
            1,
        );
        assert!(matches!(
            orchestrator.execute_multi_transaction(&session, &raw_sender, &noop).await,
            Err(WalletError::InvalidRequest(_))
        ));

        let to_self = request(Topology::FanOut, 1, vec![Counterparty::Wallet(1)], 1);
        assert!(matches!(
            orchestrator.execute_multi_transaction(&session, &to_self, &noop).await,
            Err(WalletError::InvalidRequest(_))
        ));

        let empty = request(Topology::FanOut, 1, vec![], 1);
        assert!(matches!(
            orchestrator.execute_multi_transaction(&session, &empty, &noop).await,
            Err(WalletError::InvalidRequest(_))
        ));

        let mut token = request(Topology::FanOut, 1, vec![Counterparty::Wallet(2)], 1);
        token.asset = Asset::Token;
        assert!(matches!(
            orchestrator.execute_multi_transaction(&session, &token, &noop).await,
            Err(WalletError::InvalidRequest(_))
        ));

        assert_eq!(rpc.send_calls(), 0);
        assert!(session.history().is_empty());
    }
}
