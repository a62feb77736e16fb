//! Scripted [`ChainRpc`] for unit tests.

use std::collections::{HashMap, HashSet};

use alloy::primitives::{keccak256, Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    derivation::{KeyDerivationService, Wallet},
    error::{Result, WalletError},
    rpc::{ChainRpc, ReceiptSummary},
    utils::gwei,
};

pub const PHRASE: &str = "test test test test test test test test test test test junk";

pub fn wallets(count: u32) -> Vec<Wallet> {
    KeyDerivationService::default()
        .derive_wallets(PHRASE, 0, count - 1)
        .unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcEvent {
    NativeBalance(Address),
    TokenBalance(Address),
    Nonce(Address),
    /// 1-based send call number
    SendStart(usize),
    SendEnd(usize),
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    remaining: u32,
    transient: bool,
}

impl Failure {
    fn take(&mut self, what: &str) -> Option<WalletError> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(if self.transient {
            WalletError::TransientRpc(format!("{} timed out", what))
        } else {
            WalletError::ProviderError(format!("{}: contract function not found", what))
        })
    }
}

struct MockState {
    chain_id: u64,
    gas_price: U256,
    gas_price_calls: usize,
    native: HashMap<Address, U256>,
    token: HashMap<Address, U256>,
    code: HashMap<Address, Bytes>,
    native_failures: HashMap<Address, Failure>,
    token_failures: HashMap<Address, Failure>,
    nonce_failures: u32,
    nonces: HashMap<Address, u64>,
    last_nonce_address: Option<Address>,
    send_calls: usize,
    failing_sends: HashSet<usize>,
    reverted_sends: HashSet<usize>,
    missing_receipts: bool,
    receipt_gas_used: u64,
    sent: Vec<Bytes>,
    receipts: HashMap<TxHash, ReceiptSummary>,
    events: Vec<(Instant, RpcEvent)>,
}

pub struct MockRpc {
    state: Mutex<MockState>,
}

impl Default for MockRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRpc {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                chain_id: 137,
                gas_price: gwei(30),
                gas_price_calls: 0,
                native: HashMap::new(),
                token: HashMap::new(),
                code: HashMap::new(),
                native_failures: HashMap::new(),
                token_failures: HashMap::new(),
                nonce_failures: 0,
                nonces: HashMap::new(),
                last_nonce_address: None,
                send_calls: 0,
                failing_sends: HashSet::new(),
                reverted_sends: HashSet::new(),
                missing_receipts: false,
                receipt_gas_used: 21_000,
                sent: Vec::new(),
                receipts: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.lock().gas_price = price;
    }

    pub fn set_native(&self, address: Address, balance: U256) {
        self.state.lock().native.insert(address, balance);
    }

    pub fn set_token(&self, owner: Address, balance: U256) {
        self.state.lock().token.insert(owner, balance);
    }

    pub fn deploy(&self, contract: Address) {
        self.state
            .lock()
            .code
            .insert(contract, Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]));
    }

    /// The next `times` native balance reads for `address` fail.
    pub fn fail_native(&self, address: Address, times: u32, transient: bool) {
        self.state.lock().native_failures.insert(
            address,
            Failure {
                remaining: times,
                transient,
            },
        );
    }

    pub fn fail_token(&self, owner: Address, times: u32, transient: bool) {
        self.state.lock().token_failures.insert(
            owner,
            Failure {
                remaining: times,
                transient,
            },
        );
    }

    pub fn fail_nonce(&self, times: u32) {
        self.state.lock().nonce_failures = times;
    }

    /// Rejects the `call`-th raw transaction submission (1-based).
    pub fn fail_send(&self, call: usize) {
        self.state.lock().failing_sends.insert(call);
    }

    /// Mines the `call`-th submission with a failed status.
    pub fn revert_send(&self, call: usize) {
        self.state.lock().reverted_sends.insert(call);
    }

    pub fn withhold_receipts(&self) {
        self.state.lock().missing_receipts = true;
    }

    pub fn gas_price_calls(&self) -> usize {
        self.state.lock().gas_price_calls
    }

    pub fn send_calls(&self) -> usize {
        self.state.lock().send_calls
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    pub fn events(&self) -> Vec<(Instant, RpcEvent)> {
        self.state.lock().events.clone()
    }

    pub fn receipt_fee(&self) -> U256 {
        let state = self.state.lock();
        U256::from(state.receipt_gas_used) * state.gas_price
    }

    fn record(&self, event: RpcEvent) {
        self.state.lock().events.push((Instant::now(), event));
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.state.lock().chain_id)
    }

    async fn native_balance(&self, address: Address) -> Result<U256> {
        self.record(RpcEvent::NativeBalance(address));
        let mut state = self.state.lock();
        if let Some(err) = state
            .native_failures
            .get_mut(&address)
            .and_then(|f| f.take("balance"))
        {
            return Err(err);
        }
        Ok(state.native.get(&address).copied().unwrap_or_default())
    }

    async fn code_at(&self, address: Address) -> Result<Bytes> {
        Ok(self
            .state
            .lock()
            .code
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn token_balance(&self, _token: Address, owner: Address) -> Result<U256> {
        self.record(RpcEvent::TokenBalance(owner));
        let mut state = self.state.lock();
        if let Some(err) = state
            .token_failures
            .get_mut(&owner)
            .and_then(|f| f.take("balanceOf"))
        {
            return Err(err);
        }
        Ok(state.token.get(&owner).copied().unwrap_or_default())
    }

    async fn token_decimals(&self, _token: Address) -> Result<u8> {
        Ok(6)
    }

    async fn token_symbol(&self, _token: Address) -> Result<String> {
        Ok("USDT".to_string())
    }

    async fn gas_price(&self) -> Result<U256> {
        let mut state = self.state.lock();
        state.gas_price_calls += 1;
        Ok(state.gas_price)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        self.record(RpcEvent::Nonce(address));
        let mut state = self.state.lock();
        if state.nonce_failures > 0 {
            state.nonce_failures -= 1;
            return Err(WalletError::TransientRpc("nonce timed out".into()));
        }
        state.last_nonce_address = Some(address);
        Ok(state.nonces.get(&address).copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
        let call = {
            let mut state = self.state.lock();
            state.send_calls += 1;
            state.send_calls
        };
        self.record(RpcEvent::SendStart(call));
        // simulated network latency
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        self.record(RpcEvent::SendEnd(call));

        let mut state = self.state.lock();
        if state.failing_sends.contains(&call) {
            return Err(WalletError::ProviderError(
                "send failed: replacement transaction underpriced".into(),
            ));
        }

        let hash = keccak256(&raw);
        if let Some(sender) = state.last_nonce_address {
            *state.nonces.entry(sender).or_default() += 1;
        }
        let summary = ReceiptSummary {
            success: !state.reverted_sends.contains(&call),
            gas_used: state.receipt_gas_used,
            effective_gas_price: state.gas_price,
        };
        state.receipts.insert(hash, summary);
        state.sent.push(raw);
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<ReceiptSummary>> {
        let state = self.state.lock();
        if state.missing_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(&hash).copied())
    }
}
