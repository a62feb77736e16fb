//! Hierarchical deterministic wallet derivation.
//!
//! Wallets are derived along `m/44'/60'/0'/0/{i}` from a BIP-39 mnemonic.
//! Private keys live in zeroizing buffers owned by their [`Wallet`] and are
//! only turned into a signer at the moment a transaction is signed.

use std::fmt;

use alloy::{
    network::EthereumWallet,
    primitives::Address,
    signers::local::{
        coins_bip39::{English, Mnemonic},
        PrivateKeySigner,
    },
};
use coins_bip32::prelude::{Parent, SigningKey};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::{Result, WalletError},
    types::BalanceState,
};

/// Default cap on the number of wallets derived in one batch
pub const MAX_WALLETS: usize = 100;

/// BIP-44 prefix for Ethereum-compatible chains
pub const DERIVATION_PREFIX: &str = "m/44'/60'/0'/0";

/// A 32-byte secp256k1 private key that is wiped on drop or on demand.
pub struct SecretKey(Zeroizing<[u8; 32]>);

impl SecretKey {
    fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn erase(&mut self) {
        self.0.zeroize();
    }

    pub fn is_erased(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A derived keypair plus balance bookkeeping.
#[derive(Debug)]
pub struct Wallet {
    /// 1-based position within the generation batch
    pub index: usize,
    /// Last component of the derivation path
    pub derivation_index: u32,
    pub address: Address,
    pub path: String,
    secret: SecretKey,
    pub native_balance: BalanceState,
    pub token_balance: BalanceState,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Wallet {
    /// Builds a signer for this wallet's key.
    ///
    /// Fails once the key has been erased.
    pub fn signer(&self) -> Result<PrivateKeySigner> {
        if self.secret.is_erased() {
            return Err(WalletError::Signing(format!(
                "key for wallet #{} has been erased",
                self.index
            )));
        }
        PrivateKeySigner::from_slice(self.secret.0.as_slice())
            .map_err(|e| WalletError::Signing(e.to_string()))
    }

    pub fn ethereum_wallet(&self) -> Result<EthereumWallet> {
        Ok(EthereumWallet::new(self.signer()?))
    }

    /// Overwrites the private key with zeros.
    pub fn erase(&mut self) {
        self.secret.erase();
    }

    pub fn is_erased(&self) -> bool {
        self.secret.is_erased()
    }

    /// Resets balance fields to unknown, keeping the key.
    pub fn invalidate_balances(&mut self) {
        self.native_balance = BalanceState::Unknown;
        self.token_balance = BalanceState::Unknown;
        self.last_checked_at = None;
    }
}

/// Derives wallets from a mnemonic. Stateless between calls.
#[derive(Debug, Clone)]
pub struct KeyDerivationService {
    max_wallets: usize,
}

impl Default for KeyDerivationService {
    fn default() -> Self {
        Self::new(MAX_WALLETS)
    }
}

impl KeyDerivationService {
    pub fn new(max_wallets: usize) -> Self {
        Self { max_wallets }
    }

    /// Derives the wallets at `start_index..=end_index`.
    ///
    /// # Arguments
    /// * `seed_phrase` - BIP-39 English mnemonic
    /// * `start_index` - First derivation index
    /// * `end_index` - Last derivation index, inclusive
    ///
    /// # Returns
    /// * `Result<Vec<Wallet>>` - Wallets numbered from 1 in derivation order
    pub fn derive_wallets(
        &self,
        seed_phrase: &str,
        start_index: u32,
        end_index: u32,
    ) -> Result<Vec<Wallet>> {
        if start_index > end_index {
            return Err(WalletError::InvalidRange {
                start: start_index,
                end: end_index,
            });
        }
        let requested = u64::from(end_index - start_index) + 1;
        if requested > self.max_wallets as u64 {
            return Err(WalletError::RangeTooLarge {
                requested,
                max: self.max_wallets,
            });
        }

        let phrase = normalize_phrase(seed_phrase);
        let mnemonic = Mnemonic::<English>::new_from_phrase(&phrase)
            .map_err(|e| WalletError::InvalidSeedPhrase(e.to_string()))?;
        // seed stretching runs once here, children are derived from the account key
        let account = mnemonic
            .derive_key(DERIVATION_PREFIX, None)
            .map_err(|e| WalletError::InvalidSeedPhrase(e.to_string()))?;

        let mut wallets = Vec::with_capacity(requested as usize);
        for (position, derivation_index) in (start_index..=end_index).enumerate() {
            let path = format!("{}/{}", DERIVATION_PREFIX, derivation_index);
            let child = account
                .derive_child(derivation_index)
                .map_err(|e| WalletError::InvalidRequest(format!("Cannot derive {}: {}", path, e)))?;
            let signing_key: &SigningKey = child.as_ref();

            let mut key_bytes = [0u8; 32];
            key_bytes.copy_from_slice(&signing_key.to_bytes());
            let address = PrivateKeySigner::from_slice(&key_bytes)
                .map_err(|e| WalletError::Signing(e.to_string()))?
                .address();
            let secret = SecretKey::from_bytes(key_bytes);
            key_bytes.zeroize();

            debug!(index = position + 1, %path, %address, "Derived wallet");
            wallets.push(Wallet {
                index: position + 1,
                derivation_index,
                address,
                path,
                secret,
                native_balance: BalanceState::Unknown,
                token_balance: BalanceState::Unknown,
                last_checked_at: None,
            });
        }

        info!(
            count = wallets.len(),
            start = start_index,
            end = end_index,
            "Derived wallets"
        );
        Ok(wallets)
    }
}

fn normalize_phrase(seed_phrase: &str) -> Zeroizing<String> {
    Zeroizing::new(
        seed_phrase
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Checks word count, word list membership and checksum.
pub fn validate_mnemonic(seed_phrase: &str) -> Result<()> {
    Mnemonic::<English>::new_from_phrase(seed_phrase)
        .map(|_| ())
        .map_err(|e| WalletError::InvalidSeedPhrase(e.to_string()))
}
