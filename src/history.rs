//! Append-only log of executed transfers for the current session.

use std::collections::BTreeMap;

use alloy::primitives::U256;
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::TransactionRecord;

/// Per-asset slice of the history statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenStats {
    pub count: usize,
    pub successful: usize,
    /// Sum of successfully transferred base units
    pub volume: U256,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage in `0.0..=100.0`
    pub success_rate: f64,
    /// Wei spent on gas across all records
    pub total_gas: U256,
    pub per_token: BTreeMap<String, TokenStats>,
}

/// Records are kept in insertion order. Single writer, any number of readers.
#[derive(Debug, Default)]
pub struct TransactionHistoryStore {
    records: RwLock<Vec<TransactionRecord>>,
}

impl TransactionHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: TransactionRecord) {
        self.records.write().push(record);
    }

    /// Snapshot of all records, oldest first.
    pub fn all(&self) -> Vec<TransactionRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn stats(&self) -> HistoryStats {
        let records = self.records.read();
        let mut stats = HistoryStats {
            total: records.len(),
            ..HistoryStats::default()
        };

        for record in records.iter() {
            stats.total_gas += record.gas_fee;
            let token = stats.per_token.entry(record.token.clone()).or_default();
            token.count += 1;
            token.decimals = record.decimals;
            if record.is_success() {
                stats.successful += 1;
                token.successful += 1;
                token.volume += record.amount;
            } else {
                stats.failed += 1;
            }
        }

        if stats.total > 0 {
            stats.success_rate = stats.successful as f64 / stats.total as f64 * 100.0;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Topology, TxStatus};
    use alloy::primitives::Address;
    use chrono::Utc;

    fn record(token: &str, amount: u64, gas: u64, status: TxStatus) -> TransactionRecord {
        TransactionRecord {
            topology: Topology::FanOut,
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            token: token.to_string(),
            amount: U256::from(amount),
            decimals: 6,
            gas_fee: U256::from(gas),
            status,
            tx_hash: None,
            error_message: None,
            chain_id: 137,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn keeps_insertion_order() {
        let store = TransactionHistoryStore::new();
        store.append(record("USDT", 1, 0, TxStatus::Success));
        store.append(record("POL", 2, 0, TxStatus::Failed));
        let amounts: Vec<_> = store.all().iter().map(|r| r.amount).collect();
        assert_eq!(amounts, vec![U256::from(1u64), U256::from(2u64)]);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn computes_stats_per_token() {
        let store = TransactionHistoryStore::new();
        store.append(record("USDT", 10, 5, TxStatus::Success));
        store.append(record("USDT", 10, 3, TxStatus::Failed));
        store.append(record("POL", 7, 2, TxStatus::Success));
        store.append(record("USDT", 4, 1, TxStatus::Success));

        let stats = store.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 75.0);
        assert_eq!(stats.total_gas, U256::from(11u64));

        let usdt = &stats.per_token["USDT"];
        assert_eq!(usdt.count, 3);
        assert_eq!(usdt.successful, 2);
        assert_eq!(usdt.volume, U256::from(14u64));
        assert_eq!(stats.per_token["POL"].volume, U256::from(7u64));
    }

    #[test]
    fn empty_stats() {
        let stats = TransactionHistoryStore::new().stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
    }
}
