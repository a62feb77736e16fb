//! Flat sheet views of the wallet pool and transaction history.
//!
//! A workbook is a list of [`Sheet`]s, each a name plus rows of
//! column -> cell strings. Sinks decide how a workbook is persisted.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    derivation::Wallet,
    error::{Result, WalletError},
    history::HistoryStats,
    network::NetworkContext,
    types::TransactionRecord,
    utils::{format_amount, NATIVE_DECIMALS},
    wallet::BalanceTotals,
};

pub type Row = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sheet {
    pub sheet_name: String,
    pub rows: Vec<Row>,
}

impl Sheet {
    pub fn new(sheet_name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            rows,
        }
    }
}

/// Consumer of exported workbooks
pub trait ExportSink {
    /// Persists `sheets` under the export name `name`
    fn write_sheets(&self, name: &str, sheets: &[Sheet]) -> Result<()>;
}

/// Writes each workbook as `{dir}/{name}.json`
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl ExportSink for JsonFileSink {
    fn write_sheets(&self, name: &str, sheets: &[Sheet]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        fs::write(&path, serde_json::to_string_pretty(sheets)?)?;
        info!(path = %path.display(), sheets = sheets.len(), "Export written");
        Ok(())
    }
}

/// Loads a workbook written by [`JsonFileSink`]
pub fn read_sheets(path: &Path) -> Result<Vec<Sheet>> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn row<const N: usize>(cells: [(&str, String); N]) -> Row {
    cells
        .into_iter()
        .map(|(column, value)| (column.to_string(), value))
        .collect()
}

/// Builds the "Wallets" and "Totals" sheets
pub fn wallet_sheets(
    wallets: &[Wallet],
    network: &NetworkContext,
    totals: &BalanceTotals,
) -> Vec<Sheet> {
    let token_symbol = network
        .token
        .as_ref()
        .map(|t| t.symbol.clone())
        .unwrap_or_default();
    let token_decimals = network.token.as_ref().map(|t| t.decimals).unwrap_or(0);

    let rows = wallets
        .iter()
        .map(|wallet| {
            row([
                ("index", wallet.index.to_string()),
                ("address", wallet.address.to_checksum(None)),
                ("path", wallet.path.clone()),
                (
                    "native_balance",
                    wallet.native_balance.display(NATIVE_DECIMALS),
                ),
                ("token_balance", wallet.token_balance.display(token_decimals)),
                (
                    "last_checked_at",
                    wallet
                        .last_checked_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default(),
                ),
            ])
        })
        .collect();

    let summary = row([
        ("chain_id", network.chain_id.to_string()),
        ("network", network.name.clone()),
        ("wallet_count", totals.wallet_count.to_string()),
        (
            "total_native",
            format_amount(totals.total_native, NATIVE_DECIMALS),
        ),
        ("native_symbol", network.native_currency_symbol.clone()),
        ("total_token", format_amount(totals.total_token, token_decimals)),
        ("token_symbol", token_symbol),
        ("timestamp", totals.timestamp.to_rfc3339()),
    ]);

    vec![
        Sheet::new("Wallets", rows),
        Sheet::new("Totals", vec![summary]),
    ]
}

/// Builds the "Transactions" and "Summary" sheets
pub fn history_sheets(records: &[TransactionRecord], stats: &HistoryStats) -> Vec<Sheet> {
    let rows = records
        .iter()
        .map(|record| {
            row([
                ("type", record.topology.to_string()),
                ("from", record.from.to_checksum(None)),
                ("to", record.to.to_checksum(None)),
                ("token", record.token.clone()),
                ("amount", record.amount_display()),
                ("gas_fee", record.gas_fee_display()),
                (
                    "status",
                    if record.is_success() { "success" } else { "failed" }.to_string(),
                ),
                (
                    "tx_hash",
                    record.tx_hash.map(|h| h.to_string()).unwrap_or_default(),
                ),
                ("error", record.error_message.clone().unwrap_or_default()),
                ("chain_id", record.chain_id.to_string()),
                ("timestamp", record.timestamp.to_rfc3339()),
            ])
        })
        .collect();

    let mut summary = vec![row([
        ("metric", "total".to_string()),
        ("value", stats.total.to_string()),
    ])];
    summary.push(row([
        ("metric", "successful".to_string()),
        ("value", stats.successful.to_string()),
    ]));
    summary.push(row([
        ("metric", "failed".to_string()),
        ("value", stats.failed.to_string()),
    ]));
    summary.push(row([
        ("metric", "success_rate".to_string()),
        ("value", format!("{:.1}%", stats.success_rate)),
    ]));
    summary.push(row([
        ("metric", "total_gas".to_string()),
        ("value", format_amount(stats.total_gas, NATIVE_DECIMALS)),
    ]));
    for (token, token_stats) in &stats.per_token {
        summary.push(row([
            ("metric", format!("{} volume", token)),
            (
                "value",
                format_amount(token_stats.volume, token_stats.decimals),
            ),
        ]));
    }

    vec![
        Sheet::new("Transactions", rows),
        Sheet::new("Summary", summary),
    ]
}

/// Reads `(index, address, path)` back from a "Wallets" sheet
pub fn parse_wallet_rows(sheet: &Sheet) -> Result<Vec<(usize, Address, String)>> {
    sheet
        .rows
        .iter()
        .map(|row| {
            let cell = |column: &str| {
                row.get(column).ok_or_else(|| {
                    WalletError::InvalidRequest(format!(
                        "sheet {} has no {} column",
                        sheet.sheet_name, column
                    ))
                })
            };
            let index = cell("index")?
                .parse::<usize>()
                .map_err(|e| WalletError::InvalidRequest(format!("bad wallet index: {}", e)))?;
            let address = cell("address")?
                .parse::<Address>()
                .map_err(|e| WalletError::InvalidRequest(format!("bad wallet address: {}", e)))?;
            Ok((index, address, cell("path")?.clone()))
        })
        .collect()
}
