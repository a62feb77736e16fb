//! Utility functions for amounts and RPC retries.
//!
//! This module provides helper functions for:
//! - Gas constants
//! - Converting between human decimal strings and base units
//! - Retrying RPC reads with a fixed pause between attempts

use std::{future::Future, time::Duration};

use alloy::primitives::U256;
use alloy_primitives::utils::{format_units, parse_units};
use tracing::warn;

use crate::error::{Result, WalletError};

/// Standard gas limit for basic native-currency transfers
pub const GAS_LIMIT: u64 = 21000;

/// Gas limit for an ERC-20 style `transfer` call
pub const TOKEN_GAS_LIMIT: u64 = 65000;

/// Decimals of the chain's native currency
pub const NATIVE_DECIMALS: u8 = 18;

/// Parses a human decimal amount such as `"1.5"` into base units.
///
/// # Arguments
/// * `amount` - Decimal string, at most `decimals` fractional digits
/// * `decimals` - Number of decimals of the asset
pub fn to_base_units(amount: &str, decimals: u8) -> Result<U256> {
    parse_units(amount.trim(), decimals)
        .map(|parsed| parsed.get_absolute())
        .map_err(|e| WalletError::InvalidRequest(format!("Invalid amount {:?}: {}", amount, e)))
}

/// Formats base units as a decimal string with trailing zeros removed.
pub fn format_amount(amount: U256, decimals: u8) -> String {
    match format_units(amount, decimals) {
        Ok(formatted) => trim_decimal(&formatted),
        Err(_) => amount.to_string(),
    }
}

/// Converts gwei to wei.
pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(1_000_000_000u64)
}

fn trim_decimal(value: &str) -> String {
    if !value.contains('.') {
        return value.to_string();
    }
    let trimmed = value.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Multiplies an amount by a floating factor with milli precision.
pub fn scale(amount: U256, factor: f64) -> U256 {
    let millis = (factor.max(0.0) * 1000.0).round() as u64;
    amount * U256::from(millis) / U256::from(1000u64)
}

/// Runs `operation` up to `attempts` times, sleeping `delay` between attempts
/// whenever `should_retry` accepts the error.
///
/// # Arguments
/// * `label` - Name of the operation for log output
/// * `attempts` - Total number of attempts, at least one is always made
/// * `delay` - Fixed pause between attempts
/// * `should_retry` - Decides whether an error is worth another attempt
/// * `operation` - Produces a fresh future per attempt
pub async fn retry_with<T, F, Fut, P>(
    label: &str,
    attempts: u32,
    delay: Duration,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&WalletError) -> bool,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && should_retry(&e) => {
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = attempts,
                    retry_in = ?delay,
                    error = %e,
                    "Retrying after failure"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
