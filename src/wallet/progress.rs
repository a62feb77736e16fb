use tracing::{info, info_span, warn};

use crate::{
    types::{MultiTransactionResult, ProgressStats, TransactionRecord},
    utils::{format_amount, NATIVE_DECIMALS},
};

/// Receives per-leg notifications while a batch runs.
///
/// Callbacks are invoked between RPC calls, never after the batch has returned.
pub trait ProgressObserver: Send + Sync {
    /// Called before leg `index` (1-based) of `total` is executed
    fn on_leg_start(&self, _index: usize, _total: usize, _description: &str) {}

    /// Called once the record for a leg has been written to history
    fn on_leg_complete(&self, _record: &TransactionRecord) {}
}

/// Observer that ignores all notifications.
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Tracks batch statistics, logs progress and forwards to an observer.
pub struct ProgressManager<'a> {
    progress: ProgressStats,
    observer: &'a dyn ProgressObserver,
}

impl<'a> ProgressManager<'a> {
    pub fn new(total_operations: usize, observer: &'a dyn ProgressObserver) -> Self {
        Self {
            progress: ProgressStats::new(total_operations),
            observer,
        }
    }

    pub fn stats(&self) -> &ProgressStats {
        &self.progress
    }

    pub fn leg_started(&self, index: usize, description: &str) {
        info!(
            leg = index,
            total = self.progress.total_operations,
            description,
            "Executing transfer"
        );
        self.observer
            .on_leg_start(index, self.progress.total_operations, description);
    }

    /// Updates progress statistics and prints current status
    pub fn leg_completed(&mut self, record: &TransactionRecord) {
        let progress = &mut self.progress;
        progress.completed_operations += 1;
        if record.is_success() {
            progress.successful_operations += 1;
        }

        let time_remaining = progress
            .estimated_time_remaining()
            .map(|d| format!("{:.1} seconds", d.as_secs_f64()))
            .unwrap_or_else(|| "calculating...".to_string());

        info!(
            completed = progress.completed_operations,
            total = progress.total_operations,
            progress_percent = format!("{:.1}%", progress.progress_percent()),
            success_rate = format!("{:.1}%", progress.success_rate()),
            ops_per_minute = format!("{:.1}", progress.operations_per_minute()),
            time_remaining,
            tx_hash = ?record.tx_hash,
            status = ?record.status,
            "Progress update"
        );

        self.observer.on_leg_complete(record);
    }

    /// Logs a summary of a finished batch, including each failed leg
    pub fn print_statistics(&self, result: &MultiTransactionResult) {
        let stats_span = info_span!("execution_statistics");
        let _guard = stats_span.enter();

        info!(
            duration = ?result.time_elapsed,
            successful = result.successful_count,
            failed = result.failed_count,
            gas_spent = %format_amount(result.total_gas_used, NATIVE_DECIMALS),
            "Execution completed"
        );

        if result.failed_count > 0 {
            let error_span = info_span!("error_summary");
            let _error_guard = error_span.enter();

            warn!(
                error_count = result.failed_count,
                "Errors occurred during execution"
            );
            for record in result.transactions.iter().filter(|r| !r.is_success()) {
                warn!(
                    from = %record.from,
                    to = %record.to,
                    error = record.error_message.as_deref().unwrap_or("unknown"),
                    "Operation failed"
                );
            }
        }
    }
}
