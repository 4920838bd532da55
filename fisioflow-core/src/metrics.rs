//! Engine counters.
//!
//! Lock-free `AtomicU64` counters incremented on the hot path and read on
//! dashboard export. Counts are process-local; the ledger remains the source
//! of truth for money.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for engine events.
#[derive(Debug)]
pub struct FisioCounters {
    /// Vouchers issued.
    pub vouchers_issued: AtomicU64,
    /// Payments confirmed (idempotent replays excluded).
    pub payments_confirmed: AtomicU64,
    /// Sessions completed against a voucher or in cash.
    pub redemptions: AtomicU64,
    /// Redemption attempts refused by a precondition.
    pub redemptions_rejected: AtomicU64,
    /// Reversal groups written (cancellations after completion and refunds).
    pub reversals: AtomicU64,
    /// Credits matured by settlement.
    pub credits_matured: AtomicU64,
    /// Withdrawals completed.
    pub withdrawals_completed: AtomicU64,
    /// Withdrawals failed.
    pub withdrawals_failed: AtomicU64,
    /// Withdrawals cancelled.
    pub withdrawals_cancelled: AtomicU64,
}

impl FisioCounters {
    /// Create a new set of zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vouchers_issued: AtomicU64::new(0),
            payments_confirmed: AtomicU64::new(0),
            redemptions: AtomicU64::new(0),
            redemptions_rejected: AtomicU64::new(0),
            reversals: AtomicU64::new(0),
            credits_matured: AtomicU64::new(0),
            withdrawals_completed: AtomicU64::new(0),
            withdrawals_failed: AtomicU64::new(0),
            withdrawals_cancelled: AtomicU64::new(0),
        }
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            vouchers_issued: self.vouchers_issued.load(Ordering::Relaxed),
            payments_confirmed: self.payments_confirmed.load(Ordering::Relaxed),
            redemptions: self.redemptions.load(Ordering::Relaxed),
            redemptions_rejected: self.redemptions_rejected.load(Ordering::Relaxed),
            reversals: self.reversals.load(Ordering::Relaxed),
            credits_matured: self.credits_matured.load(Ordering::Relaxed),
            withdrawals: [
                self.withdrawals_completed.load(Ordering::Relaxed),
                self.withdrawals_failed.load(Ordering::Relaxed),
                self.withdrawals_cancelled.load(Ordering::Relaxed),
            ],
        }
    }
}

impl Default for FisioCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of counter values at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Vouchers issued.
    pub vouchers_issued: u64,
    /// Payments confirmed.
    pub payments_confirmed: u64,
    /// Sessions completed.
    pub redemptions: u64,
    /// Redemptions refused.
    pub redemptions_rejected: u64,
    /// Reversal groups written.
    pub reversals: u64,
    /// Credits matured.
    pub credits_matured: u64,
    /// Withdrawals by terminal state [completed, failed, cancelled].
    pub withdrawals: [u64; 3],
}

impl CounterSnapshot {
    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP fisioflow_vouchers_issued_total Vouchers issued\n\
             # TYPE fisioflow_vouchers_issued_total counter\n\
             fisioflow_vouchers_issued_total {}\n\
             # HELP fisioflow_payments_confirmed_total Voucher payments confirmed\n\
             # TYPE fisioflow_payments_confirmed_total counter\n\
             fisioflow_payments_confirmed_total {}\n\
             # HELP fisioflow_redemptions_total Sessions completed\n\
             # TYPE fisioflow_redemptions_total counter\n\
             fisioflow_redemptions_total {}\n\
             # HELP fisioflow_redemptions_rejected_total Redemptions refused by a precondition\n\
             # TYPE fisioflow_redemptions_rejected_total counter\n\
             fisioflow_redemptions_rejected_total {}\n\
             # HELP fisioflow_reversals_total Settlement reversal groups\n\
             # TYPE fisioflow_reversals_total counter\n\
             fisioflow_reversals_total {}\n\
             # HELP fisioflow_credits_matured_total Partner credits matured\n\
             # TYPE fisioflow_credits_matured_total counter\n\
             fisioflow_credits_matured_total {}\n\
             # HELP fisioflow_withdrawals_total Withdrawals by terminal state\n\
             # TYPE fisioflow_withdrawals_total counter\n\
             fisioflow_withdrawals_total{{state=\"completed\"}} {}\n\
             fisioflow_withdrawals_total{{state=\"failed\"}} {}\n\
             fisioflow_withdrawals_total{{state=\"cancelled\"}} {}\n",
            self.vouchers_issued,
            self.payments_confirmed,
            self.redemptions,
            self.redemptions_rejected,
            self.reversals,
            self.credits_matured,
            self.withdrawals[0],
            self.withdrawals[1],
            self.withdrawals[2],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_prometheus() {
        let counters = FisioCounters::new();
        FisioCounters::add(&counters.redemptions, 2);
        FisioCounters::add(&counters.withdrawals_failed, 1);
        let text = counters.snapshot().to_prometheus();
        assert!(text.contains("fisioflow_redemptions_total 2"));
        assert!(text.contains("fisioflow_withdrawals_total{state=\"failed\"} 1"));
    }
}
