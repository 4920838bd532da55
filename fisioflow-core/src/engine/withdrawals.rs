//! Partner withdrawals.
//!
//! A request only validates; the available balance is reserved at dispatch
//! and consumed at completion, when the `WITHDRAWAL_DEBIT` entry is written.
//! Failure and cancellation release the reservation without touching the
//! ledger.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::VoucherEngine;
use crate::error::{FisioError, Result};
use crate::ledger::{self, LedgerEntry};
use crate::metrics::FisioCounters;
use crate::partner::{self, Partner};
use crate::settlement;
use crate::types::{LedgerKind, Money, PartnerId, PartnerStatus, WithdrawalId};
use crate::withdrawal::{self, Destination, Withdrawal};

fn ensure_may_withdraw(p: &Partner) -> Result<()> {
    if p.status == PartnerStatus::Blocked {
        return Err(FisioError::PartnerNotActive {
            partner: p.id,
            status: p.status,
        });
    }
    Ok(())
}

fn ensure_covered(p: &Partner, amount: Money) -> Result<()> {
    if amount > p.available_balance {
        return Err(FisioError::InsufficientBalance {
            partner: p.id,
            requested: amount,
            available: p.available_balance,
        });
    }
    Ok(())
}

impl VoucherEngine {
    /// Request a withdrawal of `amount` from the available balance.
    ///
    /// # Errors
    /// `PartnerNotFound`, `PartnerNotActive` (BLOCKED), `InvalidDestination`,
    /// `InvalidAmounts`, `BelowMinimum`, `InsufficientBalance`.
    pub fn request_withdrawal(&self, partner_id: PartnerId, amount: Money, destination: Destination) -> Result<Withdrawal> {
        destination.validate()?;
        let now = self.now();
        let settle_first = self.config.settlement.settle_before_withdrawal;
        let policy = self.policy;

        let w = self.db.write(|tx| {
            if settle_first {
                settlement::settle_partner(tx, partner_id, policy, now)?;
            }
            let p = partner::require(tx, partner_id)?;
            ensure_may_withdraw(&p)?;

            let w = Withdrawal::request(partner_id, amount, destination, &self.config.withdrawal, now)?;
            let minimum = p.minimum_withdrawal_or(self.config.withdrawal.minimum_default);
            if w.amount < minimum {
                return Err(FisioError::BelowMinimum {
                    requested: w.amount,
                    minimum,
                });
            }
            ensure_covered(&p, w.amount)?;
            withdrawal::insert(tx, &w)?;
            Ok(w)
        })?;

        info!(
            withdrawal = %w.id,
            partner = %partner_id,
            amount = %w.amount,
            fee = %w.fee,
            "Withdrawal requested"
        );
        Ok(w)
    }

    /// Hand a PENDING withdrawal to the payout job, reserving its amount.
    /// Replaying the same `external_ref` is a no-op.
    ///
    /// # Errors
    /// `WithdrawalNotFound`, `IllegalTransition` (wrong status or a
    /// reference already used by another withdrawal), `InsufficientBalance`.
    pub fn dispatch_withdrawal(&self, id: WithdrawalId, external_ref: &str) -> Result<Withdrawal> {
        let now = self.now();
        self.db.write(|tx| {
            let mut w = withdrawal::require(tx, id)?;
            if !w.dispatch(external_ref, now)? {
                return Ok(w);
            }
            let mut p = partner::require(tx, w.partner_id)?;
            ensure_may_withdraw(&p)?;
            ensure_covered(&p, w.amount)?;
            p.available_balance -= w.amount;
            p.updated_at = now;
            partner::save(tx, &p)?;

            match withdrawal::save(tx, &w) {
                Err(FisioError::Store(e)) if e.is_unique_violation() => {
                    return Err(FisioError::IllegalTransition {
                        entity: "withdrawal",
                        from: format!("external_ref {external_ref} in use"),
                        action: "dispatch",
                    });
                }
                other => other?,
            }
            info!(withdrawal = %id, external_ref, amount = %w.amount, "Withdrawal dispatched");
            Ok(w)
        })
    }

    /// Confirm the payout: write the debit and consume the reservation.
    /// Replaying the same `transaction_id` is a no-op.
    ///
    /// # Errors
    /// `WithdrawalNotFound` or `IllegalTransition`.
    pub fn complete_withdrawal(&self, id: WithdrawalId, transaction_id: &str) -> Result<Withdrawal> {
        let now = self.now();
        let (w, changed) = self.db.write(|tx| {
            let mut w = withdrawal::require(tx, id)?;
            if !w.complete(transaction_id, now)? {
                return Ok((w, false));
            }
            ledger::append(
                tx,
                LedgerEntry::new(w.partner_id, LedgerKind::WithdrawalDebit, w.amount, now).for_withdrawal(w.id),
            )?;
            let mut p = partner::require(tx, w.partner_id)?;
            p.total_withdrawn += w.amount;
            p.last_withdrawal_at = Some(now);
            p.updated_at = now;
            partner::save(tx, &p)?;
            withdrawal::save(tx, &w)?;
            Ok::<_, FisioError>((w, true))
        })?;
        if changed {
            FisioCounters::add(&self.counters.withdrawals_completed, 1);
            info!(withdrawal = %id, transaction_id, net = %w.net_amount, "Withdrawal completed");
        }
        Ok(w)
    }

    /// Record a failed payout and give the amount back to the available
    /// balance.
    ///
    /// # Errors
    /// `WithdrawalNotFound` or `IllegalTransition`.
    pub fn fail_withdrawal(&self, id: WithdrawalId, reason: &str) -> Result<Withdrawal> {
        let now = self.now();
        let w = self.db.write(|tx| {
            let mut w = withdrawal::require(tx, id)?;
            let held = w.amount;
            w.fail(reason, now)?;
            release(tx, w.partner_id, held, now)?;
            withdrawal::save(tx, &w)?;
            Ok::<_, FisioError>(w)
        })?;
        FisioCounters::add(&self.counters.withdrawals_failed, 1);
        warn!(withdrawal = %id, reason, "Withdrawal failed");
        Ok(w)
    }

    /// Cancel a withdrawal that has not reached a terminal status,
    /// releasing any reservation.
    ///
    /// # Errors
    /// `WithdrawalNotFound` or `IllegalTransition`.
    pub fn cancel_withdrawal(&self, id: WithdrawalId, reason: Option<&str>) -> Result<Withdrawal> {
        let now = self.now();
        let w = self.db.write(|tx| {
            let mut w = withdrawal::require(tx, id)?;
            if w.cancel(reason, now)? {
                release(tx, w.partner_id, w.amount, now)?;
            }
            withdrawal::save(tx, &w)?;
            Ok::<_, FisioError>(w)
        })?;
        FisioCounters::add(&self.counters.withdrawals_cancelled, 1);
        info!(withdrawal = %id, "Withdrawal cancelled");
        Ok(w)
    }

    /// # Errors
    /// `WithdrawalNotFound`.
    pub fn get_withdrawal(&self, id: WithdrawalId) -> Result<Withdrawal> {
        self.db.read(|conn| withdrawal::require(conn, id))
    }

    /// A partner's withdrawals, newest first.
    ///
    /// # Errors
    /// `PartnerNotFound`.
    pub fn partner_withdrawals(&self, partner_id: PartnerId) -> Result<Vec<Withdrawal>> {
        self.db.read(|conn| {
            partner::require(conn, partner_id)?;
            withdrawal::for_partner(conn, partner_id)
        })
    }
}

fn release(conn: &Connection, partner_id: PartnerId, amount: Money, now: DateTime<Utc>) -> Result<()> {
    debug_assert!(amount > Decimal::ZERO);
    let mut p = partner::require(conn, partner_id)?;
    p.available_balance += amount;
    p.updated_at = now;
    partner::save(conn, &p)
}
