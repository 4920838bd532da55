//! Vouchers: prepaid session bundles and their payment lifecycle.
//!
//! State transitions are pure methods on [`Voucher`]; the engine loads the
//! row inside a write transaction, applies a transition, and saves it in the
//! same transaction.

use chrono::{DateTime, Utc};
use fisioflow_store::codec::{
    decimal_to_sql, get_decimal, get_opt_decimal, get_opt_ts, get_parsed, get_ts, opt_ts_to_sql,
    ts_to_sql, OptionalExt,
};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FisioError, Result};
use crate::types::{Money, PartnerId, PatientId, PaymentStatus, VoucherId, VoucherStatus, VoucherType};

/// A prepaid bundle of sessions tied to one patient and one partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    /// Row identifier.
    pub id: VoucherId,
    /// Public opaque code.
    pub code: String,
    /// Partner the sessions are booked with.
    pub partner_id: PartnerId,
    /// Holder.
    pub patient_id: PatientId,
    /// Bundle kind.
    pub voucher_type: VoucherType,
    /// Lifecycle status.
    pub status: VoucherStatus,
    /// List price.
    pub price: Money,
    /// Discount off the list price.
    pub discount: Money,
    /// `price - discount`.
    pub final_price: Money,
    /// Per-session price for bounded bundles, rounded down to cents; the
    /// last session also takes the leftover cents. `None` for UNLIMITED.
    pub unit_price: Option<Money>,
    /// Sessions bought.
    pub sessions_total: u32,
    /// Sessions consumed.
    pub sessions_used: u32,
    /// First redeemable instant.
    pub valid_from: DateTime<Utc>,
    /// Last redeemable instant (inclusive).
    pub valid_until: DateTime<Utc>,
    /// Payment lifecycle.
    pub payment_status: PaymentStatus,
    /// External payment id once paid.
    pub payment_id: Option<String>,
    /// Payment method reported by the gateway.
    pub payment_method: Option<String>,
    /// Last payment failure reason.
    pub payment_failure: Option<String>,
    /// When payment cleared.
    pub paid_at: Option<DateTime<Utc>>,
    /// First redemption.
    pub first_used_at: Option<DateTime<Utc>>,
    /// Latest redemption.
    pub last_used_at: Option<DateTime<Utc>>,
    /// When the voucher was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// When the voucher was refunded.
    pub refunded_at: Option<DateTime<Utc>>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl Voucher {
    /// `sessions_total - sessions_used`.
    #[must_use]
    pub fn sessions_remaining(&self) -> u32 {
        self.sessions_total.saturating_sub(self.sessions_used)
    }

    fn status_error(&self) -> FisioError {
        FisioError::VoucherStatusInvalid {
            code: self.code.clone(),
            status: self.status.to_string(),
        }
    }

    /// Whether `now` is past `valid_until`.
    #[must_use]
    pub fn is_past_validity(&self, now: DateTime<Utc>) -> bool {
        now > self.valid_until
    }

    /// Flip an ACTIVE voucher to EXPIRED once its window has closed.
    ///
    /// Returns whether the status changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == VoucherStatus::Active && self.is_past_validity(now) {
            self.status = VoucherStatus::Expired;
            self.updated_at = now;
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Redemption
    // ------------------------------------------------------------------

    /// Check the voucher can be scheduled against for `patient` at `now`
    /// (status, validity window, holder). Payment and remaining sessions are
    /// checked at completion.
    ///
    /// # Errors
    /// The first failing precondition.
    pub fn check_schedulable(&self, patient: PatientId, now: DateTime<Utc>) -> Result<()> {
        self.check_status()?;
        self.check_window(now)?;
        self.check_holder(patient)
    }

    /// Check every redemption precondition for `patient` at `now`.
    ///
    /// Order: status, payment, validity window (both ends inclusive),
    /// remaining sessions, holder.
    ///
    /// # Errors
    /// The first failing precondition.
    pub fn check_redeemable(&self, patient: PatientId, now: DateTime<Utc>) -> Result<()> {
        self.check_status()?;
        if self.payment_status != PaymentStatus::Paid {
            return Err(FisioError::VoucherNotPaid(self.code.clone()));
        }
        self.check_window(now)?;
        if self.sessions_remaining() == 0 {
            return Err(FisioError::VoucherExhausted(self.code.clone()));
        }
        self.check_holder(patient)
    }

    fn check_status(&self) -> Result<()> {
        match self.status {
            VoucherStatus::Active => Ok(()),
            VoucherStatus::Used => Err(FisioError::VoucherExhausted(self.code.clone())),
            VoucherStatus::Expired => Err(FisioError::VoucherExpired(self.code.clone())),
            VoucherStatus::Cancelled | VoucherStatus::Refunded => Err(self.status_error()),
        }
    }

    fn check_window(&self, now: DateTime<Utc>) -> Result<()> {
        if now < self.valid_from {
            return Err(FisioError::VoucherNotYetValid(self.code.clone()));
        }
        if self.is_past_validity(now) {
            return Err(FisioError::VoucherExpired(self.code.clone()));
        }
        Ok(())
    }

    fn check_holder(&self, patient: PatientId) -> Result<()> {
        if self.patient_id == patient {
            Ok(())
        } else {
            Err(FisioError::PatientMismatch(self.code.clone()))
        }
    }

    /// Consume one session.
    ///
    /// # Errors
    /// Returns [`FisioError::VoucherExhausted`] if nothing remains.
    pub fn apply_redemption(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.sessions_remaining() == 0 {
            return Err(FisioError::VoucherExhausted(self.code.clone()));
        }
        self.sessions_used += 1;
        if self.first_used_at.is_none() {
            self.first_used_at = Some(now);
        }
        self.last_used_at = Some(now);
        if self.sessions_remaining() == 0 {
            self.status = VoucherStatus::Used;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Give back one consumed session after a post-completion cancellation.
    ///
    /// A USED voucher returns to ACTIVE, or to EXPIRED if its window closed.
    ///
    /// # Errors
    /// Returns [`FisioError::InvariantViolation`] if no session was consumed.
    pub fn revert_redemption(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.sessions_used == 0 {
            return Err(FisioError::InvariantViolation(format!(
                "voucher {} has no consumed session to give back",
                self.code
            )));
        }
        self.sessions_used -= 1;
        if self.status == VoucherStatus::Used {
            self.status = if self.is_past_validity(now) {
                VoucherStatus::Expired
            } else {
                VoucherStatus::Active
            };
        }
        self.updated_at = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payment
    // ------------------------------------------------------------------

    /// Record a cleared payment.
    ///
    /// Returns `false` when the same `payment_id` was already recorded.
    ///
    /// # Errors
    /// [`FisioError::AlreadyPaid`] for a different id on a paid voucher;
    /// [`FisioError::IllegalTransition`] from a terminal payment status.
    pub fn confirm_payment(&mut self, payment_id: &str, method: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.payment_status {
            PaymentStatus::Paid => {
                if self.payment_id.as_deref() == Some(payment_id) {
                    Ok(false)
                } else {
                    Err(FisioError::AlreadyPaid {
                        code: self.code.clone(),
                        payment_id: self.payment_id.clone().unwrap_or_default(),
                    })
                }
            }
            PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Failed => {
                if self.status != VoucherStatus::Active {
                    return Err(self.status_error());
                }
                self.payment_status = PaymentStatus::Paid;
                self.payment_id = Some(payment_id.to_string());
                self.payment_method = Some(method.to_string());
                self.payment_failure = None;
                self.paid_at = Some(now);
                self.updated_at = now;
                info!(voucher = %self.code, payment_id, method, "Voucher payment confirmed");
                Ok(true)
            }
            PaymentStatus::Cancelled | PaymentStatus::Refunded => {
                Err(FisioError::illegal("payment", self.payment_status, "confirm"))
            }
        }
    }

    /// The gateway has picked the payment up.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] unless PENDING or FAILED.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.payment_status {
            PaymentStatus::Pending | PaymentStatus::Failed => {
                self.payment_status = PaymentStatus::Processing;
                self.updated_at = now;
                Ok(())
            }
            other => Err(FisioError::illegal("payment", other, "process")),
        }
    }

    /// A payment attempt failed; another may follow until the voucher expires.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] unless PENDING or PROCESSING.
    pub fn fail_payment(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        match self.payment_status {
            PaymentStatus::Pending | PaymentStatus::Processing => {
                self.payment_status = PaymentStatus::Failed;
                self.payment_failure = Some(reason.to_string());
                self.updated_at = now;
                info!(voucher = %self.code, reason, "Voucher payment failed");
                Ok(())
            }
            other => Err(FisioError::illegal("payment", other, "fail")),
        }
    }

    /// Abandon an unpaid voucher; both statuses become CANCELLED.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] once paid or already terminal.
    pub fn cancel_payment(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.payment_status {
            PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Failed => {
                self.payment_status = PaymentStatus::Cancelled;
                self.status = VoucherStatus::Cancelled;
                self.cancelled_at = Some(now);
                self.updated_at = now;
                info!(voucher = %self.code, "Voucher cancelled");
                Ok(())
            }
            other => Err(FisioError::illegal("payment", other, "cancel")),
        }
    }

    /// Return the money; both statuses become REFUNDED.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] unless the voucher is paid.
    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.payment_status != PaymentStatus::Paid {
            return Err(FisioError::illegal("payment", self.payment_status, "refund"));
        }
        self.payment_status = PaymentStatus::Refunded;
        self.status = VoucherStatus::Refunded;
        self.refunded_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, code, partner_id, patient_id, voucher_type, status, price, discount,
    final_price, unit_price, sessions_total, sessions_used, valid_from, valid_until,
    payment_status, payment_id, payment_method, payment_failure, paid_at, first_used_at,
    last_used_at, cancelled_at, refunded_at, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Voucher> {
    Ok(Voucher {
        id: get_parsed(row, 0)?,
        code: row.get(1)?,
        partner_id: get_parsed(row, 2)?,
        patient_id: get_parsed(row, 3)?,
        voucher_type: get_parsed(row, 4)?,
        status: get_parsed(row, 5)?,
        price: get_decimal(row, 6)?,
        discount: get_decimal(row, 7)?,
        final_price: get_decimal(row, 8)?,
        unit_price: get_opt_decimal(row, 9)?,
        sessions_total: row.get(10)?,
        sessions_used: row.get(11)?,
        valid_from: get_ts(row, 12)?,
        valid_until: get_ts(row, 13)?,
        payment_status: get_parsed(row, 14)?,
        payment_id: row.get(15)?,
        payment_method: row.get(16)?,
        payment_failure: row.get(17)?,
        paid_at: get_opt_ts(row, 18)?,
        first_used_at: get_opt_ts(row, 19)?,
        last_used_at: get_opt_ts(row, 20)?,
        cancelled_at: get_opt_ts(row, 21)?,
        refunded_at: get_opt_ts(row, 22)?,
        created_at: get_ts(row, 23)?,
        updated_at: get_ts(row, 24)?,
    })
}

/// Insert a new voucher row.
///
/// # Errors
/// Propagates SQLite failures (a duplicate code surfaces as a UNIQUE
/// violation).
pub fn insert(conn: &Connection, v: &Voucher) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO vouchers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
             ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
        ),
        params![
            v.id.to_string(),
            v.code,
            v.partner_id.to_string(),
            v.patient_id.to_string(),
            v.voucher_type.as_str(),
            v.status.as_str(),
            decimal_to_sql(&v.price),
            decimal_to_sql(&v.discount),
            decimal_to_sql(&v.final_price),
            v.unit_price.as_ref().map(decimal_to_sql),
            v.sessions_total,
            v.sessions_used,
            ts_to_sql(&v.valid_from),
            ts_to_sql(&v.valid_until),
            v.payment_status.as_str(),
            v.payment_id,
            v.payment_method,
            v.payment_failure,
            opt_ts_to_sql(v.paid_at.as_ref()),
            opt_ts_to_sql(v.first_used_at.as_ref()),
            opt_ts_to_sql(v.last_used_at.as_ref()),
            opt_ts_to_sql(v.cancelled_at.as_ref()),
            opt_ts_to_sql(v.refunded_at.as_ref()),
            ts_to_sql(&v.created_at),
            ts_to_sql(&v.updated_at),
        ],
    )?;
    Ok(())
}

/// Persist the mutable columns.
///
/// # Errors
/// Propagates SQLite failures; the `sessions_used` CHECK constraint rejects
/// counts outside `0..=sessions_total`.
pub fn save(conn: &Connection, v: &Voucher) -> Result<()> {
    conn.execute(
        "UPDATE vouchers SET status = ?2, sessions_used = ?3, payment_status = ?4,
            payment_id = ?5, payment_method = ?6, payment_failure = ?7, paid_at = ?8,
            first_used_at = ?9, last_used_at = ?10, cancelled_at = ?11, refunded_at = ?12,
            updated_at = ?13
         WHERE id = ?1",
        params![
            v.id.to_string(),
            v.status.as_str(),
            v.sessions_used,
            v.payment_status.as_str(),
            v.payment_id,
            v.payment_method,
            v.payment_failure,
            opt_ts_to_sql(v.paid_at.as_ref()),
            opt_ts_to_sql(v.first_used_at.as_ref()),
            opt_ts_to_sql(v.last_used_at.as_ref()),
            opt_ts_to_sql(v.cancelled_at.as_ref()),
            opt_ts_to_sql(v.refunded_at.as_ref()),
            ts_to_sql(&v.updated_at),
        ],
    )?;
    Ok(())
}

/// Load by row id.
///
/// # Errors
/// [`FisioError::VoucherNotFound`] if absent.
pub fn require(conn: &Connection, id: VoucherId) -> Result<Voucher> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM vouchers WHERE id = ?1"),
        params![id.to_string()],
        from_row,
    )
    .optional()?
    .ok_or_else(|| FisioError::VoucherNotFound(id.to_string()))
}

/// Load by public code.
///
/// # Errors
/// [`FisioError::VoucherNotFound`] if absent.
pub fn require_by_code(conn: &Connection, code: &str) -> Result<Voucher> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM vouchers WHERE code = ?1"),
        params![code],
        from_row,
    )
    .optional()?
    .ok_or_else(|| FisioError::VoucherNotFound(code.to_string()))
}

/// Mark every ACTIVE voucher whose window closed before `now` as EXPIRED.
///
/// # Errors
/// Propagates SQLite failures.
pub fn expire_due(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let now = ts_to_sql(&now);
    Ok(conn.execute(
        "UPDATE vouchers SET status = 'EXPIRED', updated_at = ?1
         WHERE status = 'ACTIVE' AND valid_until < ?1",
        params![now],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).single().expect("valid")
    }

    fn voucher(total: u32) -> Voucher {
        let now = start();
        Voucher {
            id: VoucherId::new(),
            code: "ABCD1234".into(),
            partner_id: PartnerId::new(),
            patient_id: PatientId::new(),
            voucher_type: VoucherType::Package,
            status: VoucherStatus::Active,
            price: dec!(300.00),
            discount: dec!(0.00),
            final_price: dec!(300.00),
            unit_price: Some(dec!(100.00)),
            sessions_total: total,
            sessions_used: 0,
            valid_from: now,
            valid_until: now + Duration::days(30),
            payment_status: PaymentStatus::Pending,
            payment_id: None,
            payment_method: None,
            payment_failure: None,
            paid_at: None,
            first_used_at: None,
            last_used_at: None,
            cancelled_at: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn unpaid_voucher_is_not_redeemable() {
        let v = voucher(3);
        let err = v.check_redeemable(v.patient_id, start()).expect_err("unpaid");
        assert!(matches!(err, FisioError::VoucherNotPaid(_)));
    }

    #[test]
    fn confirm_is_idempotent_on_payment_id() {
        let mut v = voucher(3);
        assert!(v.confirm_payment("pay_1", "pix", start()).expect("first"));
        assert!(!v.confirm_payment("pay_1", "pix", start()).expect("again"));
        let err = v.confirm_payment("pay_2", "pix", start()).expect_err("other id");
        assert!(matches!(err, FisioError::AlreadyPaid { .. }));
    }

    #[test]
    fn failed_payment_can_be_retried() {
        let mut v = voucher(1);
        v.mark_processing(start()).expect("processing");
        v.fail_payment("card declined", start()).expect("fail");
        v.mark_processing(start()).expect("retry");
        assert!(v.confirm_payment("pay_9", "card", start()).expect("paid"));
        assert_eq!(v.payment_failure, None);
    }

    #[test]
    fn validity_window_is_inclusive() {
        let mut v = voucher(3);
        v.confirm_payment("pay_1", "pix", start()).expect("paid");
        assert!(v.check_redeemable(v.patient_id, v.valid_until).is_ok());
        let late = v.valid_until + Duration::nanoseconds(1);
        assert!(matches!(v.check_redeemable(v.patient_id, late), Err(FisioError::VoucherExpired(_))));
        let early = v.valid_from - Duration::nanoseconds(1);
        assert!(matches!(v.check_redeemable(v.patient_id, early), Err(FisioError::VoucherNotYetValid(_))));
    }

    #[test]
    fn last_session_marks_used_and_revert_reopens() {
        let mut v = voucher(1);
        v.confirm_payment("pay_1", "pix", start()).expect("paid");
        v.apply_redemption(start()).expect("redeem");
        assert_eq!(v.status, VoucherStatus::Used);
        assert_eq!(v.sessions_used + v.sessions_remaining(), v.sessions_total);
        assert!(matches!(v.check_redeemable(v.patient_id, start()), Err(FisioError::VoucherExhausted(_))));

        v.revert_redemption(start()).expect("revert");
        assert_eq!(v.status, VoucherStatus::Active);
        assert_eq!(v.sessions_used, 0);
    }

    #[test]
    fn revert_after_window_expires() {
        let mut v = voucher(1);
        v.confirm_payment("pay_1", "pix", start()).expect("paid");
        v.apply_redemption(start()).expect("redeem");
        v.revert_redemption(v.valid_until + Duration::days(1)).expect("revert");
        assert_eq!(v.status, VoucherStatus::Expired);
    }

    #[test]
    fn other_patient_is_rejected() {
        let mut v = voucher(2);
        v.confirm_payment("pay_1", "pix", start()).expect("paid");
        let err = v.check_redeemable(PatientId::new(), start()).expect_err("mismatch");
        assert!(matches!(err, FisioError::PatientMismatch(_)));
    }

    #[test]
    fn cancel_only_before_payment() {
        let mut v = voucher(2);
        v.confirm_payment("pay_1", "pix", start()).expect("paid");
        assert!(matches!(v.cancel_payment(start()), Err(FisioError::IllegalTransition { .. })));

        let mut w = voucher(2);
        w.cancel_payment(start()).expect("cancel");
        assert_eq!(w.status, VoucherStatus::Cancelled);
        assert!(matches!(w.refund(start()), Err(FisioError::IllegalTransition { .. })));
    }
}
