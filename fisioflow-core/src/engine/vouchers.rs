//! Voucher issuance, payment lifecycle, refund and expiry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::VoucherEngine;
use super::partners::patient_exists;
use super::sessions::reverse_settlement;
use crate::code;
use crate::error::{FisioError, Result};
use crate::metrics::FisioCounters;
use crate::money::{floor_money, is_money, to_cents};
use crate::partner;
use crate::session;
use crate::types::{Money, PartnerId, PatientId, PaymentStatus, SessionStatus, VoucherId, VoucherStatus, VoucherType};
use crate::voucher::{self, Voucher};

/// Input of [`VoucherEngine::issue_voucher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueVoucher {
    /// Issuing partner (must be ACTIVE).
    pub partner_id: PartnerId,
    /// Holder (must be registered).
    pub patient_id: PatientId,
    /// Bundle kind.
    pub voucher_type: VoucherType,
    /// Sessions bought; ignored for UNLIMITED, must be 1 for SINGLE.
    pub sessions_total: u32,
    /// List price of the whole bundle.
    pub price: Money,
    /// Discount off the list price.
    #[serde(default)]
    pub discount: Option<Money>,
    /// First redeemable instant; defaults to now.
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    /// Last redeemable instant.
    pub valid_until: DateTime<Utc>,
}

impl VoucherEngine {
    /// Issue a voucher: ACTIVE, payment PENDING, nothing used. Issuance is
    /// not revenue, so no ledger entry is written.
    ///
    /// # Errors
    /// `PartnerNotFound`, `PartnerNotActive`, `PatientUnknown`,
    /// `InvalidAmounts`, `InvalidDateRange`, `CodeExhausted`.
    pub fn issue_voucher(&self, req: &IssueVoucher) -> Result<Voucher> {
        let now = self.now();
        let valid_from = req.valid_from.unwrap_or(now);
        if req.valid_until <= valid_from {
            return Err(FisioError::InvalidDateRange);
        }

        let discount = req.discount.unwrap_or(Decimal::ZERO);
        if req.price <= Decimal::ZERO || !is_money(req.price) {
            return Err(FisioError::InvalidAmounts(format!("price {} must be a positive cent value", req.price)));
        }
        if discount.is_sign_negative() || !is_money(discount) || discount > req.price {
            return Err(FisioError::InvalidAmounts(format!(
                "discount {discount} must be between 0 and the price {}",
                req.price
            )));
        }
        let final_price = to_cents(req.price - discount);

        let sessions_total = match req.voucher_type {
            VoucherType::Unlimited => self.config.voucher.unlimited_sessions,
            VoucherType::Single if req.sessions_total != 1 => {
                return Err(FisioError::InvalidAmounts("a SINGLE voucher holds exactly one session".into()));
            }
            _ if req.sessions_total == 0 => {
                return Err(FisioError::InvalidAmounts("sessions_total must be at least 1".into()));
            }
            _ => req.sessions_total,
        };
        let unit_price = match req.voucher_type {
            VoucherType::Unlimited => None,
            _ => Some(to_cents(floor_money(final_price / Decimal::from(sessions_total)))),
        };

        let v = self.db.write(|tx| {
            let p = partner::require(tx, req.partner_id)?;
            p.ensure_active()?;
            if !patient_exists(tx, req.patient_id)? {
                return Err(FisioError::PatientUnknown(req.patient_id));
            }

            let code = code::allocate(tx, &self.config.voucher)?;
            let v = Voucher {
                id: VoucherId::new(),
                code,
                partner_id: req.partner_id,
                patient_id: req.patient_id,
                voucher_type: req.voucher_type,
                status: VoucherStatus::Active,
                price: to_cents(req.price),
                discount: to_cents(discount),
                final_price,
                unit_price,
                sessions_total,
                sessions_used: 0,
                valid_from,
                valid_until: req.valid_until,
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
            };
            voucher::insert(tx, &v)?;
            Ok(v)
        })?;

        FisioCounters::add(&self.counters.vouchers_issued, 1);
        info!(
            voucher = %v.code,
            partner = %v.partner_id,
            kind = %v.voucher_type,
            sessions = v.sessions_total,
            final_price = %v.final_price,
            "Voucher issued"
        );
        Ok(v)
    }

    fn update_voucher<F>(&self, id: VoucherId, f: F) -> Result<Voucher>
    where
        F: FnOnce(&mut Voucher, DateTime<Utc>) -> Result<()>,
    {
        let now = self.now();
        self.db.write(|tx| {
            let mut v = voucher::require(tx, id)?;
            f(&mut v, now)?;
            voucher::save(tx, &v)?;
            Ok(v)
        })
    }

    /// Record a cleared payment. Re-presenting the same
    /// `external_payment_id` is a no-op that returns the voucher unchanged.
    ///
    /// # Errors
    /// `VoucherNotFound`; `AlreadyPaid` for a different payment id.
    pub fn confirm_payment(&self, id: VoucherId, external_payment_id: &str, method: &str) -> Result<Voucher> {
        let mut changed = false;
        let v = self.update_voucher(id, |v, now| {
            changed = v.confirm_payment(external_payment_id, method, now)?;
            Ok(())
        })?;
        if changed {
            FisioCounters::add(&self.counters.payments_confirmed, 1);
        }
        Ok(v)
    }

    /// PENDING/FAILED → PROCESSING.
    ///
    /// # Errors
    /// `VoucherNotFound` or `IllegalTransition`.
    pub fn mark_payment_processing(&self, id: VoucherId) -> Result<Voucher> {
        self.update_voucher(id, |v, now| v.mark_processing(now))
    }

    /// Record a failed payment attempt.
    ///
    /// # Errors
    /// `VoucherNotFound` or `IllegalTransition`.
    pub fn fail_payment(&self, id: VoucherId, reason: &str) -> Result<Voucher> {
        self.update_voucher(id, |v, now| v.fail_payment(reason, now))
    }

    /// Abandon an unpaid voucher.
    ///
    /// # Errors
    /// `VoucherNotFound` or `IllegalTransition`.
    pub fn cancel_payment(&self, id: VoucherId) -> Result<Voucher> {
        self.update_voucher(id, |v, now| v.cancel_payment(now))
    }

    /// Refund a paid voucher.
    ///
    /// Every settled session against it gets a reversal group (matured
    /// credits come out of the available balance), scheduled sessions are
    /// cancelled, and `sessions_used` is left as it was.
    ///
    /// # Errors
    /// `VoucherNotFound`, `IllegalTransition` if unpaid, or
    /// `InvariantViolation` if a reversal would drive a balance negative.
    pub fn refund_voucher(&self, id: VoucherId) -> Result<Voucher> {
        let now = self.now();
        let (v, reversed) = self.db.write(|tx| {
            let mut v = voucher::require(tx, id)?;
            v.refund(now)?;
            let mut p = partner::require(tx, v.partner_id)?;

            let mut reversed = 0u64;
            for mut s in session::for_voucher(tx, v.id)? {
                if s.is_settled() {
                    reverse_settlement(tx, &mut p, &mut s, false, Some("voucher refunded"), now)?;
                    reversed += 1;
                } else if s.status == SessionStatus::Scheduled {
                    s.cancel_scheduled(false, Some("voucher refunded"), now)?;
                    session::save(tx, &s)?;
                    p.cancelled_sessions += 1;
                }
            }
            p.updated_at = now;
            partner::save(tx, &p)?;
            voucher::save(tx, &v)?;
            Ok::<_, FisioError>((v, reversed))
        })?;

        FisioCounters::add(&self.counters.reversals, reversed);
        info!(voucher = %v.code, reversed, "Voucher refunded");
        Ok(v)
    }

    /// Load a voucher by id, expiring it first if its window closed.
    ///
    /// # Errors
    /// `VoucherNotFound`.
    pub fn get_voucher(&self, id: VoucherId) -> Result<Voucher> {
        let now = self.now();
        self.db.write(|tx| {
            let mut v = voucher::require(tx, id)?;
            if v.expire_if_due(now) {
                voucher::save(tx, &v)?;
            }
            Ok(v)
        })
    }

    /// Load a voucher by code, expiring it first if its window closed.
    ///
    /// # Errors
    /// `VoucherNotFound`.
    pub fn get_voucher_by_code(&self, code: &str) -> Result<Voucher> {
        let now = self.now();
        self.with_voucher_locked(code, |_, v| {
            v.expire_if_due(now);
            Ok(v.clone())
        })
    }

    /// Expire every ACTIVE voucher whose window has closed. Returns how many
    /// changed.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn expire_vouchers(&self) -> Result<usize> {
        let now = self.now();
        let expired = self.db.write(|tx| voucher::expire_due(tx, now))?;
        if expired > 0 {
            info!(expired, "Vouchers expired");
        }
        Ok(expired)
    }
}
