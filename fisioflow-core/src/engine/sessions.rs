//! Scheduling, redemption (the hot path) and cancellation of sessions.
//!
//! Redemption runs entirely inside one write transaction: the voucher row is
//! read and checked, `sessions_used` is bumped, the commission snapshot is
//! frozen on the session, the five settlement entries are appended and the
//! partner aggregates updated. Two concurrent redemptions of the last session
//! serialize on that transaction; the loser sees the voucher USED and fails
//! with `VoucherExhausted`.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::VoucherEngine;
use super::partners::patient_exists;
use crate::commission::CommissionSnapshot;
use crate::error::{FisioError, Result};
use crate::ledger::{self, LedgerEntry};
use crate::metrics::FisioCounters;
use crate::money::{is_money, to_cents};
use crate::partner::{self, Partner};
use crate::session::{self, Session, SessionMetadata};
use crate::types::{LedgerKind, Money, PartnerId, PatientId, SessionId, SessionStatus, VoucherType};
use crate::voucher::{self, Voucher};

/// What a session is paid with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SessionSource {
    /// Redeemed against the voucher with this code.
    Voucher {
        /// Public voucher code.
        code: String,
    },
    /// Paid directly to the partner; the metadata must carry a price.
    Cash {
        /// Partner rendering the session.
        partner_id: PartnerId,
    },
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    /// The COMPLETED session with its frozen snapshot.
    pub session: Session,
    /// The voucher after the redemption, for voucher sessions.
    pub voucher: Option<Voucher>,
    /// The partner with updated balances.
    pub partner: Partner,
    /// The five settlement entries.
    pub entries: Vec<LedgerEntry>,
}

fn session_price(voucher: Option<&Voucher>, meta: &SessionMetadata) -> Result<Money> {
    let price = match (voucher, meta.price) {
        (Some(v), explicit) if v.voucher_type != VoucherType::Unlimited => {
            let unit = v
                .unit_price
                .ok_or_else(|| FisioError::InvalidAmounts(format!("voucher {} has no unit price", v.code)))?;
            match explicit {
                Some(price) if price != unit => {
                    return Err(FisioError::InvalidAmounts(format!(
                        "voucher {} sessions are priced at {unit}, not {price}",
                        v.code
                    )));
                }
                _ => unit,
            }
        }
        (_, Some(price)) => price,
        (Some(v), None) => {
            return Err(FisioError::InvalidAmounts(format!(
                "UNLIMITED voucher {} needs an explicit session price",
                v.code
            )));
        }
        (None, None) => return Err(FisioError::InvalidAmounts("a cash session needs a price".into())),
    };
    if price <= Decimal::ZERO || !is_money(price) {
        return Err(FisioError::InvalidAmounts(format!("session price {price} must be a positive cent value")));
    }
    Ok(to_cents(price))
}

/// The session that uses up a bounded voucher also carries the cents that
/// `unit_price` rounded away, so the settled sessions of a voucher add up to
/// its `final_price`. Call before `apply_redemption`, with `s` not yet
/// settled.
fn price_last_session(conn: &Connection, v: &Voucher, s: &mut Session) -> Result<()> {
    if v.voucher_type == VoucherType::Unlimited || v.sessions_used + 1 != v.sessions_total {
        return Ok(());
    }
    let booked: Money = session::for_voucher(conn, v.id)?
        .iter()
        .filter(|other| other.is_settled())
        .map(|other| other.price)
        .sum();
    let price = to_cents(v.final_price - booked);
    if price <= Decimal::ZERO {
        return Err(FisioError::InvariantViolation(format!(
            "voucher {} already settled {booked} of {}",
            v.code, v.final_price
        )));
    }
    s.price = price;
    Ok(())
}

/// Complete `session`: freeze the partner's current split, append the
/// settlement entries and move the aggregates. The caller saves `partner`.
fn settle(conn: &Connection, partner: &mut Partner, session: &mut Session, now: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
    partner.ensure_active()?;
    let snapshot = CommissionSnapshot::compute(session.price, partner.split);
    if snapshot.total() != session.price {
        return Err(FisioError::InvariantViolation(format!(
            "snapshot of session {} sums to {} instead of {}",
            session.id,
            snapshot.total(),
            session.price
        )));
    }
    session.complete(snapshot, now)?;
    session::save(conn, session)?;
    let entries = ledger::append_settlement(conn, partner.id, session.id, session.price, &snapshot, now)?;

    partner.total_revenue += session.price;
    partner.total_commission += snapshot.fees_total();
    partner.pending_balance += snapshot.partner_net;
    partner.completed_sessions += 1;
    partner.updated_at = now;
    Ok(entries)
}

/// Reverse every outstanding settlement entry of `session` and move the
/// partner aggregates back. A matured credit comes out of the available
/// balance, an unmatured one out of the pending balance. The caller saves
/// `partner`; `session` is saved here.
pub(super) fn reverse_settlement(
    conn: &Connection,
    partner: &mut Partner,
    session: &mut Session,
    cancel: bool,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<LedgerEntry>> {
    let originals = ledger::reversible_for_session(conn, session.id)?;
    let mut reversals = Vec::with_capacity(originals.len());
    for original in &originals {
        let amount = original.amount;
        match original.kind {
            LedgerKind::Revenue => partner.total_revenue -= amount,
            LedgerKind::FeePlatform | LedgerKind::FeeGateway | LedgerKind::FeeTax => {
                partner.total_commission -= amount;
            }
            LedgerKind::PartnerCredit => partner.pending_balance -= amount,
            LedgerKind::BalanceMature => {
                partner.pending_balance += amount;
                partner.available_balance -= amount;
            }
            LedgerKind::WithdrawalDebit | LedgerKind::Reversal => {
                return Err(FisioError::InvariantViolation(format!(
                    "session {} carries a {} entry",
                    session.id, original.kind
                )));
            }
        }
        reversals.push(ledger::reverse(conn, original, now)?);
    }

    session.reverse(cancel, reason, now)?;
    session::save(conn, session)?;
    partner.completed_sessions = partner.completed_sessions.saturating_sub(1);
    if cancel {
        partner.cancelled_sessions += 1;
    }
    partner.updated_at = now;
    partner.check_balances()?;

    info!(
        partner = %partner.id,
        session = %session.id,
        entries = reversals.len(),
        matured = session.matured_at.is_some(),
        "Settlement reversed"
    );
    Ok(reversals)
}

impl VoucherEngine {
    /// Book a session without completing it.
    ///
    /// Voucher sessions check status, validity window and holder; payment
    /// and remaining sessions are checked at completion.
    ///
    /// # Errors
    /// Redemption preconditions, `PatientUnknown`, `InvalidAmounts`.
    pub fn schedule_session(&self, source: &SessionSource, patient_id: PatientId, meta: &SessionMetadata) -> Result<Session> {
        let now = self.now();
        let s = self.db.write(|tx| {
            let (voucher, mut p) = match source {
                SessionSource::Voucher { code } => {
                    let v = voucher::require_by_code(tx, code)?;
                    v.check_schedulable(patient_id, now)?;
                    let p = partner::require(tx, v.partner_id)?;
                    (Some(v), p)
                }
                SessionSource::Cash { partner_id } => {
                    if !patient_exists(tx, patient_id)? {
                        return Err(FisioError::PatientUnknown(patient_id));
                    }
                    (None, partner::require(tx, *partner_id)?)
                }
            };
            p.ensure_active()?;
            let price = session_price(voucher.as_ref(), meta)?;

            let s = Session::scheduled(voucher.map(|v| v.id), p.id, patient_id, price, meta, now);
            session::insert(tx, &s)?;
            p.total_sessions += 1;
            p.updated_at = now;
            partner::save(tx, &p)?;
            Ok(s)
        })?;
        debug!(session = %s.id, partner = %s.partner_id, "Session scheduled");
        Ok(s)
    }

    /// Complete a scheduled session, redeeming its voucher if it has one.
    ///
    /// # Errors
    /// `SessionNotFound`, `IllegalTransition`, or any redemption
    /// precondition.
    pub fn complete_session(&self, id: SessionId) -> Result<Redemption> {
        let now = self.now();
        let result = self.db.write(|tx| {
            let mut s = session::require(tx, id)?;
            if s.status != SessionStatus::Scheduled {
                return Err(FisioError::illegal("session", s.status, "complete"));
            }
            let voucher = match s.voucher_id {
                Some(vid) => {
                    let mut v = voucher::require(tx, vid)?;
                    v.check_redeemable(s.patient_id, now)?;
                    price_last_session(tx, &v, &mut s)?;
                    v.apply_redemption(now)?;
                    voucher::save(tx, &v)?;
                    Some(v)
                }
                None => None,
            };
            let mut p = partner::require(tx, s.partner_id)?;
            let entries = settle(tx, &mut p, &mut s, now)?;
            partner::save(tx, &p)?;
            Ok(Redemption {
                session: s,
                voucher,
                partner: p,
                entries,
            })
        });
        self.finish_redemption(result)
    }

    /// Redeem one session of the voucher with `code` for `patient_id`:
    /// schedule and complete in a single transaction.
    ///
    /// # Errors
    /// `VoucherNotFound`, `VoucherNotPaid`, `VoucherNotYetValid`,
    /// `VoucherExpired`, `VoucherExhausted`, `VoucherStatusInvalid`,
    /// `PatientMismatch`, `PartnerNotActive`, `InvalidAmounts`.
    pub fn redeem_session(&self, code: &str, patient_id: PatientId, meta: &SessionMetadata) -> Result<Redemption> {
        let now = self.now();
        let result = self.with_voucher_locked(code, |tx, v| {
            v.check_redeemable(patient_id, now)?;
            let mut p = partner::require(tx, v.partner_id)?;
            p.ensure_active()?;
            let price = session_price(Some(v), meta)?;

            let mut s = Session::scheduled(Some(v.id), p.id, patient_id, price, meta, now);
            price_last_session(tx, v, &mut s)?;
            session::insert(tx, &s)?;
            p.total_sessions += 1;
            v.apply_redemption(now)?;
            let entries = settle(tx, &mut p, &mut s, now)?;
            partner::save(tx, &p)?;
            Ok(Redemption {
                session: s,
                voucher: Some(v.clone()),
                partner: p,
                entries,
            })
        });
        self.finish_redemption(result)
    }

    fn finish_redemption(&self, result: Result<Redemption>) -> Result<Redemption> {
        match result {
            Ok(r) => {
                FisioCounters::add(&self.counters.redemptions, 1);
                info!(
                    session = %r.session.id,
                    voucher = r.voucher.as_ref().map_or("-", |v| v.code.as_str()),
                    partner = %r.partner.id,
                    gross = %r.session.price,
                    pending_balance = %r.partner.pending_balance,
                    "Session completed"
                );
                Ok(r)
            }
            Err(err) => {
                self.note_rejection(&err);
                debug!(kind = %err.kind(), error = %err, "Redemption refused");
                Err(err)
            }
        }
    }

    /// Cancel a session or record a no-show.
    ///
    /// Before completion nothing but the status moves. After completion the
    /// settlement is reversed and the voucher gets its session back; a
    /// no-show cannot be recorded for a completed session.
    ///
    /// # Errors
    /// `SessionNotFound`, `IllegalTransition`, or `InvariantViolation` if
    /// the reversal would drive a balance negative.
    pub fn cancel_session(&self, id: SessionId, reason: Option<&str>, no_show: bool) -> Result<Session> {
        let now = self.now();
        let (s, reversed) = self.db.write(|tx| {
            let mut s = session::require(tx, id)?;
            let mut p = partner::require(tx, s.partner_id)?;
            let reversed = match s.status {
                SessionStatus::Scheduled => {
                    s.cancel_scheduled(no_show, reason, now)?;
                    session::save(tx, &s)?;
                    if no_show {
                        p.no_show_sessions += 1;
                    } else {
                        p.cancelled_sessions += 1;
                    }
                    p.updated_at = now;
                    false
                }
                SessionStatus::Completed if !no_show && s.reversed_at.is_none() => {
                    reverse_settlement(tx, &mut p, &mut s, true, reason, now)?;
                    if let Some(vid) = s.voucher_id {
                        let mut v = voucher::require(tx, vid)?;
                        v.revert_redemption(now)?;
                        voucher::save(tx, &v)?;
                    }
                    true
                }
                other => {
                    let action = if no_show { "mark no-show" } else { "cancel" };
                    return Err(FisioError::illegal("session", other, action));
                }
            };
            partner::save(tx, &p)?;
            Ok((s, reversed))
        })?;

        if reversed {
            FisioCounters::add(&self.counters.reversals, 1);
        }
        info!(session = %s.id, status = %s.status, reversed, "Session cancelled");
        Ok(s)
    }

    /// # Errors
    /// `SessionNotFound`.
    pub fn get_session(&self, id: SessionId) -> Result<Session> {
        self.db.read(|conn| session::require(conn, id))
    }

    /// Every session of a partner, oldest first.
    ///
    /// # Errors
    /// `PartnerNotFound`.
    pub fn partner_sessions(&self, partner_id: PartnerId) -> Result<Vec<Session>> {
        self.db.read(|conn| {
            partner::require(conn, partner_id)?;
            session::for_partner(conn, partner_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn unlimited_voucher_needs_explicit_price() {
        let meta = SessionMetadata::default();
        assert!(matches!(session_price(None, &meta), Err(FisioError::InvalidAmounts(_))));
        let priced = SessionMetadata {
            price: Some(dec!(90)),
            ..SessionMetadata::default()
        };
        assert_eq!(session_price(None, &priced).expect("price").to_string(), "90.00");
        let bad = SessionMetadata {
            price: Some(dec!(0.001)),
            ..SessionMetadata::default()
        };
        assert!(session_price(None, &bad).is_err());
    }
}
