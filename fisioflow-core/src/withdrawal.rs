//! Partner withdrawals and their state machine.
//!
//! ```text
//!          +---- cancel ----+
//!          v                |
//! PENDING ---- dispatch --> PROCESSING ---- complete --> COMPLETED
//!    |                          |
//!    |                          +---- fail --> FAILED
//!    +---- cancel --> CANCELLED
//! ```
//!
//! Dispatch reserves the amount (`reserved = 1`); complete turns the
//! reservation into a `WITHDRAWAL_DEBIT` entry; fail and cancel release it.

use chrono::{DateTime, Utc};
use fisioflow_store::codec::{
    decimal_to_sql, get_decimal, get_opt_ts, get_parsed, get_ts, opt_ts_to_sql, ts_to_sql, OptionalExt,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::WithdrawalConfig;
use crate::error::{FisioError, Result};
use crate::money::{is_money, round_money, to_cents};
use crate::types::{Money, PartnerId, WithdrawalId, WithdrawalStatus};

/// Longest accepted PIX key (an EVP random key is 36, a URL-style key 77).
const PIX_KEY_MAX: usize = 77;

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// Where the money goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    /// Brazilian instant payment key.
    Pix {
        /// CPF, CNPJ, e-mail, phone or random key.
        key: String,
    },
    /// Bank transfer.
    Bank {
        /// Three-digit bank code.
        bank_code: String,
        /// Branch number.
        branch: String,
        /// Account number (may carry a check digit such as `12345-6`).
        account: String,
        /// CPF (11 digits) or CNPJ (14 digits) of the holder.
        holder_document: String,
    },
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl Destination {
    /// # Errors
    /// [`FisioError::InvalidDestination`] describing the malformed field.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Pix { key } => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(FisioError::InvalidDestination("PIX key is empty".into()));
                }
                if key.chars().count() > PIX_KEY_MAX {
                    return Err(FisioError::InvalidDestination(format!(
                        "PIX key longer than {PIX_KEY_MAX} characters"
                    )));
                }
            }
            Self::Bank {
                bank_code,
                branch,
                account,
                holder_document,
            } => {
                if bank_code.len() != 3 || !all_digits(bank_code) {
                    return Err(FisioError::InvalidDestination("bank_code must be 3 digits".into()));
                }
                if !all_digits(branch) {
                    return Err(FisioError::InvalidDestination("branch must be digits".into()));
                }
                if account.trim().is_empty() {
                    return Err(FisioError::InvalidDestination("account is empty".into()));
                }
                if !all_digits(holder_document) || !matches!(holder_document.len(), 11 | 14) {
                    return Err(FisioError::InvalidDestination(
                        "holder_document must be 11 (CPF) or 14 (CNPJ) digits".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// `round(fee_fixed + amount * fee_percent / 100)`.
#[must_use]
pub fn fee_for(amount: Money, config: &WithdrawalConfig) -> Money {
    to_cents(round_money(config.fee_fixed + amount * config.fee_percent / Decimal::ONE_HUNDRED))
}

// ---------------------------------------------------------------------------
// Withdrawal
// ---------------------------------------------------------------------------

/// A partner cash-out request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Identifier.
    pub id: WithdrawalId,
    /// Requesting partner.
    pub partner_id: PartnerId,
    /// Gross amount debited from the balance.
    pub amount: Money,
    /// Fee withheld.
    pub fee: Money,
    /// `amount - fee`, what reaches the destination.
    pub net_amount: Money,
    /// Lifecycle status.
    pub status: WithdrawalStatus,
    /// Payout destination.
    pub destination: Destination,
    /// Payout job reference, set at dispatch.
    pub external_ref: Option<String>,
    /// Payment rail transaction id, set at completion.
    pub transaction_id: Option<String>,
    /// The amount is currently held against the available balance.
    pub reserved: bool,
    /// Why the payout failed.
    pub failure_reason: Option<String>,
    /// Why it was cancelled.
    pub cancel_reason: Option<String>,
    /// Creation instant.
    pub requested_at: DateTime<Utc>,
    /// PENDING → PROCESSING instant.
    pub processing_at: Option<DateTime<Utc>>,
    /// COMPLETED instant.
    pub completed_at: Option<DateTime<Utc>>,
    /// FAILED instant.
    pub failed_at: Option<DateTime<Utc>>,
    /// CANCELLED instant.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl Withdrawal {
    /// Build a PENDING request with its fee.
    ///
    /// # Errors
    /// [`FisioError::InvalidAmounts`] for a non-positive or sub-cent amount,
    /// or a fee that would swallow the whole amount.
    pub fn request(
        partner_id: PartnerId,
        amount: Money,
        destination: Destination,
        config: &WithdrawalConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if amount <= Decimal::ZERO || !is_money(amount) {
            return Err(FisioError::InvalidAmounts(format!("withdrawal amount {amount} is not a positive cent value")));
        }
        let fee = fee_for(amount, config);
        if fee >= amount {
            return Err(FisioError::InvalidAmounts(format!("fee {fee} consumes the whole amount {amount}")));
        }
        Ok(Self {
            id: WithdrawalId::new(),
            partner_id,
            amount: to_cents(amount),
            fee,
            net_amount: to_cents(amount - fee),
            status: WithdrawalStatus::Pending,
            destination,
            external_ref: None,
            transaction_id: None,
            reserved: false,
            failure_reason: None,
            cancel_reason: None,
            requested_at: now,
            processing_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: now,
        })
    }

    /// PENDING → PROCESSING, reserving the amount.
    ///
    /// Returns `false` when the same `external_ref` was already applied, in
    /// which case nothing changes.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] otherwise.
    pub fn dispatch(&mut self, external_ref: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.external_ref.as_deref() == Some(external_ref) {
            return Ok(false);
        }
        if self.status != WithdrawalStatus::Pending {
            return Err(FisioError::illegal("withdrawal", self.status, "dispatch"));
        }
        self.status = WithdrawalStatus::Processing;
        self.external_ref = Some(external_ref.to_string());
        self.reserved = true;
        self.processing_at = Some(now);
        self.updated_at = now;
        Ok(true)
    }

    /// PROCESSING → COMPLETED, consuming the reservation.
    ///
    /// Returns `false` when already completed with this `transaction_id`.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] otherwise.
    pub fn complete(&mut self, transaction_id: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.status == WithdrawalStatus::Completed && self.transaction_id.as_deref() == Some(transaction_id) {
            return Ok(false);
        }
        if self.status != WithdrawalStatus::Processing {
            return Err(FisioError::illegal("withdrawal", self.status, "complete"));
        }
        self.status = WithdrawalStatus::Completed;
        self.transaction_id = Some(transaction_id.to_string());
        self.reserved = false;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(true)
    }

    /// PROCESSING → FAILED, releasing the reservation.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] unless PROCESSING.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status != WithdrawalStatus::Processing {
            return Err(FisioError::illegal("withdrawal", self.status, "fail"));
        }
        self.status = WithdrawalStatus::Failed;
        self.failure_reason = Some(reason.to_string());
        self.reserved = false;
        self.failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// PENDING/PROCESSING → CANCELLED. Returns whether a reservation was
    /// released.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] from a terminal status.
    pub fn cancel(&mut self, reason: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        if self.status.is_terminal() {
            return Err(FisioError::illegal("withdrawal", self.status, "cancel"));
        }
        let released = self.reserved;
        self.status = WithdrawalStatus::Cancelled;
        self.cancel_reason = reason.map(str::to_string);
        self.reserved = false;
        self.cancelled_at = Some(now);
        self.updated_at = now;
        Ok(released)
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, partner_id, amount, fee, net_amount, status, destination, external_ref,
    transaction_id, reserved, failure_reason, cancel_reason, requested_at, processing_at,
    completed_at, failed_at, cancelled_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Withdrawal> {
    let raw: String = row.get(6)?;
    let destination = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(Withdrawal {
        id: get_parsed(row, 0)?,
        partner_id: get_parsed(row, 1)?,
        amount: get_decimal(row, 2)?,
        fee: get_decimal(row, 3)?,
        net_amount: get_decimal(row, 4)?,
        status: get_parsed(row, 5)?,
        destination,
        external_ref: row.get(7)?,
        transaction_id: row.get(8)?,
        reserved: row.get(9)?,
        failure_reason: row.get(10)?,
        cancel_reason: row.get(11)?,
        requested_at: get_ts(row, 12)?,
        processing_at: get_opt_ts(row, 13)?,
        completed_at: get_opt_ts(row, 14)?,
        failed_at: get_opt_ts(row, 15)?,
        cancelled_at: get_opt_ts(row, 16)?,
        updated_at: get_ts(row, 17)?,
    })
}

fn destination_json(d: &Destination) -> Result<String> {
    serde_json::to_string(d).map_err(|e| FisioError::InvalidDestination(e.to_string()))
}

/// Insert a new withdrawal row.
///
/// # Errors
/// Propagates SQLite failures.
pub fn insert(conn: &Connection, w: &Withdrawal) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO withdrawals ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
             ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        ),
        params![
            w.id.to_string(),
            w.partner_id.to_string(),
            decimal_to_sql(&w.amount),
            decimal_to_sql(&w.fee),
            decimal_to_sql(&w.net_amount),
            w.status.as_str(),
            destination_json(&w.destination)?,
            w.external_ref,
            w.transaction_id,
            w.reserved,
            w.failure_reason,
            w.cancel_reason,
            ts_to_sql(&w.requested_at),
            opt_ts_to_sql(w.processing_at.as_ref()),
            opt_ts_to_sql(w.completed_at.as_ref()),
            opt_ts_to_sql(w.failed_at.as_ref()),
            opt_ts_to_sql(w.cancelled_at.as_ref()),
            ts_to_sql(&w.updated_at),
        ],
    )?;
    Ok(())
}

/// Persist the mutable columns.
///
/// # Errors
/// Propagates SQLite failures; reusing another withdrawal's `external_ref`
/// violates its unique index.
pub fn save(conn: &Connection, w: &Withdrawal) -> Result<()> {
    conn.execute(
        "UPDATE withdrawals SET status = ?2, external_ref = ?3, transaction_id = ?4,
            reserved = ?5, failure_reason = ?6, cancel_reason = ?7, processing_at = ?8,
            completed_at = ?9, failed_at = ?10, cancelled_at = ?11, updated_at = ?12
         WHERE id = ?1",
        params![
            w.id.to_string(),
            w.status.as_str(),
            w.external_ref,
            w.transaction_id,
            w.reserved,
            w.failure_reason,
            w.cancel_reason,
            opt_ts_to_sql(w.processing_at.as_ref()),
            opt_ts_to_sql(w.completed_at.as_ref()),
            opt_ts_to_sql(w.failed_at.as_ref()),
            opt_ts_to_sql(w.cancelled_at.as_ref()),
            ts_to_sql(&w.updated_at),
        ],
    )?;
    Ok(())
}

/// Load a withdrawal or fail with [`FisioError::WithdrawalNotFound`].
///
/// # Errors
/// See above.
pub fn require(conn: &Connection, id: WithdrawalId) -> Result<Withdrawal> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM withdrawals WHERE id = ?1"),
        params![id.to_string()],
        from_row,
    )
    .optional()?
    .ok_or(FisioError::WithdrawalNotFound(id))
}

/// Withdrawals of a partner, newest first.
///
/// # Errors
/// Propagates SQLite failures.
pub fn for_partner(conn: &Connection, partner: PartnerId) -> Result<Vec<Withdrawal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM withdrawals WHERE partner_id = ?1 ORDER BY requested_at DESC, id"
    ))?;
    let rows = stmt
        .query_map(params![partner.to_string()], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).single().expect("valid")
    }

    fn pix() -> Destination {
        Destination::Pix {
            key: "ana@example.com".into(),
        }
    }

    #[test]
    fn destinations_are_validated() {
        assert!(pix().validate().is_ok());
        assert!(Destination::Pix { key: "  ".into() }.validate().is_err());
        let bank = Destination::Bank {
            bank_code: "001".into(),
            branch: "1234".into(),
            account: "56789-0".into(),
            holder_document: "12345678901".into(),
        };
        assert!(bank.validate().is_ok());
        let bad = Destination::Bank {
            bank_code: "1".into(),
            branch: "1234".into(),
            account: "56789-0".into(),
            holder_document: "12345678901".into(),
        };
        assert!(matches!(bad.validate(), Err(FisioError::InvalidDestination(_))));
    }

    #[test]
    fn destination_json_is_tagged() {
        let json = serde_json::to_string(&pix()).expect("serialize");
        assert_eq!(json, r#"{"type":"pix","key":"ana@example.com"}"#);
    }

    #[test]
    fn fee_is_fixed_plus_percent() {
        let config = WithdrawalConfig {
            minimum_default: dec!(50.00),
            fee_fixed: dec!(1.50),
            fee_percent: dec!(1),
        };
        assert_eq!(fee_for(dec!(200.00), &config), dec!(3.50));
        let w = Withdrawal::request(PartnerId::new(), dec!(200.00), pix(), &config, now()).expect("request");
        assert_eq!(w.net_amount, dec!(196.50));
        assert!(Withdrawal::request(PartnerId::new(), dec!(1.00), pix(), &config, now()).is_err());
    }

    #[test]
    fn dispatch_is_idempotent_on_reference() {
        let mut w = Withdrawal::request(PartnerId::new(), dec!(200.00), pix(), &WithdrawalConfig::default(), now())
            .expect("request");
        assert!(w.dispatch("job-1", now()).expect("dispatch"));
        assert!(!w.dispatch("job-1", now()).expect("replay"));
        assert!(matches!(w.dispatch("job-2", now()), Err(FisioError::IllegalTransition { .. })));

        assert!(w.complete("tx-1", now()).expect("complete"));
        assert!(!w.complete("tx-1", now()).expect("replay"));
        assert!(!w.dispatch("job-1", now()).expect("replay after completion"));
        assert!(matches!(w.cancel(None, now()), Err(FisioError::IllegalTransition { .. })));
    }

    #[test]
    fn cancel_reports_released_reservation() {
        let config = WithdrawalConfig::default();
        let mut pending = Withdrawal::request(PartnerId::new(), dec!(60.00), pix(), &config, now()).expect("request");
        assert!(!pending.cancel(Some("changed my mind"), now()).expect("cancel"));

        let mut processing = Withdrawal::request(PartnerId::new(), dec!(60.00), pix(), &config, now()).expect("request");
        processing.dispatch("job-9", now()).expect("dispatch");
        assert!(processing.cancel(None, now()).expect("cancel"));
        assert!(!processing.reserved);
    }
}
