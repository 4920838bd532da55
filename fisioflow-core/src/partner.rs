//! Partners: commission split, lifecycle, balance aggregates.
//!
//! The aggregates on a [`Partner`] row are a cache of what the ledger says;
//! they are only written from inside a write transaction that also appends
//! the matching ledger entries.

use chrono::{DateTime, Utc};
use fisioflow_store::codec::{
    decimal_to_sql, get_decimal, get_opt_decimal, get_opt_ts, get_parsed, get_ts, opt_ts_to_sql,
    ts_to_sql, OptionalExt,
};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FisioError, Result};
use crate::money::{is_money, to_cents};
use crate::types::{Money, PartnerId, PartnerStatus};

// ---------------------------------------------------------------------------
// Commission split
// ---------------------------------------------------------------------------

/// Four-way percentage split of a session's gross price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    /// Platform commission, percent.
    pub platform: Decimal,
    /// Payment gateway fee, percent.
    pub gateway: Decimal,
    /// Tax withheld, percent.
    pub tax: Decimal,
    /// Partner share, percent.
    pub partner: Decimal,
}

impl CommissionSplit {
    /// Build a split without validating it.
    #[must_use]
    pub const fn new(platform: Decimal, gateway: Decimal, tax: Decimal, partner: Decimal) -> Self {
        Self { platform, gateway, tax, partner }
    }

    /// Sum of the four components.
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.platform + self.gateway + self.tax + self.partner
    }

    /// Every component non-negative with at most two fractional digits, and
    /// the four summing to exactly 100.00.
    ///
    /// # Errors
    /// Returns [`FisioError::InvalidSplit`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("platform", self.platform),
            ("gateway", self.gateway),
            ("tax", self.tax),
            ("partner", self.partner),
        ] {
            if value.is_sign_negative() {
                return Err(FisioError::InvalidSplit(format!("{name} is negative ({value})")));
            }
            if !is_money(value) {
                return Err(FisioError::InvalidSplit(format!(
                    "{name} has more than two decimal places ({value})"
                )));
            }
        }
        let total = self.total();
        if total != Decimal::ONE_HUNDRED {
            return Err(FisioError::InvalidSplit(format!("components sum to {total}, not 100")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Partner
// ---------------------------------------------------------------------------

/// A revenue-sharing affiliate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    /// Identifier.
    pub id: PartnerId,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: PartnerStatus,
    /// Current commission split (applies to future completions only).
    pub split: CommissionSplit,
    /// Partner-level override of the minimum withdrawal.
    pub minimum_withdrawal: Option<Money>,
    /// Gross revenue of completed, unreversed sessions.
    pub total_revenue: Money,
    /// Fees withheld from that revenue.
    pub total_commission: Money,
    /// Earned but not yet matured.
    pub pending_balance: Money,
    /// Matured and withdrawable (in-flight withdrawals already deducted).
    pub available_balance: Money,
    /// Paid out so far.
    pub total_withdrawn: Money,
    /// Sessions ever booked.
    pub total_sessions: u32,
    /// Sessions currently completed.
    pub completed_sessions: u32,
    /// Sessions cancelled (before or after completion).
    pub cancelled_sessions: u32,
    /// Sessions the patient missed.
    pub no_show_sessions: u32,
    /// Last completed withdrawal.
    pub last_withdrawal_at: Option<DateTime<Utc>>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl Partner {
    /// A fresh PENDING partner with zeroed aggregates.
    #[must_use]
    pub fn new(name: impl Into<String>, split: CommissionSplit, now: DateTime<Utc>) -> Self {
        let zero = to_cents(Decimal::ZERO);
        Self {
            id: PartnerId::new(),
            name: name.into(),
            status: PartnerStatus::Pending,
            split,
            minimum_withdrawal: None,
            total_revenue: zero,
            total_commission: zero,
            pending_balance: zero,
            available_balance: zero,
            total_withdrawn: zero,
            total_sessions: 0,
            completed_sessions: 0,
            cancelled_sessions: 0,
            no_show_sessions: 0,
            last_withdrawal_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// # Errors
    /// Returns [`FisioError::PartnerNotActive`] unless the status is ACTIVE.
    pub fn ensure_active(&self) -> Result<()> {
        if self.status == PartnerStatus::Active {
            Ok(())
        } else {
            Err(FisioError::PartnerNotActive {
                partner: self.id,
                status: self.status,
            })
        }
    }

    /// Apply an admin lifecycle transition.
    ///
    /// # Errors
    /// Returns [`FisioError::IllegalTransition`] if the move is not allowed.
    pub fn transition(&mut self, to: PartnerStatus, action: &'static str, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(FisioError::illegal("partner", self.status, action));
        }
        info!(partner = %self.id, from = %self.status, to = %to, "Partner status changed");
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Effective minimum withdrawal.
    #[must_use]
    pub fn minimum_withdrawal_or(&self, default: Money) -> Money {
        self.minimum_withdrawal.unwrap_or(default)
    }

    /// Neither balance may be negative.
    ///
    /// # Errors
    /// Returns [`FisioError::InvariantViolation`] naming the balance.
    pub fn check_balances(&self) -> Result<()> {
        if self.pending_balance < Decimal::ZERO {
            return Err(FisioError::InvariantViolation(format!(
                "partner {} pending_balance would be {}",
                self.id, self.pending_balance
            )));
        }
        if self.available_balance < Decimal::ZERO {
            return Err(FisioError::InvariantViolation(format!(
                "partner {} available_balance would be {}",
                self.id, self.available_balance
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, name, status, platform_pct, gateway_pct, tax_pct, partner_pct,
    minimum_withdrawal, total_revenue, total_commission, pending_balance, available_balance,
    total_withdrawn, total_sessions, completed_sessions, cancelled_sessions, no_show_sessions,
    last_withdrawal_at, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Partner> {
    Ok(Partner {
        id: get_parsed(row, 0)?,
        name: row.get(1)?,
        status: get_parsed(row, 2)?,
        split: CommissionSplit {
            platform: get_decimal(row, 3)?,
            gateway: get_decimal(row, 4)?,
            tax: get_decimal(row, 5)?,
            partner: get_decimal(row, 6)?,
        },
        minimum_withdrawal: get_opt_decimal(row, 7)?,
        total_revenue: get_decimal(row, 8)?,
        total_commission: get_decimal(row, 9)?,
        pending_balance: get_decimal(row, 10)?,
        available_balance: get_decimal(row, 11)?,
        total_withdrawn: get_decimal(row, 12)?,
        total_sessions: row.get(13)?,
        completed_sessions: row.get(14)?,
        cancelled_sessions: row.get(15)?,
        no_show_sessions: row.get(16)?,
        last_withdrawal_at: get_opt_ts(row, 17)?,
        created_at: get_ts(row, 18)?,
        updated_at: get_ts(row, 19)?,
    })
}

/// Insert a new partner row.
///
/// # Errors
/// Propagates SQLite failures.
pub fn insert(conn: &Connection, p: &Partner) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO partners ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"),
        params![
            p.id.to_string(),
            p.name,
            p.status.as_str(),
            decimal_to_sql(&p.split.platform),
            decimal_to_sql(&p.split.gateway),
            decimal_to_sql(&p.split.tax),
            decimal_to_sql(&p.split.partner),
            p.minimum_withdrawal.as_ref().map(decimal_to_sql),
            decimal_to_sql(&p.total_revenue),
            decimal_to_sql(&p.total_commission),
            decimal_to_sql(&p.pending_balance),
            decimal_to_sql(&p.available_balance),
            decimal_to_sql(&p.total_withdrawn),
            p.total_sessions,
            p.completed_sessions,
            p.cancelled_sessions,
            p.no_show_sessions,
            opt_ts_to_sql(p.last_withdrawal_at.as_ref()),
            ts_to_sql(&p.created_at),
            ts_to_sql(&p.updated_at),
        ],
    )?;
    Ok(())
}

/// Load a partner if it exists.
///
/// # Errors
/// Propagates SQLite and decode failures.
pub fn load(conn: &Connection, id: PartnerId) -> Result<Option<Partner>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM partners WHERE id = ?1"),
            params![id.to_string()],
            from_row,
        )
        .optional()?)
}

/// Load a partner or fail with [`FisioError::PartnerNotFound`].
///
/// # Errors
/// See above.
pub fn require(conn: &Connection, id: PartnerId) -> Result<Partner> {
    load(conn, id)?.ok_or(FisioError::PartnerNotFound(id))
}

/// Persist every mutable column, after checking the balances.
///
/// # Errors
/// Returns [`FisioError::InvariantViolation`] for a negative balance, or
/// propagates SQLite failures.
pub fn save(conn: &Connection, p: &Partner) -> Result<()> {
    p.check_balances()?;
    conn.execute(
        "UPDATE partners SET name = ?2, status = ?3, platform_pct = ?4, gateway_pct = ?5,
            tax_pct = ?6, partner_pct = ?7, minimum_withdrawal = ?8, total_revenue = ?9,
            total_commission = ?10, pending_balance = ?11, available_balance = ?12,
            total_withdrawn = ?13, total_sessions = ?14, completed_sessions = ?15,
            cancelled_sessions = ?16, no_show_sessions = ?17, last_withdrawal_at = ?18,
            updated_at = ?19
         WHERE id = ?1",
        params![
            p.id.to_string(),
            p.name,
            p.status.as_str(),
            decimal_to_sql(&p.split.platform),
            decimal_to_sql(&p.split.gateway),
            decimal_to_sql(&p.split.tax),
            decimal_to_sql(&p.split.partner),
            p.minimum_withdrawal.as_ref().map(decimal_to_sql),
            decimal_to_sql(&p.total_revenue),
            decimal_to_sql(&p.total_commission),
            decimal_to_sql(&p.pending_balance),
            decimal_to_sql(&p.available_balance),
            decimal_to_sql(&p.total_withdrawn),
            p.total_sessions,
            p.completed_sessions,
            p.cancelled_sessions,
            p.no_show_sessions,
            opt_ts_to_sql(p.last_withdrawal_at.as_ref()),
            ts_to_sql(&p.updated_at),
        ],
    )?;
    Ok(())
}

/// Every partner ID, oldest first.
///
/// # Errors
/// Propagates SQLite failures.
pub fn list_ids(conn: &Connection) -> Result<Vec<PartnerId>> {
    let mut stmt = conn.prepare("SELECT id FROM partners ORDER BY created_at, id")?;
    let ids = stmt
        .query_map([], |row| get_parsed(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fisioflow_store::{Database, PersistenceConfig};
    use rust_decimal_macros::dec;

    fn split() -> CommissionSplit {
        CommissionSplit::new(dec!(10), dec!(3), dec!(2), dec!(85))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("valid")
    }

    #[test]
    fn split_must_sum_to_hundred() {
        assert!(split().validate().is_ok());
        let short = CommissionSplit::new(dec!(10), dec!(3), dec!(2), dec!(84.99));
        assert!(matches!(short.validate(), Err(FisioError::InvalidSplit(_))));
    }

    #[test]
    fn split_rejects_negative_and_sub_cent() {
        let negative = CommissionSplit::new(dec!(-5), dec!(3), dec!(2), dec!(100));
        assert!(matches!(negative.validate(), Err(FisioError::InvalidSplit(_))));
        let fine = CommissionSplit::new(dec!(10.005), dec!(3), dec!(2), dec!(84.995));
        assert!(matches!(fine.validate(), Err(FisioError::InvalidSplit(_))));
    }

    #[test]
    fn negative_balance_is_an_invariant_violation() {
        let mut p = Partner::new("Ana", split(), now());
        p.available_balance = dec!(-0.01);
        assert!(matches!(p.check_balances(), Err(FisioError::InvariantViolation(_))));
    }

    #[test]
    fn row_round_trip_keeps_scale() {
        let db = Database::open_in_memory(&PersistenceConfig::default()).expect("open");
        db.migrate(crate::schema::COMPONENT, crate::schema::MIGRATIONS).expect("migrate");

        let mut p = Partner::new("Ana", split(), now());
        p.minimum_withdrawal = Some(dec!(20.00));
        db.write(|tx| insert(tx, &p)).expect("insert");

        p.transition(PartnerStatus::Active, "activate", now()).expect("activate");
        p.pending_balance = dec!(85.00);
        db.write(|tx| save(tx, &p)).expect("save");

        let loaded = db.read(|conn| require(conn, p.id)).expect("load");
        assert_eq!(loaded, p);
        assert_eq!(loaded.pending_balance.to_string(), "85.00");
        assert_eq!(loaded.minimum_withdrawal_or(dec!(50.00)), dec!(20.00));
    }

    #[test]
    fn missing_partner_is_not_found() {
        let db = Database::open_in_memory(&PersistenceConfig::default()).expect("open");
        db.migrate(crate::schema::COMPONENT, crate::schema::MIGRATIONS).expect("migrate");
        let id = PartnerId::new();
        let err = db.read(|conn| require(conn, id)).expect_err("missing");
        assert!(matches!(err, FisioError::PartnerNotFound(got) if got == id));
    }
}
