//! Append-only ledger of money movements.
//!
//! Amounts are positive for every kind except [`LedgerKind::Reversal`],
//! which stores the negated amount of the entry it reverses. Balances are a
//! fold over the entries (see [`LedgerAudit`]); the aggregates cached on the
//! partner row must always agree with that fold.

use chrono::{DateTime, Utc};
use fisioflow_store::codec::{decimal_to_sql, get_decimal, get_opt_parsed, get_parsed, get_ts, ts_to_sql};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::commission::CommissionSnapshot;
use crate::error::{FisioError, Result};
use crate::partner::Partner;
use crate::types::{LedgerKind, Money, PartnerId, SessionId, WithdrawalId};

/// One immutable movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic row id; zero until appended.
    pub id: i64,
    /// Partner whose balances the entry affects.
    pub partner_id: PartnerId,
    /// Session settled, if any.
    pub session_id: Option<SessionId>,
    /// Withdrawal paid out, if any.
    pub withdrawal_id: Option<WithdrawalId>,
    /// Movement kind.
    pub kind: LedgerKind,
    /// Signed amount (negative only for reversals).
    pub amount: Money,
    /// Entry this one reverses.
    pub reversal_of: Option<i64>,
    /// Kind of the reversed entry.
    pub reversed_kind: Option<LedgerKind>,
    /// Append instant.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// An unsaved entry.
    #[must_use]
    pub fn new(partner_id: PartnerId, kind: LedgerKind, amount: Money, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            partner_id,
            session_id: None,
            withdrawal_id: None,
            kind,
            amount,
            reversal_of: None,
            reversed_kind: None,
            created_at,
        }
    }

    /// Attach to a session.
    #[must_use]
    pub fn for_session(mut self, session: SessionId) -> Self {
        self.session_id = Some(session);
        self
    }

    /// Attach to a withdrawal.
    #[must_use]
    pub fn for_withdrawal(mut self, withdrawal: WithdrawalId) -> Self {
        self.withdrawal_id = Some(withdrawal);
        self
    }

    /// The kind this entry counts as: its own, or the reversed one.
    #[must_use]
    pub fn effective_kind(&self) -> LedgerKind {
        self.reversed_kind.unwrap_or(self.kind)
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Append one entry and return it with its id.
///
/// # Errors
/// Propagates SQLite failures.
pub fn append(conn: &Connection, entry: LedgerEntry) -> Result<LedgerEntry> {
    conn.execute(
        "INSERT INTO ledger_entries (partner_id, session_id, withdrawal_id, kind, amount,
            reversal_of, reversed_kind, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.partner_id.to_string(),
            entry.session_id.map(|s| s.to_string()),
            entry.withdrawal_id.map(|w| w.to_string()),
            entry.kind.as_str(),
            decimal_to_sql(&entry.amount),
            entry.reversal_of,
            entry.reversed_kind.map(LedgerKind::as_str),
            ts_to_sql(&entry.created_at),
        ],
    )?;
    Ok(LedgerEntry {
        id: conn.last_insert_rowid(),
        ..entry
    })
}

/// Append the five entries of one settlement: REVENUE, the three fees and
/// PARTNER_CREDIT. Zero fees are still recorded so every settlement has the
/// same shape.
///
/// # Errors
/// Propagates SQLite failures.
pub fn append_settlement(
    conn: &Connection,
    partner: PartnerId,
    session: SessionId,
    gross: Money,
    snapshot: &CommissionSnapshot,
    now: DateTime<Utc>,
) -> Result<Vec<LedgerEntry>> {
    [
        (LedgerKind::Revenue, gross),
        (LedgerKind::FeePlatform, snapshot.platform_fee),
        (LedgerKind::FeeGateway, snapshot.gateway_fee),
        (LedgerKind::FeeTax, snapshot.tax_fee),
        (LedgerKind::PartnerCredit, snapshot.partner_net),
    ]
    .into_iter()
    .map(|(kind, amount)| append(conn, LedgerEntry::new(partner, kind, amount, now).for_session(session)))
    .collect()
}

/// Append the negation of `original`.
///
/// # Errors
/// [`FisioError::InvariantViolation`] when reversing a reversal; the unique
/// index on `reversal_of` rejects a second reversal of the same entry.
pub fn reverse(conn: &Connection, original: &LedgerEntry, now: DateTime<Utc>) -> Result<LedgerEntry> {
    if original.kind == LedgerKind::Reversal {
        return Err(FisioError::InvariantViolation(format!(
            "ledger entry {} is itself a reversal",
            original.id
        )));
    }
    append(
        conn,
        LedgerEntry {
            id: 0,
            partner_id: original.partner_id,
            session_id: original.session_id,
            withdrawal_id: original.withdrawal_id,
            kind: LedgerKind::Reversal,
            amount: -original.amount,
            reversal_of: Some(original.id),
            reversed_kind: Some(original.kind),
            created_at: now,
        },
    )
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

const COLUMNS: &str =
    "id, partner_id, session_id, withdrawal_id, kind, amount, reversal_of, reversed_kind, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get(0)?,
        partner_id: get_parsed(row, 1)?,
        session_id: get_opt_parsed(row, 2)?,
        withdrawal_id: get_opt_parsed(row, 3)?,
        kind: get_parsed(row, 4)?,
        amount: get_decimal(row, 5)?,
        reversal_of: row.get(6)?,
        reversed_kind: get_opt_parsed(row, 7)?,
        created_at: get_ts(row, 8)?,
    })
}

/// Every entry of a partner in append order.
///
/// # Errors
/// Propagates SQLite failures.
pub fn for_partner(conn: &Connection, partner: PartnerId) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM ledger_entries WHERE partner_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![partner.to_string()], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Every entry of a session in append order.
///
/// # Errors
/// Propagates SQLite failures.
pub fn for_session(conn: &Connection, session: SessionId) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM ledger_entries WHERE session_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt
        .query_map(params![session.to_string()], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Entries of a session that are neither reversals nor already reversed.
///
/// # Errors
/// Propagates SQLite failures.
pub fn reversible_for_session(conn: &Connection, session: SessionId) -> Result<Vec<LedgerEntry>> {
    let entries = for_session(conn, session)?;
    let reversed: Vec<i64> = entries.iter().filter_map(|e| e.reversal_of).collect();
    Ok(entries
        .into_iter()
        .filter(|e| e.kind != LedgerKind::Reversal && !reversed.contains(&e.id))
        .collect())
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Partner balances recomputed from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    /// Audited partner.
    pub partner_id: PartnerId,
    /// Entries folded.
    pub entries: usize,
    /// Σ REVENUE net of reversals.
    pub total_revenue: Money,
    /// Σ fees net of reversals.
    pub total_commission: Money,
    /// Σ credit − Σ matured, net of reversals.
    pub pending_balance: Money,
    /// Σ matured − Σ withdrawn − reserved, net of reversals.
    pub available_balance: Money,
    /// Σ WITHDRAWAL_DEBIT.
    pub total_withdrawn: Money,
    /// Amount held by dispatched, unfinished withdrawals.
    pub reserved: Money,
}

impl LedgerAudit {
    /// Compare against the aggregates cached on `partner`.
    ///
    /// # Errors
    /// [`FisioError::InvariantViolation`] naming every field that disagrees.
    pub fn verify(&self, partner: &Partner) -> Result<()> {
        let checks = [
            ("total_revenue", self.total_revenue, partner.total_revenue),
            ("total_commission", self.total_commission, partner.total_commission),
            ("pending_balance", self.pending_balance, partner.pending_balance),
            ("available_balance", self.available_balance, partner.available_balance),
            ("total_withdrawn", self.total_withdrawn, partner.total_withdrawn),
        ];
        let mismatches: Vec<String> = checks
            .iter()
            .filter(|(_, ledger, cached)| ledger != cached)
            .map(|(name, ledger, cached)| format!("{name}: ledger {ledger} vs partner {cached}"))
            .collect();
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(FisioError::InvariantViolation(format!(
                "partner {} disagrees with its ledger ({})",
                partner.id,
                mismatches.join("; ")
            )))
        }
    }
}

/// Fold the ledger of `partner` into balances.
///
/// # Errors
/// Propagates SQLite failures.
pub fn audit(conn: &Connection, partner: PartnerId) -> Result<LedgerAudit> {
    let entries = for_partner(conn, partner)?;

    let mut revenue = Decimal::ZERO;
    let mut commission = Decimal::ZERO;
    let mut credited = Decimal::ZERO;
    let mut matured = Decimal::ZERO;
    let mut withdrawn = Decimal::ZERO;
    for entry in &entries {
        match entry.effective_kind() {
            LedgerKind::Revenue => revenue += entry.amount,
            LedgerKind::FeePlatform | LedgerKind::FeeGateway | LedgerKind::FeeTax => {
                commission += entry.amount;
            }
            LedgerKind::PartnerCredit => credited += entry.amount,
            LedgerKind::BalanceMature => matured += entry.amount,
            LedgerKind::WithdrawalDebit => withdrawn += entry.amount,
            LedgerKind::Reversal => {}
        }
    }

    let mut stmt = conn.prepare_cached(
        "SELECT amount FROM withdrawals WHERE partner_id = ?1 AND reserved = 1",
    )?;
    let reserved = stmt
        .query_map(params![partner.to_string()], |row| get_decimal(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .sum::<Decimal>();

    Ok(LedgerAudit {
        partner_id: partner,
        entries: entries.len(),
        total_revenue: revenue,
        total_commission: commission,
        pending_balance: credited - matured,
        available_balance: matured - withdrawn - reserved,
        total_withdrawn: withdrawn,
        reserved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partner::{self, CommissionSplit};
    use chrono::TimeZone;
    use fisioflow_store::{Database, PersistenceConfig};
    use rust_decimal_macros::dec;

    fn setup() -> (Database, Partner, DateTime<Utc>) {
        let db = Database::open_in_memory(&PersistenceConfig::default()).expect("open");
        db.migrate(crate::schema::COMPONENT, crate::schema::MIGRATIONS).expect("migrate");
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).single().expect("valid");
        let p = Partner::new("Ana", CommissionSplit::new(dec!(10), dec!(3), dec!(2), dec!(85)), now);
        db.write(|tx| partner::insert(tx, &p)).expect("partner");
        (db, p, now)
    }

    #[test]
    fn settlement_and_reversal_fold_to_zero() {
        let (db, p, now) = setup();
        let snapshot = CommissionSnapshot::compute(dec!(100.00), p.split);
        let patient = crate::types::PatientId::new();
        let session = crate::session::Session::scheduled(
            None,
            p.id,
            patient,
            dec!(100.00),
            &crate::session::SessionMetadata::default(),
            now,
        );

        db.write(|tx| {
            tx.execute(
                "INSERT INTO patients (id, name, created_at) VALUES (?1, 'Bia', ?2)",
                params![patient.to_string(), ts_to_sql(&now)],
            )?;
            crate::session::insert(tx, &session)?;
            let written = append_settlement(tx, p.id, session.id, dec!(100.00), &snapshot, now)?;
            assert_eq!(written.len(), 5);
            Ok::<_, FisioError>(())
        })
        .expect("settle");

        let settled = db.read(|conn| audit(conn, p.id)).expect("audit");
        assert_eq!(settled.pending_balance, dec!(85.00));
        assert_eq!(settled.total_commission, dec!(15.00));
        assert_eq!(settled.total_revenue, dec!(100.00));

        db.write(|tx| {
            for entry in reversible_for_session(tx, session.id)? {
                reverse(tx, &entry, now)?;
            }
            Ok::<_, FisioError>(())
        })
        .expect("reverse");

        let reversed = db.read(|conn| audit(conn, p.id)).expect("audit");
        assert_eq!(reversed.entries, 10);
        assert!(reversed.pending_balance.is_zero());
        assert!(reversed.total_revenue.is_zero());
        assert!(reversed.total_commission.is_zero());
        let left = db.read(|conn| reversible_for_session(conn, session.id)).expect("left");
        assert!(left.is_empty());
    }

    #[test]
    fn reversing_a_reversal_is_refused() {
        let (db, p, now) = setup();
        let result = db.write(|tx| {
            let debit = append(tx, LedgerEntry::new(p.id, LedgerKind::Revenue, dec!(5.00), now))?;
            let rev = reverse(tx, &debit, now)?;
            reverse(tx, &rev, now)
        });
        assert!(matches!(result, Err(FisioError::InvariantViolation(_))));
    }

    #[test]
    fn verify_flags_drift() {
        let (db, mut p, now) = setup();
        db.write(|tx| append(tx, LedgerEntry::new(p.id, LedgerKind::PartnerCredit, dec!(85.00), now)))
            .expect("append");
        let folded = db.read(|conn| audit(conn, p.id)).expect("audit");
        assert!(folded.verify(&p).is_err());
        p.pending_balance = dec!(85.00);
        assert!(folded.verify(&p).is_ok());
    }
}
