//! Sessions: one rendered (or booked) service, the unit of settlement.

use chrono::{DateTime, Utc};
use fisioflow_store::codec::{
    decimal_to_sql, get_decimal, get_opt_decimal, get_opt_parsed, get_opt_ts, get_parsed, get_ts,
    opt_ts_to_sql, ts_to_sql, OptionalExt,
};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::commission::CommissionSnapshot;
use crate::error::{FisioError, Result};
use crate::partner::CommissionSplit;
use crate::types::{Money, PartnerId, PatientId, SessionId, SessionStatus, VoucherId};

/// Caller-supplied details of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// When the session takes place; defaults to now.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Explicit price; defaults to the voucher's unit price.
    pub price: Option<Money>,
    /// Free-form notes.
    pub notes: Option<String>,
}

/// One session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Identifier.
    pub id: SessionId,
    /// Voucher redeemed, or `None` for a cash session.
    pub voucher_id: Option<VoucherId>,
    /// Partner rendering the session.
    pub partner_id: PartnerId,
    /// Patient attending.
    pub patient_id: PatientId,
    /// Booked instant.
    pub scheduled_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Gross price.
    pub price: Money,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Split frozen at completion; never rewritten afterwards.
    pub snapshot: Option<CommissionSnapshot>,
    /// Ledger entries for this session have been written.
    pub payment_processed: bool,
    /// Completion instant.
    pub completed_at: Option<DateTime<Utc>>,
    /// Cancellation (or no-show) instant.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Optional cancellation reason.
    pub cancel_reason: Option<String>,
    /// When the partner credit moved from pending to available.
    pub matured_at: Option<DateTime<Utc>>,
    /// When the settlement was reversed.
    pub reversed_at: Option<DateTime<Utc>>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A SCHEDULED session.
    #[must_use]
    pub fn scheduled(
        voucher_id: Option<VoucherId>,
        partner_id: PartnerId,
        patient_id: PatientId,
        price: Money,
        meta: &SessionMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            voucher_id,
            partner_id,
            patient_id,
            scheduled_at: meta.scheduled_at.unwrap_or(now),
            status: SessionStatus::Scheduled,
            price,
            notes: meta.notes.clone(),
            snapshot: None,
            payment_processed: false,
            completed_at: None,
            cancelled_at: None,
            cancel_reason: None,
            matured_at: None,
            reversed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed and not reversed: its credit still counts.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.status == SessionStatus::Completed && self.reversed_at.is_none()
    }

    /// SCHEDULED → COMPLETED, freezing `snapshot`.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] unless SCHEDULED.
    pub fn complete(&mut self, snapshot: CommissionSnapshot, now: DateTime<Utc>) -> Result<()> {
        if self.status != SessionStatus::Scheduled {
            return Err(FisioError::illegal("session", self.status, "complete"));
        }
        self.status = SessionStatus::Completed;
        self.snapshot = Some(snapshot);
        self.payment_processed = true;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// SCHEDULED → CANCELLED / NO_SHOW.
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] unless SCHEDULED.
    pub fn cancel_scheduled(&mut self, no_show: bool, reason: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        if self.status != SessionStatus::Scheduled {
            return Err(FisioError::illegal("session", self.status, "cancel"));
        }
        self.status = if no_show { SessionStatus::NoShow } else { SessionStatus::Cancelled };
        self.cancelled_at = Some(now);
        self.cancel_reason = reason.map(str::to_string);
        self.updated_at = now;
        Ok(())
    }

    /// Stamp a settled session as reversed; `cancel` also flips it to
    /// CANCELLED (a refund leaves the status COMPLETED).
    ///
    /// # Errors
    /// [`FisioError::IllegalTransition`] unless settled.
    pub fn reverse(&mut self, cancel: bool, reason: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        if !self.is_settled() {
            return Err(FisioError::illegal("session", self.status, "reverse"));
        }
        self.reversed_at = Some(now);
        if cancel {
            self.status = SessionStatus::Cancelled;
            self.cancelled_at = Some(now);
            self.cancel_reason = reason.map(str::to_string);
        }
        self.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, voucher_id, partner_id, patient_id, scheduled_at, status, price, notes,
    platform_pct, gateway_pct, tax_pct, partner_pct, platform_fee, gateway_fee, tax_fee,
    partner_net, payment_processed, completed_at, cancelled_at, cancel_reason, matured_at,
    reversed_at, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let snapshot = match (
        get_opt_decimal(row, 8)?,
        get_opt_decimal(row, 9)?,
        get_opt_decimal(row, 10)?,
        get_opt_decimal(row, 11)?,
    ) {
        (Some(platform), Some(gateway), Some(tax), Some(partner)) => Some(CommissionSnapshot {
            split: CommissionSplit::new(platform, gateway, tax, partner),
            platform_fee: get_decimal(row, 12)?,
            gateway_fee: get_decimal(row, 13)?,
            tax_fee: get_decimal(row, 14)?,
            partner_net: get_decimal(row, 15)?,
        }),
        _ => None,
    };
    Ok(Session {
        id: get_parsed(row, 0)?,
        voucher_id: get_opt_parsed(row, 1)?,
        partner_id: get_parsed(row, 2)?,
        patient_id: get_parsed(row, 3)?,
        scheduled_at: get_ts(row, 4)?,
        status: get_parsed(row, 5)?,
        price: get_decimal(row, 6)?,
        notes: row.get(7)?,
        snapshot,
        payment_processed: row.get(16)?,
        completed_at: get_opt_ts(row, 17)?,
        cancelled_at: get_opt_ts(row, 18)?,
        cancel_reason: row.get(19)?,
        matured_at: get_opt_ts(row, 20)?,
        reversed_at: get_opt_ts(row, 21)?,
        created_at: get_ts(row, 22)?,
        updated_at: get_ts(row, 23)?,
    })
}

/// Insert a new session row.
///
/// # Errors
/// Propagates SQLite failures.
pub fn insert(conn: &Connection, s: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, voucher_id, partner_id, patient_id, scheduled_at, status,
            price, notes, payment_processed, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            s.id.to_string(),
            s.voucher_id.map(|v| v.to_string()),
            s.partner_id.to_string(),
            s.patient_id.to_string(),
            ts_to_sql(&s.scheduled_at),
            s.status.as_str(),
            decimal_to_sql(&s.price),
            s.notes,
            s.payment_processed,
            ts_to_sql(&s.created_at),
            ts_to_sql(&s.updated_at),
        ],
    )?;
    Ok(())
}

/// Persist the mutable columns.
///
/// The snapshot columns are written with `COALESCE` so a frozen snapshot is
/// never overwritten.
///
/// # Errors
/// Propagates SQLite failures.
pub fn save(conn: &Connection, s: &Session) -> Result<()> {
    let snap = s.snapshot.as_ref();
    conn.execute(
        "UPDATE sessions SET status = ?2,
            platform_pct = COALESCE(platform_pct, ?3), gateway_pct = COALESCE(gateway_pct, ?4),
            tax_pct = COALESCE(tax_pct, ?5), partner_pct = COALESCE(partner_pct, ?6),
            platform_fee = COALESCE(platform_fee, ?7), gateway_fee = COALESCE(gateway_fee, ?8),
            tax_fee = COALESCE(tax_fee, ?9), partner_net = COALESCE(partner_net, ?10),
            payment_processed = ?11, completed_at = ?12, cancelled_at = ?13,
            cancel_reason = ?14, matured_at = ?15, reversed_at = ?16, updated_at = ?17,
            price = ?18
         WHERE id = ?1",
        params![
            s.id.to_string(),
            s.status.as_str(),
            snap.map(|c| decimal_to_sql(&c.split.platform)),
            snap.map(|c| decimal_to_sql(&c.split.gateway)),
            snap.map(|c| decimal_to_sql(&c.split.tax)),
            snap.map(|c| decimal_to_sql(&c.split.partner)),
            snap.map(|c| decimal_to_sql(&c.platform_fee)),
            snap.map(|c| decimal_to_sql(&c.gateway_fee)),
            snap.map(|c| decimal_to_sql(&c.tax_fee)),
            snap.map(|c| decimal_to_sql(&c.partner_net)),
            s.payment_processed,
            opt_ts_to_sql(s.completed_at.as_ref()),
            opt_ts_to_sql(s.cancelled_at.as_ref()),
            s.cancel_reason,
            opt_ts_to_sql(s.matured_at.as_ref()),
            opt_ts_to_sql(s.reversed_at.as_ref()),
            ts_to_sql(&s.updated_at),
            decimal_to_sql(&s.price),
        ],
    )?;
    Ok(())
}

/// Load a session or fail with [`FisioError::SessionNotFound`].
///
/// # Errors
/// See above.
pub fn require(conn: &Connection, id: SessionId) -> Result<Session> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"),
        params![id.to_string()],
        from_row,
    )
    .optional()?
    .ok_or(FisioError::SessionNotFound(id))
}

fn query(conn: &Connection, filter: &str, args: impl rusqlite::Params) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE {filter}"))?;
    let rows = stmt
        .query_map(args, from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Every session booked against a voucher, oldest first.
///
/// # Errors
/// Propagates SQLite failures.
pub fn for_voucher(conn: &Connection, voucher: VoucherId) -> Result<Vec<Session>> {
    query(
        conn,
        "voucher_id = ?1 ORDER BY created_at, id",
        params![voucher.to_string()],
    )
}

/// Settled sessions of `partner` whose credit is still pending, oldest first.
///
/// # Errors
/// Propagates SQLite failures.
pub fn pending_for_partner(conn: &Connection, partner: PartnerId) -> Result<Vec<Session>> {
    query(
        conn,
        "partner_id = ?1 AND status = 'COMPLETED' AND reversed_at IS NULL AND matured_at IS NULL
         ORDER BY completed_at, id",
        params![partner.to_string()],
    )
}

/// Every session of `partner`, oldest first.
///
/// # Errors
/// Propagates SQLite failures.
pub fn for_partner(conn: &Connection, partner: PartnerId) -> Result<Vec<Session>> {
    query(conn, "partner_id = ?1 ORDER BY created_at, id", params![partner.to_string()])
}
