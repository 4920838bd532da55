//! Settlement: promoting pending partner credits to available balance.
//!
//! The predicate is pluggable ([`MaturationPolicy`]); the ledger transition
//! is fixed. Each matured credit appends one `BALANCE_MATURE` entry and moves
//! the session's `partner_net` from `pending_balance` to `available_balance`
//! in the same transaction.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FisioError, Result};
use crate::ledger::{self, LedgerEntry};
use crate::partner::{self, Partner};
use crate::session::{self, Session};
use crate::types::{LedgerKind, PartnerId};

/// When a pending credit may mature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaturationPolicy {
    /// At the next settlement pass.
    #[default]
    Immediate,
    /// Once this many days have passed since completion.
    AfterDays(u32),
    /// Never automatically; only through an explicit admin action.
    Manual,
}

impl MaturationPolicy {
    /// Whether a credit completed at `completed_at` is due at `now`.
    #[must_use]
    pub fn is_due(&self, completed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Immediate => true,
            Self::AfterDays(days) => now - completed_at >= Duration::days(i64::from(*days)),
            Self::Manual => false,
        }
    }
}

/// Mature one settled session's credit.
///
/// The caller saves `partner` afterwards; `session` is saved here.
///
/// # Errors
/// [`FisioError::IllegalTransition`] if the session is not settled or has
/// already matured.
pub fn mature(conn: &Connection, partner: &mut Partner, session: &mut Session, now: DateTime<Utc>) -> Result<LedgerEntry> {
    let Some(snapshot) = session.snapshot.filter(|_| session.is_settled()) else {
        return Err(FisioError::illegal("session", session.status, "mature"));
    };
    if session.matured_at.is_some() {
        return Err(FisioError::illegal("session", "MATURED", "mature"));
    }

    let entry = ledger::append(
        conn,
        LedgerEntry::new(partner.id, LedgerKind::BalanceMature, snapshot.partner_net, now).for_session(session.id),
    )?;
    partner.pending_balance -= snapshot.partner_net;
    partner.available_balance += snapshot.partner_net;
    partner.updated_at = now;

    session.matured_at = Some(now);
    session.updated_at = now;
    session::save(conn, session)?;

    debug!(partner = %partner.id, session = %session.id, amount = %snapshot.partner_net, "Credit matured");
    Ok(entry)
}

/// Mature every due credit of one partner. Returns how many matured.
///
/// # Errors
/// [`FisioError::PartnerNotFound`], or any failure from [`mature`].
pub fn settle_partner(conn: &Connection, partner_id: PartnerId, policy: MaturationPolicy, now: DateTime<Utc>) -> Result<usize> {
    let mut partner = partner::require(conn, partner_id)?;
    let mut matured = 0;
    for mut s in session::pending_for_partner(conn, partner_id)? {
        let completed_at = s.completed_at.unwrap_or(s.updated_at);
        if policy.is_due(completed_at, now) {
            mature(conn, &mut partner, &mut s, now)?;
            matured += 1;
        }
    }
    if matured > 0 {
        partner::save(conn, &partner)?;
    }
    Ok(matured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn policies_decide_due_credits() {
        let done = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).single().expect("valid");
        let now = done + Duration::days(3);

        assert!(MaturationPolicy::Immediate.is_due(done, done));
        assert!(MaturationPolicy::AfterDays(3).is_due(done, now));
        assert!(!MaturationPolicy::AfterDays(3).is_due(done, now - Duration::seconds(1)));
        assert!(MaturationPolicy::AfterDays(0).is_due(done, done));
        assert!(!MaturationPolicy::Manual.is_due(done, now + Duration::days(365)));
    }
}
