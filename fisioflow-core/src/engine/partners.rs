//! Partner administration and patient registration.

use fisioflow_store::codec::ts_to_sql;
use rusqlite::params;
use tracing::info;

use super::VoucherEngine;
use crate::error::{FisioError, Result};
use crate::ledger::{self, LedgerAudit, LedgerEntry};
use crate::money::is_money;
use crate::partner::{self, CommissionSplit, Partner};
use crate::types::{Money, PartnerId, PartnerStatus, PatientId};

impl VoucherEngine {
    /// Register a partner in PENDING status.
    ///
    /// # Errors
    /// [`FisioError::InvalidSplit`] for a bad split, or
    /// [`FisioError::InvalidAmounts`] for a negative or sub-cent minimum.
    pub fn create_partner(
        &self,
        name: &str,
        split: CommissionSplit,
        minimum_withdrawal: Option<Money>,
    ) -> Result<Partner> {
        split.validate()?;
        if let Some(min) = minimum_withdrawal {
            if min.is_sign_negative() || !is_money(min) {
                return Err(FisioError::InvalidAmounts(format!("minimum withdrawal {min}")));
            }
        }
        let mut p = Partner::new(name, split, self.now());
        p.minimum_withdrawal = minimum_withdrawal;
        self.db.write(|tx| partner::insert(tx, &p))?;
        info!(partner = %p.id, name, "Partner created");
        Ok(p)
    }

    fn transition_partner(&self, id: PartnerId, to: PartnerStatus, action: &'static str) -> Result<Partner> {
        let now = self.now();
        self.db.write(|tx| {
            let mut p = partner::require(tx, id)?;
            p.transition(to, action, now)?;
            partner::save(tx, &p)?;
            Ok(p)
        })
    }

    /// PENDING/SUSPENDED → ACTIVE.
    ///
    /// # Errors
    /// [`FisioError::PartnerNotFound`] or [`FisioError::IllegalTransition`].
    pub fn activate_partner(&self, id: PartnerId) -> Result<Partner> {
        self.transition_partner(id, PartnerStatus::Active, "activate")
    }

    /// ACTIVE → SUSPENDED.
    ///
    /// # Errors
    /// [`FisioError::PartnerNotFound`] or [`FisioError::IllegalTransition`].
    pub fn suspend_partner(&self, id: PartnerId) -> Result<Partner> {
        self.transition_partner(id, PartnerStatus::Suspended, "suspend")
    }

    /// Any non-terminal status → TERMINATED.
    ///
    /// # Errors
    /// [`FisioError::PartnerNotFound`] or [`FisioError::IllegalTransition`].
    pub fn terminate_partner(&self, id: PartnerId) -> Result<Partner> {
        self.transition_partner(id, PartnerStatus::Terminated, "terminate")
    }

    /// Any non-terminal status → BLOCKED.
    ///
    /// # Errors
    /// [`FisioError::PartnerNotFound`] or [`FisioError::IllegalTransition`].
    pub fn block_partner(&self, id: PartnerId) -> Result<Partner> {
        self.transition_partner(id, PartnerStatus::Blocked, "block")
    }

    /// Replace the split used for future completions. Past sessions keep
    /// their frozen snapshot.
    ///
    /// # Errors
    /// [`FisioError::InvalidSplit`] or [`FisioError::PartnerNotFound`].
    pub fn update_commission_split(&self, id: PartnerId, split: CommissionSplit) -> Result<Partner> {
        split.validate()?;
        let now = self.now();
        self.db.write(|tx| {
            let mut p = partner::require(tx, id)?;
            p.split = split;
            p.updated_at = now;
            partner::save(tx, &p)?;
            info!(partner = %id, platform = %split.platform, partner_pct = %split.partner, "Commission split updated");
            Ok(p)
        })
    }

    /// # Errors
    /// [`FisioError::PartnerNotFound`].
    pub fn get_partner(&self, id: PartnerId) -> Result<Partner> {
        self.db.read(|conn| partner::require(conn, id))
    }

    /// Every ledger entry of a partner in append order.
    ///
    /// # Errors
    /// [`FisioError::PartnerNotFound`].
    pub fn partner_ledger(&self, id: PartnerId) -> Result<Vec<LedgerEntry>> {
        self.db.read(|conn| {
            partner::require(conn, id)?;
            ledger::for_partner(conn, id)
        })
    }

    /// Recompute a partner's balances from the ledger and compare them with
    /// the cached aggregates.
    ///
    /// # Errors
    /// [`FisioError::InvariantViolation`] if they disagree.
    pub fn audit_partner(&self, id: PartnerId) -> Result<LedgerAudit> {
        self.db.read(|conn| {
            let p = partner::require(conn, id)?;
            let audit = ledger::audit(conn, id)?;
            audit.verify(&p)?;
            Ok(audit)
        })
    }

    /// Make a patient known to the engine (the clinic records system owns
    /// the full record). Re-registering updates the name.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn register_patient(&self, id: PatientId, name: &str) -> Result<()> {
        let now = ts_to_sql(&self.now());
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO patients (id, name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![id.to_string(), name, now],
            )?;
            Ok::<_, FisioError>(())
        })
    }
}

pub(super) fn patient_exists(conn: &rusqlite::Connection, id: PatientId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM patients WHERE id = ?1)",
        params![id.to_string()],
        |row| row.get(0),
    )?)
}
