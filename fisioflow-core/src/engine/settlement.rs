//! Settlement passes.

use tracing::{debug, info, warn};

use super::VoucherEngine;
use crate::error::{FisioError, Result};
use crate::metrics::FisioCounters;
use crate::partner;
use crate::session;
use crate::settlement::{self, MaturationPolicy};
use crate::types::{PartnerId, SessionId};

impl VoucherEngine {
    /// Mature every due credit across all partners under the configured
    /// policy. Each partner settles in its own transaction, so a failure for
    /// one partner leaves the others' progress committed.
    ///
    /// Returns how many credits matured.
    ///
    /// # Errors
    /// The first partner failure, after the remaining partners were tried.
    pub fn run_settlement(&self) -> Result<usize> {
        let now = self.now();
        let policy = self.policy;
        if policy == MaturationPolicy::Manual {
            debug!("Settlement pass skipped under manual maturation");
            return Ok(0);
        }

        let ids = self.db.read(partner::list_ids)?;
        let mut matured = 0;
        let mut first_error = None;
        for id in ids {
            match self.db.write(|tx| settlement::settle_partner(tx, id, policy, now)) {
                Ok(n) => matured += n,
                Err(err) => {
                    warn!(partner = %id, error = %err, "Settlement failed for partner");
                    first_error.get_or_insert(err);
                }
            }
        }

        FisioCounters::add(&self.counters.credits_matured, matured as u64);
        info!(matured, ?policy, "Settlement pass finished");
        match first_error {
            Some(err) => Err(err),
            None => Ok(matured),
        }
    }

    /// Settle one partner under the configured policy.
    ///
    /// # Errors
    /// `PartnerNotFound`, or a store failure.
    pub fn run_settlement_for_partner(&self, id: PartnerId) -> Result<usize> {
        let now = self.now();
        let policy = self.policy;
        let matured = self.db.write(|tx| settlement::settle_partner(tx, id, policy, now))?;
        FisioCounters::add(&self.counters.credits_matured, matured as u64);
        debug!(partner = %id, matured, "Partner settled");
        Ok(matured)
    }

    /// Mature one session's credit regardless of policy (the admin path
    /// under manual maturation). Returns `false` if it had already matured.
    ///
    /// # Errors
    /// `SessionNotFound`, or `IllegalTransition` if the session is not
    /// settled.
    pub fn mature_session(&self, id: SessionId) -> Result<bool> {
        let now = self.now();
        let matured = self.db.write(|tx| {
            let mut s = session::require(tx, id)?;
            if s.matured_at.is_some() && s.is_settled() {
                return Ok(false);
            }
            let mut p = partner::require(tx, s.partner_id)?;
            settlement::mature(tx, &mut p, &mut s, now)?;
            partner::save(tx, &p)?;
            Ok::<_, FisioError>(true)
        })?;
        if matured {
            FisioCounters::add(&self.counters.credits_matured, 1);
            info!(session = %id, "Credit matured manually");
        }
        Ok(matured)
    }
}
