//! The voucher and settlement engine.
//!
//! [`VoucherEngine`] owns the database handle, the clock and the counters.
//! Every mutating operation is one [`Database::write`] transaction: the rows
//! it reads stay exclusively held until the closure returns, the pure
//! transition methods on the domain types run inside it, and the ledger
//! entries commit together with the counters they explain.
//!
//! Operations are grouped by entity in the submodules; they all live on
//! `VoucherEngine`.

mod partners;
mod sessions;
mod settlement;
mod vouchers;
mod withdrawals;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fisioflow_store::{Clock, Database, PersistenceConfig, SystemClock};
use rusqlite::Transaction;
use tracing::info;

use crate::config::CoreConfig;
use crate::error::{ErrorClass, FisioError, Result};
use crate::metrics::FisioCounters;
use crate::schema;
use crate::settlement::MaturationPolicy;
use crate::voucher::{self, Voucher};

pub use sessions::{Redemption, SessionSource};
pub use vouchers::IssueVoucher;

/// Partner voucher and settlement engine.
///
/// # Usage
///
/// ```no_run
/// # use fisioflow_core::{VoucherEngine, CoreConfig, CommissionSplit};
/// # use rust_decimal::Decimal;
/// let engine = VoucherEngine::in_memory(CoreConfig::default())?;
/// let split = CommissionSplit::new(
///     Decimal::new(10, 0), Decimal::new(3, 0), Decimal::new(2, 0), Decimal::new(85, 0),
/// );
/// let partner = engine.create_partner("Studio Ana", split, None)?;
/// engine.activate_partner(partner.id)?;
/// # Ok::<(), fisioflow_core::FisioError>(())
/// ```
pub struct VoucherEngine {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    policy: MaturationPolicy,
    counters: Arc<FisioCounters>,
}

impl std::fmt::Debug for VoucherEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoucherEngine")
            .field("db", &self.db)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl VoucherEngine {
    /// Build an engine over `db`, applying pending schema migrations.
    ///
    /// # Errors
    /// Returns `FisioError::Config` for an invalid configuration, or a store
    /// error if the migrations fail.
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let applied = db.migrate(schema::COMPONENT, schema::MIGRATIONS)?;
        let policy = config.settlement.policy();
        info!(applied, ?policy, "Voucher engine ready");
        Ok(Self {
            db,
            clock,
            config,
            policy,
            counters: Arc::new(FisioCounters::new()),
        })
    }

    /// An engine over a fresh in-memory database and the system clock.
    ///
    /// # Errors
    /// See [`VoucherEngine::new`].
    pub fn in_memory(config: CoreConfig) -> Result<Self> {
        let db = Database::open_in_memory(&PersistenceConfig::default())?;
        Self::new(Arc::new(db), Arc::new(SystemClock), config)
    }

    /// Share counters with a host that already exports them.
    #[must_use]
    pub fn with_counters(mut self, counters: Arc<FisioCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Active maturation predicate.
    #[must_use]
    pub fn policy(&self) -> MaturationPolicy {
        self.policy
    }

    /// Engine counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<FisioCounters> {
        &self.counters
    }

    /// Underlying database.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `f` against the voucher with `code` while holding it exclusively.
    ///
    /// The voucher is saved when `f` returns `Ok`; on `Err` the whole
    /// transaction, including anything else `f` wrote, rolls back.
    ///
    /// # Errors
    /// [`FisioError::VoucherNotFound`], or whatever `f` returns.
    pub fn with_voucher_locked<T, F>(&self, code: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>, &mut Voucher) -> Result<T>,
    {
        self.db.write(|tx| {
            let mut v = voucher::require_by_code(tx, code)?;
            let out = f(tx, &mut v)?;
            voucher::save(tx, &v)?;
            Ok(out)
        })
    }

    fn note_rejection(&self, err: &FisioError) {
        if err.kind().class() == ErrorClass::Precondition {
            FisioCounters::add(&self.counters.redemptions_rejected, 1);
        }
    }
}
