//! The process-wide host object.
//!
//! [`FisioFlow`] is built once at startup, owns the database, the voucher
//! engine, the knowledge base and the orchestrator, and exposes the request
//! layer's operations. Nothing in the workspace is a global: tests build a
//! host with fakes through [`FisioFlow::with_parts`].

use std::sync::Arc;
use std::time::Duration;

use fisioflow_core::{
    CounterSnapshot, Destination, IssueVoucher, Redemption, Session, SessionId, SessionMetadata, Voucher, VoucherEngine,
    VoucherId, Withdrawal, WithdrawalId,
};
use fisioflow_core::{Money, PartnerId, PatientId};
use fisioflow_llm::{
    GenerateRequest, LlmReply, Orchestrator, ProviderRegistry, SqliteKnowledgeBase, UsageLedger, UsageStats,
    UsageWindow,
};
use fisioflow_store::{Clock, Database, SystemClock};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::FisioConfig;
use crate::error::Result;
use crate::scheduler::SettlementScheduler;

/// FisioFlow host.
pub struct FisioFlow {
    config: FisioConfig,
    db: Arc<Database>,
    vouchers: Arc<VoucherEngine>,
    knowledge: Arc<SqliteKnowledgeBase>,
    llm: Arc<Orchestrator>,
    scheduler: Mutex<Option<SettlementScheduler>>,
}

impl std::fmt::Debug for FisioFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FisioFlow")
            .field("db", &self.db)
            .field("llm", &self.llm)
            .finish_non_exhaustive()
    }
}

impl FisioFlow {
    /// Open the configured database and build every component with HTTP
    /// backends and the system clock. Call inside a tokio runtime so the
    /// usage writer runs in the background.
    ///
    /// # Errors
    /// Configuration, database or migration failures.
    pub fn new(config: FisioConfig) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::from_config(&config.persistence)?);
        let registry = ProviderRegistry::from_configs(&config.llm.providers);
        Self::with_parts(config, db, Arc::new(SystemClock), registry)
    }

    /// Build from explicit parts.
    ///
    /// # Errors
    /// Configuration or migration failures.
    pub fn with_parts(config: FisioConfig, db: Arc<Database>, clock: Arc<dyn Clock>, registry: ProviderRegistry) -> Result<Self> {
        let vouchers = Arc::new(VoucherEngine::new(Arc::clone(&db), Arc::clone(&clock), config.core.clone())?);
        let usage = Arc::new(UsageLedger::new(
            Arc::clone(&db),
            Arc::clone(&clock),
            config.llm.usage.rate_window_secs,
        )?);
        let knowledge = Arc::new(SqliteKnowledgeBase::new(Arc::clone(&db), clock)?);
        let llm = Arc::new(Orchestrator::new(config.llm.clone(), registry, usage, knowledge.clone()));
        info!(db = %db.db_path().display(), "FisioFlow host ready");
        Ok(Self {
            config,
            db,
            vouchers,
            knowledge,
            llm,
            scheduler: Mutex::new(None),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &FisioConfig {
        &self.config
    }

    /// The voucher and settlement engine, for operations the facade does
    /// not wrap (partners, payments, refunds, audits).
    #[must_use]
    pub fn vouchers(&self) -> &Arc<VoucherEngine> {
        &self.vouchers
    }

    /// Knowledge-base administration.
    #[must_use]
    pub fn knowledge(&self) -> &Arc<SqliteKnowledgeBase> {
        &self.knowledge
    }

    /// The LLM orchestrator.
    #[must_use]
    pub fn llm(&self) -> &Arc<Orchestrator> {
        &self.llm
    }

    /// Database handle.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ------------------------------------------------------------------
    // Voucher core
    // ------------------------------------------------------------------

    /// # Errors
    /// `PartnerNotActive`, `InvalidAmounts`, `InvalidDateRange`, ...
    pub fn issue_voucher(&self, req: &IssueVoucher) -> Result<Voucher> {
        Ok(self.vouchers.issue_voucher(req)?)
    }

    /// # Errors
    /// `VoucherNotFound`, `IllegalTransition`.
    pub fn confirm_payment(&self, id: VoucherId, external_payment_id: &str, method: &str) -> Result<Voucher> {
        Ok(self.vouchers.confirm_payment(id, external_payment_id, method)?)
    }

    /// # Errors
    /// Any redemption precondition.
    pub fn redeem_session(&self, code: &str, patient_id: PatientId, meta: &SessionMetadata) -> Result<Redemption> {
        Ok(self.vouchers.redeem_session(code, patient_id, meta)?)
    }

    /// # Errors
    /// `IllegalTransition`, `SessionNotFound`, `InvariantViolation`.
    pub fn cancel_session(&self, id: SessionId, reason: Option<&str>, no_show: bool) -> Result<Session> {
        Ok(self.vouchers.cancel_session(id, reason, no_show)?)
    }

    /// One settlement pass; returns matured credits.
    ///
    /// # Errors
    /// The first per-partner failure.
    pub fn run_settlement(&self) -> Result<usize> {
        Ok(self.vouchers.run_settlement()?)
    }

    /// # Errors
    /// `InsufficientBalance`, `BelowMinimum`, `InvalidDestination`, ...
    pub fn request_withdrawal(&self, partner_id: PartnerId, amount: Money, destination: Destination) -> Result<Withdrawal> {
        Ok(self.vouchers.request_withdrawal(partner_id, amount, destination)?)
    }

    /// # Errors
    /// `IllegalTransition`, `InsufficientBalance`.
    pub fn dispatch_withdrawal(&self, id: WithdrawalId, external_ref: &str) -> Result<Withdrawal> {
        Ok(self.vouchers.dispatch_withdrawal(id, external_ref)?)
    }

    /// # Errors
    /// `IllegalTransition`.
    pub fn complete_withdrawal(&self, id: WithdrawalId, transaction_id: &str) -> Result<Withdrawal> {
        Ok(self.vouchers.complete_withdrawal(id, transaction_id)?)
    }

    /// # Errors
    /// `IllegalTransition`.
    pub fn fail_withdrawal(&self, id: WithdrawalId, reason: &str) -> Result<Withdrawal> {
        Ok(self.vouchers.fail_withdrawal(id, reason)?)
    }

    /// # Errors
    /// `IllegalTransition`.
    pub fn cancel_withdrawal(&self, id: WithdrawalId, reason: Option<&str>) -> Result<Withdrawal> {
        Ok(self.vouchers.cancel_withdrawal(id, reason)?)
    }

    // ------------------------------------------------------------------
    // LLM
    // ------------------------------------------------------------------

    /// # Errors
    /// `NoProvidersAvailable`.
    pub async fn llm_generate(&self, request: &GenerateRequest) -> Result<LlmReply> {
        Ok(self.llm.generate(request).await?)
    }

    /// # Errors
    /// Storage failures.
    pub async fn llm_usage_stats(&self, user_id: Option<&str>, window: UsageWindow) -> Result<UsageStats> {
        Ok(self.llm.usage_stats(user_id, window).await?)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the periodic settlement task at the configured interval. No-op
    /// when the interval is zero or a scheduler is already running.
    pub async fn start_scheduler(&self) -> bool {
        let secs = self.config.core.settlement.schedule_interval_secs;
        if secs == 0 {
            return false;
        }
        self.start_scheduler_every(Duration::from_secs(secs)).await
    }

    /// Start the periodic settlement task with an explicit period.
    pub async fn start_scheduler_every(&self, period: Duration) -> bool {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(SettlementScheduler::spawn(Arc::clone(&self.vouchers), period));
        true
    }

    /// Stop the scheduler, flush usage records and take a rotating backup
    /// of file-backed databases.
    ///
    /// # Errors
    /// Backup failures.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
        self.llm.flush_usage().await;
        if !self.config.persistence.is_in_memory() && self.config.persistence.backup_count > 0 {
            self.db.create_rotating_backup()?;
        }
        info!("FisioFlow host stopped");
        Ok(())
    }

    /// Counters of both components in Prometheus text format.
    #[must_use]
    pub fn metrics_text(&self) -> String {
        let core: CounterSnapshot = self.vouchers.counters().snapshot();
        let mut out = core.to_prometheus();
        out.push_str(&self.llm.counters().snapshot().to_prometheus());
        out
    }
}
