//! # FisioFlow Core
//!
//! Partner voucher and settlement engine for a physiotherapy marketplace.
//!
//! Partners (clinics and independent therapists) sell prepaid session
//! bundles ([`Voucher`]s) to patients. Each completed session settles
//! against an append-only ledger:
//!
//! - **Issuance** allocates a unique human-typable code; no money moves.
//! - **Redemption** checks and consumes one voucher session atomically,
//!   freezes the partner's commission split on the session and appends the
//!   revenue, fee and partner-credit entries.
//! - **Settlement** matures pending partner credits into the available
//!   balance under a pluggable [`MaturationPolicy`].
//! - **Withdrawal** reserves available balance at dispatch and debits it at
//!   completion.
//! - **Reversal** (cancellation after completion, refund) appends negating
//!   entries; nothing in the ledger is ever updated or deleted.
//!
//! ## Money
//!
//! All amounts are exact [`rust_decimal::Decimal`] values with two decimal
//! places. Fees round half away from zero; the partner net is always the
//! remainder so a settlement sums exactly to its gross.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod code;
pub mod commission;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod money;
pub mod partner;
pub mod schema;
pub mod session;
pub mod settlement;
pub mod types;
pub mod voucher;
pub mod withdrawal;

pub use commission::CommissionSnapshot;
pub use config::CoreConfig;
pub use engine::{IssueVoucher, Redemption, SessionSource, VoucherEngine};
pub use error::{ErrorClass, ErrorKind, FisioError, Result};
pub use ledger::{LedgerAudit, LedgerEntry};
pub use metrics::{CounterSnapshot, FisioCounters};
pub use partner::{CommissionSplit, Partner};
pub use session::{Session, SessionMetadata};
pub use settlement::MaturationPolicy;
pub use types::*;
pub use voucher::Voucher;
pub use withdrawal::{Destination, Withdrawal};
