//! # FisioFlow Store
//!
//! Persistent-store adapter shared by the voucher/settlement core and the
//! LLM orchestrator.
//!
//! - [`Database`] owns one SQLite connection and hands out serialized
//!   write transactions (`BEGIN IMMEDIATE`). Every money-moving critical
//!   section in the workspace runs inside one of them, so a row that is read
//!   and then mutated inside the closure cannot be touched by anyone else
//!   until the closure returns.
//! - [`codec`] maps fixed-point decimals, instants and enum codes to and from
//!   TEXT columns without ever passing through binary floats.
//! - [`clock`] abstracts "now" so expiry and maturation boundaries are
//!   testable to the nanosecond.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod codec;
pub mod config;
pub mod database;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PersistenceConfig;
pub use database::Database;
pub use error::{Result, StoreError};

/// Re-exported so dependants name transactions without a direct `rusqlite`
/// import in every module.
pub use rusqlite::{Connection, Transaction, params};
