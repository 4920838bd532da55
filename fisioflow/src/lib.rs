//! # fisioflow
//!
//! Host crate for the FisioFlow backend cores.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 FisioFlow host               │
//! │   config · telemetry · settlement scheduler  │
//! │  ┌────────────────────┐ ┌──────────────────┐ │
//! │  │  fisioflow-core    │ │  fisioflow-llm   │ │
//! │  │  vouchers, ledger, │ │  KB, routing,    │ │
//! │  │  withdrawals       │ │  usage ledger    │ │
//! │  └─────────┬──────────┘ └────────┬─────────┘ │
//! │            └──── fisioflow-store ┘           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! - `config` : the composite `fisioflow.toml`
//! - `telemetry` : tracing subscriber setup
//! - `host` : [`FisioFlow`], built once per process
//! - `scheduler` : periodic settlement and voucher expiry

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod host;
pub mod scheduler;
pub mod telemetry;

pub use config::{FisioConfig, GeneralConfig, LogFormat};
pub use error::{HostError, Result};
pub use host::FisioFlow;
pub use scheduler::SettlementScheduler;
