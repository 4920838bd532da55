//! Configuration for the voucher and settlement engine.
//!
//! Maps to the `[voucher]`, `[settlement]` and `[withdrawal]` sections of
//! `fisioflow.toml`. Money values are written as strings (`"50.00"`) so they
//! never pass through a binary float.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FisioError, Result};
use crate::settlement::MaturationPolicy;
use crate::types::Money;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Voucher issuance.
    #[serde(default)]
    pub voucher: VoucherConfig,
    /// Pending → available maturation.
    #[serde(default)]
    pub settlement: SettlementConfig,
    /// Partner cash-out rules.
    #[serde(default)]
    pub withdrawal: WithdrawalConfig,
}

impl CoreConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `FisioError::Config` if the TOML is invalid or fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| FisioError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    ///
    /// # Errors
    /// Returns `FisioError::Config` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let v = &self.voucher;
        if v.code_length == 0 {
            return Err(FisioError::Config("voucher.code_length must be at least 1".into()));
        }
        if v.code_alphabet.is_empty() {
            return Err(FisioError::Config("voucher.code_alphabet must not be empty".into()));
        }
        if !v.code_alphabet.is_ascii() {
            return Err(FisioError::Config("voucher.code_alphabet must be ASCII".into()));
        }
        if v.max_code_attempts == 0 {
            return Err(FisioError::Config("voucher.max_code_attempts must be at least 1".into()));
        }
        if v.unlimited_sessions == 0 {
            return Err(FisioError::Config("voucher.unlimited_sessions must be at least 1".into()));
        }

        let w = &self.withdrawal;
        if w.minimum_default.is_sign_negative() {
            return Err(FisioError::Config("withdrawal.minimum_default must not be negative".into()));
        }
        if w.fee_fixed.is_sign_negative() || w.fee_percent.is_sign_negative() {
            return Err(FisioError::Config("withdrawal fees must not be negative".into()));
        }
        if w.fee_percent >= Decimal::ONE_HUNDRED {
            return Err(FisioError::Config("withdrawal.fee_percent must be below 100".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Voucher code generation and session caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherConfig {
    /// Length of generated codes.
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// Characters codes are drawn from.
    #[serde(default = "default_alphabet")]
    pub code_alphabet: String,
    /// Draws per length before giving up (or widening).
    #[serde(default = "default_attempts")]
    pub max_code_attempts: u32,
    /// Retry with a longer code once the attempts at one length are spent.
    #[serde(default = "default_true")]
    pub widen_on_exhaustion: bool,
    /// Session count stored for UNLIMITED vouchers.
    #[serde(default = "default_unlimited")]
    pub unlimited_sessions: u32,
}

impl Default for VoucherConfig {
    fn default() -> Self {
        Self {
            code_length: 8,
            code_alphabet: default_alphabet(),
            max_code_attempts: 10,
            widen_on_exhaustion: true,
            unlimited_sessions: 9999,
        }
    }
}

/// Which predicate promotes pending credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaturationMode {
    /// Every pending credit matures at the next pass.
    #[default]
    Immediate,
    /// Credits mature `maturation_days` after completion.
    AfterDays,
    /// Only an explicit admin action matures a credit.
    Manual,
}

/// Settlement pass settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Maturation predicate.
    #[serde(default)]
    pub maturation_policy: MaturationMode,
    /// Days a credit stays pending under `after_days`.
    #[serde(default)]
    pub maturation_days: u32,
    /// Seconds between scheduled passes.
    #[serde(default = "default_interval")]
    pub schedule_interval_secs: u64,
    /// Run a partner-scoped pass before evaluating a withdrawal request.
    #[serde(default)]
    pub settle_before_withdrawal: bool,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            maturation_policy: MaturationMode::Immediate,
            maturation_days: 0,
            schedule_interval_secs: 86_400,
            settle_before_withdrawal: false,
        }
    }
}

impl SettlementConfig {
    /// The configured predicate.
    #[must_use]
    pub fn policy(&self) -> MaturationPolicy {
        match self.maturation_policy {
            MaturationMode::Immediate => MaturationPolicy::Immediate,
            MaturationMode::AfterDays => MaturationPolicy::AfterDays(self.maturation_days),
            MaturationMode::Manual => MaturationPolicy::Manual,
        }
    }
}

/// Withdrawal rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalConfig {
    /// Minimum withdrawal for partners without an override.
    #[serde(default = "default_minimum")]
    pub minimum_default: Money,
    /// Flat fee per withdrawal.
    #[serde(default)]
    pub fee_fixed: Money,
    /// Percentage fee per withdrawal.
    #[serde(default)]
    pub fee_percent: Decimal,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            minimum_default: default_minimum(),
            fee_fixed: Decimal::ZERO,
            fee_percent: Decimal::ZERO,
        }
    }
}

fn default_true() -> bool { true }
fn default_code_length() -> usize { 8 }
fn default_alphabet() -> String { "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_string() }
fn default_attempts() -> u32 { 10 }
fn default_unlimited() -> u32 { 9999 }
fn default_interval() -> u64 { 86_400 }
fn default_minimum() -> Money { Decimal::new(5000, 2) }

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = CoreConfig::from_toml("").expect("parse");
        assert_eq!(config.voucher.code_length, 8);
        assert_eq!(config.voucher.code_alphabet.len(), 36);
        assert_eq!(config.settlement.policy(), MaturationPolicy::Immediate);
        assert_eq!(config.withdrawal.minimum_default, dec!(50.00));
    }

    #[test]
    fn sections_override_defaults() {
        let config = CoreConfig::from_toml(
            r#"
            [voucher]
            code_length = 10

            [settlement]
            maturation_policy = "after_days"
            maturation_days = 30

            [withdrawal]
            minimum_default = "100.00"
            fee_percent = "1.5"
            "#,
        )
        .expect("parse");
        assert_eq!(config.voucher.code_length, 10);
        assert_eq!(config.settlement.policy(), MaturationPolicy::AfterDays(30));
        assert_eq!(config.withdrawal.minimum_default, dec!(100.00));
        assert_eq!(config.withdrawal.fee_percent, dec!(1.5));
    }

    #[test]
    fn validation_rejects_empty_alphabet() {
        let err = CoreConfig::from_toml("[voucher]\ncode_alphabet = \"\"\n").expect_err("invalid");
        assert!(matches!(err, FisioError::Config(_)));
    }

    #[test]
    fn validation_rejects_negative_fee() {
        let mut config = CoreConfig::default();
        config.withdrawal.fee_fixed = dec!(-1);
        assert!(config.validate().is_err());
    }
}
