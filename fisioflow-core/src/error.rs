//! Error types for the voucher and settlement engine.
//!
//! Every variant maps to a stable [`ErrorKind`] so callers can branch on the
//! failure without parsing messages, and every kind belongs to one
//! [`ErrorClass`].

use fisioflow_store::StoreError;
use thiserror::Error;

use crate::types::{Money, PartnerId, PartnerStatus, PatientId, SessionId, WithdrawalId};

/// Top-level error type for all engine operations.
#[derive(Error, Debug)]
pub enum FisioError {
    /// No partner with this ID exists.
    #[error("Partner not found: {0}")]
    PartnerNotFound(PartnerId),

    /// The partner is not ACTIVE.
    #[error("Partner {partner} is not active (status: {status})")]
    PartnerNotActive {
        /// Which partner.
        partner: PartnerId,
        /// Its current status.
        status: PartnerStatus,
    },

    /// The patient was never registered.
    #[error("Unknown patient: {0}")]
    PatientUnknown(PatientId),

    /// `valid_until` is not after `valid_from`.
    #[error("Invalid date range: valid_until must be after valid_from")]
    InvalidDateRange,

    /// Prices, discounts, session counts or fees are inconsistent.
    #[error("Invalid amounts: {0}")]
    InvalidAmounts(String),

    /// Commission split does not satisfy the split rules.
    #[error("Invalid commission split: {0}")]
    InvalidSplit(String),

    /// Could not find a free voucher code.
    #[error("Voucher code space exhausted after {attempts} attempts")]
    CodeExhausted {
        /// Draws made before giving up.
        attempts: u32,
    },

    /// No voucher with this ID or code.
    #[error("Voucher not found: {0}")]
    VoucherNotFound(String),

    /// The voucher's payment has not cleared.
    #[error("Voucher {0} is not paid")]
    VoucherNotPaid(String),

    /// The redemption instant is before `valid_from`.
    #[error("Voucher {0} is not valid yet")]
    VoucherNotYetValid(String),

    /// The redemption instant is after `valid_until`.
    #[error("Voucher {0} has expired")]
    VoucherExpired(String),

    /// No sessions remain on the voucher.
    #[error("Voucher {0} has no sessions remaining")]
    VoucherExhausted(String),

    /// The voucher is in a status that forbids the operation.
    #[error("Voucher {code} has status {status}")]
    VoucherStatusInvalid {
        /// Voucher code.
        code: String,
        /// Current status code.
        status: String,
    },

    /// The session's patient is not the voucher holder.
    #[error("Voucher {0} belongs to another patient")]
    PatientMismatch(String),

    /// A different external payment id was presented for a paid voucher.
    #[error("Voucher {code} already paid with {payment_id}")]
    AlreadyPaid {
        /// Voucher code.
        code: String,
        /// The payment id recorded on the voucher.
        payment_id: String,
    },

    /// No session with this ID.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// No withdrawal with this ID.
    #[error("Withdrawal not found: {0}")]
    WithdrawalNotFound(WithdrawalId),

    /// Requested more than the available balance.
    #[error("Insufficient balance for partner {partner}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Which partner.
        partner: PartnerId,
        /// Amount requested.
        requested: Money,
        /// Available balance at the time of the request.
        available: Money,
    },

    /// Requested less than the partner's minimum withdrawal.
    #[error("Withdrawal of {requested} is below the minimum of {minimum}")]
    BelowMinimum {
        /// Amount requested.
        requested: Money,
        /// Minimum allowed.
        minimum: Money,
    },

    /// The payout destination is malformed.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// A state machine refused the action.
    #[error("Illegal transition: cannot {action} {entity} in status {from}")]
    IllegalTransition {
        /// Entity kind (`session`, `withdrawal`, ...).
        entity: &'static str,
        /// Current status code.
        from: String,
        /// The refused action.
        action: &'static str,
    },

    /// A money or counter invariant would be broken.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for FisioError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

/// Stable identifier of an error, independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    PartnerNotFound,
    PartnerNotActive,
    PatientUnknown,
    InvalidDateRange,
    InvalidAmounts,
    InvalidSplit,
    CodeExhausted,
    VoucherNotFound,
    VoucherNotPaid,
    VoucherNotYetValid,
    VoucherExpired,
    VoucherExhausted,
    VoucherStatusInvalid,
    PatientMismatch,
    AlreadyPaid,
    SessionNotFound,
    WithdrawalNotFound,
    InsufficientBalance,
    BelowMinimum,
    InvalidDestination,
    IllegalTransition,
    InvariantViolation,
    Config,
    Storage,
}

/// Handling class of an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Deterministic rejection; never retried.
    Precondition,
    /// External fault that may succeed on retry.
    Transient,
    /// Broken money or counter invariant; fatal, never repaired.
    Invariant,
    /// A bounded search ran out of attempts.
    Exhaustion,
    /// Misconfiguration or storage failure.
    Internal,
}

impl ErrorKind {
    /// SCREAMING_SNAKE identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PartnerNotFound => "PARTNER_NOT_FOUND",
            Self::PartnerNotActive => "PARTNER_NOT_ACTIVE",
            Self::PatientUnknown => "PATIENT_UNKNOWN",
            Self::InvalidDateRange => "INVALID_DATE_RANGE",
            Self::InvalidAmounts => "INVALID_AMOUNTS",
            Self::InvalidSplit => "INVALID_SPLIT",
            Self::CodeExhausted => "CODE_EXHAUSTED",
            Self::VoucherNotFound => "VOUCHER_NOT_FOUND",
            Self::VoucherNotPaid => "VOUCHER_NOT_PAID",
            Self::VoucherNotYetValid => "VOUCHER_NOT_YET_VALID",
            Self::VoucherExpired => "VOUCHER_EXPIRED",
            Self::VoucherExhausted => "VOUCHER_EXHAUSTED",
            Self::VoucherStatusInvalid => "VOUCHER_STATUS_INVALID",
            Self::PatientMismatch => "PATIENT_MISMATCH",
            Self::AlreadyPaid => "ALREADY_PAID",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::WithdrawalNotFound => "WITHDRAWAL_NOT_FOUND",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::BelowMinimum => "BELOW_MINIMUM",
            Self::InvalidDestination => "INVALID_DESTINATION",
            Self::IllegalTransition => "ILLEGAL_TRANSITION",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::Config => "CONFIG",
            Self::Storage => "STORAGE",
        }
    }

    /// Which handling class this kind belongs to.
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::InvariantViolation => ErrorClass::Invariant,
            Self::CodeExhausted => ErrorClass::Exhaustion,
            Self::Config | Self::Storage => ErrorClass::Internal,
            _ => ErrorClass::Precondition,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FisioError {
    /// Stable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PartnerNotFound(_) => ErrorKind::PartnerNotFound,
            Self::PartnerNotActive { .. } => ErrorKind::PartnerNotActive,
            Self::PatientUnknown(_) => ErrorKind::PatientUnknown,
            Self::InvalidDateRange => ErrorKind::InvalidDateRange,
            Self::InvalidAmounts(_) => ErrorKind::InvalidAmounts,
            Self::InvalidSplit(_) => ErrorKind::InvalidSplit,
            Self::CodeExhausted { .. } => ErrorKind::CodeExhausted,
            Self::VoucherNotFound(_) => ErrorKind::VoucherNotFound,
            Self::VoucherNotPaid(_) => ErrorKind::VoucherNotPaid,
            Self::VoucherNotYetValid(_) => ErrorKind::VoucherNotYetValid,
            Self::VoucherExpired(_) => ErrorKind::VoucherExpired,
            Self::VoucherExhausted(_) => ErrorKind::VoucherExhausted,
            Self::VoucherStatusInvalid { .. } => ErrorKind::VoucherStatusInvalid,
            Self::PatientMismatch(_) => ErrorKind::PatientMismatch,
            Self::AlreadyPaid { .. } => ErrorKind::AlreadyPaid,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::WithdrawalNotFound(_) => ErrorKind::WithdrawalNotFound,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::BelowMinimum { .. } => ErrorKind::BelowMinimum,
            Self::InvalidDestination(_) => ErrorKind::InvalidDestination,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::Config(_) => ErrorKind::Config,
            Self::Store(_) => ErrorKind::Storage,
        }
    }

    /// Whether retrying the same call could succeed.
    ///
    /// Only a busy database qualifies; domain rejections never do.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_busy())
    }

    pub(crate) fn illegal(entity: &'static str, from: impl ToString, action: &'static str) -> Self {
        Self::IllegalTransition {
            entity,
            from: from.to_string(),
            action,
        }
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, FisioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_and_classified() {
        let err = FisioError::VoucherExpired("ABCD1234".into());
        assert_eq!(err.kind().as_str(), "VOUCHER_EXPIRED");
        assert_eq!(err.kind().class(), ErrorClass::Precondition);
        assert!(!err.is_retryable());

        let err = FisioError::InvariantViolation("negative".into());
        assert_eq!(err.kind().class(), ErrorClass::Invariant);

        let err = FisioError::CodeExhausted { attempts: 10 };
        assert_eq!(err.kind().class(), ErrorClass::Exhaustion);
    }

    #[test]
    fn message_is_not_the_kind() {
        let err = FisioError::illegal("withdrawal", "COMPLETED", "cancel");
        assert_eq!(err.kind(), ErrorKind::IllegalTransition);
        assert_eq!(
            err.to_string(),
            "Illegal transition: cannot cancel withdrawal in status COMPLETED"
        );
    }
}
