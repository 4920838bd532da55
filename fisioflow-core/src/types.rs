//! Identity types and stored status codes.
//!
//! Every status enum round-trips through a stable SCREAMING_SNAKE code, which
//! is what the database stores and what serde emits.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Fixed-point money with two fractional digits.
pub type Money = Decimal;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a revenue-sharing partner.
    PartnerId
);
uuid_id!(
    /// Unique identifier for a patient (owned by the clinic records system).
    PatientId
);
uuid_id!(
    /// Unique identifier for a voucher row (distinct from its public code).
    VoucherId
);
uuid_id!(
    /// Unique identifier for a session.
    SessionId
);
uuid_id!(
    /// Unique identifier for a withdrawal request.
    WithdrawalId
);

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// A stored code did not match any known variant.
#[derive(Debug, Clone, Error)]
#[error("Unknown {kind} code: {code:?}")]
pub struct UnknownCode {
    /// Which enum was being decoded.
    pub kind: &'static str,
    /// The offending code.
    pub code: String,
}

macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $code:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Stable storage code.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $code ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownCode;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $code => Ok(Self::$variant), )+
                    other => Err(UnknownCode {
                        kind: stringify!($name),
                        code: other.to_string(),
                    }),
                }
            }
        }
    };
}

code_enum!(
    /// Partner lifecycle.
    PartnerStatus {
        /// Registered, awaiting admin approval.
        Pending => "PENDING",
        /// May issue and redeem vouchers.
        Active => "ACTIVE",
        /// Temporarily barred; may be reactivated.
        Suspended => "SUSPENDED",
        /// Contract ended (terminal).
        Terminated => "TERMINATED",
        /// Barred for cause (terminal).
        Blocked => "BLOCKED",
    }
);

impl PartnerStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Blocked)
    }

    /// Whether the admin transition `self → to` is allowed.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        match (self, to) {
            (Self::Pending | Self::Suspended, Self::Active)
            | (Self::Active, Self::Suspended) => true,
            (from, Self::Terminated | Self::Blocked) => !from.is_terminal(),
            _ => false,
        }
    }
}

code_enum!(
    /// What a voucher bundles.
    VoucherType {
        /// One session.
        Single => "SINGLE",
        /// A month of sessions.
        Monthly => "MONTHLY",
        /// A fixed package of sessions.
        Package => "PACKAGE",
        /// No practical session cap (sentinel count).
        Unlimited => "UNLIMITED",
    }
);

code_enum!(
    /// Voucher lifecycle.
    VoucherStatus {
        /// Redeemable (subject to payment and validity window).
        Active => "ACTIVE",
        /// Every session consumed.
        Used => "USED",
        /// Past `valid_until`.
        Expired => "EXPIRED",
        /// Cancelled before use.
        Cancelled => "CANCELLED",
        /// Money returned to the patient.
        Refunded => "REFUNDED",
    }
);

code_enum!(
    /// Payment lifecycle of a voucher.
    PaymentStatus {
        /// Awaiting payment.
        Pending => "PENDING",
        /// The gateway is processing.
        Processing => "PROCESSING",
        /// Cleared; the voucher is redeemable.
        Paid => "PAID",
        /// Attempt failed; may be retried until the voucher expires.
        Failed => "FAILED",
        /// Abandoned (terminal).
        Cancelled => "CANCELLED",
        /// Money returned (terminal).
        Refunded => "REFUNDED",
    }
);

code_enum!(
    /// Session lifecycle.
    SessionStatus {
        /// Booked, not yet rendered.
        Scheduled => "SCHEDULED",
        /// Rendered and settled.
        Completed => "COMPLETED",
        /// Cancelled (before completion, or reversed after it).
        Cancelled => "CANCELLED",
        /// Patient did not attend.
        NoShow => "NO_SHOW",
    }
);

code_enum!(
    /// Withdrawal lifecycle.
    WithdrawalStatus {
        /// Requested, no money moved.
        Pending => "PENDING",
        /// Amount reserved and handed to the payout job.
        Processing => "PROCESSING",
        /// Paid out (terminal).
        Completed => "COMPLETED",
        /// Payout failed, reservation released (terminal).
        Failed => "FAILED",
        /// Withdrawn by the partner or admin (terminal).
        Cancelled => "CANCELLED",
    }
);

impl WithdrawalStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

code_enum!(
    /// Kind of an immutable ledger movement.
    LedgerKind {
        /// Gross session price.
        Revenue => "REVENUE",
        /// Platform commission.
        FeePlatform => "FEE_PLATFORM",
        /// Payment gateway fee.
        FeeGateway => "FEE_GATEWAY",
        /// Tax withheld.
        FeeTax => "FEE_TAX",
        /// Net owed to the partner (starts pending).
        PartnerCredit => "PARTNER_CREDIT",
        /// A credit promoted from pending to available.
        BalanceMature => "BALANCE_MATURE",
        /// Cash paid out to the partner.
        WithdrawalDebit => "WITHDRAWAL_DEBIT",
        /// Negation of an earlier entry.
        Reversal => "REVERSAL",
    }
);

impl LedgerKind {
    /// The three fee kinds.
    pub const FEES: [Self; 3] = [Self::FeePlatform, Self::FeeGateway, Self::FeeTax];
}
