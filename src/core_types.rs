//! Core identifier types
//!
//! Every record family gets its own ULID-backed id so an order id can never be
//! passed where a trade id is expected. ULIDs sort by creation time, which the
//! stores rely on for newest-first listings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a new unique id
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            /// Get the inner ULID value
            pub fn inner(&self) -> ulid::Ulid {
                self.0
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
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }

        impl From<ulid::Ulid> for $name {
            fn from(value: ulid::Ulid) -> Self {
                Self(value)
            }
        }
    };
}

ulid_id!(
    /// User identity as resolved by the (external) authentication layer
    UserId
);
ulid_id!(
    /// Sell order id
    OrderId
);
ulid_id!(
    /// Buy trade id
    TradeId
);
ulid_id!(
    /// Escrow deposit id
    DepositId
);
ulid_id!(
    /// Escrow release (audit entry) id
    ReleaseId
);
ulid_id!(ChatId);
ulid_id!(
    /// Reconciliation event id
    ReconcileId
);
