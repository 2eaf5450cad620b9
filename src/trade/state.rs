//! Order and trade state definitions
//!
//! Status strings match what the stores persist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sell order status
///
/// Only `Pending -> Cancelled` is ever taken. `Completed` exists in the data model
/// but nothing transitions into it, not even a fully sold order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Cancelled,
    Completed,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "completed" => Ok(OrderStatus::Completed),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

/// Buy trade status
///
/// ```text
/// IN_PROGRESS ──confirm──▶ PENDING ──escrow released──▶ PROCESSED
///      │                      │
///      │                      └──release failed──▶ IN_PROGRESS
///      ├──buyer cancel──▶ CANCELLED (manual)
///      └──reaper──────▶ CANCELLED (auto)
/// ```
///
/// `Pending` is the claim a confirmation holds while escrow is moving; it keeps the
/// reaper and a concurrent cancel away from the trade. Terminal: PROCESSED, CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeStatus {
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "processed")]
    Processed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TradeStatus {
    /// No more transitions possible
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Processed | TradeStatus::Cancelled)
    }

    /// Counts against the one-open-trade-per-buyer-per-order rule
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, TradeStatus::InProgress | TradeStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::InProgress => "in-progress",
            TradeStatus::Pending => "pending",
            TradeStatus::Processed => "processed",
            TradeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-progress" => Ok(TradeStatus::InProgress),
            "pending" => Ok(TradeStatus::Pending),
            "processed" => Ok(TradeStatus::Processed),
            "cancelled" => Ok(TradeStatus::Cancelled),
            _ => Err(format!("Invalid trade status: {}", s)),
        }
    }
}

/// Why a trade was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum CancelReason {
    /// Buyer cancelled
    Manual = 0,
    /// Stale-trade reaper
    Auto = 1,
}

impl CancelReason {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(CancelReason::Manual),
            1 => Some(CancelReason::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Manual => "manual",
            CancelReason::Auto => "auto",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of an idempotent operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// This call performed the change
    Applied,
    /// The change was already in place; no side effects ran
    AlreadyApplied,
}
