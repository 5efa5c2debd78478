//! Domain types for the payment-monitoring core.
//!
//! Contains the chain tag, the exact-decimal [`Amount`], the [`BlockHeight`]
//! newtype, and the persisted entities the monitors drive: [`Payment`],
//! [`ChainTransaction`], and [`OutboundEvent`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ==============================================================================
// Chain Tag
// ==============================================================================

/// Which chain family a payment, transaction, or cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Bitcoin-family chain with push notifications available.
    Btc,
    /// Zcash-family chain with transparent and shielded addresses.
    Zec,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Btc => "btc",
            Chain::Zec => "zec",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// Block Height
// ==============================================================================

/// A block height, wrapped for type safety.
///
/// `#[serde(transparent)]` preserves the JSON representation as a bare
/// integer, so this newtype is wire-compatible with plain `u64`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockHeight(pub u64);

impl From<u64> for BlockHeight {
    fn from(h: u64) -> Self {
        Self(h)
    }
}

impl From<BlockHeight> for u64 {
    fn from(h: BlockHeight) -> Self {
        h.0
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ==============================================================================
// Amount
// ==============================================================================

/// A monetary amount in 1e-8 base units (satoshis / zatoshis).
///
/// Parsed and displayed as exact decimal text with up to eight fractional
/// digits. There is deliberately no `f64` conversion anywhere: chain nodes
/// emit amounts as JSON numbers, and those are parsed from their textual
/// representation to avoid float rounding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    /// Base units per coin.
    pub const COIN: u64 = 100_000_000;
    pub const ZERO: Amount = Amount(0);

    pub const fn from_base_units(units: u64) -> Self {
        Amount(units)
    }

    pub const fn base_units(self) -> u64 {
        self.0
    }
}

impl FromStr for Amount {
    type Err = CoreError;

    /// Parse decimal notation, including the exponent forms `serde_json`
    /// produces for small numbers (`6.6e-6`). Rejects negatives and any
    /// value with more than eight significant fractional digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidData(format!("invalid amount `{s}`"));

        let (mantissa, exp) = match s.split_once(|c| c == 'e' || c == 'E') {
            Some((m, e)) => (m, e.parse::<i32>().map_err(|_| invalid())?),
            None => (s, 0),
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        // Normalize to digits * 10^shift, then scale to base units.
        let digits: String = [int_part, frac_part].concat();
        let mut value: u128 = digits.parse().map_err(|_| invalid())?;
        let shift = 8_i64 + exp as i64 - frac_part.len() as i64;

        if shift < 0 {
            let divisor = 10_u128
                .checked_pow(shift.unsigned_abs() as u32)
                .ok_or_else(|| invalid())?;
            if value % divisor != 0 {
                return Err(CoreError::InvalidData(format!(
                    "amount `{s}` has more than 8 fractional digits"
                )));
            }
            value /= divisor;
        } else {
            let factor = 10_u128
                .checked_pow(shift as u32)
                .ok_or_else(|| invalid())?;
            value = value.checked_mul(factor).ok_or_else(|| invalid())?;
        }

        u64::try_from(value)
            .map(Amount)
            .map_err(|_| CoreError::InvalidData(format!("amount `{s}` out of range")))
    }
}

impl fmt::Display for Amount {
    /// Always prints all eight fractional digits, preserving the exact-text
    /// convention of the payment records.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:08}", self.0 / Self::COIN, self.0 % Self::COIN)
    }
}

impl Serialize for Amount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ==============================================================================
// Payments
// ==============================================================================

/// Payment lifecycle states. The core drives `pending → detected →
/// confirmed` and `pending → expired`; everything else belongs to
/// collaborators and is opaque here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Detected,
    Confirmed,
    Expired,
    Failed,
}

impl PaymentStatus {
    /// Whether the core may still act on a payment in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Detected)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Detected => "detected",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A merchant-originated request to receive a fixed amount on one chain at
/// one address. Created externally; the core only advances its status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub merchant_id: String,
    pub order_id: String,
    pub chain: Chain,
    pub address: String,
    pub expected_amount: Amount,
    pub status: PaymentStatus,
    pub confirmations: u32,
    /// Set on first detection; stable afterwards.
    pub txid: Option<String>,
    pub detected_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

// ==============================================================================
// Chain Transactions
// ==============================================================================

/// The record of one on-chain transaction paying one payment address.
/// Unique per `(chain, txid, address)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub id: String,
    pub payment_id: String,
    pub chain: Chain,
    pub txid: String,
    pub address: String,
    pub amount: Amount,
    pub confirmations: u32,
    /// `None` while the transaction sits in the mempool.
    pub block_height: Option<BlockHeight>,
    pub block_hash: Option<String>,
    pub shielded: bool,
    /// Decoded memo text; shielded transactions only.
    pub memo: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Input to [`TransactionRepository::create`](crate::storage::TransactionRepository::create).
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payment_id: String,
    pub chain: Chain,
    pub txid: String,
    pub address: String,
    pub amount: Amount,
    pub confirmations: u32,
    pub block_height: Option<BlockHeight>,
    pub block_hash: Option<String>,
    pub shielded: bool,
    pub memo: Option<String>,
}

// ==============================================================================
// Outbound Events
// ==============================================================================

/// Outbound notification kinds emitted on payment state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "payment.detected")]
    PaymentDetected,
    #[serde(rename = "payment.confirmed")]
    PaymentConfirmed,
    #[serde(rename = "payment.expired")]
    PaymentExpired,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentDetected => "payment.detected",
            EventType::PaymentConfirmed => "payment.confirmed",
            EventType::PaymentExpired => "payment.expired",
            EventType::PaymentFailed => "payment.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound notification row. Created once per state transition and
/// never mutated by the core; delivery is an external concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub id: String,
    pub merchant_id: String,
    pub payment_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// Viewing Keys
// ==============================================================================

/// A read-only viewing capability for a shielded address, issued by the
/// wallet collaborator. The core only forwards it to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewingKey {
    pub key: String,
    /// Height at which the key became valid. A rescan must start no later
    /// than this to find historical payments; `None` means unknown.
    pub birthday: Option<BlockHeight>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().expect("amount must parse")
    }

    #[test]
    fn amount_parses_integer_and_decimal() {
        assert_eq!(amt("1"), Amount::from_base_units(100_000_000));
        assert_eq!(amt("0.5"), Amount::from_base_units(50_000_000));
        assert_eq!(amt("0.00000001"), Amount::from_base_units(1));
        assert_eq!(amt("21.00000000"), Amount::from_base_units(2_100_000_000));
    }

    #[test]
    fn amount_parses_exponent_notation() {
        // serde_json renders small floats this way; must stay exact.
        assert_eq!(amt("6.6e-6"), Amount::from_base_units(660));
        assert_eq!(amt("1e-8"), Amount::from_base_units(1));
        assert_eq!(amt("1E2"), Amount::from_base_units(100 * Amount::COIN));
    }

    #[test]
    fn amount_rejects_excess_precision() {
        assert!("0.000000001".parse::<Amount>().is_err());
        assert!("1e-9".parse::<Amount>().is_err());
    }

    #[test]
    fn amount_rejects_garbage() {
        for bad in ["", ".", "-1", "1.2.3", "abc", "1..2", "0x10"] {
            assert!(bad.parse::<Amount>().is_err(), "should reject `{bad}`");
        }
    }

    #[test]
    fn amount_displays_all_eight_digits() {
        assert_eq!(amt("1.5").to_string(), "1.50000000");
        assert_eq!(Amount::ZERO.to_string(), "0.00000000");
        assert_eq!(amt("0.00000001").to_string(), "0.00000001");
    }

    #[test]
    fn amount_roundtrips_through_display() {
        for s in ["0.00000001", "123.45678901", "0.10000000"] {
            let a = amt(s);
            assert_eq!(a.to_string().parse::<Amount>().unwrap(), a);
        }
    }

    #[test]
    fn status_activity() {
        assert!(PaymentStatus::Pending.is_active());
        assert!(PaymentStatus::Detected.is_active());
        assert!(!PaymentStatus::Confirmed.is_active());
        assert!(!PaymentStatus::Expired.is_active());
        assert!(!PaymentStatus::Failed.is_active());
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::PaymentDetected.as_str(), "payment.detected");
        assert_eq!(EventType::PaymentConfirmed.as_str(), "payment.confirmed");
    }
}
