//! Decision reason codes
//!
//! Every reject carries one of these; the string form is stable because it is
//! used as a metric label and stored in audit rows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an intent, command or payload was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    /// StormGuard is in HALT; NEW intents are blocked
    PolicyHalt,
    /// StormGuard is in DEGRADED and the intent exceeds throttled limits
    PolicyThrottle,
    /// Exposure cap breached or store full
    ExposureCap,
    /// Price outside the allowed band around reference
    PriceBand,
    /// Quantity above the per-order maximum
    MaxQty,
    /// Notional above the per-order maximum
    MaxNotional,
    /// Resulting position would exceed the cap
    MaxPosition,
    /// Per-strategy order rate hard cap
    OrderRate,
    /// Symbol not present in the directory
    UnknownSymbol,
    /// Intent failed field validation
    InvalidIntent,
    /// Replay with a payload that does not match the cached one
    DuplicateMismatch,
    /// Non-blocking enqueue found the queue full
    QueueFull,
    /// Command arrived past its deadline
    DeadlineExpired,
    /// Adapter circuit breaker is open
    CircuitOpen,
    /// Broker rejected the action
    BrokerReject,
    /// Retries exhausted, parked in the DLQ
    DeadLetter,
}

impl ReasonCode {
    /// Stable string form used in metrics and audit rows
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyHalt => "POLICY_HALT",
            Self::PolicyThrottle => "POLICY_THROTTLE",
            Self::ExposureCap => "EXPOSURE_CAP",
            Self::PriceBand => "PRICE_BAND",
            Self::MaxQty => "MAX_QTY",
            Self::MaxNotional => "MAX_NOTIONAL",
            Self::MaxPosition => "MAX_POSITION",
            Self::OrderRate => "ORDER_RATE",
            Self::UnknownSymbol => "UNKNOWN_SYMBOL",
            Self::InvalidIntent => "INVALID_INTENT",
            Self::DuplicateMismatch => "DUPLICATE_MISMATCH",
            Self::QueueFull => "QUEUE_FULL",
            Self::DeadlineExpired => "DEADLINE_EXPIRED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::BrokerReject => "BROKER_REJECT",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings_stable() {
        assert_eq!(ReasonCode::ExposureCap.as_str(), "EXPOSURE_CAP");
        assert_eq!(ReasonCode::PolicyHalt.as_str(), "POLICY_HALT");
        assert_eq!(ReasonCode::PriceBand.to_string(), "PRICE_BAND");
    }
}
