//! Fixed-point price codec
//!
//! Prices cross the boundary as JSON numbers or decimal strings and are
//! converted exactly once into scaled integers. Inside the pipeline only the
//! scaled form exists; `unscale` is for reporting.

use crate::types::Px;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default scale exponent (10^4)
pub const DEFAULT_SCALE_EXP: u32 = 4;

const POW10: [i64; 10] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
];

/// Codec failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Scale exponent outside the supported range
    #[error("unsupported scale exponent: {0}")]
    BadScale(u32),
    /// String is not a decimal number
    #[error("malformed decimal: {0}")]
    Malformed(String),
    /// Value does not fit in i64 after scaling
    #[error("scaled value overflows i64")]
    Overflow,
}

/// Converts between external decimal prices and scaled integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceCodec {
    exp: u32,
    scale: i64,
}

impl Default for PriceCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SCALE_EXP).unwrap_or(Self {
            exp: DEFAULT_SCALE_EXP,
            scale: POW10[DEFAULT_SCALE_EXP as usize],
        })
    }
}

impl PriceCodec {
    /// Create a codec for scale 10^`exp`
    pub fn new(exp: u32) -> Result<Self, CodecError> {
        let scale = *POW10.get(exp as usize).ok_or(CodecError::BadScale(exp))?;
        Ok(Self { exp, scale })
    }

    /// The multiplier 10^exp
    #[must_use]
    pub const fn scale(&self) -> i64 {
        self.scale
    }

    /// Scale a boundary float into fixed point, rounding half away from zero
    #[must_use]
    pub fn scale_f64(&self, value: f64) -> Px {
        // Boundary conversion only. Rounds to the nearest representable tick.
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (value * self.scale as f64).round() as i64;
        Px::from_scaled(scaled)
    }

    /// Unscale for reporting; never used on the hot path
    #[must_use]
    pub fn unscale(&self, px: Px) -> f64 {
        px.as_i64() as f64 / self.scale as f64
    }

    /// Parse a decimal string without going through floats
    ///
    /// Fractional digits beyond the scale are rounded half-up on the first
    /// dropped digit.
    pub fn parse_str(&self, s: &str) -> Result<Px, CodecError> {
        let s = s.trim();
        let (neg, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if digits.is_empty() {
            return Err(CodecError::Malformed(s.to_string()));
        }

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(CodecError::Malformed(s.to_string()));
        }

        let mut value: i64 = 0;
        for b in int_part.bytes() {
            if !b.is_ascii_digit() {
                return Err(CodecError::Malformed(s.to_string()));
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i64::from(b - b'0')))
                .ok_or(CodecError::Overflow)?;
        }
        value = value.checked_mul(self.scale).ok_or(CodecError::Overflow)?;

        let mut frac_scaled: i64 = 0;
        let mut mult = self.scale;
        let mut bytes = frac_part.bytes();
        for b in bytes.by_ref() {
            if !b.is_ascii_digit() {
                return Err(CodecError::Malformed(s.to_string()));
            }
            if mult == 1 {
                // First dropped digit decides rounding
                if b >= b'5' {
                    frac_scaled += 1;
                }
                break;
            }
            mult /= 10;
            frac_scaled += i64::from(b - b'0') * mult;
        }
        // Remaining digits must still be digits even though they are dropped
        for b in bytes {
            if !b.is_ascii_digit() {
                return Err(CodecError::Malformed(s.to_string()));
            }
        }

        value = value.checked_add(frac_scaled).ok_or(CodecError::Overflow)?;
        Ok(Px::from_scaled(if neg { -value } else { value }))
    }

    /// Snap a scaled price to the nearest multiple of `tick` (scaled)
    #[must_use]
    pub fn round_to_tick(&self, px: Px, tick: i64) -> Px {
        if tick <= 0 {
            return px;
        }
        let v = px.as_i64();
        let rem = v.rem_euclid(tick);
        let down = v - rem;
        if rem * 2 >= tick {
            Px::from_scaled(down + tick)
        } else {
            Px::from_scaled(down)
        }
    }
}
