use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Errors that can occur when building or combining token amounts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Amount overflow")]
    Overflow,
}

/// An unsigned token quantity in the smallest unit
///
/// Supplies such as 10^21 do not fit into 64 bits, so amounts are held as
/// `u128` and every arithmetic operation is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(u128);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn new(units: u128) -> Self {
        TokenAmount(units)
    }

    /// Builds `whole * 10^decimals`, e.g. `from_whole(1000, 18)` for 1000 tokens
    pub fn from_whole(whole: u128, decimals: u8) -> Result<Self, AmountError> {
        10u128
            .checked_pow(u32::from(decimals))
            .and_then(|scale| whole.checked_mul(scale))
            .map(TokenAmount)
            .ok_or(AmountError::Overflow)
    }

    pub const fn units(&self) -> u128 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(other.0).map(TokenAmount)
    }

    pub fn checked_sub(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_sub(other.0).map(TokenAmount)
    }
}

impl From<u128> for TokenAmount {
    fn from(units: u128) -> Self {
        TokenAmount(units)
    }
}

impl From<u64> for TokenAmount {
    fn from(units: u64) -> Self {
        TokenAmount(u128::from(units))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::InvalidAmount(format!(
                "expected an unsigned decimal integer, got {:?}",
                s
            )));
        }

        trimmed
            .parse::<u128>()
            .map(TokenAmount)
            .map_err(|_| AmountError::Overflow)
    }
}

/// Overflowing sums saturate; callers that care use `checked_add`
impl Sum for TokenAmount {
    fn sum<I: Iterator<Item = TokenAmount>>(iter: I) -> Self {
        TokenAmount(iter.fold(0u128, |acc, amount| acc.saturating_add(amount.0)))
    }
}

// JSON numbers lose precision past 2^53 in most clients, so amounts travel
// as decimal strings.
impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct TokenAmountVisitor;

impl<'de> Visitor<'de> for TokenAmountVisitor {
    type Value = TokenAmount;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unsigned integer or a decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(TokenAmount::from(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Self::Value, E> {
        Ok(TokenAmount(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(TokenAmount::from)
            .map_err(|_| E::custom("amount must be non-negative"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(E::custom)
    }

    // With `arbitrary_precision`, serde_json hands every number over as a
    // single-entry map whose value is the literal digits.
    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        if map.next_key::<String>()?.is_none() {
            return Err(de::Error::invalid_length(0, &self));
        }
        let digits: String = map.next_value()?;
        digits.parse().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TokenAmountVisitor)
    }
}
