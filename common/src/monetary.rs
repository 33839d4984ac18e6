//! Monetary amount type.
//!
//! Amounts are stored as a signed count of minor units (cents). Floating
//! point never appears anywhere in the ledger; decimal strings are parsed
//! through `rust_decimal` and rejected when they carry more precision than
//! the minor unit can hold.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LedgerError, Result};

/// Number of fractional digits carried by the minor unit.
pub const MINOR_UNIT_SCALE: u32 = 2;

const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// A fixed-point amount in minor units.
///
/// Entry amounts are always positive; derived balances use the same type
/// and may be computed as negative intermediates (for example a projected
/// balance during an overdraft check).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// The zero amount.
    pub const ZERO: Amount = Amount(0);

    /// Create from a count of minor units.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Create from a whole number of major units.
    pub fn from_major(major: i64) -> Result<Self> {
        major
            .checked_mul(MINOR_UNITS_PER_MAJOR)
            .map(Self)
            .ok_or(LedgerError::AmountOverflow)
    }

    /// Create from a decimal value, rejecting sub-minor-unit precision.
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        let normalized = value.normalize();
        if normalized.scale() > MINOR_UNIT_SCALE {
            return Err(LedgerError::InvalidAmount(format!(
                "{} has more than {} decimal places",
                value, MINOR_UNIT_SCALE
            )));
        }

        let minor = normalized
            .checked_mul(Decimal::from(MINOR_UNITS_PER_MAJOR))
            .and_then(|v| v.to_i64())
            .ok_or(LedgerError::AmountOverflow)?;

        Ok(Self(minor))
    }

    /// Parse a decimal string such as `"12.34"`.
    pub fn parse(s: &str) -> Result<Self> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| LedgerError::InvalidAmount(format!("{s:?}: {e}")))?;
        Self::from_decimal(value)
    }

    /// Get the amount as minor units.
    pub const fn minor_units(&self) -> i64 {
        self.0
    }

    /// Get the amount as a decimal in major units.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, MINOR_UNIT_SCALE)
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Check if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Check if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Add, failing on overflow.
    pub fn try_add(self, other: Amount) -> Result<Amount> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(LedgerError::AmountOverflow)
    }

    /// Subtract, failing on overflow.
    pub fn try_sub(self, other: Amount) -> Result<Amount> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(LedgerError::AmountOverflow)
    }

    /// Negate, failing on overflow.
    pub fn try_neg(self) -> Result<Amount> {
        self.0
            .checked_neg()
            .map(Self)
            .ok_or(LedgerError::AmountOverflow)
    }

    /// Sum a sequence of amounts, failing on overflow.
    pub fn try_sum<I>(amounts: I) -> Result<Amount>
    where
        I: IntoIterator<Item = Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, amount| acc.try_add(amount))
    }
}

/// A sum of many amounts, in minor units.
///
/// Credit and debit totals keep growing over an account's life even when
/// its balance stays small, so they are carried in a wider integer than
/// [`Amount`]. Only the net of a total is narrowed back to an `Amount`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Total(i128);

impl Total {
    /// The zero total.
    pub const ZERO: Total = Total(0);

    /// Create from a count of minor units.
    pub const fn from_minor(minor: i128) -> Self {
        Self(minor)
    }

    /// Get the total as minor units.
    pub const fn minor_units(&self) -> i128 {
        self.0
    }

    /// Add one amount. Saturates rather than wrapping.
    pub fn plus(self, amount: Amount) -> Total {
        Self(self.0.saturating_add(i128::from(amount.0)))
    }

    /// Subtract another total. Saturates rather than wrapping.
    pub fn minus(self, other: Total) -> Total {
        Self(self.0.saturating_sub(other.0))
    }

    /// Check if the total is negative.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Narrow to an [`Amount`], failing when it does not fit.
    pub fn to_amount(self) -> Result<Amount> {
        i64::try_from(self.0)
            .map(Amount)
            .map_err(|_| LedgerError::AmountOverflow)
    }
}

impl From<Amount> for Total {
    fn from(amount: Amount) -> Self {
        Self(i128::from(amount.0))
    }
}

impl fmt::Display for Total {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let per_major = MINOR_UNITS_PER_MAJOR.unsigned_abs() as u128;
        let magnitude = self.0.unsigned_abs();
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(
            f,
            "{sign}{}.{:0width$}",
            magnitude / per_major,
            magnitude % per_major,
            width = MINOR_UNIT_SCALE as usize
        )
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_display() {
        assert_eq!(Amount::from_minor(12345).to_string(), "123.45");
        assert_eq!(Amount::from_minor(-50).to_string(), "-0.50");
        assert_eq!(Amount::from_major(7).unwrap().to_string(), "7.00");
    }

    #[test]
    fn test_amount_parse() {
        assert_eq!(Amount::parse("100").unwrap(), Amount::from_minor(10_000));
        assert_eq!(Amount::parse("0.05").unwrap(), Amount::from_minor(5));
        assert_eq!(Amount::parse("12.30").unwrap(), Amount::from_minor(1230));
        assert_eq!("1.5".parse::<Amount>().unwrap(), Amount::from_minor(150));
    }

    #[test]
    fn test_amount_rejects_sub_cent_precision() {
        assert!(matches!(
            Amount::parse("0.001"),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::parse("ten dollars"),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_amount_checked_arithmetic() {
        let a = Amount::from_minor(100);
        let b = Amount::from_minor(40);
        assert_eq!(a.try_sub(b).unwrap(), Amount::from_minor(60));
        assert_eq!(b.try_sub(a).unwrap(), Amount::from_minor(-60));
        assert!(Amount::from_minor(i64::MAX).try_add(b).is_err());
        assert!(Amount::from_major(i64::MAX).is_err());
    }

    #[test]
    fn test_amount_negation_is_checked() {
        assert_eq!(
            Amount::from_minor(250).try_neg().unwrap(),
            Amount::from_minor(-250)
        );
        assert_eq!(
            Amount::from_minor(i64::MAX).try_neg().unwrap(),
            Amount::from_minor(-i64::MAX)
        );
        assert_eq!(
            Amount::from_minor(i64::MIN).try_neg(),
            Err(LedgerError::AmountOverflow)
        );
    }

    #[test]
    fn test_total_outgrows_amount() {
        let max = Amount::from_minor(i64::MAX);
        let credits = Total::ZERO.plus(max).plus(max);
        assert_eq!(credits.minor_units(), 2 * i128::from(i64::MAX));
        assert_eq!(credits.to_amount(), Err(LedgerError::AmountOverflow));

        let net = credits.minus(Total::from(max));
        assert_eq!(net.to_amount().unwrap(), max);
    }

    #[test]
    fn test_total_display() {
        assert_eq!(Total::from_minor(12345).to_string(), "123.45");
        assert_eq!(Total::from_minor(-5).to_string(), "-0.05");
        assert_eq!(
            Total::from_minor(i128::from(i64::MAX) + 1).to_string(),
            "92233720368547758.08"
        );
    }

    #[test]
    fn test_amount_sum() {
        let total = Amount::try_sum([100, 200, 300].map(Amount::from_minor)).unwrap();
        assert_eq!(total, Amount::from_minor(600));
        assert_eq!(Amount::try_sum(Vec::new()).unwrap(), Amount::ZERO);
    }
}
