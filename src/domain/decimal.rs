//! Lossless decimal numeric type backed by rust_decimal.
//!
//! Provides canonical parsing from strings, formatting without exponent notation,
//! and conversion to and from the ledger's fixed-point integer representation.

use alloy_primitives::{I256, U256};
use rust_decimal::{Decimal as RustDecimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest scale rust_decimal can represent.
const MAX_SCALE: u32 = 28;

/// Errors converting between ledger fixed-point integers and decimals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount {0} does not fit the decimal range")]
    OutOfRange(String),
    #[error("unsupported ledger decimals: {0}")]
    UnsupportedScale(u32),
    #[error("negative amount {0} cannot be encoded as unsigned")]
    Negative(String),
    #[error("arithmetic overflow")]
    Overflow,
}

/// Lossless decimal numeric type for financial calculations.
///
/// Backed by rust_decimal to avoid floating-point drift.
/// Serializes to a JSON string so 18-decimal amounts survive unchanged.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::str")] RustDecimal);

impl Decimal {
    /// Create a Decimal from a RustDecimal.
    pub fn new(value: RustDecimal) -> Self {
        Decimal(value)
    }

    /// Parse a Decimal from a string losslessly.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s).map(Decimal)
    }

    /// Format the Decimal as a canonical string (no exponent notation).
    pub fn to_canonical_string(&self) -> String {
        let normalized = self.0.normalize();
        format!("{}", normalized)
    }

    /// The additive identity (0).
    pub fn zero() -> Self {
        Decimal(RustDecimal::ZERO)
    }

    /// Returns true if the value is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns true if the value is > 0.
    pub fn is_positive(&self) -> bool {
        !self.is_zero() && self.0.is_sign_positive()
    }

    /// Returns true if the value is < 0.
    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.0.is_sign_negative()
    }

    pub fn checked_mul(&self, rhs: Decimal) -> Result<Decimal, AmountError> {
        self.0
            .checked_mul(rhs.0)
            .map(Decimal)
            .ok_or(AmountError::Overflow)
    }

    pub fn checked_div(&self, rhs: Decimal) -> Result<Decimal, AmountError> {
        self.0
            .checked_div(rhs.0)
            .map(Decimal)
            .ok_or(AmountError::Overflow)
    }

    /// Interpret an unsigned ledger integer scaled by `10^decimals`.
    pub fn from_fixed_point(raw: U256, decimals: u32) -> Result<Self, AmountError> {
        Self::from_fixed_digits(&raw.to_string(), decimals)
    }

    /// Interpret a signed ledger integer scaled by `10^decimals`.
    pub fn from_fixed_point_signed(raw: I256, decimals: u32) -> Result<Self, AmountError> {
        Self::from_fixed_digits(&raw.to_string(), decimals)
    }

    fn from_fixed_digits(digits: &str, decimals: u32) -> Result<Self, AmountError> {
        if decimals > MAX_SCALE {
            return Err(AmountError::UnsupportedScale(decimals));
        }
        let mantissa =
            i128::from_str(digits).map_err(|_| AmountError::OutOfRange(digits.to_string()))?;
        RustDecimal::try_from_i128_with_scale(mantissa, decimals)
            .map(|d| Decimal(d.normalize()))
            .map_err(|_| AmountError::OutOfRange(digits.to_string()))
    }

    /// Scale to the ledger's integer representation, flooring any excess precision.
    pub fn to_fixed_point_floor(&self, decimals: u32) -> Result<I256, AmountError> {
        let fixed = self.fixed_mantissa(decimals)?;
        I256::from_dec_str(&fixed.to_string()).map_err(|_| AmountError::Overflow)
    }

    /// Unsigned variant of [`Decimal::to_fixed_point_floor`].
    pub fn to_fixed_point_unsigned(&self, decimals: u32) -> Result<U256, AmountError> {
        let fixed = self.fixed_mantissa(decimals)?;
        let fixed = u128::try_from(fixed)
            .map_err(|_| AmountError::Negative(self.to_canonical_string()))?;
        Ok(U256::from(fixed))
    }

    fn fixed_mantissa(&self, decimals: u32) -> Result<i128, AmountError> {
        if decimals > MAX_SCALE {
            return Err(AmountError::UnsupportedScale(decimals));
        }
        let floored = self
            .0
            .round_dp_with_strategy(decimals, RoundingStrategy::ToNegativeInfinity);
        let factor = 10i128
            .checked_pow(decimals - floored.scale())
            .ok_or(AmountError::Overflow)?;
        floored
            .mantissa()
            .checked_mul(factor)
            .ok_or(AmountError::Overflow)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl From<RustDecimal> for Decimal {
    fn from(value: RustDecimal) -> Self {
        Decimal(value)
    }
}

impl From<Decimal> for RustDecimal {
    fn from(value: Decimal) -> Self {
        value.0
    }
}

impl std::ops::Add for Decimal {
    type Output = Decimal;

    fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Decimal {
    type Output = Decimal;

    fn sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Decimal(-self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_serde_keeps_full_precision() {
        let value = d("1234567890.123456789012345678");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, "\"1234567890.123456789012345678\"");
        let back: Decimal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_decimal_canonical_no_exponent() {
        let decimal = d("123.4500");
        assert_eq!(decimal.to_canonical_string(), "123.45");
        assert!(!decimal.to_canonical_string().contains('e'));
    }

    #[test]
    fn test_fixed_point_eighteen_decimals() {
        let raw = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(Decimal::from_fixed_point(raw, 18).unwrap(), d("1.5"));
    }

    #[test]
    fn test_fixed_point_large_balance_keeps_precision() {
        // 12,345,678,901.000000000000000001 with 18 decimals
        let raw = U256::from_str("12345678901000000000000000001").unwrap();
        let value = Decimal::from_fixed_point(raw, 18).unwrap();
        assert_eq!(value.to_canonical_string(), "12345678901.000000000000000001");
    }

    #[test]
    fn test_fixed_point_signed_negative() {
        let raw = I256::from_dec_str("-100000000000000000000").unwrap();
        assert_eq!(Decimal::from_fixed_point_signed(raw, 18).unwrap(), d("-100"));
    }

    #[test]
    fn test_to_fixed_point_floors() {
        let value = d("0.0000000000000000019");
        assert_eq!(
            value.to_fixed_point_floor(18).unwrap(),
            I256::from_dec_str("1").unwrap()
        );
        let negative = d("-0.0000000000000000011");
        assert_eq!(
            negative.to_fixed_point_floor(18).unwrap(),
            I256::from_dec_str("-2").unwrap()
        );
    }

    #[test]
    fn test_to_fixed_point_whole_number() {
        assert_eq!(
            d("100").to_fixed_point_floor(18).unwrap(),
            I256::from_dec_str("100000000000000000000").unwrap()
        );
        assert_eq!(
            d("300").to_fixed_point_unsigned(6).unwrap(),
            U256::from(300_000_000u64)
        );
    }

    #[test]
    fn test_unsigned_rejects_negative() {
        assert!(matches!(
            d("-1").to_fixed_point_unsigned(18),
            Err(AmountError::Negative(_))
        ));
    }

    #[test]
    fn test_unsupported_scale() {
        assert_eq!(
            Decimal::from_fixed_point(U256::from(1u8), 40),
            Err(AmountError::UnsupportedScale(40))
        );
    }

    #[test]
    fn test_checked_div_by_zero() {
        assert_eq!(d("1").checked_div(Decimal::zero()), Err(AmountError::Overflow));
    }
}
