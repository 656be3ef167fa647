//! Fixed-point money and chip quantities.
//!
//! Currency is always carried as integer minor units (cents) and chips as
//! integer points. Conversions between the two go through [`ConversionRate`],
//! which uses integer arithmetic with round-half-away-from-zero so that the
//! same inputs always produce the same minor-unit amount on every device.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// An amount of currency in minor units (e.g. cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinorUnits(i64);

impl MinorUnits {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw minor-unit amount.
    #[must_use]
    pub const fn new(amount: i64) -> Self {
        Self(amount)
    }

    /// Returns the raw minor-unit amount.
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// Absolute value, saturating at `i64::MAX`.
    #[must_use]
    pub const fn abs(&self) -> Self {
        Self(self.0.saturating_abs())
    }

    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Clamps negative amounts to zero.
    #[must_use]
    pub const fn clamp_non_negative(&self) -> Self {
        if self.0 < 0 { Self(0) } else { *self }
    }
}

impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Add for MinorUnits {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for MinorUnits {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for MinorUnits {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for MinorUnits {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for MinorUnits {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl Sum for MinorUnits {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a MinorUnits> for MinorUnits {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// A quantity of chips (points) on the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Points(i64);

impl Points {
    /// Zero.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(points: i64) -> Self {
        Self(points)
    }

    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Clamps negative point counts to zero.
    #[must_use]
    pub const fn clamp_non_negative(&self) -> Self {
        if self.0 < 0 { Self(0) } else { *self }
    }

    /// Subtracts, stopping at zero.
    #[must_use]
    pub fn saturating_sub_to_zero(&self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0).max(0))
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pts", self.0)
    }
}

impl Add for Points {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Points {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Points {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Points {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

/// Point-to-currency conversion: `per_points` points are worth `minor_units`.
///
/// Expressed as a ratio so that rates like "5 cents per 100 points" stay
/// exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversionRate {
    /// Minor units paid for `per_points` points.
    pub minor_units: i64,
    /// Number of points the `minor_units` buy. Always positive.
    pub per_points: i64,
}

impl ConversionRate {
    /// Creates a rate, rejecting non-positive denominators and negative prices.
    pub fn new(minor_units: i64, per_points: i64) -> Result<Self> {
        if per_points <= 0 {
            return Err(Error::InvalidRate(format!(
                "per_points must be positive, got {per_points}"
            )));
        }
        if minor_units < 0 {
            return Err(Error::InvalidRate(format!(
                "minor_units must not be negative, got {minor_units}"
            )));
        }
        Ok(Self {
            minor_units,
            per_points,
        })
    }

    /// One minor unit per point.
    #[must_use]
    pub const fn one_to_one() -> Self {
        Self {
            minor_units: 1,
            per_points: 1,
        }
    }

    /// Returns true if the rate can be used for conversion.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.per_points > 0 && self.minor_units >= 0
    }

    /// Converts points to minor units, rounding half away from zero.
    #[must_use]
    pub fn to_minor_units(&self, points: Points) -> MinorUnits {
        let numerator = i128::from(points.get()) * i128::from(self.minor_units);
        MinorUnits::new(div_round_half_away(numerator, i128::from(self.per_points)))
    }

    /// Converts minor units to points, rounding half away from zero.
    ///
    /// A zero-priced rate maps every amount to zero points.
    #[must_use]
    pub fn to_points(&self, amount: MinorUnits) -> Points {
        if self.minor_units == 0 {
            return Points::ZERO;
        }
        let numerator = i128::from(amount.get()) * i128::from(self.per_points);
        Points::new(div_round_half_away(numerator, i128::from(self.minor_units)))
    }
}

impl Default for ConversionRate {
    fn default() -> Self {
        Self::one_to_one()
    }
}

fn div_round_half_away(numerator: i128, denominator: i128) -> i64 {
    if denominator == 0 {
        return 0;
    }
    let sign = if (numerator < 0) != (denominator < 0) { -1 } else { 1 };
    let n = numerator.abs();
    let d = denominator.abs();
    let rounded = (2 * n + d) / (2 * d);
    let value = sign * rounded;
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}
