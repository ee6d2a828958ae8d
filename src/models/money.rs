//! Fixed-point currency amounts.
//!
//! Budgets, prices, spend and revenue are kept as whole micro-units
//! (1 unit = 1_000_000 micros) so that summing many small charges lands
//! exactly on the budget they were sized against. Floats only appear at the
//! edges: JSON payloads and report output.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

const MICROS_PER_UNIT: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_micros(micros: i64) -> Self {
        Money(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Round a decimal amount to the nearest micro. NaN becomes zero.
    pub fn from_units(units: f64) -> Self {
        Money((units * MICROS_PER_UNIT as f64).round() as i64)
    }

    pub fn units(self) -> f64 {
        self.0 as f64 / MICROS_PER_UNIT as f64
    }

    /// One thousandth, rounded half up. Turns a CPM price into the charge for
    /// a single impression.
    pub fn per_mille(self) -> Self {
        Money((self.0 + 500).div_euclid(1000))
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// `self / whole * 100`, or 0 when `whole` is not positive.
    pub fn percent_of(self, whole: Money) -> f64 {
        if whole.0 <= 0 {
            return 0.0;
        }
        self.0 as f64 / whole.0 as f64 * 100.0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.units())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Money::from_units)
    }
}
