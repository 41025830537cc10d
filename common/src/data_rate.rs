//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    fmt::{self, Display, Formatter},
    iter::Sum,
    ops::{Add, AddAssign, Mul},
};

use serde::Serialize;

/// A bitrate in bits per second.
///
/// Subtraction is deliberately not implemented; use [`DataRate::saturating_sub`]
/// so that budget arithmetic can never underflow.
#[derive(Copy, Clone, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct DataRate {
    bps: u64,
}

impl DataRate {
    pub const ZERO: Self = Self::from_bps(0);
    const BPS_PER_KBPS: u64 = 1_000;
    const BPS_PER_MBPS: u64 = 1_000_000;

    pub const fn from_bps(bps: u64) -> Self {
        Self { bps }
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Self::from_bps(kbps * Self::BPS_PER_KBPS)
    }

    pub const fn as_bps(&self) -> u64 {
        self.bps
    }

    pub const fn as_kbps(&self) -> u64 {
        self.bps / Self::BPS_PER_KBPS
    }

    pub const fn saturating_sub(self, other: Self) -> Self {
        Self::from_bps(self.bps.saturating_sub(other.bps))
    }

    pub const fn abs_diff(self, other: Self) -> Self {
        Self::from_bps(self.bps.abs_diff(other.bps))
    }
}

impl Add for DataRate {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::from_bps(self.bps + other.bps)
    }
}

impl AddAssign for DataRate {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for DataRate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self::from_bps(iter.map(|rate| rate.bps).sum())
    }
}

impl Mul<f64> for DataRate {
    type Output = Self;

    fn mul(self, x: f64) -> Self {
        Self::from_bps((self.bps as f64 * x) as u64)
    }
}

impl fmt::Debug for DataRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for DataRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.bps < Self::BPS_PER_KBPS {
            write!(f, "{} bps", self.bps)
        } else if self.bps < Self::BPS_PER_MBPS {
            write!(
                f,
                "{:.1} Kbps",
                (self.bps * 10 / Self::BPS_PER_KBPS) as f64 / 10f64
            )
        } else {
            write!(
                f,
                "{:.1} Mbps",
                (self.bps * 10 / Self::BPS_PER_MBPS) as f64 / 10f64
            )
        }
    }
}
