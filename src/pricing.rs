//! Usage to atoms conversion.
//!
//! All arithmetic is `u128` fixed point. Each component is rounded on its
//! own and results past `u64::MAX` saturate.

use crate::config::{PricingConfig, Rounding};
use crate::voucher::Atoms;
use std::time::Duration;

const MILLIS_PER_HOUR: u128 = 3_600_000;
const BYTES_PER_GIGABYTE: u128 = 1_000_000_000;

/// Work reported for a finished query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Wall time spent on the query.
    pub elapsed: Duration,
    /// Bytes returned to the client.
    pub bytes: u64,
}

impl Usage {
    /// Usage from elapsed time and bytes.
    #[must_use]
    pub const fn new(elapsed: Duration, bytes: u64) -> Self {
        Self { elapsed, bytes }
    }

    /// Usage from thousandths of an hour and megabytes (10^6 bytes).
    #[must_use]
    pub const fn from_millihours_and_megabytes(millihours: u64, megabytes: u64) -> Self {
        Self {
            elapsed: Duration::from_millis(millihours.saturating_mul(3_600)),
            bytes: megabytes.saturating_mul(1_000_000),
        }
    }
}

/// Prices applied by the engine at settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriceSchedule {
    hour_price: Atoms,
    gigabyte_price: Atoms,
    rounding: Rounding,
}

impl PriceSchedule {
    /// Create a schedule.
    #[must_use]
    pub const fn new(hour_price: Atoms, gigabyte_price: Atoms, rounding: Rounding) -> Self {
        Self {
            hour_price,
            gigabyte_price,
            rounding,
        }
    }

    /// Schedule from configuration.
    #[must_use]
    pub const fn from_config(config: &PricingConfig) -> Self {
        Self::new(config.hour_price, config.gigabyte_price, config.rounding)
    }

    /// Atoms owed for `usage`.
    #[must_use]
    pub fn cost(&self, usage: &Usage) -> Atoms {
        let hours = self.scale(
            usage.elapsed.as_millis(),
            u128::from(self.hour_price),
            MILLIS_PER_HOUR,
        );
        let gigabytes = self.scale(
            u128::from(usage.bytes),
            u128::from(self.gigabyte_price),
            BYTES_PER_GIGABYTE,
        );
        Atoms::try_from(hours.saturating_add(gigabytes)).unwrap_or(Atoms::MAX)
    }

    fn scale(&self, amount: u128, price: u128, unit: u128) -> u128 {
        let product = amount.saturating_mul(price);
        match self.rounding {
            Rounding::Down => product / unit,
            Rounding::Up => product.div_ceil(unit),
        }
    }
}
