// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, TxError};
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_WAIT_UNITS: usize = 7;

// a single spin never exceeds 2^31 iterations
const UNIT_LIMIT: usize = 31;

/// # BusyBreaker
/// [`BusyBreaker`] is kind of a circuit-breaker and busy keeper for short delays on spin loops on the CPU.
/// Every call to [`BusyBreaker::spin`] doubles the busy wait, until the configured number of units
/// has been used up and the breaker trips.
///
/// # Example
/// ```
/// use ofree_stm::BusyBreaker;
///
/// let breaker = BusyBreaker::default();
/// while breaker.spin().is_ok() {}
/// breaker.reset();
/// assert!(breaker.spin().is_ok());
/// ```
pub struct BusyBreaker {
    unit: AtomicUsize,
    max_units: usize,
}

impl Default for BusyBreaker {
    fn default() -> Self {
        Self::with_max_units(MAX_WAIT_UNITS)
    }
}

impl BusyBreaker {
    /// Creates a breaker that trips after `max_units` spins, at most 31.
    pub fn with_max_units(max_units: usize) -> Self {
        Self {
            unit: AtomicUsize::new(0),
            max_units: max_units.min(UNIT_LIMIT),
        }
    }

    pub fn max_units(&self) -> usize {
        self.max_units
    }

    /// Keeps the CPU busy but hints to the CPU reschedule the CPU time
    ///
    /// [`core::hint::spin_loop()`] may be available on the integrating system,
    /// otherwise this function call is just a busy loop, that wastes some CPU cycles
    pub fn spin(&self) -> Result<()> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= self.max_units => {
                for _ in 0..(1u64 << unit) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);

                Ok(())
            }
            _ => Err(TxError::Exhausted(format!("breaker tripped after {} units", self.max_units))),
        }
    }

    /// Spins, and hands the CPU over to the scheduler once the breaker trips. Never fails.
    pub fn pause(&self) {
        if self.spin().is_err() {
            std::thread::yield_now();
            self.reset();
        }
    }

    /// Resets the breaker to zero
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for BusyBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyBreaker")
            .field("unit", &self.unit.load(Ordering::Acquire))
            .field("max_units", &self.max_units)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_trips() {
        let breaker = BusyBreaker::with_max_units(3);
        for _ in 0..=3 {
            assert!(breaker.spin().is_ok());
        }
        assert!(matches!(breaker.spin(), Err(TxError::Exhausted(_))));

        breaker.reset();
        assert!(breaker.spin().is_ok());
    }

    #[test]
    fn test_max_units_are_clamped() {
        let breaker = BusyBreaker::with_max_units(usize::MAX);
        assert_eq!(breaker.max_units(), 31);
        assert!(breaker.spin().is_ok());
    }

    #[test]
    fn test_pause_never_trips() {
        let breaker = BusyBreaker::with_max_units(1);
        for _ in 0..10 {
            breaker.pause();
        }
        assert!(breaker.spin().is_ok());
    }
}
