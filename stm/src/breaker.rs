// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

const MAX_WAIT_UNITS: usize = 7;

/// # BusyBreaker
/// [`BusyBreaker`] is a busy keeper for short delays on spin loops. Each call to
/// [`BusyBreaker::spin`] doubles the number of spin hints issued to the CPU. Once
/// the maximum number of units has been reached, the breaker trips and the
/// calling OS thread yields its time slice instead.
///
/// # Example
/// ```
/// use runtime_stm::BusyBreaker;
///
/// let mut breaker = BusyBreaker::default();
/// for _ in 0..10 {
///     breaker.spin();
/// }
/// assert!(breaker.is_tripped());
/// ```
#[derive(Default, Debug)]
pub struct BusyBreaker {
    unit: usize,
}

impl BusyBreaker {
    /// Waits a little longer than the previous call
    pub fn spin(&mut self) {
        if self.unit <= MAX_WAIT_UNITS {
            for _ in 0..(1 << self.unit) {
                core::hint::spin_loop();
            }
            self.unit += 1;
        } else {
            std::thread::yield_now();
        }
    }

    /// Returns `true`, if the breaker has exhausted its spin budget
    pub fn is_tripped(&self) -> bool {
        self.unit > MAX_WAIT_UNITS
    }

    /// Resets the breaker to zero
    pub fn reset(&mut self) {
        self.unit = 0;
    }
}
