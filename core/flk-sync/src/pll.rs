//! Software phase-locked loop.
//!
//! Converts the PTP engine's noisy offset samples into a smoothly adjusted
//! logical clock: an EWMA filter over the offset, a PI controller producing a
//! bounded frequency adjustment, and a slewed phase adjustment applied to
//! clock reads. The frequency adjustment is informational; reads only ever
//! apply the phase term.

use tracing::{debug, trace};

use crate::{Result, SyncError};

/// PI output scaling: offsets are microseconds, the controller works in
/// dimensionless frequency space.
const PI_SCALE: f64 = 1e-7;

/// Anti-windup clamp on the integrated error.
const INTEGRAL_LIMIT: f64 = 0.1;

/// Hard bounds on the frequency adjustment.
const FREQ_MIN: f64 = 0.9;
const FREQ_MAX: f64 = 1.1;

/// Phase slew: keep 90% of the current adjustment, move 10% toward target.
const PHASE_KEEP: f64 = 0.9;
const PHASE_PULL: f64 = 0.1;

/// Samples below the lock threshold required before `locked` asserts.
const LOCK_SAMPLES: u32 = 10;

/// Default lock threshold: 1 ms.
const DEFAULT_LOCK_THRESHOLD_US: i64 = 1_000;

/// Measurement interval sanity window.
const MIN_DELTA_SECS: f64 = 0.001;
const MAX_DELTA_SECS: f64 = 5.0;

// Gain clamp ranges.
const P_GAIN_RANGE: (f64, f64) = (0.001, 5.0);
const I_GAIN_RANGE: (f64, f64) = (0.0001, 1.0);
const FILTER_RANGE: (f64, f64) = (0.001, 0.999);

/// Software PLL state.
pub struct SoftwarePll {
    p_gain: f64,
    i_gain: f64,
    filter_weight: f64,

    frequency_adjustment: f64,
    phase_adjustment_us: i64,
    integrated_error: f64,
    filtered_offset: f64,

    last_offset_us: i64,
    last_update_us: i64,

    locked: bool,
    stability_counter: u32,
    lock_threshold_us: i64,

    rejected_intervals: u64,
}

impl SoftwarePll {
    pub fn new() -> Self {
        Self {
            p_gain: 0.5,
            i_gain: 0.01,
            filter_weight: 0.5,
            frequency_adjustment: 1.0,
            phase_adjustment_us: 0,
            integrated_error: 0.0,
            filtered_offset: 0.0,
            last_offset_us: 0,
            last_update_us: 0,
            locked: false,
            stability_counter: 0,
            lock_threshold_us: DEFAULT_LOCK_THRESHOLD_US,
            rejected_intervals: 0,
        }
    }

    /// Set the controller gains, clamped to safe ranges.
    pub fn configure(&mut self, p_gain: f64, i_gain: f64, filter_weight: f64) {
        self.p_gain = p_gain.clamp(P_GAIN_RANGE.0, P_GAIN_RANGE.1);
        self.i_gain = i_gain.clamp(I_GAIN_RANGE.0, I_GAIN_RANGE.1);
        self.filter_weight = filter_weight.clamp(FILTER_RANGE.0, FILTER_RANGE.1);
        debug!(
            p = self.p_gain,
            i = self.i_gain,
            filter = self.filter_weight,
            "pll configured"
        );
    }

    /// Feed one offset measurement. Samples spaced outside the sanity
    /// window are rejected and counted.
    pub fn update(&mut self, offset_us: i64, timestamp_us: i64) -> Result<()> {
        // First sample: seed the filter and counter the full offset at once.
        if self.last_update_us == 0 {
            self.last_update_us = timestamp_us;
            self.last_offset_us = offset_us;
            self.filtered_offset = offset_us as f64;
            self.phase_adjustment_us = -offset_us;
            debug!(phase = self.phase_adjustment_us, "pll initial phase adjustment");
            return Ok(());
        }

        let delta_us = timestamp_us - self.last_update_us;
        let delta_secs = delta_us as f64 / 1_000_000.0;
        if delta_secs <= MIN_DELTA_SECS || delta_secs > MAX_DELTA_SECS {
            self.rejected_intervals += 1;
            self.last_update_us = timestamp_us;
            return Err(SyncError::IntervalOutOfRange { delta_us });
        }

        self.filtered_offset = self.filter(offset_us as f64, self.filtered_offset);

        self.update_frequency(offset_us);
        self.update_phase(offset_us);
        self.update_lock(offset_us);

        self.last_offset_us = offset_us;
        self.last_update_us = timestamp_us;

        trace!(
            freq = self.frequency_adjustment,
            phase = self.phase_adjustment_us,
            locked = self.locked,
            "pll updated"
        );
        Ok(())
    }

    fn filter(&self, new: f64, old: f64) -> f64 {
        self.filter_weight * new + (1.0 - self.filter_weight) * old
    }

    fn update_frequency(&mut self, offset_us: i64) {
        let p_term = offset_us as f64 * self.p_gain * PI_SCALE;

        self.integrated_error += offset_us as f64 * self.i_gain * PI_SCALE;
        self.integrated_error = self.integrated_error.clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);

        let raw = (1.0 - (p_term + self.integrated_error)).clamp(FREQ_MIN, FREQ_MAX);
        self.frequency_adjustment = self.filter(raw, self.frequency_adjustment);
    }

    fn update_phase(&mut self, offset_us: i64) {
        let target = -offset_us;
        let blended = self.phase_adjustment_us as f64 * PHASE_KEEP + target as f64 * PHASE_PULL;
        self.phase_adjustment_us = blended as i64;
    }

    fn update_lock(&mut self, offset_us: i64) {
        if offset_us.abs() < self.lock_threshold_us {
            self.stability_counter += 1;
            if self.stability_counter >= LOCK_SAMPLES && !self.locked {
                self.locked = true;
                debug!(offset_us, "pll lock achieved");
            }
        } else {
            self.stability_counter = 0;
            if self.locked {
                self.locked = false;
                debug!(offset_us, "pll lock lost");
            }
        }
    }

    /// Local clock read with the phase correction applied.
    pub fn adjusted_time_us(&self, now_us: i64) -> i64 {
        now_us + self.phase_adjustment_us
    }

    /// Informational frequency correction; never applied to reads here.
    pub fn frequency_adjustment(&self) -> f64 {
        self.frequency_adjustment
    }

    pub fn phase_adjustment_us(&self) -> i64 {
        self.phase_adjustment_us
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn last_offset_us(&self) -> i64 {
        self.last_offset_us
    }

    pub fn integrated_error(&self) -> f64 {
        self.integrated_error
    }

    pub fn rejected_intervals(&self) -> u64 {
        self.rejected_intervals
    }
}

impl Default for SoftwarePll {
    fn default() -> Self {
        Self::new()
    }
}
