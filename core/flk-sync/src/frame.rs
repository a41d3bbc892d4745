//! Frame lockstep controller.
//!
//! The master increments the shared frame counter on every tick and
//! broadcasts it; followers adopt greater counters from the wire and nudge
//! their local frame pacing with a small, rate-limited timing adjustment.
//! Applying the adjustment (sleeping before the next render) is the render
//! driver's job; the controller only computes it.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::{Result, SyncError};

/// Largest per-tick timing adjustment, milliseconds.
const MAX_ADJUSTMENT_MS: f32 = 5.0;

/// Fraction of the observed timing error folded into the new adjustment.
const ADJUSTMENT_RATE: f32 = 0.1;

/// Blend of previous and new adjustment (90/10).
const ADJUSTMENT_KEEP: f32 = 0.9;
const ADJUSTMENT_PULL: f32 = 0.1;

/// Frame jumps larger than this are honored but reported.
const LARGE_JUMP_FRAMES: i64 = 10;

/// Inter-tick gaps above this are treated as hitches and skipped.
const MAX_TICK_GAP_US: i64 = 1_000_000;

/// Frame counter and timing adjustment state.
pub struct FrameSyncController {
    synced_frame_number: i64,
    target_fps: f32,
    adjustment_ms: f32,
    is_master: bool,
    synchronized: bool,
    last_tick_us: i64,
    large_jumps: u64,
    regressions: u64,
}

impl FrameSyncController {
    pub fn new() -> Self {
        Self {
            synced_frame_number: 0,
            target_fps: 60.0,
            adjustment_ms: 0.0,
            is_master: false,
            synchronized: false,
            last_tick_us: 0,
            large_jumps: 0,
            regressions: 0,
        }
    }

    pub fn set_master_mode(&mut self, is_master: bool) {
        if self.is_master != is_master {
            debug!(is_master, "frame sync role changed");
        }
        self.is_master = is_master;
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn set_target_fps(&mut self, fps: f32) {
        self.target_fps = fps.max(1.0);
        debug!(fps = self.target_fps, "target frame rate set");
    }

    pub fn target_fps(&self) -> f32 {
        self.target_fps
    }

    pub fn synced_frame_number(&self) -> i64 {
        self.synced_frame_number
    }

    /// Followers become synchronized on first counter receipt; the master
    /// is always synchronized.
    pub fn is_synchronized(&self) -> bool {
        self.is_master || self.synchronized
    }

    pub fn adjustment_ms(&self) -> f32 {
        self.adjustment_ms
    }

    /// Per-frame tick from the external scheduler. On the master this
    /// advances the counter and returns it for broadcast; on followers it
    /// refreshes the timing adjustment and returns `None`.
    pub fn tick(&mut self, now_us: i64) -> Option<i64> {
        if self.is_master {
            self.synced_frame_number += 1;
            trace!(frame = self.synced_frame_number, "master frame tick");
            self.last_tick_us = now_us;
            return Some(self.synced_frame_number);
        }

        self.update_timing(now_us);
        None
    }

    fn update_timing(&mut self, now_us: i64) {
        let delta_us = now_us - self.last_tick_us;
        if self.last_tick_us != 0 && delta_us > 0 && delta_us < MAX_TICK_GAP_US {
            let target_interval_ms = 1000.0 / self.target_fps;
            let actual_interval_ms = delta_us as f32 / 1000.0;
            let difference_ms = actual_interval_ms - target_interval_ms;

            let new_adjustment =
                (difference_ms * ADJUSTMENT_RATE).clamp(-MAX_ADJUSTMENT_MS, MAX_ADJUSTMENT_MS);
            self.adjustment_ms =
                self.adjustment_ms * ADJUSTMENT_KEEP + new_adjustment * ADJUSTMENT_PULL;
        }
        self.last_tick_us = now_us;
    }

    /// Adopt a frame counter received from the master. Greater counters are
    /// honored (with a warning on large jumps); regressions are dropped and
    /// counted. The master ignores these messages.
    pub fn handle_frame_sync(&mut self, received: i64) -> Result<()> {
        if self.is_master {
            return Ok(());
        }

        if received > self.synced_frame_number {
            if received > self.synced_frame_number + LARGE_JUMP_FRAMES {
                warn!(
                    local = self.synced_frame_number,
                    received, "large frame number jump"
                );
                self.large_jumps += 1;
            }
            self.synced_frame_number = received;
            self.synchronized = true;
        } else if received < self.synced_frame_number {
            self.regressions += 1;
            trace!(
                local = self.synced_frame_number,
                received, "stale frame sync dropped"
            );
            return Err(SyncError::FrameRegression {
                local: self.synced_frame_number,
                received,
            });
        }
        Ok(())
    }

    /// How long the render driver should sleep before the next frame, if at
    /// all. Negative adjustments are carried forward instead of slept.
    pub fn recommended_sleep(&self) -> Option<Duration> {
        if !self.is_master && self.adjustment_ms > 0.1 {
            let ms = self.adjustment_ms.min(MAX_ADJUSTMENT_MS);
            Some(Duration::from_micros((ms * 1000.0) as u64))
        } else {
            None
        }
    }

    /// (large jumps honored, regressions dropped)
    pub fn jump_counters(&self) -> (u64, u64) {
        (self.large_jumps, self.regressions)
    }
}

impl Default for FrameSyncController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_increments_and_reports() {
        let mut ctrl = FrameSyncController::new();
        ctrl.set_master_mode(true);
        assert_eq!(ctrl.tick(1_000), Some(1));
        assert_eq!(ctrl.tick(17_667), Some(2));
        assert_eq!(ctrl.synced_frame_number(), 2);
        assert!(ctrl.is_synchronized());
    }

    #[test]
    fn follower_jumps_forward_and_reports_large_jumps() {
        let mut ctrl = FrameSyncController::new();
        ctrl.handle_frame_sync(100).unwrap();
        assert_eq!(ctrl.synced_frame_number(), 100);
        assert!(ctrl.is_synchronized());
        assert_eq!(ctrl.jump_counters(), (1, 0)); // 0 -> 100 is a large jump

        // Spec scenario S5: 100 -> 250 is honored and reported.
        ctrl.handle_frame_sync(250).unwrap();
        assert_eq!(ctrl.synced_frame_number(), 250);
        assert_eq!(ctrl.jump_counters(), (2, 0));
    }

    #[test]
    fn follower_never_regresses() {
        let mut ctrl = FrameSyncController::new();
        ctrl.handle_frame_sync(50).unwrap();
        assert!(matches!(
            ctrl.handle_frame_sync(40),
            Err(SyncError::FrameRegression {
                local: 50,
                received: 40
            })
        ));
        assert_eq!(ctrl.synced_frame_number(), 50);
        assert_eq!(ctrl.jump_counters().1, 1);
    }

    #[test]
    fn small_step_is_not_a_large_jump() {
        let mut ctrl = FrameSyncController::new();
        ctrl.handle_frame_sync(1).unwrap();
        let jumps_before = ctrl.jump_counters().0;
        ctrl.handle_frame_sync(2).unwrap();
        assert_eq!(ctrl.jump_counters().0, jumps_before);
    }

    #[test]
    fn master_ignores_frame_sync() {
        let mut ctrl = FrameSyncController::new();
        ctrl.set_master_mode(true);
        ctrl.tick(1_000);
        ctrl.handle_frame_sync(500).unwrap();
        assert_eq!(ctrl.synced_frame_number(), 1);
    }

    #[test]
    fn slow_ticks_produce_positive_adjustment() {
        let mut ctrl = FrameSyncController::new();
        ctrl.set_target_fps(60.0); // target interval ~16.67 ms

        let mut now = 0;
        for _ in 0..200 {
            now += 20_000; // 20 ms actual
            ctrl.tick(now);
        }
        // Steady state: blend converges on 0.1 * (20 - 16.67) ≈ 0.33 ms.
        assert!(ctrl.adjustment_ms() > 0.2 && ctrl.adjustment_ms() < 0.5);
        assert!(ctrl.recommended_sleep().is_some());
    }

    #[test]
    fn fast_ticks_carry_negative_adjustment_without_sleep() {
        let mut ctrl = FrameSyncController::new();
        ctrl.set_target_fps(60.0);

        let mut now = 0;
        for _ in 0..200 {
            now += 10_000; // 10 ms actual
            ctrl.tick(now);
        }
        assert!(ctrl.adjustment_ms() < 0.0);
        assert!(ctrl.recommended_sleep().is_none());
    }

    #[test]
    fn adjustment_is_clamped_against_hitches() {
        let mut ctrl = FrameSyncController::new();
        ctrl.set_target_fps(60.0);

        ctrl.tick(1_000);
        ctrl.tick(1_000_000); // a ~1 s hitch, just below the gap cutoff
        // Per-sample contribution is clamped at ±5 ms before blending.
        let after_hitch = ctrl.adjustment_ms();
        assert!(after_hitch > 0.0);
        assert!(after_hitch <= MAX_ADJUSTMENT_MS * ADJUSTMENT_PULL + f32::EPSILON);

        ctrl.tick(5_000_000); // above the cutoff: ignored entirely
        assert_eq!(ctrl.adjustment_ms(), after_hitch);
    }
}
