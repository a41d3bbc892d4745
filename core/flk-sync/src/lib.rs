//! # FrameLock Sync
//!
//! The synchronization math of FrameLock, free of any I/O:
//! - PTP-style two-step clock offset and path delay estimation
//! - a software phase-locked loop turning noisy offsets into a smooth
//!   adjusted clock
//! - the frame lockstep controller
//! - RTT / jitter / loss statistics with trend analysis and quality scoring
//!
//! Everything here is driven by explicit microsecond timestamps passed in by
//! the caller, so the whole crate is testable with virtual clocks.
//!
//! ## Sync Model
//!
//! The master timestamps a `Sync` broadcast (T1), the follower stamps its
//! receipt (T2), occasionally answers with `DelayReq` (T3) which the master
//! stamps on arrival (T4):
//!
//! ```text
//! offset     = (T2 − T1) − path_delay / 2
//! path_delay = (T4 − T3) + (T2 − T1)        // smoothed 70/30
//! ```
//!
//! Offsets feed the PLL, whose phase adjustment is what readers of
//! "synchronized time" actually see.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub mod frame;
pub mod pll;
pub mod ptp;
pub mod stats;

pub use frame::FrameSyncController;
pub use pll::SoftwarePll;
pub use ptp::PtpClock;
pub use stats::{LatencyStats, NetworkQuality, QualityAssessment, QualityThresholds, TrendAnalysis};

/// Sync errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SyncError {
    #[error("measurement interval out of range: {delta_us} us")]
    IntervalOutOfRange { delta_us: i64 },

    #[error("frame number regression: local {local}, received {received}")]
    FrameRegression { local: i64, received: i64 },
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Wall-clock microseconds since the UNIX epoch.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Monotonic microseconds since an arbitrary process-local origin. Used for
/// liveness bookkeeping where wall-clock steps must not matter.
pub fn monotonic_us() -> i64 {
    use std::sync::OnceLock;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_micros() as i64
}
