//! PTP-style two-step clock offset estimation.
//!
//! One `PtpClock` runs per node and switches role with the election result.
//! The master side emits `Sync` + `FollowUp` pairs at the sync cadence and
//! answers `DelayReq` probes; the follower side turns the four timestamps of
//! each exchange into offset samples for the PLL.
//!
//! The follower asks for path delay on a fixed schedule (every
//! `DELAY_REQ_EVERY` syncs) rather than the random cadence some stacks use;
//! the long-run probe rate is the same and the behavior is reproducible.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use flk_protocol::{PtpKind, PtpMessage};

/// Default sync emission interval: 1 Hz.
pub const DEFAULT_SYNC_INTERVAL_US: i64 = 1_000_000;

/// Minimum configurable sync interval: 1 ms.
pub const MIN_SYNC_INTERVAL_US: i64 = 1_000;

/// A DelayReq is scheduled on every Nth received Sync.
pub const DELAY_REQ_EVERY: u32 = 5;

/// Weight of the previous path delay estimate when smoothing (70/30).
const PATH_DELAY_KEEP_NUM: i64 = 7;
const PATH_DELAY_NEW_NUM: i64 = 3;

/// Cap on outstanding DelayReq timestamps awaiting a response.
const MAX_PENDING_DELAY_REQS: usize = 8;

/// Estimated error reported before the first completed exchange: one second.
const UNSYNCED_ERROR_US: i64 = 1_000_000;

/// One offset measurement, ready to feed the PLL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    /// Local clock minus master clock, microseconds.
    pub offset_us: i64,
    /// Local timestamp at which the measurement was taken.
    pub timestamp_us: i64,
}

/// Two-step PTP exchange engine.
pub struct PtpClock {
    is_master: bool,
    synchronized: bool,

    sync_interval_us: i64,
    next_sequence: u16,
    last_sync_emit_us: i64,

    offset_us: i64,
    path_delay_us: i64,
    estimated_error_us: i64,

    // Follower exchange state
    last_sync: Option<(u16, i64)>, // (sequence, T2)
    precise_t1_us: i64,
    t2_us: i64,
    pending_delay_reqs: HashMap<u16, i64>, // sequence -> T3
    syncs_since_delay_req: u32,

    stale_follow_ups: u64,
    orphan_delay_resps: u64,
}

impl PtpClock {
    pub fn new() -> Self {
        Self {
            is_master: false,
            synchronized: false,
            sync_interval_us: DEFAULT_SYNC_INTERVAL_US,
            next_sequence: 0,
            last_sync_emit_us: 0,
            offset_us: 0,
            path_delay_us: 0,
            estimated_error_us: 0,
            last_sync: None,
            precise_t1_us: 0,
            t2_us: 0,
            pending_delay_reqs: HashMap::new(),
            syncs_since_delay_req: 0,
            stale_follow_ups: 0,
            orphan_delay_resps: 0,
        }
    }

    /// Switch between master and slave role. Exchange state from the old
    /// role is discarded; the smoothed path delay survives a role flap.
    pub fn set_master_mode(&mut self, is_master: bool) {
        if self.is_master == is_master {
            return;
        }
        debug!(is_master, "ptp role changed");
        self.is_master = is_master;
        self.synchronized = false;
        self.last_sync = None;
        self.pending_delay_reqs.clear();
        self.syncs_since_delay_req = 0;
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// Configure the sync emission cadence, floored at 1 ms.
    pub fn set_sync_interval_us(&mut self, interval_us: i64) {
        self.sync_interval_us = interval_us.max(MIN_SYNC_INTERVAL_US);
    }

    pub fn sync_interval_us(&self) -> i64 {
        self.sync_interval_us
    }

    /// Local minus master clock, microseconds. Zero until the first
    /// exchange completes.
    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    pub fn path_delay_us(&self) -> i64 {
        self.path_delay_us
    }

    /// Current error estimate; a deliberately pessimistic one second until
    /// the first exchange completes.
    pub fn estimated_error_us(&self) -> i64 {
        if !self.synchronized {
            return UNSYNCED_ERROR_US;
        }
        self.estimated_error_us
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_master || self.synchronized
    }

    // ------------------------------------------------------------------
    // Master side
    // ------------------------------------------------------------------

    /// Master tick: when the cadence has elapsed, produce the Sync message
    /// and its FollowUp carrying the precise T1. Returns `None` off-cadence
    /// and always on followers.
    pub fn maybe_emit_sync(&mut self, now_us: i64) -> Option<(PtpMessage, PtpMessage)> {
        if !self.is_master {
            return None;
        }
        if now_us - self.last_sync_emit_us < self.sync_interval_us {
            return None;
        }
        self.last_sync_emit_us = now_us;

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let t1 = now_us;
        trace!(sequence, t1, "emitting sync");
        let sync = PtpMessage::new(PtpKind::Sync, sequence, t1);
        let follow_up = PtpMessage::new(PtpKind::FollowUp, sequence, t1);
        Some((sync, follow_up))
    }

    /// Master side of the delay measurement: stamp T4 and echo it back.
    pub fn handle_delay_req(&mut self, msg: &PtpMessage, now_us: i64) -> Option<PtpMessage> {
        if !self.is_master {
            return None;
        }

        let t4 = now_us;
        let mut port_id = [0u8; 10];
        port_id[..2].copy_from_slice(&msg.sequence.to_le_bytes());
        trace!(sequence = msg.sequence, t4, "answering delay request");
        Some(PtpMessage::delay_resp(msg.sequence, t4, port_id))
    }

    // ------------------------------------------------------------------
    // Follower side
    // ------------------------------------------------------------------

    /// Follower receipt of a Sync broadcast: record T2 and, on schedule,
    /// produce a DelayReq (whose origin timestamp is T3 = now).
    pub fn handle_sync(&mut self, msg: &PtpMessage, now_us: i64) -> Option<PtpMessage> {
        if self.is_master {
            return None;
        }

        self.last_sync = Some((msg.sequence, now_us));

        self.syncs_since_delay_req += 1;
        if self.syncs_since_delay_req < DELAY_REQ_EVERY && self.path_delay_us != 0 {
            return None;
        }
        self.syncs_since_delay_req = 0;

        let t3 = now_us;
        if self.pending_delay_reqs.len() >= MAX_PENDING_DELAY_REQS {
            // Oldest outstanding probes are lost on the wire; forget them.
            let oldest = self
                .pending_delay_reqs
                .iter()
                .min_by_key(|(_, sent)| **sent)
                .map(|(seq, _)| *seq);
            if let Some(seq) = oldest {
                self.pending_delay_reqs.remove(&seq);
            }
        }
        self.pending_delay_reqs.insert(msg.sequence, t3);
        trace!(sequence = msg.sequence, t3, "emitting delay request");
        Some(PtpMessage::new(PtpKind::DelayReq, msg.sequence, t3))
    }

    /// Follower receipt of the FollowUp: learn the precise T1 and produce
    /// an offset sample. Before the first path delay measurement the sample
    /// is the raw `T2 − T1`.
    pub fn handle_follow_up(&mut self, msg: &PtpMessage, now_us: i64) -> Option<OffsetSample> {
        if self.is_master {
            return None;
        }

        let (sequence, t2) = self.last_sync?;
        if sequence != msg.sequence {
            self.stale_follow_ups += 1;
            debug!(
                expected = sequence,
                got = msg.sequence,
                "follow-up for a different sync, dropping"
            );
            return None;
        }

        self.precise_t1_us = msg.timestamp_us;
        self.t2_us = t2;

        let raw_offset = t2 - self.precise_t1_us;
        self.offset_us = if self.path_delay_us != 0 {
            self.synchronized = true;
            raw_offset - self.path_delay_us / 2
        } else {
            raw_offset
        };

        trace!(
            sequence = msg.sequence,
            offset = self.offset_us,
            path_delay = self.path_delay_us,
            "offset updated from follow-up"
        );

        Some(OffsetSample {
            offset_us: self.offset_us,
            timestamp_us: now_us,
        })
    }

    /// Follower receipt of the DelayResp: close the exchange, update the
    /// smoothed path delay and re-derive the offset.
    pub fn handle_delay_resp(&mut self, msg: &PtpMessage, now_us: i64) -> Option<OffsetSample> {
        if self.is_master {
            return None;
        }

        let Some(t3) = self.pending_delay_reqs.remove(&msg.sequence) else {
            self.orphan_delay_resps += 1;
            debug!(sequence = msg.sequence, "delay response without a pending request");
            return None;
        };

        if self.precise_t1_us == 0 || self.t2_us == 0 {
            return None;
        }

        let t4 = msg.timestamp_us;

        // PathDelay = (T4 − T1) − (T3 − T2) = (T4 − T3) + (T2 − T1)
        let new_path_delay = (t4 - t3) + (self.t2_us - self.precise_t1_us);
        if new_path_delay < 0 {
            warn!(new_path_delay, "negative path delay measurement, dropping");
            return None;
        }

        self.path_delay_us = if self.path_delay_us != 0 {
            (self.path_delay_us * PATH_DELAY_KEEP_NUM + new_path_delay * PATH_DELAY_NEW_NUM) / 10
        } else {
            new_path_delay
        };

        self.offset_us = (self.t2_us - self.precise_t1_us) - self.path_delay_us / 2;
        self.estimated_error_us = (new_path_delay - self.path_delay_us).abs() / 2;
        self.synchronized = true;

        debug!(
            path_delay = self.path_delay_us,
            offset = self.offset_us,
            error = self.estimated_error_us,
            "path delay updated"
        );

        Some(OffsetSample {
            offset_us: self.offset_us,
            timestamp_us: now_us,
        })
    }

    /// Counters for dropped protocol messages (stale follow-ups, orphan
    /// delay responses).
    pub fn drop_counters(&self) -> (u64, u64) {
        (self.stale_follow_ups, self.orphan_delay_resps)
    }
}

impl Default for PtpClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive one complete exchange between a master and a follower whose
    /// clock reads `master + offset`, over a symmetric path of `delay` µs.
    /// Returns the follower after `rounds` exchanges.
    fn run_exchanges(offset: i64, delay: i64, rounds: usize) -> PtpClock {
        let mut master = PtpClock::new();
        master.set_master_mode(true);
        let mut follower = PtpClock::new();

        let mut master_now = 10_000_000;
        for _ in 0..rounds {
            master_now += master.sync_interval_us();
            let (sync, follow_up) = master.maybe_emit_sync(master_now).unwrap();

            // Sync arrives after one half-trip; T2 is in follower time.
            let t2 = master_now + delay / 2 + offset;
            let delay_req = follower.handle_sync(&sync, t2);
            follower.handle_follow_up(&follow_up, t2 + 10);

            if let Some(req) = delay_req {
                let t4 = (req.timestamp_us - offset) + delay / 2;
                let resp = master.handle_delay_req(&req, t4).unwrap();
                follower.handle_delay_resp(&resp, req.timestamp_us + delay);
            }
        }
        follower
    }

    #[test]
    fn converges_to_known_offset_and_delay() {
        // Spec scenario: +3000 us offset, 400 us symmetric delay.
        let follower = run_exchanges(3000, 400, 3);
        assert!(follower.is_synchronized());
        assert_eq!(follower.path_delay_us(), 400);
        assert_eq!(follower.offset_us(), 3000);
        assert!(follower.estimated_error_us() < 100);
    }

    #[test]
    fn first_exchange_is_exact_with_symmetric_delay() {
        let follower = run_exchanges(-1500, 800, 1);
        assert_eq!(follower.path_delay_us(), 800);
        assert_eq!(follower.offset_us(), -1500);
    }

    #[test]
    fn error_is_pessimistic_before_sync() {
        let clock = PtpClock::new();
        assert!(!clock.is_synchronized());
        assert_eq!(clock.estimated_error_us(), 1_000_000);
    }

    #[test]
    fn master_ignores_follower_messages() {
        let mut master = PtpClock::new();
        master.set_master_mode(true);
        let sync = PtpMessage::new(PtpKind::Sync, 0, 123);
        assert!(master.handle_sync(&sync, 456).is_none());
        assert!(master.handle_follow_up(&sync, 456).is_none());
        assert!(master.is_synchronized()); // masters are authoritative
    }

    #[test]
    fn follower_ignores_delay_req() {
        let mut follower = PtpClock::new();
        let req = PtpMessage::new(PtpKind::DelayReq, 0, 123);
        assert!(follower.handle_delay_req(&req, 456).is_none());
    }

    #[test]
    fn sync_cadence_respected() {
        let mut master = PtpClock::new();
        master.set_master_mode(true);
        assert!(master.maybe_emit_sync(1_000_000).is_some());
        assert!(master.maybe_emit_sync(1_500_000).is_none());
        assert!(master.maybe_emit_sync(2_000_000).is_some());
    }

    #[test]
    fn sync_interval_floor() {
        let mut clock = PtpClock::new();
        clock.set_sync_interval_us(1);
        assert_eq!(clock.sync_interval_us(), MIN_SYNC_INTERVAL_US);
    }

    #[test]
    fn stale_follow_up_dropped() {
        let mut follower = PtpClock::new();
        follower.handle_sync(&PtpMessage::new(PtpKind::Sync, 7, 100), 1000);
        let stale = PtpMessage::new(PtpKind::FollowUp, 6, 90);
        assert!(follower.handle_follow_up(&stale, 1010).is_none());
        assert_eq!(follower.drop_counters().0, 1);
    }

    #[test]
    fn orphan_delay_resp_dropped() {
        let mut follower = PtpClock::new();
        let resp = PtpMessage::delay_resp(3, 500, [0; 10]);
        assert!(follower.handle_delay_resp(&resp, 1000).is_none());
        assert_eq!(follower.drop_counters().1, 1);
    }

    #[test]
    fn delay_req_every_fifth_sync_once_measured() {
        let follower = run_exchanges(0, 200, 1);
        let mut follower = follower;

        let mut requests = 0;
        for seq in 10..30u16 {
            let sync = PtpMessage::new(PtpKind::Sync, seq, 1_000_000 * i64::from(seq));
            if follower.handle_sync(&sync, 1_000_000 * i64::from(seq) + 100).is_some() {
                requests += 1;
            }
        }
        assert_eq!(requests, 4); // 20 syncs / every 5th
    }
}
