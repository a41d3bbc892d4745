//! Network latency telemetry.
//!
//! Schedules periodic ping probes per endpoint, matches responses against a
//! pending table, turns timeouts into loss accounting and feeds everything
//! into `flk_sync::LatencyStats`. Sampling cadence can adapt: consecutive
//! timeouts or a worsening trend shorten the interval toward the configured
//! minimum, a quiet link stretches it toward the maximum.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use flk_protocol::{PingKind, PingPayload};
use flk_sync::{LatencyStats, QualityAssessment, QualityThresholds};

use crate::PING_TIMEOUT_SECS;

/// Default probe interval.
pub const DEFAULT_PING_INTERVAL_SECS: f64 = 1.0;

/// Quality assessments run on this cadence by default.
pub const DEFAULT_ASSESSMENT_INTERVAL_SECS: f64 = 5.0;

/// Score movement that counts as a state change.
pub const DEFAULT_STATE_CHANGE_THRESHOLD: f64 = 15.0;

/// Bound on remembered state change events.
const MAX_EVENT_HISTORY: usize = 32;

/// Bound on outstanding probes across all endpoints.
const MAX_PENDING_PINGS: usize = 1024;

/// Timeouts in a row before the sampler decides the link degraded.
const TIMEOUTS_BEFORE_DEGRADE: u32 = 2;

/// Per-endpoint measurement configuration.
#[derive(Debug, Clone)]
pub struct MeasurementConfig {
    pub interval_secs: f64,
    /// 0 = unlimited.
    pub sample_count: u32,
    pub dynamic_sampling: bool,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_PING_INTERVAL_SECS,
            sample_count: 0,
            dynamic_sampling: false,
            min_interval_secs: 0.1,
            max_interval_secs: 5.0,
        }
    }
}

/// A network state change: the score moved past the configured threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkEvent {
    pub endpoint: SocketAddr,
    pub previous_score: u32,
    pub assessment: QualityAssessment,
    pub at_secs: f64,
}

struct Measurement {
    config: MeasurementConfig,
    stats: LatencyStats,
    thresholds: QualityThresholds,

    next_ping_secs: f64,
    sent_count: u32,
    consecutive_timeouts: u32,
    /// 1.0 = pristine link, 0.0 = unusable. Drives dynamic sampling.
    quality_factor: f64,

    monitoring_enabled: bool,
    assessment_interval_secs: f64,
    state_change_threshold: f64,
    next_assessment_secs: f64,
    last_score: Option<u32>,
    events: VecDeque<NetworkEvent>,
}

impl Measurement {
    fn new(config: MeasurementConfig, now_secs: f64) -> Self {
        Self {
            config,
            stats: LatencyStats::new(),
            thresholds: QualityThresholds::default(),
            next_ping_secs: now_secs,
            sent_count: 0,
            consecutive_timeouts: 0,
            quality_factor: 0.5,
            monitoring_enabled: true,
            assessment_interval_secs: DEFAULT_ASSESSMENT_INTERVAL_SECS,
            state_change_threshold: DEFAULT_STATE_CHANGE_THRESHOLD,
            next_assessment_secs: now_secs + DEFAULT_ASSESSMENT_INTERVAL_SECS,
            last_score: None,
            events: VecDeque::new(),
        }
    }

    fn effective_interval(&self) -> f64 {
        if !self.config.dynamic_sampling {
            return self.config.interval_secs;
        }
        let span = self.config.max_interval_secs - self.config.min_interval_secs;
        (self.config.min_interval_secs + span * self.quality_factor)
            .clamp(self.config.min_interval_secs, self.config.max_interval_secs)
    }

    fn exhausted(&self) -> bool {
        self.config.sample_count > 0 && self.sent_count >= self.config.sample_count
    }
}

/// Telemetry state across all measured endpoints.
pub struct Telemetry {
    measurements: HashMap<SocketAddr, Measurement>,
    /// Outstanding probes: sequence -> (endpoint, sent at).
    pending: HashMap<u32, (SocketAddr, f64)>,
    next_sequence: u32,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            measurements: HashMap::new(),
            pending: HashMap::new(),
            next_sequence: 1,
        }
    }

    /// Begin measuring `endpoint`.
    pub fn start(&mut self, endpoint: SocketAddr, config: MeasurementConfig, now_secs: f64) {
        info!(
            peer = %endpoint,
            interval = config.interval_secs,
            dynamic = config.dynamic_sampling,
            "latency measurement started"
        );
        self.measurements
            .insert(endpoint, Measurement::new(config, now_secs));
    }

    /// Stop measuring `endpoint`. Collected statistics are discarded.
    pub fn stop(&mut self, endpoint: SocketAddr) {
        if self.measurements.remove(&endpoint).is_some() {
            info!(peer = %endpoint, "latency measurement stopped");
        }
        self.pending.retain(|_, (ep, _)| *ep != endpoint);
    }

    pub fn is_measuring(&self, endpoint: SocketAddr) -> bool {
        self.measurements.contains_key(&endpoint)
    }

    /// Periodic driver: expire lost probes, emit due probes, run quality
    /// assessments. Returns probes to send and any state change events.
    pub fn tick(&mut self, now_secs: f64, now_us: i64) -> (Vec<(SocketAddr, PingPayload)>, Vec<NetworkEvent>) {
        self.expire_pending(now_secs);

        let mut to_send = Vec::new();
        let mut events = Vec::new();

        for (endpoint, m) in &mut self.measurements {
            if !m.exhausted() && now_secs >= m.next_ping_secs {
                let sequence = self.next_sequence;
                self.next_sequence = self.next_sequence.wrapping_add(1).max(1);

                if self.pending.len() >= MAX_PENDING_PINGS {
                    let oldest = self
                        .pending
                        .iter()
                        .min_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
                        .map(|(seq, _)| *seq);
                    if let Some(seq) = oldest {
                        self.pending.remove(&seq);
                    }
                }
                self.pending.insert(sequence, (*endpoint, now_secs));

                m.sent_count += 1;
                m.next_ping_secs = now_secs + m.effective_interval();

                to_send.push((
                    *endpoint,
                    PingPayload {
                        kind: PingKind::Request,
                        timestamp_us: now_us as u64,
                        sequence,
                    },
                ));
            }

            if m.monitoring_enabled && now_secs >= m.next_assessment_secs {
                m.next_assessment_secs = now_secs + m.assessment_interval_secs;
                let assessment = m.stats.evaluate_quality(&m.thresholds);

                // The quality factor chases the score so dynamic sampling
                // slows down on healthy links.
                m.quality_factor =
                    0.7 * m.quality_factor + 0.3 * (f64::from(assessment.score) / 100.0);
                if m.stats.trend().short_term > 0.0 {
                    m.quality_factor = (m.quality_factor - 0.05).max(0.0);
                }

                if let Some(previous) = m.last_score {
                    let delta = f64::from(assessment.score) - f64::from(previous);
                    if delta.abs() >= m.state_change_threshold {
                        let event = NetworkEvent {
                            endpoint: *endpoint,
                            previous_score: previous,
                            assessment: assessment.clone(),
                            at_secs: now_secs,
                        };
                        if m.events.len() >= MAX_EVENT_HISTORY {
                            m.events.pop_front();
                        }
                        m.events.push_back(event.clone());
                        events.push(event);
                        info!(
                            peer = %endpoint,
                            previous,
                            score = assessment.score,
                            "network state changed"
                        );
                    }
                }
                m.last_score = Some(assessment.score);
            }
        }

        (to_send, events)
    }

    fn expire_pending(&mut self, now_secs: f64) {
        let mut expired = Vec::new();
        self.pending.retain(|seq, (endpoint, sent)| {
            let alive = now_secs - *sent <= PING_TIMEOUT_SECS;
            if !alive {
                expired.push((*seq, *endpoint));
            }
            alive
        });

        for (seq, endpoint) in expired {
            let Some(m) = self.measurements.get_mut(&endpoint) else {
                continue;
            };
            m.stats.record_loss();
            m.consecutive_timeouts += 1;
            if m.consecutive_timeouts >= TIMEOUTS_BEFORE_DEGRADE {
                m.quality_factor = (m.quality_factor * 0.5).max(0.0);
            }
            warn!(
                peer = %endpoint,
                sequence = seq,
                consecutive = m.consecutive_timeouts,
                "ping timed out"
            );
        }
    }

    /// A PingResponse arrived from `from`.
    pub fn handle_response(&mut self, payload: &PingPayload, from: SocketAddr, now_secs: f64, now_us: i64) {
        let Some((endpoint, _)) = self.pending.remove(&payload.sequence) else {
            debug!(from = %from, sequence = payload.sequence, "unsolicited ping response");
            return;
        };

        let rtt_ms = (now_us - payload.timestamp_us as i64) as f64 / 1000.0;
        if rtt_ms < 0.0 {
            debug!(from = %from, rtt_ms, "negative rtt, clock stepped; sample dropped");
            return;
        }

        if let Some(m) = self.measurements.get_mut(&endpoint) {
            m.consecutive_timeouts = 0;
            m.stats.add_sample(rtt_ms, now_secs);
        }
    }

    /// Build the echo for an incoming PingRequest.
    pub fn make_response(request: &PingPayload) -> PingPayload {
        PingPayload {
            kind: PingKind::Response,
            timestamp_us: request.timestamp_us,
            sequence: request.sequence,
        }
    }

    pub fn stats(&self, endpoint: SocketAddr) -> Option<LatencyStats> {
        self.measurements.get(&endpoint).map(|m| m.stats.clone())
    }

    pub fn evaluate(&self, endpoint: SocketAddr) -> Option<QualityAssessment> {
        self.measurements
            .get(&endpoint)
            .map(|m| m.stats.evaluate_quality(&m.thresholds))
    }

    pub fn events(&self, endpoint: SocketAddr) -> Vec<NetworkEvent> {
        self.measurements
            .get(&endpoint)
            .map(|m| m.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_outlier_filtering(&mut self, endpoint: SocketAddr, enabled: bool) {
        if let Some(m) = self.measurements.get_mut(&endpoint) {
            m.stats.set_outlier_filtering(enabled);
        }
    }

    pub fn set_time_series_interval(&mut self, endpoint: SocketAddr, interval_secs: f64) {
        if let Some(m) = self.measurements.get_mut(&endpoint) {
            m.stats.set_time_series_interval(interval_secs);
        }
    }

    pub fn set_thresholds(&mut self, endpoint: SocketAddr, thresholds: QualityThresholds) {
        if let Some(m) = self.measurements.get_mut(&endpoint) {
            m.thresholds = thresholds;
        }
    }

    pub fn set_state_change_threshold(&mut self, endpoint: SocketAddr, threshold: f64) {
        if let Some(m) = self.measurements.get_mut(&endpoint) {
            m.state_change_threshold = threshold.max(1.0);
        }
    }

    pub fn set_assessment_interval(&mut self, endpoint: SocketAddr, interval_secs: f64) {
        if let Some(m) = self.measurements.get_mut(&endpoint) {
            m.assessment_interval_secs = interval_secs.clamp(1.0, 60.0);
        }
    }

    pub fn set_monitoring(&mut self, endpoint: SocketAddr, enabled: bool) {
        if let Some(m) = self.measurements.get_mut(&endpoint) {
            m.monitoring_enabled = enabled;
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
