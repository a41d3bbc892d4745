//! Per-peer network latency statistics.
//!
//! A bounded ring of RTT samples drives min/max/avg, standard deviation,
//! jitter and percentiles; a second, slower ring keeps a time series for
//! trend analysis. Outlier filtering (median + k·MAD) keeps spikes out of
//! the steady-state figures without hiding them from loss accounting or the
//! outlier counter.

use std::collections::VecDeque;

use tracing::debug;

/// RTT ring capacity.
pub const MAX_RTT_SAMPLES: usize = 100;

/// Time series ring capacity (five minutes at the default cadence).
pub const MAX_TIME_SERIES_SAMPLES: usize = 300;

/// Default spacing between time series points, seconds.
pub const DEFAULT_TIME_SERIES_INTERVAL_SECS: f64 = 1.0;

/// Outlier cutoff: `median + MAD_K · MAD`.
const MAD_K: f64 = 3.5;

/// Outlier filtering needs this many samples before it can judge.
const MIN_SAMPLES_FOR_FILTERING: usize = 10;

/// One point of the latency time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSeriesSample {
    pub timestamp_secs: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
}

/// Trend indicators derived from the time series. Positive trend values
/// mean the link is getting worse.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrendAnalysis {
    pub short_term: f64,
    pub long_term: f64,
    pub volatility: f64,
    pub time_since_worst_secs: f64,
    pub time_since_best_secs: f64,
}

/// Textual quality band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn from_score(score: u32) -> Self {
        match score {
            85.. => Self::Excellent,
            70..=84 => Self::Good,
            50..=69 => Self::Fair,
            _ => Self::Poor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::Fair => "Fair",
            Self::Poor => "Poor",
        }
    }
}

/// Thresholds at which a subscore bottoms out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            latency_ms: 150.0,
            jitter_ms: 50.0,
            packet_loss: 0.05,
        }
    }
}

/// A scored snapshot of link quality.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityAssessment {
    pub score: u32,
    pub latency_score: u32,
    pub jitter_score: u32,
    pub loss_score: u32,
    pub stability_score: u32,
    pub quality: NetworkQuality,
    pub description: String,
    pub recommendations: Vec<String>,
}

/// Rolling latency statistics for one peer.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub avg_rtt_ms: f64,
    pub current_rtt_ms: f64,
    pub std_deviation_ms: f64,
    pub jitter_ms: f64,
    pub percentile_50_ms: f64,
    pub percentile_95_ms: f64,
    pub percentile_99_ms: f64,
    pub sample_count: u32,
    pub lost_packets: u32,

    pub outliers_detected: u32,
    pub outlier_threshold_ms: f64,
    pub filter_outliers: bool,

    recent: VecDeque<f64>,
    time_series: VecDeque<TimeSeriesSample>,
    time_series_interval_secs: f64,
    last_time_series_secs: f64,
    trend: TrendAnalysis,
    time_of_worst_secs: f64,
    time_of_best_secs: f64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            min_rtt_ms: f64::MAX,
            max_rtt_ms: 0.0,
            avg_rtt_ms: 0.0,
            current_rtt_ms: 0.0,
            std_deviation_ms: 0.0,
            jitter_ms: 0.0,
            percentile_50_ms: 0.0,
            percentile_95_ms: 0.0,
            percentile_99_ms: 0.0,
            sample_count: 0,
            lost_packets: 0,
            outliers_detected: 0,
            outlier_threshold_ms: 0.0,
            filter_outliers: true,
            recent: VecDeque::with_capacity(MAX_RTT_SAMPLES),
            time_series: VecDeque::with_capacity(MAX_TIME_SERIES_SAMPLES),
            time_series_interval_secs: DEFAULT_TIME_SERIES_INTERVAL_SECS,
            last_time_series_secs: 0.0,
            trend: TrendAnalysis::default(),
            time_of_worst_secs: 0.0,
            time_of_best_secs: 0.0,
        }
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one RTT measurement taken at `now_secs` (monotonic).
    pub fn add_sample(&mut self, rtt_ms: f64, now_secs: f64) {
        self.sample_count += 1;
        self.current_rtt_ms = rtt_ms;

        if self.filter_outliers && self.is_outlier(rtt_ms) {
            self.outliers_detected += 1;
            debug!(
                rtt_ms,
                threshold = self.outlier_threshold_ms,
                "rtt outlier excluded from steady-state stats"
            );
        } else {
            if self.recent.len() >= MAX_RTT_SAMPLES {
                self.recent.pop_front();
            }
            self.recent.push_back(rtt_ms);
            self.recompute();

            if rtt_ms >= self.max_rtt_ms {
                self.time_of_worst_secs = now_secs;
            }
            if rtt_ms <= self.min_rtt_ms {
                self.time_of_best_secs = now_secs;
            }
        }

        self.maybe_record_time_series(now_secs);
        self.analyze_trend(now_secs);
    }

    /// Record a probe that timed out. Losses are never filtered.
    pub fn record_loss(&mut self) {
        self.lost_packets += 1;
    }

    /// Fraction of probes lost.
    pub fn loss_rate(&self) -> f64 {
        let total = self.sample_count + self.lost_packets;
        if total == 0 {
            return 0.0;
        }
        f64::from(self.lost_packets) / f64::from(total)
    }

    pub fn set_outlier_filtering(&mut self, enabled: bool) {
        self.filter_outliers = enabled;
    }

    pub fn set_time_series_interval(&mut self, interval_secs: f64) {
        self.time_series_interval_secs = interval_secs.max(0.1);
    }

    pub fn time_series(&self) -> &VecDeque<TimeSeriesSample> {
        &self.time_series
    }

    pub fn trend(&self) -> TrendAnalysis {
        self.trend
    }

    fn is_outlier(&mut self, rtt_ms: f64) -> bool {
        if self.recent.len() < MIN_SAMPLES_FOR_FILTERING {
            return false;
        }

        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[sorted.len() / 2];

        let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
        deviations.sort_by(|a, b| a.total_cmp(b));
        let mad = deviations[deviations.len() / 2];

        // A flat ring (MAD 0) would flag every change; fall back to the
        // median itself as the scale.
        let scale = if mad > 0.0 { mad } else { median.max(1.0) * 0.1 };
        self.outlier_threshold_ms = median + MAD_K * scale;

        rtt_ms > self.outlier_threshold_ms
    }

    fn recompute(&mut self) {
        let n = self.recent.len();
        if n == 0 {
            return;
        }

        let mut min = f64::MAX;
        let mut max: f64 = 0.0;
        let mut sum = 0.0;
        for &v in &self.recent {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        self.min_rtt_ms = min;
        self.max_rtt_ms = max;
        self.avg_rtt_ms = sum / n as f64;

        self.std_deviation_ms = if n > 1 {
            let var = self
                .recent
                .iter()
                .map(|v| (v - self.avg_rtt_ms).powi(2))
                .sum::<f64>()
                / (n - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        // Jitter: mean absolute difference between consecutive samples.
        self.jitter_ms = if n > 1 {
            self.recent
                .iter()
                .zip(self.recent.iter().skip(1))
                .map(|(a, b)| (b - a).abs())
                .sum::<f64>()
                / (n - 1) as f64
        } else {
            0.0
        };

        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        self.percentile_50_ms = nearest_rank(&sorted, 50.0);
        self.percentile_95_ms = nearest_rank(&sorted, 95.0);
        self.percentile_99_ms = nearest_rank(&sorted, 99.0);
    }

    fn maybe_record_time_series(&mut self, now_secs: f64) {
        if now_secs - self.last_time_series_secs < self.time_series_interval_secs {
            return;
        }
        self.last_time_series_secs = now_secs;

        if self.time_series.len() >= MAX_TIME_SERIES_SAMPLES {
            self.time_series.pop_front();
        }
        self.time_series.push_back(TimeSeriesSample {
            timestamp_secs: now_secs,
            rtt_ms: self.current_rtt_ms,
            jitter_ms: self.jitter_ms,
        });
    }

    fn analyze_trend(&mut self, now_secs: f64) {
        let series: Vec<f64> = self.time_series.iter().map(|s| s.rtt_ms).collect();
        let n = series.len();
        if n >= 4 {
            // Short term: last quarter of the window against the quarter
            // before it. Long term: second half against first half.
            let q = n / 4;
            let recent = mean(&series[n - q..]);
            let prior = mean(&series[n - 2 * q..n - q]);
            self.trend.short_term = recent - prior;

            let half = n / 2;
            self.trend.long_term = mean(&series[half..]) - mean(&series[..half]);

            let overall = mean(&series);
            let var = series.iter().map(|v| (v - overall).powi(2)).sum::<f64>() / n as f64;
            self.trend.volatility = var.sqrt();
        }

        self.trend.time_since_worst_secs = (now_secs - self.time_of_worst_secs).max(0.0);
        self.trend.time_since_best_secs = (now_secs - self.time_of_best_secs).max(0.0);
    }

    /// Score the link 0-100 against `thresholds`.
    pub fn evaluate_quality(&self, thresholds: &QualityThresholds) -> QualityAssessment {
        let latency_score = linear_score(self.avg_rtt_ms, thresholds.latency_ms);
        let jitter_score = linear_score(self.jitter_ms, thresholds.jitter_ms);
        let loss_score = linear_score(self.loss_rate(), thresholds.packet_loss);
        let stability_score = self.stability_score(thresholds);

        let score = (0.35 * f64::from(latency_score)
            + 0.25 * f64::from(jitter_score)
            + 0.25 * f64::from(loss_score)
            + 0.15 * f64::from(stability_score))
        .round() as u32;

        let quality = NetworkQuality::from_score(score);

        let mut recommendations = Vec::new();
        if latency_score < 50 {
            recommendations
                .push("High round-trip time; check switch load and cabling on the sync LAN".into());
        }
        if jitter_score < 50 {
            recommendations
                .push("High jitter; isolate sync traffic from bulk transfers".into());
        }
        if loss_score < 50 {
            recommendations
                .push("Packet loss detected; verify link duplex settings and buffer sizes".into());
        }
        if stability_score < 50 {
            recommendations.push("Link quality is unstable; recent trend is worsening".into());
        }

        let description = format!(
            "{}: avg {:.2} ms, jitter {:.2} ms, loss {:.1}%",
            quality.as_str(),
            self.avg_rtt_ms,
            self.jitter_ms,
            self.loss_rate() * 100.0
        );

        QualityAssessment {
            score,
            latency_score,
            jitter_score,
            loss_score,
            stability_score,
            quality,
            description,
            recommendations,
        }
    }

    fn stability_score(&self, thresholds: &QualityThresholds) -> u32 {
        let volatility_penalty = (self.trend.volatility / thresholds.jitter_ms).clamp(0.0, 1.0) * 70.0;
        let trend_penalty = if self.trend.short_term > 0.0 {
            (self.trend.short_term / 10.0).clamp(0.0, 1.0) * 30.0
        } else {
            0.0
        };
        (100.0 - volatility_penalty - trend_penalty).max(0.0).round() as u32
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Nearest-rank percentile on an ascending-sorted slice.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// 100 at zero, linearly down to 0 at `threshold` and beyond.
fn linear_score(value: f64, threshold: f64) -> u32 {
    if threshold <= 0.0 {
        return 0;
    }
    ((1.0 - (value / threshold).clamp(0.0, 1.0)) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(stats: &mut LatencyStats, samples: &[f64]) {
        for (i, &rtt) in samples.iter().enumerate() {
            stats.add_sample(rtt, i as f64 + 1.0);
        }
    }

    #[test]
    fn basic_statistics() {
        let mut stats = LatencyStats::new();
        feed(&mut stats, &[10.0, 20.0, 30.0, 40.0, 50.0]);

        assert_eq!(stats.min_rtt_ms, 10.0);
        assert_eq!(stats.max_rtt_ms, 50.0);
        assert_eq!(stats.avg_rtt_ms, 30.0);
        assert_eq!(stats.current_rtt_ms, 50.0);
        assert_eq!(stats.jitter_ms, 10.0);
        assert_eq!(stats.sample_count, 5);
        // Sample stddev of 10..50 step 10 is sqrt(250) ≈ 15.81.
        assert!((stats.std_deviation_ms - 250.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn percentiles_nearest_rank() {
        let mut stats = LatencyStats::new();
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        feed(&mut stats, &samples);

        assert_eq!(stats.percentile_50_ms, 50.0);
        assert_eq!(stats.percentile_95_ms, 95.0);
        assert_eq!(stats.percentile_99_ms, 99.0);
    }

    #[test]
    fn ring_is_bounded() {
        let mut stats = LatencyStats::new();
        stats.set_outlier_filtering(false);
        let samples: Vec<f64> = (0..500).map(|i| 10.0 + (i % 7) as f64).collect();
        feed(&mut stats, &samples);
        assert!(stats.recent.len() <= MAX_RTT_SAMPLES);
        assert_eq!(stats.sample_count, 500);
    }

    #[test]
    fn outliers_counted_but_excluded() {
        let mut stats = LatencyStats::new();
        feed(&mut stats, &[10.0, 11.0, 10.5, 9.8, 10.2, 10.1, 9.9, 10.3, 10.0, 10.4]);

        stats.add_sample(500.0, 20.0);
        assert_eq!(stats.outliers_detected, 1);
        assert!(stats.max_rtt_ms < 12.0, "outlier leaked into steady-state stats");
        assert_eq!(stats.sample_count, 11);
        // Loss accounting is untouched by filtering.
        stats.record_loss();
        assert_eq!(stats.lost_packets, 1);
    }

    #[test]
    fn outlier_filtering_can_be_disabled() {
        let mut stats = LatencyStats::new();
        stats.set_outlier_filtering(false);
        feed(&mut stats, &[10.0; 20]);
        stats.add_sample(500.0, 30.0);
        assert_eq!(stats.outliers_detected, 0);
        assert_eq!(stats.max_rtt_ms, 500.0);
    }

    #[test]
    fn loss_rate_combines_samples_and_losses() {
        let mut stats = LatencyStats::new();
        feed(&mut stats, &[10.0; 19]);
        stats.record_loss();
        assert!((stats.loss_rate() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn time_series_respects_interval_and_cap() {
        let mut stats = LatencyStats::new();
        stats.set_time_series_interval(1.0);
        // Two samples within the same second: only one series point.
        stats.add_sample(10.0, 1.0);
        stats.add_sample(11.0, 1.5);
        assert_eq!(stats.time_series().len(), 1);

        for i in 0..400 {
            stats.add_sample(10.0, 2.0 + f64::from(i));
        }
        assert!(stats.time_series().len() <= MAX_TIME_SERIES_SAMPLES);
    }

    #[test]
    fn trend_detects_worsening_link() {
        let mut stats = LatencyStats::new();
        stats.set_outlier_filtering(false);
        // Ramp from 10 ms to 60 ms over 100 seconds.
        for i in 0..100 {
            stats.add_sample(10.0 + f64::from(i) * 0.5, f64::from(i));
        }
        let trend = stats.trend();
        assert!(trend.short_term > 0.0);
        assert!(trend.long_term > 0.0);
        assert!(trend.volatility > 0.0);
    }

    #[test]
    fn quality_bands() {
        assert_eq!(NetworkQuality::from_score(92), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::from_score(85), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::from_score(70), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_score(50), NetworkQuality::Fair);
        assert_eq!(NetworkQuality::from_score(49), NetworkQuality::Poor);
    }

    #[test]
    fn quiet_lan_scores_excellent() {
        let mut stats = LatencyStats::new();
        feed(&mut stats, &[0.8, 0.9, 1.0, 0.85, 0.95, 0.9, 0.88, 0.92, 0.87, 0.91]);
        let assessment = stats.evaluate_quality(&QualityThresholds::default());
        assert!(assessment.score >= 85, "score {}", assessment.score);
        assert_eq!(assessment.quality, NetworkQuality::Excellent);
        assert!(assessment.recommendations.is_empty());
    }

    #[test]
    fn lossy_slow_link_scores_poor() {
        let mut stats = LatencyStats::new();
        stats.set_outlier_filtering(false);
        for i in 0..30 {
            stats.add_sample(140.0 + f64::from(i % 13) * 9.0, f64::from(i));
        }
        for _ in 0..30 {
            stats.record_loss();
        }
        let assessment = stats.evaluate_quality(&QualityThresholds::default());
        assert!(assessment.score < 50, "score {}", assessment.score);
        assert_eq!(assessment.quality, NetworkQuality::Poor);
        assert!(!assessment.recommendations.is_empty());
    }
}
