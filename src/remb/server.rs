use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::rate::RateCalculator;
use crate::rtp::Remb;

// One constant table for the multiplicative rate control.
const DECREASE_FACTOR: f64 = 0.85;
const INCREASE_FACTOR: f64 = 1.08;

// Packets whose send times lie within this window form one group.
const BURST_DELTA_MS: f64 = 5.0;

// Estimator process cadence.
const PROCESS_INTERVAL: Duration = Duration::from_millis(200);

// Over-use must persist this long before the estimate drops.
const OVERUSING_TIME_THRESHOLD_MS: f64 = 10.0;

// Sliding window of send-time deltas for the noise clamp.
const FRAME_PERIOD_HISTORY: usize = 60;

/// Receive-side bandwidth estimation from abs-send-time.
///
/// Packets are grouped by send time; inter-arrival deltas between groups
/// feed a Kalman filter estimating the queuing delay slope. A detector
/// turns the filtered offset into an over/under-use hypothesis, and a
/// multiplicative controller adapts the estimate, which is emitted as a
/// REMB packet listing the attached producer SSRCs.
#[derive(Debug)]
pub struct RembServer {
    estimator: OveruseEstimator,
    detector: OveruseDetector,
    current_group: Option<Group>,
    prev_group: Option<Group>,
    /// 24 bit abs-send-time unwrap state.
    last_abs_24: Option<u32>,
    abs_rollovers: u64,
    incoming_rate: RateCalculator,
    available_bitrate: Option<f64>,
    max_bitrate: Option<u32>,
    last_emitted: Option<u64>,
    next_process: Option<Instant>,
    ssrcs: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Group {
    first_send_ms: f64,
    last_send_ms: f64,
    last_arrival: Instant,
    size: usize,
}

impl RembServer {
    pub fn new() -> RembServer {
        RembServer {
            estimator: OveruseEstimator::new(),
            detector: OveruseDetector::new(),
            current_group: None,
            prev_group: None,
            last_abs_24: None,
            abs_rollovers: 0,
            incoming_rate: RateCalculator::default(),
            available_bitrate: None,
            max_bitrate: None,
            last_emitted: None,
            next_process: None,
            ssrcs: Vec::new(),
        }
    }

    /// Clamp the estimate (transport.setMaxIncomingBitrate).
    pub fn set_max_bitrate(&mut self, bitrate: u32) {
        self.max_bitrate = Some(bitrate);
    }

    /// The SSRCs listed in emitted REMB packets.
    pub fn set_ssrcs(&mut self, ssrcs: Vec<u32>) {
        self.ssrcs = ssrcs;
    }

    /// Feed one incoming media packet carrying abs-send-time.
    pub fn incoming_packet(&mut self, now: Instant, abs_send_time_24: u32, size: usize) {
        self.incoming_rate.update(size, now);

        if self.next_process.is_none() {
            self.next_process = Some(now + PROCESS_INTERVAL);
        }

        let send_ms = self.unwrap_send_time_ms(abs_send_time_24);

        let belongs = match &self.current_group {
            None => false,
            Some(g) => send_ms - g.first_send_ms <= BURST_DELTA_MS,
        };

        if belongs {
            let g = self.current_group.as_mut().unwrap();
            g.last_send_ms = g.last_send_ms.max(send_ms);
            g.last_arrival = now;
            g.size += size;
            return;
        }

        // Group boundary: deltas between the two finished groups drive
        // the estimator.
        if let (Some(prev), Some(cur)) = (self.prev_group, self.current_group) {
            let ts_delta = cur.last_send_ms - prev.last_send_ms;
            let arrival_delta = cur
                .last_arrival
                .duration_since(prev.last_arrival)
                .as_secs_f64()
                * 1000.0;
            let size_delta = cur.size as i64 - prev.size as i64;

            if ts_delta > 0.0 {
                let now_ms = crate::util::epoch_millis(now);
                let hypothesis = self.detector.state();
                self.estimator
                    .update(arrival_delta, ts_delta, size_delta as i32, hypothesis);
                self.detector.detect(
                    self.estimator.offset(),
                    ts_delta,
                    self.estimator.num_of_deltas(),
                    now_ms,
                );
            }
        }

        self.prev_group = self.current_group;
        self.current_group = Some(Group {
            first_send_ms: send_ms,
            last_send_ms: send_ms,
            last_arrival: now,
            size,
        });
    }

    /// Next estimator process deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next_process
    }

    /// Run the periodic process. Returns a REMB to emit when the
    /// estimate changed.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<Remb> {
        let next = self.next_process?;
        if now < next {
            return None;
        }
        self.next_process = Some(now + PROCESS_INTERVAL);

        let incoming = self.incoming_rate.rate(now) as f64;
        if incoming <= 0.0 {
            return None;
        }

        let current = self.available_bitrate.unwrap_or(incoming);

        let updated = match self.detector.state() {
            BandwidthUsage::Overusing => incoming.min(current) * DECREASE_FACTOR,
            BandwidthUsage::Normal => current * INCREASE_FACTOR,
            BandwidthUsage::Underusing => current,
        };

        let updated = match self.max_bitrate {
            Some(max) => updated.min(max as f64),
            None => updated,
        };

        self.available_bitrate = Some(updated);

        let as_u64 = updated as u64;
        if self.last_emitted == Some(as_u64) {
            return None;
        }
        self.last_emitted = Some(as_u64);

        Some(Remb {
            sender_ssrc: 0.into(),
            bitrate: updated as f32,
            ssrcs: self.ssrcs.clone(),
        })
    }

    /// The current estimate, when one exists.
    pub fn available_bitrate(&self) -> Option<u32> {
        self.available_bitrate.map(|b| b as u32)
    }

    // abs-send-time is 24 bits of 6.18 fixed point seconds, wrapping
    // every 64 seconds.
    fn unwrap_send_time_ms(&mut self, abs_24: u32) -> f64 {
        if let Some(last) = self.last_abs_24 {
            // Backwards more than half the range is a rollover.
            if abs_24 < last && last - abs_24 > (1 << 23) {
                self.abs_rollovers += 1;
            }
        }
        self.last_abs_24 = Some(abs_24);

        let total = self.abs_rollovers * (1 << 24) + abs_24 as u64;
        (total as f64) * 1000.0 / (1 << 18) as f64
    }
}

impl Default for RembServer {
    fn default() -> Self {
        RembServer::new()
    }
}

/// Hypothesis of the over-use detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthUsage {
    Underusing,
    Normal,
    Overusing,
}

/// Kalman filter over (slope, offset) of inter-arrival deltas.
#[derive(Debug)]
struct OveruseEstimator {
    slope: f64,
    offset: f64,
    prev_offset: f64,
    e: [[f64; 2]; 2],
    process_noise: [f64; 2],
    avg_noise: f64,
    var_noise: f64,
    ts_delta_hist: VecDeque<f64>,
    num_of_deltas: u32,
}

impl OveruseEstimator {
    fn new() -> Self {
        OveruseEstimator {
            slope: 8.0 / 512.0,
            offset: 0.0,
            prev_offset: 0.0,
            e: [[100.0, 0.0], [0.0, 1e-1]],
            process_noise: [1e-13, 1e-3],
            avg_noise: 0.0,
            var_noise: 50.0,
            ts_delta_hist: VecDeque::new(),
            num_of_deltas: 0,
        }
    }

    fn offset(&self) -> f64 {
        self.offset
    }

    fn num_of_deltas(&self) -> u32 {
        self.num_of_deltas
    }

    fn update(
        &mut self,
        arrival_delta_ms: f64,
        ts_delta_ms: f64,
        size_delta: i32,
        hypothesis: BandwidthUsage,
    ) {
        let min_frame_period = self.update_min_frame_period(ts_delta_ms);
        let t_ts_delta = arrival_delta_ms - ts_delta_ms;

        self.num_of_deltas = (self.num_of_deltas + 1).min(1000);

        // Kalman predict.
        self.e[0][0] += self.process_noise[0];
        self.e[1][1] += self.process_noise[1];

        let h = [size_delta as f64, 1.0];
        let eh = [
            self.e[0][0] * h[0] + self.e[0][1] * h[1],
            self.e[1][0] * h[0] + self.e[1][1] * h[1],
        ];

        // Measurement residual.
        let residual = t_ts_delta - self.slope * h[0] - self.offset;

        // Noise update only in the stable state, residual clipped by the
        // observed frame period.
        let stable = hypothesis == BandwidthUsage::Normal;
        let max_residual = 3.0 * self.var_noise.sqrt();
        if residual.abs() < max_residual {
            self.update_noise(residual, min_frame_period, stable);
        } else {
            self.update_noise(max_residual.copysign(residual), min_frame_period, stable);
        }

        // Gain.
        let denom = self.var_noise + (h[0] * eh[0] + h[1] * eh[1]);
        let k = [eh[0] / denom, eh[1] / denom];

        // Covariance update: E = (I - K h') E.
        let ikh = [
            [1.0 - k[0] * h[0], -k[0] * h[1]],
            [-k[1] * h[0], 1.0 - k[1] * h[1]],
        ];
        let e00 = self.e[0][0];
        let e01 = self.e[0][1];
        self.e[0][0] = e00 * ikh[0][0] + self.e[1][0] * ikh[0][1];
        self.e[0][1] = e01 * ikh[0][0] + self.e[1][1] * ikh[0][1];
        self.e[1][0] = e00 * ikh[1][0] + self.e[1][0] * ikh[1][1];
        self.e[1][1] = e01 * ikh[1][0] + self.e[1][1] * ikh[1][1];

        // State update.
        self.slope += k[0] * residual;
        self.prev_offset = self.offset;
        self.offset += k[1] * residual;
    }

    fn update_min_frame_period(&mut self, ts_delta: f64) -> f64 {
        self.ts_delta_hist.push_back(ts_delta);
        if self.ts_delta_hist.len() > FRAME_PERIOD_HISTORY {
            self.ts_delta_hist.pop_front();
        }
        self.ts_delta_hist
            .iter()
            .copied()
            .fold(ts_delta, f64::min)
    }

    fn update_noise(&mut self, residual: f64, ts_delta: f64, stable: bool) {
        if !stable {
            return;
        }

        // Slow filter, scaled by how often we get samples.
        let alpha: f64 = if self.num_of_deltas > 300 { 0.002 } else { 0.01 };
        let beta = (1.0 - alpha).powf(ts_delta * 30.0 / 1000.0);

        self.avg_noise = beta * self.avg_noise + (1.0 - beta) * residual;
        self.var_noise =
            beta * self.var_noise + (1.0 - beta) * (self.avg_noise - residual).powi(2);

        if self.var_noise < 1.0 {
            self.var_noise = 1.0;
        }
    }
}

/// Turns the filtered offset into a bandwidth usage hypothesis with an
/// adaptive threshold.
#[derive(Debug)]
struct OveruseDetector {
    k_up: f64,
    k_down: f64,
    threshold: f64,
    last_update_ms: Option<u64>,
    prev_offset: f64,
    time_over_using: f64,
    overuse_counter: u32,
    hypothesis: BandwidthUsage,
}

impl OveruseDetector {
    fn new() -> Self {
        OveruseDetector {
            k_up: 0.0087,
            k_down: 0.039,
            threshold: 12.5,
            last_update_ms: None,
            prev_offset: 0.0,
            time_over_using: -1.0,
            overuse_counter: 0,
            hypothesis: BandwidthUsage::Normal,
        }
    }

    fn state(&self) -> BandwidthUsage {
        self.hypothesis
    }

    fn detect(&mut self, offset: f64, ts_delta: f64, num_of_deltas: u32, now_ms: u64) {
        if num_of_deltas < 2 {
            self.hypothesis = BandwidthUsage::Normal;
            return;
        }

        let t = (num_of_deltas.min(60) as f64) * offset;

        if t > self.threshold {
            if self.time_over_using < 0.0 {
                self.time_over_using = ts_delta / 2.0;
            } else {
                self.time_over_using += ts_delta;
            }
            self.overuse_counter += 1;

            if self.time_over_using > OVERUSING_TIME_THRESHOLD_MS
                && self.overuse_counter > 1
                && offset >= self.prev_offset
            {
                self.time_over_using = 0.0;
                self.overuse_counter = 0;
                self.hypothesis = BandwidthUsage::Overusing;
            }
        } else if t < -self.threshold {
            self.time_over_using = -1.0;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Underusing;
        } else {
            self.time_over_using = -1.0;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Normal;
        }

        self.prev_offset = offset;
        self.update_threshold(t, now_ms);
    }

    fn update_threshold(&mut self, modified_offset: f64, now_ms: u64) {
        let Some(last) = self.last_update_ms else {
            self.last_update_ms = Some(now_ms);
            return;
        };

        // Very large spikes do not move the threshold.
        if (modified_offset.abs() - self.threshold) > 15.0 {
            self.last_update_ms = Some(now_ms);
            return;
        }

        let k = if modified_offset.abs() < self.threshold {
            self.k_down
        } else {
            self.k_up
        };

        let dt = ((now_ms - last) as f64).min(100.0);
        self.threshold += k * (modified_offset.abs() - self.threshold) * dt;
        self.threshold = self.threshold.clamp(6.0, 600.0);

        self.last_update_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // 6.18 fixed point: ms -> abs-send-time units.
    fn abs_time(ms: u64) -> u32 {
        (((ms as f64) / 1000.0 * (1 << 18) as f64) as u32) & 0xff_ffff
    }

    #[test]
    fn estimates_from_steady_stream() {
        let mut server = RembServer::new();
        server.set_ssrcs(vec![100]);
        let start = Instant::now();

        // 500kbit/s: 625 bytes every 10ms.
        let mut remb = None;
        for i in 0..200u64 {
            let now = start + Duration::from_millis(i * 10);
            server.incoming_packet(now, abs_time(i * 10), 625);

            if let Some(deadline) = server.poll_timeout() {
                if now >= deadline {
                    if let Some(r) = server.handle_timeout(now) {
                        remb = Some(r);
                    }
                }
            }
        }

        let remb = remb.expect("an estimate was emitted");
        assert_eq!(remb.ssrcs, vec![100]);
        assert!(remb.bitrate > 100_000.0, "bitrate {}", remb.bitrate);
    }

    #[test]
    fn max_bitrate_caps_the_estimate() {
        let mut server = RembServer::new();
        server.set_max_bitrate(200_000);
        let start = Instant::now();

        let mut last = None;
        for i in 0..300u64 {
            let now = start + Duration::from_millis(i * 5);
            server.incoming_packet(now, abs_time(i * 5), 1200);
            if let Some(deadline) = server.poll_timeout() {
                if now >= deadline {
                    if let Some(r) = server.handle_timeout(now) {
                        last = Some(r);
                    }
                }
            }
        }

        let last = last.unwrap();
        assert!(last.bitrate <= 200_000.0, "bitrate {}", last.bitrate);
    }

    #[test]
    fn detector_flags_growing_queue_delay() {
        let mut estimator = OveruseEstimator::new();
        let mut detector = OveruseDetector::new();

        // Send groups 10ms apart arriving with growing delay.
        for i in 0..100u32 {
            let arrival_delta = 10.0 + (i as f64) * 2.0;
            estimator.update(arrival_delta, 10.0, 0, detector.state());
            detector.detect(
                estimator.offset(),
                10.0,
                estimator.num_of_deltas(),
                (i as u64) * 10,
            );
        }

        assert_eq!(detector.state(), BandwidthUsage::Overusing);
    }

    #[test]
    fn detector_stays_normal_on_even_arrivals() {
        let mut estimator = OveruseEstimator::new();
        let mut detector = OveruseDetector::new();

        for i in 0..100u32 {
            estimator.update(10.0, 10.0, 0, detector.state());
            detector.detect(
                estimator.offset(),
                10.0,
                estimator.num_of_deltas(),
                (i as u64) * 10,
            );
        }

        assert_eq!(detector.state(), BandwidthUsage::Normal);
    }

    #[test]
    fn abs_send_time_unwraps_over_rollover() {
        let mut server = RembServer::new();

        let a = server.unwrap_send_time_ms(0xff_fff0);
        let b = server.unwrap_send_time_ms(0x00_0010);

        assert!(b > a, "rollover went backwards: {} -> {}", a, b);
    }
}
