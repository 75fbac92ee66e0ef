use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::rate::RateCalculator;
use crate::rtp::{extend_u16, PacketStatus, RtpPacket, TransportFeedback};

use super::Pacer;

// Minimum spacing of available-bitrate events.
const AVAILABLE_BITRATE_EVENT_INTERVAL: Duration = Duration::from_secs(2);

// A drop below this ratio of the previous estimate is notified at once.
const FAST_DECREASE_RATIO: f64 = 0.75;

// Loss above this fraction pulls the estimate down.
const LOSS_THRESHOLD: f64 = 0.10;

// Careful probing factor when feedback reports clean delivery.
const INCREASE_FACTOR: f64 = 1.05;

// Sent-packet records older than this are dropped.
const SENT_HISTORY: Duration = Duration::from_secs(2);

/// Send-side congestion control.
///
/// Owns the pacer, assigns transport-wide sequence numbers, digests
/// transport feedback and REMB into a smoothed available-bitrate signal
/// and decides when the transport should be notified of changes.
#[derive(Debug)]
pub struct TccClient {
    pacer: Pacer,
    initial_available_bitrate: u32,
    available_bitrate: u32,
    remb_bitrate: Option<u32>,
    last_event_at: Option<Instant>,
    first_event_sent: bool,
    next_wide_seq: u16,
    last_acked_seq: Option<u64>,
    /// Widened wide-seq to (size, sent at).
    sent: BTreeMap<u64, (usize, Instant)>,
    last_sent_ext: Option<u64>,
    acked_rate: RateCalculator,
}

impl TccClient {
    pub fn new(initial_available_bitrate: u32) -> TccClient {
        TccClient {
            pacer: Pacer::new(initial_available_bitrate as u64),
            initial_available_bitrate,
            available_bitrate: initial_available_bitrate,
            remb_bitrate: None,
            last_event_at: None,
            first_event_sent: false,
            next_wide_seq: 0,
            last_acked_seq: None,
            sent: BTreeMap::new(),
            last_sent_ext: None,
            acked_rate: RateCalculator::default(),
        }
    }

    /// Allocate the next transport-wide sequence number.
    pub fn next_wide_seq(&mut self) -> u16 {
        let seq = self.next_wide_seq;
        self.next_wide_seq = self.next_wide_seq.wrapping_add(1);
        seq
    }

    /// Queue a packet into the pacer.
    pub fn insert_packet(&mut self, packet: RtpPacket) {
        self.pacer.enqueue(packet);
    }

    /// Take the next packet the pacer releases.
    pub fn poll_packet(&mut self, now: Instant) -> Option<RtpPacket> {
        self.pacer.poll_packet(now)
    }

    /// Record a packet as put on the wire.
    pub fn packet_sent(&mut self, now: Instant, wide_seq: u16, size: usize) {
        let ext = extend_u16(self.last_sent_ext, wide_seq);
        self.last_sent_ext = Some(ext);
        self.sent.insert(ext, (size, now));

        // Trim history.
        let cutoff = now.checked_sub(SENT_HISTORY);
        if let Some(cutoff) = cutoff {
            self.sent.retain(|_, (_, at)| *at >= cutoff);
        }
    }

    /// Feed a REMB estimate from the remote receiver.
    ///
    /// Returns the new available bitrate when an event is due.
    pub fn receive_estimated_bitrate(&mut self, now: Instant, bitrate: u32) -> Option<u32> {
        self.remb_bitrate = Some(bitrate);

        let updated = self.available_bitrate.min(bitrate).max(1);
        self.update_available(now, updated)
    }

    /// Digest a transport-wide feedback packet.
    pub fn receive_transport_feedback(
        &mut self,
        now: Instant,
        feedback: &TransportFeedback,
    ) -> Option<u32> {
        let mut received = 0u32;
        let mut lost = 0u32;

        let anchor = self.last_acked_seq.or(self.last_sent_ext);

        for (seq16, status, _) in feedback.iter() {
            let ext = extend_u16(anchor, seq16);

            if status == PacketStatus::NotReceived {
                lost += 1;
                continue;
            }

            received += 1;
            self.last_acked_seq = Some(ext);

            if let Some((size, _)) = self.sent.remove(&ext) {
                self.acked_rate.update(size, now);
            }
        }

        if received == 0 {
            return None;
        }

        let total = received + lost;
        let loss = lost as f64 / total as f64;
        let acked_bps = self.acked_rate.rate(now) as f64;

        let current = self.available_bitrate as f64;
        let updated = if loss > LOSS_THRESHOLD {
            // Back off proportionally to the observed loss.
            current * (1.0 - 0.5 * loss)
        } else {
            // Clean interval: probe upward, bounded by what is provably
            // getting through (with headroom) and by REMB.
            let ceiling = (acked_bps * 2.0).max(self.initial_available_bitrate as f64);
            (current * INCREASE_FACTOR).min(ceiling)
        };

        let updated = match self.remb_bitrate {
            Some(remb) => updated.min(remb as f64),
            None => updated,
        };

        trace!(
            "Transport feedback [loss:{:.2}, acked:{}, available:{}]",
            loss,
            acked_bps,
            updated as u32
        );

        self.update_available(now, (updated as u32).max(1))
    }

    /// Current estimate.
    pub fn available_bitrate(&self) -> u32 {
        self.available_bitrate
    }

    /// The pacer's next process deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pacer.poll_timeout()
    }

    /// Drive the pacer.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.pacer.handle_timeout(now);
    }

    // Event cadence: first valid estimate, two-second interval, or a
    // fast decrease.
    fn update_available(&mut self, now: Instant, updated: u32) -> Option<u32> {
        let previous = self.available_bitrate;
        self.available_bitrate = updated;
        self.pacer.set_pacing_rate(updated as u64);

        let mut notify = false;

        if !self.first_event_sent {
            notify = true;
        } else if let Some(at) = self.last_event_at {
            if now.duration_since(at) >= AVAILABLE_BITRATE_EVENT_INTERVAL {
                notify = true;
            } else if (updated as f64) < previous as f64 * FAST_DECREASE_RATIO {
                debug!(
                    "High BWE decrease detected [before:{}, now:{}]",
                    previous, updated
                );
                notify = true;
            }
        } else {
            notify = true;
        }

        if notify {
            self.first_event_sent = true;
            self.last_event_at = Some(now);
            Some(updated)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtp::{ExtensionMap, RtpHeader, TransportFeedback};

    fn feedback(pairs: &[(u16, u64)], lost: &[u16]) -> TransportFeedback {
        let mut fb = TransportFeedback::new();
        // Pre-base.
        let (first_seq, first_ts) = pairs[0];
        fb.add_packet(first_seq.wrapping_sub(1), first_ts, 1200);
        for (seq, ts) in pairs {
            if lost.contains(seq) {
                continue;
            }
            assert!(fb.add_packet(*seq, *ts, 1200));
        }
        fb.finalize();
        fb
    }

    fn sent_packets(client: &mut TccClient, now: Instant, count: u16) {
        for i in 0..count {
            client.packet_sent(now + Duration::from_millis(i as u64), i, 1200);
        }
    }

    #[test]
    fn first_feedback_notifies() {
        let now = Instant::now();
        let mut client = TccClient::new(600_000);
        sent_packets(&mut client, now, 10);

        let pairs: Vec<(u16, u64)> = (1..10u16).map(|i| (i, 1000 + i as u64)).collect();
        let fb = feedback(&pairs, &[]);

        let event = client.receive_transport_feedback(now + Duration::from_millis(50), &fb);
        assert!(event.is_some());
    }

    #[test]
    fn events_are_rate_limited() {
        let now = Instant::now();
        let mut client = TccClient::new(600_000);
        sent_packets(&mut client, now, 40);

        let pairs: Vec<(u16, u64)> = (1..10u16).map(|i| (i, 1000 + i as u64)).collect();
        let fb = feedback(&pairs, &[]);
        assert!(client
            .receive_transport_feedback(now + Duration::from_millis(20), &fb)
            .is_some());

        // A similar feedback right after: no event.
        let pairs: Vec<(u16, u64)> = (10..20u16).map(|i| (i, 1000 + i as u64)).collect();
        let fb = feedback(&pairs, &[]);
        assert!(client
            .receive_transport_feedback(now + Duration::from_millis(40), &fb)
            .is_none());

        // Two seconds later: event again.
        let pairs: Vec<(u16, u64)> = (20..30u16).map(|i| (i, 4000 + i as u64)).collect();
        let fb = feedback(&pairs, &[]);
        assert!(client
            .receive_transport_feedback(now + Duration::from_millis(2100), &fb)
            .is_some());
    }

    #[test]
    fn heavy_loss_decreases_estimate() {
        let now = Instant::now();
        let mut client = TccClient::new(600_000);
        sent_packets(&mut client, now, 40);

        let before = client.available_bitrate();

        // Half the packets lost.
        let pairs: Vec<(u16, u64)> = (1..21u16).map(|i| (i, 1000 + i as u64)).collect();
        let lost: Vec<u16> = (1..21u16).filter(|i| i % 2 == 0).collect();
        let fb = feedback(&pairs, &lost);

        client.receive_transport_feedback(now + Duration::from_millis(50), &fb);
        assert!(client.available_bitrate() < before);
    }

    #[test]
    fn remb_caps_the_estimate() {
        let now = Instant::now();
        let mut client = TccClient::new(600_000);

        let event = client.receive_estimated_bitrate(now, 300_000);
        assert_eq!(event, Some(300_000));
        assert_eq!(client.available_bitrate(), 300_000);
    }

    #[test]
    fn fast_decrease_bypasses_rate_limit() {
        let now = Instant::now();
        let mut client = TccClient::new(600_000);

        assert!(client.receive_estimated_bitrate(now, 600_000).is_some());

        // Crash to a quarter shortly after: notified despite interval.
        let event = client.receive_estimated_bitrate(now + Duration::from_millis(100), 100_000);
        assert_eq!(event, Some(100_000));
    }

    #[test]
    fn pacer_round_trip() {
        let now = Instant::now();
        let mut client = TccClient::new(1_000_000);

        let header = RtpHeader::default();
        let mut buf = vec![0; 64];
        let n = header.write_to(&mut buf, &ExtensionMap::empty());
        buf.truncate(n);
        buf.extend_from_slice(&[0; 100]);
        let packet = RtpPacket::parse(&buf, &ExtensionMap::empty()).unwrap();

        client.insert_packet(packet.clone());
        let out = client.poll_packet(now).unwrap();
        assert_eq!(out.data(), packet.data());
    }
}
