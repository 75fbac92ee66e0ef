use std::time::{Duration, Instant};

use crate::rate::RtpDataCounter;
use crate::rtp::{Nack, ReceptionReport, RtpPacket, SenderInfo, SenderReport, SeqNo, Ssrc};
use crate::util::{calculate_rtt_ms, ntp_64, ntp_now};

use super::rtx_cache::RtxCache;

// Minimum spacing of sender reports per stream.
const SR_INTERVAL: Duration = Duration::from_secs(2);

/// State for one outgoing RTP stream (one SSRC of a consumer).
///
/// Counts sent traffic, keeps the retransmission cache, produces sender
/// reports, and digests incoming reception reports into RTT and a
/// send-side score.
#[derive(Debug)]
pub struct RtpStreamSend {
    ssrc: Ssrc,
    clock_rate: u32,
    counter: RtpDataCounter,
    rtx_cache: RtxCache,
    last_sent: Option<LastSent>,
    last_seq: Option<SeqNo>,
    last_sr_at: Option<Instant>,
    rtt_ms: Option<f32>,
    fraction_lost: u8,
    score: u8,
}

#[derive(Debug, Clone, Copy)]
struct LastSent {
    rtp_time: u32,
    at: Instant,
}

impl RtpStreamSend {
    pub fn new(ssrc: Ssrc, clock_rate: u32) -> Self {
        RtpStreamSend {
            ssrc,
            clock_rate,
            counter: RtpDataCounter::default(),
            rtx_cache: RtxCache::new(),
            last_sent: None,
            last_seq: None,
            last_sr_at: None,
            rtt_ms: None,
            fraction_lost: 0,
            score: 10,
        }
    }

    /// The egress SSRC.
    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// Record one sent packet, caching a copy for retransmission.
    pub fn record_sent(&mut self, now: Instant, seq_no: SeqNo, packet: &RtpPacket) {
        self.counter.update(packet.len(), now);
        self.last_sent = Some(LastSent {
            rtp_time: packet.timestamp(),
            at: now,
        });
        if self.last_seq.map(|l| seq_no > l).unwrap_or(true) {
            self.last_seq = Some(seq_no);
        }
        self.rtx_cache.cache_sent_packet(seq_no, packet.clone(), now);
    }

    /// Current outgoing bitrate in bits per second.
    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.counter.bitrate(now)
    }

    /// Total packets sent.
    pub fn packets(&self) -> u64 {
        self.counter.packets()
    }

    /// Total bytes sent.
    pub fn bytes(&self) -> u64 {
        self.counter.bytes()
    }

    /// Whether a sender report is due at `now`.
    pub fn needs_sender_report(&self, now: Instant) -> bool {
        if self.last_sent.is_none() {
            return false;
        }
        match self.last_sr_at {
            None => true,
            Some(at) => now.duration_since(at) >= SR_INTERVAL,
        }
    }

    /// Produce a sender report for this stream.
    pub fn sender_report(&mut self, now: Instant) -> Option<SenderReport> {
        let last = self.last_sent?;

        self.last_sr_at = Some(now);

        // Project the RTP time of the last sent packet forward to now.
        let elapsed = now.duration_since(last.at);
        let rtp_now = last
            .rtp_time
            .wrapping_add((elapsed.as_secs_f64() * self.clock_rate as f64) as u32);

        Some(SenderReport {
            sender_info: SenderInfo {
                ssrc: self.ssrc,
                ntp_time: ntp_64(now),
                rtp_time: rtp_now,
                sender_packet_count: self.counter.packets() as u32,
                sender_octet_count: self.counter.bytes() as u32,
            },
            reports: Default::default(),
        })
    }

    /// Digest a reception report from the remote receiver.
    pub fn receive_reception_report(&mut self, now: Instant, report: &ReceptionReport) {
        self.fraction_lost = report.fraction_lost;

        if report.last_sr_time != 0 {
            self.rtt_ms = calculate_rtt_ms(ntp_now(now), report.last_sr_time, report.last_sr_delay);
        }

        // Send-side health from what the remote reports back.
        let delivered = 1.0 - self.fraction_lost as f32 / 256.0;
        self.score = (10.0 * delivered + 0.5) as u8;
    }

    /// Resolve a NACK into cached packets to retransmit.
    pub fn receive_nack(&mut self, nack: &Nack) -> Vec<RtpPacket> {
        let Some(extend_from) = self.last_seq else {
            return vec![];
        };

        let mut out = vec![];

        for entry in nack.reports.iter() {
            // The 16 bit pids widen against the newest sent seq.
            for seq in entry.into_iter(extend_from) {
                if let Some(packet) = self.rtx_cache.get(seq) {
                    out.push(packet.clone());
                } else {
                    debug!("NACKed packet not in RTX cache: {}", seq);
                }
            }
        }

        out
    }

    /// Latest RTT estimate in milliseconds.
    pub fn rtt_ms(&self) -> Option<f32> {
        self.rtt_ms
    }

    /// Fraction lost last reported by the remote, 0..=255.
    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    /// Send-side score, 0..=10.
    pub fn score(&self) -> u8 {
        self.score
    }
}
