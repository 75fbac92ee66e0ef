use std::time::{Duration, Instant};

use crate::rate::RtpDataCounter;
use crate::rtp::{Nack, ReceptionReport, RtpPacket, SenderInfo, SeqNo, Ssrc};

use super::register::ReceiverRegister;

// Score smoothing factor. Higher reacts faster to loss bursts.
const SCORE_ALPHA: f32 = 0.25;

/// State for one incoming RTP stream (one SSRC of a producer).
///
/// Tracks sequence continuity, loss, jitter and throughput, produces
/// reception report blocks, consumes sender reports, and maintains a
/// 0..=10 delivery score.
#[derive(Debug)]
pub struct RtpStreamRecv {
    ssrc: Ssrc,
    clock_rate: u32,
    register: Option<ReceiverRegister>,
    last_seq: Option<SeqNo>,
    counter: RtpDataCounter,
    score: f32,
    last_sr: Option<LastSenderReport>,
    last_activity: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct LastSenderReport {
    ntp_mid32: u32,
    received_at: Instant,
}

impl RtpStreamRecv {
    pub fn new(ssrc: Ssrc, clock_rate: u32) -> Self {
        RtpStreamRecv {
            ssrc,
            clock_rate,
            register: None,
            last_seq: None,
            counter: RtpDataCounter::default(),
            score: 10.0,
            last_sr: None,
            last_activity: None,
        }
    }

    /// The wire SSRC this stream tracks.
    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// Feed one received packet. Updates sequence, jitter and rate state.
    pub fn receive(&mut self, now: Instant, packet: &RtpPacket) {
        let seq_no = packet.header().sequence_number(self.last_seq);
        self.last_seq = Some(seq_no);

        let register = self
            .register
            .get_or_insert_with(|| ReceiverRegister::new(seq_no));

        register.update_seq(seq_no);
        register.update_time(now, packet.timestamp(), self.clock_rate);

        self.counter.update(packet.len(), now);
        self.last_activity = Some(now);
    }

    /// Highest extended sequence seen.
    pub fn max_seq(&self) -> Option<SeqNo> {
        self.register.as_ref().map(|r| r.max_seq())
    }

    /// Current incoming bitrate in bits per second.
    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.counter.bitrate(now)
    }

    /// Total bytes received.
    pub fn bytes(&self) -> u64 {
        self.counter.bytes()
    }

    /// Total packets received.
    pub fn packets(&self) -> u64 {
        self.counter.packets()
    }

    /// Consume a sender report for this stream.
    pub fn receive_sender_report(&mut self, now: Instant, info: &SenderInfo) {
        self.last_sr = Some(LastSenderReport {
            ntp_mid32: info.ntp_mid32(),
            received_at: now,
        });
    }

    /// Whether a NACK should be produced.
    pub fn has_nack_report(&self) -> bool {
        self.register
            .as_ref()
            .map(|r| r.has_nack_report())
            .unwrap_or(false)
    }

    /// NACKs for missing packets, addressed to this stream's SSRC.
    pub fn nack_reports(&mut self) -> Vec<Nack> {
        let Some(register) = self.register.as_mut() else {
            return vec![];
        };

        let mut nacks = register.nack_reports();
        for nack in &mut nacks {
            nack.ssrc = self.ssrc;
        }
        nacks
    }

    /// Produce a reception report block and refresh the stream score.
    ///
    /// Fraction lost covers the interval since the previous call, which
    /// is what drives the score blend.
    pub fn reception_report(&mut self, now: Instant) -> Option<ReceptionReport> {
        let register = self.register.as_mut()?;

        let mut report = register.reception_report();
        report.ssrc = self.ssrc;

        if let Some(sr) = self.last_sr {
            report.last_sr_time = sr.ntp_mid32;
            let delay = now.duration_since(sr.received_at);
            report.last_sr_delay = (delay.as_secs_f64() * 65_536.0) as u32;
        }

        self.update_score(now, report.fraction_lost, report.jitter);

        Some(report)
    }

    // Blend delivery ratio and a jitter penalty into the running score.
    fn update_score(&mut self, now: Instant, fraction_lost: u8, jitter: u32) {
        let instant_score = if self.is_stale(now) {
            0.0
        } else {
            let delivered = 1.0 - fraction_lost as f32 / 256.0;
            let jitter_ms = jitter as f32 * 1000.0 / self.clock_rate as f32;
            let penalty = (jitter_ms / 20.0).min(3.0);
            (10.0 * delivered - penalty).max(0.0)
        };

        self.score = (1.0 - SCORE_ALPHA) * self.score + SCORE_ALPHA * instant_score;
    }

    fn is_stale(&self, now: Instant) -> bool {
        match self.last_activity {
            Some(at) => now.duration_since(at) > Duration::from_secs(2),
            None => true,
        }
    }

    /// Delivery score, 0 (dead) to 10 (perfect).
    pub fn score(&self) -> u8 {
        (self.score + 0.5) as u8
    }

}
