use std::time::Instant;

use crate::rtp::{Nack, NackEntry, ReceptionReport, ReportList, SeqNo};

const MAX_DROPOUT: u64 = 3000;
const MAX_MISORDER: u64 = 100;
const MIN_SEQUENTIAL: u64 = 2;
const MISORDER_DELAY: u64 = 1;

/// The max number of NACKs sent for a single missing packet.
const MAX_NACKS: u8 = 5;

/// Receive-side packet accounting for one SSRC.
///
/// Follows RFC 3550 appendix A.3: probation until two sequential packets,
/// resync on large jumps, extended max sequence, expected/received deltas
/// for fraction lost, and interarrival jitter. On top of that it keeps a
/// bitmap of received packets to produce NACK reports.
#[derive(Debug)]
pub struct ReceiverRegister {
    /// Bitmap of received status, indexed by seq % len.
    status: Vec<PacketStatus>,

    /// First sequence number seen after probation.
    base_seq: SeqNo,

    /// Highest sequence number seen.
    max_seq: SeqNo,

    /// Set on a suspicious jump. Two sequential packets there resync.
    bad_seq: Option<SeqNo>,

    /// Sequential packets remaining until the source is valid.
    probation: u64,

    /// Unique packets received.
    received: i64,

    /// Snapshots for interval (fraction lost) calculation.
    expected_prior: i64,
    received_prior: i64,

    /// Interarrival jitter in clock-rate units.
    jitter: f32,

    /// NACKs are generated from this point forward.
    nack_check_from: SeqNo,

    /// Previous packet arrival for jitter.
    prior_arrival: Option<TimePoint>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PacketStatus {
    received: bool,
    nack_count: u8,
}

impl PacketStatus {
    fn should_nack(&self) -> bool {
        !self.received && self.nack_count < MAX_NACKS
    }
}

impl ReceiverRegister {
    pub fn new(base_seq: SeqNo) -> Self {
        ReceiverRegister {
            status: vec![PacketStatus::default(); MAX_DROPOUT as usize],
            base_seq,
            // First update_seq must see the initial packet as sequential.
            max_seq: base_seq.wrapping_sub(1).into(),
            bad_seq: None,
            probation: MIN_SEQUENTIAL,
            received: 1,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            nack_check_from: base_seq,
            prior_arrival: None,
        }
    }

    fn init_seq(&mut self, seq: SeqNo) {
        self.base_seq = seq;
        self.max_seq = seq;
        self.bad_seq = None;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
        self.jitter = 0.0;
        self.status.fill(PacketStatus::default());
        self.nack_check_from = seq;
        self.prior_arrival = None;
        self.record(seq);
    }

    /// Track a received sequence number.
    pub fn update_seq(&mut self, seq: SeqNo) {
        if self.probation > 0 {
            // Not valid until MIN_SEQUENTIAL sequential packets arrive.
            if *seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init_seq(seq);
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
            return;
        }

        if *self.max_seq < *seq {
            // In order (possibly with a gap).
            let delta = *seq - *self.max_seq;

            if delta < MAX_DROPOUT {
                self.max_seq = seq;
                self.bad_seq = None;
                self.record(seq);
            } else {
                self.maybe_seq_jump(seq);
            }
        } else {
            // Duplicate or reordered.
            let delta = *self.max_seq - *seq;

            if delta < MAX_MISORDER {
                self.record(seq);
            } else {
                self.maybe_seq_jump(seq);
            }
        }
    }

    fn maybe_seq_jump(&mut self, seq: SeqNo) {
        if self.bad_seq == Some(seq) {
            // Two sequential packets after the jump. Assume the sender
            // restarted and resync.
            self.init_seq(seq);
        } else {
            self.bad_seq = Some((*seq + 1).into());
        }
    }

    fn record(&mut self, seq: SeqNo) {
        // Already reported missing via NACK past retry, don't resurrect.
        if *seq < *self.nack_check_from {
            return;
        }

        let pos = self.index_of(*seq);
        let was_set = self.status[pos].received;
        self.status[pos].received = true;

        if !was_set {
            self.received += 1;
        }

        self.advance_nack_check();
    }

    // Move nack_check_from forward over consecutive received packets, or
    // force it forward when it trails too far.
    fn advance_nack_check(&mut self) {
        let check_up_to = (*self.max_seq).saturating_sub(MISORDER_DELAY);

        let consecutive_until = (*self.nack_check_from..=check_up_to)
            .take_while(|seq| self.status[self.index_of(*seq)].received)
            .last();

        let new_from = match consecutive_until {
            Some(new) if new != *self.nack_check_from => Some(new),
            _ => {
                if check_up_to.saturating_sub(*self.nack_check_from) > MAX_MISORDER {
                    Some(check_up_to - MAX_MISORDER)
                } else {
                    None
                }
            }
        };

        if let Some(new_from) = new_from {
            for seq in *self.nack_check_from..new_from {
                let idx = self.index_of(seq);
                let status = self.status[idx];
                if status.nack_count > 0 && !status.received {
                    debug!("Seq no was nacked but never arrived: {}", seq);
                }
                self.status[idx] = PacketStatus::default();
            }
            self.nack_check_from = new_from.into();
        }
    }

    /// Track packet arrival time for jitter, RFC 3550 A.8.
    ///
    /// Multiple packets can carry the same RTP timestamp (one video frame
    /// split over packets); only the first is used.
    pub fn update_time(&mut self, arrival: Instant, rtp_time: u32, clock_rate: u32) {
        let tp = TimePoint {
            arrival,
            rtp_time,
            clock_rate,
        };

        if let Some(prior) = self.prior_arrival {
            if prior.rtp_time == tp.rtp_time {
                return;
            }

            let d = tp.delta(prior);
            self.jitter += (1.0 / 16.0) * (d - self.jitter);
        }

        self.prior_arrival = Some(tp);
    }

    pub fn max_seq(&self) -> SeqNo {
        self.max_seq
    }

    /// Jitter expressed in clock-rate units.
    pub fn jitter(&self) -> f32 {
        self.jitter
    }

    /// Whether any packet in the checked window warrants a NACK.
    pub fn has_nack_report(&self) -> bool {
        if self.probation > 0 {
            return false;
        }

        let start = *self.nack_check_from;
        let stop = (*self.max_seq).saturating_sub(MISORDER_DELAY);

        if stop < start {
            return false;
        }

        (start..stop).any(|seq| self.status[self.index_of(seq)].should_nack())
    }

    /// Build NACKs for the missing packets in the checked window.
    pub fn nack_reports(&mut self) -> Vec<Nack> {
        if self.probation > 0 {
            return vec![];
        }

        let start = *self.nack_check_from;
        // A grace window so light reordering does not trigger NACKs.
        let stop = (*self.max_seq).saturating_sub(MISORDER_DELAY);

        if stop < start {
            return vec![];
        }

        let mut entries = vec![];
        let mut first_missing: Option<u64> = None;
        let mut bitmask: u16 = 0;

        for seq in start..stop {
            let idx = self.index_of(seq);
            let should_nack = self.status[idx].should_nack();

            if let Some(first) = first_missing {
                if should_nack {
                    let bit = (seq - (first + 1)) as u16;
                    bitmask |= 1 << bit;
                    self.status[idx].nack_count += 1;
                }

                if seq - first == 16 {
                    entries.push(NackEntry {
                        pid: (first % 65_536) as u16,
                        blp: bitmask,
                    });
                    bitmask = 0;
                    first_missing = None;
                }
            } else if should_nack {
                self.status[idx].nack_count += 1;
                first_missing = Some(seq);
            }
        }

        if let Some(first) = first_missing {
            entries.push(NackEntry {
                pid: (first % 65_536) as u16,
                blp: bitmask,
            });
        }

        ReportList::lists_from_iter(entries)
            .into_iter()
            .map(|reports| Nack {
                sender_ssrc: 0.into(),
                ssrc: 0.into(), // set when sending
                reports,
            })
            .collect()
    }

    /// Produce a reception report block.
    ///
    /// Mutates interval snapshots: fraction lost covers the span since the
    /// previous call.
    pub fn reception_report(&mut self) -> ReceptionReport {
        ReceptionReport {
            ssrc: 0.into(),
            fraction_lost: self.fraction_lost(),
            packets_lost: self.packets_lost(),
            max_seq: (*self.max_seq % (u32::MAX as u64 + 1)) as u32,
            jitter: self.jitter as u32,
            last_sr_time: 0,
            last_sr_delay: 0,
        }
    }

    /// Fraction of packets lost since the last call, as 0..=255.
    pub fn fraction_lost(&mut self) -> u8 {
        let expected = self.expected();
        let expected_interval = expected - self.expected_prior;
        self.expected_prior = expected;

        let received_interval = self.received - self.received_prior;
        self.received_prior = self.received;

        let lost_interval = expected_interval - received_interval;

        if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval) as u8
        }
    }

    /// Cumulative lost, clamped to the 24 bit wire field.
    pub fn packets_lost(&self) -> u32 {
        let lost = self.expected() - self.received;
        if lost > 0x7f_ffff {
            0x7f_ffff
        } else if lost < 0 {
            // Negative loss (duplicates) clamps to the most negative.
            0x80_0000
        } else {
            lost as u32
        }
    }

    fn expected(&self) -> i64 {
        *self.max_seq as i64 - *self.base_seq as i64 + 1
    }

    fn index_of(&self, seq: u64) -> usize {
        (seq % self.status.len() as u64) as usize
    }
}

// Arrival bookkeeping for jitter.
#[derive(Debug, Clone, Copy)]
struct TimePoint {
    arrival: Instant,
    rtp_time: u32,
    clock_rate: u32,
}

impl TimePoint {
    fn delta(&self, other: TimePoint) -> f32 {
        // Jitter accumulates in clock-rate units. Microseconds keep the
        // resolution for small frame intervals.
        let rtp_dur = ((self.rtp_time as f32 - other.rtp_time as f32) * 1_000_000.0)
            / self.clock_rate as f32;

        let wall_dur = (self.arrival - other.arrival).as_micros() as f32;

        (wall_dur - rtp_dur).abs() * self.clock_rate as f32 / 1_000_000.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn in_order_stream() {
        let mut reg = ReceiverRegister::new(14.into());
        reg.update_seq(14.into());
        assert_eq!(reg.probation, 1);
        reg.update_seq(15.into());
        assert_eq!(reg.probation, 0);
        reg.update_seq(16.into());
        reg.update_seq(17.into());
        assert_eq!(reg.max_seq, 17.into());
    }

    #[test]
    fn jump_within_dropout_tolerance() {
        let mut reg = ReceiverRegister::new(14.into());
        reg.update_seq(14.into());
        reg.update_seq(15.into());

        reg.update_seq(2500.into());
        assert!(reg.bad_seq.is_none());
        reg.update_seq(2501.into());
        assert_eq!(reg.max_seq, 2501.into());
    }

    #[test]
    fn jump_beyond_dropout_resyncs() {
        let mut reg = ReceiverRegister::new(14.into());
        reg.update_seq(14.into());
        reg.update_seq(15.into());

        reg.update_seq(3500.into());
        assert_eq!(reg.max_seq, 15.into()); // not yet
        assert!(reg.bad_seq.is_some());
        reg.update_seq(3501.into());
        assert_eq!(reg.max_seq, 3501.into()); // resynced
        assert!(reg.bad_seq.is_none());
    }

    #[test]
    fn old_packet_within_tolerance() {
        let mut reg = ReceiverRegister::new(140.into());
        reg.update_seq(140.into());
        reg.update_seq(141.into());

        reg.update_seq(120.into());
        assert_eq!(reg.max_seq, 141.into());
        assert!(reg.bad_seq.is_none());
    }

    #[test]
    fn old_packet_outside_tolerance_resyncs() {
        let mut reg = ReceiverRegister::new(140.into());
        reg.update_seq(140.into());
        reg.update_seq(141.into());

        reg.update_seq(20.into());
        assert!(reg.bad_seq.is_some());
        reg.update_seq(21.into());
        assert_eq!(reg.max_seq, 21.into());
    }

    #[test]
    fn jitter_converges() {
        let mut reg = ReceiverRegister::new(14.into());
        reg.update_seq(14.into());
        reg.update_seq(15.into());

        // 100 fps at 90kHz, alternating +/- 10 us around the frame time.
        let start = Instant::now();
        let frame = Duration::from_micros(10_000);
        let off = Duration::from_micros(10);

        for i in 4..1000u64 {
            let arrival = if i % 2 == 0 {
                start + frame * i as u32 - off
            } else {
                start + frame * i as u32 + off
            };
            reg.update_time(arrival, 1234 + (i as u32) * 900, 90_000);
        }

        // +/-10us at 90kHz is 1.8 units of jitter.
        assert!(
            (reg.jitter - 1.8).abs() < 0.01,
            "jitter was {}",
            reg.jitter
        );
    }

    #[test]
    fn no_nacks_when_contiguous() {
        let mut reg = ReceiverRegister::new(14.into());
        for i in [100u64, 101, 102, 103, 104, 105, 106] {
            reg.update_seq(i.into());
        }
        assert!(!reg.has_nack_report());
        assert!(reg.nack_reports().is_empty());
    }

    #[test]
    fn nack_single_missing() {
        let mut reg = ReceiverRegister::new(14.into());
        for i in [100u64, 101, 103, 104, 105, 106, 107] {
            reg.update_seq(i.into());
        }

        let nacks = reg.nack_reports();
        assert_eq!(nacks.len(), 1);
        let entry = nacks[0].reports.get(0).unwrap();
        assert_eq!(entry.pid, 102);
        assert_eq!(entry.blp, 0);
    }

    #[test]
    fn nack_with_bitmask() {
        let mut reg = ReceiverRegister::new(14.into());
        for i in [100u64, 101, 104, 105, 106, 107, 108] {
            reg.update_seq(i.into());
        }

        let nacks = reg.nack_reports();
        let entry = nacks[0].reports.get(0).unwrap();
        assert_eq!(entry.pid, 102);
        assert_eq!(entry.blp, 0b0000_0000_0000_0001);
    }

    #[test]
    fn nack_cleared_by_rtx() {
        let mut reg = ReceiverRegister::new(14.into());
        for i in 100u64..=106 {
            reg.update_seq(i.into());
        }
        for i in [108u64, 109, 110, 111, 112] {
            reg.update_seq(i.into());
        }
        assert!(!reg.nack_reports().is_empty());

        // 107 arrives via retransmission.
        reg.update_seq(107.into());

        let nacks = reg.nack_reports();
        assert!(nacks.is_empty(), "expected no NACKs, got {nacks:?}");
    }

    #[test]
    fn nack_pid_wraps_at_u16_boundary() {
        let range = 65530u64..65541 + MISORDER_DELAY;
        let missing = [65535u64, 65536, 65537];
        let expected_pid = [65535u16, 0, 1];

        for (missing, expected) in missing.iter().zip(expected_pid.iter()) {
            let mut seqs: Vec<u64> = range.clone().collect();
            let mut reg = ReceiverRegister::new(seqs[0].into());

            seqs.retain(|x| *x != *missing);
            for i in seqs {
                reg.update_seq(i.into());
            }

            let nacks = reg.nack_reports();
            let pid = nacks[0].reports.get(0).unwrap().pid;
            assert_eq!(pid, *expected);
        }
    }

    #[test]
    fn loss_accounting() {
        let mut reg = ReceiverRegister::new(14.into());
        reg.update_seq(14.into());
        reg.update_seq(15.into());
        reg.update_seq(17.into());

        // MIN_SEQUENTIAL resets base_seq at 15.
        assert_eq!(reg.base_seq, 15.into());
        assert_eq!(reg.expected(), 3);
        assert_eq!(reg.received, 2);
        assert_eq!(reg.packets_lost(), 1);

        // Fraction lost over the full interval: 1 of 3.
        let fraction = reg.fraction_lost();
        assert_eq!(fraction, (256 / 3) as u8);
    }

    #[test]
    fn no_panic_on_low_seq() {
        let mut reg = ReceiverRegister::new(1.into());
        reg.update_seq(2.into());
        reg.update_seq(3.into());
        let _ = reg.has_nack_report();
        let _ = reg.nack_reports();
    }
}
