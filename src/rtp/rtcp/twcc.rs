use std::collections::VecDeque;

use super::{FeedbackMessageType, RtcpHeader, RtcpPacket};
use super::{RtcpType, Ssrc, TransportType};

/// Most missing packets representable between two received ones. One
/// run-length chunk holds a 13 bit count.
pub const MAX_MISSING_PACKETS: u16 = (1 << 13) - 1;

/// Most packet statuses a single feedback packet can represent.
pub const MAX_PACKET_STATUS_COUNT: u16 = u16::MAX;

/// Largest receive delta in 250 µs units a feedback packet can carry.
pub const MAX_PACKET_DELTA: u64 = 0x7ffc;

/// Per-packet status in transport-wide feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Packet not received (or not yet).
    NotReceived = 0,
    /// Received, delta fits one byte.
    SmallDelta = 1,
    /// Received, delta needs two bytes.
    LargeDelta = 2,
}

impl PacketStatus {
    fn from_2bit(v: u8) -> PacketStatus {
        match v & 0b11 {
            1 => PacketStatus::SmallDelta,
            2 => PacketStatus::LargeDelta,
            // 3 is reserved, treat as missing.
            _ => PacketStatus::NotReceived,
        }
    }
}

/// A status chunk of the feedback packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketChunk {
    /// One status repeated count times. 13 bit count.
    RunLength(PacketStatus, u16),
    /// Seven two-bit statuses.
    TwoBitVector([PacketStatus; 7]),
    /// Fourteen one-bit statuses (received-small or missing). Parsed but
    /// never emitted.
    OneBitVector(u16),
}

impl PacketChunk {
    fn serialize(&self) -> u16 {
        match self {
            PacketChunk::RunLength(status, count) => {
                debug_assert!(*count <= MAX_MISSING_PACKETS);
                ((*status as u16) << 13) | (count & 0x1fff)
            }
            PacketChunk::TwoBitVector(statuses) => {
                let mut bits = 0xc000u16;
                for (i, s) in statuses.iter().enumerate() {
                    bits |= (*s as u16) << (12 - i * 2);
                }
                bits
            }
            PacketChunk::OneBitVector(bits) => 0x8000 | (bits & 0x3fff),
        }
    }

    fn parse(v: u16) -> PacketChunk {
        if v & 0x8000 == 0 {
            PacketChunk::RunLength(PacketStatus::from_2bit((v >> 13) as u8), v & 0x1fff)
        } else if v & 0x4000 == 0 {
            PacketChunk::OneBitVector(v & 0x3fff)
        } else {
            let mut statuses = [PacketStatus::NotReceived; 7];
            for (i, s) in statuses.iter_mut().enumerate() {
                *s = PacketStatus::from_2bit((v >> (12 - i * 2)) as u8);
            }
            PacketChunk::TwoBitVector(statuses)
        }
    }

    fn status_count(&self) -> u16 {
        match self {
            PacketChunk::RunLength(_, count) => *count,
            PacketChunk::TwoBitVector(_) => 7,
            PacketChunk::OneBitVector(_) => 14,
        }
    }
}

/// Transport-wide congestion control feedback
/// (draft-holmer-rmcat-transport-wide-cc-extensions-01).
///
/// The struct doubles as the receive-side *builder*: [`add_packet`] feeds
/// (wide seq, arrival time) pairs, maintaining a pre-base so a successor
/// packet can continue seamlessly from the previous one, and refusing
/// pairs that cannot be represented (too many missing, delta too large,
/// packet full). Arrival timestamps are 64-bit milliseconds throughout.
///
/// [`add_packet`]: TransportFeedback::add_packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFeedback {
    /// Sender of this feedback. Ignored by the estimator.
    pub sender_ssrc: Ssrc,
    /// Media source. Ignored by the estimator.
    pub ssrc: Ssrc,
    /// First sequence number represented.
    pub base_seq: u16,
    /// Number of statuses represented in chunks.
    pub status_count: u16,
    /// Absolute reference time in ms. On the wire in multiples of 64 ms.
    pub reference_time_ms: u64,
    /// Counter increasing for every feedback packet, for deduping.
    pub feedback_count: u8,
    /// Status chunks.
    pub chunks: VecDeque<PacketChunk>,
    /// Receive deltas in 250 µs units, one per received status.
    pub deltas: VecDeque<u16>,

    // Builder state below, not on the wire.
    pre_base: Option<(u16, u64)>,
    last_timestamp_ms: u64,
    received: Vec<(u16, u16)>,
    pending: Vec<PacketStatus>,
    pending_all_same: bool,
    pending_current: Option<PacketStatus>,
    size_bytes: usize,
}

impl TransportFeedback {
    /// A fresh feedback packet builder.
    pub fn new() -> TransportFeedback {
        TransportFeedback {
            sender_ssrc: 0.into(),
            ssrc: 0.into(),
            base_seq: 0,
            status_count: 0,
            reference_time_ms: 0,
            feedback_count: 0,
            chunks: VecDeque::new(),
            deltas: VecDeque::new(),
            pre_base: None,
            last_timestamp_ms: 0,
            received: Vec::new(),
            pending: Vec::new(),
            pending_all_same: false,
            pending_current: None,
            size_bytes: 4 + 8 + 8,
        }
    }

    /// Feed one (wide seq, arrival ms) pair.
    ///
    /// Returns false when the pair does not fit this packet: too many
    /// missing packets since the last accepted one, receive delta too
    /// large, or no space left under `max_rtcp_len`. The caller then
    /// emits this packet and starts a successor seeded with
    /// [`last_received`][TransportFeedback::last_received] as pre-base.
    ///
    /// A seq older than the last accepted one (wraparound aware) is
    /// accepted and ignored.
    pub fn add_packet(&mut self, wide_seq: u16, timestamp_ms: u64, max_rtcp_len: usize) -> bool {
        // First call establishes the pre-base.
        let Some((pre_seq, pre_ts)) = self.pre_base else {
            self.pre_base = Some((wide_seq, timestamp_ms));
            return true;
        };

        if self.received.is_empty() {
            // Not consecutive with the pre-base: it cannot anchor a base,
            // move the pre-base here instead.
            if wide_seq != pre_seq.wrapping_add(1) {
                debug!("Not valid as base, resetting pre base");
                self.pre_base = Some((wide_seq, timestamp_ms));
                return true;
            }

            // Too long since the pre-base, same deal.
            if !check_delta(pre_ts, timestamp_ms) {
                debug!(
                    "Delta from pre base exceeded: {} -> {}",
                    pre_ts, timestamp_ms
                );
                self.pre_base = Some((wide_seq, timestamp_ms));
                return true;
            }

            // This is the base. Its delta anchors to the reference time,
            // which the wire truncates to 64 ms steps.
            self.base_seq = wide_seq;
            self.reference_time_ms = timestamp_ms;

            let delta = ((timestamp_ms % 64) * 4) as u16;

            self.fill_chunk(pre_seq, wide_seq, delta);
            self.last_timestamp_ms = timestamp_ms;
            self.received.push((wide_seq, delta));

            return true;
        }

        let (last_seq, _) = *self.received.last().expect("at least the base");

        // Older than the newest accepted seq: ignore, like libwebrtc does.
        if is_seq_lower(wide_seq, last_seq) {
            return true;
        }

        let missing = wide_seq.wrapping_sub(last_seq.wrapping_add(1));
        if missing > MAX_MISSING_PACKETS {
            debug!("Missing packet count exceeded: {}", missing);
            return false;
        }

        if !check_delta(self.last_timestamp_ms, timestamp_ms) {
            debug!(
                "Receive delta exceeded: {} -> {}",
                self.last_timestamp_ms, timestamp_ms
            );
            return false;
        }

        if !self.check_size(max_rtcp_len) {
            debug!("Feedback packet size exceeded");
            return false;
        }

        let delta = (timestamp_ms.saturating_sub(self.last_timestamp_ms) * 4) as u16;

        self.fill_chunk(last_seq, wide_seq, delta);
        self.last_timestamp_ms = timestamp_ms;
        self.received.push((wide_seq, delta));

        true
    }

    /// Whether the packet cannot take any more statuses.
    pub fn is_full(&self) -> bool {
        self.represented_count() >= MAX_PACKET_STATUS_COUNT
    }

    /// Whether at least one pair has been accepted past the pre-base.
    pub fn is_serializable(&self) -> bool {
        !self.received.is_empty()
    }

    /// The newest accepted (seq, arrival ms). Seeds the successor packet.
    pub fn last_received(&self) -> Option<(u16, u64)> {
        self.received
            .last()
            .map(|(seq, _)| (*seq, self.last_timestamp_ms))
    }

    /// Flush pending statuses into chunks. Must be called before
    /// serialization; further `add_packet` calls are not allowed after.
    pub fn finalize(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        if self.pending_all_same {
            let status = self.pending_current.expect("pending has a status");
            let count = self.pending.len() as u16;
            self.push_run_chunk(status, count);
            self.pending.clear();
            return;
        }

        // Heterogeneous tail: one run-length chunk per status run.
        let pending = std::mem::take(&mut self.pending);
        let mut current = pending[0];
        let mut count = 0u16;

        for status in pending {
            if status == current {
                count += 1;
            } else {
                self.push_run_chunk(current, count);
                current = status;
                count = 1;
            }
        }

        self.push_run_chunk(current, count);
    }

    /// Iterate (seq, status, delta in 250 µs units) over all represented
    /// packets. Deltas accumulate from [`reference_time_units`].
    ///
    /// [`reference_time_units`]: TransportFeedback::reference_time_units
    pub fn iter(&self) -> impl Iterator<Item = (u16, PacketStatus, Option<u16>)> + '_ {
        let statuses = self.chunks.iter().flat_map(|c| {
            let mut v: Vec<PacketStatus> = Vec::with_capacity(14);
            match c {
                PacketChunk::RunLength(s, n) => v.extend(std::iter::repeat(*s).take(*n as usize)),
                PacketChunk::TwoBitVector(ss) => v.extend(ss.iter().copied()),
                PacketChunk::OneBitVector(bits) => {
                    for i in 0..14u16 {
                        let received = *bits & (1u16 << (13 - i)) > 0;
                        v.push(if received {
                            PacketStatus::SmallDelta
                        } else {
                            PacketStatus::NotReceived
                        });
                    }
                }
            }
            v
        });

        let mut deltas = self.deltas.iter();

        statuses
            .take(self.status_count as usize)
            .enumerate()
            .map(move |(i, status)| {
                let delta = match status {
                    PacketStatus::NotReceived => None,
                    _ => deltas.next().copied(),
                };
                (self.base_seq.wrapping_add(i as u16), status, delta)
            })
    }

    /// The wire reference time expressed in 250 µs units.
    pub fn reference_time_units(&self) -> u64 {
        // 64 ms steps, each 256 units of 250 µs.
        (self.reference_time_ms / 64) * 256
    }

    fn represented_count(&self) -> u16 {
        self.status_count.saturating_add(self.pending.len() as u16)
    }

    // Another chunk and its worst-case deltas must still fit.
    fn check_size(&self, max_rtcp_len: usize) -> bool {
        let mut size = self.size_bytes;
        size += 2; // one more chunk
        size += 2 * 7; // seven large deltas
        size += (4 - size % 4) % 4;
        size <= max_rtcp_len
    }

    fn push_run_chunk(&mut self, status: PacketStatus, count: u16) {
        self.chunks.push_back(PacketChunk::RunLength(status, count));
        self.status_count = self.status_count.saturating_add(count);
        self.size_bytes += 2;
    }

    fn push_vector_chunk(&mut self) {
        debug_assert_eq!(self.pending.len(), 7);
        let mut statuses = [PacketStatus::NotReceived; 7];
        statuses.copy_from_slice(&self.pending);
        self.chunks.push_back(PacketChunk::TwoBitVector(statuses));
        self.status_count = self.status_count.saturating_add(7);
        self.size_bytes += 2;
        self.pending.clear();
        self.pending_current = None;
    }

    fn fill_chunk(&mut self, prev_seq: u16, seq: u16, delta: u16) {
        let mut missing = seq.wrapping_sub(prev_seq.wrapping_add(1));

        if missing > 0 {
            // A same-status run of 7+ must become a run chunk before the
            // gap statuses get interleaved.
            if self.pending.len() >= 7 && self.pending_all_same {
                let status = self.pending_current.expect("pending has a status");
                let count = self.pending.len() as u16;
                self.push_run_chunk(status, count);
                self.pending.clear();
                self.pending_current = None;
            }

            while missing > 0 && self.pending.len() < 7 {
                self.push_pending(PacketStatus::NotReceived);
                missing -= 1;
            }

            if self.pending.len() == 7 {
                self.push_vector_chunk();
            }

            if missing > 0 {
                // The rest of the gap as one run chunk.
                self.push_run_chunk(PacketStatus::NotReceived, missing);
                self.pending.clear();
                self.pending_current = None;
            }
        }

        let status = if delta <= 255 {
            PacketStatus::SmallDelta
        } else {
            PacketStatus::LargeDelta
        };

        if self.pending.len() >= 7
            && self.pending_all_same
            && self.pending_current != Some(status)
        {
            let current = self.pending_current.expect("pending has a status");
            let count = self.pending.len() as u16;
            self.push_run_chunk(current, count);
            self.pending.clear();
            self.pending_current = None;
        }

        self.push_pending(status);
        self.deltas.push_back(delta);
        self.size_bytes += if status == PacketStatus::SmallDelta { 1 } else { 2 };

        if self.pending.len() == 7 && !self.pending_all_same {
            self.push_vector_chunk();
        }
    }

    fn push_pending(&mut self, status: PacketStatus) {
        self.pending_all_same = self.pending_current.is_none()
            || (self.pending_all_same && self.pending_current == Some(status));
        self.pending_current = Some(status);
        self.pending.push(status);
    }

    fn delta_byte_len(&self) -> usize {
        self.deltas
            .iter()
            .map(|d| if *d <= 255 { 1 } else { 2 })
            .sum()
    }
}

impl Default for TransportFeedback {
    fn default() -> Self {
        TransportFeedback::new()
    }
}

// Delta between two arrival timestamps representable in a feedback packet.
fn check_delta(prev_ms: u64, next_ms: u64) -> bool {
    let delta_units = next_ms.saturating_sub(prev_ms) * 4;
    delta_units <= MAX_PACKET_DELTA
}

// Wraparound aware "lhs strictly older than rhs".
fn is_seq_lower(lhs: u16, rhs: u16) -> bool {
    lhs != rhs && rhs.wrapping_sub(lhs) < 0x8000
}

impl RtcpPacket for TransportFeedback {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            feedback_message_type: FeedbackMessageType::TransportFeedback(
                TransportType::TransportWide,
            ),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        debug_assert!(self.pending.is_empty(), "serializing unfinalized feedback");

        let mut total = self.chunks.len() * 2 + self.delta_byte_len();

        let pad = 4 - total % 4;
        if pad < 4 {
            total += pad;
        }

        // header, sender ssrc, media ssrc, base+count, ref time+fb count
        5 + total / 4
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[12..14].copy_from_slice(&self.base_seq.to_be_bytes());
        buf[14..16].copy_from_slice(&self.status_count.to_be_bytes());

        let ref_time = ((self.reference_time_ms / 64) & 0xff_ffff) as u32;
        buf[16..19].copy_from_slice(&ref_time.to_be_bytes()[1..]);
        buf[19] = self.feedback_count;

        let mut offset = 20;
        for chunk in &self.chunks {
            buf[offset..offset + 2].copy_from_slice(&chunk.serialize().to_be_bytes());
            offset += 2;
        }

        for delta in &self.deltas {
            if *delta <= 255 {
                buf[offset] = *delta as u8;
                offset += 1;
            } else {
                buf[offset..offset + 2].copy_from_slice(&delta.to_be_bytes());
                offset += 2;
            }
        }

        // Pad to word boundary, flagged in the header padding bit.
        let pad = 4 - offset % 4;
        if pad < 4 {
            for i in 0..pad {
                buf[offset + i] = 0;
            }
            buf[offset + pad - 1] = pad as u8;
            buf[0] |= 0b00_1_00000;
            offset += pad;
        }

        offset
    }
}

impl<'a> TryFrom<&'a [u8]> for TransportFeedback {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 16 {
            return Err("TransportFeedback less than 16 bytes");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into();
        let base_seq = u16::from_be_bytes([buf[8], buf[9]]);
        let status_count = u16::from_be_bytes([buf[10], buf[11]]);
        let ref_time_raw = u32::from_be_bytes([0, buf[12], buf[13], buf[14]]);
        let feedback_count = buf[15];

        let mut chunks = VecDeque::new();
        let mut represented = 0u32;
        let mut buf = &buf[16..];

        while represented < status_count as u32 {
            if buf.len() < 2 {
                return Err("TransportFeedback too short for chunks");
            }
            let chunk = PacketChunk::parse(u16::from_be_bytes([buf[0], buf[1]]));
            represented += chunk.status_count() as u32;
            chunks.push_back(chunk);
            buf = &buf[2..];
        }

        // Count received statuses to know how many deltas follow.
        let mut feedback = TransportFeedback {
            sender_ssrc,
            ssrc,
            base_seq,
            status_count,
            reference_time_ms: ref_time_raw as u64 * 64,
            feedback_count,
            chunks,
            deltas: VecDeque::new(),
            ..TransportFeedback::new()
        };

        let statuses: Vec<PacketStatus> = feedback.iter().map(|(_, s, _)| s).collect();

        let mut deltas = VecDeque::new();
        for status in statuses {
            match status {
                PacketStatus::NotReceived => {}
                PacketStatus::SmallDelta => {
                    if buf.is_empty() {
                        return Err("TransportFeedback too short for small delta");
                    }
                    deltas.push_back(buf[0] as u16);
                    buf = &buf[1..];
                }
                PacketStatus::LargeDelta => {
                    if buf.len() < 2 {
                        return Err("TransportFeedback too short for large delta");
                    }
                    deltas.push_back(u16::from_be_bytes([buf[0], buf[1]]));
                    buf = &buf[2..];
                }
            }
        }

        feedback.deltas = deltas;

        Ok(feedback)
    }
}
