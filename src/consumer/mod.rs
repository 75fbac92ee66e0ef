//! Per-subscriber forwarding state.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::producer::{MediaKind, Producer};
use crate::rtp::{
    ExtensionMap, Mid, Nack, Pt, ReceptionReport, RtpPacket, SenderReport, SeqNo, Ssrc,
};
use crate::streams::{RtpStreamSend, SeqManager};

mod simple;
pub use simple::SimpleConsumer;

mod simulcast;
pub use simulcast::SimulcastConsumer;

/// Which forwarding strategy a consumer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
}

/// Construction parameters for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub kind: MediaKind,
    pub consumer_type: ConsumerType,
    /// The producer this consumer subscribes to.
    pub producer_id: String,
    /// The producer's mapped SSRCs, ordered low to high layer.
    pub producer_ssrcs: Vec<Ssrc>,
    /// The SSRC this consumer sends with.
    pub ssrc: Ssrc,
    /// The payload type this consumer sends with.
    pub payload_type: Pt,
    pub mid: Option<Mid>,
    /// The consumer-side header extension ids.
    pub ext_map: ExtensionMap,
    pub clock_rate: u32,
    pub paused: bool,
    /// Preferred spatial layer for simulcast.
    pub preferred_layer: Option<u8>,
}

/// Events surfacing from a consumer to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// The forwarded spatial layer changed.
    LayersChanged(u8),
}

/// A subscriber to one producer.
#[derive(Debug)]
pub enum Consumer {
    Simple(SimpleConsumer),
    Simulcast(SimulcastConsumer),
}

impl Consumer {
    pub fn new(id: &str, options: ConsumerOptions) -> Consumer {
        match options.consumer_type {
            ConsumerType::Simple => Consumer::Simple(SimpleConsumer::new(id, options)),
            ConsumerType::Simulcast => Consumer::Simulcast(SimulcastConsumer::new(id, options)),
        }
    }

    fn shared(&self) -> &ConsumerShared {
        match self {
            Consumer::Simple(c) => &c.shared,
            Consumer::Simulcast(c) => &c.shared,
        }
    }

    fn shared_mut(&mut self) -> &mut ConsumerShared {
        match self {
            Consumer::Simple(c) => &mut c.shared,
            Consumer::Simulcast(c) => &mut c.shared,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared().id
    }

    pub fn producer_id(&self) -> &str {
        &self.shared().producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.shared().kind
    }

    pub fn consumer_type(&self) -> ConsumerType {
        match self {
            Consumer::Simple(_) => ConsumerType::Simple,
            Consumer::Simulcast(_) => ConsumerType::Simulcast,
        }
    }

    /// The SSRCs this consumer occupies on the egress side.
    pub fn media_ssrcs(&self) -> Vec<Ssrc> {
        vec![self.shared().ssrc]
    }

    pub fn is_paused(&self) -> bool {
        self.shared().paused
    }

    pub fn is_producer_paused(&self) -> bool {
        self.shared().producer_paused
    }

    /// Pause egress. Returns whether the state changed.
    pub fn pause(&mut self) -> bool {
        let shared = self.shared_mut();
        let changed = !shared.paused;
        shared.paused = true;
        changed
    }

    /// Resume egress. Returns whether the state changed.
    pub fn resume(&mut self) -> bool {
        let shared = self.shared_mut();
        let changed = shared.paused;
        shared.paused = false;
        changed
    }

    /// Track the bound producer's paused state.
    pub fn set_producer_paused(&mut self, paused: bool) {
        self.shared_mut().producer_paused = paused;
    }

    /// Forward one packet from the bound producer.
    ///
    /// `encoding_idx` and `is_keyframe` come from the producer's receive
    /// path. Returns the rewritten egress packet, or `None` when the
    /// packet is not forwarded (paused, non-selected layer).
    pub fn send_rtp(
        &mut self,
        now: Instant,
        packet: &RtpPacket,
        encoding_idx: usize,
        is_keyframe: bool,
    ) -> Option<RtpPacket> {
        match self {
            Consumer::Simple(c) => c.send_rtp(now, packet),
            Consumer::Simulcast(c) => c.send_rtp(now, packet, encoding_idx, is_keyframe),
        }
    }

    /// The producer-mapped SSRC to address upstream keyframe requests to.
    pub fn keyframe_request_target(&self) -> Option<Ssrc> {
        match self {
            Consumer::Simple(c) => c.shared.producer_ssrcs.first().copied(),
            Consumer::Simulcast(c) => c.keyframe_request_target(),
        }
    }

    /// Write the transport-wide sequence number into an egress packet
    /// using this consumer's extension ids.
    pub fn apply_wide_seq(&mut self, packet: &mut RtpPacket, seq: u16) {
        let shared = self.shared_mut();
        packet.set_transport_wide_seq(seq, &shared.ext_map);
    }

    /// Whether this consumer's extension mapping carries the
    /// transport-wide sequence number at all.
    pub fn supports_wide_seq(&self) -> bool {
        self.shared()
            .ext_map
            .id_of(crate::rtp::Extension::TransportSequenceNumber)
            .is_some()
    }

    /// Digest an incoming reception report addressed to this consumer.
    pub fn receive_reception_report(&mut self, now: Instant, report: &ReceptionReport) {
        self.shared_mut().stream.receive_reception_report(now, report);
    }

    /// Resolve an incoming NACK into packets to retransmit.
    pub fn receive_nack(&mut self, nack: &Nack) -> Vec<RtpPacket> {
        self.shared_mut().stream.receive_nack(nack)
    }

    /// Produce a sender report when due.
    pub fn get_rtcp(&mut self, now: Instant) -> Option<SenderReport> {
        let shared = self.shared_mut();
        if !shared.stream.needs_sender_report(now) {
            return None;
        }
        shared.stream.sender_report(now)
    }

    /// Current egress bitrate.
    pub fn transmission_rate(&mut self, now: Instant) -> u32 {
        self.shared_mut().stream.bitrate(now)
    }

    /// Health score, derived from the selected producer encoding.
    pub fn score(&self, producer: &Producer) -> u8 {
        match self {
            Consumer::Simple(_) => producer.encoding_score(0),
            Consumer::Simulcast(c) => c.score(producer),
        }
    }

    /// Set preferred simulcast layers. No-op for simple consumers.
    pub fn set_preferred_layers(&mut self, spatial: u8) {
        if let Consumer::Simulcast(c) = self {
            c.set_preferred_layer(spatial);
        }
    }

    /// React to an available-bitrate change.
    ///
    /// `layer_bitrates` is the producer's observed bitrate per encoding.
    /// Returns the mapped SSRC a keyframe must be requested for when the
    /// selection wants to move up.
    pub fn need_bitrate_change(&mut self, available_bps: u32, layer_bitrates: &[u32]) -> Option<Ssrc> {
        match self {
            Consumer::Simple(_) => None,
            Consumer::Simulcast(c) => c.need_bitrate_change(available_bps, layer_bitrates),
        }
    }

    /// Drain one pending consumer event, oldest first.
    pub fn poll_event(&mut self) -> Option<ConsumerEvent> {
        let events = &mut self.shared_mut().events;
        if events.is_empty() {
            None
        } else {
            Some(events.remove(0))
        }
    }

    /// Snapshot for `consumer.dump`.
    pub fn dump(&self) -> ConsumerDump {
        let shared = self.shared();
        ConsumerDump {
            id: shared.id.clone(),
            producer_id: shared.producer_id.clone(),
            kind: shared.kind,
            consumer_type: self.consumer_type(),
            paused: shared.paused,
            producer_paused: shared.producer_paused,
            ssrc: *shared.ssrc,
            current_layer: match self {
                Consumer::Simple(_) => None,
                Consumer::Simulcast(c) => c.current_layer(),
            },
        }
    }

    /// Snapshot for `consumer.getStats`.
    pub fn stats(&mut self, now: Instant) -> ConsumerStat {
        let shared = self.shared_mut();
        ConsumerStat {
            ssrc: *shared.ssrc,
            packets: shared.stream.packets(),
            bytes: shared.stream.bytes(),
            bitrate: shared.stream.bitrate(now),
            fraction_lost: shared.stream.fraction_lost(),
            rtt_ms: shared.stream.rtt_ms(),
        }
    }
}

/// Serialized consumer state.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerDump {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub paused: bool,
    pub producer_paused: bool,
    pub ssrc: u32,
    pub current_layer: Option<u8>,
}

/// Serialized consumer statistics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerStat {
    pub ssrc: u32,
    pub packets: u64,
    pub bytes: u64,
    pub bitrate: u32,
    pub fraction_lost: u8,
    pub rtt_ms: Option<f32>,
}

/// State common to all consumer variants: identity, pause bits, and the
/// egress rewrite pipeline (SSRC, PT, sequence, timestamp, extensions).
#[derive(Debug)]
pub(crate) struct ConsumerShared {
    id: String,
    producer_id: String,
    kind: MediaKind,
    producer_ssrcs: Vec<Ssrc>,
    ssrc: Ssrc,
    payload_type: Pt,
    mid: Option<Mid>,
    ext_map: ExtensionMap,
    clock_rate: u32,
    paused: bool,
    producer_paused: bool,
    seq: SeqManager,
    ts_offset: u32,
    ts_anchored: bool,
    last_out: Option<LastOut>,
    stream: RtpStreamSend,
    events: Vec<ConsumerEvent>,
}

#[derive(Debug, Clone, Copy)]
struct LastOut {
    rtp_time: u32,
    at: Instant,
}

impl ConsumerShared {
    fn new(id: &str, options: &ConsumerOptions) -> ConsumerShared {
        ConsumerShared {
            id: id.to_string(),
            producer_id: options.producer_id.clone(),
            kind: options.kind,
            producer_ssrcs: options.producer_ssrcs.clone(),
            ssrc: options.ssrc,
            payload_type: options.payload_type,
            mid: options.mid,
            ext_map: options.ext_map.clone(),
            clock_rate: options.clock_rate,
            paused: options.paused,
            producer_paused: false,
            seq: SeqManager::new(),
            ts_offset: 0,
            ts_anchored: false,
            last_out: None,
            stream: RtpStreamSend::new(options.ssrc, options.clock_rate),
            events: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        !self.paused && !self.producer_paused
    }

    /// Rewrite a producer packet into this consumer's spaces.
    ///
    /// When inactive, the input sequence is consumed without output so
    /// the egress stream is contiguous on resume.
    fn rewrite(&mut self, now: Instant, packet: &RtpPacket) -> Option<RtpPacket> {
        let in_seq = packet.sequence_number();

        if !self.is_active() {
            self.seq.drop(in_seq);
            return None;
        }

        if !self.ts_anchored {
            // First forwarded packet defines the timestamp mapping.
            self.ts_offset = 0;
            self.ts_anchored = true;
        }

        let out_ext = self.seq.input(in_seq);
        let out_ts = packet.timestamp().wrapping_sub(self.ts_offset);

        let mut out = packet.clone();
        out.set_ssrc(self.ssrc);
        out.set_payload_type(self.payload_type);
        out.set_sequence_number(out_ext as u16);
        out.set_timestamp(out_ts);

        // Consumer-side extension ids (and MID when declared).
        let mut values = out.header().ext_vals;
        values.mid = self.mid;
        values.rid = None;
        values.rid_repair = None;
        out.rewrite_extensions(values, &self.ext_map);

        let seq_no: SeqNo = out_ext.into();
        self.stream.record_sent(now, seq_no, &out);

        self.last_out = Some(LastOut {
            rtp_time: out_ts,
            at: now,
        });

        Some(out)
    }

    /// Re-anchor sequence and timestamp at a layer switch so egress
    /// stays continuous.
    fn resync(&mut self, now: Instant, next_in_seq: u16, next_in_ts: u32) {
        self.seq.sync(next_in_seq);

        // Project the output timestamp forward by the wall-clock gap.
        let expected_out = match self.last_out {
            Some(last) => {
                let elapsed = now.duration_since(last.at);
                last.rtp_time
                    .wrapping_add((elapsed.as_secs_f64() * self.clock_rate as f64) as u32)
            }
            None => next_in_ts,
        };

        self.ts_offset = next_in_ts.wrapping_sub(expected_out);
        self.ts_anchored = true;
    }

    fn push_event(&mut self, event: ConsumerEvent) {
        self.events.push(event);
    }
}
